use crate::collect::job::JobStatus;
use crate::config::CollectionConfig;
use crate::dom::ExpirationRef;
use crate::error::Result;
use crate::model::{ExpirationChain, FullChainSnapshot};
use crate::scrape::ParsedPage;
use crate::store::durable::DurableStore;
use crate::store::market::{save_full_chain, set_underlying};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A tab showing an option chain, able to switch between expirations
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Parse the chain as currently rendered
    async fn parse_current(&self) -> Result<ParsedPage>;

    /// Expirations offered by the page's selector
    async fn expirations(&self) -> Result<Vec<ExpirationRef>>;

    /// Load another expiration and wait until its table has rendered
    async fn open_expiration(&self, expiration: &ExpirationRef, timeout: Duration) -> Result<()>;

    /// Wait until the current page's table has rendered
    async fn wait_until_ready(&self, timeout: Duration) -> Result<()>;

    /// Whether the tab still exists
    fn is_connected(&self) -> bool {
        true
    }
}

/// Observer of a running collection
#[async_trait]
pub trait CollectionProgress: Send + Sync {
    /// Called after the current page and after each expiration
    async fn progress(&self, _percent: u8, _collected: usize, _text: &str) {}

    /// Called once at the end, successful or not
    async fn complete(&self, _outcome: &CollectionOutcome) {}
}

/// A no-op progress sink
pub struct NullProgress;

impl CollectionProgress for NullProgress {}

/// How a collection run ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOutcome {
    /// `Done` or `Error`
    pub status: JobStatus,
    /// Options collected from the expirations that succeeded
    pub collected_count: usize,
    pub expirations_collected: usize,
    /// Failure note (for `Done`) or failure reason (for `Error`)
    pub error: Option<String>,
    #[serde(skip)]
    pub snapshot: Option<FullChainSnapshot>,
}

impl CollectionOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            collected_count: 0,
            expirations_collected: 0,
            error: Some(message.into()),
            snapshot: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Done
    }
}

/// Runs one bulk collection over a chain tab.
///
/// The current page is parsed first; if that fails the run ends in `Error`.
/// Other expirations are then visited with randomized pauses. A failing
/// expiration is noted and skipped; too many consecutive load failures, or a
/// cancellation, end the run in `Error` without saving anything.
pub struct Collector {
    source: Arc<dyn ChainSource>,
    durable: Arc<dyn DurableStore>,
    config: CollectionConfig,
    cancel: Arc<AtomicBool>,
}

impl Collector {
    pub fn new(source: Arc<dyn ChainSource>, durable: Arc<dyn DurableStore>, config: CollectionConfig) -> Self {
        Self {
            source,
            durable,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag with the caller
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub async fn run(&self, progress: &dyn CollectionProgress) -> CollectionOutcome {
        let outcome = self.collect(progress).await;
        match &outcome.error {
            Some(error) if !outcome.is_success() => log::warn!("Collection failed: {}", error),
            Some(note) => log::info!(
                "Collected {} options from {} expirations ({})",
                outcome.collected_count,
                outcome.expirations_collected,
                note
            ),
            None => log::info!(
                "Collected {} options from {} expirations",
                outcome.collected_count,
                outcome.expirations_collected
            ),
        }
        progress.complete(&outcome).await;
        outcome
    }

    async fn collect(&self, progress: &dyn CollectionProgress) -> CollectionOutcome {
        let current = match self.source.parse_current().await {
            Ok(page) => page,
            Err(e) => return CollectionOutcome::failed(format!("cannot start: {}", e)),
        };
        self.record_underlying(&current).await;

        let mut failures: Vec<String> = Vec::new();
        let targets = match self.source.expirations().await {
            Ok(all) => self.select_targets(all, &current),
            Err(e) => {
                failures.push(format!("expiration list: {}", e));
                Vec::new()
            }
        };

        let total = targets.len() + 1;
        let mut collected = current.options.len();
        let mut chains = vec![ExpirationChain {
            date: current.expiration.clone(),
            date_code: current.date_code.clone(),
            options: current.options.clone(),
        }];
        progress
            .progress(percent(1, total), collected, &format!("1/{} {}", total, current.expiration))
            .await;

        let mut consecutive_errors = 0u32;
        for (i, target) in targets.iter().enumerate() {
            if self.cancelled() || !self.source.is_connected() {
                return CollectionOutcome::failed("cancelled");
            }

            tokio::time::sleep(self.next_delay()).await;
            if self.cancelled() {
                return CollectionOutcome::failed("cancelled");
            }

            let step = i + 2;
            let label = target.display_date.as_str();
            if let Err(e) = self
                .source
                .open_expiration(target, self.config.page_timeout_duration())
                .await
            {
                if e.is_channel_closed() {
                    return CollectionOutcome::failed("cancelled: tab closed");
                }
                consecutive_errors += 1;
                log::warn!("Failed to load {} ({}/{}): {}", label, consecutive_errors, self.config.max_consecutive_errors, e);
                failures.push(format!("{}: {}", label, e));
                if consecutive_errors >= self.config.max_consecutive_errors {
                    return CollectionOutcome::failed(format!(
                        "aborted after {} consecutive page-load failures",
                        consecutive_errors
                    ));
                }
                progress
                    .progress(percent(step, total), collected, &format!("{}/{} {} failed", step, total, label))
                    .await;
                continue;
            }
            consecutive_errors = 0;

            match self.source.parse_current().await {
                Ok(page) => {
                    log::debug!("{}: {} options", label, page.options.len());
                    collected += page.options.len();
                    chains.push(ExpirationChain {
                        date: label.to_string(),
                        date_code: Some(target.date_code.clone()),
                        options: page.options,
                    });
                    progress
                        .progress(percent(step, total), collected, &format!("{}/{} {}", step, total, label))
                        .await;
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", label, e);
                    failures.push(format!("{}: {}", label, e));
                    progress
                        .progress(percent(step, total), collected, &format!("{}/{} {} failed", step, total, label))
                        .await;
                }
            }
        }

        let snapshot = FullChainSnapshot {
            ticker: current.ticker.clone(),
            collected_at: Some(Utc::now()),
            underlying_price: current.underlying_price.unwrap_or_default(),
            expirations: chains,
        };
        if let Err(e) = save_full_chain(self.durable.as_ref(), &snapshot).await {
            log::warn!("Failed to save full chain: {}", e);
            failures.push(format!("save: {}", e));
        }

        CollectionOutcome {
            status: JobStatus::Done,
            collected_count: collected,
            expirations_collected: snapshot.expirations.len(),
            error: (!failures.is_empty()).then(|| failures.join("; ")),
            snapshot: Some(snapshot),
        }
    }

    /// Publish the page's underlying price for calculators showing this ticker
    async fn record_underlying(&self, page: &ParsedPage) {
        let (Some(ticker), Some(price)) = (page.ticker.as_deref(), page.underlying_price) else {
            return;
        };
        if price <= 0.0 {
            return;
        }
        if let Err(e) = set_underlying(self.durable.as_ref(), ticker, price).await {
            log::warn!("Failed to record underlying for {}: {}", ticker, e);
        }
    }

    fn select_targets(&self, all: Vec<ExpirationRef>, current: &ParsedPage) -> Vec<ExpirationRef> {
        let mut targets: Vec<ExpirationRef> = all
            .into_iter()
            .filter(|e| current.date_code.as_deref() != Some(e.date_code.as_str()))
            .filter(|e| e.display_date != current.expiration && e.date_code != current.expiration)
            .collect();
        if self.config.shuffle {
            targets.shuffle(&mut rand::thread_rng());
        }
        targets.truncate(self.config.max_expirations);
        targets
    }

    fn next_delay(&self) -> Duration {
        let (min, max) = (self.config.min_delay_ms, self.config.max_delay_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}
