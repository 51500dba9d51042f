//! The long-lived background coordinator.
//!
//! Owns the collection job, opens destination tabs, and relays messages to
//! tabs. Every handler answers with a [`Response`]; failures talking to
//! other contexts are reported in it and never propagated to the caller.

use crate::collect::{ChainSource, CollectionJob, CollectionOutcome, CollectionProgress, Collector};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::model::{InstrumentPositionSet, POSITIONS_KEY, store_ticker};
use crate::router::host::{TabHost, TabId};
use crate::router::message::{
    CollectFullChainPayload, CollectionEvent, Command, DestinationPayload, GetPositionsPayload, Message,
    PinnedTabPayload, RelayPayload, Response, StrikeQuotes,
};
use crate::store::durable::{DurableStore, get_json};
use crate::store::positions::PositionStore;
use crate::sync::bridge::CommandSink;
use crate::sync::page::{CALCULATOR_STATE_KEY, CalculatorState, read_page_json, write_page_json};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

/// A pinned tab waiting to report quotes for a position
#[derive(Debug, Clone)]
struct PinnedRequest {
    source: Option<TabId>,
    request: PinnedTabPayload,
}

pub struct Background {
    config: BridgeConfig,
    host: Arc<dyn TabHost>,
    durable: Arc<dyn DurableStore>,
    job: Arc<Mutex<CollectionJob>>,
    cancel: Arc<AtomicBool>,
    events: broadcast::Sender<CollectionEvent>,
    worker: Mutex<Option<JoinHandle<CollectionOutcome>>>,
    pinned: Mutex<HashMap<TabId, PinnedRequest>>,
    pinned_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Background {
    pub fn new(config: BridgeConfig, host: Arc<dyn TabHost>, durable: Arc<dyn DurableStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            host,
            durable,
            job: Arc::new(Mutex::new(CollectionJob::new())),
            cancel: Arc::new(AtomicBool::new(false)),
            events,
            worker: Mutex::new(None),
            pinned: Mutex::new(HashMap::new()),
            pinned_workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Receive progress and completion events
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }

    /// Current job state without acknowledging it
    pub fn job(&self) -> CollectionJob {
        lock(&self.job).map(|job| job.clone()).unwrap_or_default()
    }

    /// Wait for the running collection, if any, to finish
    pub async fn wait_for_collection(&self) -> Option<CollectionOutcome> {
        let handle = lock(&self.worker).ok()?.take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("Collection task panicked: {}", e);
                None
            }
        }
    }

    /// Wait for every pinned-tab scrape started so far
    pub async fn wait_for_pinned_tabs(&self) {
        let handles = match lock(&self.pinned_workers) {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Pinned tab task panicked: {}", e);
            }
        }
    }

    /// Handle a raw message from `sender` (if it came from a tab)
    pub async fn handle(self: &Arc<Self>, raw: Value, sender: Option<TabId>) -> Response {
        let message = match Message::from_value(raw) {
            Ok(message) => message,
            Err(e) => return Response::failure(e.to_string()),
        };
        self.handle_message(&message, sender).await
    }

    pub async fn handle_message(self: &Arc<Self>, message: &Message, sender: Option<TabId>) -> Response {
        let command = match Command::parse(message) {
            Ok(command) => command,
            Err(BridgeError::UnknownAction(action)) => {
                log::debug!("Ignoring unknown action {}", action);
                return Response::failure("unknown action");
            }
            Err(e) => return Response::failure(e.to_string()),
        };

        log::debug!("Handling {}", command.name());
        match self.dispatch(command, sender).await {
            Ok(data) => Response::success(data),
            Err(e) => {
                log::warn!("{} failed: {}", message.action, e);
                Response::failure(e.to_string())
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, command: Command, sender: Option<TabId>) -> Result<Option<Value>> {
        match command {
            Command::OpenDestinationTab(payload) => self.open_destination_tab(payload).await.map(Some),
            Command::StartCollection(payload) => {
                self.start_collection(payload.tab_id, sender, None).await.map(Some)
            }
            Command::StopCollection => Ok(Some(json!({ "stopping": self.stop_collection() }))),
            Command::CollectionStatus => Ok(Some(serde_json::to_value(self.collection_status()?)?)),
            Command::Relay(payload) => self.relay(payload).await.map(Some),
            Command::GetPositions(payload) => self.get_positions(payload).await.map(Some),
            Command::CollectFullChain(payload) => self.collect_full_chain(payload, sender).await.map(Some),
            Command::OpenPinnedTab(payload) => self.open_pinned_tab(payload, sender).await.map(Some),
            Command::PinnedTabData(payload) => {
                let tab = sender.ok_or_else(|| BridgeError::InvalidPayload {
                    action: "pinnedTabData".to_string(),
                    reason: "sender tab unknown".to_string(),
                })?;
                self.deliver_pinned(&tab, payload.data).await.map(Some)
            }
        }
    }

    /// Open (or, when configured, reuse) a calculator tab and hand it the payload
    pub async fn open_destination_tab(&self, payload: DestinationPayload) -> Result<Value> {
        let url = self.config.destination.url_for(&payload.ticker);

        let existing = if self.config.destination.reuse_existing_tab {
            self.host
                .list_tabs()
                .await?
                .into_iter()
                .find(|tab| self.config.destination.matches(&tab.url))
                .map(|tab| tab.id)
        } else {
            None
        };

        let reused = existing.is_some();
        let tab = match existing {
            Some(tab) => {
                self.host.navigate(&tab, &url).await?;
                self.host.focus_tab(&tab).await?;
                log::info!("Reusing calculator tab {} for {}", tab, payload.ticker);
                tab
            }
            None => {
                let tab = self.host.open_tab(&url, true).await?;
                log::info!("Opened calculator tab {} for {}", tab, payload.ticker);
                tab
            }
        };

        let page = self.host.page_storage(&tab).await?;
        let mut state = read_page_json::<CalculatorState>(page.as_ref(), CALCULATOR_STATE_KEY)
            .await?
            .unwrap_or_else(|| CalculatorState::for_ticker(&self.config.source.exchange, &payload.ticker));
        payload.apply(&mut state, &self.config.source.exchange);
        write_page_json(page.as_ref(), CALCULATOR_STATE_KEY, &state).await?;
        self.host.reload(&tab).await?;

        Ok(json!({
            "tabId": tab,
            "url": url,
            "positions": payload.positions.len(),
            "reused": reused,
        }))
    }

    /// Start a bulk collection on a chain tab. Returns once the job is running.
    pub async fn start_collection(
        self: &Arc<Self>,
        tab: TabId,
        status_tab: Option<TabId>,
        max_expirations: Option<usize>,
    ) -> Result<Value> {
        self.claim_job(Some(tab.clone()))?;

        let source = match self.host.chain_source(&tab).await {
            Ok(source) => source,
            Err(e) => {
                self.report_outcome(&CollectionOutcome::failed(format!("cannot start: {}", e)), status_tab.as_ref())
                    .await;
                return Err(e);
            }
        };

        self.spawn_collection(source, tab.clone(), status_tab, max_expirations);
        Ok(json!({ "started": true, "tabId": tab }))
    }

    /// Move the job to `running` unless another run or the cooldown is in the way
    fn claim_job(&self, tab: Option<TabId>) -> Result<()> {
        let mut job = lock(&self.job)?;
        if job.is_running() {
            return Err(BridgeError::CollectionBusy);
        }
        if let Some(left) = job.cooldown_remaining(self.config.collection.cooldown_duration()) {
            return Err(BridgeError::Cooldown(left.as_secs().max(1)));
        }
        match tab {
            Some(tab) => job.start(tab)?,
            None => job.reserve()?,
        }
        self.cancel.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_collection(
        self: &Arc<Self>,
        source: Arc<dyn ChainSource>,
        tab: TabId,
        status_tab: Option<TabId>,
        max_expirations: Option<usize>,
    ) {
        let mut config = self.config.collection.clone();
        if let Some(max) = max_expirations {
            config.max_expirations = max;
        }
        let collector = Collector::new(source, self.durable.clone(), config).with_cancel(self.cancel.clone());
        let reporter = JobReporter {
            background: Arc::clone(self),
            status_tab,
        };

        log::info!("Starting collection on tab {}", tab);
        let handle = tokio::spawn(async move { collector.run(&reporter).await });
        if let Ok(mut worker) = lock(&self.worker) {
            *worker = Some(handle);
        }
    }

    /// Request cancellation; returns whether a job was running
    pub fn stop_collection(&self) -> bool {
        let running = self.job().is_running();
        if running {
            log::info!("Stopping collection");
            self.cancel.store(true, Ordering::SeqCst);
        }
        running
    }

    /// Current job; a finished job is reset to idle once reported here
    pub fn collection_status(&self) -> Result<CollectionJob> {
        Ok(lock(&self.job)?.acknowledge())
    }

    /// Forward a message to a tab
    pub async fn relay(&self, payload: RelayPayload) -> Result<Value> {
        let mut message = json!({ "action": payload.action });
        if let Some(inner) = payload.payload {
            message["payload"] = inner;
        }
        self.host.send(&payload.tab_id, message).await.map_err(|e| {
            log::debug!("Relay to {} failed: {}", payload.tab_id, e);
            BridgeError::TabOperationFailed(format!("tab {} unreachable: {}", payload.tab_id, e))
        })
    }

    pub async fn get_positions(&self, payload: GetPositionsPayload) -> Result<Value> {
        let positions: InstrumentPositionSet = get_json(self.durable.as_ref(), POSITIONS_KEY)
            .await?
            .unwrap_or_default();
        match payload.ticker {
            Some(ticker) => Ok(serde_json::to_value(
                positions.get(store_ticker(&ticker)).cloned().unwrap_or_default(),
            )?),
            None => Ok(serde_json::to_value(positions)?),
        }
    }

    /// Open a ticker's chain page in the background and collect it,
    /// reporting status to the calling tab. The job is claimed before the tab
    /// opens; a tab that never becomes ready is closed again.
    pub async fn collect_full_chain(
        self: &Arc<Self>,
        payload: CollectFullChainPayload,
        sender: Option<TabId>,
    ) -> Result<Value> {
        self.claim_job(None)?;

        let url = self.config.source.chain_url(&payload.ticker);
        let tab = match self.host.open_tab(&url, false).await {
            Ok(tab) => tab,
            Err(e) => {
                self.report_outcome(&CollectionOutcome::failed(format!("cannot start: {}", e)), sender.as_ref())
                    .await;
                return Err(e);
            }
        };
        if let Ok(mut job) = lock(&self.job) {
            job.tab_id = Some(tab.clone());
        }

        let ready = async {
            let source = self.host.chain_source(&tab).await?;
            source
                .wait_until_ready(self.config.collection.page_timeout_duration())
                .await?;
            Ok::<_, BridgeError>(source)
        }
        .await;

        match ready {
            Ok(source) => {
                self.spawn_collection(source, tab.clone(), sender, payload.max_expirations);
                Ok(json!({ "started": true, "tabId": tab }))
            }
            Err(e) => {
                self.close_quietly(&tab).await;
                self.report_outcome(&CollectionOutcome::failed(format!("cannot start: {}", e)), sender.as_ref())
                    .await;
                Err(e)
            }
        }
    }

    /// Open a position's new expiration in a background tab. The quotes come
    /// back either from the tab itself (`pinnedTabData`) or from scraping it
    /// here once it is ready, whichever arrives first.
    pub async fn open_pinned_tab(self: &Arc<Self>, payload: PinnedTabPayload, sender: Option<TabId>) -> Result<Value> {
        let tab = self.host.open_tab(&payload.url, false).await?;
        log::info!("Opened pinned tab {} for {} {} {}", tab, payload.ticker, payload.strike, payload.expiration);

        lock(&self.pinned)?.insert(
            tab.clone(),
            PinnedRequest {
                source: sender,
                request: payload,
            },
        );

        let background = Arc::clone(self);
        let scrape_tab = tab.clone();
        let handle = tokio::spawn(async move { background.scrape_pinned(scrape_tab).await });
        lock(&self.pinned_workers)?.push(handle);

        Ok(json!({ "tabId": tab }))
    }

    async fn scrape_pinned(&self, tab: TabId) {
        let strike = match lock(&self.pinned) {
            Ok(pinned) => pinned.get(&tab).map(|pending| pending.request.strike),
            Err(_) => None,
        };
        let Some(strike) = strike else {
            return;
        };

        let scraped = async {
            let source = self.host.chain_source(&tab).await?;
            source
                .wait_until_ready(self.config.collection.page_timeout_duration())
                .await?;
            source.parse_current().await
        }
        .await;

        let quotes = match scraped {
            Ok(page) => StrikeQuotes::at_strike(&page.options, strike),
            Err(e) => {
                log::debug!("Pinned tab {} not scraped: {}", tab, e);
                None
            }
        };
        match quotes {
            Some(quotes) => {
                if let Err(e) = self.deliver_pinned(&tab, quotes).await {
                    log::debug!("Pinned tab {} already answered: {}", tab, e);
                }
            }
            None => self.abandon_pinned(&tab).await,
        }
    }

    /// Apply a pinned tab's quotes to the position, tell the requesting tab,
    /// and close the pinned tab
    pub async fn deliver_pinned(&self, tab: &TabId, quotes: StrikeQuotes) -> Result<Value> {
        let pending = lock(&self.pinned)?.remove(tab);
        let PinnedRequest { source, request } = pending.ok_or_else(|| BridgeError::InvalidPayload {
            action: "pinnedTabData".to_string(),
            reason: format!("no pending request for tab {}", tab),
        })?;

        let ticker = store_ticker(&request.ticker);
        let mut positions = PositionStore::new(self.durable.clone());
        let updated = match positions.load().await {
            Ok(()) => {
                positions
                    .move_to_expiration(ticker, &request.pos_id, &request.expiration, &quotes.quote(request.side))
                    .await
            }
            Err(e) => {
                log::warn!("Positions unavailable for pinned update: {}", e);
                false
            }
        };

        let message = json!({
            "action": "updatePositionData",
            "posId": request.pos_id,
            "ticker": request.ticker,
            "strike": request.strike,
            "type": request.side,
            "newExp": request.expiration,
            "data": quotes,
        });
        let delivered = match &source {
            Some(source) => match self.host.send(source, message).await {
                Ok(_) => true,
                Err(e) => {
                    log::debug!("Position update for tab {} not delivered: {}", source, e);
                    false
                }
            },
            None => false,
        };

        self.close_quietly(tab).await;
        Ok(json!({
            "posId": request.pos_id,
            "updated": updated,
            "saved": !positions.is_dirty(),
            "delivered": delivered,
        }))
    }

    async fn abandon_pinned(&self, tab: &TabId) {
        let dropped = lock(&self.pinned).ok().and_then(|mut pinned| pinned.remove(tab));
        if dropped.is_some() {
            log::warn!("Pinned tab {} gave no quotes, closing it", tab);
            self.close_quietly(tab).await;
        }
    }

    async fn close_quietly(&self, tab: &TabId) {
        if let Err(e) = self.host.close_tab(tab).await {
            log::debug!("Tab {} not closed: {}", tab, e);
        }
    }

    fn finish_job(&self, outcome: &CollectionOutcome) {
        let Ok(mut job) = lock(&self.job) else {
            return;
        };
        if outcome.is_success() {
            job.finish(outcome.collected_count, outcome.error.clone());
        } else {
            job.fail(outcome.error.clone().unwrap_or_else(|| "collection failed".to_string()));
        }
    }

    /// Record a finished run and announce it to subscribers and the status tab
    async fn report_outcome(&self, outcome: &CollectionOutcome, status_tab: Option<&TabId>) {
        self.finish_job(outcome);
        self.publish(CollectionEvent::Complete {
            success: outcome.is_success(),
            options_count: outcome.is_success().then_some(outcome.collected_count),
            error: outcome.error.clone(),
        });
        if let Some(tab) = status_tab {
            let status = json!({
                "status": if outcome.is_success() { "done" } else { "error" },
                "progress": 100,
                "collected": outcome.collected_count,
                "error": outcome.error,
            });
            self.push_status(tab, status).await;
        }
    }

    fn publish(&self, event: CollectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn push_status(&self, tab: &TabId, status: Value) {
        let message = json!({ "action": "updateTVCStatus", "status": status });
        if let Err(e) = self.host.send(tab, message).await {
            log::debug!("Status for tab {} not delivered: {}", tab, e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| BridgeError::TabOperationFailed(format!("background state poisoned: {}", e)))
}

/// Feeds collector progress into the job, the event channel and the caller tab
struct JobReporter {
    background: Arc<Background>,
    status_tab: Option<TabId>,
}

#[async_trait]
impl CollectionProgress for JobReporter {
    async fn progress(&self, percent: u8, collected: usize, text: &str) {
        if let Ok(mut job) = lock(&self.background.job) {
            job.progress(percent, collected, text);
        }
        self.background.publish(CollectionEvent::Progress {
            percent,
            text: text.to_string(),
        });
        if let Some(tab) = &self.status_tab {
            let status = json!({ "status": "running", "progress": percent, "text": text, "collected": collected });
            self.background.push_status(tab, status).await;
        }
    }

    async fn complete(&self, outcome: &CollectionOutcome) {
        self.background.report_outcome(outcome, self.status_tab.as_ref()).await;
    }
}

#[async_trait]
impl CommandSink for Arc<Background> {
    async fn dispatch(&self, command: Value) -> Value {
        self.handle(command, None).await.to_value()
    }
}

/// Commands arriving from one tab's page, with that tab as sender
pub struct TabCommands {
    background: Arc<Background>,
    tab: TabId,
}

impl TabCommands {
    pub fn new(background: Arc<Background>, tab: TabId) -> Self {
        Self { background, tab }
    }
}

#[async_trait]
impl CommandSink for TabCommands {
    async fn dispatch(&self, command: Value) -> Value {
        self.background.handle(command, Some(self.tab.clone())).await.to_value()
    }
}
