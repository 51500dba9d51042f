use crate::error::{BridgeError, Result};
use crate::model::{store_ticker, url_ticker};
use crate::scrape::url::chain_url;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whole milliseconds, saturating for durations past `u64::MAX` ms
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Pacing and limits for bulk collection
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionConfig {
    /// Expirations visited per job, the current one excluded
    pub max_expirations: usize,

    /// Minimum time between the end of one job and the start of the next
    pub cooldown_ms: u64,

    /// Randomized pause before each page load, lower bound
    pub min_delay_ms: u64,

    /// Randomized pause before each page load, upper bound
    pub max_delay_ms: u64,

    /// How long to wait for a chain table to render
    pub page_timeout_ms: u64,

    /// Consecutive page-load failures that abort the job
    pub max_consecutive_errors: u32,

    /// Visit expirations in random order
    pub shuffle: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_expirations: 5,
            cooldown_ms: 30_000,
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            page_timeout_ms: 60_000,
            max_consecutive_errors: 3,
            shuffle: true,
        }
    }
}

impl CollectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_expirations(mut self, max: usize) -> Self {
        self.max_expirations = max;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = millis(cooldown);
        self
    }

    pub fn delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay_ms = millis(min);
        self.max_delay_ms = millis(max);
        self
    }

    pub fn page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout_ms = millis(timeout);
        self
    }

    pub fn max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// No pauses and no cooldown; for tests and local dumps
    pub fn immediate() -> Self {
        Self::default()
            .cooldown(Duration::ZERO)
            .delay_range(Duration::ZERO, Duration::ZERO)
            .shuffle(false)
    }

    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn page_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

/// Where the destination calculator lives
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DestinationConfig {
    pub production_url: String,
    pub local_url: String,

    /// Open the local development server instead of production
    pub prefer_local: bool,

    /// Focus an already-open calculator tab instead of opening a new one
    pub reuse_existing_tab: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            production_url: "https://futures.optioner.online/tools/universal-calculator".to_string(),
            local_url: "http://localhost:3000/tools/universal-calculator".to_string(),
            prefer_local: false,
            reuse_existing_tab: false,
        }
    }
}

impl DestinationConfig {
    pub fn base_url(&self) -> &str {
        if self.prefer_local {
            &self.local_url
        } else {
            &self.production_url
        }
    }

    /// Calculator URL for an instrument, e.g. `…?contract=ESH26`
    pub fn url_for(&self, ticker: &str) -> String {
        format!(
            "{}?contract={}",
            self.base_url(),
            urlencoding::encode(&url_ticker(store_ticker(ticker)))
        )
    }

    /// Whether a tab URL belongs to either calculator deployment
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.production_url) || url.starts_with(&self.local_url)
    }
}

/// Where option chains are scraped from
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceConfig {
    pub chain_url_prefix: String,
    pub exchange: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            chain_url_prefix: "https://www.tradingview.com/options/chain/".to_string(),
            exchange: "CME_MINI".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn chain_url(&self, ticker: &str) -> String {
        chain_url(&self.chain_url_prefix, &self.exchange, store_ticker(ticker))
    }
}

/// Runtime configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Fixed poll interval of the sync loop
    pub poll_interval_ms: u64,

    /// Instrument assumed when the calculator names none
    pub default_ticker: String,

    pub collection: CollectionConfig,
    pub destination: DestinationConfig,
    pub source: SourceConfig,

    /// File backing the durable store
    pub storage_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            default_ticker: "ESH2026".to_string(),
            collection: CollectionConfig::default(),
            destination: DestinationConfig::default(),
            source: SourceConfig::default(),
            storage_path: PathBuf::from("chain-bridge-store.json"),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(BridgeError::Config("pollIntervalMs must be positive".to_string()));
        }
        if self.collection.min_delay_ms > self.collection.max_delay_ms {
            return Err(BridgeError::Config("minDelayMs exceeds maxDelayMs".to_string()));
        }
        if self.collection.max_consecutive_errors == 0 {
            return Err(BridgeError::Config("maxConsecutiveErrors must be positive".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    pub fn default_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.default_ticker = ticker.into();
        self
    }

    pub fn collection(mut self, collection: CollectionConfig) -> Self {
        self.collection = collection;
        self
    }

    pub fn destination(mut self, destination: DestinationConfig) -> Self {
        self.destination = destination;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(2));
        assert_eq!(config.collection.max_expirations, 5);
        assert_eq!(config.collection.cooldown_duration(), Duration::from_secs(30));
        assert_eq!(config.collection.max_consecutive_errors, 3);
        assert!(!config.destination.reuse_existing_tab);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"pollIntervalMs": 500, "collection": {"maxExpirations": 2}}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.collection.max_expirations, 2);
        assert_eq!(config.collection.min_delay_ms, 2_000);
        assert_eq!(config.source.exchange, "CME_MINI");
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new()
            .poll_interval(Duration::from_millis(250))
            .collection(CollectionConfig::new().max_expirations(8).shuffle(false));
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.collection.max_expirations, 8);
        assert!(!config.collection.shuffle);
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let collection = CollectionConfig::new().cooldown(Duration::MAX).page_timeout(Duration::from_secs(90));
        assert_eq!(collection.cooldown_ms, u64::MAX);
        assert_eq!(collection.page_timeout_ms, 90_000);
        assert_eq!(BridgeConfig::new().poll_interval(Duration::MAX).poll_interval_ms, u64::MAX);
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = BridgeConfig::new().collection(
            CollectionConfig::new().delay_range(Duration::from_secs(5), Duration::from_secs(1)),
        );
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_urls() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.destination.url_for("CME_MINI:ESH2026"),
            "https://futures.optioner.online/tools/universal-calculator?contract=ESH26"
        );
        assert!(config.destination.matches("http://localhost:3000/tools/universal-calculator?contract=NQH26"));
        assert_eq!(
            config.source.chain_url("ESH2026"),
            "https://www.tradingview.com/options/chain/CME_MINI-ESH2026/"
        );
    }
}
