//! The destination page's side of the bridge.
//!
//! The calculator keeps its state as a JSON string under `calculatorState`
//! in a `localStorage`-like store. Only the option list (and the underlying
//! price) inside it are ever rewritten; every other field round-trips untouched.

use crate::error::{BridgeError, Result};
use crate::model::{Greeks, OptionRecord, Side, lenient, parse_expiration, record_ticker, store_ticker};
use crate::sync::fingerprint::Identified;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Page key holding the calculator's whole state
pub const CALCULATOR_STATE_KEY: &str = "calculatorState";
/// Page key the calculator writes commands into
pub const COMMAND_KEY: &str = "tvc_command";
/// Page key receiving collection status updates
pub const STATUS_KEY: &str = "tvc_status";

/// String key/value storage owned by the hosting page
#[async_trait]
pub trait PageStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Whether the page context can still be reached
    fn is_connected(&self) -> bool {
        true
    }
}

/// Read a key and parse it as JSON. Malformed values read as absent.
pub async fn read_page_json<T: DeserializeOwned>(page: &dyn PageStorage, key: &str) -> Result<Option<T>> {
    let Some(raw) = page.get_item(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            log::debug!("Ignoring malformed page value under {}: {}", key, e);
            Ok(None)
        }
    }
}

pub async fn write_page_json<T: Serialize + ?Sized>(page: &dyn PageStorage, key: &str, value: &T) -> Result<()> {
    page.set_item(key, &serde_json::to_string(value)?).await
}

/// In-process page store for tests
#[derive(Debug, Default)]
pub struct MemoryPageStorage {
    items: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
    disconnected: AtomicBool,
}

impl MemoryPageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(self, key: &str, value: impl Into<String>) -> Self {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key.to_string(), value.into());
        }
        self
    }

    /// Number of `set_item`/`remove_item` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        self.items.lock().ok().and_then(|items| items.get(key).cloned())
    }

    /// Write without counting, as another tab of the same origin would
    pub fn put_external(&self, key: &str, value: impl Into<String>) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key.to_string(), value.into());
        }
    }

    fn check(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelClosed("page context torn down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PageStorage for MemoryPageStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let items = self.items.lock().map_err(|e| BridgeError::storage(key, e))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.items
            .lock()
            .map_err(|e| BridgeError::storage(key, e))?
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.check()?;
        self.items.lock().map_err(|e| BridgeError::storage(key, e))?.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

/// The calculator's persisted state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_ticker: Option<String>,

    #[serde(default)]
    pub options: Vec<PageOption>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying_price: Option<f64>,

    #[serde(default)]
    pub selected_expiration_date: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CalculatorState {
    /// Fresh state for a ticker, as written when a destination tab is opened
    pub fn for_ticker(exchange: &str, ticker: &str) -> Self {
        Self {
            selected_ticker: Some(format!("{}:{}", exchange, store_ticker(ticker))),
            ..Self::default()
        }
    }

    /// Store key of the selected instrument (`CME_MINI:ESH2026` → `ESH2026`)
    pub fn instrument<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.selected_ticker
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(store_ticker)
            .unwrap_or(fallback)
    }

    /// Replace the option list, carrying over page-only fields of options that survive
    pub fn replace_options(&mut self, mut options: Vec<PageOption>) {
        for option in options.iter_mut() {
            if let Some(previous) = self.options.iter().find(|o| o.id == option.id) {
                for (key, value) in &previous.extra {
                    option.extra.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        if let Some(first) = options.first().filter(|o| !o.date.is_empty()) {
            self.selected_expiration_date = Some(first.date.clone());
        }
        self.options = options;
    }
}

/// One option in the calculator's own record shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageOption {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,

    #[serde(default = "default_action")]
    pub action: String,

    #[serde(rename = "type", with = "page_side")]
    pub side: Side,

    pub strike: f64,

    /// ISO date when known, otherwise the raw expiration label
    #[serde(default)]
    pub date: String,

    #[serde(default = "default_quantity", deserialize_with = "lenient::quantity")]
    pub quantity: u32,

    #[serde(default)]
    pub premium: f64,

    #[serde(default)]
    pub bid: f64,

    #[serde(default)]
    pub ask: f64,

    #[serde(default, deserialize_with = "lenient::count")]
    pub volume: u64,

    #[serde(default, deserialize_with = "lenient::count")]
    pub oi: u64,

    #[serde(default = "default_visible")]
    pub visible: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub vega: f64,
    #[serde(default)]
    pub rho: f64,

    #[serde(default)]
    pub implied_volatility: f64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_action() -> String {
    "Buy".to_string()
}

fn default_quantity() -> u32 {
    1
}

fn default_visible() -> bool {
    true
}

impl Identified for PageOption {
    fn record_id(&self) -> &str {
        &self.id
    }
}

impl PageOption {
    pub fn greeks(&self) -> Greeks {
        Greeks {
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            rho: self.rho,
        }
    }
}

/// Extension record → calculator option
pub fn to_page_option(record: &OptionRecord, ticker: &str) -> PageOption {
    let date = match record.expiration_iso {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => record.expiration_label.clone(),
    };
    let premium = [record.entry_price, record.last_price]
        .into_iter()
        .find(|p| *p > 0.0)
        .unwrap_or((record.bid + record.ask) / 2.0);

    PageOption {
        id: record.id.clone(),
        action: default_action(),
        side: record.side,
        strike: record.strike,
        date,
        quantity: record.quantity.max(1),
        premium,
        bid: record.bid,
        ask: record.ask,
        volume: record.volume,
        oi: 0,
        visible: true,
        ticker: Some(record_ticker(store_ticker(ticker))),
        last_updated: Some(Utc::now()),
        delta: record.greeks.delta,
        gamma: record.greeks.gamma,
        theta: record.greeks.theta,
        vega: record.greeks.vega,
        rho: record.greeks.rho,
        implied_volatility: record.implied_volatility,
        extra: Map::new(),
    }
}

/// Calculator option → extension record; absent fields fall back to defaults
pub fn to_record(option: &PageOption, today: NaiveDate) -> OptionRecord {
    OptionRecord {
        id: option.id.clone(),
        side: option.side,
        strike: option.strike,
        expiration_label: option.date.clone(),
        expiration_iso: parse_expiration(&option.date, today),
        quantity: option.quantity.max(1),
        entry_price: option.premium,
        bid: option.bid,
        ask: option.ask,
        last_price: option.premium,
        volume: option.volume,
        implied_volatility: option.implied_volatility,
        greeks: option.greeks(),
        added_at: option.last_updated.unwrap_or_else(Utc::now),
    }
}

pub fn to_page_options(records: &[OptionRecord], ticker: &str) -> Vec<PageOption> {
    records.iter().map(|r| to_page_option(r, ticker)).collect()
}

pub fn to_records(options: &[PageOption], today: NaiveDate) -> Vec<OptionRecord> {
    options.iter().map(|o| to_record(o, today)).collect()
}

// The calculator writes sides in lower case
mod page_side {
    use super::*;

    pub fn serialize<S: Serializer>(side: &Side, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(match side {
            Side::Call => "call",
            Side::Put => "put",
        })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Side, D::Error> {
        Side::deserialize(deserializer)
    }
}
