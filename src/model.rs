//! Records shared by the scraper, the stores and the bridge
//!
//! Field names follow the durable store's JSON contract (`tvc_positions`,
//! `tvc_full_chain`, `tvc_underlying`), which the destination calculator
//! parses as-is.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable store key for the per-instrument positions
pub const POSITIONS_KEY: &str = "tvc_positions";
/// Durable store key for the last bulk-collected chain
pub const FULL_CHAIN_KEY: &str = "tvc_full_chain";
/// Durable store key for underlying quotes
pub const UNDERLYING_KEY: &str = "tvc_underlying";

/// Option side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "call", alias = "Call")]
    Call,
    #[serde(alias = "put", alias = "Put")]
    Put,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Call => write!(f, "CALL"),
            Side::Put => write!(f, "PUT"),
        }
    }
}

/// The five standard greeks
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Quote fields read for one side of a strike
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub price: f64,
    pub volume: u64,
    pub iv: f64,
}

impl Quote {
    /// Midpoint of bid and ask
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// A tracked option position
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionRecord {
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,

    #[serde(alias = "type")]
    pub side: Side,

    pub strike: f64,

    #[serde(default, alias = "expiration")]
    pub expiration_label: String,

    #[serde(default, rename = "expirationISO")]
    #[schemars(with = "Option<String>")]
    pub expiration_iso: Option<NaiveDate>,

    #[serde(default = "default_quantity", alias = "qty", deserialize_with = "lenient::quantity")]
    pub quantity: u32,

    /// Mid price at creation; never recomputed
    #[serde(default, alias = "entry")]
    pub entry_price: f64,

    #[serde(default)]
    pub bid: f64,

    #[serde(default)]
    pub ask: f64,

    #[serde(default, alias = "price")]
    pub last_price: f64,

    #[serde(default, deserialize_with = "lenient::count")]
    pub volume: u64,

    #[serde(default, alias = "iv")]
    pub implied_volatility: f64,

    #[serde(default)]
    pub greeks: Greeks,

    #[serde(default = "Utc::now")]
    #[schemars(with = "String")]
    pub added_at: DateTime<Utc>,
}

fn default_quantity() -> u32 {
    1
}

/// Ordered ticker → positions map. Empty sequences are never kept.
pub type InstrumentPositionSet = IndexMap<String, Vec<OptionRecord>>;

/// One row side as scraped from the chain table
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedOption {
    #[serde(rename = "type")]
    pub side: Side,
    pub strike: f64,
    #[serde(flatten)]
    pub quote: Quote,
    #[serde(flatten)]
    pub greeks: Greeks,
}

/// One expiration of a bulk-collected chain
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationChain {
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_code: Option<String>,
    #[serde(default)]
    pub options: Vec<ScrapedOption>,
}

/// Complete replacement of one instrument's scraped chain
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullChainSnapshot {
    pub ticker: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub underlying_price: f64,
    #[serde(default)]
    pub expirations: Vec<ExpirationChain>,
}

impl FullChainSnapshot {
    pub fn option_count(&self) -> usize {
        self.expirations.iter().map(|e| e.options.len()).sum()
    }
}

/// Most recent scraped underlying price for a ticker
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnderlyingQuote {
    pub ticker: String,
    pub price: f64,
    #[schemars(with = "String")]
    pub observed_at: DateTime<Utc>,
}

/// Strip an exchange prefix: `CME_MINI:ESH2026` → `ESH2026`
pub fn store_ticker(ticker: &str) -> &str {
    match ticker.split_once(':') {
        Some((_, short)) => short,
        None => ticker,
    }
}

/// Two-digit year form used in destination URLs: `ESH2026` → `ESH26`
pub fn url_ticker(ticker: &str) -> String {
    match split_four_digit_year(ticker) {
        Some((root, year)) if year.starts_with("20") => format!("{}{}", root, &year[2..]),
        _ => ticker.to_string(),
    }
}

/// One-digit year form used inside calculator records: `ESH2026` → `ESH6`
pub fn record_ticker(ticker: &str) -> String {
    match split_four_digit_year(ticker) {
        Some((root, year)) => format!("{}{}", root, &year[3..]),
        None => ticker.to_string(),
    }
}

fn split_four_digit_year(ticker: &str) -> Option<(&str, &str)> {
    if ticker.len() < 5 || !ticker.is_ascii() {
        return None;
    }
    let (root, year) = ticker.split_at(ticker.len() - 4);
    if year.bytes().all(|b| b.is_ascii_digit()) && !root.is_empty() {
        Some((root, year))
    } else {
        None
    }
}

/// Resolve an expiration label to a calendar date.
///
/// Accepts ISO dates, `YYYYMMDD` series codes and month-day labels with or
/// without a year. Labels without a year resolve to the next occurrence on or
/// after `today`.
pub fn parse_expiration(label: &str, today: NaiveDate) -> Option<NaiveDate> {
    let label = label.trim().trim_end_matches('.');
    if label.is_empty() {
        return None;
    }

    // Full-timestamp labels carry the date in the first ten characters
    if let Some(head) = label.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
            return Some(date);
        }
    }

    for format in ["%Y%m%d", "%b %d, %Y", "%b %d %Y", "%d %b %Y", "%B %d, %Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(label, format) {
            return Some(date);
        }
    }

    for format in ["%b %d %Y", "%d %b %Y", "%B %d %Y"] {
        let with_year = format!("{} {}", label, today.year());
        if let Ok(date) = NaiveDate::parse_from_str(&with_year, format) {
            if date >= today {
                return Some(date);
            }
            return date.with_year(today.year() + 1);
        }
    }

    None
}

/// Field parsers for records written by scripts, where numbers and numeric
/// strings are used interchangeably
pub(crate) mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Ids are strings here but `Date.now()` numbers in older data
    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("invalid option id: {}", other))),
        }
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f.round() as u64))
                .unwrap_or(0),
            Value::String(s) => crate::scrape::number::parse_number(&s)
                .filter(|f| *f > 0.0)
                .map(|f| f.round() as u64)
                .unwrap_or(0),
            _ => 0,
        })
    }

    pub fn quantity<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
        let count = count(deserializer)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX).max(1))
    }
}
