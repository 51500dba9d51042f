//! The command protocol shared by the page, popup and background contexts.
//!
//! Messages are `{ action, payload? }`. Older senders put the payload fields
//! next to `action` instead of under `payload`; both shapes are accepted.

use crate::error::{BridgeError, Result};
use crate::model::{OptionRecord, Quote, ScrapedOption, Side, lenient, store_ticker};
use crate::router::host::TabId;
use crate::sync::page::{CalculatorState, to_page_options};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw message as it arrives
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Message {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Accept both `{action, payload}` and `{action, ...fields}`
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(BridgeError::InvalidPayload {
                action: String::new(),
                reason: "message is not an object".to_string(),
            });
        };
        let action = match fields.remove("action").or_else(|| fields.remove("type")) {
            Some(Value::String(action)) => action,
            _ => {
                return Err(BridgeError::InvalidPayload {
                    action: String::new(),
                    reason: "missing action".to_string(),
                });
            }
        };
        let payload = match fields.remove("payload") {
            Some(payload) => Some(payload),
            None if fields.is_empty() => None,
            None => Some(Value::Object(fields)),
        };
        Ok(Self { action, payload })
    }

    fn parse_payload<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match &self.payload {
            None | Some(Value::Null) => Ok(T::default()),
            Some(payload) => serde_json::from_value(payload.clone()).map_err(|e| BridgeError::InvalidPayload {
                action: self.action.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn require_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.clone().unwrap_or(Value::Object(Map::new()));
        serde_json::from_value(payload).map_err(|e| BridgeError::InvalidPayload {
            action: self.action.clone(),
            reason: e.to_string(),
        })
    }
}

/// Initial payload handed to a newly opened destination tab
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationPayload {
    pub ticker: String,
    #[serde(default)]
    pub positions: Vec<OptionRecord>,
    #[serde(default)]
    pub underlying_price: Option<f64>,
}

impl DestinationPayload {
    /// Write the payload into the calculator's state, replacing its option list
    pub fn apply(&self, state: &mut CalculatorState, exchange: &str) {
        let ticker = store_ticker(&self.ticker);
        state.selected_ticker = Some(format!("{}:{}", exchange, ticker));
        state.replace_options(to_page_options(&self.positions, ticker));
        if let Some(price) = self.underlying_price.filter(|p| *p > 0.0) {
            state.underlying_price = Some(price);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartCollectionPayload {
    pub tab_id: TabId,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    pub tab_id: TabId,
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetPositionsPayload {
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectFullChainPayload {
    pub ticker: String,
    #[serde(default)]
    pub max_expirations: Option<usize>,
}

/// Request to load another expiration of a tracked position in a background tab
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PinnedTabPayload {
    /// Chain page showing the new expiration
    pub url: String,
    /// Label of the new expiration
    pub expiration: String,
    pub ticker: String,
    pub strike: f64,
    #[serde(rename = "type", alias = "side")]
    pub side: Side,
    #[serde(deserialize_with = "lenient::id")]
    pub pos_id: String,
}

/// Both sides' quotes at one strike, as a pinned tab reports them
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StrikeQuotes {
    pub call_bid: f64,
    pub call_ask: f64,
    pub call_price: f64,
    #[serde(deserialize_with = "lenient::count")]
    pub call_volume: u64,
    pub call_iv: f64,
    pub put_bid: f64,
    pub put_ask: f64,
    pub put_price: f64,
    #[serde(deserialize_with = "lenient::count")]
    pub put_volume: u64,
    pub put_iv: f64,
}

impl StrikeQuotes {
    /// Quotes at `strike` from a parsed chain; `None` if neither side is listed
    pub fn at_strike(options: &[ScrapedOption], strike: f64) -> Option<Self> {
        let side = |side: Side| options.iter().find(|o| o.side == side && o.strike == strike).map(|o| o.quote);
        let (call, put) = (side(Side::Call), side(Side::Put));
        if call.is_none() && put.is_none() {
            return None;
        }
        let (call, put) = (call.unwrap_or_default(), put.unwrap_or_default());
        Some(Self {
            call_bid: call.bid,
            call_ask: call.ask,
            call_price: call.price,
            call_volume: call.volume,
            call_iv: call.iv,
            put_bid: put.bid,
            put_ask: put.ask,
            put_price: put.price,
            put_volume: put.volume,
            put_iv: put.iv,
        })
    }

    pub fn quote(&self, side: Side) -> Quote {
        match side {
            Side::Call => Quote {
                bid: self.call_bid,
                ask: self.call_ask,
                price: self.call_price,
                volume: self.call_volume,
                iv: self.call_iv,
            },
            Side::Put => Quote {
                bid: self.put_bid,
                ask: self.put_ask,
                price: self.put_price,
                volume: self.put_volume,
                iv: self.put_iv,
            },
        }
    }
}

/// Quotes sent back by a pinned tab
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PinnedTabDataPayload {
    #[serde(default)]
    pub data: StrikeQuotes,
}

/// A recognized command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenDestinationTab(DestinationPayload),
    StartCollection(StartCollectionPayload),
    StopCollection,
    CollectionStatus,
    Relay(RelayPayload),
    GetPositions(GetPositionsPayload),
    CollectFullChain(CollectFullChainPayload),
    OpenPinnedTab(PinnedTabPayload),
    PinnedTabData(PinnedTabDataPayload),
}

impl Command {
    pub fn parse(message: &Message) -> Result<Self> {
        let command = match message.action.as_str() {
            "openDestinationTab" | "openOptionerTab" => Command::OpenDestinationTab(message.require_payload()?),
            "startCollection" | "startDataCollection" => Command::StartCollection(message.require_payload()?),
            "stopCollection" => Command::StopCollection,
            "collectionStatus" | "getCollectionStatus" => Command::CollectionStatus,
            "relay" => Command::Relay(message.require_payload()?),
            "getPositions" | "GET_POSITIONS" => Command::GetPositions(message.parse_payload()?),
            "collectFullChain" => Command::CollectFullChain(message.require_payload()?),
            "openPinnedTab" => Command::OpenPinnedTab(message.require_payload()?),
            "pinnedTabData" => Command::PinnedTabData(message.parse_payload()?),
            other => return Err(BridgeError::UnknownAction(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenDestinationTab(_) => "openDestinationTab",
            Command::StartCollection(_) => "startCollection",
            Command::StopCollection => "stopCollection",
            Command::CollectionStatus => "collectionStatus",
            Command::Relay(_) => "relay",
            Command::GetPositions(_) => "getPositions",
            Command::CollectFullChain(_) => "collectFullChain",
            Command::OpenPinnedTab(_) => "openPinnedTab",
            Command::PinnedTabData(_) => "pinnedTabData",
        }
    }
}

/// Reply to every command
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Events broadcast while a collection runs
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "action")]
pub enum CollectionEvent {
    #[serde(rename = "collectionProgress")]
    Progress { percent: u8, text: String },

    #[serde(rename = "collectionComplete", rename_all = "camelCase")]
    Complete {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options_count: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// JSON schema of the command protocol, for UI clients
pub fn protocol_schema() -> Value {
    let schemas = [
        ("message", schemars::schema_for!(Message)),
        ("response", schemars::schema_for!(Response)),
        ("event", schemars::schema_for!(CollectionEvent)),
        ("openDestinationTab", schemars::schema_for!(DestinationPayload)),
        ("startCollection", schemars::schema_for!(StartCollectionPayload)),
        ("relay", schemars::schema_for!(RelayPayload)),
        ("getPositions", schemars::schema_for!(GetPositionsPayload)),
        ("collectFullChain", schemars::schema_for!(CollectFullChainPayload)),
        ("openPinnedTab", schemars::schema_for!(PinnedTabPayload)),
        ("pinnedTabData", schemars::schema_for!(PinnedTabDataPayload)),
    ];
    Value::Object(
        schemas
            .into_iter()
            .map(|(name, schema)| (name.to_string(), serde_json::to_value(schema).unwrap_or(Value::Null)))
            .collect(),
    )
}
