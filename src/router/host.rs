use crate::collect::ChainSource;
use crate::error::Result;
use crate::sync::page::PageStorage;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Opaque tab identifier. Hosts may use numbers; they are kept as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        TabId(id.to_string())
    }
}

impl From<String> for TabId {
    fn from(id: String) -> Self {
        TabId(id)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TabId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(TabId(s)),
            Value::Number(n) => Ok(TabId(n.to_string())),
            other => Err(serde::de::Error::custom(format!("invalid tab id: {}", other))),
        }
    }
}

/// A tab as listed by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
}

/// Tab lifecycle and messaging owned by the background context
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Open a tab and wait until it has loaded
    async fn open_tab(&self, url: &str, active: bool) -> Result<TabId>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;

    async fn focus_tab(&self, tab: &TabId) -> Result<()>;

    async fn close_tab(&self, tab: &TabId) -> Result<()>;

    /// Navigate and wait until loaded
    async fn navigate(&self, tab: &TabId, url: &str) -> Result<()>;

    async fn reload(&self, tab: &TabId) -> Result<()>;

    /// Deliver a message to a tab's context and return its reply.
    /// Fails with `ChannelClosed` when nothing listens there anymore.
    async fn send(&self, tab: &TabId, message: Value) -> Result<Value>;

    /// The tab's `localStorage`
    async fn page_storage(&self, tab: &TabId) -> Result<Arc<dyn PageStorage>>;

    /// The tab as a chain page
    async fn chain_source(&self, tab: &TabId) -> Result<Arc<dyn ChainSource>>;
}
