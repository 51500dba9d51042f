//! headless_chrome implementations of the bridge's host traits.
//!
//! CDP calls block, so each one runs on tokio's blocking pool. Tabs are held
//! weakly: once Chrome drops a closed tab, every call on it reports a closed
//! channel instead of an evaluation error.

use crate::browser::session::BrowserSession;
use crate::collect::ChainSource;
use crate::dom::ExpirationRef;
use crate::error::{BridgeError, Result};
use crate::router::host::{TabHost, TabId, TabInfo};
use crate::scrape::{ChainUrl, ParsedPage};
use crate::sync::page::{PageStorage, STATUS_KEY};
use async_trait::async_trait;
use headless_chrome::Tab;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

const READY_POLL: Duration = Duration::from_millis(500);

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::TabOperationFailed(format!("browser task failed: {}", e)))?
}

fn upgrade(tab: &Weak<Tab>) -> Result<Arc<Tab>> {
    tab.upgrade()
        .ok_or_else(|| BridgeError::ChannelClosed("tab was closed".to_string()))
}

fn js_string(value: &str) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn evaluate(tab: &Tab, expression: &str) -> Result<Option<Value>> {
    tab.evaluate(expression, false)
        .map(|remote| remote.value)
        .map_err(|e| BridgeError::EvaluationFailed(e.to_string()))
}

/// A tab's `localStorage`
pub struct TabLocalStorage {
    tab: Weak<Tab>,
}

impl TabLocalStorage {
    pub fn new(tab: &Arc<Tab>) -> Self {
        Self {
            tab: Arc::downgrade(tab),
        }
    }
}

#[async_trait]
impl PageStorage for TabLocalStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let tab = upgrade(&self.tab)?;
        let expression = format!("localStorage.getItem({})", js_string(key)?);
        let value = blocking(move || evaluate(&tab, &expression)).await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let tab = upgrade(&self.tab)?;
        // Same-tab writes do not fire `storage`, so the page is told explicitly
        let expression = format!(
            "(function (k, v) {{ localStorage.setItem(k, v); \
             window.dispatchEvent(new StorageEvent('storage', {{ key: k, newValue: v }})); \
             return true; }})({}, {})",
            js_string(key)?,
            js_string(value)?
        );
        blocking(move || evaluate(&tab, &expression)).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let tab = upgrade(&self.tab)?;
        let expression = format!("localStorage.removeItem({}); true", js_string(key)?);
        blocking(move || evaluate(&tab, &expression)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.tab.strong_count() > 0
    }
}

/// A tab showing an option chain
pub struct ChromeChain {
    tab: Weak<Tab>,
}

impl ChromeChain {
    pub fn new(tab: &Arc<Tab>) -> Self {
        Self {
            tab: Arc::downgrade(tab),
        }
    }
}

#[async_trait]
impl ChainSource for ChromeChain {
    async fn parse_current(&self) -> Result<ParsedPage> {
        let tab = upgrade(&self.tab)?;
        blocking(move || BrowserSession::parse_tab(&tab)).await
    }

    async fn expirations(&self) -> Result<Vec<ExpirationRef>> {
        let tab = upgrade(&self.tab)?;
        blocking(move || BrowserSession::expirations(&tab)).await
    }

    async fn open_expiration(&self, expiration: &ExpirationRef, timeout: Duration) -> Result<()> {
        let tab = upgrade(&self.tab)?;
        let url = ChainUrl::parse(&tab.get_url())
            .for_expiration(&expiration.date_code)
            .ok_or_else(|| BridgeError::NavigationFailed("chain URL carries no series".to_string()))?;

        log::debug!("Loading expiration {}", expiration.display_date);
        blocking(move || BrowserSession::navigate(&tab, &url)).await?;
        self.wait_until_ready(timeout).await
    }

    async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let tab = upgrade(&self.tab)?;
            if blocking(move || BrowserSession::is_chain_ready(&tab)).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::NavigationFailed(format!(
                    "chain table not ready after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.tab.strong_count() > 0
    }
}

/// [`TabHost`] over a live browser session; tab ids are DevTools target ids
pub struct ChromeHost {
    session: Arc<BrowserSession>,
}

impl ChromeHost {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self { session }
    }

    async fn tab(&self, id: &TabId) -> Result<Arc<Tab>> {
        let session = self.session.clone();
        let target = id.as_str().to_string();
        blocking(move || session.find_tab(&target))
            .await?
            .ok_or_else(|| BridgeError::ChannelClosed(format!("no tab {}", id)))
    }
}

#[async_trait]
impl TabHost for ChromeHost {
    async fn open_tab(&self, url: &str, active: bool) -> Result<TabId> {
        let session = self.session.clone();
        let url = url.to_string();
        blocking(move || {
            let tab = session.new_tab()?;
            BrowserSession::navigate(&tab, &url)?;
            if active {
                tab.activate()
                    .map_err(|e| BridgeError::TabOperationFailed(format!("Failed to activate tab: {}", e)))?;
            }
            Ok(TabId::from(tab.get_target_id().as_str()))
        })
        .await
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let session = self.session.clone();
        blocking(move || {
            Ok(session
                .get_tabs()?
                .iter()
                .map(|tab| TabInfo {
                    id: TabId::from(tab.get_target_id().as_str()),
                    url: tab.get_url(),
                })
                .collect())
        })
        .await
    }

    async fn focus_tab(&self, id: &TabId) -> Result<()> {
        let tab = self.tab(id).await?;
        blocking(move || {
            tab.activate()
                .map_err(|e| BridgeError::TabOperationFailed(format!("Failed to activate tab: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn close_tab(&self, id: &TabId) -> Result<()> {
        let tab = self.tab(id).await?;
        blocking(move || {
            tab.close(false)
                .map_err(|e| BridgeError::TabOperationFailed(format!("Failed to close tab: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn navigate(&self, id: &TabId, url: &str) -> Result<()> {
        let tab = self.tab(id).await?;
        let url = url.to_string();
        blocking(move || BrowserSession::navigate(&tab, &url)).await
    }

    async fn reload(&self, id: &TabId) -> Result<()> {
        let tab = self.tab(id).await?;
        blocking(move || {
            tab.reload(false, None)
                .map_err(|e| BridgeError::NavigationFailed(format!("Failed to reload: {}", e)))?;
            tab.wait_until_navigated()
                .map_err(|e| BridgeError::NavigationFailed(format!("Navigation timeout: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// Status updates land in the page's `tvc_status` key; anything else is
    /// dispatched to the page as a `chain-bridge` DOM event
    async fn send(&self, id: &TabId, message: Value) -> Result<Value> {
        let tab = self.tab(id).await?;
        if message.get("action").and_then(Value::as_str) == Some("updateTVCStatus") {
            let status = message.get("status").cloned().unwrap_or(Value::Null);
            TabLocalStorage::new(&tab)
                .set_item(STATUS_KEY, &serde_json::to_string(&status)?)
                .await?;
            return Ok(json!({ "success": true }));
        }

        let expression = format!(
            "window.dispatchEvent(new CustomEvent('chain-bridge', {{ detail: {} }}))",
            serde_json::to_string(&message)?
        );
        let delivered = blocking(move || evaluate(&tab, &expression)).await?;
        Ok(json!({ "success": delivered.and_then(|v| v.as_bool()).unwrap_or(false) }))
    }

    async fn page_storage(&self, id: &TabId) -> Result<Arc<dyn PageStorage>> {
        Ok(Arc::new(TabLocalStorage::new(&self.tab(id).await?)))
    }

    async fn chain_source(&self, id: &TabId) -> Result<Arc<dyn ChainSource>> {
        Ok(Arc::new(ChromeChain::new(&self.tab(id).await?)))
    }
}
