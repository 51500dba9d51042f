//! Reconciliation between the calculator page and the extension store.
//!
//! Each direction remembers the fingerprint it last saw. A direction writes
//! only when the fingerprint of its source moved, and after any write both
//! directions adopt the written collection's fingerprint, so a propagation in
//! one direction never reads as a change in the other.
//!
//! Within a tick the page is read first: when both sides changed since the
//! previous tick, the page's collection wins.

use crate::error::{BridgeError, Result};
use crate::model::{FULL_CHAIN_KEY, InstrumentPositionSet, POSITIONS_KEY};
use crate::store::durable::{DurableStore, get_json, set_json};
use crate::store::market::load_underlying;
use crate::sync::fingerprint::Fingerprint;
use crate::sync::page::{
    CALCULATOR_STATE_KEY, COMMAND_KEY, CalculatorState, PageStorage, STATUS_KEY, read_page_json, to_page_options,
    to_records, write_page_json,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Receiver of commands the page leaves under `tvc_command`
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Handle one raw command and return the raw reply
    async fn dispatch(&self, command: Value) -> Value;
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub ticker: Option<String>,
    /// Records written to the extension store
    pub to_extension: Option<usize>,
    /// Records written to the page
    pub to_page: Option<usize>,
    pub underlying_updated: bool,
    pub full_chain_mirrored: bool,
    pub command_replies: Vec<Value>,
}

impl SyncReport {
    /// True when the pass wrote nothing anywhere
    pub fn is_idle(&self) -> bool {
        self.to_extension.is_none()
            && self.to_page.is_none()
            && !self.underlying_updated
            && !self.full_chain_mirrored
            && self.command_replies.is_empty()
    }
}

pub struct SyncBridge {
    page: Arc<dyn PageStorage>,
    durable: Arc<dyn DurableStore>,
    commands: Option<Arc<dyn CommandSink>>,
    default_ticker: String,
    active_ticker: Option<String>,
    // page → extension
    page_seen: Fingerprint,
    // extension → page
    store_seen: Fingerprint,
}

impl SyncBridge {
    pub fn new(page: Arc<dyn PageStorage>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            page,
            durable,
            commands: None,
            default_ticker: "ESH2026".to_string(),
            active_ticker: None,
            page_seen: Fingerprint::default(),
            store_seen: Fingerprint::default(),
        }
    }

    /// Forward page commands to a router
    pub fn with_commands(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.commands = Some(sink);
        self
    }

    /// Instrument assumed when the page names none
    pub fn with_default_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.default_ticker = ticker.into();
        self
    }

    /// Both ends of the channel are still alive
    pub fn is_connected(&self) -> bool {
        self.page.is_connected() && self.durable.is_connected()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::ChannelClosed("bridge context invalidated".to_string()))
        }
    }

    pub fn page_fingerprint(&self) -> &Fingerprint {
        &self.page_seen
    }

    pub fn store_fingerprint(&self) -> &Fingerprint {
        &self.store_seen
    }

    /// One full reconciliation pass
    pub async fn tick(&mut self) -> Result<SyncReport> {
        self.ensure_connected()?;
        let mut report = SyncReport::default();

        if let Some(command) = self.take_command().await? {
            report.command_replies.push(self.forward(command).await);
        }

        if let Some(mut state) = read_page_json::<CalculatorState>(self.page.as_ref(), CALCULATOR_STATE_KEY).await? {
            let ticker = state.instrument(&self.default_ticker).to_string();
            self.track_instrument(&ticker, &state);

            report.to_extension = self.page_to_extension(&state, &ticker).await?;

            let mut page_dirty = false;
            if let Some(count) = self.extension_to_page(&mut state, &ticker).await? {
                report.to_page = Some(count);
                page_dirty = true;
            }
            if self.apply_underlying(&mut state, &ticker).await? {
                report.underlying_updated = true;
                page_dirty = true;
            }
            if page_dirty {
                self.ensure_connected()?;
                write_page_json(self.page.as_ref(), CALCULATOR_STATE_KEY, &state).await?;
            }
            report.ticker = Some(ticker);
        }

        report.full_chain_mirrored = self.mirror_full_chain().await?;

        if !report.is_idle() {
            log::debug!("Sync pass: {:?}", report);
        }
        Ok(report)
    }

    /// On an instrument switch the options still shown belong to the previous
    /// instrument: they are taken as seen, and the new instrument's stored
    /// positions are pushed to the page.
    fn track_instrument(&mut self, ticker: &str, state: &CalculatorState) {
        if self.active_ticker.as_deref() == Some(ticker) {
            return;
        }
        if let Some(previous) = self.active_ticker.replace(ticker.to_string()) {
            log::info!("Calculator switched from {} to {}", previous, ticker);
            self.page_seen = Fingerprint::of(&state.options);
            self.store_seen = Fingerprint::default();
        }
    }

    async fn page_to_extension(&mut self, state: &CalculatorState, ticker: &str) -> Result<Option<usize>> {
        let current = Fingerprint::of(&state.options);
        if current == self.page_seen {
            return Ok(None);
        }

        self.ensure_connected()?;
        let mut positions: InstrumentPositionSet = get_json(self.durable.as_ref(), POSITIONS_KEY)
            .await?
            .unwrap_or_default();
        let records = to_records(&state.options, Utc::now().date_naive());
        let count = records.len();
        if records.is_empty() {
            positions.shift_remove(ticker);
        } else {
            positions.insert(ticker.to_string(), records);
        }
        set_json(self.durable.as_ref(), POSITIONS_KEY, &positions).await?;

        log::info!("Synced {} options for {} to the extension", count, ticker);
        self.store_seen = current.clone();
        self.page_seen = current;
        Ok(Some(count))
    }

    async fn extension_to_page(&mut self, state: &mut CalculatorState, ticker: &str) -> Result<Option<usize>> {
        self.ensure_connected()?;
        let mut positions: InstrumentPositionSet = get_json(self.durable.as_ref(), POSITIONS_KEY)
            .await?
            .unwrap_or_default();
        let records = positions.shift_remove(ticker).unwrap_or_default();

        let current = Fingerprint::of(&records);
        if current == self.store_seen {
            return Ok(None);
        }

        state.replace_options(to_page_options(&records, ticker));
        log::info!("Synced {} options for {} to the page", records.len(), ticker);
        self.page_seen = current.clone();
        self.store_seen = current;
        Ok(Some(records.len()))
    }

    async fn apply_underlying(&self, state: &mut CalculatorState, ticker: &str) -> Result<bool> {
        self.ensure_connected()?;
        let quotes = load_underlying(self.durable.as_ref()).await?;
        let Some(price) = quotes.get(ticker).map(|q| q.price).filter(|p| *p > 0.0) else {
            return Ok(false);
        };
        if state.underlying_price == Some(price) {
            return Ok(false);
        }

        log::debug!("Underlying for {} → {}", ticker, price);
        state.underlying_price = Some(price);
        Ok(true)
    }

    async fn mirror_full_chain(&self) -> Result<bool> {
        self.ensure_connected()?;
        let Some(chain) = self.durable.get(FULL_CHAIN_KEY).await? else {
            return Ok(false);
        };
        let serialized = serde_json::to_string(&chain)?;
        if self.page.get_item(FULL_CHAIN_KEY).await?.as_deref() == Some(serialized.as_str()) {
            return Ok(false);
        }

        self.page.set_item(FULL_CHAIN_KEY, &serialized).await?;
        log::info!("Mirrored full chain to the page");
        Ok(true)
    }

    /// Take the pending page command, removing it so it runs once
    pub async fn take_command(&self) -> Result<Option<Value>> {
        self.ensure_connected()?;
        let Some(raw) = self.page.get_item(COMMAND_KEY).await? else {
            return Ok(None);
        };
        self.page.remove_item(COMMAND_KEY).await?;

        match serde_json::from_str(&raw) {
            Ok(command) => Ok(Some(command)),
            Err(e) => {
                log::warn!("Dropping malformed page command: {}", e);
                Ok(None)
            }
        }
    }

    async fn forward(&self, command: Value) -> Value {
        match &self.commands {
            Some(sink) => {
                let reply = sink.dispatch(command).await;
                log::debug!("Command reply: {}", reply);
                reply
            }
            None => {
                log::warn!("No router attached, dropping page command");
                serde_json::json!({"success": false, "error": "no router attached"})
            }
        }
    }

    /// Publish a collection status object to the page
    pub async fn write_status(&self, status: &Value) -> Result<()> {
        self.ensure_connected()?;
        write_page_json(self.page.as_ref(), STATUS_KEY, status).await
    }

    /// Handle a message pushed to the page's tab by the router.
    /// Returns whether the message was understood.
    pub async fn handle_message(&self, message: &Value) -> Result<bool> {
        match message.get("action").and_then(Value::as_str) {
            Some("updateTVCStatus") => {
                let status = message.get("status").cloned().unwrap_or(Value::Null);
                self.write_status(&status).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
