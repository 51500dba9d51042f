//! Per-instrument position store.
//!
//! The in-memory map is authoritative: every mutation applies synchronously
//! and a read right after a write sees it. Persisting to the durable store
//! happens after each mutation; a failed write is logged and retried with the
//! next mutation or [`PositionStore::save`].

use crate::error::Result;
use crate::model::{Greeks, InstrumentPositionSet, OptionRecord, POSITIONS_KEY, Quote, Side, parse_expiration};
use crate::store::durable::{DurableStore, get_json, set_json};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Fields needed to start tracking a scraped option
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub side: Side,
    pub strike: f64,
    pub expiration_label: String,
    pub quote: Quote,
    pub greeks: Greeks,
}

/// Owner of the instrument → positions map and its durable copy
pub struct PositionStore {
    positions: InstrumentPositionSet,
    durable: Arc<dyn DurableStore>,
    dirty: bool,
}

impl PositionStore {
    /// Empty store bound to a durable backend; call [`load`](Self::load) at context start
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            positions: InstrumentPositionSet::new(),
            durable,
            dirty: false,
        }
    }

    /// Replace the in-memory view with the durable copy
    pub async fn load(&mut self) -> Result<()> {
        let stored: Option<InstrumentPositionSet> = get_json(self.durable.as_ref(), POSITIONS_KEY).await?;
        self.positions = stored.unwrap_or_default();
        self.positions.retain(|_, records| !records.is_empty());
        self.dirty = false;
        log::debug!("Loaded positions for {} instruments", self.positions.len());
        Ok(())
    }

    /// Re-read the durable copy, unless local changes are still unsaved
    pub async fn refresh(&mut self) -> Result<()> {
        if self.dirty {
            self.save().await
        } else {
            self.load().await
        }
    }

    /// Write the whole map to the durable store
    pub async fn save(&mut self) -> Result<()> {
        match set_json(self.durable.as_ref(), POSITIONS_KEY, &self.positions).await {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                Err(e)
            }
        }
    }

    async fn persist(&mut self) {
        self.dirty = true;
        if let Err(e) = self.save().await {
            log::warn!("Failed to persist positions, keeping in-memory state: {}", e);
        }
    }

    /// Start tracking an option. Returns the new record's id.
    pub async fn add(&mut self, ticker: &str, position: NewPosition) -> String {
        let sequence = self.positions.entry(ticker.to_string()).or_default();
        let id = unique_id(sequence);
        let today = Utc::now().date_naive();

        sequence.push(OptionRecord {
            id: id.clone(),
            side: position.side,
            strike: position.strike,
            expiration_iso: parse_expiration(&position.expiration_label, today),
            expiration_label: position.expiration_label,
            quantity: 1,
            entry_price: position.quote.mid(),
            bid: position.quote.bid,
            ask: position.quote.ask,
            last_price: position.quote.price,
            volume: position.quote.volume,
            implied_volatility: position.quote.iv,
            greeks: position.greeks,
            added_at: Utc::now(),
        });
        log::info!("Added {} {} {} ({})", ticker, position.side, position.strike, id);

        self.persist().await;
        id
    }

    /// Stop tracking one record; drops the ticker once it has no records left
    pub async fn remove(&mut self, ticker: &str, id: &str) -> bool {
        let Some(sequence) = self.positions.get_mut(ticker) else {
            return false;
        };
        let before = sequence.len();
        sequence.retain(|r| r.id != id);
        let removed = sequence.len() != before;
        if sequence.is_empty() {
            self.positions.shift_remove(ticker);
        }
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Clear one ticker, or everything when `ticker` is `None`
    pub async fn clear(&mut self, ticker: Option<&str>) {
        match ticker {
            Some(ticker) => {
                self.positions.shift_remove(ticker);
            }
            None => self.positions.clear(),
        }
        self.persist().await;
    }

    /// Change a record's quantity by `delta`, never below 1
    pub async fn adjust_quantity(&mut self, ticker: &str, id: &str, delta: i64) -> Option<u32> {
        let record = self
            .positions
            .get_mut(ticker)
            .and_then(|sequence| sequence.iter_mut().find(|r| r.id == id))?;

        let quantity = (i64::from(record.quantity) + delta).clamp(1, i64::from(u32::MAX)) as u32;
        record.quantity = quantity;
        self.persist().await;
        Some(quantity)
    }

    /// Replace one ticker's whole sequence; an empty sequence removes the ticker
    pub async fn replace(&mut self, ticker: &str, records: Vec<OptionRecord>) {
        if records.is_empty() {
            self.positions.shift_remove(ticker);
        } else {
            self.positions.insert(ticker.to_string(), records);
        }
        self.persist().await;
    }

    /// Point a record at another expiration and take that expiration's quotes.
    /// Id, quantity, entry price and greeks are kept, so the fingerprint does not move.
    pub async fn move_to_expiration(&mut self, ticker: &str, id: &str, expiration_label: &str, quote: &Quote) -> bool {
        let Some(record) = self
            .positions
            .get_mut(ticker)
            .and_then(|sequence| sequence.iter_mut().find(|r| r.id == id))
        else {
            return false;
        };

        record.expiration_iso = parse_expiration(expiration_label, Utc::now().date_naive());
        record.expiration_label = expiration_label.to_string();
        record.bid = quote.bid;
        record.ask = quote.ask;
        record.last_price = quote.price;
        record.volume = quote.volume;
        record.implied_volatility = quote.iv;
        log::info!("Moved {} {} to {}", ticker, id, expiration_label);

        self.persist().await;
        true
    }

    pub fn get(&self, ticker: &str) -> &[OptionRecord] {
        self.positions.get(ticker).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> &InstrumentPositionSet {
        &self.positions
    }

    pub fn contains_ticker(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn position_count(&self) -> usize {
        self.positions.values().map(Vec::len).sum()
    }

    /// Whether the last persist attempt failed
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn unique_id(existing: &[OptionRecord]) -> String {
    loop {
        let id = format!(
            "{}{:03}",
            Utc::now().timestamp_millis(),
            ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1000
        );
        if !existing.iter().any(|r| r.id == id) {
            return id;
        }
    }
}
