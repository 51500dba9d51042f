//! # chain-bridge
//!
//! Scrapes a live option-chain page and keeps three independently-owned
//! stores consistent: the destination calculator's page state, the
//! extension's durable store, and the in-memory position view.
//!
//! ## Features
//!
//! - **Chain Scraping**: Header-driven column mapping with a fixed-offset fallback, tolerant numeric cells
//! - **Position Store**: Per-instrument option positions, in-memory authoritative with durable persistence
//! - **Sync Bridge**: Loop-free page ↔ extension propagation driven by id fingerprints
//! - **Message Router**: `{action, payload}` commands, destination tabs, relays, and bulk collection jobs
//! - **Browser Adapters**: headless_chrome implementations of every host trait
//!
//! ## Parsing a chain page
//!
//! ```rust,no_run
//! use chain_bridge::{BrowserSession, LaunchOptions};
//!
//! # fn main() -> chain_bridge::Result<()> {
//! let session = BrowserSession::launch(LaunchOptions::new().headless(false))?;
//! let tab = session.find_chain_tab()?;
//!
//! let page = BrowserSession::parse_tab(&tab)?;
//! println!("{} options for {}", page.options.len(), page.expiration);
//! # Ok(())
//! # }
//! ```
//!
//! ## Tracking positions
//!
//! ```rust,no_run
//! use chain_bridge::store::{FileStore, NewPosition, PositionStore};
//! use chain_bridge::model::{Greeks, Quote, Side};
//! use std::sync::Arc;
//!
//! # async fn run() -> chain_bridge::Result<()> {
//! let mut positions = PositionStore::new(Arc::new(FileStore::new("store.json")));
//! positions.load().await?;
//!
//! let id = positions
//!     .add(
//!         "ESH2026",
//!         NewPosition {
//!             side: Side::Call,
//!             strike: 6900.0,
//!             expiration_label: "Jan 16".to_string(),
//!             quote: Quote { bid: 12.0, ask: 12.4, price: 12.2, volume: 500, iv: 0.18 },
//!             greeks: Greeks::default(),
//!         },
//!     )
//!     .await;
//! positions.adjust_quantity("ESH2026", &id, 1).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Running the bridge
//!
//! ```rust,no_run
//! use chain_bridge::store::MemoryStore;
//! use chain_bridge::sync::{MemoryPageStorage, SyncBridge, SyncScheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() {
//! let bridge = SyncBridge::new(Arc::new(MemoryPageStorage::new()), Arc::new(MemoryStore::new()));
//! let (handle, task) = SyncScheduler::new(Duration::from_secs(2)).spawn(bridge);
//!
//! // After a local write:
//! handle.tick_now();
//! # let _ = task;
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`browser`]: Browser session management and headless_chrome adapters
//! - [`dom`]: Chain table extraction and tree representation
//! - [`scrape`]: Column mapping, row parsing, and page parsing
//! - [`store`]: Durable store, position store, and market data
//! - [`sync`]: Fingerprints, page translation, and the synchronization bridge
//! - [`router`]: Command protocol and the background coordinator
//! - [`collect`]: Bulk collection job and runner
//! - [`config`]: Runtime configuration
//! - [`error`]: Error types and result aliases

pub mod browser;
pub mod collect;
pub mod config;
pub mod dom;
pub mod error;
pub mod model;
pub mod router;
pub mod scrape;
pub mod store;
pub mod sync;

pub use browser::{BrowserSession, ChromeChain, ChromeHost, ConnectionOptions, LaunchOptions, TabLocalStorage};
pub use collect::{ChainSource, CollectionJob, CollectionOutcome, CollectionProgress, Collector, JobStatus};
pub use config::{BridgeConfig, CollectionConfig, DestinationConfig, SourceConfig};
pub use dom::{DomTree, ElementNode};
pub use error::{BridgeError, Result};
pub use model::{FullChainSnapshot, Greeks, InstrumentPositionSet, OptionRecord, Quote, ScrapedOption, Side};
pub use router::{Background, Command, Message, Response, TabHost, TabId};
pub use scrape::{ColumnLayout, ParsedPage, parse_chain};
pub use store::{DurableStore, FileStore, MemoryStore, PositionStore};
pub use sync::{Fingerprint, PageStorage, SyncBridge, SyncScheduler, fingerprint};
