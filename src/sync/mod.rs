//! Page ↔ extension synchronization
//!
//! - [`fingerprint`]: id-only change detection
//! - [`page`]: the calculator's storage and record shape
//! - [`bridge`]: one reconciliation pass
//! - [`scheduler`]: poll and notification triggers

pub mod bridge;
pub mod fingerprint;
pub mod page;
pub mod scheduler;

pub use bridge::{CommandSink, SyncBridge, SyncReport};
pub use fingerprint::{Fingerprint, Identified, fingerprint};
pub use page::{CalculatorState, MemoryPageStorage, PageOption, PageStorage};
pub use scheduler::{StopReason, SyncHandle, SyncOutcome, SyncScheduler};
