//! Bulk collection across expirations
//!
//! [`job`] holds the state machine the router owns; [`runner`] walks the
//! expirations of one chain tab and saves the resulting snapshot.

pub mod job;
pub mod runner;

pub use job::{CollectionJob, JobStatus};
pub use runner::{ChainSource, CollectionOutcome, CollectionProgress, Collector, NullProgress};
