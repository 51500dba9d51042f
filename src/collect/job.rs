use crate::error::{BridgeError, Result};
use crate::router::host::TabId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a bulk collection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// The single collection job owned by the router.
///
/// `idle → running → done | error → idle`. A second start while running is
/// rejected; the terminal state is cleared once someone has observed it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionJob {
    pub tab_id: Option<TabId>,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub collected_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip)]
    finished: Option<Instant>,
}

impl CollectionJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Time left before another job may start
    pub fn cooldown_remaining(&self, cooldown: Duration) -> Option<Duration> {
        let elapsed = self.finished?.elapsed();
        cooldown.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    /// `idle | done | error → running`
    pub fn start(&mut self, tab: TabId) -> Result<()> {
        self.reserve()?;
        self.tab_id = Some(tab);
        Ok(())
    }

    /// Enter `running` before the chain tab exists; the tab is attached later
    pub fn reserve(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(BridgeError::CollectionBusy);
        }
        self.tab_id = None;
        self.status = JobStatus::Running;
        self.progress_percent = 0;
        self.collected_count = 0;
        self.status_text = None;
        self.error_message = None;
        Ok(())
    }

    pub fn progress(&mut self, percent: u8, collected: usize, text: impl Into<String>) {
        if self.is_running() {
            self.progress_percent = percent.min(100);
            self.collected_count = collected;
            self.status_text = Some(text.into());
        }
    }

    /// `running → done`, optionally carrying a note about failed expirations
    pub fn finish(&mut self, collected: usize, note: Option<String>) {
        self.status = JobStatus::Done;
        self.progress_percent = 100;
        self.collected_count = collected;
        self.error_message = note;
        self.finished = Some(Instant::now());
    }

    /// `running → error`
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Error;
        self.error_message = Some(message.into());
        self.finished = Some(Instant::now());
    }

    /// Observe the job; a terminal job goes back to idle afterwards.
    /// Returns the state as it was before the reset.
    pub fn acknowledge(&mut self) -> CollectionJob {
        let seen = self.clone();
        if self.status.is_terminal() {
            let finished = self.finished;
            *self = CollectionJob {
                finished,
                ..CollectionJob::default()
            };
        }
        seen
    }
}
