use thiserror::Error;

/// Errors produced by the bridge and its host adapters
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to connect to browser: {0}")]
    ConnectionFailed(String),

    #[error("Tab operation failed: {0}")]
    TabOperationFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Script evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Option chain table not found: {0}")]
    TableNotFound(String),

    #[error("Storage error on key '{key}': {reason}")]
    Storage { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cross-context channel was torn down; callers stop instead of retrying.
    #[error("Context channel closed: {0}")]
    ChannelClosed(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("Collection already running")]
    CollectionBusy,

    #[error("Wait {0}s before the next collection")]
    Cooldown(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn storage(key: impl Into<String>, reason: impl ToString) -> Self {
        BridgeError::Storage {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the peer context is gone for good
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, BridgeError::ChannelClosed(_))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
