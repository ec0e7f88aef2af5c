//! Unified error types for Herald.

use thiserror::Error;

/// Result type alias using HeraldError.
pub type Result<T> = std::result::Result<T, HeraldError>;

#[derive(Error, Debug)]
pub enum HeraldError {
    // Configuration errors: terminal on the item, never auto-retried
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Invalid targeting: {0}")]
    Targeting(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Provider/transport errors: transient, drive the fallback cascade
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("HTTP error: {0}")]
    Http(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl HeraldError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }

    pub fn targeting(msg: impl Into<String>) -> Self {
        Self::Targeting(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// True for errors that must disable the item rather than be retried.
    pub fn is_terminal_for_item(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Schedule(_) | Self::Targeting(_)
        )
    }
}
