//! Application-wide error types.
//!
//! Every fatal condition maps to a distinct variant with a stable
//! [`SettlementError::code`], so callers can tell "nothing to do" apart from
//! "not allowed" and "malformed input".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Round has no registered campaigns")]
    NoCampaigns,

    #[error("Round has no matching pool")]
    NoMatchingPool,

    #[error("No valid recipients to pay out")]
    NoValidRecipients,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SettlementError {
    /// Stable machine-readable identifier for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::Forbidden(_) => "forbidden",
            Self::NoCampaigns => "no_campaigns",
            Self::NoMatchingPool => "no_matching_pool",
            Self::NoValidRecipients => "no_valid_recipients",
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
