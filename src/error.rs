//! Error types for change-notification operations.

use crate::native::Status;
use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for registration, binding and decoding.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{operation} failed with {status:?}{}: {message}",
        code.map(|c| format!(" (ORA-{:05})", c)).unwrap_or_default())]
    Native {
        operation: &'static str,
        status: Status,
        code: Option<i32>,
        message: String,
    },

    #[error("Subscription already registered: {0}")]
    DuplicateSubscription(SubscriptionId),

    #[error("Connection released while registering {0}")]
    ConnectionReleased(SubscriptionId),

    #[error("Registration handle for {0} is no longer valid")]
    StaleHandle(SubscriptionId),

    #[error("Statement {statement} is already bound to subscription {bound_to}")]
    AlreadyBound {
        statement: u64,
        bound_to: SubscriptionId,
    },

    #[error("Invalid rowid: {0}")]
    InvalidRowId(String),

    #[error("Unexpected attribute value for {attribute}: expected {expected}")]
    UnexpectedAttribute {
        attribute: &'static str,
        expected: &'static str,
    },

    #[error("Row buffer allocation failed for {rows} rows")]
    RowBuffer { rows: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NotifyError {
    /// Returns the native status if this error came from the client library.
    pub fn status(&self) -> Option<Status> {
        match self {
            NotifyError::Native { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(e: serde_json::Error) -> Self {
        NotifyError::Config(e.to_string())
    }
}

/// Result type for change-notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
