use std::error::Error;
use std::fmt;

use thiserror::Error;

/// Unified startup error.
///
/// Covers everything that can stop the service before it starts serving
/// (config, database, listener) so `main` can fail in one predictable way.
#[derive(Debug)]
pub enum AppError {
    Config(String),
    Database(String),
    Server(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Config error: {}", msg),
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::Server(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl Error for AppError {}

/// Errors surfaced by notification store and dispatch operations.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification {id} not found")]
    NotFound { id: i64 },

    /// The id is unknown or the notification was already sent. The single
    /// conditional write cannot tell the two apart.
    #[error("notification {id} not found or already sent")]
    NotFoundOrAlreadySent { id: i64 },

    #[error("invalid notification: {message}")]
    Invalid { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
}

impl NotificationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Stable machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NotFoundOrAlreadySent { .. } => "not_found_or_already_sent",
            Self::Invalid { .. } => "invalid",
            Self::Storage(_) => "storage_error",
            Self::Publish(_) => "publish_error",
        }
    }
}

/// Delivery-queue handoff failures.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery queue unavailable: {message}")]
    Unavailable { message: String },
}

/// Channel sender failures. Any of these makes the queue redeliver.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint rejected notification with HTTP {status}")]
    Rejected { status: u16 },

    #[error("transmission failed: {message}")]
    Failed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case_names() {
        assert_eq!(NotificationError::NotFound { id: 1 }.kind(), "not_found");
        assert_eq!(
            NotificationError::NotFoundOrAlreadySent { id: 1 }.kind(),
            "not_found_or_already_sent"
        );
        assert_eq!(NotificationError::invalid("x").kind(), "invalid");
        assert_eq!(
            NotificationError::Storage(sqlx::Error::PoolTimedOut).kind(),
            "storage_error"
        );
    }

    #[test]
    fn display_includes_id() {
        let err = NotificationError::NotFoundOrAlreadySent { id: 42 };
        assert_eq!(err.to_string(), "notification 42 not found or already sent");
    }

    #[test]
    fn app_error_display_is_prefixed() {
        let err = AppError::Config("DATABASE_URL is empty".into());
        assert_eq!(err.to_string(), "Config error: DATABASE_URL is empty");
    }
}
