use thiserror::Error;
use tracing::{error, warn};

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for MonitorError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Voter {voter_id} already voted for position {position_id}")]
    DuplicateVote { voter_id: i64, position_id: i64 },

    #[error("Chain tail kept moving after {0} append attempts")]
    ChainContention(u32),

    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    #[error("Detector state error: {0}")]
    StateError(String),

    #[error("Change stream error: {0}")]
    StreamError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Missing mail credentials: {0}")]
    MissingCredentials(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Background task error: {0}")]
    TaskError(String),
}

impl MonitorError {
    /// Transient infrastructure failures that background loops retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::IoError(_) | Self::StreamError(_)
        )
    }

    /// Log a failed background step: transient failures at warn, the rest at error.
    pub fn log_failure(&self, context: &str) {
        if self.is_transient() {
            warn!("{}: {}", context, self);
        } else {
            error!("{}: {}", context, self);
        }
    }

    pub fn alert_not_found(id: i64) -> Self {
        Self::NotFound(format!("Alert {} does not exist", id))
    }
}
