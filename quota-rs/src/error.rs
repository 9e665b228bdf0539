use thiserror::Error;

use crate::quota::types::QueueKey;
use crate::store::NodeRef;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Quota exceeded on folder {folder}: usage {usage} + change {delta} > limit {limit}")]
    QuotaExceeded {
        folder: NodeRef,
        usage: i64,
        delta: i64,
        limit: i64,
    },

    #[error("Transaction was marked for rollback")]
    TransactionRolledBack,

    #[error("Node not found: {0}")]
    NodeNotFound(NodeRef),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<QuotaError>,
    },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Duplicate update queue key: {0}")]
    QueueKeyCollision(QueueKey),

    #[error("Invalid node reference: {0}")]
    InvalidNodeRef(String),

    #[error("Invalid job mode: {0}")]
    InvalidJobMode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuotaError {
    /// Whether re-running the same unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QuotaError::Conflict(_) => true,
            QuotaError::Database(sqlx::Error::PoolTimedOut) => true,
            QuotaError::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                // SQLITE_BUSY / SQLITE_LOCKED, including their extended codes
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The target of the update no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            QuotaError::NodeNotFound(_) => true,
            QuotaError::RetriesExhausted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
