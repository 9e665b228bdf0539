use crate::error::QuotaError;
use crate::store::NodeRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace every durable queue entry is filed under
pub const UPDATE_QUEUE_NAMESPACE: &str = "..FOLDER_QUOTA_UPDATE..";

/// Signed byte change destined for one quota folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeChange {
    pub folder: NodeRef,
    pub delta: i64,
}

impl SizeChange {
    pub fn new(folder: NodeRef, delta: i64) -> Self {
        Self { folder, delta }
    }
}

/// Durable queue key; unique for the lifetime of one process start
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub namespace: String,
    /// Process start, milliseconds since the epoch
    pub start_time: i64,
    pub sequence: u64,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.start_time, self.sequence)
    }
}

/// A persisted [`SizeChange`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: QueueKey,
    pub change: SizeChange,
}

/// Reconciliation job mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Recompute every quota folder from the live tree
    #[default]
    Recalculate,
    /// Drain the update queue
    Incremental,
}

impl FromStr for JobMode {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // older schedules carry the misspelt mode name
            "recalculate" | "recalcultate" => Ok(JobMode::Recalculate),
            "incremental" => Ok(JobMode::Incremental),
            other => Err(QuotaError::InvalidJobMode(other.to_string())),
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMode::Recalculate => f.write_str("recalculate"),
            JobMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Outcome of one queue drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub applied: usize,
    /// Target folder no longer exists
    pub dropped: usize,
    pub failed: usize,
}

/// Outcome of one full recalculation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationReport {
    pub folders: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JobReport {
    Recalculate(RecalculationReport),
    Incremental(DrainReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_mode_parse() {
        assert_eq!("recalculate".parse::<JobMode>().unwrap(), JobMode::Recalculate);
        assert_eq!("Recalcultate".parse::<JobMode>().unwrap(), JobMode::Recalculate);
        assert_eq!(" INCREMENTAL ".parse::<JobMode>().unwrap(), JobMode::Incremental);
        assert!(matches!(
            "nightly".parse::<JobMode>(),
            Err(QuotaError::InvalidJobMode(_))
        ));
    }

    #[test]
    fn test_job_mode_default() {
        assert_eq!(JobMode::default(), JobMode::Recalculate);
    }

    #[test]
    fn test_queue_key_order() {
        let a = QueueKey {
            namespace: UPDATE_QUEUE_NAMESPACE.to_string(),
            start_time: 10,
            sequence: 2,
        };
        let b = QueueKey {
            sequence: 10,
            ..a.clone()
        };
        let c = QueueKey {
            start_time: 11,
            sequence: 1,
            ..a.clone()
        };
        assert!(a < b);
        assert!(b < c);
    }
}
