//! Tree/property store contract
//!
//! The engine never owns the tree. It reads structure and sizes through
//! [`TreeStore`], writes only the usage counter, and persists durable queue
//! entries through [`AttributeStore`].
//!
//! - [`sqlite`]: reference host store backed by SQLite

pub mod sqlite;

pub use sqlite::SqliteTreeStore;

use crate::error::{QuotaError, Result};
use crate::quota::types::{QueueEntry, QueueKey, SizeChange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which area of the store a node lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProtocol {
    Workspace,
    /// Soft-deleted nodes; never counted against a quota
    Archive,
}

impl StoreProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreProtocol::Workspace => "workspace",
            StoreProtocol::Archive => "archive",
        }
    }
}

impl FromStr for StoreProtocol {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "workspace" => Ok(StoreProtocol::Workspace),
            "archive" => Ok(StoreProtocol::Archive),
            other => Err(QuotaError::InvalidNodeRef(format!(
                "unknown store protocol '{}'",
                other
            ))),
        }
    }
}

/// Node identity, rendered as `protocol://id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub protocol: StoreProtocol,
    pub id: String,
}

impl NodeRef {
    pub fn workspace(id: impl Into<String>) -> Self {
        Self {
            protocol: StoreProtocol::Workspace,
            id: id.into(),
        }
    }

    pub fn archive(id: impl Into<String>) -> Self {
        Self {
            protocol: StoreProtocol::Archive,
            id: id.into(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.protocol == StoreProtocol::Archive
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.as_str(), self.id)
    }
}

impl FromStr for NodeRef {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, id) = s
            .split_once("://")
            .ok_or_else(|| QuotaError::InvalidNodeRef(s.to_string()))?;
        if id.is_empty() {
            return Err(QuotaError::InvalidNodeRef(s.to_string()));
        }
        Ok(Self {
            protocol: protocol.parse()?,
            id: id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    File,
}

/// Properties the quota marker carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaProperty {
    /// Configured limit in bytes
    SizeQuota,
    /// Running usage counter in bytes
    SizeCurrent,
}

/// Read access to the host tree plus writes to the usage counter
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn exists(&self, node: &NodeRef) -> Result<bool>;

    /// `None` when the node does not exist
    async fn node_kind(&self, node: &NodeRef) -> Result<Option<NodeKind>>;

    /// Content byte size; `None` when the node has no content payload
    async fn content_size(&self, node: &NodeRef) -> Result<Option<u64>>;

    async fn children(&self, folder: &NodeRef) -> Result<Vec<NodeRef>>;

    async fn parent(&self, node: &NodeRef) -> Result<Option<NodeRef>>;

    async fn has_quota_marker(&self, node: &NodeRef) -> Result<bool>;

    async fn property(&self, node: &NodeRef, property: QuotaProperty) -> Result<Option<i64>>;

    async fn set_property(&self, node: &NodeRef, property: QuotaProperty, value: i64)
        -> Result<()>;

    /// Every node carrying the quota marker
    async fn quota_folders(&self) -> Result<Vec<NodeRef>>;

    /// Read the counter (absent = 0), add `delta`, write it back, all inside
    /// one store transaction. Fails with `NodeNotFound` if the folder is gone.
    async fn add_to_usage(&self, folder: &NodeRef, delta: i64) -> Result<i64>;
}

/// Uniquely keyed persisted attributes backing the durable update queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttributeStore: Send + Sync {
    /// Fails with `QueueKeyCollision` if the key is already taken
    async fn create_attribute(&self, key: &QueueKey, change: &SizeChange) -> Result<()>;

    /// Persist every entry or none of them, in one store transaction
    async fn create_attributes(&self, entries: &[QueueEntry]) -> Result<()>;

    /// All entries under `namespace`, in key order
    async fn attributes(&self, namespace: &str) -> Result<Vec<QueueEntry>>;

    /// Apply the entry's delta to its folder's counter and remove the entry
    /// in a single store transaction. Returns the new counter value, or
    /// `None` if the entry was already gone (nothing applied).
    async fn apply_and_remove(&self, entry: &QueueEntry) -> Result<Option<i64>>;

    async fn remove_attribute(&self, key: &QueueKey) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_roundtrip() {
        let node: NodeRef = "workspace://abc-123".parse().unwrap();
        assert_eq!(node, NodeRef::workspace("abc-123"));
        assert_eq!(node.to_string(), "workspace://abc-123");
        assert!(!node.is_archived());
    }

    #[test]
    fn test_node_ref_archive() {
        let node: NodeRef = "ARCHIVE://x".parse().unwrap();
        assert!(node.is_archived());
    }

    #[test]
    fn test_node_ref_invalid() {
        assert!("abc".parse::<NodeRef>().is_err());
        assert!("workspace://".parse::<NodeRef>().is_err());
        assert!("ftp://x".parse::<NodeRef>().is_err());
    }
}
