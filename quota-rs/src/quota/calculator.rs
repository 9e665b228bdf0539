//! Folder sizes and per-mutation size changes

use crate::error::Result;
use crate::store::{NodeKind, NodeRef, TreeStore};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SizeCalculator {
    store: Arc<dyn TreeStore>,
}

impl SizeCalculator {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self { store }
    }

    /// Sum of content sizes of every file beneath `folder`.
    ///
    /// Walks the whole subtree on every call; only use it when an absolute
    /// value is needed. Files without content count as 0, and nodes that
    /// vanish mid-walk are skipped.
    pub async fn folder_size(&self, folder: &NodeRef) -> Result<u64> {
        let mut total: u64 = 0;
        let mut pending = vec![folder.clone()];

        while let Some(current) = pending.pop() {
            for child in self.store.children(&current).await? {
                match self.store.node_kind(&child).await? {
                    Some(NodeKind::Folder) => pending.push(child),
                    Some(NodeKind::File) => {
                        let size = self.store.content_size(&child).await?.unwrap_or(0);
                        total = total.saturating_add(size);
                    }
                    None => debug!("{} vanished while sizing {}", child, folder),
                }
            }
        }

        Ok(total)
    }

    /// Unsigned byte count a mutation of `node` moves; the caller picks
    /// the sign.
    pub async fn change_size(&self, node: &NodeRef) -> Result<u64> {
        if node.is_archived() {
            return Ok(0);
        }

        match self.store.node_kind(node).await? {
            // the subtree cannot be walked file by file once it is gone
            Some(NodeKind::Folder) => self.folder_size(node).await,
            Some(NodeKind::File) => Ok(self.store.content_size(node).await?.unwrap_or(0)),
            None => {
                warn!(
                    "Node {} was not available for size calculation, folder usage reporting may be inaccurate",
                    node
                );
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockTreeStore;

    #[tokio::test]
    async fn test_archived_node_is_zero() {
        // no expectations: the store must not be touched
        let store = MockTreeStore::new();
        let calculator = SizeCalculator::new(Arc::new(store));

        let size = calculator
            .change_size(&NodeRef::archive("old"))
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_zero() {
        let mut store = MockTreeStore::new();
        store.expect_node_kind().returning(|_| Ok(None));

        let calculator = SizeCalculator::new(Arc::new(store));
        let size = calculator
            .change_size(&NodeRef::workspace("gone"))
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_file_without_content_is_zero() {
        let mut store = MockTreeStore::new();
        store.expect_node_kind().returning(|_| Ok(Some(NodeKind::File)));
        store.expect_content_size().returning(|_| Ok(None));

        let calculator = SizeCalculator::new(Arc::new(store));
        let size = calculator
            .change_size(&NodeRef::workspace("thumb"))
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_folder_size_recurses() {
        let mut store = MockTreeStore::new();
        store.expect_children().returning(|node| {
            Ok(match node.id.as_str() {
                "root" => vec![NodeRef::workspace("a"), NodeRef::workspace("sub")],
                "sub" => vec![NodeRef::workspace("b"), NodeRef::workspace("empty")],
                _ => vec![],
            })
        });
        store.expect_node_kind().returning(|node| {
            Ok(Some(match node.id.as_str() {
                "sub" | "empty" | "root" => NodeKind::Folder,
                _ => NodeKind::File,
            }))
        });
        store.expect_content_size().returning(|node| {
            Ok(match node.id.as_str() {
                "a" => Some(100),
                "b" => Some(23),
                _ => None,
            })
        });

        let calculator = SizeCalculator::new(Arc::new(store));
        let root = NodeRef::workspace("root");
        assert_eq!(calculator.folder_size(&root).await.unwrap(), 123);
        assert_eq!(calculator.change_size(&root).await.unwrap(), 123);
        assert_eq!(
            calculator
                .folder_size(&NodeRef::workspace("empty"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_folder_size_saturates() {
        let mut store = MockTreeStore::new();
        store.expect_children().returning(|node| {
            Ok(match node.id.as_str() {
                "root" => vec![NodeRef::workspace("a"), NodeRef::workspace("b")],
                _ => vec![],
            })
        });
        store
            .expect_node_kind()
            .returning(|_| Ok(Some(NodeKind::File)));
        store
            .expect_content_size()
            .returning(|_| Ok(Some(u64::MAX - 1)));

        let calculator = SizeCalculator::new(Arc::new(store));
        let size = calculator
            .folder_size(&NodeRef::workspace("root"))
            .await
            .unwrap();
        assert_eq!(size, u64::MAX);
    }
}
