//! Nearest quota folder lookup

use crate::error::Result;
use crate::store::{NodeRef, TreeStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Walks a node's ancestor chain to the nearest folder carrying the quota
/// marker. Nothing is cached; the tree can change between calls.
pub struct QuotaResolver {
    store: Arc<dyn TreeStore>,
    max_depth: usize,
}

impl QuotaResolver {
    pub fn new(store: Arc<dyn TreeStore>, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// The node itself if marked, else its nearest marked ancestor.
    ///
    /// Missing nodes, reaching the root, and walks deeper than `max_depth`
    /// (a cycle in the host tree) all resolve to `None`.
    pub async fn resolve(&self, node: &NodeRef) -> Result<Option<NodeRef>> {
        let mut current = node.clone();

        for _ in 0..=self.max_depth {
            if !self.store.exists(&current).await? {
                debug!("Node {} does not exist, no quota folder", current);
                return Ok(None);
            }

            if self.store.has_quota_marker(&current).await? {
                debug!("Quota folder for {} is {}", node, current);
                return Ok(Some(current));
            }

            match self.store.parent(&current).await? {
                Some(parent) => current = parent,
                None => {
                    debug!("Reached the root above {}, no quota folder", node);
                    return Ok(None);
                }
            }
        }

        warn!(
            "Gave up looking for a quota folder above {} after {} levels",
            node, self.max_depth
        );
        Ok(None)
    }
}
