//! Worker-pool delivery of committed deltas
//!
//! # Architecture
//! ```text
//! commit ──submit──▶ [unbounded channel] ──▶ worker 1 ─┐
//!                                        ├──▶ worker 2 ─┼─▶ add_to_usage (retried)
//!                                        └──▶ worker N ─┘
//! ```
//!
//! Each delta is its own unit of work: one store transaction doing the
//! read-modify-write on the folder's counter, retried on conflict. The
//! submitting transaction never waits for it.

use crate::error::{QuotaError, Result};
use crate::quota::retry::{retry_transaction, RetryPolicy};
use crate::quota::types::SizeChange;
use crate::store::TreeStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What happened to one delta
#[derive(Debug)]
pub enum ApplyOutcome {
    /// New counter value
    Applied(i64),
    /// Target folder no longer exists
    Dropped,
    Failed(QuotaError),
}

/// Apply one delta to its folder's counter with retry-on-conflict
pub async fn apply_size_change(
    store: &dyn TreeStore,
    policy: &RetryPolicy,
    change: &SizeChange,
) -> ApplyOutcome {
    let result = retry_transaction(policy, "folder usage update", move || {
        store.add_to_usage(&change.folder, change.delta)
    })
    .await;

    match result {
        Ok(updated) => {
            debug!(
                "Folder usage on {} changed by {} to {}",
                change.folder, change.delta, updated
            );
            ApplyOutcome::Applied(updated)
        }
        Err(e) if e.is_not_found() => {
            debug!(
                "Unable to update folder usage on {}: folder no longer exists",
                change.folder
            );
            ApplyOutcome::Dropped
        }
        Err(e) => {
            error!(
                "Failed to update folder usage on {} by {}: {}",
                change.folder, change.delta, e
            );
            ApplyOutcome::Failed(e)
        }
    }
}

#[derive(Debug, Default)]
struct ApplierStats {
    submitted: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl ApplierStats {
    fn record(&self, outcome: &ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Applied(_) => &self.applied,
            ApplyOutcome::Dropped => &self.dropped,
            ApplyOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ApplierSnapshot {
        ApplierSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierSnapshot {
    pub submitted: u64,
    pub applied: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Bounded pool of workers applying deltas after commit
pub struct AsyncApplier {
    sender: mpsc::UnboundedSender<SizeChange>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ApplierStats>,
}

impl AsyncApplier {
    /// Start `pool_size` workers on the current tokio runtime
    pub fn spawn(store: Arc<dyn TreeStore>, pool_size: usize, policy: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<SizeChange>();
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(ApplierStats::default());
        let pool_size = pool_size.max(1);

        let workers = (0..pool_size)
            .map(|worker| {
                let store = Arc::clone(&store);
                let receiver = Arc::clone(&receiver);
                let stats = Arc::clone(&stats);
                let policy = policy.clone();
                tokio::spawn(async move {
                    loop {
                        // only one idle worker waits on the channel at a time
                        let next = receiver.lock().await.recv().await;
                        let Some(change) = next else { break };

                        let outcome = apply_size_change(store.as_ref(), &policy, &change).await;
                        stats.record(&outcome);
                    }
                    debug!("Quota applier worker {} stopped", worker);
                })
            })
            .collect();

        info!("Started quota applier with {} workers", pool_size);

        Self {
            sender,
            workers,
            stats,
        }
    }

    /// Hand a delta to the pool without waiting for it to be applied
    pub fn submit(&self, change: SizeChange) -> Result<()> {
        self.sender.send(change).map_err(|_| QuotaError::PoolClosed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn snapshot(&self) -> ApplierSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting work, let the workers finish what is queued, and
    /// return the final counters.
    pub async fn shutdown(self) -> ApplierSnapshot {
        let Self {
            sender,
            workers,
            stats,
        } = self;
        drop(sender);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Quota applier worker panicked: {}", e);
            }
        }

        let snapshot = stats.snapshot();
        info!(
            "Quota applier stopped: {} applied, {} dropped, {} failed",
            snapshot.applied, snapshot.dropped, snapshot.failed
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockTreeStore, NodeRef};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut store = MockTreeStore::new();
        store.expect_add_to_usage().returning(move |_, delta| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(QuotaError::Conflict("locked".to_string()))
            } else {
                Ok(100 + delta)
            }
        });

        let change = SizeChange::new(NodeRef::workspace("q"), 5);
        let outcome = apply_size_change(&store, &fast_policy(), &change).await;

        assert!(matches!(outcome, ApplyOutcome::Applied(105)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_folder_is_dropped() {
        let mut store = MockTreeStore::new();
        store
            .expect_add_to_usage()
            .returning(|folder, _| Err(QuotaError::NodeNotFound(folder.clone())));

        let change = SizeChange::new(NodeRef::workspace("gone"), 5);
        let outcome = apply_size_change(&store, &fast_policy(), &change).await;
        assert!(matches!(outcome, ApplyOutcome::Dropped));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let mut store = MockTreeStore::new();
        store
            .expect_add_to_usage()
            .times(3)
            .returning(|_, _| Err(QuotaError::Conflict("locked".to_string())));

        let change = SizeChange::new(NodeRef::workspace("q"), 5);
        let outcome = apply_size_change(&store, &fast_policy(), &change).await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(QuotaError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_failure_isolated_per_folder() {
        let mut store = MockTreeStore::new();
        store.expect_add_to_usage().returning(|folder, delta| {
            match folder.id.as_str() {
                "broken" => Err(QuotaError::Database(sqlx::Error::RowNotFound)),
                "gone" => Err(QuotaError::NodeNotFound(folder.clone())),
                _ => Ok(delta),
            }
        });

        let applier = AsyncApplier::spawn(Arc::new(store), 2, fast_policy());
        applier
            .submit(SizeChange::new(NodeRef::workspace("broken"), 1))
            .unwrap();
        applier
            .submit(SizeChange::new(NodeRef::workspace("gone"), 1))
            .unwrap();
        applier
            .submit(SizeChange::new(NodeRef::workspace("ok-1"), 1))
            .unwrap();
        applier
            .submit(SizeChange::new(NodeRef::workspace("ok-2"), 1))
            .unwrap();

        let snapshot = applier.shutdown().await;
        assert_eq!(
            snapshot,
            ApplierSnapshot {
                submitted: 4,
                applied: 2,
                dropped: 1,
                failed: 1,
            }
        );
    }
}
