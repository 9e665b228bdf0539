//! Tree mutation handlers
//!
//! The host calls these from its change notifications, inside the
//! transaction that made the change:
//!
//! - content updates, moves and marker additions at commit time
//! - deletes at first event, while the node can still be walked
//!
//! Quota limits are enforced synchronously here. Accepted deltas are only
//! recorded in the [`QuotaTransaction`]; nothing touches a usage counter
//! until the host reports the commit.

use crate::config::QuotaConfig;
use crate::error::{QuotaError, Result};
use crate::quota::aggregator::QuotaTransaction;
use crate::quota::applier::AsyncApplier;
use crate::quota::calculator::SizeCalculator;
use crate::quota::job::ReconciliationJob;
use crate::quota::queue::UpdateQueue;
use crate::quota::resolver::QuotaResolver;
use crate::quota::retry::RetryPolicy;
use crate::store::{AttributeStore, NodeRef, QuotaProperty, TreeStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where committed deltas go. Exactly one per deployment.
pub enum Delivery {
    /// Applied right after commit by the worker pool
    WorkerPool(AsyncApplier),
    /// Parked until the incremental job drains them
    JobQueue(Arc<UpdateQueue>),
}

pub struct FolderQuotaService {
    store: Arc<dyn TreeStore>,
    resolver: QuotaResolver,
    calculator: SizeCalculator,
    delivery: Delivery,
    policy: RetryPolicy,
    update_on_marker_add: bool,
}

impl FolderQuotaService {
    /// Build the service and its delivery path from configuration.
    ///
    /// Must run inside a tokio runtime: the worker pool starts here.
    pub fn new<S>(store: Arc<S>, config: &QuotaConfig) -> Self
    where
        S: TreeStore + AttributeStore + 'static,
    {
        let policy = config.worker_pool.retry_policy();

        let delivery = if config.quota.use_job_queue {
            info!(
                "Folder quota changes go to the {:?} update queue",
                config.quota.queue_strategy
            );
            Delivery::JobQueue(Arc::new(UpdateQueue::new(
                config.quota.queue_strategy,
                Arc::clone(&store),
                policy.clone(),
            )))
        } else {
            Delivery::WorkerPool(AsyncApplier::spawn(
                Arc::clone(&store) as Arc<dyn TreeStore>,
                config.worker_pool.pool_size,
                policy.clone(),
            ))
        };

        Self::with_delivery(store, delivery, config)
    }

    pub fn with_delivery(store: Arc<dyn TreeStore>, delivery: Delivery, config: &QuotaConfig) -> Self {
        Self {
            resolver: QuotaResolver::new(Arc::clone(&store), config.quota.max_ancestor_depth),
            calculator: SizeCalculator::new(Arc::clone(&store)),
            store,
            delivery,
            policy: config.worker_pool.retry_policy(),
            update_on_marker_add: config.quota.update_on_marker_add,
        }
    }

    pub fn resolver(&self) -> &QuotaResolver {
        &self.resolver
    }

    pub fn calculator(&self) -> &SizeCalculator {
        &self.calculator
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// The update queue, when deltas are delivered through one
    pub fn queue(&self) -> Option<Arc<UpdateQueue>> {
        match &self.delivery {
            Delivery::JobQueue(queue) => Some(Arc::clone(queue)),
            Delivery::WorkerPool(_) => None,
        }
    }

    /// Reconciliation job sharing this service's store and queue
    pub fn reconciliation_job(&self) -> ReconciliationJob {
        ReconciliationJob::new(Arc::clone(&self.store), self.queue(), self.policy.clone())
    }

    pub fn begin(&self) -> QuotaTransaction {
        QuotaTransaction::new()
    }

    /// A file's content changed. `before` is `None` for a new file, `after`
    /// is `None` when the content was removed.
    pub async fn on_content_update(
        &self,
        txn: &mut QuotaTransaction,
        node: &NodeRef,
        before: Option<u64>,
        after: Option<u64>,
    ) -> Result<()> {
        ensure_active(txn)?;
        let change = size_to_delta(after.unwrap_or(0)) - size_to_delta(before.unwrap_or(0));
        debug!("Content of {} changed by {}", node, change);
        if change == 0 {
            return Ok(());
        }

        match self.resolver.resolve(node).await? {
            Some(folder) => self.stage_change(txn, &folder, change).await,
            None => Ok(()),
        }
    }

    /// A node moved from `old_parent` to `new_parent`
    pub async fn on_move(
        &self,
        txn: &mut QuotaTransaction,
        node: &NodeRef,
        old_parent: &NodeRef,
        new_parent: &NodeRef,
    ) -> Result<()> {
        ensure_active(txn)?;
        let before = self.resolver.resolve(old_parent).await?;
        let after = self.resolver.resolve(new_parent).await?;

        if before == after {
            // no quota involved, or a move inside one quota folder
            return Ok(());
        }

        let size = size_to_delta(self.calculator.change_size(node).await?);
        if size == 0 {
            return Ok(());
        }

        if let Some(folder) = &before {
            debug!("{} moved out of quota folder {}, change {}", node, folder, -size);
            self.stage_change(txn, folder, -size).await?;
        }
        if let Some(folder) = &after {
            debug!("{} moved into quota folder {}, change {}", node, folder, size);
            self.stage_change(txn, folder, size).await?;
        }
        Ok(())
    }

    /// A node is about to be deleted; it and its subtree can still be read
    pub async fn before_delete(&self, txn: &mut QuotaTransaction, node: &NodeRef) -> Result<()> {
        ensure_active(txn)?;
        let Some(folder) = self.resolver.resolve(node).await? else {
            return Ok(());
        };

        let size = size_to_delta(self.calculator.change_size(node).await?);
        if size == 0 {
            return Ok(());
        }
        self.stage_change(txn, &folder, -size).await
    }

    /// The quota marker was just put on `folder`
    pub async fn on_marker_added(&self, txn: &mut QuotaTransaction, folder: &NodeRef) -> Result<()> {
        ensure_active(txn)?;
        if !self.update_on_marker_add || !self.store.has_quota_marker(folder).await? {
            return Ok(());
        }

        // initial usage is never blocked by the limit
        let size = size_to_delta(self.calculator.folder_size(folder).await?);
        debug!("Initial usage of new quota folder {} is {}", folder, size);
        txn.record_delta(folder, size);
        Ok(())
    }

    /// Hand the merged deltas of a committed transaction to the delivery
    /// path. Returns how many folder updates were dispatched.
    pub async fn commit(&self, txn: QuotaTransaction) -> Result<usize> {
        if let Some(reason) = txn.rollback_reason() {
            debug!("Discarding quota changes of rolled back transaction {}: {}", txn.id(), reason);
            return Err(QuotaError::TransactionRolledBack);
        }

        let id = txn.id();
        let changes = txn.into_batch().into_changes();
        let count = changes.len();

        match &self.delivery {
            Delivery::WorkerPool(applier) => {
                for change in changes {
                    applier.submit(change)?;
                }
            }
            Delivery::JobQueue(queue) => queue.enqueue_all(changes).await?,
        }

        if count > 0 {
            debug!("Transaction {} dispatched {} folder usage updates", id, count);
        }
        Ok(count)
    }

    pub fn rollback(&self, txn: QuotaTransaction) {
        let id = txn.id();
        let discarded = txn.into_batch().into_changes().len();
        debug!(
            "Transaction {} rolled back, discarding {} pending quota changes",
            id, discarded
        );
    }

    /// Stop the delivery path. The worker pool finishes queued units; a
    /// volatile queue gets one last drain and whatever still fails to apply
    /// is dropped with a warning. Durable entries stay for the next start.
    pub async fn shutdown(self) -> Result<()> {
        match self.delivery {
            Delivery::WorkerPool(applier) => {
                let snapshot = applier.shutdown().await;
                if snapshot.failed > 0 {
                    warn!(
                        "{} folder usage updates failed; usage stays off until the next recalculation",
                        snapshot.failed
                    );
                }
            }
            Delivery::JobQueue(queue) => {
                if let UpdateQueue::Volatile(volatile) = queue.as_ref() {
                    let report = volatile.drain_and_apply().await;
                    let lost = report.failed + volatile.take_pending().len();
                    if lost > 0 {
                        warn!(
                            "Dropped {} volatile folder usage updates on shutdown; usage stays off until the next recalculation",
                            lost
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Enforce the limit and record an accepted delta
    async fn stage_change(&self, txn: &mut QuotaTransaction, folder: &NodeRef, delta: i64) -> Result<()> {
        let Some(limit) = self.store.property(folder, QuotaProperty::SizeQuota).await? else {
            warn!("Folder {} has the quota marker but no quota set", folder);
            return Ok(());
        };

        if delta > 0 {
            let stored = self
                .store
                .property(folder, QuotaProperty::SizeCurrent)
                .await?
                .unwrap_or(0);
            // a corrupt stored counter must not panic the host transaction
            let usage = stored.saturating_add(txn.pending(folder));

            if usage.saturating_add(delta) > limit {
                warn!(
                    "A change of {} bytes to folder {} failed due to quota ({} used of {})",
                    delta, folder, usage, limit
                );
                txn.mark_rollback_only(format!("quota exceeded on {}", folder));
                return Err(QuotaError::QuotaExceeded {
                    folder: folder.clone(),
                    usage,
                    delta,
                    limit,
                });
            }
        }

        txn.record_delta(folder, delta);
        Ok(())
    }
}

fn ensure_active(txn: &QuotaTransaction) -> Result<()> {
    if txn.is_rollback_only() {
        return Err(QuotaError::TransactionRolledBack);
    }
    Ok(())
}

fn size_to_delta(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
