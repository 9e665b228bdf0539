//! Update queue strategies
//!
//! Committed deltas can be parked on a queue and applied later by the
//! incremental reconciliation job instead of going straight to the worker
//! pool. Two strategies share one contract:
//!
//! - [`VolatileQueue`]: in-process FIFO. Anything not drained when the
//!   process dies is lost; the next full recalculation repairs the counters.
//! - [`DurableQueue`]: entries persisted as uniquely keyed attributes in the
//!   store. Each entry's counter write and its removal commit together, so a
//!   crash mid-drain neither loses nor double-applies a delta.
//!
//! Drains are serialized per queue instance. Running drains for the same
//! durable namespace from several processes relies on the store's
//! transaction isolation.

use crate::config::QueueStrategy;
use crate::error::{QuotaError, Result};
use crate::quota::applier::{apply_size_change, ApplyOutcome};
use crate::quota::retry::{retry_transaction, RetryPolicy};
use crate::quota::types::{DrainReport, QueueEntry, QueueKey, SizeChange, UPDATE_QUEUE_NAMESPACE};
use crate::store::{AttributeStore, TreeStore};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Queue selected by configuration at startup
pub enum UpdateQueue {
    Volatile(VolatileQueue),
    Durable(DurableQueue),
}

impl UpdateQueue {
    pub fn new<S>(strategy: QueueStrategy, store: Arc<S>, policy: RetryPolicy) -> Self
    where
        S: TreeStore + AttributeStore + 'static,
    {
        match strategy {
            QueueStrategy::Volatile => UpdateQueue::Volatile(VolatileQueue::new(store, policy)),
            QueueStrategy::Durable => UpdateQueue::Durable(DurableQueue::new(store, policy)),
        }
    }

    pub fn strategy(&self) -> QueueStrategy {
        match self {
            UpdateQueue::Volatile(_) => QueueStrategy::Volatile,
            UpdateQueue::Durable(_) => QueueStrategy::Durable,
        }
    }

    pub async fn enqueue(&self, change: SizeChange) -> Result<()> {
        match self {
            UpdateQueue::Volatile(queue) => {
                queue.enqueue(change);
                Ok(())
            }
            UpdateQueue::Durable(queue) => queue.enqueue(change).await.map(|_| ()),
        }
    }

    /// Queue one committed transaction's changes as a unit
    pub async fn enqueue_all(&self, changes: Vec<SizeChange>) -> Result<()> {
        match self {
            UpdateQueue::Volatile(queue) => {
                queue.enqueue_all(changes);
                Ok(())
            }
            UpdateQueue::Durable(queue) => queue.enqueue_all(changes).await.map(|_| ()),
        }
    }

    /// Apply and remove everything currently queued
    pub async fn drain_and_apply(&self) -> Result<DrainReport> {
        match self {
            UpdateQueue::Volatile(queue) => Ok(queue.drain_and_apply().await),
            UpdateQueue::Durable(queue) => queue.drain_and_apply().await,
        }
    }

    pub async fn pending(&self) -> Result<usize> {
        match self {
            UpdateQueue::Volatile(queue) => Ok(queue.pending()),
            UpdateQueue::Durable(queue) => queue.pending().await,
        }
    }
}

/// Unbounded in-memory FIFO
pub struct VolatileQueue {
    entries: std::sync::Mutex<VecDeque<SizeChange>>,
    drain_lock: Mutex<()>,
    store: Arc<dyn TreeStore>,
    policy: RetryPolicy,
}

impl VolatileQueue {
    pub fn new(store: Arc<dyn TreeStore>, policy: RetryPolicy) -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
            store,
            policy,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<SizeChange>> {
        // a panic mid push/pop cannot leave the deque half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, change: SizeChange) {
        debug!("Queued {} bytes for {}", change.delta, change.folder);
        self.entries().push_back(change);
    }

    pub fn enqueue_all(&self, changes: Vec<SizeChange>) {
        debug!("Queued {} folder usage changes", changes.len());
        self.entries().extend(changes);
    }

    pub fn pending(&self) -> usize {
        self.entries().len()
    }

    /// Pop until empty, applying each delta in enqueue order. Entries whose
    /// folder is gone or whose update keeps failing are not requeued.
    pub async fn drain_and_apply(&self) -> DrainReport {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let next = self.entries().pop_front();
            let Some(change) = next else { break };

            match apply_size_change(self.store.as_ref(), &self.policy, &change).await {
                ApplyOutcome::Applied(_) => report.applied += 1,
                ApplyOutcome::Dropped => report.dropped += 1,
                ApplyOutcome::Failed(_) => report.failed += 1,
            }
        }

        if report != DrainReport::default() {
            info!(
                "Drained volatile quota queue: {} applied, {} dropped, {} failed",
                report.applied, report.dropped, report.failed
            );
        }
        report
    }

    /// Remove and return everything still queued
    pub fn take_pending(&self) -> Vec<SizeChange> {
        self.entries().drain(..).collect()
    }
}

/// Issues queue keys that cannot collide within one process start
#[derive(Debug)]
pub struct SequenceGenerator {
    start_time: i64,
    counter: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(start_time: i64) -> Self {
        Self {
            start_time,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_key(&self, namespace: &str) -> QueueKey {
        QueueKey {
            namespace: namespace.to_string(),
            start_time: self.start_time,
            sequence: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue persisted in the store's attribute table
pub struct DurableQueue {
    store: Arc<dyn AttributeStore>,
    sequence: SequenceGenerator,
    namespace: String,
    drain_lock: Mutex<()>,
    policy: RetryPolicy,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn AttributeStore>, policy: RetryPolicy) -> Self {
        Self::with_sequence(store, SequenceGenerator::new(), policy)
    }

    pub fn with_sequence(
        store: Arc<dyn AttributeStore>,
        sequence: SequenceGenerator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            sequence,
            namespace: UPDATE_QUEUE_NAMESPACE.to_string(),
            drain_lock: Mutex::new(()),
            policy,
        }
    }

    /// Persist a delta. A key collision means the sequencing is broken and
    /// is returned as-is rather than retried under a new key.
    pub async fn enqueue(&self, change: SizeChange) -> Result<QueueKey> {
        let key = self.sequence.next_key(&self.namespace);

        match self.store.create_attribute(&key, &change).await {
            Ok(()) => {
                debug!("Queued {} bytes for {} as {}", change.delta, change.folder, key);
                Ok(key)
            }
            Err(e @ QuotaError::QueueKeyCollision(_)) => {
                error!("Durable quota queue key collision on {}, sequencing is broken", key);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist all of `changes` in one store transaction; on error none
    /// of them is queued.
    pub async fn enqueue_all(&self, changes: Vec<SizeChange>) -> Result<Vec<QueueKey>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<QueueEntry> = changes
            .into_iter()
            .map(|change| QueueEntry {
                key: self.sequence.next_key(&self.namespace),
                change,
            })
            .collect();

        match self.store.create_attributes(&entries).await {
            Ok(()) => {
                debug!("Queued {} folder usage changes", entries.len());
                Ok(entries.into_iter().map(|entry| entry.key).collect())
            }
            Err(e @ QuotaError::QueueKeyCollision(_)) => {
                error!("Durable quota queue key collision, sequencing is broken: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Failed to queue {} folder usage changes: {}", entries.len(), e);
                Err(e)
            }
        }
    }

    pub async fn pending(&self) -> Result<usize> {
        Ok(self.store.attributes(&self.namespace).await?.len())
    }

    /// Apply every persisted entry in key order. Each entry's counter
    /// write and removal share one store transaction; an entry whose
    /// update fails stays queued for the next drain.
    pub async fn drain_and_apply(&self) -> Result<DrainReport> {
        let _drain = self.drain_lock.lock().await;
        let entries = self.store.attributes(&self.namespace).await?;
        let mut report = DrainReport::default();

        for entry in &entries {
            let store = self.store.as_ref();
            let result = retry_transaction(&self.policy, "queued usage update", move || {
                store.apply_and_remove(entry)
            })
            .await;

            match result {
                Ok(Some(updated)) => {
                    debug!(
                        "Applied {} from {} to {}, usage now {}",
                        entry.change.delta, entry.key, entry.change.folder, updated
                    );
                    report.applied += 1;
                }
                Ok(None) => debug!("Entry {} was already applied", entry.key),
                Err(e) if e.is_not_found() => {
                    debug!(
                        "Quota folder {} no longer exists, discarding {}",
                        entry.change.folder, entry.key
                    );
                    if let Err(e) = self.store.remove_attribute(&entry.key).await {
                        warn!("Could not discard queue entry {}: {}", entry.key, e);
                    }
                    report.dropped += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to apply queued change {} to {}: {}",
                        entry.key, entry.change.folder, e
                    );
                    report.failed += 1;
                }
            }
        }

        if !entries.is_empty() {
            info!(
                "Drained durable quota queue: {} applied, {} dropped, {} failed",
                report.applied, report.dropped, report.failed
            );
        }
        Ok(report)
    }
}
