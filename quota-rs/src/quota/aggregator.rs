//! Per-transaction change aggregation
//!
//! Every delta recorded inside one host transaction is merged by target
//! folder, so a transaction that touches the same quota folder several
//! times produces a single counter update at commit.

use crate::quota::types::SizeChange;
use crate::store::NodeRef;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Folder -> running signed sum for one transaction
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransactionBatch {
    deltas: BTreeMap<NodeRef, i64>,
}

impl TransactionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, folder: &NodeRef, delta: i64) {
        let net = self.deltas.entry(folder.clone()).or_insert(0);
        *net = net.saturating_add(delta);
    }

    /// Net delta recorded so far for `folder`
    pub fn pending(&self, folder: &NodeRef) -> i64 {
        self.deltas.get(folder).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.values().all(|delta| *delta == 0)
    }

    /// Merged changes, skipping folders whose deltas cancelled out
    pub fn into_changes(self) -> Vec<SizeChange> {
        self.deltas
            .into_iter()
            .filter(|(_, delta)| *delta != 0)
            .map(|(folder, delta)| SizeChange::new(folder, delta))
            .collect()
    }
}

/// Engine-side state bound to one host transaction.
///
/// Obtained from `FolderQuotaService::begin` and consumed by `commit` or
/// `rollback`, so a batch can never be shared across transactions.
#[derive(Debug)]
pub struct QuotaTransaction {
    id: Uuid,
    batch: TransactionBatch,
    rollback_reason: Option<String>,
}

impl QuotaTransaction {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            batch: TransactionBatch::new(),
            rollback_reason: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn record_delta(&mut self, folder: &NodeRef, delta: i64) {
        self.batch.record(folder, delta);
    }

    pub fn pending(&self, folder: &NodeRef) -> i64 {
        self.batch.pending(folder)
    }

    pub fn batch(&self) -> &TransactionBatch {
        &self.batch
    }

    /// The host must roll this transaction back; commit will refuse it.
    pub fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        if self.rollback_reason.is_none() {
            self.rollback_reason = Some(reason.into());
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_reason.is_some()
    }

    pub fn rollback_reason(&self) -> Option<&str> {
        self.rollback_reason.as_deref()
    }

    pub(crate) fn into_batch(self) -> TransactionBatch {
        self.batch
    }
}
