/// Folder quota engine
///
/// This module keeps per-folder usage counters in step with tree changes:
/// - [`resolver`]: nearest quota folder above a node
/// - [`calculator`]: subtree sizes and per-mutation size changes
/// - [`aggregator`]: per-transaction merging of deltas
/// - [`queue`]: volatile and durable update queues
/// - [`applier`]: worker pool applying deltas after commit
/// - [`job`]: full recalculation and incremental drain
/// - [`behaviour`]: mutation handlers, limit enforcement, commit dispatch

pub mod aggregator;
pub mod applier;
pub mod behaviour;
pub mod calculator;
pub mod job;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod types;

pub use aggregator::{QuotaTransaction, TransactionBatch};
pub use applier::{ApplierSnapshot, AsyncApplier};
pub use behaviour::{Delivery, FolderQuotaService};
pub use calculator::SizeCalculator;
pub use job::ReconciliationJob;
pub use queue::{DurableQueue, SequenceGenerator, UpdateQueue, VolatileQueue};
pub use resolver::QuotaResolver;
pub use retry::RetryPolicy;
pub use types::{DrainReport, JobMode, JobReport, QueueEntry, QueueKey, RecalculationReport, SizeChange};
