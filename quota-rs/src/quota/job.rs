//! Scheduled reconciliation
//!
//! `recalculate` rebuilds every quota folder's counter from the live tree
//! and is the drift-correcting path. `incremental` drains the update queue.
//! A failure on one folder or entry never stops the rest of the run, and
//! both modes are safe to re-trigger.

use crate::error::{QuotaError, Result};
use crate::quota::calculator::SizeCalculator;
use crate::quota::queue::UpdateQueue;
use crate::quota::retry::{retry_transaction, RetryPolicy};
use crate::quota::types::{DrainReport, JobMode, JobReport, RecalculationReport};
use crate::store::{QuotaProperty, TreeStore};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};

pub struct ReconciliationJob {
    store: Arc<dyn TreeStore>,
    calculator: SizeCalculator,
    queue: Option<Arc<UpdateQueue>>,
    policy: RetryPolicy,
    run_as: String,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn TreeStore>,
        queue: Option<Arc<UpdateQueue>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            calculator: SizeCalculator::new(Arc::clone(&store)),
            store,
            queue,
            policy,
            run_as: "system".to_string(),
        }
    }

    /// Identity the host runs this job under; recorded on the job span
    pub fn run_as(mut self, identity: impl Into<String>) -> Self {
        self.run_as = identity.into();
        self
    }

    pub async fn run(&self, mode: JobMode) -> Result<JobReport> {
        let span = info_span!("quota_job", mode = %mode, run_as = %self.run_as);

        async {
            info!("Executing folder usage job");
            let report = match mode {
                JobMode::Recalculate => JobReport::Recalculate(self.recalculate().await?),
                JobMode::Incremental => JobReport::Incremental(self.incremental().await?),
            };
            info!("Folder usage job finished: {:?}", report);
            Ok::<_, QuotaError>(report)
        }
        .instrument(span)
        .await
    }

    /// Overwrite every quota folder's counter with its computed size
    pub async fn recalculate(&self) -> Result<RecalculationReport> {
        let folders = self.store.quota_folders().await?;
        let mut report = RecalculationReport {
            folders: folders.len(),
            ..Default::default()
        };

        for folder in &folders {
            let size = match self.calculator.folder_size(folder).await {
                Ok(size) => i64::try_from(size).unwrap_or(i64::MAX),
                Err(e) => {
                    error!("Failed to calculate usage of quota folder {}: {}", folder, e);
                    report.failed += 1;
                    continue;
                }
            };

            let store = self.store.as_ref();
            let written = retry_transaction(&self.policy, "usage recalculation", move || {
                store.set_property(folder, QuotaProperty::SizeCurrent, size)
            })
            .await;

            match written {
                Ok(()) => {
                    debug!("Usage of quota folder {} recalculated as {}", folder, size);
                    report.updated += 1;
                }
                Err(e) => {
                    error!("Failed to store usage of quota folder {}: {}", folder, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Recalculated {} of {} quota folders ({} failed)",
            report.updated, report.folders, report.failed
        );
        Ok(report)
    }

    /// Drain the update queue, if this deployment has one
    pub async fn incremental(&self) -> Result<DrainReport> {
        match &self.queue {
            Some(queue) => queue.drain_and_apply().await,
            None => {
                debug!("No update queue configured, nothing to drain");
                Ok(DrainReport::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockTreeStore, NodeKind, NodeRef};
    use std::sync::Mutex;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_one_failing_folder_does_not_stop_the_run() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);

        let mut store = MockTreeStore::new();
        store.expect_quota_folders().returning(|| {
            Ok(vec![
                NodeRef::workspace("a"),
                NodeRef::workspace("broken"),
                NodeRef::workspace("c"),
            ])
        });
        store.expect_children().returning(|folder| match folder.id.as_str() {
            "broken" => Err(QuotaError::Database(sqlx::Error::RowNotFound)),
            "a" => Ok(vec![NodeRef::workspace("a-file")]),
            _ => Ok(vec![]),
        });
        store.expect_node_kind().returning(|_| Ok(Some(NodeKind::File)));
        store.expect_content_size().returning(|_| Ok(Some(9)));
        store.expect_set_property().returning(move |folder, _, value| {
            sink.lock().unwrap().push((folder.id.clone(), value));
            Ok(())
        });

        let job = ReconciliationJob::new(Arc::new(store), None, fast_policy());
        let report = job.recalculate().await.unwrap();

        assert_eq!(
            report,
            RecalculationReport {
                folders: 3,
                updated: 2,
                failed: 1,
            }
        );
        assert_eq!(
            *written.lock().unwrap(),
            vec![("a".to_string(), 9), ("c".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_incremental_without_queue_is_noop() {
        let store = MockTreeStore::new();
        let job = ReconciliationJob::new(Arc::new(store), None, fast_policy());

        let report = job.run(JobMode::Incremental).await.unwrap();
        assert_eq!(report, JobReport::Incremental(DrainReport::default()));
    }
}
