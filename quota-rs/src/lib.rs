//! quota-rs: folder quota usage engine
//!
//! Keeps a running byte-usage counter on designated quota folders of a
//! hierarchical content tree, enforces each folder's size limit, and keeps
//! the counter consistent as files are created, updated, moved and deleted
//! beneath it, without re-walking the subtree on every change.
//!
//! # Flow
//!
//! ```text
//! tree mutation ─▶ QuotaResolver ─▶ SizeCalculator ─▶ limit check ─▶ QuotaTransaction
//!                                                                       │ commit
//!                                     ┌─────────────────────────────────┴──────────┐
//!                                     ▼                                            ▼
//!                              AsyncApplier pool                             UpdateQueue
//!                                                                    (drained by ReconciliationJob)
//! ```
//!
//! `ReconciliationJob::recalculate` rebuilds every counter from the tree and
//! corrects any drift the deferred paths leave behind.
//!
//! # Example
//!
//! ```no_run
//! use quota_rs::config::QuotaConfig;
//! use quota_rs::quota::FolderQuotaService;
//! use quota_rs::store::SqliteTreeStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QuotaConfig::default();
//!     let store = Arc::new(SqliteTreeStore::connect(&config.store.database_url).await?);
//!     let service = FolderQuotaService::new(Arc::clone(&store), &config);
//!
//!     let root = store.create_folder(None, "projects").await?;
//!     store.add_quota_marker(&root, Some(10 * 1024 * 1024)).await?;
//!
//!     let mut txn = service.begin();
//!     let file = store.create_file(&root, "report.pdf", Some(4096)).await?;
//!     service.on_content_update(&mut txn, &file, None, Some(4096)).await?;
//!     service.commit(txn).await?;
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`logging`]: Tracing setup
//! - [`quota`]: The usage engine
//! - [`store`]: Tree store contract and SQLite host store

pub mod config;
pub mod error;
pub mod logging;
pub mod quota;
pub mod store;

// Re-export commonly used types
pub use config::QuotaConfig;
pub use error::{QuotaError, Result};
pub use quota::{FolderQuotaService, JobMode, ReconciliationJob, SizeChange, UpdateQueue};
pub use store::{NodeRef, SqliteTreeStore, TreeStore};
