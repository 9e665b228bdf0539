//! SQLite-backed host store
//!
//! Holds the node tree, the quota marker and its two properties, and the
//! durable update queue table. Host-side mutations (create, move, delete,
//! archive) live here too so the CLI and tests can drive a real tree.

use crate::error::{QuotaError, Result};
use crate::quota::types::{QueueEntry, QueueKey, SizeChange};
use crate::store::{AttributeStore, NodeKind, NodeRef, QuotaProperty, StoreProtocol, TreeStore};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const BUSY_TIMEOUT_SECS: u64 = 5;

pub struct SqliteTreeStore {
    db: SqlitePool,
}

impl SqliteTreeStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open (creating if needed) a database file and initialize the schema
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let db = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self::new(db);
        store.init_db().await?;
        info!("Opened quota store at {}", database_url);
        Ok(store)
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        // the database lives only as long as its one connection
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                protocol TEXT NOT NULL DEFAULT 'workspace',
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                content_size INTEGER,
                has_quota BOOLEAN NOT NULL DEFAULT 0,
                size_quota INTEGER,
                size_current INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)")
            .execute(&self.db)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_quota ON nodes(has_quota)")
            .execute(&self.db)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_update_queue (
                namespace TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                folder_protocol TEXT NOT NULL,
                folder_id TEXT NOT NULL,
                size_change INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (namespace, start_time, sequence)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn insert_node(
        &self,
        parent: Option<&NodeRef>,
        name: &str,
        kind: NodeKind,
        content_size: Option<u64>,
    ) -> Result<NodeRef> {
        if let Some(parent) = parent {
            match self.node_kind(parent).await? {
                Some(NodeKind::Folder) => {}
                Some(NodeKind::File) => {
                    return Err(QuotaError::InvalidNodeRef(format!(
                        "{} is not a folder",
                        parent
                    )))
                }
                None => return Err(QuotaError::NodeNotFound(parent.clone())),
            }
        }

        let node = NodeRef::workspace(Uuid::new_v4().to_string());
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO nodes (id, protocol, kind, name, parent_id, content_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(node.protocol.as_str())
        .bind(kind_str(kind))
        .bind(name)
        .bind(parent.map(|p| p.id.as_str()))
        .bind(content_size.map(to_db_size))
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        debug!("Created {:?} {} ({})", kind, node, name);
        Ok(node)
    }

    /// Create a folder; `None` parent makes a root
    pub async fn create_folder(&self, parent: Option<&NodeRef>, name: &str) -> Result<NodeRef> {
        self.insert_node(parent, name, NodeKind::Folder, None).await
    }

    /// Create a file; `None` size means the content is not there yet
    pub async fn create_file(
        &self,
        parent: &NodeRef,
        name: &str,
        size: Option<u64>,
    ) -> Result<NodeRef> {
        self.insert_node(Some(parent), name, NodeKind::File, size).await
    }

    /// Replace a file's content size, returning the previous one
    pub async fn set_content_size(&self, node: &NodeRef, size: Option<u64>) -> Result<Option<u64>> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query("SELECT content_size FROM nodes WHERE id = ? AND protocol = ?")
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QuotaError::NodeNotFound(node.clone()))?;
        let previous: Option<i64> = row.get("content_size");

        sqlx::query("UPDATE nodes SET content_size = ?, updated_at = ? WHERE id = ? AND protocol = ?")
            .bind(size.map(to_db_size))
            .bind(Utc::now().to_rfc3339())
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(previous.map(from_db_size))
    }

    /// Re-parent a node, returning its previous parent
    pub async fn move_node(&self, node: &NodeRef, new_parent: &NodeRef) -> Result<Option<NodeRef>> {
        if self.node_kind(new_parent).await? != Some(NodeKind::Folder) {
            return Err(QuotaError::InvalidNodeRef(format!(
                "{} is not a folder",
                new_parent
            )));
        }
        let previous = self.parent(node).await?;

        let result = sqlx::query(
            "UPDATE nodes SET parent_id = ?, updated_at = ? WHERE id = ? AND protocol = ?",
        )
        .bind(&new_parent.id)
        .bind(Utc::now().to_rfc3339())
        .bind(&node.id)
        .bind(node.protocol.as_str())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::NodeNotFound(node.clone()));
        }
        Ok(previous)
    }

    /// Hard-delete a node and its whole subtree; returns rows removed
    pub async fn delete_node(&self, node: &NodeRef) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM nodes WHERE id = ? AND protocol = ?
                UNION ALL
                SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
            )
            DELETE FROM nodes WHERE id IN (SELECT id FROM subtree)
            "#,
        )
        .bind(&node.id)
        .bind(node.protocol.as_str())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Soft-delete: move a subtree into the archive area, detached from
    /// its workspace parent. Returns the archived reference.
    pub async fn archive_node(&self, node: &NodeRef) -> Result<NodeRef> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM nodes WHERE id = ? AND protocol = 'workspace'
                UNION ALL
                SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
            )
            UPDATE nodes SET protocol = 'archive' WHERE id IN (SELECT id FROM subtree)
            "#,
        )
        .bind(&node.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::NodeNotFound(node.clone()));
        }

        sqlx::query("UPDATE nodes SET parent_id = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&node.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(NodeRef::archive(node.id.clone()))
    }

    /// Put the quota marker on a folder; the usage counter starts absent
    pub async fn add_quota_marker(&self, folder: &NodeRef, limit: Option<u64>) -> Result<()> {
        if self.node_kind(folder).await? != Some(NodeKind::Folder) {
            return Err(QuotaError::InvalidNodeRef(format!("{} is not a folder", folder)));
        }

        sqlx::query(
            "UPDATE nodes SET has_quota = 1, size_quota = ?, updated_at = ? WHERE id = ? AND protocol = ?",
        )
        .bind(limit.map(to_db_size))
        .bind(Utc::now().to_rfc3339())
        .bind(&folder.id)
        .bind(folder.protocol.as_str())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn set_quota_limit(&self, folder: &NodeRef, limit: Option<u64>) -> Result<()> {
        match limit {
            Some(limit) => {
                self.set_property(folder, QuotaProperty::SizeQuota, to_db_size(limit))
                    .await
            }
            None => {
                sqlx::query("UPDATE nodes SET size_quota = NULL WHERE id = ? AND protocol = ?")
                    .bind(&folder.id)
                    .bind(folder.protocol.as_str())
                    .execute(&self.db)
                    .await?;
                Ok(())
            }
        }
    }

    /// Number of pending durable queue entries under `namespace`
    pub async fn attribute_count(&self, namespace: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM quota_update_queue WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.db)
            .await?;
        Ok(row.get("n"))
    }
}

fn kind_str(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Folder => "folder",
        NodeKind::File => "file",
    }
}

fn property_column(property: QuotaProperty) -> &'static str {
    match property {
        QuotaProperty::SizeQuota => "size_quota",
        QuotaProperty::SizeCurrent => "size_current",
    }
}

fn to_db_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn from_db_size(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}

fn increment_usage<'q>(
    folder: &'q NodeRef,
    delta: i64,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(
        r#"
        UPDATE nodes SET size_current = COALESCE(size_current, 0) + ?
        WHERE id = ? AND protocol = ?
        RETURNING size_current
        "#,
    )
    .bind(delta)
    .bind(&folder.id)
    .bind(folder.protocol.as_str())
}

fn node_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<NodeRef> {
    let protocol: String = row.get("protocol");
    Ok(NodeRef {
        protocol: protocol.parse()?,
        id: row.get("id"),
    })
}

#[async_trait]
impl TreeStore for SqliteTreeStore {
    async fn exists(&self, node: &NodeRef) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM nodes WHERE id = ? AND protocol = ?")
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    async fn node_kind(&self, node: &NodeRef) -> Result<Option<NodeKind>> {
        let row = sqlx::query("SELECT kind FROM nodes WHERE id = ? AND protocol = ?")
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|row| {
            let kind: String = row.get("kind");
            if kind == "folder" {
                NodeKind::Folder
            } else {
                NodeKind::File
            }
        }))
    }

    async fn content_size(&self, node: &NodeRef) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT content_size FROM nodes WHERE id = ? AND protocol = ?")
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&self.db)
            .await?;

        Ok(row
            .and_then(|row| row.get::<Option<i64>, _>("content_size"))
            .map(from_db_size))
    }

    async fn children(&self, folder: &NodeRef) -> Result<Vec<NodeRef>> {
        let rows = sqlx::query(
            "SELECT id, protocol FROM nodes WHERE parent_id = ? AND protocol = ? ORDER BY name, id",
        )
        .bind(&folder.id)
        .bind(folder.protocol.as_str())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    async fn parent(&self, node: &NodeRef) -> Result<Option<NodeRef>> {
        let row = sqlx::query(
            r#"
            SELECT p.id, p.protocol
            FROM nodes n JOIN nodes p ON p.id = n.parent_id
            WHERE n.id = ? AND n.protocol = ?
            "#,
        )
        .bind(&node.id)
        .bind(node.protocol.as_str())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn has_quota_marker(&self, node: &NodeRef) -> Result<bool> {
        let row = sqlx::query("SELECT has_quota FROM nodes WHERE id = ? AND protocol = ?")
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|row| row.get::<bool, _>("has_quota")).unwrap_or(false))
    }

    async fn property(&self, node: &NodeRef, property: QuotaProperty) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT {} AS value FROM nodes WHERE id = ? AND protocol = ?",
            property_column(property)
        );
        let row = sqlx::query(&sql)
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .fetch_optional(&self.db)
            .await?;

        Ok(row.and_then(|row| row.get::<Option<i64>, _>("value")))
    }

    async fn set_property(&self, node: &NodeRef, property: QuotaProperty, value: i64) -> Result<()> {
        let sql = format!(
            "UPDATE nodes SET {} = ?, updated_at = ? WHERE id = ? AND protocol = ?",
            property_column(property)
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .bind(&node.id)
            .bind(node.protocol.as_str())
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::NodeNotFound(node.clone()));
        }
        Ok(())
    }

    async fn quota_folders(&self) -> Result<Vec<NodeRef>> {
        let rows = sqlx::query(
            "SELECT id, protocol FROM nodes WHERE has_quota = 1 AND protocol = ? ORDER BY id",
        )
        .bind(StoreProtocol::Workspace.as_str())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    async fn add_to_usage(&self, folder: &NodeRef, delta: i64) -> Result<i64> {
        // one statement takes the write lock up front; a read followed by a
        // write would fail the upgrade under WAL when workers contend
        let row = increment_usage(folder, delta)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| QuotaError::NodeNotFound(folder.clone()))?;

        Ok(row.get("size_current"))
    }
}

#[async_trait]
impl AttributeStore for SqliteTreeStore {
    async fn create_attribute(&self, key: &QueueKey, change: &SizeChange) -> Result<()> {
        self.create_attributes(&[QueueEntry {
            key: key.clone(),
            change: change.clone(),
        }])
        .await
    }

    async fn create_attributes(&self, entries: &[QueueEntry]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let created_at = Utc::now().to_rfc3339();

        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO quota_update_queue (
                    namespace, start_time, sequence, folder_protocol, folder_id, size_change, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.key.namespace)
            .bind(entry.key.start_time)
            .bind(entry.key.sequence as i64)
            .bind(entry.change.folder.protocol.as_str())
            .bind(&entry.change.folder.id)
            .bind(entry.change.delta)
            .bind(&created_at)
            .execute(&mut *tx)
            .await;

            // returning early drops tx, so none of the batch is kept
            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(QuotaError::QueueKeyCollision(entry.key.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn attributes(&self, namespace: &str) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, start_time, sequence, folder_protocol, folder_id, size_change
            FROM quota_update_queue
            WHERE namespace = ?
            ORDER BY start_time ASC, sequence ASC
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                let protocol: String = row.get("folder_protocol");
                Ok(QueueEntry {
                    key: QueueKey {
                        namespace: row.get("namespace"),
                        start_time: row.get("start_time"),
                        sequence: row.get::<i64, _>("sequence") as u64,
                    },
                    change: SizeChange {
                        folder: NodeRef {
                            protocol: protocol.parse()?,
                            id: row.get("folder_id"),
                        },
                        delta: row.get("size_change"),
                    },
                })
            })
            .collect()
    }

    async fn apply_and_remove(&self, entry: &QueueEntry) -> Result<Option<i64>> {
        let folder = &entry.change.folder;
        let mut tx = self.db.begin().await?;

        // claim the entry first so the transaction starts as a writer
        let removed = sqlx::query(
            "DELETE FROM quota_update_queue WHERE namespace = ? AND start_time = ? AND sequence = ?",
        )
        .bind(&entry.key.namespace)
        .bind(entry.key.start_time)
        .bind(entry.key.sequence as i64)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 {
            // someone else already applied it
            return Ok(None);
        }

        // dropping tx on a missing folder puts the entry back
        let row = increment_usage(folder, entry.change.delta)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QuotaError::NodeNotFound(folder.clone()))?;
        let updated: i64 = row.get("size_current");

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn remove_attribute(&self, key: &QueueKey) -> Result<()> {
        sqlx::query(
            "DELETE FROM quota_update_queue WHERE namespace = ? AND start_time = ? AND sequence = ?",
        )
        .bind(&key.namespace)
        .bind(key.start_time)
        .bind(key.sequence as i64)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
