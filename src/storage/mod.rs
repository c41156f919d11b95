use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::collections::HashMap;
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking a request handler indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// One task record. Serialized as-is on the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, serde::Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Pending mirror operation, queued transactionally with the task mutation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub task_id: String,
    /// `"upsert"` | `"delete"` — parse with [`OutboxOp::from_str`].
    pub op: String,
    pub attempts: i64,
    pub created_at: String,
}

/// The two projection operations the mirror understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl OutboxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxOp::Upsert => "upsert",
            OutboxOp::Delete => "delete",
        }
    }
}

impl FromStr for OutboxOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upsert" => Ok(OutboxOp::Upsert),
            "delete" => Ok(OutboxOp::Delete),
            other => Err(anyhow!("unknown outbox op '{other}'")),
        }
    }
}

/// Primary task store: per-record keyed rows in SQLite.
///
/// Every mutation enqueues its search-mirror projection into `search_outbox`
/// inside the same transaction, so the outbox can never miss a write the
/// store committed (and never holds one it rolled back).
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create the store with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("taskd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    /// Insert one task; the store assigns the id. Enqueues the mirror upsert.
    pub async fn create_task(&self, title: &str, description: &str) -> Result<TaskRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tasks (id, title, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        enqueue_outbox(&mut tx, &id, OutboxOp::Upsert, &now).await?;
        tx.commit().await?;
        self.get_task(&id)
            .await?
            .ok_or_else(|| anyhow!("task not found after insert"))
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// All tasks in insertion order (`created_at`, id as the tiebreak).
    pub async fn list_tasks(&self) -> Result<Vec<TaskRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Fetch the given ids, preserving the order of `ids` and dropping any id
    /// the store no longer has. Used to hydrate search results.
    ///
    /// Queried in chunks: SQLite caps bound parameters (32766 by default),
    /// and a broad search can match more ids than that.
    pub async fn get_tasks_by_ids(&self, ids: &[String]) -> Result<Vec<TaskRow>> {
        const CHUNK: usize = 500;

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_id: HashMap<String, TaskRow> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("SELECT * FROM tasks WHERE id IN ({placeholders})");
            let mut query = sqlx::query_as::<_, TaskRow>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                by_id.insert(row.id.clone(), row);
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Apply the provided fields to one task and bump `updated_at`.
    ///
    /// Returns `None` when the id is unknown (nothing written, outbox
    /// untouched). Enqueues the mirror upsert on success.
    pub async fn update_task(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<TaskRow>> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE tasks SET title = COALESCE(?, title),
                              description = COALESCE(?, description),
                              updated_at = ?
             WHERE id = ?",
        )
        .bind(title)
        .bind(description)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        enqueue_outbox(&mut tx, id, OutboxOp::Upsert, &now).await?;
        tx.commit().await?;
        self.get_task(id).await
    }

    /// Remove one task. Returns `false` when the id is unknown (store left
    /// unchanged). Enqueues the mirror delete on success.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        enqueue_outbox(&mut tx, id, OutboxOp::Delete, &now).await?;
        tx.commit().await?;
        Ok(true)
    }

    // ─── Search outbox ──────────────────────────────────────────────────────

    /// Oldest pending outbox entries, strictly in enqueue order.
    pub async fn fetch_outbox_batch(&self, limit: i64) -> Result<Vec<OutboxRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM search_outbox ORDER BY id ASC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Remove an entry after its mirror apply succeeded.
    pub async fn settle_outbox_entry(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM search_outbox WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed mirror apply; the entry stays queued for retry.
    pub async fn bump_outbox_attempts(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE search_outbox SET attempts = attempts + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of pending outbox entries. Logged at startup: a non-zero depth
    /// means the previous run stopped before the mirror caught up.
    pub async fn outbox_depth(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM search_outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

/// Queue a projection entry on the transaction carrying the task mutation.
async fn enqueue_outbox(
    tx: &mut sqlx::SqliteConnection,
    task_id: &str,
    op: OutboxOp,
    now: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO search_outbox (task_id, op, attempts, created_at) VALUES (?, ?, 0, ?)")
        .bind(task_id)
        .bind(op.as_str())
        .bind(now)
        .execute(tx)
        .await?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
