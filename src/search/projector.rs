// SPDX-License-Identifier: MIT
//! Background projector that drains the search outbox into the mirror.
//!
//! The primary store queues one outbox entry per mutation, inside the same
//! transaction. This task is the only writer the mirror has: it applies
//! entries strictly in queue order, removes each entry only after its apply
//! succeeded, and on failure backs off and retries the same entry until it
//! goes through. A mirror that falls behind is stale but never divergent,
//! and a restart picks up exactly where the queue says it left off.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::search::{SearchDocument, SearchIndex};
use crate::storage::{OutboxOp, OutboxRow, TaskStore};

/// Drains `search_outbox` into the [`SearchIndex`].
pub struct Projector {
    store: TaskStore,
    index: SearchIndex,
    batch_size: i64,
    poll_interval: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    /// Signalled by the service after each mutation so entries are usually
    /// projected within milliseconds; the poll interval is the fallback.
    notify: Arc<Notify>,
}

impl Projector {
    pub fn new(
        store: TaskStore,
        index: SearchIndex,
        config: &SearchConfig,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            index,
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            retry_initial: Duration::from_millis(config.retry_initial_ms.max(1)),
            retry_max: Duration::from_millis(config.retry_max_ms.max(1)),
            notify,
        }
    }

    /// Spawn the drain loop. Returns the `JoinHandle` — drop or abort to stop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        match self.store.outbox_depth().await {
            Ok(0) => info!("search projector started"),
            Ok(depth) => info!(pending = depth, "search projector started with backlog"),
            Err(e) => warn!(err = %e, "search projector started; outbox depth unavailable"),
        }

        let mut delay = self.retry_initial;
        loop {
            match self.run_once().await {
                Ok(applied) => {
                    if applied > 0 {
                        debug!(applied, "projected outbox entries");
                    }
                    delay = self.retry_initial;
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        "projection pass failed, retrying: {e:#}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max);
                }
            }
        }
    }

    /// Single drain pass: apply and settle entries in queue order until the
    /// outbox is empty. Returns the number of entries applied.
    ///
    /// Stops at the first entry whose apply fails, leaving it (and everything
    /// behind it) queued. Blocking the queue keeps per-task operations
    /// ordered; skipping a failed upsert and applying the delete behind it
    /// would let the mirror diverge.
    pub async fn run_once(&self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let batch = self.store.fetch_outbox_batch(self.batch_size).await?;
            if batch.is_empty() {
                return Ok(applied);
            }
            for entry in batch {
                if let Err(e) = self.apply(&entry).await {
                    self.store.bump_outbox_attempts(entry.id).await?;
                    warn!(
                        outbox_id = entry.id,
                        task_id = %entry.task_id,
                        op = %entry.op,
                        attempts = entry.attempts + 1,
                        "failed to apply outbox entry, mirror is stale until it succeeds: {e:#}"
                    );
                    return Err(e.context(format!("apply outbox entry {}", entry.id)));
                }
                self.store.settle_outbox_entry(entry.id).await?;
                applied += 1;
            }
        }
    }

    async fn apply(&self, entry: &OutboxRow) -> Result<()> {
        let op: OutboxOp = entry.op.parse()?;
        match op {
            OutboxOp::Upsert => {
                // Read the task at apply time, not enqueue time: consecutive
                // upserts then collapse to the latest state for free.
                match self.store.get_task(&entry.task_id).await? {
                    Some(task) => {
                        self.index
                            .upsert(&SearchDocument {
                                task_id: task.id,
                                title: task.title,
                                description: task.description,
                            })
                            .await
                    }
                    None => {
                        // Deleted since this entry was queued. Remove it from
                        // the mirror now rather than waiting for the delete
                        // entry behind us.
                        debug!(task_id = %entry.task_id, "upsert target gone, removing from mirror");
                        self.index.delete(&entry.task_id).await
                    }
                }
            }
            OutboxOp::Delete => self.index.delete(&entry.task_id).await,
        }
    }

    /// Rebuild the mirror from the primary store: clear it, re-index every
    /// task, then drain whatever the outbox accumulated meanwhile.
    pub async fn rebuild_index(&self) -> Result<u64> {
        self.index.clear().await.context("clear search index")?;
        let tasks = self.store.list_tasks().await?;
        let count = tasks.len() as u64;
        for task in tasks {
            self.index
                .upsert(&SearchDocument {
                    task_id: task.id.clone(),
                    title: task.title,
                    description: task.description,
                })
                .await
                .with_context(|| format!("re-index task {}", task.id))?;
        }
        self.run_once().await?;
        info!(tasks = count, "search index rebuilt");
        Ok(count)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;
    use std::str::FromStr;

    async fn setup() -> (TaskStore, SearchIndex, Projector, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).await.unwrap();
        let index = SearchIndex::new(dir.path()).await.unwrap();
        let projector = Projector::new(
            store.clone(),
            index.clone(),
            &SearchConfig::default(),
            Arc::new(Notify::new()),
        );
        (store, index, projector, dir)
    }

    /// Second connection to the mirror database, for breaking it mid-test.
    async fn raw_mirror_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let path = dir.path().join("search.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display())).unwrap();
        SqlitePool::connect_with(opts).await.unwrap()
    }

    #[tokio::test]
    async fn created_tasks_become_searchable_after_drain() {
        let (store, index, projector, _dir) = setup().await;
        let task = store.create_task("Buy groceries", "milk and eggs").await.unwrap();

        assert!(index.search("groceries").await.unwrap().is_empty());
        let applied = projector.run_once().await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(index.search("groceries").await.unwrap(), vec![task.id]);
        assert_eq!(store.outbox_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zeroed_config_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).await.unwrap();
        let index = SearchIndex::new(dir.path()).await.unwrap();
        let zeroed = SearchConfig {
            poll_interval_ms: 0,
            batch_size: 0,
            retry_initial_ms: 0,
            retry_max_ms: 0,
        };
        let projector =
            Projector::new(store.clone(), index, &zeroed, Arc::new(Notify::new()));

        // A zero poll interval would turn the idle loop into a busy spin.
        assert_eq!(projector.poll_interval, Duration::from_millis(1));
        assert_eq!(projector.batch_size, 1);
        assert_eq!(projector.retry_initial, Duration::from_millis(1));

        store.create_task("clamped", "").await.unwrap();
        assert_eq!(projector.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleted_tasks_leave_the_index() {
        let (store, index, projector, _dir) = setup().await;
        let task = store.create_task("ephemeral", "").await.unwrap();
        projector.run_once().await.unwrap();
        assert_eq!(index.search("ephemeral").await.unwrap(), vec![task.id.clone()]);

        store.delete_task(&task.id).await.unwrap();
        projector.run_once().await.unwrap();
        assert!(index.search("ephemeral").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updates_replace_indexed_text() {
        let (store, index, projector, _dir) = setup().await;
        let task = store.create_task("draft report", "").await.unwrap();
        projector.run_once().await.unwrap();

        store
            .update_task(&task.id, Some("final report"), None)
            .await
            .unwrap();
        projector.run_once().await.unwrap();

        assert!(index.search("draft").await.unwrap().is_empty());
        assert_eq!(index.search("final").await.unwrap(), vec![task.id]);
    }

    #[tokio::test]
    async fn upsert_for_already_deleted_task_does_not_resurrect_it() {
        let (store, index, projector, _dir) = setup().await;
        let task = store.create_task("short lived", "").await.unwrap();
        store.delete_task(&task.id).await.unwrap();

        // Both entries are still queued; the stale upsert must not fail and
        // must not put the task back into the mirror.
        let applied = projector.run_once().await.unwrap();
        assert_eq!(applied, 2);
        assert!(index.search("short").await.unwrap().is_empty());
        assert_eq!(index.doc_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drain_crosses_batch_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).await.unwrap();
        let index = SearchIndex::new(dir.path()).await.unwrap();
        let config = SearchConfig {
            batch_size: 2,
            ..SearchConfig::default()
        };
        let projector = Projector::new(
            store.clone(),
            index.clone(),
            &config,
            Arc::new(Notify::new()),
        );

        for i in 0..5 {
            store.create_task(&format!("task {i}"), "").await.unwrap();
        }
        let applied = projector.run_once().await.unwrap();
        assert_eq!(applied, 5);
        assert_eq!(index.doc_count().await.unwrap(), 5);
        assert_eq!(store.outbox_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_entry_blocks_the_queue_and_recovers() {
        let (store, index, projector, dir) = setup().await;
        let first = store.create_task("first", "").await.unwrap();
        store.create_task("second", "").await.unwrap();

        // Break the mirror under the projector.
        let raw = raw_mirror_pool(&dir).await;
        sqlx::query("DROP TABLE task_search")
            .execute(&raw)
            .await
            .unwrap();

        let err = projector.run_once().await;
        assert!(err.is_err());

        // Nothing settled, nothing skipped: both entries still queued, the
        // failed head recorded an attempt.
        let batch = store.fetch_outbox_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].task_id, first.id);
        assert_eq!(batch[0].attempts, 1);
        assert_eq!(batch[1].attempts, 0);

        // Restore the mirror; the same pass now drains everything.
        sqlx::query(
            "CREATE VIRTUAL TABLE task_search USING fts5(
                 task_id UNINDEXED,
                 title,
                 description,
                 tokenize = 'trigram'
             )",
        )
        .execute(&raw)
        .await
        .unwrap();

        let applied = projector.run_once().await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(store.outbox_depth().await.unwrap(), 0);
        assert_eq!(index.doc_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rebuild_reindexes_every_task() {
        let (store, index, projector, _dir) = setup().await;
        let a = store.create_task("alpha", "").await.unwrap();
        let b = store.create_task("beta", "").await.unwrap();
        projector.run_once().await.unwrap();

        // Poison the index with an entry the primary no longer backs.
        index
            .upsert(&SearchDocument {
                task_id: "ghost".into(),
                title: "alpha ghost".into(),
                description: String::new(),
            })
            .await
            .unwrap();

        let count = projector.rebuild_index().await.unwrap();
        assert_eq!(count, 2);
        let mut ids = index.search("alpha").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![a.id]);
        assert_eq!(index.search("beta").await.unwrap(), vec![b.id]);
        assert_eq!(index.doc_count().await.unwrap(), 2);
    }
}
