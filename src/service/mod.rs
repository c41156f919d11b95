//! Task operations behind the REST surface.
//!
//! Validation and orchestration live here so every caller gets the same
//! rules. Reads and writes go to the primary store; search goes to the
//! mirror for ids only, then back to the primary for the canonical rows.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::search::SearchIndex;
use crate::storage::{TaskRow, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Request was well-formed but the fields are not acceptable.
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(String),
    /// Anything below the domain: database, index, IO.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    index: SearchIndex,
    /// Wakes the projector after each mutation so the mirror catches up
    /// without waiting for its poll interval.
    wake_projector: Arc<Notify>,
}

impl TaskService {
    pub fn new(store: TaskStore, index: SearchIndex, wake_projector: Arc<Notify>) -> Self {
        Self {
            store,
            index,
            wake_projector,
        }
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Result<Vec<TaskRow>, TaskError> {
        Ok(self.store.list_tasks().await?)
    }

    /// Create a task. `title` is required and must be non-empty;
    /// `description` defaults to empty.
    pub async fn create(
        &self,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<TaskRow, TaskError> {
        let title = match title {
            Some(t) if !t.is_empty() => t,
            _ => return Err(TaskError::Validation("title is required".into())),
        };
        let task = self
            .store
            .create_task(&title, description.as_deref().unwrap_or(""))
            .await?;
        self.wake_projector.notify_one();
        Ok(task)
    }

    /// Apply a partial update. Absent fields keep their current value;
    /// a present title must be non-empty.
    pub async fn update(
        &self,
        id: &str,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<TaskRow, TaskError> {
        if matches!(title.as_deref(), Some("")) {
            return Err(TaskError::Validation("title must not be empty".into()));
        }
        let updated = self
            .store
            .update_task(id, title.as_deref(), description.as_deref())
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        self.wake_projector.notify_one();
        Ok(updated)
    }

    /// Delete a task by id.
    pub async fn delete(&self, id: &str) -> Result<(), TaskError> {
        if !self.store.delete_task(id).await? {
            return Err(TaskError::NotFound(id.to_string()));
        }
        self.wake_projector.notify_one();
        Ok(())
    }

    /// Tasks whose title or description contains `query`, oldest first.
    ///
    /// Every string contains the empty substring, so an empty query is the
    /// full listing and is answered from the primary store directly. The
    /// query is otherwise matched verbatim, whitespace included.
    ///
    /// Non-empty queries ask the mirror for ids; the rows come from the
    /// primary store, so results are always canonical. An id the mirror has
    /// not caught up on is simply absent, and an id the primary no longer
    /// has is dropped rather than resurrected.
    pub async fn search(&self, query: &str) -> Result<Vec<TaskRow>, TaskError> {
        if query.is_empty() {
            return self.list().await;
        }
        let ids = self.index.search(query).await?;
        let mut tasks = self.store.get_tasks_by_ids(&ids).await?;
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::search::projector::Projector;

    struct Fixture {
        service: TaskService,
        projector: Projector,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).await.unwrap();
        let index = SearchIndex::new(dir.path()).await.unwrap();
        let notify = Arc::new(Notify::new());
        let service = TaskService::new(store.clone(), index.clone(), notify.clone());
        let projector = Projector::new(store, index, &SearchConfig::default(), notify);
        Fixture {
            service,
            projector,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn create_requires_a_title() {
        let fx = setup().await;
        let err = fx.service.create(None, None).await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));

        let err = fx
            .service
            .create(Some(String::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));

        assert!(fx.service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_defaults_description_to_empty() {
        let fx = setup().await;
        let task = fx.service.create(Some("title".into()), None).await.unwrap();
        assert_eq!(task.description, "");
    }

    #[tokio::test]
    async fn list_reflects_creates_and_deletes() {
        let fx = setup().await;
        let a = fx.service.create(Some("a".into()), None).await.unwrap();
        let b = fx.service.create(Some("b".into()), None).await.unwrap();

        let ids: Vec<String> = fx
            .service
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        fx.service.delete(&a.id).await.unwrap();
        let ids: Vec<String> = fx
            .service
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let fx = setup().await;
        let err = fx.service.delete("missing").await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_changes_fields_and_rejects_empty_title() {
        let fx = setup().await;
        let task = fx
            .service
            .create(Some("old".into()), Some("desc".into()))
            .await
            .unwrap();

        let updated = fx
            .service
            .update(&task.id, Some("new".into()), None)
            .await
            .unwrap();
        assert_eq!(updated.title, "new");
        assert_eq!(updated.description, "desc");

        let err = fx
            .service
            .update(&task.id, Some(String::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));

        let err = fx
            .service
            .update("missing", Some("x".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn search_returns_hydrated_rows_in_creation_order() {
        let fx = setup().await;
        let a = fx
            .service
            .create(Some("write report".into()), None)
            .await
            .unwrap();
        fx.service.create(Some("unrelated".into()), None).await.unwrap();
        let c = fx
            .service
            .create(Some("review".into()), Some("the report again".into()))
            .await
            .unwrap();
        fx.projector.run_once().await.unwrap();

        let hits = fx.service.search("report").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), c.id.as_str()]);
        assert_eq!(hits[0].title, "write report");
    }

    #[tokio::test]
    async fn search_never_returns_deleted_tasks() {
        let fx = setup().await;
        let task = fx
            .service
            .create(Some("doomed report".into()), None)
            .await
            .unwrap();
        fx.projector.run_once().await.unwrap();
        assert_eq!(fx.service.search("doomed").await.unwrap().len(), 1);

        // Delete but leave the mirror stale: hydration must drop the id.
        fx.service.delete(&task.id).await.unwrap();
        assert!(fx.service.search("doomed").await.unwrap().is_empty());

        // And after the mirror catches up it stays gone.
        fx.projector.run_once().await.unwrap();
        assert!(fx.service.search("doomed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_misses_tasks_the_mirror_has_not_seen() {
        let fx = setup().await;
        fx.service
            .create(Some("fresh report".into()), None)
            .await
            .unwrap();

        // No projector pass yet — the mirror knows nothing.
        assert!(fx.service.search("fresh").await.unwrap().is_empty());

        fx.projector.run_once().await.unwrap();
        assert_eq!(fx.service.search("fresh").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_query_degenerates_to_the_full_list() {
        let fx = setup().await;
        let a = fx.service.create(Some("a task".into()), None).await.unwrap();
        let b = fx.service.create(Some("another".into()), None).await.unwrap();

        // No projector pass: the degenerate query never touches the mirror,
        // so the answer matches list() even while the mirror lags.
        let hits = fx.service.search("").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }

    #[tokio::test]
    async fn padded_queries_keep_their_whitespace() {
        let fx = setup().await;
        fx.service
            .create(Some("milkshake".into()), None)
            .await
            .unwrap();
        let spaced = fx
            .service
            .create(Some("oat milk order".into()), None)
            .await
            .unwrap();
        fx.projector.run_once().await.unwrap();

        // " milk " is not a substring of "milkshake"; the padding stays in
        // the pattern instead of being trimmed away.
        let hits = fx.service.search(" milk ").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![spaced.id.as_str()]);

        // A whitespace-only query matches only text that has whitespace.
        let hits = fx.service.search(" ").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![spaced.id.as_str()]);
    }
}
