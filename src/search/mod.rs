// SPDX-License-Identifier: MIT
//! Secondary search index over task titles and descriptions.
//!
//! Lives in its own SQLite database (`search.db`) next to the primary store
//! and is written only by the outbox projector, never by request handlers.
//! Rows are keyed by `task_id`, the same id the primary store assigns, so an
//! index entry can always be traced back to its canonical record.
//!
//! The index is an FTS5 table with the trigram tokenizer. Queries use plain
//! `LIKE`, which keeps exact case-insensitive substring semantics while
//! letting SQLite serve patterns of three or more characters from the
//! trigram index instead of a table scan.

pub mod projector;

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Searchable projection of one task. Everything the index needs to answer
/// a query; canonical fields stay in the primary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDocument {
    pub task_id: String,
    pub title: String,
    pub description: String,
}

/// Handle to the search mirror database.
#[derive(Clone)]
pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    /// Open (or create) the mirror database under `data_dir`.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("search.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS task_search USING fts5(
                 task_id UNINDEXED,
                 title,
                 description,
                 tokenize = 'trigram'
             )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Insert or replace the index entry for one task.
    pub async fn upsert(&self, doc: &SearchDocument) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_search WHERE task_id = ?")
            .bind(&doc.task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO task_search (task_id, title, description) VALUES (?, ?, ?)")
            .bind(&doc.task_id)
            .bind(&doc.title)
            .bind(&doc.description)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop the index entry for one task. Removing an id that was never
    /// indexed is a no-op, so replays are safe.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_search WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids of tasks whose title or description contains `query` as a
    /// case-insensitive substring. The query is matched verbatim — padding
    /// narrows the match rather than being stripped, and the empty query is
    /// a substring of everything, so it matches every indexed task.
    pub async fn search(&self, query: &str) -> Result<Vec<String>> {
        let pattern = format!("%{}%", escape_like(query));
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT task_id FROM task_search
             WHERE title LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\'",
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Remove every entry. Used by `reindex` before replaying the primary.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM task_search")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn doc_count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_search")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

/// Escape `%`, `_` and the escape character itself so user input only ever
/// matches literally inside a LIKE pattern.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────
