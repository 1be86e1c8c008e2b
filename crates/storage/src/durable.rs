use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ActionType, DismissAction},
    stream::{
        PayloadWithId, SemanticPropertiesWithId, StreamPayload, StreamSharedState,
        StreamStructure,
    },
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tracing::{debug, error, warn};

use crate::{
    gc, new_session_id, AccessibleIdsSupplier, CommitResult, ContentStore, GcOutcome, GcTask,
    HEAD_SESSION_ID,
};

/// SQLite-backed store: a content key/value table plus an append-only
/// journal of structures per session.
#[derive(Clone)]
pub struct DurableStore {
    pool: Pool<Sqlite>,
}

impl DurableStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open feed store at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Closes the pool; every later operation fails.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn write_content(&self, payloads: &[PayloadWithId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in payloads {
            let encoded = serde_json::to_vec(&entry.payload)
                .with_context(|| format!("failed to encode payload for {}", entry.content_id))?;
            let is_shared_state = matches!(entry.payload, StreamPayload::SharedState(_));
            sqlx::query(
                "INSERT INTO content (content_id, payload, is_shared_state, updated_at)
                 VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT(content_id) DO UPDATE SET
                    payload = excluded.payload,
                    is_shared_state = excluded.is_shared_state,
                    updated_at = CURRENT_TIMESTAMP",
            )
            .bind(&entry.content_id)
            .bind(encoded)
            .bind(is_shared_state)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_journal(&self, session_id: &str, structures: &[StreamStructure]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if session_id != HEAD_SESSION_ID {
            sqlx::query("INSERT OR IGNORE INTO sessions (session_id) VALUES (?)")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }
        for structure in structures {
            sqlx::query("INSERT INTO session_journal (session_id, structure) VALUES (?, ?)")
                .bind(session_id)
                .bind(serde_json::to_vec(structure)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_semantic_properties(&self, entries: &[SemanticPropertiesWithId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO semantic_properties (content_id, semantic_data) VALUES (?, ?)
                 ON CONFLICT(content_id) DO UPDATE SET semantic_data = excluded.semantic_data",
            )
            .bind(&entry.content_id)
            .bind(&entry.semantic_data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_actions(&self, actions: &[DismissAction]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for action in actions {
            sqlx::query(
                "INSERT OR IGNORE INTO local_actions (content_id, action_type, recorded_at)
                 VALUES (?, ?, ?)",
            )
            .bind(&action.content_id)
            .bind(action.action_type.as_str())
            .bind(action.recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn commit_outcome(what: &str, result: Result<()>) -> CommitResult {
    match result {
        Ok(()) => CommitResult::Success,
        Err(err) => {
            error!("durable: {what} commit failed: {err:#}");
            CommitResult::Failure
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[async_trait]
impl ContentStore for DurableStore {
    async fn get_payloads(&self, content_ids: &[String]) -> Result<Vec<PayloadWithId>> {
        if content_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT content_id, payload FROM content WHERE content_id IN ({})",
            placeholders(content_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in content_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut payloads = Vec::with_capacity(rows.len());
        for row in rows {
            let content_id: String = row.try_get("content_id")?;
            let raw: Vec<u8> = row.try_get("payload")?;
            match serde_json::from_slice::<StreamPayload>(&raw) {
                Ok(payload) => payloads.push(PayloadWithId {
                    content_id,
                    payload,
                }),
                Err(err) => {
                    warn!("durable: undecodable payload skipped content_id={content_id}: {err}")
                }
            }
        }
        Ok(payloads)
    }

    async fn get_shared_states(&self) -> Result<Vec<StreamSharedState>> {
        let rows = sqlx::query("SELECT payload FROM content WHERE is_shared_state = 1")
            .fetch_all(&self.pool)
            .await?;
        let mut shared_states = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: Vec<u8> = row.try_get(0)?;
            if let StreamPayload::SharedState(shared_state) = serde_json::from_slice(&raw)? {
                shared_states.push(shared_state);
            }
        }
        Ok(shared_states)
    }

    async fn get_all_content_ids(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT content_id FROM content ORDER BY content_id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_stream_structures(&self, session_id: &str) -> Result<Vec<StreamStructure>> {
        let rows = sqlx::query(
            "SELECT structure FROM session_journal WHERE session_id = ? ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let raw: Vec<u8> = row.try_get(0)?;
                serde_json::from_slice(&raw)
                    .with_context(|| format!("corrupt journal entry in session {session_id}"))
            })
            .collect()
    }

    async fn get_all_sessions(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT session_id FROM sessions ORDER BY created_at, session_id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_semantic_properties(
        &self,
        content_ids: &[String],
    ) -> Result<Vec<SemanticPropertiesWithId>> {
        if content_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT content_id, semantic_data FROM semantic_properties WHERE content_id IN ({})",
            placeholders(content_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in content_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                Ok(SemanticPropertiesWithId {
                    content_id: row.try_get("content_id")?,
                    semantic_data: row.try_get("semantic_data")?,
                })
            })
            .collect()
    }

    async fn get_all_dismiss_actions(&self) -> Result<Vec<DismissAction>> {
        let rows = sqlx::query(
            "SELECT content_id, action_type, recorded_at FROM local_actions ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let content_id: String = row.try_get("content_id")?;
            let raw_type: String = row.try_get("action_type")?;
            let Some(action_type) = ActionType::parse(&raw_type) else {
                warn!("durable: unknown action type '{raw_type}' skipped content_id={content_id}");
                continue;
            };
            actions.push(DismissAction {
                content_id,
                action_type,
                recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
            });
        }
        Ok(actions)
    }

    async fn create_new_session(&self) -> Result<String> {
        let session_id = new_session_id();
        sqlx::query("INSERT INTO sessions (session_id) VALUES (?)")
            .bind(&session_id)
            .execute(&self.pool)
            .await
            .context("failed to create session")?;
        Ok(session_id)
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        if session_id == HEAD_SESSION_ID {
            bail!("head session cannot be removed");
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session_journal WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_head(&self) -> Result<()> {
        sqlx::query("DELETE FROM session_journal WHERE session_id = ?")
            .bind(HEAD_SESSION_ID)
            .execute(&self.pool)
            .await
            .context("failed to clear head journal")?;
        Ok(())
    }

    async fn commit_content(&self, payloads: Vec<PayloadWithId>) -> CommitResult {
        commit_outcome("content", self.write_content(&payloads).await)
    }

    async fn commit_session(
        &self,
        session_id: &str,
        structures: Vec<StreamStructure>,
    ) -> CommitResult {
        commit_outcome("session", self.write_journal(session_id, &structures).await)
    }

    async fn commit_semantic_properties(
        &self,
        entries: Vec<SemanticPropertiesWithId>,
    ) -> CommitResult {
        commit_outcome(
            "semantic properties",
            self.write_semantic_properties(&entries).await,
        )
    }

    async fn commit_actions(&self, actions: Vec<DismissAction>) -> CommitResult {
        commit_outcome("actions", self.write_actions(&actions).await)
    }

    fn trigger_content_gc(
        &self,
        reserved_ids: HashSet<String>,
        accessible_ids: AccessibleIdsSupplier,
    ) -> GcTask {
        let pool = self.pool.clone();
        Box::pin(async move {
            let accessible_ids = accessible_ids();
            let stored: Vec<String> = sqlx::query_scalar(
                "SELECT content_id FROM content UNION SELECT content_id FROM semantic_properties",
            )
            .fetch_all(&pool)
            .await?;
            let doomed = gc::collectable_content_ids(&stored, &reserved_ids, &accessible_ids);

            let mut tx = pool.begin().await?;
            for id in &doomed {
                sqlx::query("DELETE FROM content WHERE content_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM semantic_properties WHERE content_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await.context("content gc commit failed")?;
            debug!(
                "durable: content gc stored={} removed={}",
                stored.len(),
                doomed.len()
            );
            Ok(GcOutcome {
                removed: doomed.len(),
            })
        })
    }

    fn trigger_action_gc(&self, actions: Vec<DismissAction>, valid_ids: Vec<String>) -> GcTask {
        let pool = self.pool.clone();
        Box::pin(async move {
            let doomed = gc::invalid_actions(&actions, &valid_ids);
            let mut tx = pool.begin().await?;
            let mut removed = 0;
            for action in &doomed {
                removed += sqlx::query(
                    "DELETE FROM local_actions WHERE content_id = ? AND action_type = ?",
                )
                .bind(&action.content_id)
                .bind(action.action_type.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
            }
            tx.commit().await.context("action gc commit failed")?;
            Ok(GcOutcome { removed })
        })
    }

    async fn clear_non_action_content(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session_journal")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM content").execute(&mut *tx).await?;
        tx.commit()
            .await
            .context("failed to clear non-action content")?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "session_journal",
            "sessions",
            "content",
            "semantic_properties",
            "local_actions",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.context("failed to clear feed store")?;
        Ok(())
    }
}

/// Normalizes a configured database location into a sqlite url and makes
/// sure its parent directory exists.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return "sqlite::memory:".to_string();
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/durable_tests.rs"]
mod tests;
