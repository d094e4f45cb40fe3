//! Append-only conversation log (§4.2) — `Message`, `Thread`, and the
//! `MessageLog` engine that owns them both.
//!
//! Grounded on `adolfousier-opencrabs/src/memory/search.rs`'s sanitize-then-
//! query FTS shape, adapted from document search to message search, and on
//! the teacher's `*Service` wrapper convention
//! (`src/brain/agent/service/context.rs`).

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::store::Store;
use crate::token_counter::TokenCountable;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;
use uuid::Uuid;

/// §3 Message.role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(CoreError::Serialization(format!("unknown role: {other}"))),
        }
    }
}

/// §3 Message. Created by `MessageLog` only; never mutated after insert
/// except the post-hoc compaction fields (`compaction_level`, `summary`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub resource_id: Option<String>,
    pub role: Role,
    pub raw_content: String,
    pub search_text: String,
    pub injection_text: String,
    pub task_id: Option<Uuid>,
    pub summary: Option<String>,
    pub compaction_level: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub message_index: i64,
    pub token_count: Option<u32>,
}

impl Message {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let thread_id: String = row.get("thread_id")?;
        let task_id: Option<String> = row.get("task_id")?;
        let role: String = row.get("role")?;
        let created_at_ms: i64 = row.get("created_at")?;
        Ok(Message {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            thread_id: Uuid::parse_str(&thread_id).unwrap_or_default(),
            resource_id: row.get("resource_id")?,
            role: Role::parse(&role).unwrap_or(Role::User),
            raw_content: row.get("raw_content")?,
            search_text: row.get("search_text")?,
            injection_text: row.get("injection_text")?,
            task_id: task_id.and_then(|s| Uuid::parse_str(&s).ok()),
            summary: row.get("summary")?,
            compaction_level: row.get("compaction_level")?,
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
            message_index: row.get("message_index")?,
            token_count: row.get::<_, Option<i64>>("token_count")?.map(|v| v as u32),
        })
    }
}

impl TokenCountable for Message {
    fn token_text(&self) -> &str {
        &self.injection_text
    }
}

/// Input to `MessageLog::append`.
#[derive(Debug, Clone, Default)]
pub struct AppendMessageInput {
    pub thread_id: Uuid,
    pub resource_id: Option<String>,
    pub role: Option<Role>,
    pub raw_content: String,
    pub search_text: Option<String>,
    pub injection_text: Option<String>,
    pub task_id: Option<Uuid>,
    pub session_id: Option<String>,
}

/// A search hit, carrying the two scores §4.2 requires alongside the
/// message: the raw BM25 match score and the recency-adjusted final rank
/// actually used to order results.
#[derive(Debug, Clone)]
pub struct MessageSearchHit {
    pub message: Message,
    pub match_score: f64,
    pub final_rank: f64,
}

/// Recency tie-break coefficient from §4.2: `final_rank = bm25 − created_at·R`.
const RECENCY_COEFFICIENT: f64 = 1e-7;

/// §3 Thread — container for messages with mutable metadata, notably
/// `activeTaskId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub resource_id: Option<String>,
    pub title: Option<String>,
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let metadata: String = row.get("metadata")?;
        let created_at_ms: i64 = row.get("created_at")?;
        let updated_at_ms: i64 = row.get("updated_at")?;
        Ok(Thread {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            resource_id: row.get("resource_id")?,
            title: row.get("title")?,
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at_ms).unwrap_or_else(Utc::now),
        })
    }
}

/// Owns `Message`/`Thread` rows. See spec §4.2.
pub struct MessageLog {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl MessageLog {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Creates a thread if it doesn't already exist, otherwise this is a
    /// no-op. Threads are otherwise managed entirely through their
    /// metadata (`set_active_task`) and message appends.
    pub async fn ensure_thread(&self, id: Uuid, resource_id: Option<String>) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO threads (id, resource_id, title, metadata, created_at, updated_at)
                     VALUES (?1, ?2, NULL, '{}', ?3, ?3)",
                    params![id.to_string(), resource_id, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Resolves `activeTaskId` from a thread's metadata blob, if any.
    async fn active_task_id(&self, thread_id: Uuid) -> Result<Option<Uuid>> {
        self.store
            .with_conn(move |conn| {
                let metadata: Option<String> = conn
                    .query_row(
                        "SELECT metadata FROM threads WHERE id = ?1",
                        params![thread_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(metadata) = metadata else {
                    return Ok(None);
                };
                let json: Json = serde_json::from_str(&metadata)?;
                let active = json
                    .get("activeTaskId")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok());
                Ok(active)
            })
            .await
    }

    /// The active task's owning session id, if the active task exists.
    async fn active_task_session(&self, task_id: Uuid) -> Result<Option<String>> {
        self.store
            .with_conn(move |conn| {
                let session_id: Option<String> = conn
                    .query_row(
                        "SELECT session_id FROM tasks WHERE id = ?1",
                        params![task_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten();
                Ok(session_id)
            })
            .await
    }

    /// §4.2 `append`. Computes `message_index`, resolves auto-link to the
    /// thread's active task, defaults `search_text`/`injection_text` to
    /// `raw_content`, and (when linked) inserts the implicit
    /// `task_messages` row with `relation_type = "output"`.
    pub async fn append(&self, input: AppendMessageInput) -> Result<Message> {
        self.ensure_thread(input.thread_id, input.resource_id.clone())
            .await?;

        let task_id = match input.task_id {
            Some(id) => Some(id),
            None => self.resolve_auto_link(input.thread_id, input.session_id.as_deref()).await?,
        };

        let id = Uuid::now_v7();
        let now = self.clock.now_millis();
        let role = input.role.unwrap_or(Role::User);
        let search_text = input.search_text.clone().unwrap_or_else(|| input.raw_content.clone());
        let injection_text = input
            .injection_text
            .clone()
            .unwrap_or_else(|| input.raw_content.clone());
        let thread_id = input.thread_id;
        let resource_id = input.resource_id.clone();
        let raw_content = input.raw_content.clone();

        let message = self
            .store
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                    params![thread_id.to_string()],
                    |r| r.get(0),
                )?;

                conn.execute(
                    "INSERT INTO messages (
                        id, thread_id, resource_id, role, raw_content, search_text,
                        injection_text, task_id, summary, compaction_level, created_at,
                        message_index, token_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, ?10, NULL)",
                    params![
                        id.to_string(),
                        thread_id.to_string(),
                        resource_id,
                        role.as_str(),
                        raw_content,
                        search_text,
                        injection_text,
                        task_id.map(|t| t.to_string()),
                        now,
                        count,
                    ],
                )?;

                conn.query_row(
                    "SELECT * FROM messages WHERE id = ?1",
                    params![id.to_string()],
                    Message::from_row,
                )
                .map_err(CoreError::from)
            })
            .await?;

        if let Some(task_id) = message.task_id {
            self.link_message(task_id, message.id, "output").await?;
        }

        Ok(message)
    }

    /// Auto-link resolution from §4.2: no link if there's no active task;
    /// otherwise link iff no session was supplied, or the supplied session
    /// matches the active task's owning session.
    async fn resolve_auto_link(
        &self,
        thread_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let Some(active_task) = self.active_task_id(thread_id).await? else {
            return Ok(None);
        };
        let task_session = self.active_task_session(active_task).await?;
        let linked = match (session_id, task_session.as_deref()) {
            (None, _) => true,
            (Some(given), Some(task_session)) => given == task_session,
            (Some(_), None) => false,
        };
        Ok(if linked { Some(active_task) } else { None })
    }

    /// Records an explicit or implicit task/message link.
    pub async fn link_message(&self, task_id: Uuid, message_id: Uuid, relation_type: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let relation_type = relation_type.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO task_messages (task_id, message_id, relation_type, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task_id.to_string(), message_id.to_string(), relation_type, now],
                )?;
                Ok(())
            })
            .await
    }

    /// §4.2 `list`. Ordered by `message_index` ascending.
    pub async fn list(
        &self,
        thread_id: Option<Uuid>,
        resource_id: Option<String>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        let limit = limit.unwrap_or(100) as i64;
        self.store
            .with_conn(move |conn| {
                let (sql, id): (&str, String) = if let Some(tid) = thread_id {
                    (
                        "SELECT * FROM messages WHERE thread_id = ?1 ORDER BY message_index ASC LIMIT ?2",
                        tid.to_string(),
                    )
                } else if let Some(rid) = &resource_id {
                    (
                        "SELECT * FROM messages WHERE resource_id = ?1 ORDER BY message_index ASC LIMIT ?2",
                        rid.clone(),
                    )
                } else {
                    return Ok(Vec::new());
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(params![id, limit], Message::from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
    }

    /// §4.2 `count`.
    pub async fn count(&self, thread_id: Uuid) -> Result<i64> {
        self.store
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                    params![thread_id.to_string()],
                    |r| r.get(0),
                )?)
            })
            .await
    }

    /// §4.2 `delete`.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.store
            .with_conn(move |conn| {
                conn.execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])?;
                Ok(())
            })
            .await
    }

    /// §4.2 `search`. BM25-ranked, recency tie-broken toward newer hits.
    /// Invalid FTS syntax (e.g. a bare `"` from a query sanitize bug)
    /// returns an empty result rather than propagating, matching §4.2's
    /// failure semantics; storage errors still propagate.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<u32>,
        thread_id: Option<Uuid>,
    ) -> Result<Vec<MessageSearchHit>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(5) as i64;

        self.store
            .with_conn(move |conn| {
                let sql = if thread_id.is_some() {
                    "SELECT m.*, bm25(messages_fts) AS score
                     FROM messages_fts
                     JOIN messages m ON m.rowid = messages_fts.rowid
                     WHERE messages_fts MATCH ?1 AND m.thread_id = ?2
                     ORDER BY (bm25(messages_fts) - m.created_at * ?3) ASC
                     LIMIT ?4"
                } else {
                    "SELECT m.*, bm25(messages_fts) AS score
                     FROM messages_fts
                     JOIN messages m ON m.rowid = messages_fts.rowid
                     WHERE messages_fts MATCH ?1
                     ORDER BY (bm25(messages_fts) - m.created_at * ?3) ASC
                     LIMIT ?4"
                };

                let mut stmt = match conn.prepare(sql) {
                    Ok(s) => s,
                    Err(_) => return Ok(Vec::new()),
                };

                let map_row = |row: &Row| -> rusqlite::Result<MessageSearchHit> {
                    let message = Message::from_row(row)?;
                    let score: f64 = row.get("score")?;
                    let created_at_ms = message.created_at.timestamp_millis() as f64;
                    Ok(MessageSearchHit {
                        message,
                        match_score: score,
                        final_rank: score - created_at_ms * RECENCY_COEFFICIENT,
                    })
                };

                let rows = if let Some(tid) = thread_id {
                    stmt.query_map(
                        params![fts_query, tid.to_string(), RECENCY_COEFFICIENT, limit],
                        map_row,
                    )
                } else {
                    stmt.query_map(params![fts_query, RECENCY_COEFFICIENT, limit], map_row)
                };

                let rows = match rows {
                    Ok(r) => r,
                    Err(_) => return Ok(Vec::new()),
                };

                let mut out = Vec::new();
                for r in rows {
                    match r {
                        Ok(hit) => out.push(hit),
                        Err(_) => return Ok(Vec::new()),
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Sets a thread's `activeTaskId` metadata field. Used by
    /// `TaskGraph::claim`/`close`; lives here because `Thread` rows are
    /// owned by `MessageLog`.
    pub async fn set_active_task(&self, thread_id: Uuid, task_id: Option<Uuid>) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .with_conn(move |conn| {
                let metadata: Option<String> = conn
                    .query_row(
                        "SELECT metadata FROM threads WHERE id = ?1",
                        params![thread_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?;
                let mut json: Json = metadata
                    .map(|m| serde_json::from_str(&m))
                    .transpose()?
                    .unwrap_or_else(|| serde_json::json!({}));
                match task_id {
                    Some(tid) => {
                        json["activeTaskId"] = Json::String(tid.to_string());
                    }
                    None => {
                        if let Some(obj) = json.as_object_mut() {
                            obj.remove("activeTaskId");
                        }
                    }
                }
                conn.execute(
                    "UPDATE threads SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&json)?, now, thread_id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// All thread ids whose metadata currently points `activeTaskId` at
    /// `task_id`. Used by `TaskGraph::close` to clear every such binding.
    pub async fn threads_with_active_task(&self, task_id: Uuid) -> Result<Vec<Uuid>> {
        let needle = format!("\"{task_id}\"");
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, metadata FROM threads WHERE metadata LIKE '%activeTaskId%'",
                )?;
                let rows = stmt.query_map([], |row| {
                    let id: String = row.get(0)?;
                    let metadata: String = row.get(1)?;
                    Ok((id, metadata))
                })?;
                let mut out = Vec::new();
                for r in rows {
                    let (id, metadata) = r?;
                    if metadata.contains(&needle) {
                        if let Ok(uuid) = Uuid::parse_str(&id) {
                            out.push(uuid);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Fetches a thread by id, if it exists.
    pub async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>> {
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT * FROM threads WHERE id = ?1",
                    params![id.to_string()],
                    Thread::from_row,
                )
                .optional()
                .map_err(CoreError::from)
            })
            .await
    }

    /// Sets a thread's title.
    pub async fn set_title(&self, thread_id: Uuid, title: String) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE threads SET title = ?1, updated_at = ?2 WHERE id = ?3",
                    params![title, now, thread_id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// Cascade-deletes a thread and (via `ON DELETE CASCADE`) its messages,
    /// task links, observational-memory record, and reflections (§3
    /// ownership/lifecycle section).
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<()> {
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM threads WHERE id = ?1",
                    params![thread_id.to_string()],
                )?;
                conn.execute(
                    "DELETE FROM observational_memory WHERE lookup_key = ?1",
                    params![format!("thread:{thread_id}")],
                )?;
                Ok(())
            })
            .await
    }
}

/// Wraps each word in double quotes so FTS5 doesn't choke on punctuation in
/// the query, joining with an implicit AND — the same sanitize strategy
/// `adolfousier-opencrabs/src/memory/search.rs::sanitize_fts_query` uses.
pub(crate) fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            let clean: String = w.chars().filter(|c| *c != '"').collect();
            format!("\"{clean}\"")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn log() -> MessageLog {
        let store = Store::open_in_memory().await.unwrap();
        MessageLog::new(store, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn append_assigns_increasing_message_index() {
        let log = log().await;
        let thread_id = Uuid::now_v7();
        for i in 0..3 {
            let msg = log
                .append(AppendMessageInput {
                    thread_id,
                    raw_content: format!("hello {i}"),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(msg.message_index, i);
        }
        assert_eq!(log.count(thread_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn search_text_and_injection_text_default_to_raw_content() {
        let log = log().await;
        let thread_id = Uuid::now_v7();
        let msg = log
            .append(AppendMessageInput {
                thread_id,
                raw_content: "the raw content".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(msg.search_text, "the raw content");
        assert_eq!(msg.injection_text, "the raw content");
    }

    #[tokio::test]
    async fn sanitize_empty_query_short_circuits_to_empty_results() {
        let log = log().await;
        let hits = log.search("", None, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_finds_indexed_content_preserving_identifier_tokens() {
        let log = log().await;
        let thread_id = Uuid::now_v7();
        log.append(AppendMessageInput {
            thread_id,
            raw_content: "rotate refresh_tokens before expiry".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let hits = log.search("refresh_tokens", None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
