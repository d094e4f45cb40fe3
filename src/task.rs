//! Task graph (§4.3) — `Task`, `TaskDependency`, dependency-DAG readiness,
//! and the claim/close lifecycle that writes the soft `activeTaskId`
//! reference back into thread metadata.
//!
//! Grounded on the teacher's `*Service` wrapper convention
//! (`src/brain/agent/service/*`); readiness/cycle-detection has no
//! retrieved-file analogue and is original engineering over an in-memory
//! adjacency map built from `task_dependencies` rows.

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, TaskUpdatedEvent};
use crate::message::{sanitize_fts_query, MessageLog};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "closed" => TaskStatus::Closed,
            _ => TaskStatus::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Wontfix,
    Duplicate,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Wontfix => "wontfix",
            CloseReason::Duplicate => "duplicate",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(CloseReason::Completed),
            "wontfix" => Some(CloseReason::Wontfix),
            "duplicate" => Some(CloseReason::Duplicate),
            _ => None,
        }
    }
}

/// §3 Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Option<String>,
    pub task_type: Option<String>,
    pub assignee: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub summary: Option<String>,
    pub metadata: Json,
}

impl Task {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let close_reason: Option<String> = row.get("close_reason")?;
        let metadata: String = row.get("metadata")?;
        let created_at_ms: i64 = row.get("created_at")?;
        let updated_at_ms: i64 = row.get("updated_at")?;
        let closed_at_ms: Option<i64> = row.get("closed_at")?;
        Ok(Task {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            title: row.get("title")?,
            description: row.get("description")?,
            status: TaskStatus::parse(&status),
            priority: row.get("priority")?,
            task_type: row.get("type")?,
            assignee: row.get("assignee")?,
            session_id: row.get("session_id")?,
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at_ms).unwrap_or_else(Utc::now),
            closed_at: closed_at_ms.and_then(DateTime::from_timestamp_millis),
            close_reason: close_reason.and_then(|s| CloseReason::parse(&s)),
            summary: row.get("summary")?,
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskInput {
    pub title: String,
    pub description: String,
    pub priority: Option<String>,
    pub task_type: Option<String>,
    pub assignee: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Json>,
}

/// Patch applied by `TaskGraph::update`. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub task_type: Option<String>,
    pub assignee: Option<String>,
    pub metadata: Option<Json>,
}

/// §3 TaskDependency.relation default.
pub const DEPENDENCY_TYPE_BLOCKS: &str = "blocks";

#[derive(Debug, Clone)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on_id: Uuid,
    pub dependency_type: String,
}

/// Owns `Task`/`TaskDependency`/`TaskMessage` rows. See spec §4.3.
pub struct TaskGraph {
    store: Store,
    clock: Arc<dyn Clock>,
    messages: Arc<MessageLog>,
    events: Arc<dyn EventBus>,
}

impl TaskGraph {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        messages: Arc<MessageLog>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            store,
            clock,
            messages,
            events,
        }
    }

    /// §4.3 `create`. Publishes `task-updated` when `session_id` is set.
    pub async fn create(&self, input: CreateTaskInput) -> Result<Task> {
        let id = Uuid::now_v7();
        let now = self.clock.now_millis();
        let metadata = input.metadata.unwrap_or_else(|| serde_json::json!({}));
        let metadata_str = serde_json::to_string(&metadata)?;
        let session_id = input.session_id.clone();

        let task = self
            .store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (
                        id, title, description, status, priority, type, assignee,
                        session_id, created_at, updated_at, closed_at, close_reason,
                        summary, metadata
                    ) VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?6, ?7, ?8, ?8, NULL, NULL, NULL, ?9)",
                    params![
                        id.to_string(),
                        input.title,
                        input.description,
                        input.priority,
                        input.task_type,
                        input.assignee,
                        input.session_id,
                        now,
                        metadata_str,
                    ],
                )?;
                conn.query_row(
                    "SELECT * FROM tasks WHERE id = ?1",
                    params![id.to_string()],
                    Task::from_row,
                )
                .map_err(CoreError::from)
            })
            .await?;

        if let Some(session_id) = session_id {
            self.publish_task_updated(&session_id).await;
        }
        Ok(task)
    }

    /// §4.3 `update`. Publishes `task-updated` when the task has a
    /// `session_id`.
    pub async fn update(&self, id: Uuid, patch: UpdateTaskInput) -> Result<Task> {
        let now = self.clock.now_millis();
        let existing = self.get(id).await?.ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        let title = patch.title.unwrap_or(existing.title);
        let description = patch.description.unwrap_or(existing.description);
        let priority = patch.priority.or(existing.priority);
        let task_type = patch.task_type.or(existing.task_type);
        let assignee = patch.assignee.or(existing.assignee);
        let metadata = patch.metadata.unwrap_or(existing.metadata);
        let metadata_str = serde_json::to_string(&metadata)?;

        let task = self
            .store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tasks SET title = ?1, description = ?2, priority = ?3, type = ?4,
                     assignee = ?5, metadata = ?6, updated_at = ?7 WHERE id = ?8",
                    params![title, description, priority, task_type, assignee, metadata_str, now, id.to_string()],
                )?;
                conn.query_row(
                    "SELECT * FROM tasks WHERE id = ?1",
                    params![id.to_string()],
                    Task::from_row,
                )
                .map_err(CoreError::from)
            })
            .await?;

        if let Some(session_id) = &task.session_id {
            self.publish_task_updated(session_id).await;
        }
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT * FROM tasks WHERE id = ?1",
                    params![id.to_string()],
                    Task::from_row,
                )
                .optional()
                .map_err(CoreError::from)
            })
            .await
    }

    /// §4.3 `claim`. Refuses a closed task or a blocked one (§3 readiness).
    /// Claiming an already-claimed task is idempotent for the same session;
    /// it fails if the thread already holds a *different* active task.
    pub async fn claim(&self, id: Uuid, thread_id: Option<Uuid>, session_id: Option<String>) -> Result<Task> {
        let task = self.get(id).await?.ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        if task.status == TaskStatus::Closed {
            return Err(CoreError::PreconditionFailed(format!(
                "task {id} is closed and cannot be claimed"
            )));
        }

        if self.readiness(id).await? == Readiness::Blocked {
            return Err(CoreError::PreconditionFailed(format!(
                "task {id} is blocked by an open dependency"
            )));
        }

        if task.status == TaskStatus::InProgress {
            let same_session = match (&task.session_id, &session_id) {
                (Some(a), Some(b)) => a == b,
                (None, None) => true,
                _ => false,
            };
            if !same_session {
                return Err(CoreError::Conflict(format!(
                    "task {id} is already claimed by a different session"
                )));
            }
        }

        if let Some(thread_id) = thread_id {
            if let Some(thread) = self.messages.get_thread(thread_id).await? {
                if let Some(existing) = thread
                    .metadata
                    .get("activeTaskId")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    if existing != id {
                        if let Some(existing_task) = self.get(existing).await? {
                            let existing_session_matches = match (&existing_task.session_id, &session_id) {
                                (Some(a), Some(b)) => a == b,
                                _ => false,
                            };
                            if existing_task.status != TaskStatus::Closed && existing_session_matches {
                                return Err(CoreError::PreconditionFailed(format!(
                                    "thread {thread_id} already holds active task {existing}"
                                )));
                            }
                        }
                    }
                }
            }
        }

        let now = self.clock.now_millis();
        let session_id_clone = session_id.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = 'in_progress', session_id = COALESCE(?1, session_id), updated_at = ?2 WHERE id = ?3",
                    params![session_id_clone, now, id.to_string()],
                )?;
                Ok(())
            })
            .await?;

        if let Some(thread_id) = thread_id {
            self.messages.set_active_task(thread_id, Some(id)).await?;
        }

        let task = self.get(id).await?.ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if let Some(session_id) = &task.session_id {
            self.publish_task_updated(session_id).await;
        }
        Ok(task)
    }

    /// §4.3 `close`. Refuses without both `reason` and a non-empty
    /// `summary`; clears `activeTaskId` from every thread pointing at this
    /// task (INV-7).
    pub async fn close(&self, id: Uuid, reason: CloseReason, summary: String) -> Result<Task> {
        if summary.trim().is_empty() {
            return Err(CoreError::PreconditionFailed(
                "close requires a non-empty summary".to_string(),
            ));
        }
        self.get(id).await?.ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        let now = self.clock.now_millis();
        let reason_str = reason.as_str().to_string();
        let summary_clone = summary.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = 'closed', close_reason = ?1, summary = ?2,
                     closed_at = ?3, updated_at = ?3 WHERE id = ?4",
                    params![reason_str, summary_clone, now, id.to_string()],
                )?;
                Ok(())
            })
            .await?;

        for thread_id in self.messages.threads_with_active_task(id).await? {
            self.messages.set_active_task(thread_id, None).await?;
        }

        let task = self.get(id).await?.ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if let Some(session_id) = &task.session_id {
            self.publish_task_updated(session_id).await;
        }
        Ok(task)
    }

    /// §4.3 `addDependency`. Refuses if the edge would introduce a cycle
    /// (INV-6).
    pub async fn add_dependency(&self, task_id: Uuid, depends_on_id: Uuid, dep_type: Option<String>) -> Result<()> {
        if task_id == depends_on_id {
            return Err(CoreError::PreconditionFailed(
                "a task cannot depend on itself".to_string(),
            ));
        }
        let graph = self.load_dependency_graph().await?;
        if would_create_cycle(&graph, task_id, depends_on_id) {
            return Err(CoreError::PreconditionFailed(format!(
                "adding dependency {task_id} -> {depends_on_id} would introduce a cycle"
            )));
        }

        let now = self.clock.now_millis();
        let dep_type = dep_type.unwrap_or_else(|| DEPENDENCY_TYPE_BLOCKS.to_string());
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id, type, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task_id.to_string(), depends_on_id.to_string(), dep_type, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn remove_dependency(&self, task_id: Uuid, depends_on_id: Uuid, dep_type: Option<String>) -> Result<()> {
        let dep_type = dep_type.unwrap_or_else(|| DEPENDENCY_TYPE_BLOCKS.to_string());
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on_id = ?2 AND type = ?3",
                    params![task_id.to_string(), depends_on_id.to_string(), dep_type],
                )?;
                Ok(())
            })
            .await
    }

    /// Loads the full `blocks`-typed adjacency map: `task -> [depends_on]`.
    async fn load_dependency_graph(&self) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, depends_on_id FROM task_dependencies WHERE type = 'blocks'",
                )?;
                let rows = stmt.query_map([], |row| {
                    let task_id: String = row.get(0)?;
                    let depends_on_id: String = row.get(1)?;
                    Ok((task_id, depends_on_id))
                })?;
                let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
                for r in rows {
                    let (task_id, depends_on_id) = r?;
                    if let (Ok(a), Ok(b)) = (Uuid::parse_str(&task_id), Uuid::parse_str(&depends_on_id)) {
                        graph.entry(a).or_default().push(b);
                    }
                }
                Ok(graph)
            })
            .await
    }

    /// §3 readiness: a task is ready iff every `blocks` predecessor is
    /// closed.
    pub async fn readiness(&self, task_id: Uuid) -> Result<Readiness> {
        let predecessors = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1 AND type = 'blocks'",
                )?;
                let rows = stmt.query_map(params![task_id.to_string()], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;

        for dep in predecessors {
            let Ok(dep_id) = Uuid::parse_str(&dep) else { continue };
            match self.get(dep_id).await? {
                Some(task) if task.status == TaskStatus::Closed => continue,
                _ => return Ok(Readiness::Blocked),
            }
        }
        Ok(Readiness::Ready)
    }

    /// §4.3 `readySet`: `open` tasks whose every `blocks` predecessor is
    /// `closed`. O(|V|+|E|): loads the graph once, then a single pass per
    /// open task over its (typically short) predecessor list.
    pub async fn ready_set(&self) -> Result<Vec<Task>> {
        let graph = self.load_dependency_graph().await?;
        let open_tasks = self
            .store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM tasks WHERE status = 'open'")?;
                let rows = stmt.query_map([], Task::from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;

        let closed_status: HashMap<Uuid, TaskStatus> = self
            .store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id, status FROM tasks")?;
                let rows = stmt.query_map([], |row| {
                    let id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok((id, status))
                })?;
                let mut out = HashMap::new();
                for r in rows {
                    let (id, status) = r?;
                    if let Ok(id) = Uuid::parse_str(&id) {
                        out.insert(id, TaskStatus::parse(&status));
                    }
                }
                Ok(out)
            })
            .await?;

        let mut ready = Vec::new();
        for task in open_tasks {
            let predecessors = graph.get(&task.id);
            let blocked = predecessors.is_some_and(|preds| {
                preds
                    .iter()
                    .any(|p| closed_status.get(p) != Some(&TaskStatus::Closed))
            });
            if !blocked {
                ready.push(task);
            }
        }
        Ok(ready)
    }

    /// §4.3 `search`: FTS over task titles/descriptions.
    pub async fn search(&self, query: &str, limit: Option<u32>) -> Result<Vec<Task>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(10) as i64;
        self.store
            .with_conn(move |conn| {
                let mut stmt = match conn.prepare(
                    "SELECT t.* FROM tasks_fts
                     JOIN tasks t ON t.rowid = tasks_fts.rowid
                     WHERE tasks_fts MATCH ?1
                     ORDER BY bm25(tasks_fts) ASC
                     LIMIT ?2",
                ) {
                    Ok(s) => s,
                    Err(_) => return Ok(Vec::new()),
                };
                let rows = match stmt.query_map(params![fts_query, limit], Task::from_row) {
                    Ok(r) => r,
                    Err(_) => return Ok(Vec::new()),
                };
                let mut out = Vec::new();
                for r in rows {
                    match r {
                        Ok(t) => out.push(t),
                        Err(_) => return Ok(Vec::new()),
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Explicit task/message link (as opposed to the implicit one
    /// `MessageLog::append` creates for an active-task session match).
    pub async fn link_message(&self, task_id: Uuid, message_id: Uuid, relation_type: &str) -> Result<()> {
        self.messages.link_message(task_id, message_id, relation_type).await
    }

    async fn publish_task_updated(&self, session_id: &str) {
        let tasks = self
            .store
            .with_conn({
                let session_id = session_id.to_string();
                move |conn| {
                    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE session_id = ?1")?;
                    let rows = stmt.query_map(params![session_id], Task::from_row)?;
                    let mut out = Vec::new();
                    for r in rows {
                        out.push(r?);
                    }
                    Ok(out)
                }
            })
            .await;

        // §7: task-updated publish failures are swallowed.
        if let Ok(tasks) = tasks {
            self.events
                .publish_task_updated(TaskUpdatedEvent {
                    session_id: session_id.to_string(),
                    tasks,
                })
                .await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked,
}

/// BFS from `depends_on_id` over the existing graph: if `task_id` is
/// reachable, adding `task_id -> depends_on_id` would close a cycle.
fn would_create_cycle(graph: &HashMap<Uuid, Vec<Uuid>>, task_id: Uuid, depends_on_id: Uuid) -> bool {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut queue: VecDeque<Uuid> = VecDeque::new();
    queue.push_back(depends_on_id);
    visited.insert(depends_on_id);
    while let Some(node) = queue.pop_front() {
        if node == task_id {
            return true;
        }
        if let Some(neighbors) = graph.get(&node) {
            for &n in neighbors {
                if visited.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }
    false
}
