//! `ObservationalMemory` row shape (§3) and its JSON-serialized sub-fields.
//! Grounded on `message.rs`'s `from_row` convention; the lease quadruple and
//! state flags are plain columns rather than a nested struct so
//! `conditional_update` can target them directly.

use crate::config::{ObservationConfig, Scope};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// §3 BufferedObservationChunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedObservationChunk {
    pub content: String,
    pub message_ids: Vec<Uuid>,
    pub message_tokens: u32,
    pub created_at: DateTime<Utc>,
}

/// §3 ObservationalMemory. One row per `lookup_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationalMemory {
    pub id: Uuid,
    pub thread_id: Option<Uuid>,
    pub resource_id: Option<String>,
    pub scope: Scope,
    pub lookup_key: String,
    pub config: ObservationConfig,
    pub active_observations: String,
    pub buffered_observation_chunks: Vec<BufferedObservationChunk>,
    pub observed_message_ids: Vec<Uuid>,
    pub is_observing: bool,
    pub is_reflecting: bool,
    pub is_buffering_observation: bool,
    pub is_buffering_reflection: bool,
    pub lock_owner_id: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub lock_operation_id: Option<Uuid>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_buffered_at_tokens: Option<u32>,
    pub last_buffered_at_time: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub generation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `thread:<id>` or `resource:<id>` (§3/GLOSSARY).
pub fn lookup_key(thread_id: Option<Uuid>, resource_id: Option<&str>, scope: Scope) -> Result<String> {
    match scope {
        Scope::Thread => {
            let id = thread_id.ok_or_else(|| {
                CoreError::PreconditionFailed("thread scope requires a thread_id".to_string())
            })?;
            Ok(format!("thread:{id}"))
        }
        Scope::Resource => {
            let id = resource_id.ok_or_else(|| {
                CoreError::PreconditionFailed("resource scope requires a resource_id".to_string())
            })?;
            Ok(format!("resource:{id}"))
        }
    }
}

impl ObservationalMemory {
    pub(crate) fn new(thread_id: Option<Uuid>, resource_id: Option<String>, config: ObservationConfig) -> Result<Self> {
        let lookup_key = lookup_key(thread_id, resource_id.as_deref(), config.scope)?;
        Ok(Self {
            id: Uuid::now_v7(),
            thread_id,
            resource_id,
            scope: config.scope,
            lookup_key,
            config,
            active_observations: String::new(),
            buffered_observation_chunks: Vec::new(),
            observed_message_ids: Vec::new(),
            is_observing: false,
            is_reflecting: false,
            is_buffering_observation: false,
            is_buffering_reflection: false,
            lock_owner_id: None,
            lock_expires_at: None,
            lock_operation_id: None,
            last_heartbeat_at: None,
            last_buffered_at_tokens: None,
            last_buffered_at_time: None,
            last_observed_at: None,
            generation_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let thread_id: Option<String> = row.get("thread_id")?;
        let scope: String = row.get("scope")?;
        let config: String = row.get("config")?;
        let buffered: String = row.get("buffered_observation_chunks")?;
        let observed: String = row.get("observed_message_ids")?;
        let lock_operation_id: Option<String> = row.get("lock_operation_id")?;
        let lock_expires_at: Option<i64> = row.get("lock_expires_at")?;
        let last_heartbeat_at: Option<i64> = row.get("last_heartbeat_at")?;
        let last_buffered_at_time: Option<i64> = row.get("last_buffered_at_time")?;
        let last_observed_at: Option<i64> = row.get("last_observed_at")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;

        Ok(ObservationalMemory {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            thread_id: thread_id.and_then(|s| Uuid::parse_str(&s).ok()),
            resource_id: row.get("resource_id")?,
            scope: if scope == "resource" { Scope::Resource } else { Scope::Thread },
            lookup_key: row.get("lookup_key")?,
            config: serde_json::from_str(&config).unwrap_or_else(|_| ObservationConfig::new(Scope::Thread)),
            active_observations: row.get("active_observations")?,
            buffered_observation_chunks: serde_json::from_str(&buffered).unwrap_or_default(),
            observed_message_ids: serde_json::from_str(&observed).unwrap_or_default(),
            is_observing: row.get::<_, i64>("is_observing")? != 0,
            is_reflecting: row.get::<_, i64>("is_reflecting")? != 0,
            is_buffering_observation: row.get::<_, i64>("is_buffering_observation")? != 0,
            is_buffering_reflection: row.get::<_, i64>("is_buffering_reflection")? != 0,
            lock_owner_id: row.get("lock_owner_id")?,
            lock_expires_at: lock_expires_at.and_then(DateTime::from_timestamp_millis),
            lock_operation_id: lock_operation_id.and_then(|s| Uuid::parse_str(&s).ok()),
            last_heartbeat_at: last_heartbeat_at.and_then(DateTime::from_timestamp_millis),
            last_buffered_at_tokens: row.get::<_, Option<i64>>("last_buffered_at_tokens")?.map(|v| v as u32),
            last_buffered_at_time: last_buffered_at_time.and_then(DateTime::from_timestamp_millis),
            last_observed_at: last_observed_at.and_then(DateTime::from_timestamp_millis),
            generation_count: row.get::<_, i64>("generation_count")? as u32,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        })
    }

    /// Tokens the threshold comparator treats as "already spent" on
    /// observation buffering (GLOSSARY "pending tokens").
    pub fn pending_from_storage(&self) -> u32 {
        self.last_buffered_at_tokens.unwrap_or(0)
    }
}

pub(crate) async fn fetch_or_create(
    store: &crate::store::Store,
    thread_id: Option<Uuid>,
    resource_id: Option<String>,
    config: ObservationConfig,
) -> Result<ObservationalMemory> {
    let key = lookup_key(thread_id, resource_id.as_deref(), config.scope)?;
    let existing = store
        .with_conn({
            let key = key.clone();
            move |conn| {
                conn.query_row(
                    "SELECT * FROM observational_memory WHERE lookup_key = ?1",
                    params![key],
                    ObservationalMemory::from_row,
                )
                .optional()
                .map_err(CoreError::from)
            }
        })
        .await?;

    if let Some(record) = existing {
        return Ok(record);
    }

    let record = ObservationalMemory::new(thread_id, resource_id, config)?;
    persist_new(store, &record).await?;
    Ok(record)
}

async fn persist_new(store: &crate::store::Store, record: &ObservationalMemory) -> Result<()> {
    let record = record.clone();
    store
        .with_conn(move |conn| {
            conn.execute(
                "INSERT INTO observational_memory (
                    id, thread_id, resource_id, scope, lookup_key, config,
                    active_observations, buffered_observation_chunks, observed_message_ids,
                    is_observing, is_reflecting, is_buffering_observation, is_buffering_reflection,
                    lock_owner_id, lock_expires_at, lock_operation_id, last_heartbeat_at,
                    last_buffered_at_tokens, last_buffered_at_time, last_observed_at,
                    generation_count, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, 0, 0,
                    NULL, NULL, NULL, NULL, NULL, NULL, NULL, 0, ?10, ?10
                )
                ON CONFLICT(lookup_key) DO NOTHING",
                params![
                    record.id.to_string(),
                    record.thread_id.map(|t| t.to_string()),
                    record.resource_id,
                    record.scope.as_str(),
                    record.lookup_key,
                    serde_json::to_string(&record.config)?,
                    record.active_observations,
                    serde_json::to_string(&record.buffered_observation_chunks)?,
                    serde_json::to_string(&record.observed_message_ids)?,
                    record.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
}

/// Persists every mutable field of `record` in one statement — §5's
/// "update is atomic single-row" guarantee.
pub(crate) async fn save(store: &crate::store::Store, record: &ObservationalMemory, now_ms: i64) -> Result<()> {
    let record = record.clone();
    store
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE observational_memory SET
                    active_observations = ?1,
                    buffered_observation_chunks = ?2,
                    observed_message_ids = ?3,
                    is_observing = ?4,
                    is_reflecting = ?5,
                    is_buffering_observation = ?6,
                    is_buffering_reflection = ?7,
                    lock_owner_id = ?8,
                    lock_expires_at = ?9,
                    lock_operation_id = ?10,
                    last_heartbeat_at = ?11,
                    last_buffered_at_tokens = ?12,
                    last_buffered_at_time = ?13,
                    last_observed_at = ?14,
                    generation_count = ?15,
                    updated_at = ?16
                 WHERE id = ?17",
                params![
                    record.active_observations,
                    serde_json::to_string(&record.buffered_observation_chunks)?,
                    serde_json::to_string(&record.observed_message_ids)?,
                    record.is_observing as i64,
                    record.is_reflecting as i64,
                    record.is_buffering_observation as i64,
                    record.is_buffering_reflection as i64,
                    record.lock_owner_id,
                    record.lock_expires_at.map(|t| t.timestamp_millis()),
                    record.lock_operation_id.map(|id| id.to_string()),
                    record.last_heartbeat_at.map(|t| t.timestamp_millis()),
                    record.last_buffered_at_tokens,
                    record.last_buffered_at_time.map(|t| t.timestamp_millis()),
                    record.last_observed_at.map(|t| t.timestamp_millis()),
                    record.generation_count,
                    now_ms,
                    record.id.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
}

pub(crate) async fn reload(store: &crate::store::Store, id: Uuid) -> Result<ObservationalMemory> {
    store
        .with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM observational_memory WHERE id = ?1",
                params![id.to_string()],
                ObservationalMemory::from_row,
            )
            .map_err(CoreError::from)
        })
        .await
}
