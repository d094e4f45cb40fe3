//! Second-stage condensation (§4.6) — compacts `active_observations` into an
//! immutable generational `Reflection` row. Grounded on the teacher's
//! `*Service`-over-`Store` convention; the lease reuse and
//! clear-flag-on-failure discipline mirror `observation::engine`'s
//! synchronous observation path exactly, since spec §4.6 step 1 says
//! "acquire the same lease as observation."

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::llm::{compression_guidance, LlmReflector, DEFAULT_REFLECT_TIMEOUT_MS};
use crate::observation::lease;
use crate::observation::record::{self, ObservationalMemory};
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// §3 Reflection. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: Uuid,
    pub thread_id: Option<Uuid>,
    pub resource_id: Option<String>,
    pub content: String,
    pub merged_from: Vec<Uuid>,
    pub origin_type: String,
    pub generation_count: u32,
    pub token_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reflection {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let thread_id: Option<String> = row.get("thread_id")?;
        let merged_from: String = row.get("merged_from")?;
        let created_at_ms: i64 = row.get("created_at")?;
        let updated_at_ms: i64 = row.get("updated_at")?;
        Ok(Reflection {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            thread_id: thread_id.and_then(|s| Uuid::parse_str(&s).ok()),
            resource_id: row.get("resource_id")?,
            content: row.get("content")?,
            merged_from: serde_json::from_str(&merged_from).unwrap_or_default(),
            origin_type: row.get("origin_type")?,
            generation_count: row.get::<_, i64>("generation_count")? as u32,
            token_count: row.get::<_, Option<i64>>("token_count")?.map(|v| v as u32),
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at_ms).unwrap_or_else(Utc::now),
        })
    }
}

/// Owns `reflections` rows and drives the `ObservationalMemory` →
/// `Reflection` condensation step. See spec §4.6.
pub struct ReflectionEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    reflector: Arc<dyn LlmReflector>,
    instance_id: String,
    lease_ms: i64,
}

impl ReflectionEngine {
    pub fn new(store: Store, clock: Arc<dyn Clock>, reflector: Arc<dyn LlmReflector>, instance_id: String, lease_ms: i64) -> Self {
        Self {
            store,
            clock,
            reflector,
            instance_id,
            lease_ms,
        }
    }

    /// §4.6 `reflect(record, model)` with no compression guidance.
    pub async fn reflect(&self, record_id: Uuid, model: &str) -> Result<ObservationalMemory> {
        self.reflect_once(record_id, model, None).await
    }

    /// Retries up to `max_retries` additional times with escalating
    /// compression guidance (§4.6's retry table) while the reflector's
    /// output is not strictly smaller than the input. This is the
    /// caller-side retry strategy spec §9 leaves optional.
    pub async fn reflect_with_retries(&self, record_id: Uuid, model: &str, max_retries: u32) -> Result<ObservationalMemory> {
        let mut retry = 0;
        loop {
            let before_len = record::reload(&self.store, record_id).await?.active_observations.len();
            let updated = self.reflect_once(record_id, model, compression_guidance(retry)).await?;
            if updated.active_observations.len() < before_len || retry >= max_retries {
                return Ok(updated);
            }
            retry += 1;
        }
    }

    async fn reflect_once(&self, record_id: Uuid, model: &str, compression_prompt: Option<&str>) -> Result<ObservationalMemory> {
        let mut record = record::reload(&self.store, record_id).await?;

        let acquired = lease::acquire(&self.store, self.clock.as_ref(), record_id, &self.instance_id, self.lease_ms)
            .await?
            .ok_or_else(|| CoreError::Conflict(format!("reflection lease held by another owner for {record_id}")))?;
        let operation_id = acquired.operation_id;

        // `record::save` writes every lock column, so mirror what `acquire`
        // just wrote onto the DB row before the first save — otherwise the
        // save would clobber it back to NULL and release the lease the
        // instant it was taken (same pitfall `observation::engine` guards
        // against).
        record.lock_owner_id = Some(self.instance_id.clone());
        record.lock_expires_at = Some(acquired.expires_at);
        record.lock_operation_id = Some(operation_id);
        record.last_heartbeat_at = Some(acquired.heartbeat_at);
        record.is_reflecting = true;
        record::save(&self.store, &record, self.clock.now_millis()).await?;

        let timeout = Duration::from_millis(DEFAULT_REFLECT_TIMEOUT_MS);
        let call = self
            .reflector
            .reflect(&record.active_observations, compression_prompt, model, timeout);

        let result = tokio::time::timeout(timeout, call).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                record.is_reflecting = false;
                record::save(&self.store, &record, self.clock.now_millis()).await?;
                lease::release(&self.store, record_id, &self.instance_id, operation_id).await?;
                return Err(CoreError::Storage(e.to_string()));
            }
            Err(_) => {
                record.is_reflecting = false;
                record::save(&self.store, &record, self.clock.now_millis()).await?;
                lease::release(&self.store, record_id, &self.instance_id, operation_id).await?;
                return Err(CoreError::Timeout(timeout));
            }
        };

        let next_generation = record.generation_count + 1;
        self.persist_reflection(&record, &output, next_generation).await?;

        record.active_observations = output.observations;
        record.generation_count = next_generation;
        record.is_reflecting = false;
        record.last_heartbeat_at = Some(self.clock.now());
        record::save(&self.store, &record, self.clock.now_millis()).await?;

        lease::release(&self.store, record_id, &self.instance_id, operation_id).await?;

        record::reload(&self.store, record_id).await
    }

    async fn persist_reflection(
        &self,
        record: &ObservationalMemory,
        output: &crate::llm::ReflectorOutput,
        generation_count: u32,
    ) -> Result<()> {
        let id = Uuid::now_v7();
        let now = self.clock.now_millis();
        let merged_from = record.observed_message_ids.clone();
        let thread_id = record.thread_id;
        let resource_id = record.resource_id.clone();
        let content = output.observations.clone();
        let token_count = output.token_count;

        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO reflections (
                        id, thread_id, resource_id, content, merged_from, origin_type,
                        generation_count, token_count, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 'reflection', ?6, ?7, ?8, ?8)",
                    params![
                        id.to_string(),
                        thread_id.map(|t| t.to_string()),
                        resource_id,
                        content,
                        serde_json::to_string(&merged_from)?,
                        generation_count,
                        token_count,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Latest reflections for a thread, oldest first — feeds
    /// `ContextAssembler`'s reflections block (§4.7 level 1).
    pub async fn recent_for_thread(&self, thread_id: Uuid, limit: u32) -> Result<Vec<Reflection>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM reflections WHERE thread_id = ?1
                     ORDER BY generation_count DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![thread_id.to_string(), limit], Reflection::from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                out.reverse();
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ObservationConfig, Scope};
    use crate::llm::mock::StaticReflector;
    use crate::observation::record::fetch_or_create;

    async fn engine_with_record(initial_observations: &str) -> (ReflectionEngine, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        let mut record = fetch_or_create(&store, Some(Uuid::now_v7()), None, ObservationConfig::new(Scope::Thread))
            .await
            .unwrap();
        record.active_observations = initial_observations.to_string();
        record::save(&store, &record, 0).await.unwrap();

        let reflector = Arc::new(StaticReflector {
            observations: "condensed".to_string(),
        });
        let engine = ReflectionEngine::new(store, Arc::new(SystemClock), reflector, "instance-a".to_string(), 30_000);
        (engine, record.id)
    }

    #[tokio::test]
    async fn reflect_replaces_observations_and_bumps_generation() {
        let (engine, record_id) = engine_with_record("a long accumulated observation body").await;
        let updated = engine.reflect(record_id, "test-model").await.unwrap();
        assert_eq!(updated.active_observations, "condensed");
        assert_eq!(updated.generation_count, 1);
        assert!(!updated.is_reflecting);
        assert!(updated.lock_owner_id.is_none());
    }

    #[tokio::test]
    async fn reflect_persists_a_reflection_row() {
        let (engine, record_id) = engine_with_record("body").await;
        let before = record::reload(&engine.store, record_id).await.unwrap();
        let thread_id = before.thread_id.unwrap();

        engine.reflect(record_id, "test-model").await.unwrap();

        let reflections = engine.recent_for_thread(thread_id, 5).await.unwrap();
        assert_eq!(reflections.len(), 1);
        assert_eq!(reflections[0].content, "condensed");
        assert_eq!(reflections[0].generation_count, 1);
    }

    #[tokio::test]
    async fn reflect_holds_lease_for_a_competing_owner() {
        let (engine, record_id) = engine_with_record("body").await;
        let op = lease::acquire(&engine.store, engine.clock.as_ref(), record_id, "other-owner", 30_000)
            .await
            .unwrap();
        assert!(op.is_some());
        let err = engine.reflect(record_id, "test-model").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
