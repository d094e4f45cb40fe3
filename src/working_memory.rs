//! Scratch-pad storage (§4.4) keyed on `(resource_id, scope)` — one blob per
//! scope, replaced wholesale on each `upsert`. Grounded on the teacher's
//! key-value convention in `src/brain/agent/service/context.rs`; the schema
//! itself is in `store::schema`.
//!
//! `upsert` hash-skips like `Store::hash_content` in
//! `adolfousier-opencrabs/src/memory/store.rs`: if the incoming content's
//! SHA-256 matches the stored `content_hash`, the row (and its `updated_at`)
//! is left untouched instead of writing an identical blob.

use crate::clock::Clock;
use crate::config::Scope;
use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// §3 WorkingMemory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemoryEntry {
    pub id: Uuid,
    pub resource_id: String,
    pub scope: Scope,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkingMemoryEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let scope: String = row.get("scope")?;
        let created_at_ms: i64 = row.get("created_at")?;
        let updated_at_ms: i64 = row.get("updated_at")?;
        Ok(WorkingMemoryEntry {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            resource_id: row.get("resource_id")?,
            scope: if scope == "resource" { Scope::Resource } else { Scope::Thread },
            content: row.get("content")?,
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at_ms).unwrap_or_else(Utc::now),
        })
    }
}

/// Owns `working_memory` rows. See spec §4.4.
pub struct WorkingMemory {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl WorkingMemory {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// §4.4 `upsert`. Replaces the entire blob for `(resource_id, scope)`,
    /// unless `content`'s hash matches what's already stored, in which case
    /// the existing row is returned untouched (no `updated_at` bump).
    pub async fn upsert(&self, resource_id: String, scope: Scope, content: String) -> Result<WorkingMemoryEntry> {
        let now = self.clock.now_millis();
        let id = Uuid::now_v7();
        let scope_str = scope.as_str().to_string();
        let hash = hash_content(&content);
        self.store
            .with_conn(move |conn| {
                let existing_hash: Option<String> = conn
                    .query_row(
                        "SELECT content_hash FROM working_memory WHERE resource_id = ?1 AND scope = ?2",
                        params![resource_id, scope_str],
                        |row| row.get(0),
                    )
                    .optional()?;

                if existing_hash.as_deref() != Some(hash.as_str()) {
                    conn.execute(
                        "INSERT INTO working_memory (id, resource_id, scope, content, content_hash, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                         ON CONFLICT(resource_id, scope) DO UPDATE SET
                            content = excluded.content, content_hash = excluded.content_hash, updated_at = excluded.updated_at",
                        params![id.to_string(), resource_id, scope_str, content, hash, now],
                    )?;
                }

                conn.query_row(
                    "SELECT * FROM working_memory WHERE resource_id = ?1 AND scope = ?2",
                    params![resource_id, scope_str],
                    WorkingMemoryEntry::from_row,
                )
                .map_err(crate::error::CoreError::from)
            })
            .await
    }

    /// §4.4 `get`.
    pub async fn get(&self, resource_id: String, scope: Scope) -> Result<Option<WorkingMemoryEntry>> {
        let scope_str = scope.as_str().to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT * FROM working_memory WHERE resource_id = ?1 AND scope = ?2",
                    params![resource_id, scope_str],
                    WorkingMemoryEntry::from_row,
                )
                .optional()
                .map_err(crate::error::CoreError::from)
            })
            .await
    }

    /// §4.4 `list`. All scopes for a resource.
    pub async fn list(&self, resource_id: String) -> Result<Vec<WorkingMemoryEntry>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM working_memory WHERE resource_id = ?1 ORDER BY scope ASC",
                )?;
                let rows = stmt.query_map(params![resource_id], WorkingMemoryEntry::from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
    }

    /// §4.4 `delete`.
    pub async fn delete(&self, resource_id: String, scope: Scope) -> Result<()> {
        let scope_str = scope.as_str().to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM working_memory WHERE resource_id = ?1 AND scope = ?2",
                    params![resource_id, scope_str],
                )?;
                Ok(())
            })
            .await
    }
}
