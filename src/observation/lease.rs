//! Lease protocol (§4.5 "Lease protocol", INV-5). The lease lives as four
//! columns on the `observational_memory` row itself rather than a separate
//! table, so acquire/heartbeat/release are single conditional `UPDATE`s via
//! `store::conditional_update` — the same primitive `TaskGraph::claim` uses
//! for its idempotent-reclaim check.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{conditional_update, Store};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const DEFAULT_LEASE_MS: i64 = 30_000;

/// The lease tuple `acquire` just wrote to the DB, handed back so the
/// caller can mirror it onto its in-memory `ObservationalMemory` before the
/// next `record::save` — which writes every lock column and would
/// otherwise clobber what `acquire` just set with stale `NULL`s.
pub struct AcquiredLease {
    pub operation_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// `acquire(id, ownerId, leaseMs)` (§4.5). Succeeds iff no current owner, or
/// the current lease has expired, or the caller already owns it. Returns
/// the freshly minted lease tuple on success.
pub async fn acquire(
    store: &Store,
    clock: &dyn Clock,
    record_id: Uuid,
    owner_id: &str,
    lease_ms: i64,
) -> Result<Option<AcquiredLease>> {
    let now = clock.now_millis();
    let expires_at = now + lease_ms;
    let operation_id = Uuid::now_v7();

    let acquired = store
        .with_conn({
            let owner_id = owner_id.to_string();
            let operation_id_str = operation_id.to_string();
            move |conn| {
                conditional_update(
                    conn,
                    "UPDATE observational_memory SET
                        lock_owner_id = :owner, lock_expires_at = :expires_at,
                        lock_operation_id = :operation_id, last_heartbeat_at = :now
                     WHERE id = :id
                       AND (lock_owner_id IS NULL OR lock_expires_at < :now OR lock_owner_id = :owner)",
                    &[
                        (":owner", &owner_id),
                        (":expires_at", &expires_at),
                        (":operation_id", &operation_id_str),
                        (":now", &now),
                        (":id", &record_id.to_string()),
                    ],
                )
            }
        })
        .await?;

    Ok(acquired.then(|| AcquiredLease {
        operation_id,
        expires_at: DateTime::from_timestamp_millis(expires_at).unwrap_or_else(Utc::now),
        heartbeat_at: DateTime::from_timestamp_millis(now).unwrap_or_else(Utc::now),
    }))
}

/// `heartbeat(id, ownerId, operationId)` (§4.5). Extends expiry iff the
/// exact `(owner, operation_id)` pair still holds the lease.
pub async fn heartbeat(
    store: &Store,
    clock: &dyn Clock,
    record_id: Uuid,
    owner_id: &str,
    operation_id: Uuid,
    lease_ms: i64,
) -> Result<bool> {
    let now = clock.now_millis();
    let expires_at = now + lease_ms;
    store
        .with_conn({
            let owner_id = owner_id.to_string();
            let operation_id = operation_id.to_string();
            move |conn| {
                conditional_update(
                    conn,
                    "UPDATE observational_memory SET lock_expires_at = :expires_at, last_heartbeat_at = :now
                     WHERE id = :id AND lock_owner_id = :owner AND lock_operation_id = :operation_id",
                    &[
                        (":expires_at", &expires_at),
                        (":now", &now),
                        (":id", &record_id.to_string()),
                        (":owner", &owner_id),
                        (":operation_id", &operation_id),
                    ],
                )
            }
        })
        .await
}

/// `release(id, ownerId, operationId)` (§4.5). Atomically clears the whole
/// lease tuple, conditional on the triple still matching.
pub async fn release(store: &Store, record_id: Uuid, owner_id: &str, operation_id: Uuid) -> Result<bool> {
    store
        .with_conn({
            let owner_id = owner_id.to_string();
            let operation_id = operation_id.to_string();
            move |conn| {
                conditional_update(
                    conn,
                    "UPDATE observational_memory SET
                        lock_owner_id = NULL, lock_expires_at = NULL,
                        lock_operation_id = NULL, last_heartbeat_at = NULL
                     WHERE id = :id AND lock_owner_id = :owner AND lock_operation_id = :operation_id",
                    &[
                        (":id", &record_id.to_string()),
                        (":owner", &owner_id),
                        (":operation_id", &operation_id),
                    ],
                )
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::observation::record::{fetch_or_create, ObservationalMemory};
    use crate::config::{ObservationConfig, Scope};
    use chrono::Duration as ChronoDuration;

    async fn seeded_record(store: &Store) -> ObservationalMemory {
        fetch_or_create(store, Some(Uuid::now_v7()), None, ObservationConfig::new(Scope::Thread))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_then_acquire_by_other_owner_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let record = seeded_record(&store).await;
        let clock = FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());

        let op1 = acquire(&store, &clock, record.id, "owner-a", DEFAULT_LEASE_MS).await.unwrap();
        assert!(op1.is_some());

        let op2 = acquire(&store, &clock, record.id, "owner-b", DEFAULT_LEASE_MS).await.unwrap();
        assert!(op2.is_none());
    }

    #[tokio::test]
    async fn acquire_after_expiry_succeeds_for_new_owner() {
        let store = Store::open_in_memory().await.unwrap();
        let record = seeded_record(&store).await;
        let clock = FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());

        acquire(&store, &clock, record.id, "owner-a", 1_000).await.unwrap();
        clock.advance(ChronoDuration::milliseconds(2_000));

        let op2 = acquire(&store, &clock, record.id, "owner-b", DEFAULT_LEASE_MS).await.unwrap();
        assert!(op2.is_some());
    }

    #[tokio::test]
    async fn heartbeat_fails_once_displaced() {
        let store = Store::open_in_memory().await.unwrap();
        let record = seeded_record(&store).await;
        let clock = FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());

        let lease1 = acquire(&store, &clock, record.id, "owner-a", 1_000).await.unwrap().unwrap();
        clock.advance(ChronoDuration::milliseconds(2_000));
        acquire(&store, &clock, record.id, "owner-b", DEFAULT_LEASE_MS).await.unwrap();

        let ok = heartbeat(&store, &clock, record.id, "owner-a", lease1.operation_id, DEFAULT_LEASE_MS).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn release_then_reacquire_by_other_owner_succeeds_immediately() {
        let store = Store::open_in_memory().await.unwrap();
        let record = seeded_record(&store).await;
        let clock = FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());

        let lease1 = acquire(&store, &clock, record.id, "owner-a", DEFAULT_LEASE_MS).await.unwrap().unwrap();
        let released = release(&store, record.id, "owner-a", lease1.operation_id).await.unwrap();
        assert!(released);

        let op2 = acquire(&store, &clock, record.id, "owner-b", DEFAULT_LEASE_MS).await.unwrap();
        assert!(op2.is_some());
    }
}
