//! Pooled SQLite connection and the generic primitives every higher layer
//! is built on: an atomic returning-row insert/update, a conditional update
//! guarded by `(owner, operation_id)`, and the plumbing `interact`-style
//! helper that runs blocking `rusqlite` calls off the async executor the
//! way `hi-youichi-loom`'s `SqliteStore` and `adolfousier-opencrabs`'s
//! `memory::search`/`memory::index` modules both do (there, via
//! `tokio::task::spawn_blocking`; here, via `deadpool_sqlite`'s pooled
//! `interact`, since the crate is already on that pairing for opening
//! connections).

pub mod schema;

use crate::error::{CoreError, Result};
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::Connection;

/// Pooled SQLite handle shared by every engine in this crate.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and runs
    /// pending migrations. `pool_size` bounds the number of concurrent
    /// blocking connections.
    pub async fn open(path: &str, pool_size: usize) -> Result<Self> {
        let cfg = Config::new(path);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for tests — one connection, shared via the pool so
    /// the same `with_conn` code path exercises both.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:", 1).await
    }

    async fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            schema::migrations()
                .to_latest(conn)
                .map_err(CoreError::from)
        })
        .await
    }

    /// Runs `f` against a pooled connection on a blocking thread. This is
    /// the sole place `rusqlite::Connection` escapes into a closure;
    /// everything else in this crate is `async fn` calling into this.
    ///
    /// `PRAGMA foreign_keys` is per-connection, not per-database, and
    /// defaults off; the pool hands out up to `pool_size` distinct
    /// connections (`RuntimeConfig::default_pool_size` is 8), so setting it
    /// once on the connection that happens to run migrations leaves every
    /// other connection in the pool without cascade-delete enforcement.
    /// Re-asserting it on every `interact` call is cheap and guarantees
    /// `ON DELETE CASCADE` (e.g. `MessageLog::delete_thread`) holds no
    /// matter which pooled connection services the call.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await?;
        conn.interact(move |conn| {
            conn.pragma_update(None, "foreign_keys", true)?;
            f(conn)
        })
        .await?
    }

    /// Current epoch-millisecond timestamp as SQLite sees it — used only by
    /// tests that want to assert against a row written by the engine
    /// without threading a `Clock` through the assertion.
    #[cfg(test)]
    pub async fn db_now_millis(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let ms: i64 = conn.query_row(
                "SELECT CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
                [],
                |row| row.get(0),
            )?;
            Ok(ms)
        })
        .await
    }
}

/// Runs `update_sql` (which must reference `:owner` and `:operation_id`
/// among its parameters) and reports whether any row actually changed,
/// i.e. whether the `(owner, operation_id)` precondition held. This is the
/// store-level primitive spec §4.1 calls "conditional update (update iff
/// `(owner, operation_id)` still match)"; lease acquire/heartbeat/release
/// and `TaskGraph::claim`'s idempotent-reclaim check are both built on it.
pub fn conditional_update(
    conn: &Connection,
    sql: &str,
    params: &[(&str, &dyn rusqlite::ToSql)],
) -> Result<bool> {
    let changed = conn.execute(sql, params)?;
    Ok(changed > 0)
}
