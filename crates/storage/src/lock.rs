//! Advisory locks that serialise ingest of a source.
//!
//! The PostgreSQL implementation holds its locks on one dedicated session, so
//! a crashed process releases every lock it held when its connection drops.
//! Advisory locks are re-entrant within a session, which means two tasks in
//! this process would both "acquire" the same key; the in-process claim set
//! provides exclusion between them.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ts_common::{TsError, TsResult};

/// First key of the two-key advisory lock space, reserved for source ingest.
pub const INGEST_SOURCE_PREFIX: i32 = 2;

/// Cross-task, cross-process exclusion keyed by source surrogate id.
#[async_trait]
pub trait SourceLockManager: Send + Sync {
    /// Block until the lock is held by this caller. There is no timeout.
    async fn lock_source(&self, source_id: i64) -> TsResult<()>;

    /// Take the lock if nobody holds it.
    async fn try_lock_source(&self, source_id: i64) -> TsResult<bool>;

    async fn unlock_source(&self, source_id: i64) -> TsResult<()>;

    /// Whether any task or process currently holds the lock.
    async fn is_source_locked(&self, source_id: i64) -> TsResult<bool>;
}

/// Map a surrogate id onto the second key of the advisory lock space.
pub fn lock_name(source_id: i64) -> TsResult<i32> {
    let name = (source_id & i64::from(i32::MAX)) as i32;
    if name < 1 {
        return Err(TsError::LockError(format!(
            "source id {} maps to invalid lock name {}",
            source_id, name
        )));
    }
    Ok(name)
}

struct LockSession {
    conn: PgConnection,
    held: HashSet<i64>,
}

/// Session-level PostgreSQL advisory locks.
pub struct PgLockManager {
    session: Mutex<LockSession>,
    poll_interval: Duration,
}

impl PgLockManager {
    /// Open the dedicated lock session.
    pub async fn connect(database_url: &str, poll_interval: Duration) -> TsResult<Self> {
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(|e| TsError::ServiceUnavailable(format!("Lock connection failed: {}", e)))?;

        Ok(Self {
            session: Mutex::new(LockSession {
                conn,
                held: HashSet::new(),
            }),
            poll_interval,
        })
    }

    async fn advisory(conn: &mut PgConnection, sql: &str, name: i32) -> TsResult<bool> {
        sqlx::query_scalar(sql)
            .bind(INGEST_SOURCE_PREFIX)
            .bind(name)
            .fetch_one(conn)
            .await
            .map_err(|e| TsError::LockError(format!("Advisory lock call failed: {}", e)))
    }
}

#[async_trait]
impl SourceLockManager for PgLockManager {
    async fn lock_source(&self, source_id: i64) -> TsResult<()> {
        loop {
            if self.try_lock_source(source_id).await? {
                return Ok(());
            }
            debug!(source_id, "Source lock held elsewhere, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn try_lock_source(&self, source_id: i64) -> TsResult<bool> {
        let name = lock_name(source_id)?;
        let mut session = self.session.lock().await;

        if session.held.contains(&source_id) {
            return Ok(false);
        }

        let acquired = Self::advisory(
            &mut session.conn,
            "SELECT pg_try_advisory_lock($1, $2)",
            name,
        )
        .await?;

        if acquired {
            session.held.insert(source_id);
            debug!(source_id, lock_name = name, "Acquired source lock");
        }

        Ok(acquired)
    }

    async fn unlock_source(&self, source_id: i64) -> TsResult<()> {
        let name = lock_name(source_id)?;
        let mut session = self.session.lock().await;

        if !session.held.remove(&source_id) {
            warn!(source_id, "Asked to unlock a source this process does not hold");
            return Ok(());
        }

        let released =
            Self::advisory(&mut session.conn, "SELECT pg_advisory_unlock($1, $2)", name).await?;

        if !released {
            warn!(source_id, lock_name = name, "Advisory lock was not held by the session");
        }

        Ok(())
    }

    async fn is_source_locked(&self, source_id: i64) -> TsResult<bool> {
        let name = lock_name(source_id)?;
        let mut session = self.session.lock().await;

        if session.held.contains(&source_id) {
            return Ok(true);
        }

        let acquired = Self::advisory(
            &mut session.conn,
            "SELECT pg_try_advisory_lock($1, $2)",
            name,
        )
        .await?;

        if acquired {
            Self::advisory(&mut session.conn, "SELECT pg_advisory_unlock($1, $2)", name).await?;
        }

        Ok(!acquired)
    }
}

/// Locks for a single process with no shared store.
pub struct MemoryLockManager {
    held: Mutex<HashSet<i64>>,
    poll_interval: Duration,
}

impl MemoryLockManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            poll_interval,
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[async_trait]
impl SourceLockManager for MemoryLockManager {
    async fn lock_source(&self, source_id: i64) -> TsResult<()> {
        while !self.try_lock_source(source_id).await? {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn try_lock_source(&self, source_id: i64) -> TsResult<bool> {
        lock_name(source_id)?;
        Ok(self.held.lock().await.insert(source_id))
    }

    async fn unlock_source(&self, source_id: i64) -> TsResult<()> {
        if !self.held.lock().await.remove(&source_id) {
            warn!(source_id, "Asked to unlock a source that is not locked");
        }
        Ok(())
    }

    async fn is_source_locked(&self, source_id: i64) -> TsResult<bool> {
        Ok(self.held.lock().await.contains(&source_id))
    }
}
