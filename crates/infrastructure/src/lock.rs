use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use sner_core::errors::{SnerError, SnerResult};
use sner_core::traits::{LockGuard, SchedulerLock};

/// Fixed advisory lock id shared by all scheduler mutators.
const SCHEDULER_LOCK_ID: i64 = 0x534e4552; // "SNER"

/// Process-wide mutual exclusion through a Postgres advisory lock. Each
/// acquisition opens a dedicated session so the lock is released on every
/// exit path: explicitly never, implicitly always, because dropping the
/// guard closes the session.
pub struct PgSchedulerLock {
    url: String,
}

impl PgSchedulerLock {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

struct PgLockHolder {
    _conn: PgConnection,
}

#[async_trait]
impl SchedulerLock for PgSchedulerLock {
    async fn acquire(&self, timeout: Duration) -> SnerResult<LockGuard> {
        let mut conn = PgConnection::connect(&self.url).await?;

        sqlx::query(&format!("SET lock_timeout = {}", timeout.as_millis()))
            .execute(&mut conn)
            .await?;

        match sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(SCHEDULER_LOCK_ID)
            .execute(&mut conn)
            .await
        {
            Ok(_) => Ok(Box::new(PgLockHolder { _conn: conn })),
            Err(err) => {
                debug!("scheduler lock acquisition failed: {}", err);
                Err(SnerError::Busy)
            }
        }
    }
}
