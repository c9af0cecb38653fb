use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SnerResult;

/// Opaque guard; mutual exclusion holds for its lifetime.
pub type LockGuard = Box<dyn std::any::Any + Send>;

/// Process-wide scheduler mutex. All scheduler state-changing operations
/// acquire it before touching Target/Readynet/Heatmap/Job. The Postgres
/// implementation uses a single advisory lock id with a bounded wait; the
/// guard releases on every exit path.
#[async_trait]
pub trait SchedulerLock: Send + Sync {
    /// Returns `SnerError::Busy` when the lock cannot be acquired within
    /// `timeout`.
    async fn acquire(&self, timeout: Duration) -> SnerResult<LockGuard>;
}
