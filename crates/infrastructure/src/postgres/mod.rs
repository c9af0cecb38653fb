mod excl;
mod job;
mod queue;
mod storage;
mod target;

pub use excl::PgExclRepository;
pub use job::PgJobRepository;
pub use queue::PgQueueRepository;
pub use storage::PgStorageRepository;
pub use target::PgTargetRepository;

/// Page size for windowed iteration over large result sets.
pub(crate) const QUERY_WINDOW: i64 = 5000;
