pub mod db;
pub mod filter_sql;
pub mod lock;
pub mod postgres;

pub use db::create_pool;
pub use lock::PgSchedulerLock;
pub use postgres::{
    PgExclRepository, PgJobRepository, PgQueueRepository, PgStorageRepository, PgTargetRepository,
};
