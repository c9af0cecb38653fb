pub mod lock;
pub mod parser;
pub mod repository;

pub use lock::{LockGuard, SchedulerLock};
pub use parser::ParserModule;
pub use repository::{
    ExclRepository, JobRepository, QueueRepository, StorageRepository, TargetRepository,
};
