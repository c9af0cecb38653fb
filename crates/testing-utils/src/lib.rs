//! In-memory repository implementations and entity builders. Service-level
//! tests run against these instead of a database; the mocks keep the same
//! relational semantics as the Postgres repositories.

pub mod builders;
pub mod mocks;

pub use builders::QueueBuilder;
pub use mocks::{
    MockDb, MockExclRepository, MockJobRepository, MockQueueRepository, MockSchedulerLock,
    MockStorageRepository, MockTargetRepository,
};
