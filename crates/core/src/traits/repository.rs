//! Data access abstractions. Postgres implementations live in
//! sner-infrastructure; in-memory mocks in sner-testing-utils.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::SnerResult;
use crate::filter::Filter;
use crate::models::{
    Excl, Host, Job, JobStateCounts, NoteListItem, Queue, ServiceListItem, StorageCounts, Target,
    VersionInfo,
};
use crate::pidb::ParsedItemsDb;

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn create(&self, queue: &Queue) -> SnerResult<Queue>;
    async fn get_by_id(&self, id: i32) -> SnerResult<Option<Queue>>;
    async fn get_by_name(&self, name: &str) -> SnerResult<Option<Queue>>;
    async fn list(&self) -> SnerResult<Vec<Queue>>;
    async fn delete(&self, id: i32) -> SnerResult<()>;

    /// Queue selection for job assignment: active, agent caps cover queue
    /// reqs, at least one readynet row exists, optional name restriction;
    /// ordered by priority desc then random.
    async fn select_for_assignment(
        &self,
        queue_name: Option<&str>,
        caps: &[String],
    ) -> SnerResult<Option<Queue>>;

    /// Pending target count per queue name, for the stats endpoint.
    async fn target_counts(&self) -> SnerResult<Vec<(String, i64)>>;
}

#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Single multi-row insert; ids in the passed targets are ignored.
    async fn insert(&self, targets: &[Target]) -> SnerResult<u64>;

    /// Filter out candidates already enqueued in the queue (windowed scan).
    async fn filter_not_queued(
        &self,
        queue_id: i32,
        candidates: Vec<String>,
    ) -> SnerResult<Vec<String>>;

    /// Upsert readynet rows for the given buckets (conflict do-nothing).
    async fn ensure_readynets(&self, queue_id: i32, hashvals: &[String]) -> SnerResult<()>;

    /// Pick one readynet bucket for a queue at random.
    async fn pick_readynet(&self, queue_id: i32) -> SnerResult<Option<String>>;

    /// Targets of one queue bucket ordered by their random tiebreaker.
    async fn bucket_targets(
        &self,
        queue_id: i32,
        hashval: &str,
        limit: i64,
    ) -> SnerResult<Vec<Target>>;

    async fn delete_targets(&self, ids: &[i64]) -> SnerResult<()>;
    async fn count_bucket(&self, queue_id: i32, hashval: &str) -> SnerResult<i64>;

    async fn remove_readynet(&self, queue_id: i32, hashval: &str) -> SnerResult<()>;
    /// Remove the bucket's readynet rows across all queues (bucket went hot).
    async fn remove_readynet_all_queues(&self, hashval: &str) -> SnerResult<()>;
    /// Re-create readynet rows for every queue holding targets in the
    /// bucket (bucket cooled down).
    async fn restore_readynets(&self, hashval: &str) -> SnerResult<()>;

    /// Delete all targets and readynets of a queue.
    async fn flush_queue(&self, queue_id: i32) -> SnerResult<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &Job) -> SnerResult<()>;
    async fn get(&self, id: Uuid) -> SnerResult<Option<Job>>;
    async fn finalize(&self, id: Uuid, retval: i32, time_end: DateTime<Utc>) -> SnerResult<()>;
    async fn delete(&self, id: Uuid) -> SnerResult<()>;
    async fn list_by_queue(&self, queue_id: i32) -> SnerResult<Vec<Job>>;
    async fn count_by_queue(&self, queue_id: i32) -> SnerResult<i64>;
    /// Oldest finished (retval = 0) job of a queue, if any.
    async fn first_finished(&self, queue_id: i32) -> SnerResult<Option<Job>>;
    /// All running jobs; used for heatmap reconstruction at startup.
    async fn list_running(&self) -> SnerResult<Vec<Job>>;
    async fn state_counts(&self, stale_horizon: DateTime<Utc>) -> SnerResult<JobStateCounts>;
}

#[async_trait]
pub trait ExclRepository: Send + Sync {
    async fn create(&self, excl: &Excl) -> SnerResult<Excl>;
    async fn list(&self) -> SnerResult<Vec<Excl>>;
}

#[async_trait]
pub trait StorageRepository: Send + Sync {
    /// Upsert a parsed-items database; idempotent.
    async fn import_pidb(&self, pidb: &ParsedItemsDb) -> SnerResult<()>;

    /// Drop non-open services and hosts carrying no information.
    async fn cleanup_storage(&self) -> SnerResult<()>;

    /// Service endpoints due for rescan; stamps rescan_time = now in bulk.
    async fn rescan_services(&self, horizon: DateTime<Utc>, now: DateTime<Utc>)
        -> SnerResult<Vec<String>>;
    /// Host addresses due for rescan; stamps rescan_time = now in bulk.
    async fn rescan_hosts(&self, horizon: DateTime<Utc>, now: DateTime<Utc>)
        -> SnerResult<Vec<String>>;

    /// All IPv6 host addresses, ordered.
    async fn six_addresses(&self) -> SnerResult<Vec<String>>;

    async fn get_host(&self, address: &str) -> SnerResult<Option<Host>>;
    async fn query_hosts(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<Host>>;
    async fn query_services(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<ServiceListItem>>;
    async fn query_notes(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<NoteListItem>>;
    async fn query_versioninfo(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<VersionInfo>>;

    /// Recreate the version_info projection; returns the row count.
    async fn rebuild_versioninfo(&self) -> SnerResult<u64>;

    async fn counts(&self) -> SnerResult<StorageCounts>;
}
