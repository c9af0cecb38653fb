use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use uuid::Uuid;

use sner_core::errors::{SnerError, SnerResult};
use sner_core::filter::{Criterion, Filter, FilterOp, Value};
use sner_core::models::{
    Excl, Host, Job, JobStateCounts, Note, NoteListItem, Queue, Readynet, Service,
    ServiceListItem, Severity, StorageCounts, Target, VersionInfo, Vuln,
};
use sner_core::netutils::CidrNet;
use sner_core::pidb::ParsedItemsDb;
use sner_core::traits::{
    ExclRepository, JobRepository, LockGuard, QueueRepository, SchedulerLock, StorageRepository,
    TargetRepository,
};

/// Shared in-memory database state; individual repository mocks hold an
/// `Arc` to it so relational queries (readynet joins etc.) work.
#[derive(Default)]
pub struct MockState {
    pub queues: Vec<Queue>,
    pub targets: Vec<Target>,
    pub readynets: Vec<Readynet>,
    pub jobs: Vec<Job>,
    pub excls: Vec<Excl>,
    next_queue_id: i32,
    next_target_id: i64,
    next_excl_id: i32,
}

#[derive(Default)]
pub struct MockDb {
    pub state: Mutex<MockState>,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_queue(self: &Arc<Self>, mut queue: Queue) -> Queue {
        let mut state = self.state.lock().unwrap();
        state.next_queue_id += 1;
        queue.id = state.next_queue_id;
        state.queues.push(queue.clone());
        queue
    }

    pub fn add_excl(self: &Arc<Self>, mut excl: Excl) -> Excl {
        let mut state = self.state.lock().unwrap();
        state.next_excl_id += 1;
        excl.id = state.next_excl_id;
        state.excls.push(excl.clone());
        excl
    }

    pub fn target_count(self: &Arc<Self>) -> usize {
        self.state.lock().unwrap().targets.len()
    }

    pub fn readynet_count(self: &Arc<Self>) -> usize {
        self.state.lock().unwrap().readynets.len()
    }

    pub fn job_count(self: &Arc<Self>) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn queues(self: &Arc<Self>) -> MockQueueRepository {
        MockQueueRepository(Arc::clone(self))
    }

    pub fn targets(self: &Arc<Self>) -> MockTargetRepository {
        MockTargetRepository(Arc::clone(self))
    }

    pub fn jobs(self: &Arc<Self>) -> MockJobRepository {
        MockJobRepository(Arc::clone(self))
    }

    pub fn excls(self: &Arc<Self>) -> MockExclRepository {
        MockExclRepository(Arc::clone(self))
    }
}

pub struct MockQueueRepository(Arc<MockDb>);

#[async_trait]
impl QueueRepository for MockQueueRepository {
    async fn create(&self, queue: &Queue) -> SnerResult<Queue> {
        Ok(self.0.add_queue(queue.clone()))
    }

    async fn get_by_id(&self, id: i32) -> SnerResult<Option<Queue>> {
        let state = self.0.state.lock().unwrap();
        Ok(state.queues.iter().find(|queue| queue.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> SnerResult<Option<Queue>> {
        let state = self.0.state.lock().unwrap();
        Ok(state.queues.iter().find(|queue| queue.name == name).cloned())
    }

    async fn list(&self) -> SnerResult<Vec<Queue>> {
        Ok(self.0.state.lock().unwrap().queues.clone())
    }

    async fn delete(&self, id: i32) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state.queues.retain(|queue| queue.id != id);
        Ok(())
    }

    async fn select_for_assignment(
        &self,
        queue_name: Option<&str>,
        caps: &[String],
    ) -> SnerResult<Option<Queue>> {
        let state = self.0.state.lock().unwrap();
        let ready: HashSet<i32> = state
            .readynets
            .iter()
            .map(|readynet| readynet.queue_id)
            .collect();

        let mut candidates: Vec<&Queue> = state
            .queues
            .iter()
            .filter(|queue| queue.active)
            .filter(|queue| queue_name.is_none_or(|name| queue.name == name))
            .filter(|queue| queue.reqs.iter().all(|req| caps.contains(req)))
            .filter(|queue| ready.contains(&queue.id))
            .collect();
        // priority desc, random within the same priority
        candidates.sort_by_key(|queue| std::cmp::Reverse(queue.priority));
        let Some(top_priority) = candidates.first().map(|queue| queue.priority) else {
            return Ok(None);
        };
        let queue = candidates
            .iter()
            .filter(|queue| queue.priority == top_priority)
            .choose(&mut rand::rng())
            .map(|queue| (*queue).clone());
        Ok(queue)
    }

    async fn target_counts(&self) -> SnerResult<Vec<(String, i64)>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .queues
            .iter()
            .map(|queue| {
                let count = state
                    .targets
                    .iter()
                    .filter(|target| target.queue_id == queue.id)
                    .count() as i64;
                (queue.name.clone(), count)
            })
            .collect())
    }
}

pub struct MockTargetRepository(Arc<MockDb>);

#[async_trait]
impl TargetRepository for MockTargetRepository {
    async fn insert(&self, targets: &[Target]) -> SnerResult<u64> {
        let mut state = self.0.state.lock().unwrap();
        for target in targets {
            state.next_target_id += 1;
            let mut target = target.clone();
            target.id = state.next_target_id;
            state.targets.push(target);
        }
        Ok(targets.len() as u64)
    }

    async fn filter_not_queued(
        &self,
        queue_id: i32,
        candidates: Vec<String>,
    ) -> SnerResult<Vec<String>> {
        let state = self.0.state.lock().unwrap();
        let queued: HashSet<&str> = state
            .targets
            .iter()
            .filter(|target| target.queue_id == queue_id)
            .map(|target| target.target.as_str())
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|candidate| !queued.contains(candidate.as_str()))
            .collect())
    }

    async fn ensure_readynets(&self, queue_id: i32, hashvals: &[String]) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        for hashval in hashvals {
            let row = Readynet {
                queue_id,
                hashval: hashval.clone(),
            };
            if !state.readynets.contains(&row) {
                state.readynets.push(row);
            }
        }
        Ok(())
    }

    async fn pick_readynet(&self, queue_id: i32) -> SnerResult<Option<String>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .readynets
            .iter()
            .filter(|readynet| readynet.queue_id == queue_id)
            .choose(&mut rand::rng())
            .map(|readynet| readynet.hashval.clone()))
    }

    async fn bucket_targets(
        &self,
        queue_id: i32,
        hashval: &str,
        limit: i64,
    ) -> SnerResult<Vec<Target>> {
        let state = self.0.state.lock().unwrap();
        let mut rows: Vec<Target> = state
            .targets
            .iter()
            .filter(|target| target.queue_id == queue_id && target.hashval == hashval)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.rand.partial_cmp(&b.rand).unwrap());
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn delete_targets(&self, ids: &[i64]) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state.targets.retain(|target| !ids.contains(&target.id));
        Ok(())
    }

    async fn count_bucket(&self, queue_id: i32, hashval: &str) -> SnerResult<i64> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .targets
            .iter()
            .filter(|target| target.queue_id == queue_id && target.hashval == hashval)
            .count() as i64)
    }

    async fn remove_readynet(&self, queue_id: i32, hashval: &str) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state
            .readynets
            .retain(|readynet| !(readynet.queue_id == queue_id && readynet.hashval == hashval));
        Ok(())
    }

    async fn remove_readynet_all_queues(&self, hashval: &str) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state.readynets.retain(|readynet| readynet.hashval != hashval);
        Ok(())
    }

    async fn restore_readynets(&self, hashval: &str) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        let queue_ids: HashSet<i32> = state
            .targets
            .iter()
            .filter(|target| target.hashval == hashval)
            .map(|target| target.queue_id)
            .collect();
        for queue_id in queue_ids {
            let row = Readynet {
                queue_id,
                hashval: hashval.to_string(),
            };
            if !state.readynets.contains(&row) {
                state.readynets.push(row);
            }
        }
        Ok(())
    }

    async fn flush_queue(&self, queue_id: i32) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state.targets.retain(|target| target.queue_id != queue_id);
        state.readynets.retain(|readynet| readynet.queue_id != queue_id);
        Ok(())
    }
}

pub struct MockJobRepository(Arc<MockDb>);

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn insert(&self, job: &Job) -> SnerResult<()> {
        self.0.state.lock().unwrap().jobs.push(job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SnerResult<Option<Job>> {
        let state = self.0.state.lock().unwrap();
        Ok(state.jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn finalize(&self, id: Uuid, retval: i32, time_end: DateTime<Utc>) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| SnerError::NotFound(format!("job {id}")))?;
        job.retval = Some(retval);
        job.time_end = Some(time_end);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> SnerResult<()> {
        let mut state = self.0.state.lock().unwrap();
        state.jobs.retain(|job| job.id != id);
        Ok(())
    }

    async fn list_by_queue(&self, queue_id: i32) -> SnerResult<Vec<Job>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.queue_id == queue_id)
            .cloned()
            .collect())
    }

    async fn count_by_queue(&self, queue_id: i32) -> SnerResult<i64> {
        Ok(self.list_by_queue(queue_id).await?.len() as i64)
    }

    async fn first_finished(&self, queue_id: i32) -> SnerResult<Option<Job>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.queue_id == queue_id && job.retval == Some(0))
            .min_by_key(|job| job.time_start)
            .cloned())
    }

    async fn list_running(&self) -> SnerResult<Vec<Job>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.retval.is_none())
            .cloned()
            .collect())
    }

    async fn state_counts(&self, stale_horizon: DateTime<Utc>) -> SnerResult<JobStateCounts> {
        let state = self.0.state.lock().unwrap();
        let mut counts = JobStateCounts::default();
        for job in &state.jobs {
            match job.retval {
                None if job.time_start < stale_horizon => counts.stale += 1,
                None => counts.running += 1,
                Some(0) => counts.finished += 1,
                Some(_) => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

pub struct MockExclRepository(Arc<MockDb>);

#[async_trait]
impl ExclRepository for MockExclRepository {
    async fn create(&self, excl: &Excl) -> SnerResult<Excl> {
        Ok(self.0.add_excl(excl.clone()))
    }

    async fn list(&self) -> SnerResult<Vec<Excl>> {
        Ok(self.0.state.lock().unwrap().excls.clone())
    }
}

/// Scheduler lock backed by a tokio mutex with a bounded wait.
pub struct MockSchedulerLock {
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl Default for MockSchedulerLock {
    fn default() -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl MockSchedulerLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the lock from outside to provoke Busy responses in tests.
    pub fn block(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.mutex).try_lock_owned().unwrap()
    }
}

#[async_trait]
impl SchedulerLock for MockSchedulerLock {
    async fn acquire(&self, timeout: Duration) -> SnerResult<LockGuard> {
        match tokio::time::timeout(timeout, Arc::clone(&self.mutex).lock_owned()).await {
            Ok(guard) => Ok(Box::new(guard)),
            Err(_) => Err(SnerError::Busy),
        }
    }
}

/// In-memory storage backend mirroring the Postgres upsert/cleanup
/// semantics.
#[derive(Default)]
pub struct MockStorageState {
    pub hosts: Vec<Host>,
    pub services: Vec<Service>,
    pub vulns: Vec<Vuln>,
    pub notes: Vec<Note>,
    pub versioninfo: Vec<VersionInfo>,
    next_id: i64,
}

#[derive(Default)]
pub struct MockStorageRepository {
    pub state: Mutex<MockStorageState>,
}

impl MockStorageRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(state: &mut MockStorageState) -> i64 {
        state.next_id += 1;
        state.next_id
    }

    fn host_id(state: &MockStorageState, address: &str) -> Option<i64> {
        state
            .hosts
            .iter()
            .find(|host| host.address == address)
            .map(|host| host.id)
    }

    fn service_id(state: &MockStorageState, host_id: i64, proto: &str, port: i32) -> Option<i64> {
        state
            .services
            .iter()
            .find(|service| {
                service.host_id == host_id && service.proto == proto && service.port == port
            })
            .map(|service| service.id)
    }
}

fn address_allowed(address: &str, networks: &[String]) -> bool {
    let Ok(addr) = address.parse() else {
        return false;
    };
    networks.iter().any(|network| {
        network
            .parse::<CidrNet>()
            .map(|net| net.contains(&addr))
            .unwrap_or(false)
    })
}

/// Minimal filter evaluation over a serialized row; supports the operators
/// the tests and public API exercise.
fn filter_matches(filter: &Filter, row: &serde_json::Value) -> bool {
    match filter {
        Filter::Or(items) => items.iter().any(|item| filter_matches(item, row)),
        Filter::And(items) => items.iter().all(|item| filter_matches(item, row)),
        Filter::Criterion(criterion) => criterion_matches(criterion, row),
    }
}

fn criterion_matches(criterion: &Criterion, row: &serde_json::Value) -> bool {
    let field = &row[criterion.field.as_str()];
    match criterion.op {
        FilterOp::Eq => value_eq(field, &criterion.value),
        FilterOp::Ne => !value_eq(field, &criterion.value),
        FilterOp::Ilike => match (&criterion.value, field.as_str()) {
            (Value::String(pattern), Some(actual)) => ilike(pattern, actual),
            _ => false,
        },
        FilterOp::NotIlike => match (&criterion.value, field.as_str()) {
            (Value::String(pattern), Some(actual)) => !ilike(pattern, actual),
            _ => false,
        },
        FilterOp::IsNull => field.is_null(),
        FilterOp::IsNotNull => !field.is_null(),
        FilterOp::Any => match (&criterion.value, field.as_array()) {
            (Value::String(needle), Some(items)) => {
                items.iter().any(|item| item.as_str() == Some(needle))
            }
            _ => false,
        },
        FilterOp::NotAny => match (&criterion.value, field.as_array()) {
            (Value::String(needle), Some(items)) => {
                !items.iter().any(|item| item.as_str() == Some(needle))
            }
            _ => false,
        },
        FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le => {
            compare(field, &criterion.value)
                .map(|ordering| match criterion.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Lt => ordering.is_lt(),
                    FilterOp::Ge => ordering.is_ge(),
                    FilterOp::Le => ordering.is_le(),
                    _ => unreachable!(),
                })
                .unwrap_or(false)
        }
        _ => false,
    }
}

fn value_eq(field: &serde_json::Value, value: &Value) -> bool {
    match value {
        Value::String(s) => field.as_str() == Some(s),
        Value::Number(n) => field.as_f64() == Some(*n),
        Value::Array(_) => false,
    }
}

fn compare(field: &serde_json::Value, value: &Value) -> Option<std::cmp::Ordering> {
    match value {
        Value::String(s) => field.as_str().map(|actual| actual.cmp(s.as_str())),
        Value::Number(n) => field
            .as_f64()
            .and_then(|actual| actual.partial_cmp(n)),
        Value::Array(_) => None,
    }
}

/// Case-insensitive SQL LIKE with % wildcards.
fn ilike(pattern: &str, actual: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let actual = actual.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return actual == pattern;
    }

    let mut pos = 0;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match actual[pos..].find(part) {
            Some(found) => {
                if index == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }
    if !parts.last().unwrap().is_empty() && !actual.ends_with(parts.last().unwrap()) {
        return false;
    }
    true
}

#[async_trait]
impl StorageRepository for MockStorageRepository {
    async fn import_pidb(&self, pidb: &ParsedItemsDb) -> SnerResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        for parsed in pidb.hosts.values() {
            match state.hosts.iter_mut().find(|host| host.address == parsed.address) {
                Some(host) => {
                    host.update_from(parsed);
                    host.modified = now;
                }
                None => {
                    let id = Self::next_id(&mut state);
                    let mut host = Host {
                        id,
                        address: parsed.address.clone(),
                        hostname: None,
                        os: None,
                        tags: Vec::new(),
                        comment: None,
                        created: now,
                        modified: now,
                        rescan_time: now,
                    };
                    host.update_from(parsed);
                    state.hosts.push(host);
                }
            }
        }

        for parsed in pidb.services.values() {
            let host_id = Self::host_id(&state, &parsed.address)
                .ok_or_else(|| SnerError::Internal("service without host".to_string()))?;
            match state.services.iter_mut().find(|service| {
                service.host_id == host_id
                    && service.proto == parsed.proto
                    && service.port == parsed.port
            }) {
                Some(service) => {
                    service.update_from(parsed);
                    service.modified = now;
                }
                None => {
                    let id = Self::next_id(&mut state);
                    let mut service = Service {
                        id,
                        host_id,
                        proto: parsed.proto.clone(),
                        port: parsed.port,
                        state: None,
                        name: None,
                        info: None,
                        tags: Vec::new(),
                        comment: None,
                        created: now,
                        modified: now,
                        rescan_time: now,
                        import_time: None,
                    };
                    service.update_from(parsed);
                    state.services.push(service);
                }
            }
        }

        for parsed in pidb.vulns.values() {
            let host_id = Self::host_id(&state, &parsed.address)
                .ok_or_else(|| SnerError::Internal("vuln without host".to_string()))?;
            let service_id = parsed
                .proto
                .as_ref()
                .zip(parsed.port)
                .and_then(|(proto, port)| Self::service_id(&state, host_id, proto, port));
            match state.vulns.iter_mut().find(|vuln| {
                vuln.host_id == host_id
                    && vuln.service_id == service_id
                    && vuln.xtype == parsed.xtype
                    && vuln.via_target == parsed.via_target
            }) {
                Some(vuln) => {
                    vuln.update_from(parsed);
                    vuln.modified = now;
                }
                None => {
                    let id = Self::next_id(&mut state);
                    let mut vuln = Vuln {
                        id,
                        host_id,
                        service_id,
                        via_target: parsed.via_target.clone(),
                        name: parsed.name.clone(),
                        xtype: parsed.xtype.clone(),
                        severity: Severity::Unknown,
                        descr: None,
                        data: None,
                        refs: Vec::new(),
                        tags: Vec::new(),
                        comment: None,
                        created: now,
                        modified: now,
                        rescan_time: now,
                        import_time: None,
                    };
                    vuln.update_from(parsed);
                    state.vulns.push(vuln);
                }
            }
        }

        for parsed in pidb.notes.values() {
            let host_id = Self::host_id(&state, &parsed.address)
                .ok_or_else(|| SnerError::Internal("note without host".to_string()))?;
            let service_id = parsed
                .proto
                .as_ref()
                .zip(parsed.port)
                .and_then(|(proto, port)| Self::service_id(&state, host_id, proto, port));
            match state.notes.iter_mut().find(|note| {
                note.host_id == host_id
                    && note.service_id == service_id
                    && note.xtype == parsed.xtype
                    && note.via_target == parsed.via_target
            }) {
                Some(note) => {
                    note.update_from(parsed);
                    note.modified = now;
                }
                None => {
                    let id = Self::next_id(&mut state);
                    let mut note = Note {
                        id,
                        host_id,
                        service_id,
                        via_target: parsed.via_target.clone(),
                        xtype: parsed.xtype.clone(),
                        data: None,
                        tags: Vec::new(),
                        comment: None,
                        created: now,
                        modified: now,
                        import_time: None,
                    };
                    note.update_from(parsed);
                    state.notes.push(note);
                }
            }
        }

        Ok(())
    }

    async fn cleanup_storage(&self) -> SnerResult<()> {
        let mut state = self.state.lock().unwrap();

        // remove any but open services; vulns/notes cascade
        let removed: Vec<i64> = state
            .services
            .iter()
            .filter(|service| {
                !service
                    .state
                    .as_deref()
                    .map(|state| state.to_lowercase().starts_with("open"))
                    .unwrap_or(false)
            })
            .map(|service| service.id)
            .collect();
        state.services.retain(|service| !removed.contains(&service.id));
        state
            .vulns
            .retain(|vuln| !vuln.service_id.is_some_and(|id| removed.contains(&id)));
        state
            .notes
            .retain(|note| !note.service_id.is_some_and(|id| removed.contains(&id)));

        // hosts with no info and no child rows; a lone hostnames note does
        // not save the host
        let drop_ids: Vec<i64> = state
            .hosts
            .iter()
            .filter(|host| {
                let noinfo = host.os.as_deref().unwrap_or("").is_empty()
                    && host.comment.as_deref().unwrap_or("").is_empty();
                let services = state
                    .services
                    .iter()
                    .filter(|service| service.host_id == host.id)
                    .count();
                let vulns = state
                    .vulns
                    .iter()
                    .filter(|vuln| vuln.host_id == host.id)
                    .count();
                let notes: Vec<&Note> = state
                    .notes
                    .iter()
                    .filter(|note| note.host_id == host.id)
                    .collect();
                let only_hostnames_note =
                    notes.len() == 1 && notes[0].xtype.as_deref() == Some("hostnames");
                noinfo
                    && services == 0
                    && vulns == 0
                    && (notes.is_empty() || only_hostnames_note)
            })
            .map(|host| host.id)
            .collect();

        state.hosts.retain(|host| !drop_ids.contains(&host.id));
        state.vulns.retain(|vuln| !drop_ids.contains(&vuln.host_id));
        state.notes.retain(|note| !drop_ids.contains(&note.host_id));
        Ok(())
    }

    async fn rescan_services(
        &self,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SnerResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let hosts: std::collections::HashMap<i64, String> = state
            .hosts
            .iter()
            .map(|host| (host.id, host.address.clone()))
            .collect();

        let mut rescan = Vec::new();
        for service in state
            .services
            .iter_mut()
            .filter(|service| service.rescan_time < horizon)
        {
            if let Some(address) = hosts.get(&service.host_id) {
                rescan.push(format!(
                    "{}://{}:{}",
                    service.proto,
                    sner_core::netutils::format_host_address(address),
                    service.port
                ));
                service.rescan_time = now;
            }
        }
        Ok(rescan)
    }

    async fn rescan_hosts(
        &self,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SnerResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let mut rescan = Vec::new();
        for host in state
            .hosts
            .iter_mut()
            .filter(|host| host.rescan_time < horizon)
        {
            rescan.push(host.address.clone());
            host.rescan_time = now;
        }
        Ok(rescan)
    }

    async fn six_addresses(&self) -> SnerResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut addresses: Vec<String> = state
            .hosts
            .iter()
            .filter(|host| host.address.contains(':'))
            .map(|host| host.address.clone())
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn get_host(&self, address: &str) -> SnerResult<Option<Host>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hosts
            .iter()
            .find(|host| host.address == address)
            .cloned())
    }

    async fn query_hosts(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<Host>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hosts
            .iter()
            .filter(|host| address_allowed(&host.address, networks))
            .filter(|host| {
                filter.is_none_or(|f| filter_matches(f, &serde_json::to_value(host).unwrap()))
            })
            .cloned()
            .collect())
    }

    async fn query_services(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<ServiceListItem>> {
        let state = self.state.lock().unwrap();
        let mut items = Vec::new();
        for service in &state.services {
            let Some(host) = state.hosts.iter().find(|host| host.id == service.host_id) else {
                continue;
            };
            if !address_allowed(&host.address, networks) {
                continue;
            }
            let item = ServiceListItem {
                address: host.address.clone(),
                hostname: host.hostname.clone(),
                proto: service.proto.clone(),
                port: service.port,
                state: service.state.clone(),
                name: service.name.clone(),
                info: service.info.clone(),
            };
            if filter.is_none_or(|f| filter_matches(f, &serde_json::to_value(&item).unwrap())) {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn query_notes(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<NoteListItem>> {
        let state = self.state.lock().unwrap();
        let mut items = Vec::new();
        for note in &state.notes {
            let Some(host) = state.hosts.iter().find(|host| host.id == note.host_id) else {
                continue;
            };
            if !address_allowed(&host.address, networks) {
                continue;
            }
            let service = note
                .service_id
                .and_then(|id| state.services.iter().find(|service| service.id == id));
            let item = NoteListItem {
                address: host.address.clone(),
                hostname: host.hostname.clone(),
                proto: service.map(|service| service.proto.clone()),
                port: service.map(|service| service.port),
                via_target: note.via_target.clone(),
                xtype: note.xtype.clone(),
                data: note.data.clone(),
            };
            if filter.is_none_or(|f| filter_matches(f, &serde_json::to_value(&item).unwrap())) {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn query_versioninfo(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<VersionInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .versioninfo
            .iter()
            .filter(|info| address_allowed(&info.host_address, networks))
            .filter(|info| {
                filter.is_none_or(|f| filter_matches(f, &serde_json::to_value(info).unwrap()))
            })
            .cloned()
            .collect())
    }

    async fn rebuild_versioninfo(&self) -> SnerResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for service in &state.services {
            let Some(host) = state.hosts.iter().find(|host| host.id == service.host_id) else {
                continue;
            };
            let Some(info) = service.info.as_deref() else {
                continue;
            };
            if let Some((product, version)) = sner_core::models::storage::extract_version(info) {
                rows.push(VersionInfo {
                    id: (rows.len() + 1) as i64,
                    host_id: host.id,
                    host_address: host.address.clone(),
                    host_hostname: host.hostname.clone(),
                    service_proto: Some(service.proto.clone()),
                    service_port: Some(service.port),
                    via_target: None,
                    product,
                    version,
                    extra: serde_json::json!({}),
                });
            }
        }
        let count = rows.len() as u64;
        state.versioninfo = rows;
        Ok(count)
    }

    async fn counts(&self) -> SnerResult<StorageCounts> {
        let state = self.state.lock().unwrap();
        Ok(StorageCounts {
            hosts: state.hosts.len() as i64,
            services: state.services.len() as i64,
            vulns: state.vulns.len() as i64,
            notes: state.notes.len() as i64,
        })
    }
}
