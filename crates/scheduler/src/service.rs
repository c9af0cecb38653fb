//! Scheduler service: hands out target batches to agents, consumes their
//! output and maintains the Target/Readynet/Heatmap invariants. Every
//! state-changing operation runs under the process-wide scheduler lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sner_core::config::ServerConfig;
use sner_core::errors::{SnerError, SnerResult};
use sner_core::models::{Assignment, Job, Queue, Target};
use sner_core::traits::{
    ExclRepository, JobRepository, LockGuard, QueueRepository, SchedulerLock, TargetRepository,
};

use crate::excl::ExclMatcher;
use crate::heatmap::Heatmap;

/// Sentinel retval forced by reconcile.
const RECONCILE_RETVAL: i32 = -1;

/// Outcome of a job output upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutputOutcome {
    Success,
    /// Unknown or already finished job id; silently discarded so agents
    /// stay stateless.
    Discard,
}

pub struct SchedulerService {
    queues: Arc<dyn QueueRepository>,
    targets: Arc<dyn TargetRepository>,
    jobs: Arc<dyn JobRepository>,
    excls: Arc<dyn ExclRepository>,
    lock: Arc<dyn SchedulerLock>,
    heatmap: Mutex<Heatmap>,
    var_dir: PathBuf,
    gc_probability: f64,
    timeout_assign: Duration,
    timeout_output: Duration,
}

impl SchedulerService {
    pub fn new(
        config: &ServerConfig,
        queues: Arc<dyn QueueRepository>,
        targets: Arc<dyn TargetRepository>,
        jobs: Arc<dyn JobRepository>,
        excls: Arc<dyn ExclRepository>,
        lock: Arc<dyn SchedulerLock>,
    ) -> Self {
        let heatmap = Heatmap::load(&config.var_dir, config.heatmap_hot_level);

        Self {
            queues,
            targets,
            jobs,
            excls,
            lock,
            heatmap: Mutex::new(heatmap),
            var_dir: config.var_dir.clone(),
            gc_probability: config.heatmap_gc_probability,
            timeout_assign: Duration::from_millis(config.timeout_assign_ms),
            timeout_output: Duration::from_millis(config.timeout_output_ms),
        }
    }

    /// Startup reconciliation: rebuild heatmap accounting from running jobs
    /// and drop readynets of buckets that come out hot.
    pub async fn restore_heatmap(&self) -> SnerResult<()> {
        let _guard = self.lock.acquire(self.timeout_output).await?;
        let mut heatmap = self.heatmap.lock().await;

        for job in self.jobs.list_running().await? {
            for target in job.assignment_targets()? {
                heatmap.put(&Heatmap::hashval(&target));
            }
        }

        let mut hot = Vec::new();
        for job in self.jobs.list_running().await? {
            for target in job.assignment_targets()? {
                let hashval = Heatmap::hashval(&target);
                if heatmap.is_hot(&hashval) && !hot.contains(&hashval) {
                    hot.push(hashval);
                }
            }
        }
        for hashval in hot {
            self.targets.remove_readynet_all_queues(&hashval).await?;
        }

        info!("heatmap restored, {} in-flight targets", heatmap.total());
        Ok(())
    }

    /// Persist heatmap state; called on graceful stop.
    pub async fn save_heatmap(&self) -> SnerResult<()> {
        self.heatmap.lock().await.save()
    }

    /// Assign a job for an agent. `None` means no work and is the sole
    /// back-pressure mechanism; lock timeouts degrade to it as well.
    pub async fn job_assign(
        &self,
        queue_name: Option<&str>,
        caps: &[String],
    ) -> SnerResult<Option<Assignment>> {
        let guard = match self.lock.acquire(self.timeout_assign).await {
            Ok(guard) => guard,
            Err(SnerError::Busy) => {
                warn!("job_assign busy");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let result = self.job_assign_locked(queue_name, caps).await;
        drop(guard);
        result
    }

    async fn job_assign_locked(
        &self,
        queue_name: Option<&str>,
        caps: &[String],
    ) -> SnerResult<Option<Assignment>> {
        let Some(queue) = self
            .queues
            .select_for_assignment(queue_name, caps)
            .await?
        else {
            return Ok(None);
        };

        let matcher = ExclMatcher::new(&self.excls.list().await?)?;
        let mut heatmap = self.heatmap.lock().await;
        let mut selected: Vec<String> = Vec::new();

        // draw one target per iteration; readynets reflect the current
        // heatmap state, so a bucket going hot stops further draws from it
        loop {
            let Some(hashval) = self.targets.pick_readynet(queue.id).await? else {
                break;
            };

            let Some(target) = self
                .targets
                .bucket_targets(queue.id, &hashval, 1)
                .await?
                .into_iter()
                .next()
            else {
                // stale readynet row without targets
                self.targets.remove_readynet(queue.id, &hashval).await?;
                continue;
            };

            self.targets.delete_targets(&[target.id]).await?;
            if self.targets.count_bucket(queue.id, &hashval).await? == 0 {
                self.targets.remove_readynet(queue.id, &hashval).await?;
            }

            if matcher.matches(&target.target) {
                debug!("job_assign dropped excluded target {}", target.target);
                continue;
            }

            selected.push(target.target);
            heatmap.put(&hashval);
            if heatmap.is_hot(&hashval) {
                self.targets.remove_readynet_all_queues(&hashval).await?;
            }
            if selected.len() == queue.group_size as usize {
                break;
            }
        }

        if rand::random::<f64>() < self.gc_probability {
            heatmap.gc();
        }
        drop(heatmap);

        if selected.is_empty() {
            return Ok(None);
        }

        let assignment = Assignment {
            id: Uuid::new_v4(),
            config: parse_queue_config(&queue.config)?,
            targets: selected,
        };
        let job = Job {
            id: assignment.id,
            queue_id: queue.id,
            assignment: serde_json::to_string(&assignment)?,
            retval: None,
            time_start: Utc::now(),
            time_end: None,
        };
        self.jobs.insert(&job).await?;

        metrics::counter!("sner_jobs_assigned_total").increment(1);
        info!(
            "job_assign {} ({}) {} targets",
            job.id,
            queue.name,
            assignment.targets.len()
        );
        Ok(Some(assignment))
    }

    /// Receive the output of an outstanding job; idempotent on repeats.
    pub async fn job_output(
        &self,
        job_id: Uuid,
        retval: i32,
        output: &[u8],
    ) -> SnerResult<JobOutputOutcome> {
        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = self.job_output_locked(job_id, retval, output).await;
        drop(guard);
        result
    }

    async fn job_output_locked(
        &self,
        job_id: Uuid,
        retval: i32,
        output: &[u8],
    ) -> SnerResult<JobOutputOutcome> {
        let job = match self.jobs.get(job_id).await? {
            Some(job) if job.is_running() => job,
            // invalid, deleted, repeated or clashing job ids; the agent
            // drops its local copy on discard
            _ => return Ok(JobOutputOutcome::Discard),
        };

        let queue = self
            .queues
            .get_by_id(job.queue_id)
            .await?
            .ok_or_else(|| SnerError::Internal(format!("job {} without queue", job.id)))?;

        let output_path = job.output_abspath(&queue, &self.var_dir);
        std::fs::create_dir_all(queue.data_abspath(&self.var_dir))?;
        std::fs::write(&output_path, output)?;

        self.jobs.finalize(job.id, retval, Utc::now()).await?;
        self.cool_targets(&job).await?;

        metrics::counter!("sner_jobs_output_total").increment(1);
        info!("job_output {} retval {}", job.id, retval);
        Ok(JobOutputOutcome::Success)
    }

    /// Cool heatmap buckets for all targets of a job; restore readynets of
    /// buckets that crossed below the hot level.
    async fn cool_targets(&self, job: &Job) -> SnerResult<()> {
        let targets = job.assignment_targets()?;
        let mut heatmap = self.heatmap.lock().await;

        for target in targets {
            let hashval = Heatmap::hashval(&target);
            let was_hot = heatmap.is_hot(&hashval);
            heatmap.pop(&hashval);
            if was_hot && !heatmap.is_hot(&hashval) {
                self.targets.restore_readynets(&hashval).await?;
            }
        }
        Ok(())
    }

    /// Enqueue targets: normalize, de-duplicate against the queue, compute
    /// buckets, insert, refresh readynets for non-hot buckets.
    pub async fn enqueue(&self, queue: &Queue, targets: Vec<String>) -> SnerResult<u64> {
        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = self.enqueue_locked(queue, targets).await;
        drop(guard);
        result
    }

    async fn enqueue_locked(&self, queue: &Queue, targets: Vec<String>) -> SnerResult<u64> {
        let mut seen = std::collections::HashSet::new();
        let normalized: Vec<String> = targets
            .into_iter()
            .map(|target| target.trim().to_string())
            .filter(|target| !target.is_empty() && seen.insert(target.clone()))
            .collect();

        let fresh = self.targets.filter_not_queued(queue.id, normalized).await?;
        if fresh.is_empty() {
            return Ok(0);
        }

        let rows: Vec<Target> = fresh
            .iter()
            .map(|target| Target {
                id: 0,
                queue_id: queue.id,
                target: target.clone(),
                hashval: Heatmap::hashval(target),
                rand: rand::random::<f64>(),
            })
            .collect();
        let inserted = self.targets.insert(&rows).await?;

        let heatmap = self.heatmap.lock().await;
        let mut hashvals: Vec<String> = Vec::new();
        for row in &rows {
            if !heatmap.is_hot(&row.hashval) && !hashvals.contains(&row.hashval) {
                hashvals.push(row.hashval.clone());
            }
        }
        drop(heatmap);
        self.targets.ensure_readynets(queue.id, &hashvals).await?;

        debug!("enqueued {} targets to {}", inserted, queue.name);
        Ok(inserted)
    }

    /// Delete all targets and readynets of a queue.
    pub async fn queue_flush(&self, queue: &Queue) -> SnerResult<()> {
        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = self.targets.flush_queue(queue.id).await;
        drop(guard);
        result
    }

    /// Delete all jobs of a queue (each via job_delete).
    pub async fn queue_prune(&self, queue: &Queue) -> SnerResult<()> {
        for job in self.jobs.list_by_queue(queue.id).await? {
            self.job_delete(job.id).await?;
        }
        Ok(())
    }

    /// Delete a queue; requires the queue to have no jobs.
    pub async fn queue_delete(&self, queue: &Queue) -> SnerResult<()> {
        if self.jobs.count_by_queue(queue.id).await? > 0 {
            return Err(SnerError::Operator(format!(
                "cannot delete queue {} with jobs",
                queue.name
            )));
        }

        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = async {
            self.targets.flush_queue(queue.id).await?;
            self.queues.delete(queue.id).await
        }
        .await;
        drop(guard);
        result?;

        let data_dir = queue.data_abspath(&self.var_dir);
        if data_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&data_dir) {
                warn!("cannot remove queue data dir {}: {}", data_dir.display(), err);
            }
        }
        Ok(())
    }

    /// Delete a finished job and its output file.
    pub async fn job_delete(&self, job_id: Uuid) -> SnerResult<()> {
        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = self.job_delete_locked(job_id).await;
        drop(guard);
        result
    }

    async fn job_delete_locked(&self, job_id: Uuid) -> SnerResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SnerError::NotFound(format!("job {job_id}")))?;

        // deleting a running job would corrupt the heatmap
        if job.is_running() {
            error!("cannot delete running job {}", job.id);
            return Err(SnerError::Operator("cannot delete running job".to_string()));
        }

        if let Some(queue) = self.queues.get_by_id(job.queue_id).await? {
            let output_path = job.output_abspath(&queue, &self.var_dir);
            if output_path.exists() {
                let _ = std::fs::remove_file(&output_path);
            }
        }
        self.jobs.delete(job.id).await
    }

    /// Force-fail a running job whose agent is gone; targets are not
    /// re-enqueued.
    pub async fn job_reconcile(&self, job_id: Uuid) -> SnerResult<()> {
        let guard = self.lock.acquire(self.timeout_output).await?;
        let result = self.job_reconcile_locked(job_id).await;
        drop(guard);
        result
    }

    async fn job_reconcile_locked(&self, job_id: Uuid) -> SnerResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SnerError::NotFound(format!("job {job_id}")))?;

        if !job.is_running() {
            return Err(SnerError::Operator(
                "cannot reconcile finished job".to_string(),
            ));
        }

        self.jobs
            .finalize(job.id, RECONCILE_RETVAL, Utc::now())
            .await?;
        self.cool_targets(&job).await?;
        info!("job_reconcile {}", job.id);
        Ok(())
    }

    /// Re-enqueue the targets of a finished job into its queue and delete
    /// the job.
    pub async fn job_repeat(&self, job_id: Uuid) -> SnerResult<()> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SnerError::NotFound(format!("job {job_id}")))?;

        if job.is_running() {
            return Err(SnerError::Operator("cannot repeat running job".to_string()));
        }

        let queue = self
            .queues
            .get_by_id(job.queue_id)
            .await?
            .ok_or_else(|| SnerError::Internal(format!("job {} without queue", job.id)))?;

        self.enqueue(&queue, job.assignment_targets()?).await?;
        self.job_delete(job.id).await?;
        info!("job_repeat {}", job.id);
        Ok(())
    }

    /// Queue lookup by numeric id or name; command line helper.
    pub async fn queue_by_ident(&self, ident: &str) -> SnerResult<Queue> {
        let queue = match ident.parse::<i32>() {
            Ok(id) => self.queues.get_by_id(id).await?,
            Err(_) => self.queues.get_by_name(ident).await?,
        };
        queue.ok_or_else(|| SnerError::Operator(format!("no such queue: {ident}")))
    }

    /// Acquire the scheduler lock with the output timeout; used by planner
    /// steps that read/write job rows directly.
    pub async fn acquire_lock(&self) -> SnerResult<LockGuard> {
        self.lock.acquire(self.timeout_output).await
    }

    /// Heatmap snapshot of total in-flight targets.
    pub async fn heatmap_total(&self) -> i64 {
        self.heatmap.lock().await.total()
    }
}

/// Queue config YAML parsed into a JSON value; empty config is an empty
/// object.
fn parse_queue_config(config: &str) -> SnerResult<serde_json::Value> {
    if config.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_yaml::from_str(config)
        .map_err(|err| SnerError::Parse(format!("invalid queue config: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_yaml_to_json() {
        let value = parse_queue_config("module: nmap\nargs: -sS --top-ports 100\n").unwrap();
        assert_eq!(value["module"], "nmap");
        assert_eq!(value["args"], "-sS --top-ports 100");

        assert_eq!(parse_queue_config("").unwrap(), serde_json::json!({}));
        assert!(parse_queue_config("{ invalid").is_err());
    }
}
