//! Planner step implementations. Steps are keyed by name; an unknown step
//! name fails the pipeline while the planner loop continues with the next
//! one.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr};

use chrono::{Duration, Utc};
use tracing::{debug, info};

use sner_core::config::StepConfig;
use sner_core::errors::{SnerError, SnerResult};
use sner_core::models::{Job, Queue};
use sner_core::netutils::{enumerate_network, format_host_address, CidrNet};
use sner_core::pidb::ParsedItemsDb;
use sner_parser::get_parser;
use sner_scheduler::ExclMatcher;

use crate::Planner;

/// Clean termination of the current pipeline.
#[derive(Debug)]
pub enum StepError {
    Stop,
    Failed(SnerError),
}

impl From<SnerError> for StepError {
    fn from(err: SnerError) -> Self {
        StepError::Failed(err)
    }
}

pub type StepResult = Result<(), StepError>;

/// Data flowing between steps of one pipeline run.
#[derive(Debug, Default)]
pub enum StepData {
    #[default]
    Empty,
    Pidb(ParsedItemsDb),
    Targets(Vec<String>),
}

#[derive(Debug, Default)]
pub struct StepContext {
    pub job: Option<Job>,
    pub queue: Option<Queue>,
    pub data: StepData,
}

impl StepContext {
    fn pidb(&mut self) -> Result<&mut ParsedItemsDb, StepError> {
        match &mut self.data {
            StepData::Pidb(pidb) => Ok(pidb),
            _ => Err(StepError::Failed(SnerError::Internal(
                "step requires parsed data in context".to_string(),
            ))),
        }
    }

    fn targets(&mut self) -> Result<&mut Vec<String>, StepError> {
        match &mut self.data {
            StepData::Targets(targets) => Ok(targets),
            _ => Err(StepError::Failed(SnerError::Internal(
                "step requires a target list in context".to_string(),
            ))),
        }
    }
}

impl Planner {
    pub(crate) async fn run_step(&self, step: &StepConfig, ctx: &mut StepContext) -> StepResult {
        debug!("run step {}", step.step);
        match step.step.as_str() {
            "stop_pipeline" => Err(StepError::Stop),
            "load_job" => self.step_load_job(step, ctx).await,
            "import_job" => self.step_import_job(ctx).await,
            "archive_job" => self.step_archive_job(ctx).await,
            "project_servicelist" => step_project_servicelist(ctx),
            "project_hostlist" => step_project_hostlist(ctx),
            "filter_netranges" => step_filter_netranges(step, ctx),
            "filter_tarpits" => step_filter_tarpits(step, ctx),
            "enqueue" => self.step_enqueue(step, ctx).await,
            "storage_cleanup" => Ok(self.storage.cleanup_storage().await?),
            "rescan_services" => self.step_rescan_services(step).await,
            "rescan_hosts" => self.step_rescan_hosts(step).await,
            "discover_ipv4" | "discover_ipv6_dns" => self.step_discover(step).await,
            "discover_ipv6_enum" => self.step_discover_ipv6_enum(step).await,
            "rebuild_versioninfo" => {
                let count = self.storage.rebuild_versioninfo().await?;
                info!("rebuild_versioninfo {} rows", count);
                Ok(())
            }
            unknown => Err(StepError::Failed(SnerError::Configuration(format!(
                "unknown step {unknown}"
            )))),
        }
    }

    /// Load one finished job from the queue, or stop the pipeline.
    async fn step_load_job(&self, step: &StepConfig, ctx: &mut StepContext) -> StepResult {
        let queue_name: String = step.arg("queue")?;
        let queue = self
            .queues
            .get_by_name(&queue_name)
            .await?
            .ok_or_else(|| SnerError::Configuration(format!("missing queue {queue_name}")))?;

        // job rows are shared with the scheduler; lock briefly for the read
        let job = {
            let _guard = self.scheduler.acquire_lock().await?;
            self.jobs.first_finished(queue.id).await?
        };
        let Some(job) = job else {
            return Err(StepError::Stop);
        };
        info!("load_job {} ({})", job.id, queue.name);

        let module = queue_module(&queue)?;
        let parser = get_parser(&module)?;
        let pidb = parser.parse_path(&job.output_abspath(&queue, &self.var_dir))?;

        ctx.job = Some(job);
        ctx.queue = Some(queue);
        ctx.data = StepData::Pidb(pidb);
        Ok(())
    }

    async fn step_import_job(&self, ctx: &mut StepContext) -> StepResult {
        let pidb = ctx.pidb()?.clone();
        if let Some(job) = &ctx.job {
            info!("import_job {}", job.id);
        }
        self.storage.import_pidb(&pidb).await?;
        Ok(())
    }

    /// Copy the job output into the planner archive and delete the job.
    async fn step_archive_job(&self, ctx: &mut StepContext) -> StepResult {
        let job = ctx.job.take().ok_or_else(|| {
            StepError::Failed(SnerError::Internal("no job in context".to_string()))
        })?;
        let queue = ctx.queue.clone().ok_or_else(|| {
            StepError::Failed(SnerError::Internal("no queue in context".to_string()))
        })?;

        info!("archive_job {} ({})", job.id, queue.name);
        let archive_dir = self.var_dir.join("planner_archive");
        std::fs::create_dir_all(&archive_dir).map_err(SnerError::from)?;
        std::fs::copy(
            job.output_abspath(&queue, &self.var_dir),
            archive_dir.join(job.id.to_string()),
        )
        .map_err(SnerError::from)?;

        self.scheduler.job_delete(job.id).await?;
        Ok(())
    }

    /// Enqueue context targets; exclusions and already queued targets are
    /// filtered out.
    async fn step_enqueue(&self, step: &StepConfig, ctx: &mut StepContext) -> StepResult {
        let queue_name: String = step.arg("queue")?;
        let targets = ctx.targets()?.clone();
        self.enqueue_filtered(&queue_name, targets).await?;
        Ok(())
    }

    async fn step_rescan_services(&self, step: &StepConfig) -> StepResult {
        let interval: u64 = step.arg("interval_seconds")?;
        let queue_name: String = step.arg("queue")?;

        let now = Utc::now();
        let horizon = now - Duration::seconds(interval as i64);
        let rescan = self.storage.rescan_services(horizon, now).await?;
        if !rescan.is_empty() {
            info!("rescan_services, rescan {} items", rescan.len());
            self.enqueue_filtered(&queue_name, rescan).await?;
        }
        Ok(())
    }

    async fn step_rescan_hosts(&self, step: &StepConfig) -> StepResult {
        let interval: u64 = step.arg("interval_seconds")?;
        let queue_name: String = step.arg("queue")?;

        let now = Utc::now();
        let horizon = now - Duration::seconds(interval as i64);
        let rescan = self.storage.rescan_hosts(horizon, now).await?;
        if !rescan.is_empty() {
            info!("rescan_hosts, rescan {} items", rescan.len());
            self.enqueue_filtered(&queue_name, rescan).await?;
        }
        Ok(())
    }

    /// Enumerate configured netranges into a discovery queue.
    async fn step_discover(&self, step: &StepConfig) -> StepResult {
        let netranges: Vec<String> = step.arg("netranges")?;
        let queue_name: String = step.arg("queue")?;

        let mut targets = Vec::new();
        for netrange in &netranges {
            targets.extend(enumerate_network(netrange)?);
        }
        if !targets.is_empty() {
            info!("{}, enumerated {} items", step.step, targets.len());
            self.enqueue_filtered(&queue_name, targets).await?;
        }
        Ok(())
    }

    /// Derive 0-ffff enumeration specs around known v6 hosts.
    async fn step_discover_ipv6_enum(&self, step: &StepConfig) -> StepResult {
        let queue_name: String = step.arg("queue")?;

        let targets = project_six_enums(&self.storage.six_addresses().await?);
        if !targets.is_empty() {
            info!("discover_ipv6_enum, queued {} items", targets.len());
            self.enqueue_filtered(&queue_name, targets).await?;
        }
        Ok(())
    }

    /// Shared enqueue path of all planner steps: drop excluded candidates,
    /// then let the scheduler handle normalization and per-queue dedup.
    async fn enqueue_filtered(&self, queue_name: &str, targets: Vec<String>) -> SnerResult<u64> {
        let queue = self
            .queues
            .get_by_name(queue_name)
            .await?
            .ok_or_else(|| SnerError::Configuration(format!("missing queue {queue_name}")))?;

        let matcher = ExclMatcher::new(&self.excls.list().await?)?;
        let allowed: Vec<String> = targets
            .into_iter()
            .filter(|target| !matcher.matches(target))
            .collect();

        let enqueued = self.scheduler.enqueue(&queue, allowed).await?;
        if enqueued > 0 {
            info!("enqueued {} targets to \"{}\"", enqueued, queue.name);
        }
        Ok(enqueued)
    }
}

fn step_project_servicelist(ctx: &mut StepContext) -> StepResult {
    let pidb = ctx.pidb()?;
    let services: Vec<String> = pidb
        .services
        .values()
        .map(|service| {
            format!(
                "{}://{}:{}",
                service.proto,
                format_host_address(&service.address),
                service.port
            )
        })
        .collect();
    ctx.data = StepData::Targets(services);
    Ok(())
}

fn step_project_hostlist(ctx: &mut StepContext) -> StepResult {
    let pidb = ctx.pidb()?;
    let hosts: Vec<String> = pidb.hosts.keys().cloned().collect();
    ctx.data = StepData::Targets(hosts);
    Ok(())
}

/// Whitelist targets belonging to the given netranges.
fn step_filter_netranges(step: &StepConfig, ctx: &mut StepContext) -> StepResult {
    let netranges: Vec<String> = step.arg("netranges")?;
    let whitelist: Vec<CidrNet> = netranges
        .iter()
        .map(|net| net.parse())
        .collect::<SnerResult<_>>()?;

    let targets = ctx.targets()?;
    targets.retain(|target| {
        target
            .parse::<IpAddr>()
            .map(|addr| whitelist.iter().any(|net| net.contains(&addr)))
            .unwrap_or(false)
    });
    Ok(())
}

/// Drop hosts with too many detected services; such targets are usually
/// tarpits poisoning the storage.
fn step_filter_tarpits(step: &StepConfig, ctx: &mut StepContext) -> StepResult {
    let threshold: usize = step.arg_or("threshold", 200usize)?;

    let pidb = ctx.pidb()?;
    let mut services_per_host: HashMap<String, usize> = HashMap::new();
    for service in pidb.services.values() {
        *services_per_host.entry(service.address.clone()).or_default() += 1;
    }
    let over_threshold: HashSet<String> = services_per_host
        .into_iter()
        .filter(|(_, count)| *count > threshold)
        .map(|(address, _)| address)
        .collect();

    if !over_threshold.is_empty() {
        info!("filter_tarpits dropped {:?}", over_threshold);
        pidb.remove_addresses(&over_threshold);
    }
    Ok(())
}

/// scan6-style enumeration patterns around known v6 hosts; EUI-64 derived
/// addresses are skipped, their networks are not worth enumerating.
pub fn project_six_enums(addresses: &[String]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();

    for address in addresses {
        let Ok(addr) = address.parse::<Ipv6Addr>() else {
            continue;
        };
        let groups: Vec<String> = addr
            .segments()
            .iter()
            .map(|segment| format!("{segment:04x}"))
            .collect();
        if groups[5].ends_with("ff") && groups[6].starts_with("fe") {
            continue;
        }

        let mut spec = groups[..7].join(":");
        spec.push_str(":0-ffff");
        if !targets.contains(&spec) {
            targets.push(spec);
        }
    }

    targets
}

/// Module name from the queue YAML config.
pub(crate) fn queue_module(queue: &Queue) -> SnerResult<String> {
    let config: serde_json::Value = serde_yaml::from_str(&queue.config)
        .map_err(|err| SnerError::Parse(format!("invalid queue config: {err}")))?;
    config["module"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            SnerError::Configuration(format!("queue {} config has no module", queue.name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_enum_projection() {
        let addresses = vec![
            "2001:db8::1".to_string(),
            "2001:db8::2".to_string(),
            // EUI-64 host, skipped
            "2001:db8::0202:b3ff:fe1e:8329".to_string(),
            "not-an-address".to_string(),
        ];
        let targets = project_six_enums(&addresses);
        assert_eq!(
            targets,
            vec!["2001:0db8:0000:0000:0000:0000:0000:0-ffff".to_string()]
        );
    }

    #[test]
    fn tarpit_filter_drops_noisy_hosts() {
        use sner_core::pidb::ParsedService;

        let mut pidb = ParsedItemsDb::default();
        for port in 0..5 {
            pidb.upsert_service(ParsedService::new("10.0.0.1", "tcp", port));
        }
        pidb.upsert_service(ParsedService::new("10.0.0.2", "tcp", 80));

        let mut ctx = StepContext {
            data: StepData::Pidb(pidb),
            ..Default::default()
        };
        let step = StepConfig::new("filter_tarpits").with_arg("threshold", serde_json::json!(3));
        step_filter_tarpits(&step, &mut ctx).unwrap();

        match ctx.data {
            StepData::Pidb(pidb) => {
                assert!(!pidb.hosts.contains_key("10.0.0.1"));
                assert!(pidb.hosts.contains_key("10.0.0.2"));
                assert_eq!(pidb.services.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn netrange_filter_whitelists() {
        let mut ctx = StepContext {
            data: StepData::Targets(vec![
                "10.0.0.1".to_string(),
                "192.0.2.1".to_string(),
                "hostname".to_string(),
            ]),
            ..Default::default()
        };
        let step = StepConfig::new("filter_netranges")
            .with_arg("netranges", serde_json::json!(["10.0.0.0/8"]));
        step_filter_netranges(&step, &mut ctx).unwrap();

        match ctx.data {
            StepData::Targets(targets) => assert_eq!(targets, vec!["10.0.0.1".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn projections_require_pidb() {
        let mut ctx = StepContext::default();
        assert!(matches!(
            step_project_servicelist(&mut ctx),
            Err(StepError::Failed(_))
        ));
    }

    #[test]
    fn servicelist_projection_formats_endpoints() {
        use sner_core::pidb::ParsedService;

        let mut pidb = ParsedItemsDb::default();
        pidb.upsert_service(ParsedService::new("127.0.0.1", "tcp", 443));
        pidb.upsert_service(ParsedService::new("2001:db8::1", "udp", 53));

        let mut ctx = StepContext {
            data: StepData::Pidb(pidb),
            ..Default::default()
        };
        step_project_servicelist(&mut ctx).unwrap();

        match ctx.data {
            StepData::Targets(mut targets) => {
                targets.sort();
                assert_eq!(
                    targets,
                    vec![
                        "tcp://127.0.0.1:443".to_string(),
                        "udp://[2001:db8::1]:53".to_string(),
                    ]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
