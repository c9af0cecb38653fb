//! Planner: executes configured pipelines that project finished job
//! outputs into storage imports and follow-up queues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use sner_core::config::{PipelineConfig, PlannerConfig, ServerConfig};
use sner_core::errors::SnerResult;
use sner_core::traits::{ExclRepository, JobRepository, QueueRepository, StorageRepository};
use sner_scheduler::SchedulerService;

pub mod lastrun;
pub mod steps;

use steps::{StepContext, StepError};

pub struct Planner {
    config: PlannerConfig,
    pub(crate) var_dir: PathBuf,
    pub(crate) scheduler: Arc<SchedulerService>,
    pub(crate) queues: Arc<dyn QueueRepository>,
    pub(crate) jobs: Arc<dyn JobRepository>,
    pub(crate) excls: Arc<dyn ExclRepository>,
    pub(crate) storage: Arc<dyn StorageRepository>,
    oneshot: bool,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_config: &ServerConfig,
        config: PlannerConfig,
        scheduler: Arc<SchedulerService>,
        queues: Arc<dyn QueueRepository>,
        jobs: Arc<dyn JobRepository>,
        excls: Arc<dyn ExclRepository>,
        storage: Arc<dyn StorageRepository>,
        oneshot: bool,
    ) -> Self {
        Self {
            config,
            var_dir: server_config.var_dir.clone(),
            scheduler,
            queues,
            jobs,
            excls,
            storage,
            oneshot,
        }
    }

    /// Main loop: all pipelines in declaration order, failures logged and
    /// contained per pipeline, LOOPSLEEP pause between passes with fast
    /// cooperative shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> SnerResult<()> {
        info!("planner startup, {} pipelines", self.config.pipelines.len());

        loop {
            for pipeline in &self.config.pipelines {
                if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                    info!("planner shutdown");
                    return Ok(());
                }
                if let Err(err) = self.run_pipeline(pipeline).await {
                    error!("pipeline {} failed: {}", pipeline.name(), err);
                }
            }

            if self.oneshot {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.loopsleep_seconds)) => {}
                _ = shutdown.recv() => {
                    info!("planner shutdown");
                    return Ok(());
                }
            }
        }
    }

    async fn run_pipeline(&self, pipeline: &PipelineConfig) -> SnerResult<()> {
        debug!("run pipeline {}", pipeline.name());
        match pipeline {
            PipelineConfig::Queue { queue, steps } => {
                let Some(qref) = self.queues.get_by_name(queue).await? else {
                    return Err(sner_core::SnerError::Configuration(format!(
                        "missing queue {queue}"
                    )));
                };
                // one iteration consumes one finished job; the count drawn
                // up front bounds the loop even if the config forgets to
                // archive
                let finished = self
                    .jobs
                    .list_by_queue(qref.id)
                    .await?
                    .iter()
                    .filter(|job| job.retval == Some(0))
                    .count();

                for _ in 0..finished {
                    match self.run_steps(steps).await {
                        Ok(()) => {}
                        Err(StepError::Stop) => break,
                        Err(StepError::Failed(err)) => return Err(err),
                    }
                }
                Ok(())
            }
            PipelineConfig::Interval {
                name,
                interval_seconds,
                steps,
            } => {
                if !lastrun::should_run(&self.var_dir, name, *interval_seconds) {
                    debug!("pipeline {} within interval, skipped", name);
                    return Ok(());
                }
                match self.run_steps(steps).await {
                    Ok(()) | Err(StepError::Stop) => {
                        lastrun::update_lastrun(&self.var_dir, name)?;
                        Ok(())
                    }
                    Err(StepError::Failed(err)) => Err(err),
                }
            }
            PipelineConfig::Generic { steps, .. } => match self.run_steps(steps).await {
                Ok(()) | Err(StepError::Stop) => Ok(()),
                Err(StepError::Failed(err)) => Err(err),
            },
        }
    }

    async fn run_steps(&self, steps: &[sner_core::config::StepConfig]) -> Result<(), StepError> {
        let mut ctx = StepContext::default();
        for step in steps {
            self.run_step(step, &mut ctx).await?;
        }
        Ok(())
    }
}
