//! Agent: fetches assignments from the central server, executes the
//! requested module and uploads the archived output.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tracing::{debug, error, info};
use zip::write::SimpleFileOptions;

use sner_core::config::AgentConfig;
use sner_core::errors::{SnerError, SnerResult};
use sner_core::models::Assignment;

pub mod modules;

use modules::get_module;

/// Cooperative control handle. Shutdown lets the current assignment
/// finish; terminate aborts it.
#[derive(Clone, Default)]
pub struct AgentControl {
    shutdown: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
}

impl AgentControl {
    /// Finish the current assignment, then stop looping.
    pub fn shutdown(&self) {
        info!("agent shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Abort the running module immediately and stop.
    pub fn terminate(&self) {
        info!("agent terminate requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.terminate.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }
}

pub struct Agent {
    config: AgentConfig,
    workdir: PathBuf,
    client: reqwest::Client,
    control: AgentControl,
}

impl Agent {
    pub fn new(config: AgentConfig, workdir: &Path) -> SnerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.net_timeout_seconds))
            .build()
            .map_err(|err| SnerError::Internal(err.to_string()))?;

        Ok(Self {
            config,
            workdir: workdir.to_path_buf(),
            client,
            control: AgentControl::default(),
        })
    }

    pub fn control(&self) -> AgentControl {
        self.control.clone()
    }

    /// Fetch, process and upload assignments until stopped; returns the
    /// last module retval.
    pub async fn run(&self) -> SnerResult<i32> {
        let mut retval = 0;

        while !self.control.should_stop() {
            let assignment = match self.get_assignment().await {
                Ok(assignment) => assignment,
                Err(err) => {
                    error!("{}", err);
                    if self.config.oneshot {
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_secs(self.config.backoff_seconds)).await;
                    continue;
                }
            };
            let Some(assignment) = assignment else {
                if self.config.oneshot {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(self.config.backoff_seconds)).await;
                continue;
            };

            retval = self.process_assignment(&assignment);
            let archive = self.workdir.join(format!("{}.zip", assignment.id));
            self.upload_output(&assignment, retval, &archive).await?;
            let _ = std::fs::remove_file(&archive);

            if self.config.oneshot {
                break;
            }
        }

        Ok(retval)
    }

    /// One assignment request; empty reply means no work.
    async fn get_assignment(&self) -> SnerResult<Option<Assignment>> {
        let mut body = serde_json::Map::new();
        if let Some(queue) = &self.config.queue {
            body.insert("queue".to_string(), serde_json::json!(queue));
        }
        body.insert("caps".to_string(), serde_json::json!(self.config.caps));

        let response = self
            .client
            .post(format!("{}/api/v2/scheduler/job/assign", self.config.server))
            .header("X-API-KEY", &self.config.apikey)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| SnerError::Internal(format!("get_assignment error, {err}")))?;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| SnerError::Internal(format!("get_assignment error, {err}")))?;
        if value.as_object().is_some_and(|object| object.is_empty()) {
            debug!("get_assignment response-nowork");
            return Ok(None);
        }

        let assignment: Assignment = serde_json::from_value(value)?;
        info!("get_assignment success, {}", assignment.id);
        Ok(Some(assignment))
    }

    /// Run the module in a fresh job directory and archive the results.
    /// Module failures count as retval 1; the output is still uploaded so
    /// it can be inspected.
    fn process_assignment(&self, assignment: &Assignment) -> i32 {
        let jobdir = self.workdir.join(assignment.id.to_string());

        let retval = match self.run_module(assignment, &jobdir) {
            Ok(retval) => retval,
            Err(err) => {
                error!("process_assignment error, {}", err);
                1
            }
        };

        if let Err(err) = zip_directory(&jobdir, &self.workdir.join(format!("{}.zip", assignment.id)))
        {
            error!("output archive error, {}", err);
        }
        let _ = std::fs::remove_dir_all(&jobdir);

        info!("process_assignment finished, retval={}", retval);
        retval
    }

    fn run_module(&self, assignment: &Assignment, jobdir: &Path) -> SnerResult<i32> {
        std::fs::create_dir_all(jobdir)?;
        std::fs::write(
            jobdir.join("assignment.json"),
            serde_json::to_vec(assignment)?,
        )?;

        if self.control.terminated() {
            return Ok(1);
        }

        let module_name = assignment.config["module"]
            .as_str()
            .ok_or_else(|| SnerError::BadRequest("assignment without module".to_string()))?;
        get_module(module_name)?.run(assignment, jobdir)
    }

    /// Upload with retries; the server discards duplicates so retrying a
    /// possibly-delivered upload is safe.
    async fn upload_output(
        &self,
        assignment: &Assignment,
        retval: i32,
        archive: &Path,
    ) -> SnerResult<()> {
        let output = base64::engine::general_purpose::STANDARD.encode(std::fs::read(archive)?);
        let body = serde_json::json!({
            "id": assignment.id,
            "retval": retval,
            "output": output,
        });

        loop {
            let result = self
                .client
                .post(format!("{}/api/v2/scheduler/job/output", self.config.server))
                .header("X-API-KEY", &self.config.apikey)
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => {
                    info!("upload_output success, {}", assignment.id);
                    return Ok(());
                }
                Err(err) => {
                    error!("upload_output error, {}", err);
                    if self.control.terminated() {
                        return Err(SnerError::Internal("terminated during upload".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(self.config.backoff_seconds)).await;
                }
            }
        }
    }
}

/// Pack a directory into a zip archive (flat, single write per job).
pub fn zip_directory(dir: &Path, archive_path: &Path) -> SnerResult<()> {
    let file = std::fs::File::create(archive_path)?;
    let mut archive = zip::ZipWriter::new(file);

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SnerError::Internal("invalid file name".to_string()))?;
        archive
            .start_file(name, SimpleFileOptions::default())
            .map_err(|err| SnerError::Internal(format!("archive error: {err}")))?;
        archive.write_all(&std::fs::read(&path)?)?;
    }

    archive
        .finish()
        .map_err(|err| SnerError::Internal(format!("archive error: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn zip_directory_packs_flat_files() {
        let dir = tempfile::tempdir().unwrap();
        let jobdir = dir.path().join("job");
        std::fs::create_dir_all(&jobdir).unwrap();
        std::fs::write(jobdir.join("assignment.json"), b"{}").unwrap();
        std::fs::write(jobdir.join("output.gnmap"), b"Host: 127.0.0.1 ()").unwrap();

        let archive_path = dir.path().join("job.zip");
        zip_directory(&jobdir, &archive_path).unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&archive_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut member = archive.by_name("output.gnmap").unwrap();
        let mut data = String::new();
        member.read_to_string(&mut data).unwrap();
        assert_eq!(data, "Host: 127.0.0.1 ()");
    }

    #[test]
    fn control_flags() {
        let control = AgentControl::default();
        assert!(!control.should_stop());
        control.shutdown();
        assert!(control.should_stop());
        assert!(!control.terminated());
        control.terminate();
        assert!(control.terminated());
    }
}
