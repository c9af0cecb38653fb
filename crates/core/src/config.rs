use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{SnerError, SnerResult};

/// Top-level application configuration. Loaded from a TOML file with
/// `SNER__`-prefixed environment variable overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Data directory: queue job outputs, heatmap.json, lastrun files,
    /// planner archive.
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
    /// Rate-limit threshold; a bucket with this many in-flight targets is
    /// hot. 0 disables rate-limiting.
    #[serde(default)]
    pub heatmap_hot_level: i64,
    #[serde(default = "default_gc_probability")]
    pub heatmap_gc_probability: f64,
    #[serde(default = "default_timeout_assign_ms")]
    pub timeout_assign_ms: u64,
    #[serde(default = "default_timeout_output_ms")]
    pub timeout_output_ms: u64,
    /// Running jobs older than this are reported stale by the stats
    /// endpoint.
    #[serde(default = "default_stale_horizon_days")]
    pub stale_horizon_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// API clients; apikey maps to a role and, for storage queries, the
/// networks the caller may see.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub clients: Vec<ApiClient>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiClient {
    pub apikey: String,
    pub role: Role,
    #[serde(default)]
    pub api_networks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    User,
    Operator,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    #[serde(default = "default_loopsleep")]
    pub loopsleep_seconds: u64,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// One configured pipeline; `type` selects the dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PipelineConfig {
    /// Run the step list once per finished job in the named queue.
    Queue { queue: String, steps: Vec<StepConfig> },
    /// Single pass gated by a per-name lastrun file.
    Interval {
        name: String,
        interval_seconds: u64,
        steps: Vec<StepConfig>,
    },
    /// Unconditional single pass.
    Generic { name: String, steps: Vec<StepConfig> },
}

impl PipelineConfig {
    pub fn name(&self) -> &str {
        match self {
            PipelineConfig::Queue { queue, .. } => queue,
            PipelineConfig::Interval { name, .. } => name,
            PipelineConfig::Generic { name, .. } => name,
        }
    }

    pub fn steps(&self) -> &[StepConfig] {
        match self {
            PipelineConfig::Queue { steps, .. } => steps,
            PipelineConfig::Interval { steps, .. } => steps,
            PipelineConfig::Generic { steps, .. } => steps,
        }
    }
}

/// A single planner step: registry name plus free-form arguments.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepConfig {
    pub step: String,
    #[serde(flatten)]
    pub args: HashMap<String, serde_json::Value>,
}

impl StepConfig {
    pub fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, name: &str, value: serde_json::Value) -> Self {
        self.args.insert(name.to_string(), value);
        self
    }

    /// Required argument, deserialized to the requested type.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, name: &str) -> SnerResult<T> {
        let value = self
            .args
            .get(name)
            .ok_or_else(|| {
                SnerError::Configuration(format!("step {} missing argument {}", self.step, name))
            })?
            .clone();
        serde_json::from_value(value).map_err(|err| {
            SnerError::Configuration(format!("step {} argument {}: {}", self.step, name, err))
        })
    }

    /// Optional argument with a fallback.
    pub fn arg_or<T: serde::de::DeserializeOwned>(&self, name: &str, default: T) -> SnerResult<T> {
        match self.args.get(name) {
            None => Ok(default),
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                SnerError::Configuration(format!("step {} argument {}: {}", self.step, name, err))
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_server")]
    pub server: String,
    #[serde(default)]
    pub apikey: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default = "default_backoff")]
    pub backoff_seconds: u64,
    #[serde(default = "default_net_timeout")]
    pub net_timeout_seconds: u64,
    #[serde(default)]
    pub oneshot: bool,
}

impl AppConfig {
    /// Load configuration from an optional file plus environment overrides
    /// (`SNER__SERVER__BIND_ADDRESS=...`).
    pub fn load(path: Option<&str>) -> SnerResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("sner").required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("SNER").separator("__"));

        builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|err| SnerError::Configuration(err.to_string()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            var_dir: default_var_dir(),
            heatmap_hot_level: 0,
            heatmap_gc_probability: default_gc_probability(),
            timeout_assign_ms: default_timeout_assign_ms(),
            timeout_output_ms: default_timeout_output_ms(),
            stale_horizon_days: default_stale_horizon_days(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            loopsleep_seconds: default_loopsleep(),
            pipelines: Vec::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: default_agent_server(),
            apikey: String::new(),
            queue: None,
            caps: Vec::new(),
            backoff_seconds: default_backoff(),
            net_timeout_seconds: default_net_timeout(),
            oneshot: false,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:18000".to_string()
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/sner")
}

fn default_gc_probability() -> f64 {
    0.1
}

fn default_timeout_assign_ms() -> u64 {
    3_000
}

fn default_timeout_output_ms() -> u64 {
    30_000
}

fn default_stale_horizon_days() -> i64 {
    5
}

fn default_database_url() -> String {
    "postgres://localhost/sner".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_loopsleep() -> u64 {
    60
}

fn default_agent_server() -> String {
    "http://localhost:18000".to_string()
}

fn default_backoff() -> u64 {
    5
}

fn default_net_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_address, "127.0.0.1:18000");
        assert_eq!(config.server.heatmap_hot_level, 0);
        assert_eq!(config.planner.loopsleep_seconds, 60);
        assert!(config.auth.clients.is_empty());
    }

    #[test]
    fn pipeline_config_deserializes_tagged() {
        let raw = serde_json::json!({
            "type": "queue",
            "queue": "sner.nmap",
            "steps": [
                {"step": "load_job", "queue": "sner.nmap"},
                {"step": "import_job"},
                {"step": "archive_job"}
            ]
        });
        let pipeline: PipelineConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(pipeline.name(), "sner.nmap");
        assert_eq!(pipeline.steps().len(), 3);
        assert_eq!(pipeline.steps()[0].step, "load_job");
        let queue: String = pipeline.steps()[0].arg("queue").unwrap();
        assert_eq!(queue, "sner.nmap");
    }

    #[test]
    fn step_config_args() {
        let step = StepConfig::new("filter_tarpits");
        assert_eq!(step.arg_or("threshold", 200i64).unwrap(), 200);
        assert!(step.arg::<String>("queue").is_err());

        let step = StepConfig::new("enqueue").with_arg("queue", serde_json::json!("q1"));
        assert_eq!(step.arg::<String>("queue").unwrap(), "q1");
    }
}
