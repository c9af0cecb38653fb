use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SnerError, SnerResult};

/// Task configuration for a queue of targets.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Queue {
    pub id: i32,
    pub name: String,
    /// YAML module config, `{module: str, args?: str, ...}`; opaque to the
    /// scheduler, parsed only when building an assignment.
    pub config: String,
    pub group_size: i32,
    pub priority: i32,
    pub active: bool,
    /// Capability tags an agent must offer to pull from this queue.
    pub reqs: Vec<String>,
}

impl Queue {
    /// Queue job-output directory under the server data dir.
    pub fn data_abspath(&self, var_dir: &Path) -> PathBuf {
        var_dir.join("scheduler").join(format!("queue-{}", self.id))
    }
}

/// Single target in a queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Target {
    pub id: i64,
    pub queue_id: i32,
    pub target: String,
    /// Rate-limit bucket key.
    pub hashval: String,
    /// Random draw tiebreaker.
    pub rand: f64,
}

/// (queue, bucket) pair eligible for assignment: the queue holds at least
/// one target in the bucket and the bucket is not hot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Readynet {
    pub queue_id: i32,
    pub hashval: String,
}

/// Assigned job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue_id: i32,
    /// Serialized JSON of the assignment handed to the agent.
    pub assignment: String,
    /// Null while the job is running.
    pub retval: Option<i32>,
    pub time_start: DateTime<Utc>,
    pub time_end: Option<DateTime<Utc>>,
}

impl Job {
    pub fn output_abspath(&self, queue: &Queue, var_dir: &Path) -> PathBuf {
        queue.data_abspath(var_dir).join(self.id.to_string())
    }

    pub fn is_running(&self) -> bool {
        self.retval.is_none()
    }

    /// Targets recorded in the serialized assignment.
    pub fn assignment_targets(&self) -> SnerResult<Vec<String>> {
        let assignment: Assignment = serde_json::from_str(&self.assignment)?;
        Ok(assignment.targets)
    }
}

/// The JSON object returned to an agent; one batch of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub config: serde_json::Value,
    pub targets: Vec<String>,
}

/// Job counts by state for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStateCounts {
    pub running: i64,
    pub stale: i64,
    pub finished: i64,
    pub failed: i64,
}

/// Exclusion rule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclFamily {
    Network,
    Regex,
}

impl ExclFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclFamily::Network => "network",
            ExclFamily::Regex => "regex",
        }
    }
}

impl std::str::FromStr for ExclFamily {
    type Err = SnerError;

    fn from_str(value: &str) -> SnerResult<Self> {
        match value {
            "network" => Ok(ExclFamily::Network),
            "regex" => Ok(ExclFamily::Regex),
            other => Err(SnerError::Parse(format!("invalid excl family: {other}"))),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for ExclFamily {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ExclFamily {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(|err: SnerError| err.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ExclFamily {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// Single target exclusion rule.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Excl {
    pub id: i32,
    pub family: ExclFamily,
    pub value: String,
    pub comment: Option<String>,
}
