use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SnerError, SnerResult};

/// Basic host (ip-centric) model.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub id: i64,
    pub address: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub rescan_time: DateTime<Utc>,
}

/// Discovered host service.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub host_id: i64,
    pub proto: String,
    pub port: i32,
    pub state: Option<String>,
    pub name: Option<String>,
    pub info: Option<String>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub rescan_time: DateTime<Utc>,
    pub import_time: Option<DateTime<Utc>>,
}

/// Vulnerability severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = SnerError;

    fn from_str(value: &str) -> SnerResult<Self> {
        match value {
            "unknown" => Ok(Severity::Unknown),
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(SnerError::Parse(format!("invalid severity: {other}"))),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for Severity {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Severity {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(|err: SnerError| err.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Severity {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// Vulnerability; vuln identity takes `via_target` into account so
/// name-based virtualhost scans do not overwrite each other.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vuln {
    pub id: i64,
    pub host_id: i64,
    pub service_id: Option<i64>,
    pub via_target: Option<String>,
    pub name: String,
    pub xtype: Option<String>,
    pub severity: Severity,
    pub descr: Option<String>,
    pub data: Option<String>,
    pub refs: Vec<String>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub rescan_time: DateTime<Utc>,
    pub import_time: Option<DateTime<Utc>>,
}

/// Host assigned note, generic data container.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: i64,
    pub host_id: i64,
    pub service_id: Option<i64>,
    pub via_target: Option<String>,
    pub xtype: Option<String>,
    pub data: Option<String>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub import_time: Option<DateTime<Utc>>,
}

/// Product/version projection row, rebuilt from services and notes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VersionInfo {
    pub id: i64,
    pub host_id: i64,
    pub host_address: String,
    pub host_hostname: Option<String>,
    pub service_proto: Option<String>,
    pub service_port: Option<i32>,
    pub via_target: Option<String>,
    pub product: String,
    pub version: String,
    pub extra: serde_json::Value,
}

/// Service list row for the public storage API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceListItem {
    pub address: String,
    pub hostname: Option<String>,
    pub proto: String,
    pub port: i32,
    pub state: Option<String>,
    pub name: Option<String>,
    pub info: Option<String>,
}

/// Note list row for the public storage API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NoteListItem {
    pub address: String,
    pub hostname: Option<String>,
    pub proto: Option<String>,
    pub port: Option<i32>,
    pub via_target: Option<String>,
    pub xtype: Option<String>,
    pub data: Option<String>,
}

/// Storage entity totals for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageCounts {
    pub hosts: i64,
    pub services: i64,
    pub vulns: i64,
    pub notes: i64,
}

/// Extract `(product, version)` from a service banner such as
/// `OpenSSH 8.0p1` or `nginx 1.16.1`; the product is lowercased. The first
/// token starting with a digit is the version, everything before it the
/// product.
pub fn extract_version(banner: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = banner.split_whitespace().collect();
    let version_pos = tokens
        .iter()
        .position(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    if version_pos == 0 {
        return None;
    }
    Some((
        tokens[..version_pos].join(" ").to_lowercase(),
        tokens[version_pos].to_string(),
    ))
}
