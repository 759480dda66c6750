//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Probe mode wire values. `MODE_ICMP` targets only get ping/trace cycles;
/// the other modes additionally join the throughput cycle.
pub const PROBE_MODE_ICMP: &str = "MODE_ICMP";
pub const PROBE_MODE_HTTP: &str = "MODE_HTTP";
pub const PROBE_MODE_SSH: &str = "MODE_SSH";
pub const PROBE_MODE_IPERF: &str = "MODE_IPERF";

/// A monitoring destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// One of the `MODE_*` constants; empty means ICMP.
    #[serde(default)]
    pub probe_type: String,
    /// Opaque JSON whose schema is discriminated by `probe_type`.
    #[serde(default)]
    pub probe_config: String,
    /// Last probe failure, memoized by the scheduler. Cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: String::new(),
            address: String::new(),
            description: String::new(),
            enabled: true,
            probe_type: PROBE_MODE_ICMP.to_string(),
            probe_config: String::new(),
            last_error: None,
            last_error_at: None,
        }
    }
}

/// One persisted time-series sample.
///
/// Two flavors share the row: reachability samples carry latency, loss and the
/// trace blob with the speed fields zeroed; throughput samples carry only the
/// speed fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    /// Denormalized address string; records logically survive target deletion.
    pub target: String,
    pub latency_ms: f64,
    pub packet_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_json: Option<Vec<u8>>,
    pub speed_up: f64,
    pub speed_down: f64,
}

/// A system administrator. Single-user system: at most one row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub username: String,
    /// bcrypt hash, never serialized.
    #[serde(skip_serializing, default)]
    pub password: String,
}

/// Database statistics for the management endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub size_bytes: i64,
    pub size_human: String,
    pub record_count: i64,
    pub target_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<String>,
    pub retention_days: i64,
}
