//! Probe module: ICMP ping, hop-by-hop trace, and SSH/HTTP/iperf3 throughput.

mod http;
mod iperf;
mod ping;
mod ssh;
mod trace;

pub use http::*;
pub use iperf::*;
pub use ping::*;
pub use ssh::*;
pub use trace::*;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    /// Raw socket creation denied; the probe needs CAP_NET_RAW or root.
    #[error("operation not supported: {0}")]
    Unsupported(String),
    /// External tool (mtr, iperf3) missing or a remote dependency unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Result of a throughput measurement, in Mbps.
#[derive(Debug, Clone, Default)]
pub struct SpeedResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of an ICMP ping run.
#[derive(Debug, Clone)]
pub struct PingResult {
    pub packets_sent: u32,
    pub packets_recv: u32,
    /// Percentage, 0.0 - 100.0
    pub loss_rate: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
}

/// One hop of a classical traceroute.
#[derive(Debug, Clone)]
pub struct TraceHopStat {
    pub hop: u32,
    /// Router address, or `*` when no reply arrived.
    pub ip: String,
    pub latency: Duration,
    pub loss: f64,
}

/// Result of a classical TTL-expanding traceroute.
#[derive(Debug, Clone)]
pub struct TraceResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub hops: Vec<TraceHopStat>,
}

/// One hop of an MTR run, with per-hop statistics over all cycles.
#[derive(Debug, Clone, Default)]
pub struct MtrHop {
    pub hop: u32,
    pub host: String,
    pub last: f64,
    pub avg: f64,
    pub best: f64,
    pub worst: f64,
    pub loss: f64,
    pub asn: String,
}

/// Result of an MTR run.
#[derive(Debug, Clone)]
pub struct MtrResult {
    pub target: String,
    pub hops: Vec<MtrHop>,
}

/// Mbps from a byte count over a wall-clock duration.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(0.001);
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

/// Parsed probe configuration, discriminated by the target's `probe_type`.
///
/// `probe_config` is an opaque JSON string at rest; the scheduler parses it
/// eagerly at dispatch so a malformed config fails before any network work.
#[derive(Debug, Clone)]
pub enum ProbeSettings {
    Icmp,
    Http { url: String },
    Ssh(SshSettings),
    Iperf { port: u16 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    /// Filled by the scheduler from the target address.
    #[serde(skip)]
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    /// PEM key material, normalized to LF line endings at write time.
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub test_bytes: u64,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Deserialize)]
struct HttpProbeConfig {
    url: String,
}

#[derive(Debug, Deserialize)]
struct IperfProbeConfig {
    #[serde(default)]
    port: u16,
}

impl ProbeSettings {
    pub fn parse(probe_type: &str, raw: &str) -> Result<Self, ProbeError> {
        use crate::db::{PROBE_MODE_HTTP, PROBE_MODE_ICMP, PROBE_MODE_IPERF, PROBE_MODE_SSH};

        match probe_type {
            // ICMP ignores probe_config entirely
            "" | PROBE_MODE_ICMP => Ok(Self::Icmp),
            PROBE_MODE_HTTP => {
                if raw.is_empty() {
                    return Err(ProbeError::Config("http url is required".to_string()));
                }
                let cfg: HttpProbeConfig = serde_json::from_str(raw)
                    .map_err(|e| ProbeError::Config(format!("http config: {}", e)))?;
                if cfg.url.is_empty() {
                    return Err(ProbeError::Config("http url is required".to_string()));
                }
                Ok(Self::Http { url: cfg.url })
            }
            PROBE_MODE_SSH => {
                if raw.is_empty() {
                    return Err(ProbeError::Config("ssh config is required".to_string()));
                }
                let cfg: SshSettings = serde_json::from_str(raw)
                    .map_err(|e| ProbeError::Config(format!("ssh config: {}", e)))?;
                if cfg.user.is_empty() {
                    return Err(ProbeError::Config("ssh user is required".to_string()));
                }
                Ok(Self::Ssh(cfg))
            }
            PROBE_MODE_IPERF => {
                let port = if raw.is_empty() {
                    0
                } else {
                    let cfg: IperfProbeConfig = serde_json::from_str(raw)
                        .map_err(|e| ProbeError::Config(format!("iperf config: {}", e)))?;
                    cfg.port
                };
                Ok(Self::Iperf {
                    port: if port == 0 { 5201 } else { port },
                })
            }
            other => Err(ProbeError::Config(format!(
                "unknown probe type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbps_formula() {
        // 5 MiB in exactly one second
        let v = mbps(5 * 1024 * 1024, Duration::from_secs(1));
        assert!((v - 41.943).abs() < 0.01, "got {}", v);
    }

    #[test]
    fn test_parse_icmp_ignores_config() {
        assert!(matches!(
            ProbeSettings::parse("MODE_ICMP", "garbage").unwrap(),
            ProbeSettings::Icmp
        ));
        assert!(matches!(
            ProbeSettings::parse("", "").unwrap(),
            ProbeSettings::Icmp
        ));
    }

    #[test]
    fn test_parse_http_requires_url() {
        assert!(ProbeSettings::parse("MODE_HTTP", "").is_err());
        assert!(ProbeSettings::parse("MODE_HTTP", r#"{"url":""}"#).is_err());
        match ProbeSettings::parse("MODE_HTTP", r#"{"url":"http://example.com/file"}"#).unwrap() {
            ProbeSettings::Http { url } => assert_eq!(url, "http://example.com/file"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ssh_defaults() {
        let raw = r#"{"user":"probe","password":"secret"}"#;
        match ProbeSettings::parse("MODE_SSH", raw).unwrap() {
            ProbeSettings::Ssh(cfg) => {
                assert_eq!(cfg.port, 22);
                assert_eq!(cfg.test_bytes, 0);
                assert_eq!(cfg.user, "probe");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_iperf_default_port() {
        match ProbeSettings::parse("MODE_IPERF", "").unwrap() {
            ProbeSettings::Iperf { port } => assert_eq!(port, 5201),
            other => panic!("unexpected: {:?}", other),
        }
        match ProbeSettings::parse("MODE_IPERF", r#"{"port":5555}"#).unwrap() {
            ProbeSettings::Iperf { port } => assert_eq!(port, 5555),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(matches!(
            ProbeSettings::parse("MODE_BOGUS", ""),
            Err(ProbeError::Config(_))
        ));
    }
}
