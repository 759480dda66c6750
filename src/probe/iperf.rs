//! iperf3 throughput prober.
//!
//! Shells out to the system `iperf3` client in JSON mode and reads the
//! end-of-run summaries.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;

use super::{ProbeError, SpeedResult};

const TEST_SECONDS: u32 = 5;
/// Test duration plus connection setup margin.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(20);

pub struct IperfProber {
    target: String,
    port: u16,
}

impl IperfProber {
    pub fn new(target: &str, port: u16) -> Self {
        Self {
            target: target.to_string(),
            port: if port == 0 { 5201 } else { port },
        }
    }

    pub async fn run(&self) -> Result<SpeedResult, ProbeError> {
        let output = Command::new("iperf3")
            .args([
                "-c",
                &self.target,
                "-p",
                &self.port.to_string(),
                "-J",
                "-t",
                &TEST_SECONDS.to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(SUBPROCESS_TIMEOUT, output)
            .await
            .map_err(|_| ProbeError::Timeout(SUBPROCESS_TIMEOUT))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProbeError::Unavailable("iperf3 binary not found".to_string())
                } else {
                    ProbeError::Command(format!("failed to execute iperf3: {}", e))
                }
            })?;

        if !output.status.success() {
            // iperf3 -J reports failures as {"error": "..."} on stdout
            if let Ok(doc) = serde_json::from_slice::<IperfErrorDoc>(&output.stdout) {
                if let Some(msg) = doc.error {
                    return Err(ProbeError::Command(format!("iperf3: {}", msg)));
                }
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Command(format!(
                "iperf3 failed: {}",
                stderr.trim()
            )));
        }

        parse_iperf_json(&output.stdout)
    }
}

#[derive(Deserialize)]
struct IperfErrorDoc {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct IperfDoc {
    end: IperfEnd,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IperfEnd {
    sum_received: IperfSum,
    sum_sent: IperfSum,
}

#[derive(Deserialize, Default)]
struct IperfSum {
    #[serde(default)]
    bits_per_second: f64,
}

fn parse_iperf_json(raw: &[u8]) -> Result<SpeedResult, ProbeError> {
    let doc: IperfDoc = serde_json::from_slice(raw)
        .map_err(|e| ProbeError::Command(format!("failed to parse iperf3 output: {}", e)))?;

    Ok(SpeedResult {
        download_mbps: doc.end.sum_received.bits_per_second / 1_000_000.0,
        upload_mbps: doc.end.sum_sent.bits_per_second / 1_000_000.0,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iperf_json() {
        let raw = br#"{
            "end": {
                "sum_sent": {"bytes": 62500000, "bits_per_second": 100000000.0},
                "sum_received": {"bytes": 59375000, "bits_per_second": 95000000.0}
            }
        }"#;
        let res = parse_iperf_json(raw).unwrap();
        assert!((res.download_mbps - 95.0).abs() < 1e-9);
        assert!((res.upload_mbps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_iperf_json_missing_sums() {
        let res = parse_iperf_json(br#"{"end":{}}"#).unwrap();
        assert_eq!(res.download_mbps, 0.0);
        assert_eq!(res.upload_mbps, 0.0);
    }

    #[test]
    fn test_parse_iperf_json_garbage() {
        assert!(parse_iperf_json(b"oops").is_err());
    }

    #[test]
    fn test_default_port() {
        let prober = IperfProber::new("example.com", 0);
        assert_eq!(prober.port, 5201);
    }
}
