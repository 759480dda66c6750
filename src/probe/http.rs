//! HTTP download throughput prober.

use std::time::{Duration, Instant};

use chrono::Utc;

use super::{mbps, ProbeError, SpeedResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpSpeedTester {
    url: String,
}

impl HttpSpeedTester {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    /// GET the URL, stream and discard the body, report download Mbps.
    /// Upload is always 0 for this prober.
    pub async fn run(&self) -> Result<SpeedResult, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        let start = Instant::now();
        let mut response = client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(HTTP_TIMEOUT)
            } else {
                ProbeError::Network(format!("http get failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(ProbeError::Network(format!(
                "http returned status: {}",
                response.status()
            )));
        }

        let mut received: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => received += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    if e.is_timeout() {
                        return Err(ProbeError::Timeout(HTTP_TIMEOUT));
                    }
                    return Err(ProbeError::Network(format!("failed to read body: {}", e)));
                }
            }
        }
        let elapsed = start.elapsed();

        Ok(SpeedResult {
            download_mbps: mbps(received, elapsed),
            upload_mbps: 0.0,
            timestamp: Utc::now(),
        })
    }
}
