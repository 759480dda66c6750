//! Monitor scheduler: ticker-driven probe fan-out with hot target reload.
//!
//! One event loop selects over four tickers and a stop signal. Every tick
//! snapshots the enabled target list under a read lock, clones it, and
//! spawns one task per target so a slow or broken target never stalls the
//! cycle. Probe failures are memoized on the target row instead of being
//! written as samples.

mod trace_json;

pub use trace_json::*;

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{MonitorRecord, Store, Target, PROBE_MODE_ICMP, PROBE_MODE_SSH};
use crate::geoip::Provider;
use crate::probe::{
    HttpSpeedTester, IcmpPinger, IperfProber, MtrResult, MtrRunner, ProbeSettings,
    SshSpeedTester, TracerouteRunner,
};

const PING_TRACE_INTERVAL: Duration = Duration::from_secs(30);
const SPEED_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const PING_PACKETS: u32 = 5;

/// Transfer size used when a target was configured through the API without
/// an explicit `test_bytes` (20 MiB).
const API_DEFAULT_TEST_BYTES: u64 = 20 * 1024 * 1024;

pub struct Monitor {
    store: Arc<Store>,
    geo: Option<Arc<Provider>>,
    targets: RwLock<Vec<Target>>,
    stop_tx: broadcast::Sender<()>,
}

impl Monitor {
    pub fn new(store: Arc<Store>, geo: Option<Arc<Provider>>) -> Arc<Self> {
        let (stop_tx, _) = broadcast::channel(1);
        let monitor = Arc::new(Self {
            store,
            geo,
            targets: RwLock::new(Vec::new()),
            stop_tx,
        });
        monitor.refresh_targets();
        monitor
    }

    /// Spawn the event loop plus an initial probe cycle shortly after start.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tracing::info!("running initial probe cycle");
            monitor.run_ping_trace_cycle();
            monitor.run_speed_cycle();
        });

        let monitor = self.clone();
        tokio::spawn(async move { monitor.run_loop().await });
    }

    /// Signal the event loop to stop. In-flight probe tasks run to
    /// completion, bounded by their own timeouts, and may still persist.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::info!("monitor service started");
        let mut stop_rx = self.stop_tx.subscribe();

        let start_at = |period: Duration| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            t
        };
        let mut ping_tick = start_at(PING_TRACE_INTERVAL);
        let mut speed_tick = start_at(SPEED_INTERVAL);
        let mut refresh_tick = start_at(REFRESH_INTERVAL);
        let mut heartbeat_tick = start_at(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::info!("monitor service stopped");
                    return;
                }
                _ = ping_tick.tick() => self.run_ping_trace_cycle(),
                _ = speed_tick.tick() => self.run_speed_cycle(),
                _ = refresh_tick.tick() => self.refresh_targets(),
                _ = heartbeat_tick.tick() => {
                    let count = self.targets.read().len();
                    tracing::info!("heartbeat: monitoring {} targets", count);
                }
            }
        }
    }

    /// Reload the enabled target list, swapping the snapshot under the
    /// write lock.
    fn refresh_targets(&self) {
        match self.store.get_targets(true) {
            Ok(targets) => *self.targets.write() = targets,
            Err(e) => tracing::error!("failed to refresh targets: {}", e),
        }
    }

    /// Clone the snapshot under a brief read lock; probe work never holds it.
    fn snapshot(&self) -> Vec<Target> {
        self.targets.read().clone()
    }

    fn run_ping_trace_cycle(self: &Arc<Self>) {
        let targets = self.snapshot();
        let mut dispatched = 0;
        for target in targets {
            if !target.enabled {
                continue;
            }
            dispatched += 1;
            let monitor = self.clone();
            tokio::spawn(async move { monitor.ping_trace_target(target).await });
        }
        tracing::info!("starting ping/trace cycle for {} targets", dispatched);
    }

    fn run_speed_cycle(self: &Arc<Self>) {
        let targets: Vec<Target> = self
            .snapshot()
            .into_iter()
            .filter(|t| t.enabled && is_speed_type(&t.probe_type))
            .collect();

        if targets.is_empty() {
            tracing::debug!("no throughput targets configured");
            return;
        }

        tracing::info!("starting throughput cycle for {} targets", targets.len());
        for target in targets {
            let monitor = self.clone();
            tokio::spawn(async move { monitor.speed_target(target).await });
        }
    }

    /// Run probes on demand. An empty address means every target; a specific
    /// address runs exactly that target. Triggered runs are never deduped
    /// against scheduled ones: a human-triggered probe must not be dropped.
    pub fn trigger_probe(self: &Arc<Self>, address: &str) {
        for target in self.snapshot() {
            if !address.is_empty() && target.address != address {
                continue;
            }
            let specific = !address.is_empty();

            let monitor = self.clone();
            let t = target.clone();
            tokio::spawn(async move { monitor.ping_trace_target(t).await });

            if is_speed_type(&target.probe_type) {
                let monitor = self.clone();
                tokio::spawn(async move { monitor.speed_target(target).await });
            }

            if specific {
                return;
            }
        }
    }

    /// One reachability probe: ping for the fallback headline, then MTR
    /// (preferred) or traceroute, enrichment, and a single record insert.
    async fn ping_trace_target(self: Arc<Self>, target: Target) {
        tracing::debug!("starting probe for {} ({})", target.name, target.address);

        let ping = match IcmpPinger::new(&target.address, PING_PACKETS).run().await {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("ping failed for {} ({}): {}", target.name, target.address, e);
                return;
            }
        };
        tracing::debug!(
            "ping for {}: latency={:.1}ms loss={:.1}%",
            target.name,
            ping.avg_rtt.as_secs_f64() * 1000.0,
            ping.loss_rate
        );

        let mut latency_ms = ping.avg_rtt.as_secs_f64() * 1000.0;
        let mut packet_loss = ping.loss_rate;
        let trace_bytes;

        match MtrRunner::new(&target.address).run().await {
            Ok(mtr) if !mtr.hops.is_empty() => {
                let (headline, truncated) = select_headline_latency(&mtr, latency_ms);
                packet_loss = select_headline_loss(&mtr, packet_loss);
                trace_bytes = trace_json::from_mtr(&mtr, truncated, self.geo.as_deref()).await;
                latency_ms = headline;
                tracing::info!(
                    "trace complete for {}: {} hops, latency={:.1}ms",
                    target.name,
                    mtr.hops.len(),
                    latency_ms
                );
            }
            other => {
                if let Err(e) = other {
                    tracing::warn!("mtr unavailable for {}, using traceroute: {}", target.name, e);
                }
                trace_bytes = match TracerouteRunner::new(&target.address).run().await {
                    Ok(res) => trace_json::from_traceroute(&res, self.geo.as_deref()).await,
                    Err(e) => {
                        tracing::warn!("traceroute failed for {}: {}", target.name, e);
                        Vec::new()
                    }
                };
            }
        }

        let mut record = MonitorRecord {
            target: target.address.clone(),
            latency_ms,
            packet_loss,
            trace_json: (!trace_bytes.is_empty()).then_some(trace_bytes),
            ..Default::default()
        };
        if let Err(e) = self.store.save_record(&mut record) {
            tracing::error!("failed to save record for {}: {}", target.name, e);
        }
    }

    /// One throughput probe. Config is parsed eagerly so a malformed config
    /// fails before any network work; failures update the target's error
    /// memo and are never persisted as samples.
    async fn speed_target(self: Arc<Self>, target: Target) {
        tracing::info!(
            "[{}] starting throughput test for {} ({})",
            target.probe_type,
            target.name,
            target.address
        );

        let settings = match ProbeSettings::parse(&target.probe_type, &target.probe_config) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("invalid probe config for {}: {}", target.name, e);
                if let Err(db_err) = self
                    .store
                    .update_target_error(&target.address, &format!("Config error: {}", e))
                {
                    tracing::error!("failed to record config error: {}", db_err);
                }
                return;
            }
        };

        let result = match settings {
            ProbeSettings::Icmp => return,
            ProbeSettings::Http { url } => HttpSpeedTester::new(&url).run().await,
            ProbeSettings::Ssh(mut cfg) => {
                cfg.host = target.address.clone();
                if cfg.test_bytes == 0 {
                    cfg.test_bytes = API_DEFAULT_TEST_BYTES;
                }
                SshSpeedTester::new(cfg).run().await
            }
            ProbeSettings::Iperf { port } => IperfProber::new(&target.address, port).run().await,
        };

        match result {
            Err(e) => {
                let memo = classify_probe_error(&target.probe_type, &e.to_string());
                tracing::error!(
                    "throughput test failed for {} ({}): {}",
                    target.name,
                    target.probe_type,
                    e
                );
                if let Err(db_err) = self.store.update_target_error(&target.address, &memo) {
                    tracing::error!("failed to record probe error: {}", db_err);
                }
            }
            Ok(speed) => {
                if let Err(db_err) = self.store.clear_target_error(&target.address) {
                    tracing::error!("failed to clear probe error: {}", db_err);
                }
                tracing::info!(
                    "throughput test for {}: down={:.1} Mbps, up={:.1} Mbps",
                    target.name,
                    speed.download_mbps,
                    speed.upload_mbps
                );

                let mut record = MonitorRecord {
                    target: target.address.clone(),
                    speed_down: speed.download_mbps,
                    speed_up: speed.upload_mbps,
                    ..Default::default()
                };
                if let Err(e) = self.store.save_record(&mut record) {
                    tracing::error!("failed to save speed record for {}: {}", target.name, e);
                }
            }
        }
    }
}

/// Non-ICMP targets join the throughput cycle.
pub fn is_speed_type(probe_type: &str) -> bool {
    !probe_type.is_empty() && probe_type != PROBE_MODE_ICMP
}

/// Pick the headline latency from an MTR result.
///
/// Hops are scanned from last to first; the first hop with loss below 100%
/// and a usable sample (avg, else last) supplies the value. Falling back to
/// an earlier hop, or to the raw ping average, marks the trace as truncated.
pub fn select_headline_latency(res: &MtrResult, fallback: f64) -> (f64, bool) {
    let last_index = match res.hops.len().checked_sub(1) {
        Some(i) => i,
        None => return (fallback, false),
    };

    for (i, hop) in res.hops.iter().enumerate().rev() {
        if hop.loss >= 100.0 {
            continue;
        }
        let value = if hop.avg > 0.0 {
            hop.avg
        } else if hop.last > 0.0 {
            hop.last
        } else {
            continue;
        };
        return (value, i != last_index);
    }

    (fallback, true)
}

/// Headline loss is the final hop's loss; without hops the ping loss stands.
pub fn select_headline_loss(res: &MtrResult, fallback: f64) -> f64 {
    match res.hops.last() {
        Some(hop) => hop.loss,
        None => fallback,
    }
}

/// Rewrite a probe failure into the operator-facing error memo. SSH errors
/// get categorized so the UI can hint at the likely cause.
fn classify_probe_error(probe_type: &str, message: &str) -> String {
    if probe_type != PROBE_MODE_SSH {
        return message.to_string();
    }

    let lower = message.to_lowercase();
    if lower.contains("authentication")
        || lower.contains("handshake")
        || lower.contains("no supported methods")
        || lower.contains("key")
    {
        "SSH: Authentication failed - check credentials/key".to_string()
    } else if lower.contains("connection refused") {
        "SSH: Connection refused - check host/port".to_string()
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "SSH: Connection timeout - host unreachable".to_string()
    } else if lower.contains("no route") {
        "SSH: No route to host - network unreachable".to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MtrHop;

    fn hops(specs: &[(f64, f64, f64)]) -> MtrResult {
        MtrResult {
            target: "t".to_string(),
            hops: specs
                .iter()
                .enumerate()
                .map(|(i, (loss, avg, last))| MtrHop {
                    hop: (i + 1) as u32,
                    host: format!("10.0.0.{}", i + 1),
                    loss: *loss,
                    avg: *avg,
                    last: *last,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn test_headline_last_hop_dead_falls_back() {
        let res = hops(&[(0.0, 10.0, 9.0), (100.0, 0.0, 0.0)]);
        let (latency, truncated) = select_headline_latency(&res, 99.0);
        assert_eq!(latency, 10.0);
        assert!(truncated);
    }

    #[test]
    fn test_headline_last_hop_alive() {
        let res = hops(&[(0.0, 10.0, 9.0), (0.0, 20.0, 18.0)]);
        let (latency, truncated) = select_headline_latency(&res, 99.0);
        assert_eq!(latency, 20.0);
        assert!(!truncated);
    }

    #[test]
    fn test_headline_all_dead_uses_ping_average() {
        let res = hops(&[(100.0, 0.0, 0.0), (100.0, 0.0, 0.0)]);
        let (latency, truncated) = select_headline_latency(&res, 42.0);
        assert_eq!(latency, 42.0);
        assert!(truncated);
    }

    #[test]
    fn test_headline_prefers_avg_then_last() {
        let res = hops(&[(0.0, 0.0, 7.5)]);
        let (latency, truncated) = select_headline_latency(&res, 99.0);
        assert_eq!(latency, 7.5);
        assert!(!truncated);
    }

    #[test]
    fn test_headline_loss_comes_from_last_hop() {
        let res = hops(&[(0.0, 10.0, 9.0), (25.0, 20.0, 18.0)]);
        assert_eq!(select_headline_loss(&res, 1.0), 25.0);

        let empty = MtrResult {
            target: "t".to_string(),
            hops: vec![],
        };
        assert_eq!(select_headline_loss(&empty, 1.0), 1.0);
    }

    #[test]
    fn test_is_speed_type() {
        assert!(!is_speed_type("MODE_ICMP"));
        assert!(!is_speed_type(""));
        assert!(is_speed_type("MODE_SSH"));
        assert!(is_speed_type("MODE_HTTP"));
        assert!(is_speed_type("MODE_IPERF"));
    }

    #[test]
    fn test_classify_ssh_errors() {
        assert_eq!(
            classify_probe_error("MODE_SSH", "ssh authentication failed: no supported methods"),
            "SSH: Authentication failed - check credentials/key"
        );
        assert_eq!(
            classify_probe_error("MODE_SSH", "ssh connect 1.2.3.4:22: Connection refused"),
            "SSH: Connection refused - check host/port"
        );
        assert_eq!(
            classify_probe_error("MODE_SSH", "probe timed out after 10s"),
            "SSH: Connection timeout - host unreachable"
        );
        assert_eq!(
            classify_probe_error("MODE_SSH", "ssh connect: No route to host"),
            "SSH: No route to host - network unreachable"
        );
        // non-SSH probes keep the raw message
        assert_eq!(
            classify_probe_error("MODE_HTTP", "http returned status: 503"),
            "http returned status: 503"
        );
    }
}
