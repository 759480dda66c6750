//! Trace runners: MTR (preferred) and classical ICMP traceroute (fallback).
//!
//! The MTR runner shells out to the system `mtr` in JSON report mode for
//! per-hop statistics over multiple sweeps. When `mtr` is missing or returns
//! nothing, the scheduler falls back to the in-crate TTL-expanding
//! traceroute.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ping::{build_echo_request, resolve_address};
use super::{MtrHop, MtrResult, ProbeError, TraceHopStat, TraceResult};

const MTR_CYCLES: u32 = 10;
const MTR_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_HOPS: u32 = 30;
const HOP_TIMEOUT: Duration = Duration::from_secs(2);

// --- MTR ---

pub struct MtrRunner {
    target: String,
}

impl MtrRunner {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }

    pub async fn run(&self) -> Result<MtrResult, ProbeError> {
        let output = Command::new("mtr")
            .args([
                "--json",
                "-n",
                "-z",
                "-c",
                &MTR_CYCLES.to_string(),
                &self.target,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(MTR_TIMEOUT, output)
            .await
            .map_err(|_| ProbeError::Timeout(MTR_TIMEOUT))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProbeError::Unavailable("mtr binary not found".to_string())
                } else {
                    ProbeError::Command(format!("failed to execute mtr: {}", e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Command(format!("mtr failed: {}", stderr.trim())));
        }

        parse_mtr_json(&self.target, &output.stdout)
    }
}

#[derive(Deserialize)]
struct MtrDoc {
    report: MtrReport,
}

#[derive(Deserialize)]
struct MtrReport {
    #[serde(default)]
    hubs: Vec<MtrHub>,
}

#[derive(Deserialize)]
struct MtrHub {
    count: u32,
    host: String,
    #[serde(rename = "ASN", default)]
    asn: Option<String>,
    #[serde(rename = "Loss%", default)]
    loss: f64,
    #[serde(rename = "Last", default)]
    last: f64,
    #[serde(rename = "Avg", default)]
    avg: f64,
    #[serde(rename = "Best", default)]
    best: f64,
    #[serde(rename = "Wrst", default)]
    worst: f64,
}

fn parse_mtr_json(target: &str, raw: &[u8]) -> Result<MtrResult, ProbeError> {
    let doc: MtrDoc = serde_json::from_slice(raw)
        .map_err(|e| ProbeError::Command(format!("failed to parse mtr output: {}", e)))?;

    let hops = doc
        .report
        .hubs
        .into_iter()
        .map(|h| MtrHop {
            hop: h.count,
            host: if h.host == "???" { "*".to_string() } else { h.host },
            last: h.last,
            avg: h.avg,
            best: h.best,
            worst: h.worst,
            loss: h.loss,
            asn: match h.asn.as_deref() {
                None | Some("AS???") => String::new(),
                Some(asn) => asn.to_string(),
            },
        })
        .collect();

    Ok(MtrResult {
        target: target.to_string(),
        hops,
    })
}

// --- Classical traceroute ---

pub struct TracerouteRunner {
    target: String,
    max_hops: u32,
}

impl TracerouteRunner {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            max_hops: MAX_HOPS,
        }
    }

    /// TTL-expanding traceroute over a raw ICMP socket. One echo per TTL;
    /// hops that never answer are recorded as `ip="*"` with 100% loss.
    pub async fn run(&self) -> Result<TraceResult, ProbeError> {
        let ip = resolve_address(&self.target).await?;
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => {
                return Err(ProbeError::Unsupported(
                    "traceroute fallback supports IPv4 only".to_string(),
                ))
            }
        };

        let target = self.target.clone();
        let max_hops = self.max_hops;

        tokio::task::spawn_blocking(move || blocking_traceroute(target, v4, max_hops))
            .await
            .map_err(|e| ProbeError::Network(format!("traceroute task failed: {}", e)))?
    }
}

fn blocking_traceroute(
    target: String,
    dst: Ipv4Addr,
    max_hops: u32,
) -> Result<TraceResult, ProbeError> {
    // TimeExceeded reception needs a RAW socket; unprivileged DGRAM ICMP
    // only ever delivers echo replies.
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| ProbeError::Unsupported(format!("traceroute requires CAP_NET_RAW: {}", e)))?;
    socket
        .set_read_timeout(Some(HOP_TIMEOUT))
        .map_err(|e| ProbeError::Network(format!("set timeout: {}", e)))?;

    let dest = SocketAddr::new(IpAddr::V4(dst), 0);
    let identifier = (std::process::id() & 0xffff) as u16;

    let mut result = TraceResult {
        target,
        timestamp: Utc::now(),
        hops: Vec::new(),
    };

    for ttl in 1..=max_hops {
        socket
            .set_ttl(ttl)
            .map_err(|e| ProbeError::Network(format!("set ttl: {}", e)))?;

        let packet = build_echo_request(IpAddr::V4(dst), identifier, ttl as u16);
        let start = Instant::now();
        if socket.send_to(&packet, &dest.into()).is_err() {
            result.hops.push(TraceHopStat {
                hop: ttl,
                ip: "*".to_string(),
                latency: Duration::ZERO,
                loss: 100.0,
            });
            continue;
        }

        match wait_for_trace_reply(&socket, identifier, ttl as u16, start) {
            Some((peer, latency, reached)) => {
                result.hops.push(TraceHopStat {
                    hop: ttl,
                    ip: peer.to_string(),
                    latency,
                    loss: 0.0,
                });
                if reached || peer == IpAddr::V4(dst) {
                    break;
                }
            }
            None => {
                result.hops.push(TraceHopStat {
                    hop: ttl,
                    ip: "*".to_string(),
                    latency: Duration::ZERO,
                    loss: 100.0,
                });
            }
        }
    }

    Ok(result)
}

/// Wait for the TimeExceeded or EchoReply matching our probe. Returns the
/// responding address, the elapsed time, and whether the target itself
/// answered.
fn wait_for_trace_reply(
    socket: &Socket,
    identifier: u16,
    sequence: u16,
    start: Instant,
) -> Option<(IpAddr, Duration, bool)> {
    loop {
        if start.elapsed() >= HOP_TIMEOUT {
            return None;
        }

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(_) => return None,
        };
        // SAFETY: recv_from initialized `len` bytes
        let data: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let elapsed = start.elapsed();

        let peer_ip = match peer.as_socket() {
            Some(sa) => sa.ip(),
            None => continue,
        };

        match parse_trace_reply(data, identifier, sequence) {
            Some(TraceReply::TimeExceeded) => return Some((peer_ip, elapsed, false)),
            Some(TraceReply::EchoReply) => return Some((peer_ip, elapsed, true)),
            None => continue,
        }
    }
}

#[derive(Debug, PartialEq)]
enum TraceReply {
    TimeExceeded,
    EchoReply,
}

/// Classify a raw IPv4 ICMP datagram against our (identifier, sequence).
///
/// TimeExceeded replies embed the offending datagram: outer IP header, ICMP
/// header, inner IP header, then the first 8 bytes of our echo request.
fn parse_trace_reply(data: &[u8], identifier: u16, sequence: u16) -> Option<TraceReply> {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((data[0] & 0x0f) as usize) * 4;
    let icmp = data.get(ihl..)?;
    if icmp.len() < 8 {
        return None;
    }

    match icmp[0] {
        // Echo Reply: id/seq directly in the header
        0 => {
            let id = u16::from_be_bytes([icmp[4], icmp[5]]);
            let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
            (id == identifier && seq == sequence).then_some(TraceReply::EchoReply)
        }
        // Time Exceeded: match id/seq of the embedded echo request
        11 => {
            let inner_ip = icmp.get(8..)?;
            if inner_ip.len() < 20 || inner_ip[0] >> 4 != 4 {
                return None;
            }
            let inner_ihl = ((inner_ip[0] & 0x0f) as usize) * 4;
            let inner_icmp = inner_ip.get(inner_ihl..)?;
            if inner_icmp.len() < 8 || inner_icmp[0] != 8 {
                return None;
            }
            let id = u16::from_be_bytes([inner_icmp[4], inner_icmp[5]]);
            let seq = u16::from_be_bytes([inner_icmp[6], inner_icmp[7]]);
            (id == identifier && seq == sequence).then_some(TraceReply::TimeExceeded)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mtr_json() {
        let raw = br#"{
            "report": {
                "mtr": {"src": "local", "dst": "8.8.8.8", "tests": 10},
                "hubs": [
                    {"count": 1, "host": "192.168.1.1", "Loss%": 0.0, "Snt": 10,
                     "Last": 0.52, "Avg": 0.61, "Best": 0.44, "Wrst": 1.02, "StDev": 0.2},
                    {"count": 2, "host": "???", "Loss%": 100.0, "Snt": 10,
                     "Last": 0.0, "Avg": 0.0, "Best": 0.0, "Wrst": 0.0, "StDev": 0.0},
                    {"count": 3, "host": "8.8.8.8", "ASN": "AS15169", "Loss%": 0.0, "Snt": 10,
                     "Last": 11.3, "Avg": 11.9, "Best": 10.8, "Wrst": 14.1, "StDev": 0.9}
                ]
            }
        }"#;

        let res = parse_mtr_json("8.8.8.8", raw).unwrap();
        assert_eq!(res.hops.len(), 3);
        assert_eq!(res.hops[0].host, "192.168.1.1");
        assert_eq!(res.hops[1].host, "*");
        assert_eq!(res.hops[1].loss, 100.0);
        assert_eq!(res.hops[2].asn, "AS15169");
        assert!((res.hops[2].avg - 11.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_mtr_json_unknown_asn_is_empty() {
        let raw = br#"{"report":{"hubs":[
            {"count":1,"host":"10.0.0.1","ASN":"AS???","Loss%":0.0,"Last":1.0,"Avg":1.0,"Best":1.0,"Wrst":1.0}
        ]}}"#;
        let res = parse_mtr_json("x", raw).unwrap();
        assert!(res.hops[0].asn.is_empty());
    }

    #[test]
    fn test_parse_mtr_json_empty_hubs() {
        let res = parse_mtr_json("x", br#"{"report":{"hubs":[]}}"#).unwrap();
        assert!(res.hops.is_empty());
    }

    #[test]
    fn test_parse_mtr_json_garbage() {
        assert!(parse_mtr_json("x", b"not json").is_err());
    }

    fn echo_reply_datagram(id: u16, seq: u16) -> Vec<u8> {
        let mut d = vec![0u8; 28];
        d[0] = 0x45;
        d[20] = 0; // Echo Reply
        d[24..26].copy_from_slice(&id.to_be_bytes());
        d[26..28].copy_from_slice(&seq.to_be_bytes());
        d
    }

    fn time_exceeded_datagram(id: u16, seq: u16) -> Vec<u8> {
        // outer IP(20) + ICMP TimeExceeded(8) + inner IP(20) + inner ICMP(8)
        let mut d = vec![0u8; 56];
        d[0] = 0x45;
        d[20] = 11; // Time Exceeded
        d[28] = 0x45; // inner IP header
        d[48] = 8; // inner Echo Request
        d[52..54].copy_from_slice(&id.to_be_bytes());
        d[54..56].copy_from_slice(&seq.to_be_bytes());
        d
    }

    #[test]
    fn test_parse_trace_reply_echo() {
        let d = echo_reply_datagram(0x2222, 5);
        assert_eq!(
            parse_trace_reply(&d, 0x2222, 5),
            Some(TraceReply::EchoReply)
        );
        assert_eq!(parse_trace_reply(&d, 0x2222, 6), None);
    }

    #[test]
    fn test_parse_trace_reply_time_exceeded() {
        let d = time_exceeded_datagram(0x3333, 2);
        assert_eq!(
            parse_trace_reply(&d, 0x3333, 2),
            Some(TraceReply::TimeExceeded)
        );
        assert_eq!(parse_trace_reply(&d, 0x4444, 2), None);
    }

    #[test]
    fn test_parse_trace_reply_rejects_foreign_types() {
        let mut d = echo_reply_datagram(1, 1);
        d[20] = 3; // Destination Unreachable
        assert_eq!(parse_trace_reply(&d, 1, 1), None);
    }
}
