//! ICMP ping prober.
//!
//! Sends a burst of echo requests over a native ICMP socket (RAW first,
//! DGRAM for unprivileged setups) and aggregates per-reply RTTs into loss and
//! min/avg/max statistics. Blocking sockets run in `spawn_blocking` for
//! sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{PingResult, ProbeError};

/// Sequence counter shared by all pingers so concurrent runs against the same
/// destination stay distinguishable.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

const DEFAULT_PACKET_COUNT: u32 = 5;
const PACKET_INTERVAL: Duration = Duration::from_secs(1);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct IcmpPinger {
    address: String,
    count: u32,
}

impl IcmpPinger {
    pub fn new(address: &str, count: u32) -> Self {
        Self {
            address: address.to_string(),
            count: if count == 0 { DEFAULT_PACKET_COUNT } else { count },
        }
    }

    /// Run the ping burst and compute aggregate statistics.
    pub async fn run(&self) -> Result<PingResult, ProbeError> {
        let ip = resolve_address(&self.address).await?;
        let count = self.count;

        tokio::task::spawn_blocking(move || blocking_ping(ip, count))
            .await
            .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?
    }
}

/// Resolve a hostname or literal to an IP address, preferring IPv4.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .iter()
        .find(|sa| sa.is_ipv4())
        .or_else(|| addrs.first())
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

/// Open an ICMP socket for the address family, RAW first then DGRAM.
/// Both failing means the process lacks the needed privileges.
fn open_icmp_socket(ip: IpAddr) -> Result<Socket, ProbeError> {
    let (domain, proto) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    Socket::new(domain, Type::RAW, Some(proto))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(proto)))
        .map_err(|e| {
            ProbeError::Unsupported(format!(
                "ICMP socket requires CAP_NET_RAW or ping_group_range: {}",
                e
            ))
        })
}

fn blocking_ping(ip: IpAddr, count: u32) -> Result<PingResult, ProbeError> {
    let socket = open_icmp_socket(ip)?;
    socket
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .map_err(|e| ProbeError::Network(format!("set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(REPLY_TIMEOUT))
        .map_err(|e| ProbeError::Network(format!("set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let seq_base = PING_SEQUENCE.fetch_add(count as u16, Ordering::Relaxed);

    let mut rtts: Vec<Duration> = Vec::with_capacity(count as usize);

    for i in 0..count {
        let sequence = seq_base.wrapping_add(i as u16);
        let packet = build_echo_request(ip, identifier, sequence);

        let start = Instant::now();
        if socket.send(&packet).is_ok() {
            if let Some(rtt) = wait_for_reply(&socket, ip, identifier, sequence, start) {
                rtts.push(rtt);
            }
        }

        // pace packets one second apart
        if i + 1 < count {
            let elapsed = start.elapsed();
            if elapsed < PACKET_INTERVAL {
                std::thread::sleep(PACKET_INTERVAL - elapsed);
            }
        }
    }

    let recv = rtts.len() as u32;
    let loss_rate = 100.0 * (1.0 - recv as f64 / count as f64);
    let (min_rtt, max_rtt, avg_rtt) = if rtts.is_empty() {
        (Duration::ZERO, Duration::ZERO, Duration::ZERO)
    } else {
        let min = *rtts.iter().min().unwrap();
        let max = *rtts.iter().max().unwrap();
        let sum: Duration = rtts.iter().sum();
        (min, max, sum / recv)
    };

    Ok(PingResult {
        packets_sent: count,
        packets_recv: recv,
        loss_rate,
        min_rtt,
        avg_rtt,
        max_rtt,
    })
}

/// Wait for the echo reply matching (identifier, sequence). Foreign packets
/// on the shared socket are skipped until the per-packet deadline passes.
fn wait_for_reply(
    socket: &Socket,
    ip: IpAddr,
    identifier: u16,
    sequence: u16,
    start: Instant,
) -> Option<Duration> {
    loop {
        if start.elapsed() >= REPLY_TIMEOUT {
            return None;
        }

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(_) => return None, // read timeout or socket error
        };
        // SAFETY: recv initialized `len` bytes
        let data: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= REPLY_TIMEOUT {
            return None;
        }

        if let Some((id, seq)) = parse_echo_reply(ip, data) {
            if id == identifier && seq == sequence {
                return Some(elapsed);
            }
        }
        // not ours, keep waiting
    }
}

/// Extract (identifier, sequence) from an echo reply, skipping the IPv4
/// header when a RAW socket delivered the full datagram.
fn parse_echo_reply(ip: IpAddr, data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 8 {
        return None;
    }

    let (offset, reply_type) = match ip {
        IpAddr::V4(_) => {
            let offset = if data[0] >> 4 == 4 { 20 } else { 0 };
            (offset, 0u8) // ICMP Echo Reply
        }
        IpAddr::V6(_) => (0, 129u8), // ICMPv6 Echo Reply
    };

    if data.len() < offset + 8 {
        return None;
    }
    if data[offset] != reply_type {
        return None;
    }

    let id = u16::from_be_bytes([data[offset + 4], data[offset + 5]]);
    let seq = u16::from_be_bytes([data[offset + 6], data[offset + 7]]);
    Some((id, seq))
}

/// Build an echo request for the address family. 8 byte header plus a
/// 56 byte payload carrying a send timestamp.
pub(super) fn build_echo_request(ip: IpAddr, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = match ip {
        IpAddr::V4(_) => 8,   // Echo Request
        IpAddr::V6(_) => 128, // ICMPv6 Echo Request
    };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // ICMPv6 checksums are filled in by the kernel
    if ip.is_ipv4() {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// RFC 1071 internet checksum.
pub(super) fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
