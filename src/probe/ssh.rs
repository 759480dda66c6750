//! SSH throughput prober.
//!
//! Opens an SSH session and measures both directions by streaming zeroes
//! through remote `cat`. Host keys are intentionally not verified: probe
//! targets are operator-registered and the measurement is latency-neutral
//! either way. The blocking session runs in `spawn_blocking`.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use chrono::Utc;
use ssh2::Session;

use super::{mbps, ProbeError, SpeedResult, SshSettings};

/// Default transfer size when the config does not specify one (5 MiB).
pub const DEFAULT_TEST_BYTES: u64 = 5 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CHUNK_SIZE: usize = 32 * 1024;

pub struct SshSpeedTester {
    config: SshSettings,
}

impl SshSpeedTester {
    pub fn new(mut config: SshSettings) -> Self {
        if config.port == 0 {
            config.port = 22;
        }
        if config.test_bytes == 0 {
            config.test_bytes = DEFAULT_TEST_BYTES;
        }
        Self { config }
    }

    pub async fn run(&self) -> Result<SpeedResult, ProbeError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || run_blocking(config))
            .await
            .map_err(|e| ProbeError::Network(format!("ssh task failed: {}", e)))?
    }
}

fn run_blocking(config: SshSettings) -> Result<SpeedResult, ProbeError> {
    let session = connect(&config)?;

    let download_mbps = measure_download(&session, config.test_bytes)?;
    tracing::debug!(
        "ssh download for {}: {:.2} Mbps",
        config.host,
        download_mbps
    );

    let upload_mbps = measure_upload(&session, config.test_bytes)?;
    tracing::debug!("ssh upload for {}: {:.2} Mbps", config.host, upload_mbps);

    Ok(SpeedResult {
        download_mbps,
        upload_mbps,
        timestamp: Utc::now(),
    })
}

fn connect(config: &SshSettings) -> Result<Session, ProbeError> {
    let addr = format!("{}:{}", config.host, config.port);
    let sockaddr = addr
        .to_socket_addrs()
        .map_err(|e| ProbeError::Network(format!("ssh resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", addr)))?;

    let tcp = TcpStream::connect_timeout(&sockaddr, DIAL_TIMEOUT).map_err(|e| {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ProbeError::Timeout(DIAL_TIMEOUT)
            }
            _ => ProbeError::Network(format!("ssh connect {}: {}", addr, e)),
        }
    })?;

    let mut session =
        Session::new().map_err(|e| ProbeError::Network(format!("ssh session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| ProbeError::Network(format!("ssh handshake failed: {}", e)))?;

    authenticate(&session, config)?;

    Ok(session)
}

fn authenticate(session: &Session, config: &SshSettings) -> Result<(), ProbeError> {
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        if session.userauth_password(&config.user, password).is_ok() {
            return Ok(());
        }
    }
    if let Some(key) = config.ssh_key.as_deref().filter(|k| !k.is_empty()) {
        if session
            .userauth_pubkey_memory(&config.user, None, key, None)
            .is_ok()
        {
            return Ok(());
        }
    }
    if let Some(path) = config.key_path.as_deref().filter(|p| !p.is_empty()) {
        if session
            .userauth_pubkey_file(&config.user, None, std::path::Path::new(path), None)
            .is_ok()
        {
            return Ok(());
        }
    }

    if session.authenticated() {
        return Ok(());
    }
    Err(ProbeError::Network(
        "ssh authentication failed: no supported methods succeeded".to_string(),
    ))
}

/// Remote -> local: run `cat /dev/zero | head -c N`, discard stdout, clock
/// start to EOF.
fn measure_download(session: &Session, test_bytes: u64) -> Result<f64, ProbeError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| ProbeError::Network(format!("ssh channel: {}", e)))?;

    let cmd = format!("cat /dev/zero | head -c {}", test_bytes);
    let start = Instant::now();
    channel
        .exec(&cmd)
        .map_err(|e| ProbeError::Network(format!("ssh exec: {}", e)))?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received += n as u64,
            Err(e) => return Err(ProbeError::Network(format!("ssh read: {}", e))),
        }
    }
    let elapsed = start.elapsed();

    let _ = channel.wait_close();
    Ok(mbps(received, elapsed))
}

/// Local -> remote: open `cat > /dev/null`, stream zero chunks, close stdin,
/// wait for exit.
fn measure_upload(session: &Session, test_bytes: u64) -> Result<f64, ProbeError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| ProbeError::Network(format!("ssh channel: {}", e)))?;

    channel
        .exec("cat > /dev/null")
        .map_err(|e| ProbeError::Network(format!("ssh exec: {}", e)))?;

    let buf = [0u8; CHUNK_SIZE];
    let mut remaining = test_bytes;
    let mut written: u64 = 0;

    let start = Instant::now();
    while remaining > 0 {
        let to_write = (remaining as usize).min(CHUNK_SIZE);
        match channel.write(&buf[..to_write]) {
            Ok(0) => break,
            Ok(n) => {
                written += n as u64;
                remaining -= n as u64;
            }
            Err(e) => return Err(ProbeError::Network(format!("ssh write: {}", e))),
        }
    }
    // closing stdin signals EOF to the remote cat
    let _ = channel.send_eof();
    let _ = channel.wait_eof();
    let elapsed = start.elapsed();
    let _ = channel.wait_close();

    Ok(mbps(written, elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: &str) -> SshSettings {
        SshSettings {
            host: host.to_string(),
            user: "probe".to_string(),
            password: Some("secret".to_string()),
            key_path: None,
            ssh_key: None,
            port: 0,
            test_bytes: 0,
        }
    }

    #[test]
    fn test_defaults_applied() {
        let tester = SshSpeedTester::new(settings("example.com"));
        assert_eq!(tester.config.port, 22);
        assert_eq!(tester.config.test_bytes, DEFAULT_TEST_BYTES);
    }

    #[test]
    fn test_explicit_values_kept() {
        let mut cfg = settings("example.com");
        cfg.port = 2222;
        cfg.test_bytes = 1024;
        let tester = SshSpeedTester::new(cfg);
        assert_eq!(tester.config.port, 2222);
        assert_eq!(tester.config.test_bytes, 1024);
    }

    #[tokio::test]
    async fn test_unresolvable_host_errors() {
        let tester = SshSpeedTester::new(settings("invalid.host.invalid"));
        assert!(tester.run().await.is_err());
    }
}
