//! Configuration for sender sessions, fan-out runs and the receiver.
//!
//! Every struct has a `Default` (or a constructor filling defaults) and a
//! `validate()` that the entry points call before touching the network.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::{DEFAULT_MSS, DEFAULT_WINDOW, MAX_PAYLOAD, MIN_MSS};

/// Attempts for the filename and EOF handshakes.
pub const HANDSHAKE_RETRIES: u32 = 5;

/// Per-attempt handshake timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Wall-clock budget for the filename handshake.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// How long a streaming round waits for an ack.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(1);

/// Default cap on retransmissions of a single sequence number.
pub const MAX_SLOT_RETRIES: u32 = 20;

/// Receiver defaults.
pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_REASSEMBLY_CAPACITY: usize = 10_000;
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timers and retry budgets shared by every sender session.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub handshake_retries: u32,
    pub handshake_timeout: Duration,
    pub handshake_deadline: Duration,
    pub round_timeout: Duration,
    /// `None` retransmits forever.
    pub max_slot_retries: Option<u32>,
    pub eof_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            handshake_retries: HANDSHAKE_RETRIES,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_deadline: HANDSHAKE_DEADLINE,
            round_timeout: ROUND_TIMEOUT,
            max_slot_retries: Some(MAX_SLOT_RETRIES),
            eof_retries: HANDSHAKE_RETRIES,
        }
    }
}

/// Configuration for one sender session.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub destination: SocketAddr,
    pub source_path: PathBuf,
    /// Path the receiver writes to, relative to its root directory.
    pub destination_name: String,
    pub mss: usize,
    pub window_size: usize,
    pub policy: RetryPolicy,
}

impl SenderConfig {
    pub fn new(
        destination: SocketAddr,
        source_path: impl Into<PathBuf>,
        destination_name: impl Into<String>,
    ) -> Self {
        Self {
            destination,
            source_path: source_path.into(),
            destination_name: destination_name.into(),
            mss: DEFAULT_MSS,
            window_size: DEFAULT_WINDOW,
            policy: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_transfer(self.mss, self.window_size, &self.destination_name)
    }
}

/// Configuration for a fan-out run: one file, many destinations.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub destinations: Vec<SocketAddr>,
    pub source_path: PathBuf,
    pub destination_name: String,
    pub mss: usize,
    pub window_size: usize,
    pub policy: RetryPolicy,
}

impl FanoutConfig {
    pub fn new(
        destinations: Vec<SocketAddr>,
        source_path: impl Into<PathBuf>,
        destination_name: impl Into<String>,
    ) -> Self {
        Self {
            destinations,
            source_path: source_path.into(),
            destination_name: destination_name.into(),
            mss: DEFAULT_MSS,
            window_size: DEFAULT_WINDOW,
            policy: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        validate_transfer(self.mss, self.window_size, &self.destination_name)
    }

    /// Per-destination session config. Nothing but the values is shared.
    pub fn sender_config(&self, destination: SocketAddr) -> SenderConfig {
        SenderConfig {
            destination,
            source_path: self.source_path.clone(),
            destination_name: self.destination_name.clone(),
            mss: self.mss,
            window_size: self.window_size,
            policy: self.policy.clone(),
        }
    }
}

fn validate_transfer(mss: usize, window_size: usize, name: &str) -> Result<(), ConfigError> {
    if mss < MIN_MSS {
        return Err(ConfigError::MssTooSmall { mss, min: MIN_MSS });
    }
    if mss > MAX_PAYLOAD {
        return Err(ConfigError::MssTooLarge { mss, max: MAX_PAYLOAD });
    }
    if window_size == 0 {
        return Err(ConfigError::ZeroWindow);
    }
    if name.is_empty() {
        return Err(ConfigError::EmptyDestinationName);
    }
    // One byte is kept free for receivers that expect a NUL terminator.
    if name.len() > mss - 1 {
        return Err(ConfigError::DestinationNameTooLong {
            len: name.len(),
            max: mss - 1,
        });
    }
    Ok(())
}

/// Configuration for the receiver loop.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Directory that received paths are resolved against.
    pub root_dir: PathBuf,
    /// Percentage of inbound data datagrams to drop (0 disables).
    pub data_drop_percent: u8,
    /// Percentage of outbound acks to drop (0 disables).
    pub ack_drop_percent: u8,
    /// Fixed RNG seed for the loss simulator.
    pub loss_seed: Option<u64>,
    pub max_sessions: usize,
    /// How far ahead of the expected sequence a packet may be buffered.
    pub reassembly_capacity: usize,
    /// Sessions silent for this long are closed and removed.
    pub idle_timeout: Option<Duration>,
    /// Socket read timeout; bounds how late shutdown and eviction run.
    pub poll_interval: Duration,
    /// Return once no session is active and nothing arrived for this long.
    pub exit_when_idle: Option<Duration>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            root_dir: PathBuf::from("."),
            data_drop_percent: 0,
            ack_drop_percent: 0,
            loss_seed: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            reassembly_capacity: DEFAULT_REASSEMBLY_CAPACITY,
            idle_timeout: Some(SESSION_IDLE_TIMEOUT),
            poll_interval: RECV_POLL_INTERVAL,
            exit_when_idle: None,
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_drop_percent > 100 {
            return Err(ConfigError::DropPercent(self.data_drop_percent));
        }
        if self.ack_drop_percent > 100 {
            return Err(ConfigError::DropPercent(self.ack_drop_percent));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::ZeroSessions);
        }
        if self.reassembly_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Parse a comma-separated `host:port` list.
pub fn parse_destinations(list: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let mut out = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        out.push(resolve(entry)?);
    }
    if out.is_empty() {
        return Err(ConfigError::NoDestinations);
    }
    Ok(out)
}

/// Load a server list file with one `ip port` pair per line. Blank lines
/// and `#` comments are skipped.
pub fn load_destinations(path: &Path) -> Result<Vec<SocketAddr>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ConfigError::BadDestination {
                entry: line.to_string(),
                message: "expected `ip port`".into(),
            });
        };
        out.push(resolve(&format!("{}:{}", host, port))?);
    }
    if out.is_empty() {
        return Err(ConfigError::NoDestinations);
    }
    Ok(out)
}

fn resolve(entry: &str) -> Result<SocketAddr, ConfigError> {
    let bad = |message: String| ConfigError::BadDestination {
        entry: entry.to_string(),
        message,
    };
    entry
        .to_socket_addrs()
        .map_err(|e| bad(e.to_string()))?
        .next()
        .ok_or_else(|| bad("no address".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn sender_defaults_are_valid() {
        let cfg = SenderConfig::new(addr(), "in.bin", "out/in.bin");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.policy.handshake_retries, 5);
    }

    #[test]
    fn mss_bounds() {
        let mut cfg = SenderConfig::new(addr(), "in.bin", "out.bin");
        cfg.mss = 511;
        assert!(matches!(cfg.validate(), Err(ConfigError::MssTooSmall { .. })));
        cfg.mss = MAX_PAYLOAD + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::MssTooLarge { .. })));
    }

    #[test]
    fn window_and_name_checks() {
        let mut cfg = SenderConfig::new(addr(), "in.bin", "out.bin");
        cfg.window_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroWindow)));

        let mut cfg = SenderConfig::new(addr(), "in.bin", "x".repeat(512));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DestinationNameTooLong { len: 512, max: 511 })
        ));
        cfg.destination_name = "x".repeat(511);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn receiver_checks() {
        let mut cfg = ReceiverConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.data_drop_percent = 101;
        assert!(matches!(cfg.validate(), Err(ConfigError::DropPercent(101))));
        cfg.data_drop_percent = 30;
        cfg.max_sessions = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroSessions)));
    }

    #[test]
    fn fanout_requires_destinations() {
        let cfg = FanoutConfig::new(Vec::new(), "in.bin", "out.bin");
        assert!(matches!(cfg.validate(), Err(ConfigError::NoDestinations)));
    }

    #[test]
    fn destination_list_parsing() {
        let list = parse_destinations("127.0.0.1:9000, 127.0.0.1:9001,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].port(), 9001);
        assert!(parse_destinations(" , ").is_err());
        assert!(parse_destinations("not-an-addr").is_err());
    }

    #[test]
    fn server_config_file() {
        let dir = std::env::temp_dir().join(format!("skiff_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("servers.conf");
        std::fs::write(&path, "# fan-out targets\n127.0.0.1 9000\n\n127.0.0.1 9001\n").unwrap();

        let list = load_destinations(&path).unwrap();
        assert_eq!(list, vec![addr(), "127.0.0.1:9001".parse().unwrap()]);

        std::fs::write(&path, "127.0.0.1\n").unwrap();
        assert!(matches!(
            load_destinations(&path),
            Err(ConfigError::BadDestination { .. })
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
