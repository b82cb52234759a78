use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MSS {mss} is below the required minimum of {min}")]
    MssTooSmall { mss: usize, min: usize },
    #[error("MSS {mss} exceeds the maximum payload of {max}")]
    MssTooLarge { mss: usize, max: usize },
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("drop percentage {0} is outside 0-100")]
    DropPercent(u8),
    #[error("maximum session count must be at least 1")]
    ZeroSessions,
    #[error("reassembly capacity must be at least 1")]
    ZeroCapacity,
    #[error("destination name is empty")]
    EmptyDestinationName,
    #[error("destination name is {len} bytes, the limit at this MSS is {max}")]
    DestinationNameTooLong { len: usize, max: usize },
    #[error("no destinations configured")]
    NoDestinations,
    #[error("bad destination entry {entry:?}: {message}")]
    BadDestination { entry: String, message: String },
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that stop the receiver loop or a sender before any session
/// state exists.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Stage of a sender session at the point it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    FilenameHandshake,
    Streaming,
    EofHandshake,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::FilenameHandshake => "filename_handshake",
            Phase::Streaming => "streaming",
            Phase::EofHandshake => "eof_handshake",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("no acknowledgment after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("no acknowledgment within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("destination file is already being written by another sender")]
    InProgress,
    #[error("sequence {sequence} unacknowledged after {retries} retransmissions")]
    SlotRetriesExhausted { sequence: i32, retries: u32 },
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("sender thread panicked")]
    Panicked,
}

impl FailureReason {
    /// Conflicts are final: retrying cannot succeed while the other sender
    /// holds the destination.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::InProgress | FailureReason::Config(_))
    }
}

/// Terminal failure of one sender session.
#[derive(Debug, Error)]
#[error("transfer to {destination} failed during {phase}: {reason}")]
pub struct SessionFailure {
    pub destination: SocketAddr,
    pub phase: Phase,
    #[source]
    pub reason: FailureReason,
}

impl SessionFailure {
    pub fn new(destination: SocketAddr, phase: Phase, reason: impl Into<FailureReason>) -> Self {
        Self {
            destination,
            phase,
            reason: reason.into(),
        }
    }
}
