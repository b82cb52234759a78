//! Transfer logging trait for structured event records.
//!
//! Sender sessions, the fan-out orchestrator and the receiver loop emit one
//! `TransferLog` per protocol event. How the record is rendered (tracing,
//! CSV, nothing) is up to the `TransferLogger` implementation.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: filename packet sent
    FilenameSent { attempt: u32 },
    /// Sender: destination accepted the filename packet
    FilenameAcked,
    /// Sender: new data packet sent
    DataSent { seq: i32, base: i32, next: i32, window_end: i32 },
    /// Sender: ack marked a window slot
    AckReceived { seq: i32, base: i32, next: i32, window_end: i32 },
    /// Sender: a round elapsed without any ack
    RoundTimeout { base: i32, next: i32 },
    /// Sender: packet sent again
    Retransmit { seq: i32, attempt: u32 },
    /// Sender: EOF marker sent
    EofSent { seq: i32, attempt: u32 },
    /// Sender: session finished after the EOF round-trip
    TransferComplete { data_packets: i32, bytes: u64, retransmits: u64, duration_ms: u64 },
    /// Sender: session abandoned
    TransferFailed { phase: &'static str, reason: String },
    /// Receiver: socket bound
    ReceiverStarted { bind_addr: SocketAddr },
    /// Receiver: new session created for an endpoint
    SessionOpened,
    /// Receiver: idle session reaped
    SessionEvicted { idle_ms: u64 },
    /// Receiver: session table full
    SessionRejected { max_sessions: usize },
    /// Receiver: output file opened
    FileOpened { path: PathBuf },
    /// Receiver: output file closed on EOF
    FileClosed { path: PathBuf, bytes: u64 },
    /// Receiver: destination already being written by another sender
    FileInProgress { path: PathBuf },
    /// Receiver: filename rejected
    InvalidPath { path: String },
    /// Receiver: data packet buffered for reassembly
    DataBuffered { seq: i32 },
    /// Receiver: duplicate or already-flushed data packet
    DataDuplicate { seq: i32 },
    /// Receiver: sequence number beyond the reassembly range
    DataOutOfRange { seq: i32, expected: i32 },
    /// Receiver: contiguous run written to the output
    DataWritten { first: i32, last: i32, bytes: u64 },
    /// Receiver: ack sent
    AckSent { seq: i32 },
    /// Loss simulator: inbound data dropped
    DropData { seq: i32 },
    /// Loss simulator: outbound ack dropped
    DropAck { seq: i32 },
    /// Malformed datagram
    Framing { message: String },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilenameSent { attempt } => write!(f, "filename_sent attempt={}", attempt),
            Self::FilenameAcked => write!(f, "filename_acked"),
            Self::DataSent { seq, base, next, window_end } => {
                write!(f, "data seq={} base={} next={} window_end={}", seq, base, next, window_end)
            }
            Self::AckReceived { seq, base, next, window_end } => {
                write!(f, "ack seq={} base={} next={} window_end={}", seq, base, next, window_end)
            }
            Self::RoundTimeout { base, next } => {
                write!(f, "round_timeout base={} next={}", base, next)
            }
            Self::Retransmit { seq, attempt } => {
                write!(f, "retransmit seq={} attempt={}", seq, attempt)
            }
            Self::EofSent { seq, attempt } => write!(f, "eof_sent seq={} attempt={}", seq, attempt),
            Self::TransferComplete { data_packets, bytes, retransmits, duration_ms } => {
                write!(
                    f,
                    "transfer_complete packets={} bytes={} retransmits={} duration_ms={}",
                    data_packets, bytes, retransmits, duration_ms
                )
            }
            Self::TransferFailed { phase, reason } => {
                write!(f, "transfer_failed phase={} reason={}", phase, reason)
            }
            Self::ReceiverStarted { bind_addr } => write!(f, "receiver_started bind={}", bind_addr),
            Self::SessionOpened => write!(f, "session_opened"),
            Self::SessionEvicted { idle_ms } => write!(f, "session_evicted idle_ms={}", idle_ms),
            Self::SessionRejected { max_sessions } => {
                write!(f, "session_rejected max_sessions={}", max_sessions)
            }
            Self::FileOpened { path } => write!(f, "file_opened path={}", path.display()),
            Self::FileClosed { path, bytes } => {
                write!(f, "file_closed path={} bytes={}", path.display(), bytes)
            }
            Self::FileInProgress { path } => write!(f, "file_in_progress path={}", path.display()),
            Self::InvalidPath { path } => write!(f, "invalid_path path={:?}", path),
            Self::DataBuffered { seq } => write!(f, "data_buffered seq={}", seq),
            Self::DataDuplicate { seq } => write!(f, "data_duplicate seq={}", seq),
            Self::DataOutOfRange { seq, expected } => {
                write!(f, "data_out_of_range seq={} expected={}", seq, expected)
            }
            Self::DataWritten { first, last, bytes } => {
                write!(f, "data_written first={} last={} bytes={}", first, last, bytes)
            }
            Self::AckSent { seq } => write!(f, "ack_sent seq={}", seq),
            Self::DropData { seq } => write!(f, "drop_data seq={}", seq),
            Self::DropAck { seq } => write!(f, "drop_ack seq={}", seq),
            Self::Framing { message } => write!(f, "framing_error: {}", message),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect records for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle, warn for anything dropped, debug for per-packet spam
        match &entry.event {
            TransferEvent::FilenameAcked
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::ReceiverStarted { .. }
            | TransferEvent::SessionOpened
            | TransferEvent::SessionEvicted { .. }
            | TransferEvent::FileOpened { .. }
            | TransferEvent::FileClosed { .. } => {
                tracing::info!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::RoundTimeout { .. }
            | TransferEvent::TransferFailed { .. }
            | TransferEvent::SessionRejected { .. }
            | TransferEvent::FileInProgress { .. }
            | TransferEvent::InvalidPath { .. }
            | TransferEvent::DataOutOfRange { .. }
            | TransferEvent::DropData { .. }
            | TransferEvent::DropAck { .. }
            | TransferEvent::Framing { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_key_value() {
        let ev = TransferEvent::DataSent { seq: 3, base: 1, next: 4, window_end: 5 };
        assert_eq!(ev.to_string(), "data seq=3 base=1 next=4 window_end=5");

        let ev = TransferEvent::TransferFailed {
            phase: "filename_handshake",
            reason: "retries exhausted".into(),
        };
        assert_eq!(
            ev.to_string(),
            "transfer_failed phase=filename_handshake reason=retries exhausted"
        );

        let ev = TransferEvent::FileClosed { path: PathBuf::from("out/a.bin"), bytes: 10 };
        assert_eq!(ev.to_string(), "file_closed path=out/a.bin bytes=10");
    }
}
