//! Sender session: pushes one file to one receiver.
//!
//! ```text
//! AwaitingFilenameAck --ack 0--> Streaming --source drained, window empty--> AwaitingEofAck --ack eof--> Done
//!         |                          |                                           |
//!         +------- retries / deadline / slot cap / transport error -------------+--> Failed
//! ```
//!
//! Each session owns its socket, its source reader and its window. The
//! socket stays unconnected so a refused port never surfaces as a
//! `ConnectionRefused` on the next read; acks from any other address are
//! discarded.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::SenderConfig;
use crate::error::{FailureReason, Phase, SessionFailure};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::*;
use crate::window::{AckOutcome, SendWindow};

/// UDP send buffer size (4 MB).
const UDP_SEND_BUFFER: usize = 4 * 1024 * 1024;

/// Sender states, stored in `SenderStats::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenderState {
    AwaitingFilenameAck = 0,
    Streaming = 1,
    AwaitingEofAck = 2,
    Done = 3,
    Failed = 4,
}

impl SenderState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AwaitingFilenameAck,
            1 => Self::Streaming,
            2 => Self::AwaitingEofAck,
            3 => Self::Done,
            _ => Self::Failed,
        }
    }

    /// Phase a failure in this state is reported under.
    fn phase(self) -> Phase {
        match self {
            Self::AwaitingFilenameAck => Phase::FilenameHandshake,
            Self::Streaming => Phase::Streaming,
            Self::AwaitingEofAck => Phase::EofHandshake,
            Self::Done | Self::Failed => Phase::Setup,
        }
    }
}

/// Live counters for one sender session.
pub struct SenderStats {
    pub datagrams_sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub acks_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub state: AtomicU8,
}

impl SenderStats {
    pub fn new() -> Self {
        Self {
            datagrams_sent: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            state: AtomicU8::new(SenderState::AwaitingFilenameAck as u8),
        }
    }

    pub fn state(&self) -> SenderState {
        SenderState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

impl Default for SenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals for a session that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub destination: SocketAddr,
    /// Distinct data packets, excluding the filename and EOF packets.
    pub data_packets: i32,
    /// File bytes delivered.
    pub bytes: u64,
    /// Every datagram put on the wire, retransmissions included.
    pub datagrams_sent: u64,
    pub retransmits: u64,
    pub duration: Duration,
}

/// Final result for one destination.
#[derive(Debug)]
pub struct SessionReport {
    pub destination: SocketAddr,
    pub outcome: Result<TransferSummary, SessionFailure>,
}

impl SessionReport {
    pub fn is_done(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.outcome.as_ref().err()
    }
}

/// Open the source file and run one session to completion.
pub fn run_sender(config: SenderConfig, logger: Arc<dyn TransferLogger>) -> SessionReport {
    run_sender_with_stats(config, logger, Arc::new(SenderStats::new()))
}

/// Same as [`run_sender`], reporting progress into caller-owned stats.
pub fn run_sender_with_stats(
    config: SenderConfig,
    logger: Arc<dyn TransferLogger>,
    stats: Arc<SenderStats>,
) -> SessionReport {
    let destination = config.destination;
    let setup = |reason: FailureReason| {
        stats.state.store(SenderState::Failed as u8, Ordering::Relaxed);
        logger.log(TransferLog {
            component: "sender",
            peer: destination,
            event: TransferEvent::TransferFailed {
                phase: Phase::Setup.as_str(),
                reason: reason.to_string(),
            },
        });
        SessionReport {
            destination,
            outcome: Err(SessionFailure::new(destination, Phase::Setup, reason)),
        }
    };

    if let Err(e) = config.validate() {
        return setup(e.into());
    }
    let file = match File::open(&config.source_path) {
        Ok(f) => f,
        Err(e) => return setup(e.into()),
    };
    let socket = match create_udp_socket(destination) {
        Ok(s) => s,
        Err(e) => return setup(e.into()),
    };

    let session = SenderSession::new(config, socket, BufReader::new(file), logger.clone(), stats.clone());
    SessionReport {
        destination,
        outcome: session.run(),
    }
}

pub struct SenderSession<R> {
    config: SenderConfig,
    socket: UdpSocket,
    source: R,
    source_done: bool,
    window: SendWindow,
    logger: Arc<dyn TransferLogger>,
    stats: Arc<SenderStats>,
    state: SenderState,
    send_buf: Vec<u8>,
    recv_buf: [u8; 64],
    data_packets: i32,
    bytes_read: u64,
    started: Instant,
}

impl<R: Read> SenderSession<R> {
    /// Wrap an already bound socket and any byte source. The config is
    /// assumed to be validated.
    pub fn new(
        config: SenderConfig,
        socket: UdpSocket,
        source: R,
        logger: Arc<dyn TransferLogger>,
        stats: Arc<SenderStats>,
    ) -> Self {
        let window = SendWindow::new(config.window_size);
        let send_buf = vec![0u8; HEADER_SIZE + config.mss];
        Self {
            config,
            socket,
            source,
            source_done: false,
            window,
            logger,
            stats,
            state: SenderState::AwaitingFilenameAck,
            send_buf,
            recv_buf: [0u8; 64],
            data_packets: 0,
            bytes_read: 0,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Drive the session to `Done` or `Failed`. Success is only reported
    /// once the receiver has acknowledged the EOF marker.
    pub fn run(mut self) -> Result<TransferSummary, SessionFailure> {
        self.started = Instant::now();
        match self.drive() {
            Ok(()) => {
                self.set_state(SenderState::Done);
                let summary = TransferSummary {
                    destination: self.config.destination,
                    data_packets: self.data_packets,
                    bytes: self.bytes_read,
                    datagrams_sent: self.stats.datagrams_sent.load(Ordering::Relaxed),
                    retransmits: self.stats.retransmits.load(Ordering::Relaxed),
                    duration: self.started.elapsed(),
                };
                self.emit(TransferEvent::TransferComplete {
                    data_packets: summary.data_packets,
                    bytes: summary.bytes,
                    retransmits: summary.retransmits,
                    duration_ms: summary.duration.as_millis() as u64,
                });
                Ok(summary)
            }
            Err(reason) => {
                let phase = self.state.phase();
                self.set_state(SenderState::Failed);
                self.emit(TransferEvent::TransferFailed {
                    phase: phase.as_str(),
                    reason: reason.to_string(),
                });
                Err(SessionFailure::new(self.config.destination, phase, reason))
            }
        }
    }

    fn drive(&mut self) -> Result<(), FailureReason> {
        self.set_state(SenderState::AwaitingFilenameAck);
        self.filename_handshake()?;
        self.set_state(SenderState::Streaming);
        self.stream()?;
        self.set_state(SenderState::AwaitingEofAck);
        self.eof_handshake()
    }

    fn filename_handshake(&mut self) -> Result<(), FailureReason> {
        let policy = self.config.policy.clone();
        let deadline = Instant::now() + policy.handshake_deadline;
        let packet = Packet::filename(&self.config.destination_name);

        for attempt in 1..=policy.handshake_retries {
            let now = Instant::now();
            if now >= deadline {
                return Err(FailureReason::DeadlineExceeded(policy.handshake_deadline));
            }
            self.transmit(&packet)?;
            self.emit(TransferEvent::FilenameSent { attempt });

            let until = (now + policy.handshake_timeout).min(deadline);
            while let Some(ack) = self.recv_ack(until)? {
                match ack {
                    FILENAME_SEQ => {
                        self.emit(TransferEvent::FilenameAcked);
                        return Ok(());
                    }
                    ACK_IN_PROGRESS => return Err(FailureReason::InProgress),
                    // leftover from an earlier session on a reused port
                    _ => {}
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(FailureReason::DeadlineExceeded(policy.handshake_deadline));
        }
        Err(FailureReason::RetriesExhausted {
            attempts: policy.handshake_retries,
        })
    }

    fn stream(&mut self) -> Result<(), FailureReason> {
        let round_timeout = self.config.policy.round_timeout;

        loop {
            self.fill_window()?;
            if self.source_done && self.window.is_empty() {
                return Ok(());
            }

            match self.recv_ack(Instant::now() + round_timeout)? {
                Some(seq) => {
                    if self.window.mark_acked(seq) == AckOutcome::Acked {
                        self.emit(TransferEvent::AckReceived {
                            seq,
                            base: self.window.base(),
                            next: self.window.next(),
                            window_end: self.window.window_end(),
                        });
                    }
                    self.window.slide();
                    // acks are flowing; only resend slots whose own timer ran out
                    let expired = self.window.expired(Instant::now(), round_timeout);
                    self.retransmit(&expired)?;
                }
                None => {
                    self.emit(TransferEvent::RoundTimeout {
                        base: self.window.base(),
                        next: self.window.next(),
                    });
                    let unacked = self.window.unacked();
                    self.retransmit(&unacked)?;
                }
            }
        }
    }

    fn eof_handshake(&mut self) -> Result<(), FailureReason> {
        let policy = self.config.policy.clone();
        let eof_seq = self.window.next();
        let packet = Packet::eof(eof_seq);

        for attempt in 1..=policy.eof_retries {
            self.transmit(&packet)?;
            self.emit(TransferEvent::EofSent { seq: eof_seq, attempt });

            let until = Instant::now() + policy.handshake_timeout;
            while let Some(ack) = self.recv_ack(until)? {
                if ack == eof_seq || ack == EOF_SEQ {
                    return Ok(());
                }
            }
        }
        Err(FailureReason::RetriesExhausted {
            attempts: policy.eof_retries,
        })
    }

    /// Read and send new packets until the window is full or the source
    /// is exhausted.
    fn fill_window(&mut self) -> Result<(), FailureReason> {
        while !self.source_done && self.window.has_room() {
            let chunk = self.read_chunk()?;
            if chunk.is_empty() {
                self.source_done = true;
                break;
            }
            self.bytes_read += chunk.len() as u64;
            let Some(packet) = self.window.push(chunk, Instant::now()) else {
                break;
            };
            self.data_packets += 1;
            self.transmit(&packet)?;
            self.emit(TransferEvent::DataSent {
                seq: packet.sequence,
                base: self.window.base(),
                next: self.window.next(),
                window_end: self.window.window_end(),
            });
        }
        Ok(())
    }

    fn retransmit(&mut self, sequences: &[i32]) -> Result<(), FailureReason> {
        for &seq in sequences {
            let Some((packet, attempt)) = self.window.record_retransmit(seq, Instant::now()) else {
                continue;
            };
            if let Some(max) = self.config.policy.max_slot_retries {
                if attempt > max {
                    return Err(FailureReason::SlotRetriesExhausted {
                        sequence: seq,
                        retries: max,
                    });
                }
            }
            self.transmit(&packet)?;
            self.stats.retransmits.fetch_add(1, Ordering::Relaxed);
            self.emit(TransferEvent::Retransmit { seq, attempt });
        }
        Ok(())
    }

    /// Read up to one MSS. Short reads are topped up so every packet but
    /// the last is full. An empty chunk means end of source.
    fn read_chunk(&mut self) -> io::Result<Bytes> {
        let mut chunk = vec![0u8; self.config.mss];
        let mut filled = 0;
        while filled < chunk.len() {
            match self.source.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        chunk.truncate(filled);
        Ok(Bytes::from(chunk))
    }

    fn transmit(&mut self, packet: &Packet) -> io::Result<()> {
        let len = encode_packet(&mut self.send_buf, packet);
        let target = self.config.destination;

        // Retry on ENOBUFS / WSAENOBUFS: the send buffer is full, back off briefly.
        let mut retries = 0;
        loop {
            match self.socket.send_to(&self.send_buf[..len], target) {
                Ok(_) => break,
                Err(ref e) if retries < 50 && (
                    e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(10055) // WSAENOBUFS
                    || e.raw_os_error() == Some(105)   // ENOBUFS (Linux)
                ) => {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }

        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(packet.payload_len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until `until` for one ack from the destination. `None` means
    /// the wait timed out.
    fn recv_ack(&mut self, until: Instant) -> io::Result<Option<i32>> {
        loop {
            let now = Instant::now();
            if now >= until {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(until - now))?;

            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, src)) => {
                    if src != self.config.destination {
                        continue;
                    }
                    match decode_ack(&self.recv_buf[..len]) {
                        Some(ack) => {
                            self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
                            return Ok(Some(ack));
                        }
                        None => self.emit(TransferEvent::Framing {
                            message: format!("{}-byte datagram is not an ack", len),
                        }),
                    }
                }
                // Windows returns TimedOut, Unix returns WouldBlock
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn set_state(&mut self, state: SenderState) {
        self.state = state;
        self.stats.state.store(state as u8, Ordering::Relaxed);
    }

    fn emit(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "sender",
            peer: self.config.destination,
            event,
        });
    }
}

/// Create an unconnected UDP socket on an ephemeral port of the same
/// address family as `target`.
fn create_udp_socket(target: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    let any: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket.bind(&any.into())?;
    socket.set_send_buffer_size(UDP_SEND_BUFFER)?;

    Ok(socket.into())
}
