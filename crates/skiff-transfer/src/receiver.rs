//! Multi-session receiver: one socket, one processing loop.
//!
//! ```text
//! recv_from() --> decode --> [loss sim] --> SessionTable[src]
//!                                              |  seq 0  : open output, ack 0
//!                                              |  data   : park, drain in order, ack seq
//!                                              |  EOF    : close output, ack
//!                                              v
//!                                   [loss sim] --> send_to(src)
//! ```
//!
//! Datagrams are handled one at a time and every session's buffer is
//! drained before the next read, so session state needs no locking.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ReceiverConfig;
use crate::error::TransferError;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::loss::LossSimulator;
use crate::protocol::*;
use crate::reassembly::Insert;
use crate::session::{Evicted, SessionTable};

/// OS receive buffer size (4 MB).
const UDP_RECV_BUFFER: usize = 4 * 1024 * 1024;

/// Receiver counters, readable from any thread while the loop runs.
pub struct ReceiverStats {
    pub datagrams_received: AtomicU64,
    pub framing_errors: AtomicU64,
    pub data_dropped: AtomicU64,
    pub acks_dropped: AtomicU64,
    pub acks_sent: AtomicU64,
    pub bytes_written: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub files_completed: AtomicU64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            data_dropped: AtomicU64::new(0),
            acks_dropped: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
        }
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Receiver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: ReceiverConfig,
    sessions: SessionTable,
    loss: Option<LossSimulator>,
    logger: Arc<dyn TransferLogger>,
    stats: Arc<ReceiverStats>,
}

impl Receiver {
    /// Validate the config and bind the listening socket.
    pub fn bind(config: ReceiverConfig, logger: Arc<dyn TransferLogger>) -> Result<Self, TransferError> {
        config.validate()?;
        let loss = LossSimulator::new(config.data_drop_percent, config.ack_drop_percent, config.loss_seed)?;
        let socket = create_recv_socket(config.bind_addr, config.poll_interval)?;
        let local_addr = socket.local_addr()?;

        logger.log(TransferLog {
            component: "receiver",
            peer: local_addr,
            event: TransferEvent::ReceiverStarted { bind_addr: local_addr },
        });

        let sessions = SessionTable::new(
            config.max_sessions,
            config.reassembly_capacity,
            config.idle_timeout,
        );

        Ok(Self {
            socket,
            local_addr,
            config,
            sessions,
            loss,
            logger,
            stats: Arc::new(ReceiverStats::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Serve until `shutdown` is set, or until the configured idle exit
    /// triggers. Open outputs are flushed before returning.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), TransferError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut last_datagram = Instant::now();
        let mut last_sweep = Instant::now();

        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.config.poll_interval {
                last_sweep = now;
                let evicted = self.sessions.evict_idle(now);
                self.report_evictions(evicted);
            }
            if let Some(linger) = self.config.exit_when_idle {
                if !self.sessions.any_active() && now.duration_since(last_datagram) >= linger {
                    break Ok(());
                }
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    last_datagram = Instant::now();
                    if let Some(ack) = self.process(&buf[..len], src, last_datagram) {
                        self.send_ack(ack, src);
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    // Windows returns TimedOut, Unix returns WouldBlock
                    continue;
                }
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP port unreachable from an earlier ack on Windows
                    continue;
                }
                Err(e) => break Err(TransferError::Io(e)),
            };
        };

        self.sessions.close_all();
        result
    }

    /// Apply one inbound datagram to session state. Returns the ack to send,
    /// if any. Data loss simulation happens here; ack loss happens on send.
    pub fn process(&mut self, datagram: &[u8], src: SocketAddr, now: Instant) -> Option<i32> {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let packet = match decode_packet(datagram) {
            Ok(p) => p,
            Err(e) => {
                self.stats.framing_errors.fetch_add(1, Ordering::Relaxed);
                self.emit(src, TransferEvent::Framing { message: e.to_string() });
                return None;
            }
        };
        let kind = packet.kind();

        if kind == PacketKind::Data {
            if let Some(loss) = self.loss.as_mut() {
                if loss.drop_data() {
                    self.stats.data_dropped.fetch_add(1, Ordering::Relaxed);
                    self.emit(src, TransferEvent::DropData { seq: packet.sequence });
                    return None;
                }
            }
        }

        if !self.sessions.contains(&src) && self.sessions.len() >= self.sessions.max_sessions() {
            let evicted = self.sessions.make_room(now);
            self.report_evictions(evicted);
        }
        let created = match self.sessions.get_or_create(src, now) {
            Some((_, created)) => created,
            None => {
                self.stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                self.emit(src, TransferEvent::SessionRejected {
                    max_sessions: self.sessions.max_sessions(),
                });
                return None;
            }
        };
        if created {
            self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
            self.emit(src, TransferEvent::SessionOpened);
        }

        match kind {
            PacketKind::Filename => match packet.filename_str() {
                Ok(name) => {
                    let name = name.to_string();
                    self.on_filename(src, &name)
                }
                Err(e) => {
                    self.stats.framing_errors.fetch_add(1, Ordering::Relaxed);
                    self.emit(src, TransferEvent::Framing { message: e.to_string() });
                    None
                }
            },
            PacketKind::Eof => self.on_eof(src, packet.sequence),
            PacketKind::Data => self.on_data(src, packet),
        }
    }

    fn on_filename(&mut self, src: SocketAddr, name: &str) -> Option<i32> {
        let Some(path) = resolve_output_path(&self.config.root_dir, name) else {
            self.emit(src, TransferEvent::InvalidPath { path: name.to_string() });
            return None;
        };

        // Retransmitted filename packet: our first ack was lost.
        if self.sessions.get(&src)?.path() == Some(path.as_path()) {
            return Some(FILENAME_SEQ);
        }
        if self.sessions.path_in_use(&path, src) {
            self.emit(src, TransferEvent::FileInProgress { path });
            return Some(ACK_IN_PROGRESS);
        }

        let session = self.sessions.get_mut(&src)?;
        match session.open(path.clone()) {
            Ok(()) => {
                self.emit(src, TransferEvent::FileOpened { path });
                Some(FILENAME_SEQ)
            }
            Err(e) => {
                self.emit(src, TransferEvent::Error {
                    message: format!("cannot create {}: {}", path.display(), e),
                });
                None
            }
        }
    }

    fn on_eof(&mut self, src: SocketAddr, seq: i32) -> Option<i32> {
        let session = self.sessions.get_mut(&src)?;
        if !session.is_active() {
            return Some(seq);
        }
        // The positive EOF form names the sequence after the last data
        // packet; hold the ack until everything before it is on disk.
        if seq > 0 && session.expected() != seq {
            let expected = session.expected();
            self.emit(src, TransferEvent::Error {
                message: format!("eof seq={} before data complete, expected={}", seq, expected),
            });
            return None;
        }

        let path = session.path().map(Path::to_path_buf);
        match session.close() {
            Ok(Some(bytes)) => {
                self.stats.files_completed.fetch_add(1, Ordering::Relaxed);
                if let Some(path) = path {
                    self.emit(src, TransferEvent::FileClosed { path, bytes });
                }
                Some(seq)
            }
            Ok(None) => Some(seq),
            Err(e) => {
                self.emit(src, TransferEvent::Error {
                    message: format!("flush failed: {}", e),
                });
                None
            }
        }
    }

    fn on_data(&mut self, src: SocketAddr, packet: Packet) -> Option<i32> {
        let seq = packet.sequence;
        let session = self.sessions.get_mut(&src)?;
        if !session.is_active() {
            self.emit(src, TransferEvent::DataDuplicate { seq });
            return Some(seq);
        }

        let insert = session.insert(seq, packet.payload);
        if !insert.should_ack() {
            let expected = session.expected();
            self.emit(src, TransferEvent::DataOutOfRange { seq, expected });
            return None;
        }
        if insert != Insert::Buffered {
            self.emit(src, TransferEvent::DataDuplicate { seq });
            return Some(seq);
        }

        let drained = session.drain();
        self.emit(src, TransferEvent::DataBuffered { seq });
        match drained {
            Ok(d) if d.packets > 0 => {
                self.stats.bytes_written.fetch_add(d.bytes, Ordering::Relaxed);
                self.emit(src, TransferEvent::DataWritten {
                    first: d.first,
                    last: d.last(),
                    bytes: d.bytes,
                });
            }
            Ok(_) => {}
            // Still parked; the next drain retries the write.
            Err(e) => self.emit(src, TransferEvent::Error {
                message: format!("write failed: {}", e),
            }),
        }
        Some(seq)
    }

    fn send_ack(&mut self, seq: i32, dst: SocketAddr) {
        if let Some(loss) = self.loss.as_mut() {
            if loss.drop_ack() {
                self.stats.acks_dropped.fetch_add(1, Ordering::Relaxed);
                self.emit(dst, TransferEvent::DropAck { seq });
                return;
            }
        }
        match self.socket.send_to(&encode_ack(seq), dst) {
            Ok(_) => {
                self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
                self.emit(dst, TransferEvent::AckSent { seq });
            }
            // One unreachable sender must not take the loop down.
            Err(e) => self.emit(dst, TransferEvent::Error {
                message: format!("ack send failed: {}", e),
            }),
        }
    }

    fn report_evictions(&self, evicted: Vec<Evicted>) {
        for ev in evicted {
            self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            self.emit(ev.endpoint, TransferEvent::SessionEvicted {
                idle_ms: ev.idle.as_millis() as u64,
            });
        }
    }

    fn emit(&self, peer: SocketAddr, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "receiver",
            peer,
            event,
        });
    }
}

/// Bind a receiver and serve until `shutdown` is set. Returns the final
/// counters.
pub fn run_receiver(
    config: ReceiverConfig,
    logger: Arc<dyn TransferLogger>,
    shutdown: Arc<AtomicBool>,
) -> Result<Arc<ReceiverStats>, TransferError> {
    let mut receiver = Receiver::bind(config, logger)?;
    receiver.run(&shutdown)?;
    Ok(receiver.stats())
}

/// Resolve a sender-supplied path under `root`. Absolute paths and any
/// `..` component are refused.
pub fn resolve_output_path(root: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    if name.is_empty() || rel.is_absolute() {
        return None;
    }
    let mut has_file = false;
    for component in rel.components() {
        match component {
            Component::Normal(_) => has_file = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    has_file.then(|| root.join(rel))
}

/// Create a UDP socket bound to the given address with a large recv buffer.
fn create_recv_socket(addr: SocketAddr, poll_interval: Duration) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    // Read timeout lets the loop check shutdown and evict idle sessions
    socket.set_read_timeout(Some(poll_interval.max(Duration::from_millis(1))))?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;

    fn receiver(tag: &str, tweak: impl FnOnce(&mut ReceiverConfig)) -> (Receiver, PathBuf) {
        let root = std::env::temp_dir().join(format!("skiff_receiver_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let mut config = ReceiverConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            root_dir: root.clone(),
            ..ReceiverConfig::default()
        };
        tweak(&mut config);
        (Receiver::bind(config, Arc::new(NullLogger)).unwrap(), root)
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn data(seq: i32, body: &[u8]) -> Vec<u8> {
        Packet::new(seq, body.to_vec()).to_bytes()
    }

    #[test]
    fn out_of_order_data_is_written_in_order() {
        let (mut rx, root) = receiver("order", |_| {});
        let now = Instant::now();
        let p = peer(4000);

        assert_eq!(rx.process(&Packet::filename("out.txt").to_bytes(), p, now), Some(0));
        assert_eq!(rx.process(&data(3, b"ccc"), p, now), Some(3));
        assert_eq!(rx.process(&data(1, b"aaa"), p, now), Some(1));
        assert_eq!(rx.sessions().get(&p).unwrap().expected(), 2);
        assert_eq!(rx.process(&data(2, b"bbb"), p, now), Some(2));
        assert_eq!(rx.sessions().get(&p).unwrap().expected(), 4);

        // duplicates are acked again but not rewritten
        assert_eq!(rx.process(&data(2, b"bbb"), p, now), Some(2));
        assert_eq!(rx.process(&Packet::eof(4).to_bytes(), p, now), Some(4));

        assert_eq!(std::fs::read(root.join("out.txt")).unwrap(), b"aaabbbccc");
        assert_eq!(rx.stats().bytes_written.load(Ordering::Relaxed), 9);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn eof_is_idempotent_and_never_reopens() {
        let (mut rx, root) = receiver("eof", |_| {});
        let now = Instant::now();
        let p = peer(4001);

        rx.process(&Packet::filename("f.bin").to_bytes(), p, now);
        rx.process(&data(1, b"x"), p, now);
        assert_eq!(rx.process(&Packet::eof(EOF_SEQ).to_bytes(), p, now), Some(EOF_SEQ));
        assert_eq!(rx.process(&Packet::eof(EOF_SEQ).to_bytes(), p, now), Some(EOF_SEQ));
        assert_eq!(rx.process(&data(1, b"x"), p, now), Some(1));
        // late duplicate filename packet does not truncate the finished file
        assert_eq!(rx.process(&Packet::filename("f.bin").to_bytes(), p, now), Some(0));

        assert_eq!(std::fs::read(root.join("f.bin")).unwrap(), b"x");
        assert_eq!(rx.stats().files_completed.load(Ordering::Relaxed), 1);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn eof_waits_for_missing_data() {
        let (mut rx, root) = receiver("gap", |_| {});
        let now = Instant::now();
        let p = peer(4002);

        rx.process(&Packet::filename("g.bin").to_bytes(), p, now);
        rx.process(&data(2, b"b"), p, now);
        assert_eq!(rx.process(&Packet::eof(3).to_bytes(), p, now), None);
        rx.process(&data(1, b"a"), p, now);
        assert_eq!(rx.process(&Packet::eof(3).to_bytes(), p, now), Some(3));
        assert_eq!(std::fs::read(root.join("g.bin")).unwrap(), b"ab");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn conflicting_destination_is_rejected() {
        let (mut rx, root) = receiver("conflict", |_| {});
        let now = Instant::now();

        let pkt = Packet::filename("shared.bin").to_bytes();
        assert_eq!(rx.process(&pkt, peer(5000), now), Some(0));
        assert_eq!(rx.process(&pkt, peer(5001), now), Some(ACK_IN_PROGRESS));

        rx.process(&Packet::eof(EOF_SEQ).to_bytes(), peer(5000), now);
        assert_eq!(rx.process(&pkt, peer(5001), now), Some(0));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn framing_errors_and_bad_paths_are_dropped() {
        let (mut rx, root) = receiver("framing", |_| {});
        let now = Instant::now();
        let p = peer(4003);

        assert_eq!(rx.process(&[1, 2, 3], p, now), None);
        assert_eq!(rx.stats().framing_errors.load(Ordering::Relaxed), 1);
        assert_eq!(rx.process(&Packet::filename("../escape").to_bytes(), p, now), None);
        assert_eq!(rx.process(&Packet::filename("/etc/passwd").to_bytes(), p, now), None);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn session_limit_drops_new_endpoints() {
        let (mut rx, root) = receiver("limit", |c| c.max_sessions = 1);
        let now = Instant::now();

        assert_eq!(rx.process(&Packet::filename("a.bin").to_bytes(), peer(1), now), Some(0));
        assert_eq!(rx.process(&Packet::filename("b.bin").to_bytes(), peer(2), now), None);
        assert_eq!(rx.stats().sessions_rejected.load(Ordering::Relaxed), 1);

        // once the first transfer finishes its slot can be reused
        rx.process(&Packet::eof(EOF_SEQ).to_bytes(), peer(1), now);
        assert_eq!(rx.process(&Packet::filename("b.bin").to_bytes(), peer(2), now), Some(0));
        assert_eq!(rx.stats().sessions_evicted.load(Ordering::Relaxed), 1);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn refused_filenames_do_not_hold_session_slots() {
        let (mut rx, root) = receiver("refused", |c| c.max_sessions = 2);
        let now = Instant::now();

        assert_eq!(rx.process(&Packet::filename("a.bin").to_bytes(), peer(1), now), Some(0));
        assert_eq!(rx.process(&Packet::filename("../bad").to_bytes(), peer(2), now), None);
        assert_eq!(rx.process(&Packet::filename("c.bin").to_bytes(), peer(3), now), Some(0));
        assert_eq!(rx.stats().sessions_rejected.load(Ordering::Relaxed), 0);
        assert_eq!(rx.stats().sessions_evicted.load(Ordering::Relaxed), 1);
        assert!(!rx.sessions().contains(&peer(2)));

        // a sender turned away with "in progress" does not pin a slot either
        rx.process(&Packet::eof(EOF_SEQ).to_bytes(), peer(1), now);
        assert_eq!(
            rx.process(&Packet::filename("c.bin").to_bytes(), peer(4), now),
            Some(ACK_IN_PROGRESS)
        );
        assert_eq!(rx.process(&Packet::filename("d.bin").to_bytes(), peer(5), now), Some(0));
        assert!(!rx.sessions().contains(&peer(4)));
        assert_eq!(rx.stats().sessions_evicted.load(Ordering::Relaxed), 3);

        // active writers are still never displaced
        assert_eq!(rx.process(&Packet::filename("e.bin").to_bytes(), peer(6), now), None);
        assert_eq!(rx.stats().sessions_rejected.load(Ordering::Relaxed), 1);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn reassembly_range_is_enforced() {
        let (mut rx, root) = receiver("range", |c| c.reassembly_capacity = 2);
        let now = Instant::now();
        let p = peer(4004);

        rx.process(&Packet::filename("r.bin").to_bytes(), p, now);
        assert_eq!(rx.process(&data(3, b"c"), p, now), None);
        assert_eq!(rx.process(&data(2, b"b"), p, now), Some(2));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn total_data_loss_drops_everything_but_handshakes() {
        let (mut rx, root) = receiver("loss", |c| {
            c.data_drop_percent = 100;
            c.loss_seed = Some(3);
        });
        let now = Instant::now();
        let p = peer(4005);

        assert_eq!(rx.process(&Packet::filename("l.bin").to_bytes(), p, now), Some(0));
        assert_eq!(rx.process(&data(1, b"a"), p, now), None);
        assert_eq!(rx.stats().data_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(rx.process(&Packet::eof(EOF_SEQ).to_bytes(), p, now), Some(EOF_SEQ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn output_paths_stay_under_root() {
        let root = Path::new("/srv/skiff");
        assert_eq!(
            resolve_output_path(root, "a/b.txt"),
            Some(PathBuf::from("/srv/skiff/a/b.txt"))
        );
        assert_eq!(
            resolve_output_path(root, "./c.txt"),
            Some(PathBuf::from("/srv/skiff/./c.txt"))
        );
        assert_eq!(resolve_output_path(root, ""), None);
        assert_eq!(resolve_output_path(root, "."), None);
        assert_eq!(resolve_output_path(root, "a/../../b"), None);
        assert_eq!(resolve_output_path(root, "/abs"), None);
    }
}
