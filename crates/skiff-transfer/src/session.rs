//! Receiver-side session state, keyed by remote endpoint.
//!
//! Each endpoint that sends a datagram gets a `Session` holding its output
//! file, reassembly buffer and activity flag. The table is owned by the
//! receiver loop; nothing here is shared across threads.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::reassembly::{Drained, Insert, ReassemblyBuffer};

/// Output file currently being written.
struct OutputFile {
    writer: BufWriter<File>,
    bytes: u64,
}

pub struct Session {
    endpoint: SocketAddr,
    /// Path of the current transfer, kept after close so a late duplicate
    /// filename packet can be recognized.
    path: Option<PathBuf>,
    output: Option<OutputFile>,
    buffer: ReassemblyBuffer,
    active: bool,
    last_seen: Instant,
}

impl Session {
    fn new(endpoint: SocketAddr, capacity: usize, now: Instant) -> Self {
        Self {
            endpoint,
            path: None,
            output: None,
            buffer: ReassemblyBuffer::new(capacity),
            active: true,
            last_seen: now,
        }
    }

    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Cleared once the EOF marker has been processed.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Active and holding an open output file.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.active && self.output.is_some()
    }

    /// Never opened a file: no accepted filename packet yet. Refused and
    /// conflicting filename packets, or stray data, leave a session here.
    #[inline]
    pub fn is_unclaimed(&self) -> bool {
        self.path.is_none() && self.output.is_none()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn expected(&self) -> i32 {
        self.buffer.expected()
    }

    /// Bytes written to the current output.
    pub fn bytes_written(&self) -> u64 {
        self.output.as_ref().map_or(0, |o| o.bytes)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// Create the output file (and its parent directories) and start a
    /// transfer. Any previous output is flushed and closed first. Packets
    /// parked before the first filename packet are kept; a second file on
    /// the same endpoint starts from an empty buffer.
    pub fn open(&mut self, path: PathBuf) -> io::Result<()> {
        self.close()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        self.output = Some(OutputFile {
            writer: BufWriter::new(file),
            bytes: 0,
        });
        if self.path.replace(path).is_some() {
            self.buffer.reset();
        }
        self.active = true;
        Ok(())
    }

    /// Flush and close the output and mark the session finished. Returns the
    /// byte count if a file was open. A failed flush leaves the session
    /// active with its output intact.
    pub fn close(&mut self) -> io::Result<Option<u64>> {
        let bytes = match self.output.as_mut() {
            Some(out) => {
                out.writer.flush()?;
                Some(out.bytes)
            }
            None => None,
        };
        self.output = None;
        self.active = false;
        Ok(bytes)
    }

    pub fn insert(&mut self, seq: i32, payload: Bytes) -> Insert {
        self.buffer.insert(seq, payload)
    }

    /// Write every contiguous packet to the output. Does nothing until the
    /// filename packet has opened a file.
    pub fn drain(&mut self) -> io::Result<Drained> {
        let Some(out) = self.output.as_mut() else {
            return Ok(Drained {
                first: self.buffer.expected(),
                ..Drained::default()
            });
        };
        let drained = self.buffer.drain_into(&mut out.writer)?;
        out.bytes += drained.bytes;
        Ok(drained)
    }
}

/// A session removed by the eviction policy.
#[derive(Debug, Clone)]
pub struct Evicted {
    pub endpoint: SocketAddr,
    pub idle: Duration,
}

pub struct SessionTable {
    sessions: HashMap<SocketAddr, Session>,
    max_sessions: usize,
    capacity: usize,
    idle_timeout: Option<Duration>,
}

impl SessionTable {
    pub fn new(max_sessions: usize, capacity: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions: max_sessions.max(1),
            capacity,
            idle_timeout,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[inline]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.sessions.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<&Session> {
        self.sessions.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(endpoint)
    }

    /// True when some session is still mid-transfer.
    pub fn any_active(&self) -> bool {
        self.sessions.values().any(|s| s.is_writing())
    }

    /// Whether another endpoint is currently writing `path`.
    pub fn path_in_use(&self, path: &Path, except: SocketAddr) -> bool {
        self.sessions
            .values()
            .any(|s| s.endpoint != except && s.is_writing() && s.path() == Some(path))
    }

    /// Look up the session for `endpoint`, creating it if there is room.
    /// Returns `None` when the table is full; call `make_room` first.
    pub fn get_or_create(&mut self, endpoint: SocketAddr, now: Instant) -> Option<(&mut Session, bool)> {
        let created = !self.sessions.contains_key(&endpoint);
        if created && self.sessions.len() >= self.max_sessions {
            return None;
        }
        let capacity = self.capacity;
        let session = self
            .sessions
            .entry(endpoint)
            .or_insert_with(|| Session::new(endpoint, capacity, now));
        session.touch(now);
        Some((session, created))
    }

    /// Close and remove sessions idle longer than the idle timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<Evicted> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let stale: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| s.idle_for(now) >= timeout)
            .map(|s| s.endpoint)
            .collect();
        stale.into_iter().filter_map(|ep| self.remove(ep, now)).collect()
    }

    /// Free a slot for a new endpoint: idle sessions go first, then the
    /// longest-idle session that either already saw its EOF marker or never
    /// opened a file. Transfers in progress are never displaced.
    pub fn make_room(&mut self, now: Instant) -> Vec<Evicted> {
        let mut evicted = self.evict_idle(now);
        if self.sessions.len() < self.max_sessions {
            return evicted;
        }
        let candidate = self
            .sessions
            .values()
            .filter(|s| !s.is_active() || s.is_unclaimed())
            .max_by_key(|s| s.idle_for(now))
            .map(|s| s.endpoint);
        if let Some(ep) = candidate {
            evicted.extend(self.remove(ep, now));
        }
        evicted
    }

    /// Flush every open output. Used on receiver shutdown.
    pub fn close_all(&mut self) {
        for session in self.sessions.values_mut() {
            if let Err(e) = session.close() {
                tracing::warn!(peer = %session.endpoint, "flush on shutdown failed: {}", e);
            }
        }
    }

    fn remove(&mut self, endpoint: SocketAddr, now: Instant) -> Option<Evicted> {
        let mut session = self.sessions.remove(&endpoint)?;
        if let Err(e) = session.close() {
            tracing::warn!(peer = %endpoint, "flush on eviction failed: {}", e);
        }
        Some(Evicted {
            endpoint,
            idle: session.idle_for(now),
        })
    }
}
