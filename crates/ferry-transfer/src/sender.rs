/// Sender side: answers transfer requests from a directory of files.
///
/// ```text
/// GET ──> [Dispatcher] ──MET, DAT 0..n──> peer
///              │ insert
///              ▼
///         [ChunkStore] <── ACK / REQ ── peer
///              │ stale sweep (EvictionPolicy)
///              ▼
///         retransmit, evict, or ERR
/// ```
///
/// One loop thread serves every session. Each iteration waits for a datagram
/// until the nearest sweep or session expiry, handles it, then sweeps if due.

use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::logging::{TransferEvent, TransferLogger, emit};
use crate::protocol::{
    Chunk, DEFAULT_CHUNK_SIZE, Envelope, FileMetadata, MAX_DATAGRAM, Message, RejectReason,
    ResendReason,
};
use crate::session::{DEFAULT_MAX_SESSIONS, SESSION_TIMEOUT_SECS, SessionKey, SessionTable};
use crate::stats::TransferStats;
use crate::store::{ChunkStore, DEFAULT_RING_CAPACITY, EvictionPolicy, OverflowPolicy};
use crate::transport::Transport;

const COMPONENT: &str = "sender";

/// Default age after which an unacknowledged record is stale.
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer size, with slack so oversized datagrams are seen as such.
const RECV_BUFFER: usize = MAX_DATAGRAM + 64;

/// Configuration for the chunk server.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Directory requested names are resolved against.
    pub root: PathBuf,
    pub chunk_size: u32,
    /// Upper bound on ring slots per transfer.
    pub ring_capacity: usize,
    pub overflow: OverflowPolicy,
    pub eviction: EvictionPolicy,
    /// Age after which an unacknowledged record is stale.
    pub resend_timeout: Duration,
    /// Sessions with no datagram for this long are dropped.
    pub session_timeout: Duration,
    pub max_sessions: usize,
    /// Longest single wait, so the shutdown flag is noticed.
    pub max_wait: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            chunk_size: DEFAULT_CHUNK_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            overflow: OverflowPolicy::default(),
            eviction: EvictionPolicy::default(),
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
            session_timeout: Duration::from_secs(SESSION_TIMEOUT_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_wait: Duration::from_millis(200),
        }
    }
}

/// State of one dispatched transfer.
struct Session {
    meta: FileMetadata,
    store: ChunkStore,
    started: Instant,
    /// Records dropped unacknowledged by `ForceAck`.
    evicted: usize,
}

pub struct ChunkServer<T: Transport> {
    transport: T,
    config: SenderConfig,
    sessions: SessionTable<Session>,
    stats: TransferStats,
    logger: Arc<dyn TransferLogger>,
    /// Earliest instant a store sweep could do anything.
    sweep_due: Option<Instant>,
}

impl<T: Transport> ChunkServer<T> {
    pub fn new(transport: T, config: SenderConfig, logger: Arc<dyn TransferLogger>) -> Self {
        let sessions = SessionTable::new(config.max_sessions, config.session_timeout);
        Self {
            transport,
            config,
            sessions,
            stats: TransferStats::new(),
            logger,
            sweep_due: None,
        }
    }

    /// Serve requests until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];
        info!(
            root = %self.config.root.display(),
            chunk_size = self.config.chunk_size,
            eviction = ?self.config.eviction,
            overflow = ?self.config.overflow,
            "chunk server running"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            let wait = match self.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(now).min(self.config.max_wait),
                None => self.config.max_wait,
            };

            if let Some((len, src)) = self.transport.recv_timeout(&mut buf, wait)? {
                self.handle_datagram(&buf[..len], src, Instant::now());
            }

            let now = Instant::now();
            if self.next_deadline().is_some_and(|deadline| now >= deadline) {
                self.sweep(now);
            }
        }

        info!(sessions = self.sessions.len(), "chunk server stopped");
        Ok(())
    }

    /// React to one datagram. Malformed input is dropped.
    pub fn handle_datagram(&mut self, data: &[u8], src: SocketAddr, now: Instant) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(peer = %src, error = %e, "dropping malformed datagram");
                return;
            }
        };
        let key = SessionKey::new(src, envelope.transfer_id);

        match envelope.message {
            Message::Request { filename } => self.dispatch(key, &filename, now),
            Message::Ack { start, count } => self.on_ack(key, start, count, now),
            Message::Resend { chunk_id, reason } => self.on_resend(key, chunk_id, reason, now),
            other => trace!(session = %key, tag = ?other.tag(), "ignoring unexpected message"),
        }
    }

    /// Resolve and open the requested file, then stream it.
    fn dispatch(&mut self, key: SessionKey, filename: &str, now: Instant) {
        let tid = key.transfer_id;
        emit(
            &*self.logger,
            COMPONENT,
            tid,
            TransferEvent::RequestReceived {
                filename: filename.to_string(),
                peer: key.peer,
            },
        );

        // A repeated request restarts the transfer.
        if self.sessions.remove(&key).is_some() {
            debug!(session = %key, "restarting transfer");
        }

        let Some(path) = resolve(&self.config.root, filename) else {
            self.reject(key, RejectReason::InvalidName);
            return;
        };

        let (mut file, file_size) = match open_source(&path) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session = %key, path = %path.display(), error = %e, "cannot open requested file");
                self.reject(key, RejectReason::NotFound);
                return;
            }
        };

        let meta = match FileMetadata::new(filename, file_size, self.config.chunk_size) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(session = %key, error = %e, "cannot describe requested file");
                self.reject(key, RejectReason::TooManyChunks);
                return;
            }
        };

        self.stream(key, meta, &mut file, now);
    }

    /// Send `meta` and every chunk read from `source`, then register the
    /// session. A short or failed read abandons the transfer with a reject.
    fn stream(&mut self, key: SessionKey, meta: FileMetadata, source: &mut impl Read, now: Instant) {
        let tid = key.transfer_id;
        let total = meta.total_chunks;
        if total as usize > self.config.ring_capacity {
            match self.config.overflow {
                OverflowPolicy::Reject => {
                    self.reject(key, RejectReason::TooManyChunks);
                    return;
                }
                OverflowPolicy::Alias => warn!(
                    session = %key,
                    total_chunks = total,
                    ring_capacity = self.config.ring_capacity,
                    "file exceeds ring capacity, chunk ids will alias"
                ),
            }
        }

        self.send(key, Message::Metadata(meta.clone()));
        emit(
            &*self.logger,
            COMPONENT,
            tid,
            TransferEvent::Metadata {
                filename: meta.filename.clone(),
                file_size: meta.file_size,
                total_chunks: total,
            },
        );

        let mut store = ChunkStore::new(total, self.config.ring_capacity);
        for id in 0..total {
            let len = meta.chunk_len(id).unwrap_or(0);
            let mut payload = vec![0u8; len];
            if let Err(e) = source.read_exact(&mut payload) {
                emit(
                    &*self.logger,
                    COMPONENT,
                    tid,
                    TransferEvent::Error {
                        message: format!("read error at chunk {}: {}", id, e),
                    },
                );
                self.reject(key, RejectReason::NotFound);
                return;
            }

            let chunk = Chunk {
                id,
                payload: Bytes::from(payload),
            };
            self.send(key, Message::Chunk(chunk.clone()));
            self.stats.record_chunk(len);
            emit(&*self.logger, COMPONENT, tid, TransferEvent::ChunkSent { chunk_id: id, len });

            if let Some(displaced) = store.insert(chunk, now) {
                emit(
                    &*self.logger,
                    COMPONENT,
                    tid,
                    TransferEvent::RecordDisplaced { displaced, by: id },
                );
            }
        }

        let session = Session {
            meta,
            store,
            started: now,
            evicted: 0,
        };
        if session.store.is_drained() {
            // Nothing to track for an empty file.
            self.finish(key, &session, now);
            return;
        }

        if let Some(old) = self.sessions.insert(key, session, now) {
            info!(session = %old, "session displaced by a newer transfer");
        }
        if self.config.eviction != EvictionPolicy::Retain {
            if let Some(due) = now.checked_add(self.config.resend_timeout) {
                self.sweep_due = Some(self.sweep_due.map_or(due, |d| d.min(due)));
            }
        }
    }

    fn on_ack(&mut self, key: SessionKey, start: u32, count: u32, now: Instant) {
        let Some(session) = self.sessions.get_mut(&key, now) else {
            trace!(session = %key, "ack for unknown session");
            return;
        };
        session.store.acknowledge(start, count);
        self.stats.record_ack();
        emit(&*self.logger, COMPONENT, key.transfer_id, TransferEvent::Ack { start, count });

        if session.store.is_drained() {
            if let Some(session) = self.sessions.remove(&key) {
                self.finish(key, &session, now);
            }
        }
    }

    fn on_resend(&mut self, key: SessionKey, chunk_id: u32, reason: ResendReason, now: Instant) {
        let Some(session) = self.sessions.get_mut(&key, now) else {
            trace!(session = %key, "resend request for unknown session");
            return;
        };
        emit(
            &*self.logger,
            COMPONENT,
            key.transfer_id,
            TransferEvent::ResendRequest { chunk_id, reason },
        );

        // Acknowledged or empty slot: the requester's view is stale.
        let Some(chunk) = session.store.resend(chunk_id, now) else {
            return;
        };
        let resent = chunk.id;
        send_message(&self.transport, key, Message::Chunk(chunk));
        self.stats.record_retransmits(1);
        emit(
            &*self.logger,
            COMPONENT,
            key.transfer_id,
            TransferEvent::ChunkResent { chunk_id: resent },
        );
    }

    /// Apply the eviction policy to every session, finish drained ones and
    /// reap idle ones.
    pub fn sweep(&mut self, now: Instant) {
        let mut finished = Vec::new();
        let mut exhausted = Vec::new();
        let mut next_due: Option<Instant> = None;

        for (key, session) in self.sessions.iter_mut() {
            let sweep = session
                .store
                .sweep(now, self.config.resend_timeout, self.config.eviction);

            if !sweep.evicted.is_empty() {
                session.evicted += sweep.evicted.len();
                emit(
                    &*self.logger,
                    COMPONENT,
                    key.transfer_id,
                    TransferEvent::RecordsEvicted {
                        count: sweep.evicted.len(),
                    },
                );
            }
            for chunk in sweep.retransmit {
                let chunk_id = chunk.id;
                send_message(&self.transport, *key, Message::Chunk(chunk));
                self.stats.record_retransmits(1);
                emit(
                    &*self.logger,
                    COMPONENT,
                    key.transfer_id,
                    TransferEvent::ChunkResent { chunk_id },
                );
            }

            if let Some(chunk_id) = sweep.exhausted {
                debug!(session = %key, chunk_id, "retransmission attempts exhausted");
                exhausted.push(*key);
            } else if session.store.is_drained() {
                finished.push(*key);
            } else if let Some(due) = sweep.next_due {
                next_due = Some(next_due.map_or(due, |d| d.min(due)));
            }
        }

        for key in exhausted {
            self.sessions.remove(&key);
            self.reject(key, RejectReason::RetriesExhausted);
        }
        for key in finished {
            if let Some(session) = self.sessions.remove(&key) {
                self.finish(key, &session, now);
            }
        }
        for key in self.sessions.reap_idle(now) {
            info!(session = %key, "session expired");
        }

        self.sweep_due = next_due;
    }

    /// When the loop next has timed work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.sweep_due, self.sessions.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Report a drained session. Evicted records mean the peer may be missing
    /// data, so that case is not reported as complete.
    fn finish(&self, key: SessionKey, session: &Session, now: Instant) {
        let duration_ms = now.saturating_duration_since(session.started).as_millis() as u64;
        let event = if session.evicted > 0 {
            warn!(session = %key, evicted = session.evicted, "session drained by eviction");
            TransferEvent::TransferIncomplete {
                total_chunks: session.meta.total_chunks,
                evicted: session.evicted,
                duration_ms,
            }
        } else {
            TransferEvent::TransferComplete {
                total_bytes: session.meta.file_size,
                duration_ms,
                retransmits: self.stats.retransmits.load(Ordering::Relaxed),
            }
        };
        emit(&*self.logger, COMPONENT, key.transfer_id, event);
    }

    fn reject(&self, key: SessionKey, reason: RejectReason) {
        emit(&*self.logger, COMPONENT, key.transfer_id, TransferEvent::Rejected { reason });
        self.send(key, Message::Reject(reason));
    }

    fn send(&self, key: SessionKey, message: Message) {
        send_message(&self.transport, key, message);
    }
}

fn send_message<T: Transport>(transport: &T, key: SessionKey, message: Message) {
    let datagram = Envelope::new(key.transfer_id, message).encode();
    if let Err(e) = transport.send_to(&datagram, key.peer) {
        warn!(session = %key, error = %e, "UDP send error");
    }
}

/// Join a requested name onto `root`. Only plain components are allowed.
fn resolve(root: &Path, name: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut named = false;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                named = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    named.then_some(path)
}

fn open_source(path: &Path) -> io::Result<(File, u64)> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    Ok((file, metadata.len()))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::logging::{NullLogger, TransferLog};
    use crate::transport::mock::MockTransport;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl TransferLogger for Recording {
        fn log(&self, entry: TransferLog) {
            self.0.lock().unwrap().push(entry.event.to_string());
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn fixture(files: &[(&str, usize)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, size) in files {
            let data: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
            fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    fn server(dir: &TempDir, tweak: impl FnOnce(&mut SenderConfig)) -> ChunkServer<MockTransport> {
        let mut config = SenderConfig {
            root: dir.path().to_path_buf(),
            chunk_size: 100,
            ..SenderConfig::default()
        };
        tweak(&mut config);
        ChunkServer::new(MockTransport::default(), config, Arc::new(NullLogger))
    }

    fn datagram(tid: Uuid, message: Message) -> Vec<u8> {
        Envelope::new(tid, message).encode().to_vec()
    }

    fn request(name: &str) -> Message {
        Message::Request {
            filename: name.to_string(),
        }
    }

    fn sent(server: &ChunkServer<MockTransport>) -> Vec<(Envelope, SocketAddr)> {
        server
            .transport()
            .take_sent()
            .into_iter()
            .map(|(bytes, to)| (Envelope::decode(&bytes).unwrap(), to))
            .collect()
    }

    #[test]
    fn request_dispatches_metadata_then_every_chunk() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let tid = Uuid::new_v4();
        let now = Instant::now();

        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), now);
        let out = sent(&server);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|(env, to)| env.transfer_id == tid && *to == peer(4000)));

        let Message::Metadata(meta) = &out[0].0.message else {
            panic!("expected metadata first, got {:?}", out[0].0.message);
        };
        assert_eq!((meta.file_size, meta.chunk_size, meta.total_chunks), (250, 100, 3));

        let ids: Vec<(u32, usize)> = out[1..]
            .iter()
            .map(|(env, _)| match &env.message {
                Message::Chunk(c) => (c.id, c.payload.len()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![(0, 100), (1, 100), (2, 50)]);
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn full_ack_finishes_session() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let tid = Uuid::new_v4();
        let now = Instant::now();

        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), now);
        sent(&server);
        server.handle_datagram(&datagram(tid, Message::Ack { start: 0, count: 2 }), peer(4000), now);
        assert_eq!(server.session_count(), 1);
        server.handle_datagram(&datagram(tid, Message::Ack { start: 2, count: 1 }), peer(4000), now);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn resend_serves_unacked_chunk_only() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let tid = Uuid::new_v4();
        let now = Instant::now();
        let resend = |id| Message::Resend {
            chunk_id: id,
            reason: ResendReason::Gap,
        };

        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), now);
        sent(&server);

        server.handle_datagram(&datagram(tid, resend(1)), peer(4000), now);
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].0.message, Message::Chunk(c) if c.id == 1 && c.payload.len() == 100));

        server.handle_datagram(&datagram(tid, Message::Ack { start: 0, count: 2 }), peer(4000), now);
        server.handle_datagram(&datagram(tid, resend(1)), peer(4000), now);
        assert!(sent(&server).is_empty());
        assert_eq!(server.stats().retransmits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rejects_missing_and_escaping_names() {
        let dir = fixture(&[("a.bin", 10)]);
        let mut server = server(&dir, |_| {});
        let now = Instant::now();

        for (name, reason) in [
            ("missing.bin", RejectReason::NotFound),
            ("../a.bin", RejectReason::InvalidName),
            ("/etc/passwd", RejectReason::InvalidName),
            (".", RejectReason::InvalidName),
        ] {
            let tid = Uuid::new_v4();
            server.handle_datagram(&datagram(tid, request(name)), peer(4000), now);
            let out = sent(&server);
            assert_eq!(out.len(), 1, "{name}");
            assert_eq!(out[0].0.message, Message::Reject(reason), "{name}");
        }
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn directories_are_not_served() {
        let dir = fixture(&[]);
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut server = server(&dir, |_| {});
        server.handle_datagram(&datagram(Uuid::new_v4(), request("sub")), peer(4000), Instant::now());
        assert_eq!(sent(&server)[0].0.message, Message::Reject(RejectReason::NotFound));
    }

    #[test]
    fn nested_names_resolve_under_root() {
        let dir = fixture(&[]);
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"hello").unwrap();
        let mut server = server(&dir, |_| {});
        server.handle_datagram(&datagram(Uuid::new_v4(), request("./sub/b.txt")), peer(4000), Instant::now());
        let out = sent(&server);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1].0.message, Message::Chunk(c) if &c.payload[..] == b"hello"));
    }

    #[test]
    fn overflow_rejected_by_default() {
        let dir = fixture(&[("big.bin", 500)]);
        let mut server = server(&dir, |c| c.ring_capacity = 3);
        server.handle_datagram(&datagram(Uuid::new_v4(), request("big.bin")), peer(4000), Instant::now());
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.message, Message::Reject(RejectReason::TooManyChunks));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn overflow_alias_dispatches_and_shares_slots() {
        let dir = fixture(&[("big.bin", 500)]);
        let mut server = server(&dir, |c| {
            c.ring_capacity = 3;
            c.overflow = OverflowPolicy::Alias;
        });
        let tid = Uuid::new_v4();
        let now = Instant::now();
        server.handle_datagram(&datagram(tid, request("big.bin")), peer(4000), now);
        assert_eq!(sent(&server).len(), 6);

        // Slot 0 now holds chunk 3, so a request for 0 gets 3.
        server.handle_datagram(
            &datagram(
                tid,
                Message::Resend {
                    chunk_id: 0,
                    reason: ResendReason::Timeout,
                },
            ),
            peer(4000),
            now,
        );
        let out = sent(&server);
        assert!(matches!(&out[0].0.message, Message::Chunk(c) if c.id == 3));

        // Acking three slots drains the five-chunk transfer.
        server.handle_datagram(&datagram(tid, Message::Ack { start: 0, count: 3 }), peer(4000), now);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn concurrent_clients_have_independent_sessions() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let now = Instant::now();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());

        server.handle_datagram(&datagram(t1, request("a.bin")), peer(4001), now);
        server.handle_datagram(&datagram(t2, request("a.bin")), peer(4002), now);
        assert_eq!(server.session_count(), 2);
        sent(&server);

        // An ack carrying the wrong peer/id pair touches nothing.
        server.handle_datagram(&datagram(t1, Message::Ack { start: 0, count: 3 }), peer(4002), now);
        assert_eq!(server.session_count(), 2);

        server.handle_datagram(&datagram(t1, Message::Ack { start: 0, count: 3 }), peer(4001), now);
        assert_eq!(server.session_count(), 1);

        server.handle_datagram(
            &datagram(
                t2,
                Message::Resend {
                    chunk_id: 2,
                    reason: ResendReason::Gap,
                },
            ),
            peer(4002),
            now,
        );
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, peer(4002));
    }

    #[test]
    fn repeated_request_restarts_transfer() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let tid = Uuid::new_v4();
        let now = Instant::now();

        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), now);
        server.handle_datagram(&datagram(tid, Message::Ack { start: 0, count: 2 }), peer(4000), now);
        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), now);
        assert_eq!(sent(&server).len(), 8);
        assert_eq!(server.session_count(), 1);

        // The restarted store needs all three acks again.
        server.handle_datagram(&datagram(tid, Message::Ack { start: 2, count: 1 }), peer(4000), now);
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn empty_file_sends_metadata_only() {
        let dir = fixture(&[("empty", 0)]);
        let mut server = server(&dir, |_| {});
        server.handle_datagram(&datagram(Uuid::new_v4(), request("empty")), peer(4000), Instant::now());
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].0.message, Message::Metadata(m) if m.total_chunks == 0));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn force_ack_sweep_drains_stale_session() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |_| {});
        let t0 = Instant::now();
        server.handle_datagram(&datagram(Uuid::new_v4(), request("a.bin")), peer(4000), t0);
        assert_eq!(server.next_deadline(), Some(t0 + DEFAULT_RESEND_TIMEOUT));

        server.sweep(t0 + Duration::from_secs(3));
        assert_eq!(server.session_count(), 1);
        server.sweep(t0 + Duration::from_secs(6));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn forced_eviction_is_not_reported_complete() {
        let dir = fixture(&[("a.bin", 250), ("b.bin", 250)]);
        let log = Arc::new(Recording::default());
        let config = SenderConfig {
            root: dir.path().to_path_buf(),
            chunk_size: 100,
            ..SenderConfig::default()
        };
        let mut server = ChunkServer::new(MockTransport::default(), config, log.clone());
        let (evicted, acked) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();
        server.handle_datagram(&datagram(evicted, request("a.bin")), peer(4000), t0);
        server.handle_datagram(&datagram(acked, request("b.bin")), peer(4001), t0);
        server.handle_datagram(&datagram(acked, Message::Ack { start: 0, count: 3 }), peer(4001), t0);

        server.sweep(t0 + Duration::from_secs(6));
        assert_eq!(server.session_count(), 0);

        let lines = log.0.lock().unwrap();
        let finished: Vec<&String> = lines
            .iter()
            .filter(|l| l.starts_with("transfer_"))
            .collect();
        assert_eq!(finished.len(), 2);
        assert!(finished[0].starts_with("transfer_complete bytes=250"));
        assert!(finished[1].starts_with("transfer_incomplete chunks=3 evicted=3"));
    }

    #[test]
    fn short_read_mid_stream_rejects() {
        let dir = fixture(&[]);
        let mut server = server(&dir, |_| {});
        let key = SessionKey::new(peer(4000), Uuid::new_v4());
        let meta = FileMetadata::new("shrunk.bin", 250, 100).unwrap();
        // The file lost its tail after it was measured.
        let mut source = io::Cursor::new(vec![7u8; 150]);
        server.stream(key, meta, &mut source, Instant::now());

        let messages: Vec<Message> = sent(&server).into_iter().map(|(env, _)| env.message).collect();
        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[0], Message::Metadata(m) if m.total_chunks == 3));
        assert!(matches!(&messages[1], Message::Chunk(c) if c.id == 0));
        assert_eq!(messages[2], Message::Reject(RejectReason::NotFound));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn unbounded_timeouts_leave_no_deadline() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |c| {
            c.resend_timeout = Duration::MAX;
            c.session_timeout = Duration::from_secs(u64::MAX);
        });
        let t0 = Instant::now();
        server.handle_datagram(&datagram(Uuid::new_v4(), request("a.bin")), peer(4000), t0);
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.next_deadline(), None);

        server.sweep(t0 + Duration::from_secs(3600));
        assert_eq!(server.session_count(), 1);
    }

    #[test]
    fn retry_then_fail_retransmits_then_rejects() {
        let dir = fixture(&[("a.bin", 150)]);
        let mut server = server(&dir, |c| {
            c.eviction = EvictionPolicy::RetryThenFail { max_attempts: 1 };
            c.resend_timeout = Duration::from_secs(1);
        });
        let tid = Uuid::new_v4();
        let t0 = Instant::now();
        server.handle_datagram(&datagram(tid, request("a.bin")), peer(4000), t0);
        server.handle_datagram(&datagram(tid, Message::Ack { start: 0, count: 1 }), peer(4000), t0);
        sent(&server);

        server.sweep(t0 + Duration::from_millis(1500));
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].0.message, Message::Chunk(c) if c.id == 1));

        server.sweep(t0 + Duration::from_millis(3000));
        let out = sent(&server);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.message, Message::Reject(RejectReason::RetriesExhausted));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn retained_session_expires_when_idle() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |c| {
            c.eviction = EvictionPolicy::Retain;
            c.session_timeout = Duration::from_secs(60);
        });
        let t0 = Instant::now();
        server.handle_datagram(&datagram(Uuid::new_v4(), request("a.bin")), peer(4000), t0);
        assert_eq!(server.next_deadline(), Some(t0 + Duration::from_secs(60)));

        server.sweep(t0 + Duration::from_secs(30));
        assert_eq!(server.session_count(), 1);
        server.sweep(t0 + Duration::from_secs(60));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn full_table_displaces_oldest_session() {
        let dir = fixture(&[("a.bin", 250)]);
        let mut server = server(&dir, |c| c.max_sessions = 1);
        let t0 = Instant::now();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        server.handle_datagram(&datagram(t1, request("a.bin")), peer(4001), t0);
        server.handle_datagram(&datagram(t2, request("a.bin")), peer(4002), t0 + Duration::from_millis(1));
        assert_eq!(server.session_count(), 1);
        sent(&server);

        // The first client's session is gone; its requests are ignored.
        server.handle_datagram(
            &datagram(
                t1,
                Message::Resend {
                    chunk_id: 0,
                    reason: ResendReason::Gap,
                },
            ),
            peer(4001),
            t0,
        );
        assert!(sent(&server).is_empty());
    }

    #[test]
    fn malformed_and_unexpected_datagrams_are_dropped() {
        let dir = fixture(&[("a.bin", 10)]);
        let mut server = server(&dir, |_| {});
        let now = Instant::now();
        server.handle_datagram(b"GE", peer(4000), now);
        server.handle_datagram(b"XYZ0123456789abcdef", peer(4000), now);
        server.handle_datagram(
            &datagram(Uuid::new_v4(), Message::Reject(RejectReason::NotFound)),
            peer(4000),
            now,
        );
        assert!(sent(&server).is_empty());
    }

    #[test]
    fn resolve_accepts_only_plain_components() {
        let root = Path::new("/srv/files");
        assert_eq!(resolve(root, "a/b.txt"), Some(root.join("a/b.txt")));
        assert_eq!(resolve(root, "./b.txt"), Some(root.join("b.txt")));
        assert_eq!(resolve(root, "a/../b"), None);
        assert_eq!(resolve(root, "/abs"), None);
        assert_eq!(resolve(root, "./"), None);
    }
}
