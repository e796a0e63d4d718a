/// Receiver session: one accept thread per bound port.
///
/// ```text
/// init()            create dir, claim dir guard, bind N listeners
/// transfer_async()  spawn [port 0] [port 1] ... [port N-1]
///                     accept (retry) → handshake → BLOCK* → DONE/ack
/// finish()          join, release listeners + dir guard, merge stats
/// ```
///
/// The first handshake names the ports the sender actually holds; accept
/// threads on any other port stop and are left out of the report.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{ErrorCode, Result, WdtError};
use crate::guard::{directory_key, ConcurrencyGuard, GuardTicket};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::options::WdtOptions;
use crate::pool::{bind_listeners, ConnectionPool, ConnectionState, PortStates};
use crate::protocol::{self, BlockHeader, DoneAck, Handshake, Record};
use crate::report::{TransferReport, TransferStats};
use crate::request::TransferRequest;
use crate::source::resolve_wire_path;
use crate::throttler::Throttler;

const COMPONENT: &str = "receiver";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Initialized,
    Running,
    Finished,
}

enum PortResult {
    /// A sender connected; stats carry its outcome.
    Connected(TransferStats),
    /// No connection was established.
    Failed(TransferStats),
    /// The sender never used this port.
    Unused,
}

pub struct Receiver {
    request: TransferRequest,
    options: Arc<WdtOptions>,
    logger: Arc<dyn TransferLogger>,
    state: ReceiverState,
    listeners: Vec<(u16, TcpListener)>,
    dir_ticket: Option<GuardTicket>,
    shared: Option<Arc<ReceiverShared>>,
    workers: Vec<(u16, JoinHandle<PortResult>)>,
    started: Option<Instant>,
    report: Option<Arc<TransferReport>>,
}

impl Receiver {
    pub fn new(
        start_port: u16,
        num_ports: u16,
        directory: impl Into<PathBuf>,
        options: Arc<WdtOptions>,
    ) -> Self {
        Self::from_request(TransferRequest::new(start_port, num_ports, directory), options)
    }

    pub fn from_request(request: TransferRequest, options: Arc<WdtOptions>) -> Self {
        Receiver {
            request,
            options,
            logger: Arc::new(TracingLogger),
            state: ReceiverState::Created,
            listeners: Vec::new(),
            dir_ticket: None,
            shared: None,
            workers: Vec::new(),
            started: None,
            report: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn connection_states(&self) -> Vec<(u16, ConnectionState)> {
        match &self.shared {
            Some(shared) => shared.states.snapshot(),
            None => self
                .request
                .ports
                .iter()
                .map(|p| (*p, ConnectionState::Pending))
                .collect(),
        }
    }

    /// Prepare the destination and bind the listening ports. Returns the
    /// request with `ports` resolved, to be handed to the sender.
    pub fn init(&mut self) -> Result<TransferRequest> {
        if self.state != ReceiverState::Created {
            return Err(WdtError::Config("receiver already initialized".into()));
        }
        self.options.validate()?;
        if self.request.num_ports == 0 {
            return Err(WdtError::Config("receiver needs at least one port".into()));
        }

        let dir = &self.request.directory;
        fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;
        let ticket = ConcurrencyGuard::receiver_directories()
            .try_acquire(directory_key(dir))
            .ok_or_else(|| WdtError::AlreadyExists(dir.display().to_string()))?;

        let listeners = bind_listeners(self.request.start_port, self.request.num_ports)?;
        self.request.ports = listeners.iter().map(|(p, _)| *p).collect();
        self.log(TransferEvent::PortsBound {
            ports: self.request.ports.clone(),
        });

        self.listeners = listeners;
        self.dir_ticket = Some(ticket);
        self.state = ReceiverState::Initialized;
        Ok(self.request.clone())
    }

    /// Start accepting on every bound port. Returns immediately.
    pub fn transfer_async(&mut self) -> ErrorCode {
        match self.state {
            ReceiverState::Initialized => {}
            ReceiverState::Finished => return ErrorCode::ConnError,
            ReceiverState::Created | ReceiverState::Running => return ErrorCode::Error,
        }

        let shared = Arc::new(ReceiverShared {
            root: self.request.directory.clone(),
            identity: self.request.identity.clone(),
            pool: ConnectionPool::for_accept(&self.options, Arc::new(AtomicBool::new(false))),
            throttler: Throttler::from_options(&self.options),
            files: FileRegistry::default(),
            sender_ports: Mutex::new(None),
            states: PortStates::new(&self.request.ports),
            logger: self.logger.clone(),
            options: self.options.clone(),
        });

        let mut code = ErrorCode::Ok;
        for (port, listener) in self.listeners.drain(..) {
            let worker = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("wdt-recv-{}", port))
                .spawn(move || receive_port(&worker, port, listener));
            match spawned {
                Ok(handle) => self.workers.push((port, handle)),
                Err(e) => {
                    // Workers already running are stopped and reaped by finish().
                    tracing::error!(port, "cannot spawn receiver thread: {}", e);
                    shared.pool.shutdown_all();
                    code = ErrorCode::Error;
                    break;
                }
            }
        }

        self.shared = Some(shared);
        self.started = Some(Instant::now());
        self.state = ReceiverState::Running;
        code
    }

    /// Wait for every port to finish and build the report. Later calls
    /// return the same report.
    pub fn finish(&mut self) -> Arc<TransferReport> {
        if let Some(report) = &self.report {
            return report.clone();
        }

        let mut connections = Vec::new();
        let mut connected = 0;
        for (port, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(PortResult::Connected(stats)) => {
                    connected += 1;
                    connections.push(stats);
                }
                Ok(PortResult::Failed(stats)) => {
                    let expected = self
                        .shared
                        .as_ref()
                        .is_some_and(|shared| shared.sender_expected(port));
                    if expected {
                        connections.push(stats);
                    }
                }
                Ok(PortResult::Unused) => {}
                Err(_) => {
                    tracing::error!(port, "receiver thread panicked");
                    connections.push(TransferStats::failed(port, ErrorCode::Error));
                }
            }
        }
        self.listeners.clear();
        self.dir_ticket = None;

        let session_code = if connected == 0 {
            ErrorCode::ConnError
        } else {
            ErrorCode::Ok
        };
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        let report = Arc::new(TransferReport::new(connections, session_code, elapsed, None));
        self.log(TransferEvent::TransferComplete {
            status: report.error_code(),
            bytes: report.summary().data_bytes,
            duration_ms: elapsed.as_millis() as u64,
        });

        self.state = ReceiverState::Finished;
        self.report = Some(report.clone());
        report
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            identity: self.request.identity.clone(),
            event,
        });
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.pool.shutdown_all();
        }
        for (_, handle) in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct ReceiverShared {
    root: PathBuf,
    identity: String,
    options: Arc<WdtOptions>,
    pool: ConnectionPool,
    throttler: Option<Throttler>,
    files: FileRegistry,
    /// Ports named by the first handshake.
    sender_ports: Mutex<Option<HashSet<u16>>>,
    states: PortStates,
    logger: Arc<dyn TransferLogger>,
}

impl ReceiverShared {
    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            identity: self.identity.clone(),
            event,
        });
    }

    fn port_unused(&self, port: u16) -> bool {
        matches!(&*self.sender_ports.lock(), Some(ports) if !ports.contains(&port))
    }

    fn sender_expected(&self, port: u16) -> bool {
        matches!(&*self.sender_ports.lock(), Some(ports) if ports.contains(&port))
    }

    fn note_sender_ports(&self, ports: &[u16]) {
        let mut known = self.sender_ports.lock();
        if known.is_none() {
            *known = Some(ports.iter().copied().collect());
        }
    }

    fn check_identity(&self, handshake: &Handshake) -> Result<()> {
        if !self.identity.is_empty() && handshake.identity != self.identity {
            return Err(WdtError::IdMismatch {
                got: handshake.identity.clone(),
                expected: self.identity.clone(),
            });
        }
        Ok(())
    }
}

/// Destination files touched by this session. The first block of a file
/// truncates it and sets its final length; later blocks write in place.
#[derive(Default)]
struct FileRegistry {
    prepared: Mutex<HashSet<PathBuf>>,
}

impl FileRegistry {
    fn prepare(&self, path: &Path, size: u64) -> Result<()> {
        let mut prepared = self.prepared.lock();
        if prepared.contains(path) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| write_error(path, e))?;
        file.set_len(size).map_err(|e| write_error(path, e))?;
        prepared.insert(path.to_path_buf());
        Ok(())
    }
}

fn write_error(path: &Path, source: io::Error) -> WdtError {
    WdtError::FileWrite {
        path: path.display().to_string(),
        source,
    }
}

fn receive_port(shared: &ReceiverShared, port: u16, listener: TcpListener) -> PortResult {
    shared.states.set(port, ConnectionState::Accepting);
    let outcome = shared.pool.accept(&listener, port, || shared.port_unused(port));
    // One connection per port.
    drop(listener);

    let stream = match outcome.result {
        Ok(stream) => stream,
        Err(_) if shared.port_unused(port) => {
            shared.states.set(port, ConnectionState::Closed);
            shared.log(TransferEvent::PortUnused { port });
            return PortResult::Unused;
        }
        Err(e) => {
            shared.states.set(port, ConnectionState::Failed);
            shared.log(TransferEvent::ConnectFailed {
                port,
                attempts: outcome.attempts_used,
            });
            return PortResult::Failed(TransferStats::failed(port, e.code()));
        }
    };

    shared.states.set(port, ConnectionState::Active);
    shared.log(TransferEvent::Connected {
        port,
        attempts: outcome.attempts_used,
    });

    let mut stats = TransferStats::for_port(port);
    if let Err(e) = receive_stream(shared, port, &stream, &mut stats) {
        stats.set_error(e.code());
        shared.log(TransferEvent::Error {
            message: format!("port {}: {}", port, e),
        });
    }
    shared.pool.close(port);
    let end_state = if stats.error_code.is_ok() {
        ConnectionState::Closed
    } else {
        ConnectionState::Failed
    };
    shared.states.set(port, end_state);
    shared.log(TransferEvent::ConnectionDone {
        port,
        status: stats.error_code,
        blocks: stats.blocks,
        bytes: stats.data_bytes,
    });
    PortResult::Connected(stats)
}

fn receive_stream(
    shared: &ReceiverShared,
    port: u16,
    stream: &TcpStream,
    stats: &mut TransferStats,
) -> Result<()> {
    let mut reader = BufReader::with_capacity(shared.options.buffer_size, stream);
    let mut writer = stream;

    // The first handshake, accepted or refused, decides which ports stay open.
    let handshake = match protocol::read_handshake(&mut reader) {
        Ok(hs) => hs,
        Err(e) => {
            shared.note_sender_ports(&[port]);
            let _ = protocol::write_reply(&mut writer, e.code());
            return Err(e);
        }
    };
    shared.note_sender_ports(&handshake.ports);
    if let Err(e) = shared.check_identity(&handshake) {
        let _ = protocol::write_reply(&mut writer, e.code());
        return Err(e);
    }
    protocol::write_reply(&mut writer, ErrorCode::Ok)?;

    let mut buf = vec![0u8; shared.options.buffer_size];
    loop {
        match protocol::read_record(&mut reader, handshake.checksum)? {
            Record::Block(header) => {
                receive_block(shared, &mut reader, &header, &mut buf, stats)?;
                shared.log(TransferEvent::BlockTransferred {
                    port,
                    path: header.path,
                    offset: header.offset,
                    len: header.len,
                });
            }
            Record::Done { blocks, bytes } => {
                if blocks != stats.blocks || bytes != stats.data_bytes {
                    tracing::warn!(
                        port,
                        blocks,
                        bytes,
                        got_blocks = stats.blocks,
                        got_bytes = stats.data_bytes,
                        "sender totals disagree"
                    );
                    stats.set_error(ErrorCode::ProtocolError);
                }
                protocol::write_done_ack(
                    &mut writer,
                    &DoneAck {
                        status: stats.error_code,
                        blocks: stats.blocks,
                        bytes: stats.data_bytes,
                    },
                )?;
                return Ok(());
            }
        }
    }
}

/// Copy one block from the connection into its destination file. A digest
/// mismatch is recorded in `stats` and reported in the ack; the stream stays
/// in sync, so the connection carries on.
fn receive_block<R: Read>(
    shared: &ReceiverShared,
    reader: &mut R,
    header: &BlockHeader,
    buf: &mut [u8],
    stats: &mut TransferStats,
) -> Result<()> {
    let path = resolve_wire_path(&shared.root, &header.path)?;
    shared.files.prepare(&path, header.file_size)?;

    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| write_error(&path, e))?;
    if header.offset > 0 {
        file.seek(SeekFrom::Start(header.offset))
            .map_err(|e| write_error(&path, e))?;
    }

    let mut hasher = header.digest.map(|_| Sha256::new());
    let step = match &shared.throttler {
        Some(throttler) => throttler.slice_bytes().min(buf.len()),
        None => buf.len(),
    };
    let mut remaining = header.len;
    while remaining > 0 {
        let n = remaining.min(step as u64) as usize;
        if let Some(throttler) = &shared.throttler {
            throttler.reserve(n as u64);
        }
        reader.read_exact(&mut buf[..n]).map_err(WdtError::read)?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        file.write_all(&buf[..n]).map_err(|e| write_error(&path, e))?;
        remaining -= n as u64;
    }

    if let (Some(expected), Some(hasher)) = (header.digest, hasher) {
        let actual = hasher.finalize();
        if actual.as_slice() != expected.as_slice() {
            let err = WdtError::ChecksumMismatch {
                path: header.path.clone(),
                offset: header.offset,
            };
            tracing::warn!(
                expected = %hex::encode(expected),
                actual = %hex::encode(actual),
                "{}",
                err
            );
            stats.set_error(err.code());
        }
    }

    stats.blocks += 1;
    stats.data_bytes += header.len;
    stats.header_bytes += header.encoded_len();
    if header.offset == 0 {
        stats.files += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_options() -> Arc<WdtOptions> {
        Arc::new(WdtOptions {
            accept_timeout_millis: 1,
            max_accept_retries: 1,
            max_retries: 1,
            ..Default::default()
        })
    }

    #[test]
    fn init_resolves_ports_and_claims_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        let mut receiver = Receiver::new(0, 3, &dest, quick_options());
        let request = receiver.init().unwrap();
        assert!(dest.is_dir());
        assert_eq!(request.ports.len(), 3);
        assert_eq!(receiver.state(), ReceiverState::Initialized);

        let mut second = Receiver::new(0, 1, &dest, quick_options());
        let err = second.init().unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);

        drop(receiver);
        let mut third = Receiver::new(0, 1, &dest, quick_options());
        assert!(third.init().is_ok());
    }

    #[test]
    fn transfer_async_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Receiver::new(0, 1, dir.path(), quick_options());
        assert_eq!(receiver.transfer_async(), ErrorCode::Error);
        receiver.init().unwrap();
        assert_eq!(receiver.transfer_async(), ErrorCode::Ok);
        assert_eq!(receiver.transfer_async(), ErrorCode::Error);
        receiver.finish();
        assert_eq!(receiver.transfer_async(), ErrorCode::ConnError);
    }

    #[test]
    fn no_sender_is_conn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Receiver::new(0, 2, dir.path(), quick_options());
        receiver.init().unwrap();
        let start = Instant::now();
        assert_eq!(receiver.transfer_async(), ErrorCode::Ok);
        let report = receiver.finish();
        assert_eq!(report.error_code(), ErrorCode::ConnError);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(Arc::ptr_eq(&report, &receiver.finish()));
        assert!(receiver
            .connection_states()
            .iter()
            .all(|(_, s)| *s == ConnectionState::Failed));
    }

    #[test]
    fn file_registry_truncates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/file");
        let registry = FileRegistry::default();
        registry.prepare(&path, 8).unwrap();
        fs::write(&path, b"12345678").unwrap();
        registry.prepare(&path, 8).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"12345678");

        let fresh = FileRegistry::default();
        fresh.prepare(&path, 4).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0u8; 4]);
    }
}
