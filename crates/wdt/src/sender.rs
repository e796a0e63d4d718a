/// Sender session: coordinator thread plus one worker per connection.
///
/// ```text
/// [Coordinator]  dial every port, enumerate source → block queue
///      |
///      +--> [Worker port 0] --+
///      +--> [Worker port 1] --+--> pull blocks until the queue drains,
///      +--> [Worker ...   ] --+    then DONE and wait for the ack
/// ```
///
/// Workers share one throttler and one set of progress counters. The queue
/// balances work dynamically: a fast connection simply pulls more blocks.

use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use sha2::{Digest, Sha256};

use crate::error::{ErrorCode, Result, WdtError};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::options::WdtOptions;
use crate::pool::{ConnectionPool, ConnectionState, PortStates};
use crate::progress::{ProgressReporter, ProgressTicker};
use crate::protocol::{self, BlockHeader, Handshake, DIGEST_LEN};
use crate::report::{ProgressCounters, TransferReport, TransferStats};
use crate::request::TransferRequest;
use crate::source::{self, Block};
use crate::throttler::Throttler;

const COMPONENT: &str = "sender";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Created,
    Running,
    Finished,
}

pub struct Sender {
    shared: Arc<SenderShared>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    state: SenderState,
    coordinator: Option<JoinHandle<TransferReport>>,
    report: Option<Arc<TransferReport>>,
}

impl Sender {
    pub fn new(request: TransferRequest, options: Arc<WdtOptions>) -> Self {
        let ports = request.dial_ports();
        Sender {
            shared: Arc::new(SenderShared {
                pool: ConnectionPool::for_dial(&options, Arc::new(AtomicBool::new(false))),
                throttler: Throttler::from_options(&options),
                counters: Arc::new(ProgressCounters::default()),
                states: PortStates::new(&ports),
                logger: Arc::new(TracingLogger),
                request,
                options,
            }),
            reporter: None,
            state: SenderState::Created,
            coordinator: None,
            report: None,
        }
    }

    /// Replace the logger. Only effective before `transfer_async`.
    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.logger = logger;
        }
        self
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn request(&self) -> &TransferRequest {
        &self.shared.request
    }

    pub fn connection_states(&self) -> Vec<(u16, ConnectionState)> {
        self.shared.states.snapshot()
    }

    pub fn progress(&self) -> &ProgressCounters {
        &self.shared.counters
    }

    /// Start the coordinator and return immediately.
    pub fn transfer_async(&mut self) -> ErrorCode {
        match self.state {
            SenderState::Created => {}
            SenderState::Running => return ErrorCode::Error,
            SenderState::Finished => return ErrorCode::ConnError,
        }
        let shared = self.shared.clone();
        let reporter = self.reporter.clone();
        let spawned = std::thread::Builder::new()
            .name("wdt-sender".into())
            .spawn(move || coordinate(&shared, reporter));
        match spawned {
            Ok(handle) => {
                self.coordinator = Some(handle);
                self.state = SenderState::Running;
                ErrorCode::Ok
            }
            Err(e) => {
                tracing::error!("cannot spawn sender coordinator: {}", e);
                ErrorCode::Error
            }
        }
    }

    /// Wait for the transfer and return its report. Later calls return the
    /// same report.
    pub fn finish(&mut self) -> Arc<TransferReport> {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let report = match self.coordinator.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                tracing::error!("sender coordinator panicked");
                TransferReport::new(Vec::new(), ErrorCode::Error, Duration::ZERO, None)
            }),
            // Never started.
            None => TransferReport::new(Vec::new(), ErrorCode::Error, Duration::ZERO, None),
        };
        let report = Arc::new(report);
        self.state = SenderState::Finished;
        self.report = Some(report.clone());
        report
    }

    /// Run the whole transfer on the calling thread's behalf.
    pub fn transfer(&mut self) -> Arc<TransferReport> {
        self.transfer_async();
        self.finish()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            self.shared.pool.shutdown_all();
            let _ = handle.join();
        }
    }
}

struct SenderShared {
    request: TransferRequest,
    options: Arc<WdtOptions>,
    pool: ConnectionPool,
    throttler: Option<Throttler>,
    counters: Arc<ProgressCounters>,
    states: PortStates,
    logger: Arc<dyn TransferLogger>,
}

impl SenderShared {
    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            identity: self.request.identity.clone(),
            event,
        });
    }

    fn complete(&self, report: TransferReport) -> TransferReport {
        self.log(TransferEvent::TransferComplete {
            status: report.error_code(),
            bytes: report.summary().data_bytes,
            duration_ms: report.elapsed().as_millis() as u64,
        });
        report
    }
}

fn coordinate(shared: &SenderShared, reporter: Option<Arc<dyn ProgressReporter>>) -> TransferReport {
    let started = Instant::now();
    if let Some(reporter) = &reporter {
        reporter.start();
    }
    let report = run_transfer(shared, &reporter, started);
    if let Some(reporter) = &reporter {
        reporter.end(&report);
    }
    shared.complete(report)
}

fn run_transfer(
    shared: &SenderShared,
    reporter: &Option<Arc<dyn ProgressReporter>>,
    started: Instant,
) -> TransferReport {
    // Dial first; an unreachable receiver outranks a source error.
    let streams = dial_all(shared);
    let listing = source::enumerate(&shared.request.directory, shared.options.block_size_bytes());
    let listing = match (streams.is_empty(), listing) {
        (true, listing) => {
            let code = match listing {
                Ok(_) => ErrorCode::ConnError,
                Err(e) => e.code().worst(ErrorCode::ConnError),
            };
            return TransferReport::new(Vec::new(), code, started.elapsed(), None);
        }
        (false, Err(e)) => {
            shared.log(TransferEvent::Error {
                message: e.to_string(),
            });
            shared.pool.shutdown_all();
            for (port, _) in &streams {
                shared.states.set(*port, ConnectionState::Closed);
            }
            return TransferReport::new(Vec::new(), e.code(), started.elapsed(), None);
        }
        (false, Ok(listing)) => listing,
    };
    let total_files = listing.files.len() as u64;
    shared.log(TransferEvent::SourceEnumerated {
        files: listing.files.len(),
        blocks: listing.blocks.len(),
        bytes: listing.total_bytes(),
    });

    let connected: Vec<u16> = streams.iter().map(|(p, _)| *p).collect();

    shared
        .counters
        .set_total(listing.total_bytes(), listing.blocks.len() as u64);
    let (block_tx, block_rx) = unbounded::<Block>();
    for block in listing.blocks {
        // The receiving half lives until the workers finish.
        let _ = block_tx.send(block);
    }
    drop(block_tx);

    let mut ticker = reporter.as_ref().map(|r| {
        ProgressTicker::spawn(
            r.clone(),
            shared.counters.clone(),
            shared.options.progress_interval(),
            started,
        )
    });

    let connections: Vec<TransferStats> = std::thread::scope(|s| {
        let handles: Vec<_> = streams
            .into_iter()
            .map(|(port, stream)| {
                let rx = block_rx.clone();
                let connected = &connected;
                let spawned = std::thread::Builder::new()
                    .name(format!("wdt-send-{}", port))
                    .spawn_scoped(s, move || send_port(shared, port, stream, connected, rx));
                (port, spawned)
            })
            .collect();
        handles
            .into_iter()
            .map(|(port, spawned)| match spawned {
                Ok(h) => h.join().unwrap_or_else(|_| {
                    tracing::error!(port, "sender worker panicked");
                    TransferStats::failed(port, ErrorCode::Error)
                }),
                Err(e) => {
                    tracing::error!(port, "cannot spawn sender worker: {}", e);
                    shared.pool.close(port);
                    shared.states.set(port, ConnectionState::Failed);
                    TransferStats::failed(port, ErrorCode::Error)
                }
            })
            .collect()
    });

    if let Some(ticker) = ticker.as_mut() {
        ticker.stop();
    }

    // Blocks left over mean every worker gave up early.
    let session_code = if block_rx.is_empty() {
        ErrorCode::Ok
    } else {
        ErrorCode::Error
    };
    TransferReport::new(connections, session_code, started.elapsed(), Some(total_files))
}

/// Dial every port in parallel. Ports that cannot be reached are logged and
/// left out; the transfer proceeds over the rest.
fn dial_all(shared: &SenderShared) -> Vec<(u16, TcpStream)> {
    let ports = shared.request.dial_ports();
    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = ports
            .iter()
            .map(|port| {
                let port = *port;
                s.spawn(move || {
                    shared.states.set(port, ConnectionState::Connecting);
                    shared.pool.dial(&shared.request.host, port)
                })
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    });

    let mut streams = Vec::new();
    for outcome in outcomes {
        let port = outcome.port;
        match outcome.result {
            Ok(stream) => {
                shared.states.set(port, ConnectionState::Active);
                shared.log(TransferEvent::Connected {
                    port,
                    attempts: outcome.attempts_used,
                });
                streams.push((port, stream));
            }
            Err(_) => {
                shared.states.set(port, ConnectionState::Failed);
                shared.log(TransferEvent::ConnectFailed {
                    port,
                    attempts: outcome.attempts_used,
                });
            }
        }
    }
    streams
}

fn send_port(
    shared: &SenderShared,
    port: u16,
    stream: TcpStream,
    connected: &[u16],
    blocks: Receiver<Block>,
) -> TransferStats {
    let mut stats = TransferStats::for_port(port);
    if let Err(e) = send_stream(shared, port, &stream, connected, &blocks, &mut stats) {
        stats.set_error(e.code());
        match &e {
            WdtError::Rejected(status) => shared.log(TransferEvent::HandshakeRejected {
                port,
                status: *status,
            }),
            _ => shared.log(TransferEvent::Error {
                message: format!("port {}: {}", port, e),
            }),
        }
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
    stats
}

fn send_stream(
    shared: &SenderShared,
    port: u16,
    stream: &TcpStream,
    connected: &[u16],
    blocks: &Receiver<Block>,
    stats: &mut TransferStats,
) -> Result<()> {
    let mut writer = BufWriter::with_capacity(shared.options.buffer_size, stream);
    let mut reader = stream;

    let handshake = Handshake::new(
        &shared.request.identity,
        connected.to_vec(),
        shared.options.enable_checksum,
    );
    protocol::write_handshake(&mut writer, &handshake)?;
    // A receiver that never answers is as good as unreachable.
    let status = protocol::read_reply(&mut reader).map_err(|e| {
        tracing::debug!(port, "no handshake reply: {}", e);
        WdtError::ConnectionFailed { port, attempts: 1 }
    })?;
    if !status.is_ok() {
        return Err(WdtError::Rejected(status));
    }

    let mut buf = vec![0u8; shared.options.buffer_size];
    for block in blocks.iter() {
        if shared.pool.is_aborted() {
            return Err(WdtError::Aborted);
        }
        send_block(shared, &mut writer, &block, &mut buf, stats)?;
    }

    protocol::write_done(&mut writer, stats.blocks, stats.data_bytes)?;
    let ack = protocol::read_done_ack(&mut reader)?;
    if !ack.status.is_ok() {
        return Err(WdtError::Rejected(ack.status));
    }
    if ack.blocks != stats.blocks || ack.bytes != stats.data_bytes {
        return Err(WdtError::Protocol(format!(
            "receiver acknowledged {} blocks / {} bytes, sent {} / {}",
            ack.blocks, ack.bytes, stats.blocks, stats.data_bytes
        )));
    }
    Ok(())
}

fn send_block<W: Write>(
    shared: &SenderShared,
    writer: &mut W,
    block: &Block,
    buf: &mut [u8],
    stats: &mut TransferStats,
) -> Result<()> {
    // With checksums the range is hashed in a first pass so the digest can
    // lead the data.
    let digest = if shared.options.enable_checksum {
        Some(digest_block(block, buf)?)
    } else {
        None
    };

    let header = BlockHeader {
        path: block.file.relative_path.clone(),
        file_size: block.file.size,
        offset: block.offset,
        len: block.len,
        digest,
    };
    protocol::write_block_header(writer, &header)?;

    let mut file = block.open()?;
    let mut remaining = block.len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..n]).map_err(|e| block.read_error(e))?;
        write_chunk(shared, writer, &buf[..n])?;
        remaining -= n as u64;
    }

    stats.blocks += 1;
    stats.data_bytes += block.len;
    stats.header_bytes += header.encoded_len();
    if block.offset == 0 {
        stats.files += 1;
    }
    shared.counters.block_done();
    Ok(())
}

/// SHA-256 of the block's byte range, read through `buf`.
fn digest_block(block: &Block, buf: &mut [u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut file = block.open()?;
    let mut hasher = Sha256::new();
    let mut remaining = block.len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..n]).map_err(|e| block.read_error(e))?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

fn write_chunk<W: Write>(shared: &SenderShared, writer: &mut W, chunk: &[u8]) -> Result<()> {
    let Some(throttler) = &shared.throttler else {
        writer.write_all(chunk).map_err(WdtError::SocketWrite)?;
        shared.counters.add_bytes(chunk.len() as u64);
        return Ok(());
    };
    for piece in chunk.chunks(throttler.slice_bytes()) {
        let wait = throttler.claim(piece.len() as u64);
        if !wait.is_zero() {
            // Nothing buffered may sit out the sleep, or the receiver's read
            // timeout runs against it.
            writer.flush().map_err(WdtError::SocketWrite)?;
            std::thread::sleep(wait);
        }
        writer.write_all(piece).map_err(WdtError::SocketWrite)?;
        shared.counters.add_bytes(piece.len() as u64);
    }
    Ok(())
}
