/// Structured logging for transfer sessions.
///
/// Sessions report lifecycle and per-block events through a `TransferLogger`
/// so embedders can route them somewhere other than `tracing` (or drop them).

use std::fmt;

use crate::error::ErrorCode;

/// Structured log entry for one session event.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub identity: String,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Receiver: listening sockets bound
    PortsBound { ports: Vec<u16> },
    /// Connection established on a port
    Connected { port: u16, attempts: u32 },
    /// All attempts on a port exhausted
    ConnectFailed { port: u16, attempts: u32 },
    /// Receiver: port not used by the sender, accept stopped
    PortUnused { port: u16 },
    /// Handshake rejected by the receiver
    HandshakeRejected { port: u16, status: ErrorCode },
    /// Sender: source tree enumerated
    SourceEnumerated { files: usize, blocks: usize, bytes: u64 },
    /// One block moved over a connection
    BlockTransferred { port: u16, path: String, offset: u64, len: u64 },
    /// Connection finished
    ConnectionDone { port: u16, status: ErrorCode, blocks: u64, bytes: u64 },
    /// Session finished
    TransferComplete { status: ErrorCode, bytes: u64, duration_ms: u64 },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortsBound { ports } => write!(f, "ports_bound ports={:?}", ports),
            Self::Connected { port, attempts } => {
                write!(f, "connected port={} attempts={}", port, attempts)
            }
            Self::ConnectFailed { port, attempts } => {
                write!(f, "connect_failed port={} attempts={}", port, attempts)
            }
            Self::PortUnused { port } => write!(f, "port_unused port={}", port),
            Self::HandshakeRejected { port, status } => {
                write!(f, "handshake_rejected port={} status={}", port, status)
            }
            Self::SourceEnumerated { files, blocks, bytes } => {
                write!(f, "source_enumerated files={} blocks={} bytes={}", files, blocks, bytes)
            }
            Self::BlockTransferred { port, path, offset, len } => {
                write!(f, "block port={} path={} offset={} len={}", port, path, offset, len)
            }
            Self::ConnectionDone { port, status, blocks, bytes } => {
                write!(
                    f,
                    "connection_done port={} status={} blocks={} bytes={}",
                    port, status, blocks, bytes
                )
            }
            Self::TransferComplete { status, bytes, duration_ms } => {
                write!(
                    f,
                    "transfer_complete status={} bytes={} duration_ms={}",
                    status, bytes, duration_ms
                )
            }
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle, debug for per-block and per-attempt detail
        match &entry.event {
            TransferEvent::BlockTransferred { .. } | TransferEvent::PortUnused { .. } => {
                tracing::debug!(
                    component = entry.component,
                    identity = %entry.identity,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Error { .. } | TransferEvent::HandshakeRejected { .. } => {
                tracing::warn!(
                    component = entry.component,
                    identity = %entry.identity,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    identity = %entry.identity,
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
