/// Transfer outcome codes and the internal error type.
///
/// `ErrorCode` is what sessions and the facade hand back to callers. It is a
/// closed tag set with a total severity order so that outcomes reported by
/// many connections fold into one deterministic session result
/// (worst error wins). `WdtError` is the `Result` error used inside the crate;
/// every variant maps onto exactly one `ErrorCode`.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a transfer or of one of its connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    Ok,
    Error,
    Abort,
    ConnError,
    SocketReadError,
    SocketWriteError,
    ByteSourceReadError,
    FileWriteError,
    ProtocolError,
    VersionMismatch,
    IdMismatch,
    ChecksumMismatch,
    AlreadyExists,
}

impl ErrorCode {
    const ALL: [ErrorCode; 13] = [
        ErrorCode::Ok,
        ErrorCode::Error,
        ErrorCode::Abort,
        ErrorCode::ConnError,
        ErrorCode::SocketReadError,
        ErrorCode::SocketWriteError,
        ErrorCode::ByteSourceReadError,
        ErrorCode::FileWriteError,
        ErrorCode::ProtocolError,
        ErrorCode::VersionMismatch,
        ErrorCode::IdMismatch,
        ErrorCode::ChecksumMismatch,
        ErrorCode::AlreadyExists,
    ];

    /// Severity rank, higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Error => 1,
            ErrorCode::ProtocolError | ErrorCode::VersionMismatch | ErrorCode::IdMismatch => 2,
            ErrorCode::ChecksumMismatch => 3,
            ErrorCode::SocketReadError | ErrorCode::SocketWriteError => 4,
            ErrorCode::ByteSourceReadError | ErrorCode::FileWriteError => 5,
            ErrorCode::Abort => 6,
            ErrorCode::AlreadyExists => 7,
            ErrorCode::ConnError => 8,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Pick the more severe of two codes. Equal severities resolve to the
    /// code declared first, so the result never depends on argument order.
    pub fn worst(self, other: ErrorCode) -> ErrorCode {
        match self.severity().cmp(&other.severity()) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => {
                if self.wire() <= other.wire() {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// Fold any number of outcomes into one. An empty input is `Ok`.
    pub fn fold<I: IntoIterator<Item = ErrorCode>>(codes: I) -> ErrorCode {
        codes.into_iter().fold(ErrorCode::Ok, ErrorCode::worst)
    }

    /// Single-byte representation used on the wire.
    pub fn wire(self) -> u8 {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(1) as u8
    }

    /// Decode a wire byte. Unknown values map to `Error`.
    pub fn from_wire(b: u8) -> ErrorCode {
        Self::ALL.get(b as usize).copied().unwrap_or(ErrorCode::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Error => "ERROR",
            ErrorCode::Abort => "ABORT",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::SocketReadError => "SOCKET_READ_ERROR",
            ErrorCode::SocketWriteError => "SOCKET_WRITE_ERROR",
            ErrorCode::ByteSourceReadError => "BYTE_SOURCE_READ_ERROR",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::IdMismatch => "ID_MISMATCH",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal error type for fallible engine operations.
#[derive(Debug, Error)]
pub enum WdtError {
    #[error("cannot bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("connection to port {port} failed after {attempts} attempts")]
    ConnectionFailed { port: u16, attempts: u32 },

    #[error("socket read error: {0}")]
    SocketRead(io::Error),

    #[error("socket write error: {0}")]
    SocketWrite(io::Error),

    #[error("cannot read source {path}: {source}")]
    SourceRead { path: String, source: io::Error },

    #[error("cannot write {path}: {source}")]
    FileWrite { path: String, source: io::Error },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u8, expected: u8 },

    #[error("transfer identity mismatch: got {got:?}, expected {expected:?}")]
    IdMismatch { got: String, expected: String },

    #[error("checksum mismatch for {path} at offset {offset}")]
    ChecksumMismatch { path: String, offset: u64 },

    #[error("invalid path in transfer: {0}")]
    InvalidPath(String),

    #[error("{0} is already in use by another transfer")]
    AlreadyExists(String),

    #[error("peer rejected transfer: {0}")]
    Rejected(ErrorCode),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer aborted")]
    Aborted,
}

impl WdtError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WdtError::Bind { .. } | WdtError::ConnectionFailed { .. } => ErrorCode::ConnError,
            WdtError::SocketRead(_) => ErrorCode::SocketReadError,
            WdtError::SocketWrite(_) => ErrorCode::SocketWriteError,
            WdtError::SourceRead { .. } => ErrorCode::ByteSourceReadError,
            WdtError::FileWrite { .. } => ErrorCode::FileWriteError,
            WdtError::Protocol(_) | WdtError::InvalidPath(_) => ErrorCode::ProtocolError,
            WdtError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            WdtError::IdMismatch { .. } => ErrorCode::IdMismatch,
            WdtError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            WdtError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            WdtError::Rejected(code) => *code,
            WdtError::Config(_) => ErrorCode::Error,
            WdtError::Aborted => ErrorCode::Abort,
        }
    }

    /// Map a read-side io error, keeping premature EOF distinguishable.
    pub(crate) fn read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WdtError::Protocol("connection closed mid-record".into())
        } else {
            WdtError::SocketRead(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, WdtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_error_beats_everything() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::ConnError.worst(code), ErrorCode::ConnError);
            assert_eq!(code.worst(ErrorCode::ConnError), ErrorCode::ConnError);
        }
    }

    #[test]
    fn worst_is_order_independent() {
        for a in ErrorCode::ALL {
            for b in ErrorCode::ALL {
                assert_eq!(a.worst(b), b.worst(a), "{a} vs {b}");
            }
        }
        let forward = ErrorCode::fold([
            ErrorCode::Ok,
            ErrorCode::SocketReadError,
            ErrorCode::SocketWriteError,
            ErrorCode::ProtocolError,
        ]);
        let backward = ErrorCode::fold([
            ErrorCode::ProtocolError,
            ErrorCode::SocketWriteError,
            ErrorCode::SocketReadError,
            ErrorCode::Ok,
        ]);
        assert_eq!(forward, backward);
        assert_eq!(forward, ErrorCode::SocketReadError);
    }

    #[test]
    fn fold_of_nothing_is_ok() {
        assert_eq!(ErrorCode::fold([]), ErrorCode::Ok);
    }

    #[test]
    fn wire_values_are_stable() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_wire(code.wire()), code);
        }
        assert_eq!(ErrorCode::Ok.wire(), 0);
        assert_eq!(ErrorCode::from_wire(200), ErrorCode::Error);
    }

    #[test]
    fn errors_map_to_codes() {
        let e = WdtError::ConnectionFailed { port: 1, attempts: 3 };
        assert_eq!(e.code(), ErrorCode::ConnError);
        let e = WdtError::read(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(e.code(), ErrorCode::ProtocolError);
        let e = WdtError::read(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(e.code(), ErrorCode::SocketReadError);
        assert_eq!(WdtError::Rejected(ErrorCode::IdMismatch).code(), ErrorCode::IdMismatch);
    }
}
