/// Per-connection wire format.
///
/// ```text
/// handshake (sender → receiver)
///   [0..2]   Magic "WD"
///   [2]      Protocol version
///   [3]      Flags (bit 0: blocks carry a SHA-256 digest)
///   [4..6]   Identity length (u16 BE), then identity bytes (UTF-8)
///   [..]     Port count (u16 BE), then each connected receiver port (u16 BE)
///
/// handshake reply (receiver → sender)
///   [0x00][status]                     status = ErrorCode wire value
///
/// records (sender → receiver)
///   BLOCK [0x10][path_len u16][path][file_size u64][offset u64][len u64]
///         [sha256 32B, if flagged][len data bytes]
///   DONE  [0x12][blocks u64][bytes u64]
///
/// done ack (receiver → sender)
///   [0x11][status][blocks u64][bytes u64]
/// ```
///
/// All integers are big-endian. A connection carries exactly one handshake,
/// any number of BLOCK records and exactly one DONE.

use std::io::{Read, Write};

use crate::error::{ErrorCode, Result, WdtError};

pub const MAGIC: [u8; 2] = [0x57, 0x44]; // "WD"
pub const PROTOCOL_VERSION: u8 = 1;

pub const FLAG_CHECKSUM: u8 = 1 << 0;

pub const RECORD_BLOCK: u8 = 0x10;
pub const RECORD_DONE_ACK: u8 = 0x11;
pub const RECORD_DONE: u8 = 0x12;

const REPLY_MARKER: u8 = 0x00;

pub const MAX_IDENTITY_LEN: usize = 1024;
pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_PORTS: usize = 1024;

pub const DIGEST_LEN: usize = 32;

/// Fixed part of a BLOCK record after the path.
const BLOCK_FIXED_LEN: usize = 1 + 2 + 8 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub checksum: bool,
    pub identity: String,
    /// Receiver ports this sender holds a connection to.
    pub ports: Vec<u16>,
}

impl Handshake {
    pub fn new(identity: &str, ports: Vec<u16>, checksum: bool) -> Self {
        Handshake {
            version: PROTOCOL_VERSION,
            checksum,
            identity: identity.to_string(),
            ports,
        }
    }
}

/// Header of one BLOCK record; `len` data bytes follow on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub path: String,
    pub file_size: u64,
    pub offset: u64,
    pub len: u64,
    pub digest: Option<[u8; DIGEST_LEN]>,
}

impl BlockHeader {
    /// Bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> u64 {
        (BLOCK_FIXED_LEN + self.path.len() + self.digest.map_or(0, |_| DIGEST_LEN)) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Block(BlockHeader),
    Done { blocks: u64, bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneAck {
    pub status: ErrorCode,
    pub blocks: u64,
    pub bytes: u64,
}

pub fn write_handshake<W: Write>(w: &mut W, hs: &Handshake) -> Result<()> {
    if hs.identity.len() > MAX_IDENTITY_LEN {
        return Err(WdtError::Protocol(format!(
            "identity is {} bytes, limit {}",
            hs.identity.len(),
            MAX_IDENTITY_LEN
        )));
    }
    if hs.ports.len() > MAX_PORTS {
        return Err(WdtError::Protocol(format!("{} ports exceeds limit", hs.ports.len())));
    }

    let mut buf = Vec::with_capacity(8 + hs.identity.len() + 2 * hs.ports.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(hs.version);
    buf.push(if hs.checksum { FLAG_CHECKSUM } else { 0 });
    buf.extend_from_slice(&(hs.identity.len() as u16).to_be_bytes());
    buf.extend_from_slice(hs.identity.as_bytes());
    buf.extend_from_slice(&(hs.ports.len() as u16).to_be_bytes());
    for port in &hs.ports {
        buf.extend_from_slice(&port.to_be_bytes());
    }
    w.write_all(&buf).map_err(WdtError::SocketWrite)?;
    w.flush().map_err(WdtError::SocketWrite)
}

pub fn read_handshake<R: Read>(r: &mut R) -> Result<Handshake> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).map_err(WdtError::read)?;
    if head[0..2] != MAGIC {
        return Err(WdtError::Protocol(format!("bad magic {:02x}{:02x}", head[0], head[1])));
    }
    let version = head[2];
    if version != PROTOCOL_VERSION {
        return Err(WdtError::VersionMismatch {
            got: version,
            expected: PROTOCOL_VERSION,
        });
    }
    let checksum = head[3] & FLAG_CHECKSUM != 0;

    let identity = read_string(r, MAX_IDENTITY_LEN, "identity")?;

    let count = read_u16(r)? as usize;
    if count > MAX_PORTS {
        return Err(WdtError::Protocol(format!("{} ports exceeds limit", count)));
    }
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        ports.push(read_u16(r)?);
    }

    Ok(Handshake {
        version,
        checksum,
        identity,
        ports,
    })
}

pub fn write_reply<W: Write>(w: &mut W, status: ErrorCode) -> Result<()> {
    w.write_all(&[REPLY_MARKER, status.wire()])
        .map_err(WdtError::SocketWrite)?;
    w.flush().map_err(WdtError::SocketWrite)
}

pub fn read_reply<R: Read>(r: &mut R) -> Result<ErrorCode> {
    let mut reply = [0u8; 2];
    r.read_exact(&mut reply).map_err(WdtError::read)?;
    if reply[0] != REPLY_MARKER {
        return Err(WdtError::Protocol(format!("bad reply marker 0x{:02x}", reply[0])));
    }
    Ok(ErrorCode::from_wire(reply[1]))
}

/// Write a BLOCK header. The caller streams `header.len` data bytes next.
pub fn write_block_header<W: Write>(w: &mut W, header: &BlockHeader) -> Result<()> {
    if header.path.is_empty() || header.path.len() > MAX_PATH_LEN {
        return Err(WdtError::InvalidPath(header.path.clone()));
    }
    let mut buf = Vec::with_capacity(header.encoded_len() as usize);
    buf.push(RECORD_BLOCK);
    buf.extend_from_slice(&(header.path.len() as u16).to_be_bytes());
    buf.extend_from_slice(header.path.as_bytes());
    buf.extend_from_slice(&header.file_size.to_be_bytes());
    buf.extend_from_slice(&header.offset.to_be_bytes());
    buf.extend_from_slice(&header.len.to_be_bytes());
    if let Some(digest) = &header.digest {
        buf.extend_from_slice(digest);
    }
    w.write_all(&buf).map_err(WdtError::SocketWrite)
}

pub fn write_done<W: Write>(w: &mut W, blocks: u64, bytes: u64) -> Result<()> {
    let mut buf = [0u8; 17];
    buf[0] = RECORD_DONE;
    buf[1..9].copy_from_slice(&blocks.to_be_bytes());
    buf[9..17].copy_from_slice(&bytes.to_be_bytes());
    w.write_all(&buf).map_err(WdtError::SocketWrite)?;
    w.flush().map_err(WdtError::SocketWrite)
}

/// Read the next record header. `checksum` is the flag negotiated in the
/// handshake and decides whether BLOCK headers carry a digest.
pub fn read_record<R: Read>(r: &mut R, checksum: bool) -> Result<Record> {
    let mut kind = [0u8; 1];
    r.read_exact(&mut kind).map_err(WdtError::read)?;
    match kind[0] {
        RECORD_BLOCK => {
            let path = read_string(r, MAX_PATH_LEN, "path")?;
            if path.is_empty() {
                return Err(WdtError::InvalidPath(path));
            }
            let file_size = read_u64(r)?;
            let offset = read_u64(r)?;
            let len = read_u64(r)?;
            let end = offset
                .checked_add(len)
                .ok_or_else(|| WdtError::Protocol("block range overflows".into()))?;
            if end > file_size {
                return Err(WdtError::Protocol(format!(
                    "block {}+{} past end of {} ({} bytes)",
                    offset, len, path, file_size
                )));
            }
            let digest = if checksum {
                let mut d = [0u8; DIGEST_LEN];
                r.read_exact(&mut d).map_err(WdtError::read)?;
                Some(d)
            } else {
                None
            };
            Ok(Record::Block(BlockHeader {
                path,
                file_size,
                offset,
                len,
                digest,
            }))
        }
        RECORD_DONE => {
            let blocks = read_u64(r)?;
            let bytes = read_u64(r)?;
            Ok(Record::Done { blocks, bytes })
        }
        other => Err(WdtError::Protocol(format!("unknown record type 0x{:02x}", other))),
    }
}

pub fn write_done_ack<W: Write>(w: &mut W, ack: &DoneAck) -> Result<()> {
    let mut buf = [0u8; 18];
    buf[0] = RECORD_DONE_ACK;
    buf[1] = ack.status.wire();
    buf[2..10].copy_from_slice(&ack.blocks.to_be_bytes());
    buf[10..18].copy_from_slice(&ack.bytes.to_be_bytes());
    w.write_all(&buf).map_err(WdtError::SocketWrite)?;
    w.flush().map_err(WdtError::SocketWrite)
}

pub fn read_done_ack<R: Read>(r: &mut R) -> Result<DoneAck> {
    let mut buf = [0u8; 18];
    r.read_exact(&mut buf).map_err(WdtError::read)?;
    if buf[0] != RECORD_DONE_ACK {
        return Err(WdtError::Protocol(format!("expected done ack, got 0x{:02x}", buf[0])));
    }
    Ok(DoneAck {
        status: ErrorCode::from_wire(buf[1]),
        blocks: u64::from_be_bytes(buf[2..10].try_into().unwrap_or_default()),
        bytes: u64::from_be_bytes(buf[10..18].try_into().unwrap_or_default()),
    })
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).map_err(WdtError::read)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).map_err(WdtError::read)?;
    Ok(u64::from_be_bytes(b))
}

fn read_string<R: Read>(r: &mut R, limit: usize, what: &str) -> Result<String> {
    let len = read_u16(r)? as usize;
    if len > limit {
        return Err(WdtError::Protocol(format!("{} length {} exceeds {}", what, len, limit)));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).map_err(WdtError::read)?;
    String::from_utf8(bytes).map_err(|_| WdtError::Protocol(format!("{} is not UTF-8", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn handshake_layout() {
        let hs = Handshake::new("foo", vec![4000, 4001], true);
        let mut buf = Vec::new();
        write_handshake(&mut buf, &hs).unwrap();
        assert_eq!(&buf[0..2], b"WD");
        assert_eq!(buf[2], PROTOCOL_VERSION);
        assert_eq!(buf[3], FLAG_CHECKSUM);
        assert_eq!(&buf[4..6], &3u16.to_be_bytes());
        assert_eq!(&buf[6..9], b"foo");
        assert_eq!(buf.len(), 9 + 2 + 4);

        let parsed = read_handshake(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn reject_bad_magic() {
        let buf = vec![0xFF, 0xFF, PROTOCOL_VERSION, 0, 0, 0, 0, 0];
        let err = read_handshake(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn reject_other_version() {
        let buf = vec![0x57, 0x44, PROTOCOL_VERSION + 1, 0, 0, 0, 0, 0];
        let err = read_handshake(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionMismatch);
    }

    #[test]
    fn truncated_handshake_is_a_protocol_error() {
        let buf = vec![0x57, 0x44, PROTOCOL_VERSION, 0, 0, 9, b'a'];
        let err = read_handshake(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn block_then_done_stream() {
        let header = BlockHeader {
            path: "a/b.bin".into(),
            file_size: 10,
            offset: 4,
            len: 6,
            digest: Some([7u8; DIGEST_LEN]),
        };
        let mut buf = Vec::new();
        write_block_header(&mut buf, &header).unwrap();
        assert_eq!(buf.len() as u64, header.encoded_len());
        buf.extend_from_slice(b"abcdef");
        write_done(&mut buf, 1, 6).unwrap();

        let mut cur = Cursor::new(buf);
        match read_record(&mut cur, true).unwrap() {
            Record::Block(h) => assert_eq!(h, header),
            other => panic!("unexpected {:?}", other),
        }
        let mut data = [0u8; 6];
        cur.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"abcdef");
        assert_eq!(
            read_record(&mut cur, true).unwrap(),
            Record::Done { blocks: 1, bytes: 6 }
        );
    }

    #[test]
    fn block_past_end_of_file_rejected() {
        let header = BlockHeader {
            path: "x".into(),
            file_size: 10,
            offset: 8,
            len: 2,
            digest: None,
        };
        let mut buf = Vec::new();
        write_block_header(&mut buf, &header).unwrap();
        // Corrupt len to 3 so the block overruns the file.
        let len_at = buf.len() - 8;
        buf[len_at..].copy_from_slice(&3u64.to_be_bytes());
        let err = read_record(&mut Cursor::new(buf), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn unknown_record_type() {
        let err = read_record(&mut Cursor::new(vec![0x99]), false).unwrap_err();
        assert!(matches!(err, WdtError::Protocol(_)));
    }

    #[test]
    fn reply_and_ack_carry_status() {
        let mut buf = Vec::new();
        write_reply(&mut buf, ErrorCode::IdMismatch).unwrap();
        write_done_ack(
            &mut buf,
            &DoneAck {
                status: ErrorCode::Ok,
                blocks: 3,
                bytes: 99,
            },
        )
        .unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_reply(&mut cur).unwrap(), ErrorCode::IdMismatch);
        let ack = read_done_ack(&mut cur).unwrap();
        assert_eq!(ack.status, ErrorCode::Ok);
        assert_eq!((ack.blocks, ack.bytes), (3, 99));
    }
}
