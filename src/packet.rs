//! Connection ids and the version-independent part of packet headers,
//! just enough to route a datagram.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;

use crate::error::{Error, Result};

/// Maximum connection ID length permitted by QUIC v1.
pub const MAX_CID_LEN: usize = 20;

/// Smallest datagram a client may use to carry an Initial packet.
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Header form bit (set for long headers)
pub const FORM_BIT: u8 = 0x80;

/// Fixed bit, set on every v1 packet unless greased
pub const FIXED_BIT: u8 = 0x40;

/// Opaque variable-length connection identifier.
///
/// Stored inline so it is `Copy` and cheap to use as a map key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Create from raw bytes; fails if longer than [`MAX_CID_LEN`].
    pub fn new(raw: &[u8]) -> Result<Self> {
        if raw.len() > MAX_CID_LEN {
            return Err(Error::Protocol(format!(
                "Connection ID too long: {} bytes (max {})",
                raw.len(),
                MAX_CID_LEN
            )));
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// Random ID of the given length (clamped to [`MAX_CID_LEN`]).
    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        rand::thread_rng().fill(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0u8; MAX_CID_LEN],
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Long header packet types (QUIC v1 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => LongType::Initial,
            1 => LongType::ZeroRtt,
            2 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }

    fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0,
            LongType::ZeroRtt => 1,
            LongType::Handshake => 2,
            LongType::Retry => 3,
        }
    }
}

/// The version-independent part of a packet header: just enough to route a
/// datagram to its connection. Everything past the connection IDs belongs to
/// the protocol engine.
///
/// Wire format:
/// ```text
/// long:  [1|F|type:2|xxxx][version: u32][dcid_len: u8][dcid][scid_len: u8][scid]...
/// short: [0|F|xxxxxx][dcid: local cid length]...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    /// Long header with version 0
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Short {
        dcid: ConnectionId,
    },
}

impl Header {
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Header::Long { dcid, .. }
            | Header::VersionNegotiation { dcid, .. }
            | Header::Short { dcid } => dcid,
        }
    }

    pub fn scid(&self) -> Option<&ConnectionId> {
        match self {
            Header::Long { scid, .. } | Header::VersionNegotiation { scid, .. } => Some(scid),
            Header::Short { .. } => None,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            Header::Long {
                ty: LongType::Initial,
                ..
            }
        )
    }

    /// Encode the routing portion of the header.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Header::Long {
                ty,
                version,
                dcid,
                scid,
            } => {
                buf.put_u8(FORM_BIT | FIXED_BIT | (ty.bits() << 4));
                buf.put_u32(*version);
                put_cid(buf, dcid);
                put_cid(buf, scid);
            }
            Header::VersionNegotiation { dcid, scid } => {
                buf.put_u8(FORM_BIT);
                buf.put_u32(0);
                put_cid(buf, dcid);
                put_cid(buf, scid);
            }
            Header::Short { dcid } => {
                buf.put_u8(FIXED_BIT);
                buf.put_slice(dcid.as_bytes());
            }
        }
    }

    /// Decode the routing portion of a header.
    ///
    /// `local_cid_len` is the length of connection IDs this endpoint issues;
    /// short headers carry no explicit length.
    pub fn decode(buf: &[u8], local_cid_len: usize) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);

        if !cursor.has_remaining() {
            return Err(Error::Protocol("Empty datagram".to_string()));
        }
        let first = cursor.get_u8();

        if first & FORM_BIT == 0 {
            if cursor.remaining() < local_cid_len {
                return Err(Error::Protocol(format!(
                    "Short header too short: {} bytes (expected at least {})",
                    buf.len(),
                    1 + local_cid_len
                )));
            }
            let dcid = ConnectionId::new(&buf[1..1 + local_cid_len])?;
            return Ok(Header::Short { dcid });
        }

        if cursor.remaining() < 4 {
            return Err(Error::Protocol("Long header truncated before version".to_string()));
        }
        let version = cursor.get_u32();
        let dcid = get_cid(&mut cursor)?;
        let scid = get_cid(&mut cursor)?;

        if version == 0 {
            return Ok(Header::VersionNegotiation { dcid, scid });
        }

        Ok(Header::Long {
            ty: LongType::from_bits(first >> 4),
            version,
            dcid,
            scid,
        })
    }
}

fn put_cid(buf: &mut BytesMut, cid: &ConnectionId) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid.as_bytes());
}

fn get_cid(cursor: &mut std::io::Cursor<&[u8]>) -> Result<ConnectionId> {
    if !cursor.has_remaining() {
        return Err(Error::Protocol("Truncated connection ID length".to_string()));
    }
    let len = cursor.get_u8() as usize;
    if len > MAX_CID_LEN {
        return Err(Error::Protocol(format!("Connection ID length {} exceeds {}", len, MAX_CID_LEN)));
    }
    if cursor.remaining() < len {
        return Err(Error::Protocol(format!(
            "Connection ID truncated: need {} bytes, {} available",
            len,
            cursor.remaining()
        )));
    }
    let start = cursor.position() as usize;
    let cid = ConnectionId::new(&cursor.get_ref()[start..start + len])?;
    cursor.advance(len);
    Ok(cid)
}
