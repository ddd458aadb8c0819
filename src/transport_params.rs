//! Versioned transport parameters.
//!
//! Every version's byte layout is a strict prefix of the next version's
//! layout: fields are only ever appended. The prefix length of each shipped
//! version is recorded in [`VERSION_TABLE`] and must never change, since it
//! is the compatibility contract between library versions.
//!
//! Conversion never looks at the in-memory size of [`TransportParams`]; it
//! consults the table, so adding fields to the latest version is safe.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{ConnectionId, MAX_CID_LEN};

/// Shipped parameter layout versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamsVersion {
    V1 = 1,
    V2 = 2,
}

impl ParamsVersion {
    pub const LATEST: ParamsVersion = ParamsVersion::V2;

    pub fn from_u32(v: u32) -> Result<Self> {
        VERSION_TABLE
            .iter()
            .find(|(version, _)| *version as u32 == v)
            .map(|(version, _)| *version)
            .ok_or(Error::UnsupportedParamsVersion(v))
    }

    /// Number of leading bytes that make up this version's layout.
    pub fn prefix_len(self) -> usize {
        VERSION_TABLE
            .iter()
            .find(|(version, _)| *version == self)
            .map(|(_, len)| *len)
            .unwrap_or(LATEST_LEN)
    }
}

/// Encoded length of a connection ID slot: length byte plus a full-size body.
const CID_SLOT_LEN: usize = 1 + MAX_CID_LEN;

/// Prefix length of the V1 layout.
pub const V1_LEN: usize = 12 * 8 + (1 + 16) + 1 + 1 + 2 * CID_SLOT_LEN;

/// Prefix length of the V2 layout (V1 plus `min_ack_delay_us` and
/// `reliable_stream_reset`).
pub const V2_LEN: usize = V1_LEN + 8 + 1;

pub const LATEST_LEN: usize = V2_LEN;

/// Ordered (version, prefix length) schema. Append only.
pub const VERSION_TABLE: &[(ParamsVersion, usize)] =
    &[(ParamsVersion::V1, V1_LEN), (ParamsVersion::V2, V2_LEN)];

/// Latest-version transport parameters.
///
/// Field order here is the wire order; see [`TransportParams::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportParams {
    // ── V1 ───────────────────────────────────────────────────────────────
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout_ms: u64,
    pub max_udp_payload_size: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub active_connection_id_limit: u64,
    pub max_datagram_frame_size: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub disable_active_migration: bool,
    pub grease_quic_bit: bool,
    pub original_dcid: ConnectionId,
    pub initial_scid: ConnectionId,

    // ── V2 ───────────────────────────────────────────────────────────────
    pub min_ack_delay_us: u64,
    pub reliable_stream_reset: bool,
}

impl TransportParams {
    /// Encode in the latest layout. The result is exactly [`LATEST_LEN`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(LATEST_LEN);

        buf.put_u64(self.initial_max_stream_data_bidi_local);
        buf.put_u64(self.initial_max_stream_data_bidi_remote);
        buf.put_u64(self.initial_max_stream_data_uni);
        buf.put_u64(self.initial_max_data);
        buf.put_u64(self.initial_max_streams_bidi);
        buf.put_u64(self.initial_max_streams_uni);
        buf.put_u64(self.max_idle_timeout_ms);
        buf.put_u64(self.max_udp_payload_size);
        buf.put_u64(self.ack_delay_exponent);
        buf.put_u64(self.max_ack_delay_ms);
        buf.put_u64(self.active_connection_id_limit);
        buf.put_u64(self.max_datagram_frame_size);
        match self.stateless_reset_token {
            Some(token) => {
                buf.put_u8(1);
                buf.put_slice(&token);
            }
            None => {
                buf.put_u8(0);
                buf.put_bytes(0, 16);
            }
        }
        buf.put_u8(self.disable_active_migration as u8);
        buf.put_u8(self.grease_quic_bit as u8);
        put_cid_slot(&mut buf, &self.original_dcid);
        put_cid_slot(&mut buf, &self.initial_scid);
        debug_assert_eq!(buf.len(), V1_LEN);

        buf.put_u64(self.min_ack_delay_us);
        buf.put_u8(self.reliable_stream_reset as u8);
        debug_assert_eq!(buf.len(), LATEST_LEN);

        buf.to_vec()
    }

    /// Decode a full latest-layout buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LATEST_LEN {
            return Err(Error::ParamsTooShort(buf.len(), LATEST_LEN));
        }
        let mut cursor = std::io::Cursor::new(&buf[..LATEST_LEN]);

        let mut params = TransportParams {
            initial_max_stream_data_bidi_local: cursor.get_u64(),
            initial_max_stream_data_bidi_remote: cursor.get_u64(),
            initial_max_stream_data_uni: cursor.get_u64(),
            initial_max_data: cursor.get_u64(),
            initial_max_streams_bidi: cursor.get_u64(),
            initial_max_streams_uni: cursor.get_u64(),
            max_idle_timeout_ms: cursor.get_u64(),
            max_udp_payload_size: cursor.get_u64(),
            ack_delay_exponent: cursor.get_u64(),
            max_ack_delay_ms: cursor.get_u64(),
            active_connection_id_limit: cursor.get_u64(),
            max_datagram_frame_size: cursor.get_u64(),
            ..Default::default()
        };

        let token_present = cursor.get_u8() != 0;
        let mut token = [0u8; 16];
        cursor.copy_to_slice(&mut token);
        params.stateless_reset_token = token_present.then_some(token);
        params.disable_active_migration = cursor.get_u8() != 0;
        params.grease_quic_bit = cursor.get_u8() != 0;
        params.original_dcid = get_cid_slot(&mut cursor)?;
        params.initial_scid = get_cid_slot(&mut cursor)?;

        params.min_ack_delay_us = cursor.get_u64();
        params.reliable_stream_reset = cursor.get_u8() != 0;

        Ok(params)
    }

    /// Encode as `[version: u32][prefix bytes]` for exchange with a peer.
    pub fn encode_versioned(&self, version: ParamsVersion) -> Vec<u8> {
        let len = version.prefix_len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(version as u32);
        buf.put_slice(&self.encode()[..len]);
        buf.to_vec()
    }

    /// Decode a `[version][prefix]` buffer produced by any library version.
    ///
    /// Versions newer than [`ParamsVersion::LATEST`] are read through the
    /// latest known prefix; their trailing fields are ignored.
    pub fn decode_versioned(buf: &[u8]) -> Result<(u32, Self)> {
        if buf.len() < 4 {
            return Err(Error::ParamsTooShort(buf.len(), 4));
        }
        let mut header = &buf[..4];
        let raw_version = header.get_u32();
        let body = &buf[4..];

        let version = match ParamsVersion::from_u32(raw_version) {
            Ok(v) => v,
            Err(_) if raw_version > ParamsVersion::LATEST as u32 => ParamsVersion::LATEST,
            Err(e) => return Err(e),
        };
        Ok((raw_version, convert_to_latest(version, body)?))
    }
}

fn put_cid_slot(buf: &mut BytesMut, cid: &ConnectionId) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid.as_bytes());
    buf.put_bytes(0, MAX_CID_LEN - cid.len());
}

fn get_cid_slot(cursor: &mut std::io::Cursor<&[u8]>) -> Result<ConnectionId> {
    let len = cursor.get_u8() as usize;
    let mut body = [0u8; MAX_CID_LEN];
    cursor.copy_to_slice(&mut body);
    if len > MAX_CID_LEN {
        return Err(Error::Protocol(format!(
            "Transport parameter connection ID length {} exceeds {}",
            len, MAX_CID_LEN
        )));
    }
    ConnectionId::new(&body[..len])
}

/// Read a `version`-shaped buffer into the latest layout.
///
/// Exactly `version.prefix_len()` bytes are copied over a zeroed latest
/// buffer; fields added after `version` stay at zero.
///
/// The result is a decoded value, so the round trip through
/// [`convert_to_old`] is byte-exact for buffers in canonical encoder form.
/// Other buffers come back canonicalized: any non-zero flag byte reads as
/// `1`, and bytes after a connection id's length inside its slot read as
/// zero.
pub fn convert_to_latest(version: ParamsVersion, src: &[u8]) -> Result<TransportParams> {
    let len = version.prefix_len();
    if src.len() < len {
        return Err(Error::ParamsTooShort(src.len(), len));
    }
    let mut latest = [0u8; LATEST_LEN];
    latest[..len].copy_from_slice(&src[..len]);
    TransportParams::decode(&latest)
}

/// Write the `version`-shaped prefix of `src` into `dst`, discarding every
/// field newer than `version`. Returns the number of bytes written.
pub fn convert_to_old(version: ParamsVersion, dst: &mut [u8], src: &TransportParams) -> Result<usize> {
    let len = version.prefix_len();
    if dst.len() < len {
        return Err(Error::ParamsTooShort(dst.len(), len));
    }
    dst[..len].copy_from_slice(&src.encode()[..len]);
    Ok(len)
}
