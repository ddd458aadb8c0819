//! Interface to the external QUIC protocol engine.
//!
//! The session layer never builds or decrypts packets itself. It feeds
//! datagrams into a [`ProtocolEngine`], pulls datagrams back out, tells it
//! when its timer fired, and reacts to the [`EngineEvent`]s it reports.

use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::address::{Address, Path};
use crate::packet::ConnectionId;
use crate::stream::{Dir, StreamId};
use crate::transport_params::ParamsVersion;

/// Which side of the handshake a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }
}

/// A datagram the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Destination; `None` means the connection's current path.
    pub destination: Option<Address>,
    pub payload: Bytes,
}

impl Transmit {
    pub fn new(payload: Bytes) -> Self {
        Self {
            destination: None,
            payload,
        }
    }

    pub fn to(destination: Address, payload: Bytes) -> Self {
        Self {
            destination: Some(destination),
            payload,
        }
    }
}

/// Things the engine reports back after being driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    HandshakeCompleted,
    /// Peer's transport parameters in the peer's layout version
    RemoteTransportParams { version: u32, params: Bytes },
    StreamOpened { id: StreamId },
    StreamData {
        id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    StreamReset {
        id: StreamId,
        code: u64,
        final_size: u64,
    },
    StopSending { id: StreamId, code: u64 },
    /// Peer raised the send limit (absolute offset) for a stream
    StreamCredit { id: StreamId, max_offset: u64 },
    PathValidated { path: Path },
    PathValidationFailed { path: Path },
    NewConnectionId { cid: ConnectionId },
    RetireConnectionId { cid: ConnectionId },
    /// Peer closed the connection
    PeerClosed { code: u64, reason: Bytes },
    IdleTimeout,
}

/// Failures reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Packet could not be decrypted or parsed; drop it
    #[error("undecryptable packet")]
    Undecryptable,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("stream limit reached")]
    StreamLimit,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// The per-connection QUIC state machine.
///
/// Driven exclusively from the owning network's loop thread, so it need not
/// be `Send`.
pub trait ProtocolEngine {
    fn handle_datagram(&mut self, now: Instant, path: &Path, payload: &[u8]) -> Result<(), EngineError>;

    fn poll_transmit(&mut self, now: Instant) -> Option<Transmit>;

    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) must run.
    fn next_timeout(&self) -> Option<Instant>;

    fn handle_timeout(&mut self, now: Instant) -> Result<(), EngineError>;

    fn open_stream(&mut self, dir: Dir) -> Result<StreamId, EngineError>;

    /// Queue stream bytes; returns how many were accepted.
    fn write_stream(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, EngineError>;

    fn reset_stream(&mut self, id: StreamId, code: u64) -> Result<(), EngineError>;

    fn stop_sending(&mut self, id: StreamId, code: u64) -> Result<(), EngineError>;

    /// The application consumed `bytes` more from the stream; extend the
    /// peer's send window accordingly.
    fn extend_stream_window(&mut self, id: StreamId, bytes: u64);

    /// Send a path challenge on `path`; the outcome arrives as
    /// [`EngineEvent::PathValidated`] or [`EngineEvent::PathValidationFailed`].
    fn validate_path(&mut self, now: Instant, path: &Path) -> Result<(), EngineError>;

    fn close(&mut self, now: Instant, code: u64, reason: &[u8]);
}

/// Everything an engine needs to start a connection.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub side: Side,
    pub path: Path,
    /// Connection ID we issued and route on
    pub local_cid: ConnectionId,
    /// Connection ID the peer routes on (initially chosen by the client)
    pub remote_cid: ConnectionId,
    /// Destination ID of the client's first Initial
    pub original_dcid: ConnectionId,
    /// Local transport parameters, in `params_version` layout
    pub transport_params: Vec<u8>,
    pub params_version: ParamsVersion,
}

/// Creates engines for new connections. Shared across threads.
pub trait EngineFactory: Send + Sync {
    /// Layout version of transport parameters this engine build speaks.
    fn params_version(&self) -> ParamsVersion {
        ParamsVersion::LATEST
    }

    fn connect(&self, ctx: &HandshakeContext) -> Result<Box<dyn ProtocolEngine>, EngineError>;

    /// Validate an inbound Initial and build a server-side engine for it.
    fn accept(&self, ctx: &HandshakeContext, initial: &[u8]) -> Result<Box<dyn ProtocolEngine>, EngineError>;
}
