//! Error types.

use thiserror::Error;

use crate::engine::EngineError;
use crate::stream::StreamId;

/// Errors that can occur in session operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host string could not be parsed as an IP address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Address has the wrong family for the requested conversion
    #[error("Address family mismatch: {0}")]
    AddressFamily(String),

    /// Transport parameters were tagged with a version we cannot read
    #[error("Unsupported transport parameters version: {0}")]
    UnsupportedParamsVersion(u32),

    /// Transport parameters buffer is shorter than the version's prefix
    #[error("Transport parameters too short: {0} bytes (expected {1})")]
    ParamsTooShort(usize, usize),

    /// Malformed packet or parameter encoding
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection-level failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Stream-level failure
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Failure reported by the protocol engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Endpoint id does not name a live endpoint
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(u64),

    /// Connection was already torn down and unregistered
    #[error("Connection no longer exists")]
    ConnectionGone,

    /// The event loop has stopped and can no longer run work
    #[error("Event loop stopped")]
    LoopStopped,

    /// Periodic timers need a non-zero interval
    #[error("Timer interval must be non-zero")]
    InvalidInterval,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Connection-level errors, surfaced once to the application when the
/// connection leaves the Active state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Cryptographic or version negotiation failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// No traffic within the negotiated idle timeout
    #[error("Idle timeout")]
    IdleTimeout,

    /// Peer sent a close
    #[error("Closed by peer: code={code}")]
    PeerClosed { code: u64, reason: Vec<u8> },

    /// Closed locally by the application
    #[error("Closed locally: code={code}")]
    LocallyClosed { code: u64, reason: Vec<u8> },

    /// Engine detected a protocol violation
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Endpoint shut down underneath the connection
    #[error("Endpoint closed")]
    EndpointClosed,
}

/// Stream-level errors. These never affect sibling streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Peer sent more data than the granted window allows
    #[error("Flow control violation on stream {id}: offset {offset} exceeds limit {limit}")]
    FlowControl { id: StreamId, offset: u64, limit: u64 },

    /// Peer (or local stop-sending handling) reset the stream
    #[error("Stream {id} reset: code={code}")]
    Reset { id: StreamId, code: u64 },

    /// Write after the local side finished or reset the stream
    #[error("Write after close on stream {0}")]
    WriteAfterClose(StreamId),

    /// Direction does not exist on this stream (e.g. reading a local uni stream)
    #[error("Stream {0} has no such direction")]
    WrongDirection(StreamId),

    /// Stream id was never opened
    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),

    /// Peer-declared final size conflicts with data already seen
    #[error("Final size error on stream {0}")]
    FinalSize(StreamId),
}

pub type Result<T> = std::result::Result<T, Error>;
