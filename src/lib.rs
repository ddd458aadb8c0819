//! Session layer for a QUIC-class transport
//!
//! This crate owns everything around a QUIC protocol engine except the
//! protocol itself. It allows applications to:
//!
//! - Bind UDP endpoints (dual-stack by default) and route datagrams to
//!   connections by connection id
//! - Drive pluggable [`ProtocolEngine`]s: feed datagrams, send what they
//!   produce, keep one timer per connection
//! - Use flow-controlled bidirectional and unidirectional streams
//! - Interoperate with peers speaking older transport parameter layouts
//! - Follow a peer to a new path once the engine validated it
//!
//! # Architecture
//!
//! ```text
//! Application (any thread)
//!     ↓  Network / EndpointHandle / ConnectionHandle
//! loop thread (single-threaded event loop)
//!     ↓
//! Endpoint → Connection → Stream
//!     ↓             ↓
//! UDP socket    ProtocolEngine
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use quic_session::{Address, Dir, EndpointConfig, Network, ReadOutcome};
//!
//! fn main() -> quic_session::Result<()> {
//!     let network = Network::new()?;
//!     let endpoint = network.endpoint(Address::any(0), EndpointConfig::default(), my_engine_factory())?;
//!
//!     let conn = endpoint.connect(Address::new("192.0.2.7", 4433)?)?;
//!     let id = conn.open_stream(Dir::Bi)?;
//!     conn.write(id, b"ping")?;
//!     conn.finish(id)?;
//!
//!     if let ReadOutcome::Data(reply) = conn.read(id, 1024)? {
//!         println!("{} bytes back", reply.len());
//!     }
//!
//!     // Dropping the network closes every connection gracefully.
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod network;
pub mod packet;
pub mod stream;
pub mod transport_params;

// Re-export main types
pub use address::{Address, AddressFamily, Path};
pub use config::{ConnectionConfig, EndpointConfig, NetworkConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use endpoint::{ConnectionKey, EndpointId, EndpointStats};
pub use engine::{EngineError, EngineEvent, EngineFactory, HandshakeContext, ProtocolEngine, Side, Transmit};
pub use error::{ConnectionError, Error, Result, StreamError};
pub use event_loop::{EventLoop, LoopHandle, Ticker, TimerHandle};
pub use handle::{ConnectionHandle, EndpointHandle, Listener};
pub use network::{Network, NetworkState};
pub use packet::ConnectionId;
pub use stream::{Dir, ReadOutcome, Stream, StreamId, StreamState, WriteOutcome};
pub use transport_params::{convert_to_latest, convert_to_old, ParamsVersion, TransportParams};
