//! Application-facing handles.
//!
//! Handles hold no session state of their own: every operation is marshalled
//! onto the network's loop thread with `call_get` and runs there against the
//! endpoint or connection, looked up by id. Methods therefore block the
//! caller briefly and must not be called from the loop thread itself.

use std::time::Instant;

use tokio::sync::mpsc;

use crate::address::{Address, Path};
use crate::connection::{Connection, ConnectionEvent, ConnectionState, Transport};
use crate::endpoint::{ConnectionKey, EndpointId, EndpointStats};
use crate::engine::Side;
use crate::error::{ConnectionError, Error, Result};
use crate::event_loop::LoopHandle;
use crate::network::NetworkState;
use crate::stream::{Dir, ReadOutcome, StreamId, StreamState, WriteOutcome};
use crate::transport_params::TransportParams;

/// A bound endpoint. Cheap to clone.
#[derive(Clone)]
pub struct EndpointHandle {
    net: LoopHandle<NetworkState>,
    id: EndpointId,
    local: Address,
}

impl EndpointHandle {
    pub(crate) fn new(net: LoopHandle<NetworkState>, id: EndpointId, local: Address) -> Self {
        Self { net, id, local }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Bound address, with the real port if 0 was requested.
    pub fn local_addr(&self) -> Address {
        self.local
    }

    /// Start a client handshake with `remote`.
    pub fn connect(&self, remote: Address) -> Result<ConnectionHandle> {
        let id = self.id;
        self.net
            .call_get(move |net| net.endpoint_mut(id)?.connect(remote))?
    }

    /// Accept inbound connections on this endpoint.
    pub fn listen(&self) -> Result<Listener> {
        let id = self.id;
        let rx = self
            .net
            .call_get(move |net| net.endpoint_mut(id).map(|ep| ep.listen()))??;
        Ok(Listener {
            local: self.local,
            rx,
        })
    }

    pub fn stats(&self) -> Result<EndpointStats> {
        let id = self.id;
        self.net
            .call_get(move |net| net.endpoint_mut(id).map(|ep| ep.stats()))?
    }

    pub fn connection_count(&self) -> Result<usize> {
        let id = self.id;
        self.net
            .call_get(move |net| net.endpoint_mut(id).map(|ep| ep.connection_count()))?
    }

    /// Stop accepting and close every connection; the endpoint goes away
    /// once they have drained.
    pub fn close(&self) -> Result<()> {
        let id = self.id;
        self.net.call_get(move |net| net.close_endpoint(id))?
    }
}

/// Inbound connections of a listening endpoint.
pub struct Listener {
    local: Address,
    rx: mpsc::UnboundedReceiver<ConnectionHandle>,
}

impl Listener {
    pub fn local_addr(&self) -> Address {
        self.local
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> Result<ConnectionHandle> {
        self.rx
            .recv()
            .await
            .ok_or(Error::Connection(ConnectionError::EndpointClosed))
    }

    /// Blocking [`accept`](Self::accept). Not for use inside async code.
    pub fn blocking_accept(&mut self) -> Result<ConnectionHandle> {
        self.rx
            .blocking_recv()
            .ok_or(Error::Connection(ConnectionError::EndpointClosed))
    }

    pub fn try_accept(&mut self) -> Option<ConnectionHandle> {
        self.rx.try_recv().ok()
    }
}

/// One connection, as seen by the application.
///
/// Dropping the handle does not close the connection; call
/// [`close`](Self::close). Operations after the connection was torn down
/// fail with [`Error::ConnectionGone`].
pub struct ConnectionHandle {
    net: LoopHandle<NetworkState>,
    endpoint: EndpointId,
    key: ConnectionKey,
    side: Side,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.endpoint)
            .field("key", &self.key)
            .field("side", &self.side)
            .finish()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(
        net: LoopHandle<NetworkState>,
        endpoint: EndpointId,
        key: ConnectionKey,
        side: Side,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            net,
            endpoint,
            key,
            side,
            events,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn with<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, &mut dyn Transport) -> Result<R> + Send + 'static,
    {
        let (endpoint, key) = (self.endpoint, self.key);
        self.net
            .call_get(move |net| net.with_connection(endpoint, key, f))??
    }

    /// Like `with`, for operations naming a stream.
    ///
    /// # Panics
    ///
    /// If the stream was already destroyed, i.e. the application itself
    /// observed both of its directions ending.
    fn with_stream<R, F>(&self, id: StreamId, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, &mut dyn Transport) -> Result<R> + Send + 'static,
    {
        let outcome = self.with(move |conn, io| {
            if conn.is_destroyed(id) && conn.state() != ConnectionState::Closed {
                return Ok(None);
            }
            f(conn, io).map(Some)
        })?;
        match outcome {
            Some(result) => Ok(result),
            None => panic!("stream {} used after it was destroyed", id),
        }
    }

    pub fn state(&self) -> Result<ConnectionState> {
        self.with(|conn, _| Ok(conn.state()))
    }

    pub fn path(&self) -> Result<Path> {
        self.with(|conn, _| Ok(conn.path()))
    }

    /// Peer transport parameters, once the handshake delivered them.
    pub fn remote_params(&self) -> Result<Option<TransportParams>> {
        self.with(|conn, _| Ok(conn.remote_params().cloned()))
    }

    pub fn open_stream(&self, dir: Dir) -> Result<StreamId> {
        self.with(move |conn, _| conn.open_stream(dir))
    }

    /// Non-blocking write; see [`WriteOutcome`] for partial acceptance.
    pub fn write(&self, id: StreamId, data: &[u8]) -> Result<WriteOutcome> {
        let data = data.to_vec();
        self.with_stream(id, move |conn, io| conn.write(Instant::now(), id, &data, io))
    }

    /// Half-close the sending direction.
    pub fn finish(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, move |conn, io| conn.finish_stream(Instant::now(), id, io))
    }

    /// Non-blocking read of up to `max` contiguous bytes.
    pub fn read(&self, id: StreamId, max: usize) -> Result<ReadOutcome> {
        self.with_stream(id, move |conn, io| conn.read(Instant::now(), id, max, io))
    }

    /// Abort the sending direction with an application code.
    pub fn reset(&self, id: StreamId, code: u64) -> Result<()> {
        self.with_stream(id, move |conn, io| conn.reset_stream(Instant::now(), id, code, io))
    }

    /// Ask the peer to abort its sending direction.
    pub fn stop_sending(&self, id: StreamId, code: u64) -> Result<()> {
        self.with_stream(id, move |conn, io| conn.stop_sending(Instant::now(), id, code, io))
    }

    pub fn stream_state(&self, id: StreamId) -> Result<StreamState> {
        self.with_stream(id, move |conn, _| conn.stream_state(id))
    }

    pub fn send_credit(&self, id: StreamId) -> Result<u64> {
        self.with_stream(id, move |conn, _| conn.send_credit(id))
    }

    /// Close with an application code and reason, delivered to the peer
    /// verbatim.
    pub fn close(&self, code: u64, reason: &[u8]) -> Result<()> {
        let reason = reason.to_vec();
        self.with(move |conn, io| {
            conn.close(Instant::now(), code, &reason, io);
            Ok(())
        })
    }

    // ── events ────────────────────────────────────────────────────────────

    /// Next event; `None` once the connection is gone and all events were
    /// delivered.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Blocking [`next_event`](Self::next_event). Not for use inside async code.
    pub fn blocking_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.blocking_recv()
    }

    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }
}
