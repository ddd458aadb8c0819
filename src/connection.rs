//! Per-connection state machine driving a [`ProtocolEngine`].
//!
//! A connection never touches a socket. Outbound datagrams and its single
//! timer go through the [`Transport`] its endpoint lends it.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::address::{Address, Path};
use crate::config::ConnectionConfig;
use crate::engine::{EngineError, EngineEvent, ProtocolEngine, Side};
use crate::error::{ConnectionError, Error, Result, StreamError};
use crate::event_loop::TimerHandle;
use crate::packet::ConnectionId;
use crate::stream::{Dir, ReadOutcome, Stream, StreamId, StreamState, WriteOutcome};
use crate::transport_params::{convert_to_latest, ParamsVersion, TransportParams};

/// Application error code used when a stream is aborted for a flow-control violation
pub const FLOW_CONTROL_ERROR: u64 = 0x3;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// Notifications delivered to the application, in occurrence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    /// Peer opened a stream
    StreamOpened(StreamId),
    /// New contiguous data (or EOF) can be read
    StreamReadable(StreamId),
    /// Peer granted more send credit
    StreamWritable(StreamId),
    /// Peer aborted its sending direction
    StreamReset { id: StreamId, code: u64 },
    /// Peer asked us to stop sending; our sending direction was reset
    StreamStopped { id: StreamId, code: u64 },
    /// Path validation succeeded and traffic now uses `Path`
    PathMigrated(Path),
    /// Terminal; delivered exactly once
    Closed(ConnectionError),
}

/// Changes the owning endpoint must apply to its routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    NewConnectionId(ConnectionId),
    RetireConnectionId(ConnectionId),
    /// Unregister every id of this connection and drop it
    Closed,
}

/// What a connection needs from its endpoint while being driven.
pub trait Transport {
    fn send(&mut self, destination: Address, payload: Bytes);

    /// Schedule [`Connection::handle_timeout`] at `deadline`.
    fn arm_timer(&mut self, deadline: Instant) -> Option<TimerHandle>;
}

/// Per-peer session wrapping one protocol engine.
///
/// Owned by its endpoint and driven only on the loop thread.
pub struct Connection {
    side: Side,
    state: ConnectionState,

    /// Path all traffic currently uses
    path: Path,

    /// Candidate path under validation; never used for sending
    pending_path: Option<Path>,

    /// Locally issued ids the endpoint routes to us
    local_cids: Vec<ConnectionId>,

    engine: Box<dyn ProtocolEngine>,

    streams: BTreeMap<StreamId, Stream>,

    /// Next unused index per stream kind; ids below it that are missing
    /// from `streams` have been destroyed
    next_index: [u64; 4],

    config: ConnectionConfig,
    local_params: TransportParams,
    params_version: ParamsVersion,
    remote_params: Option<TransportParams>,

    /// The one outstanding timer, with its deadline
    timer: Option<(Instant, TimerHandle)>,

    drain_deadline: Option<Instant>,

    /// Set once `Closed` has been delivered
    close_reason: Option<ConnectionError>,

    events: mpsc::UnboundedSender<ConnectionEvent>,
    endpoint_events: VecDeque<EndpointEvent>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: Side,
        path: Path,
        local_cid: ConnectionId,
        engine: Box<dyn ProtocolEngine>,
        config: ConnectionConfig,
        params_version: ParamsVersion,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        debug!("New {:?} connection on {} (cid {})", side, path, local_cid);
        let local_params = config.transport_params();
        Self {
            side,
            state: ConnectionState::Handshaking,
            path,
            pending_path: None,
            local_cids: vec![local_cid],
            engine,
            streams: BTreeMap::new(),
            next_index: [0; 4],
            config,
            local_params,
            params_version,
            remote_params: None,
            timer: None,
            drain_deadline: None,
            close_reason: None,
            events,
            endpoint_events: VecDeque::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn path(&self) -> Path {
        self.path
    }

    pub fn local_cids(&self) -> &[ConnectionId] {
        &self.local_cids
    }

    /// Peer parameters, converted to the latest layout.
    pub fn remote_params(&self) -> Option<&TransportParams> {
        self.remote_params.as_ref()
    }

    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.close_reason.as_ref()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn poll_endpoint_event(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front()
    }

    // ── driving ───────────────────────────────────────────────────────────

    /// Feed one datagram observed on `path`.
    ///
    /// Returns `false` if the engine rejected it as undecryptable.
    pub fn handle_datagram(&mut self, now: Instant, path: Path, payload: &[u8], io: &mut dyn Transport) -> bool {
        match self.state {
            ConnectionState::Closed => return true,
            ConnectionState::Handshaking if path != self.path => {
                trace!("Dropping datagram from {} during handshake on {}", path, self.path);
                return true;
            }
            ConnectionState::Active if path != self.path => {
                if !self.consider_new_path(now, path) {
                    return true;
                }
            }
            _ => {}
        }

        match self.engine.handle_datagram(now, &path, payload) {
            Ok(()) => {}
            Err(EngineError::Undecryptable) => {
                trace!("Undecryptable datagram on {}", path);
                return false;
            }
            Err(e) => self.fail(now, e),
        }

        self.process_events(now);
        self.flush(now, io);
        true
    }

    /// The armed timer fired.
    pub fn handle_timeout(&mut self, now: Instant, io: &mut dyn Transport) {
        self.timer = None;
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Draining if self.drain_deadline.is_some_and(|d| d <= now) => {
                let reason = self.close_reason.clone().unwrap_or(ConnectionError::IdleTimeout);
                self.finish(reason);
                return;
            }
            _ => {}
        }

        if self.engine.next_timeout().is_some_and(|t| t <= now) {
            if let Err(e) = self.engine.handle_timeout(now) {
                self.fail(now, e);
            }
        }
        self.process_events(now);
        self.flush(now, io);
    }

    /// Push buffered stream data into the engine, send whatever it produces
    /// and re-arm the timer.
    pub fn flush(&mut self, now: Instant, io: &mut dyn Transport) {
        if self.state == ConnectionState::Closed {
            return;
        }

        for (id, stream) in self.streams.iter_mut() {
            while let Some((chunk, fin)) = stream.outbound_chunk() {
                match self.engine.write_stream(*id, &chunk, fin) {
                    Ok(n) => {
                        let whole = n == chunk.len();
                        stream.consume_outbound(n, fin && whole);
                        if !whole {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Engine refused data on stream {}: {}", id, e);
                        break;
                    }
                }
            }
        }

        while let Some(transmit) = self.engine.poll_transmit(now) {
            let destination = transmit.destination.unwrap_or(self.path.remote);
            io.send(destination, transmit.payload);
        }

        self.rearm(io);
    }

    /// Keep exactly one timer armed for the earliest pending deadline.
    fn rearm(&mut self, io: &mut dyn Transport) {
        let deadline = match (self.engine.next_timeout(), self.drain_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if let Some((armed, handle)) = &self.timer {
            if Some(*armed) == deadline {
                return;
            }
            handle.cancel();
        }
        self.timer = deadline.and_then(|d| io.arm_timer(d).map(|handle| (d, handle)));
    }

    /// Start validating a path the peer appeared on. Returns whether the
    /// datagram should still be processed.
    fn consider_new_path(&mut self, now: Instant, path: Path) -> bool {
        if self.local_params.disable_active_migration {
            trace!("Migration disabled; dropping datagram from {}", path);
            return false;
        }
        if self.pending_path == Some(path) {
            return true;
        }
        debug!("Path change {} -> {}, validating", self.path, path);
        match self.engine.validate_path(now, &path) {
            Ok(()) => self.pending_path = Some(path),
            Err(e) => warn!("Could not start validation of {}: {}", path, e),
        }
        true
    }

    fn process_events(&mut self, now: Instant) {
        while let Some(event) = self.engine.poll_event() {
            self.on_engine_event(now, event);
        }
        self.reap_streams();
    }

    fn on_engine_event(&mut self, now: Instant, event: EngineEvent) {
        trace!("Engine event: {:?}", event);
        match event {
            EngineEvent::HandshakeCompleted => {
                if self.state == ConnectionState::Handshaking {
                    self.state = ConnectionState::Active;
                    debug!("Connection established on {}", self.path);
                    self.emit(ConnectionEvent::Established);
                }
            }
            EngineEvent::RemoteTransportParams { version, params } => {
                self.negotiate_params(now, version, &params);
            }
            EngineEvent::StreamOpened { id } => {
                self.peer_stream(id);
            }
            EngineEvent::StreamData {
                id,
                offset,
                data,
                fin,
            } => {
                let Some(stream) = self.peer_stream(id) else {
                    return;
                };
                match stream.receive(offset, data, fin) {
                    Ok(true) => self.emit(ConnectionEvent::StreamReadable(id)),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Stream {} receive error: {}", id, e);
                        stream.fail_recv(FLOW_CONTROL_ERROR, e);
                        if let Err(e) = self.engine.stop_sending(id, FLOW_CONTROL_ERROR) {
                            trace!("stop_sending on {} failed: {}", id, e);
                        }
                        self.emit(ConnectionEvent::StreamReset {
                            id,
                            code: FLOW_CONTROL_ERROR,
                        });
                    }
                }
            }
            EngineEvent::StreamReset { id, code, .. } => {
                if let Some(stream) = self.peer_stream(id) {
                    if stream.on_reset(code) {
                        self.emit(ConnectionEvent::StreamReset { id, code });
                    }
                }
            }
            EngineEvent::StopSending { id, code } => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    if stream.on_stop_sending(code) {
                        if let Err(e) = self.engine.reset_stream(id, code) {
                            trace!("reset_stream on {} failed: {}", id, e);
                        }
                        self.emit(ConnectionEvent::StreamStopped { id, code });
                    }
                }
            }
            EngineEvent::StreamCredit { id, max_offset } => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    if stream.grant_credit(max_offset) {
                        self.emit(ConnectionEvent::StreamWritable(id));
                    }
                }
            }
            EngineEvent::PathValidated { path } => {
                if self.pending_path == Some(path) {
                    debug!("Path validated, migrating {} -> {}", self.path, path);
                    self.path = path;
                    self.pending_path = None;
                    self.emit(ConnectionEvent::PathMigrated(path));
                }
            }
            EngineEvent::PathValidationFailed { path } => {
                if self.pending_path == Some(path) {
                    warn!("Path validation failed for {}; staying on {}", path, self.path);
                    self.pending_path = None;
                }
            }
            EngineEvent::NewConnectionId { cid } => {
                if !self.local_cids.contains(&cid) {
                    self.local_cids.push(cid);
                    self.endpoint_events.push_back(EndpointEvent::NewConnectionId(cid));
                }
            }
            EngineEvent::RetireConnectionId { cid } => {
                if self.local_cids.len() > 1 && self.local_cids.contains(&cid) {
                    self.local_cids.retain(|c| *c != cid);
                    self.endpoint_events.push_back(EndpointEvent::RetireConnectionId(cid));
                }
            }
            EngineEvent::PeerClosed { code, reason } => {
                debug!("Peer closed connection: code={}", code);
                self.drain(
                    now,
                    ConnectionError::PeerClosed {
                        code,
                        reason: reason.to_vec(),
                    },
                );
            }
            EngineEvent::IdleTimeout => {
                debug!("Idle timeout on {}", self.path);
                self.finish(ConnectionError::IdleTimeout);
            }
        }
    }

    fn negotiate_params(&mut self, now: Instant, version: u32, params: &[u8]) {
        let layout = match ParamsVersion::from_u32(version) {
            Ok(v) => v,
            // A newer peer's layout starts with ours.
            Err(_) if version > ParamsVersion::LATEST as u32 => ParamsVersion::LATEST,
            Err(e) => {
                self.fail(now, EngineError::Handshake(e.to_string()));
                return;
            }
        };

        let remote = match convert_to_latest(layout, params) {
            Ok(remote) => remote,
            Err(e) => {
                self.fail(now, EngineError::Handshake(e.to_string()));
                return;
            }
        };
        debug!(
            "Negotiated transport parameters: peer v{}, local v{}",
            version, self.params_version as u32
        );

        for (id, stream) in self.streams.iter_mut() {
            let (send_max, _) = stream_limits(self.side, *id, &self.local_params, Some(&remote));
            stream.grant_credit(send_max);
        }
        self.remote_params = Some(remote);
    }

    /// Look up a peer-referenced stream, creating it on first reference.
    fn peer_stream(&mut self, id: StreamId) -> Option<&mut Stream> {
        if !self.streams.contains_key(&id) {
            if self.is_destroyed(id) {
                trace!("Ignoring frame for destroyed stream {}", id);
                return None;
            }
            if id.initiator() == self.side {
                warn!("Peer referenced unopened local stream {}", id);
                return None;
            }
            self.insert_stream(id);
            debug!("Peer opened stream {}", id);
            self.emit(ConnectionEvent::StreamOpened(id));
        }
        self.streams.get_mut(&id)
    }

    fn insert_stream(&mut self, id: StreamId) {
        let (send_max, recv_max) =
            stream_limits(self.side, id, &self.local_params, self.remote_params.as_ref());
        let next = &mut self.next_index[id.kind()];
        *next = (*next).max(id.index() + 1);
        self.streams.insert(id, Stream::new(id, self.side, send_max, recv_max));
    }

    fn reap_streams(&mut self) {
        self.streams.retain(|id, stream| {
            let keep = !stream.is_reapable();
            if !keep {
                trace!("Stream {} destroyed", id);
            }
            keep
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // The application may have dropped its handle; that is fine.
        let _ = self.events.send(event);
    }

    // ── closing ───────────────────────────────────────────────────────────

    fn fail(&mut self, now: Instant, err: EngineError) {
        let reason = match err {
            EngineError::Handshake(msg) => ConnectionError::HandshakeFailed(msg),
            other => ConnectionError::ProtocolViolation(other.to_string()),
        };
        warn!("Connection failed: {}", reason);
        self.engine.close(now, 0, b"");
        self.drain(now, reason);
    }

    fn drain(&mut self, now: Instant, reason: ConnectionError) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Draining;
        self.drain_deadline = Some(now + self.config.drain_linger());
        self.report(reason);
    }

    fn finish(&mut self, reason: ConnectionError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.report(reason);
        for stream in self.streams.values_mut() {
            stream.force_close();
        }
        self.pending_path = None;
        if let Some((_, handle)) = self.timer.take() {
            handle.cancel();
        }
        debug!("Connection on {} closed", self.path);
        self.endpoint_events.push_back(EndpointEvent::Closed);
    }

    fn report(&mut self, reason: ConnectionError) {
        if self.close_reason.is_none() {
            self.emit(ConnectionEvent::Closed(reason.clone()));
            self.close_reason = Some(reason);
        }
    }

    /// Application-initiated close; the code and reason go to the peer verbatim.
    pub fn close(&mut self, now: Instant, code: u64, reason: &[u8], io: &mut dyn Transport) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        debug!("Closing connection on {}: code={}", self.path, code);
        self.engine.close(now, code, reason);
        self.drain(
            now,
            ConnectionError::LocallyClosed {
                code,
                reason: reason.to_vec(),
            },
        );
        self.flush(now, io);
    }

    /// Immediate teardown, without waiting out the drain period.
    pub fn abort(&mut self, reason: ConnectionError) {
        self.finish(reason);
    }

    // ── application operations ────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Handshaking | ConnectionState::Active => Ok(()),
            _ => Err(Error::Connection(
                self.close_reason.clone().unwrap_or(ConnectionError::EndpointClosed),
            )),
        }
    }

    /// The id was in use and its stream has been destroyed.
    pub fn is_destroyed(&self, id: StreamId) -> bool {
        !self.streams.contains_key(&id) && id.index() < self.next_index[id.kind()]
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.streams
            .get_mut(&id)
            .ok_or(Error::Stream(StreamError::UnknownStream(id)))
    }

    pub fn open_stream(&mut self, dir: Dir) -> Result<StreamId> {
        self.ensure_open()?;
        let id = self.engine.open_stream(dir)?;
        self.insert_stream(id);
        debug!("Opened {:?} stream {}", dir, id);
        Ok(id)
    }

    pub fn write(&mut self, now: Instant, id: StreamId, data: &[u8], io: &mut dyn Transport) -> Result<WriteOutcome> {
        self.ensure_open()?;
        let outcome = self.stream_mut(id)?.write(data);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reap_streams();
                return Err(Error::from(e));
            }
        };
        if outcome.accepted > 0 {
            self.flush(now, io);
        }
        Ok(outcome)
    }

    pub fn finish_stream(&mut self, now: Instant, id: StreamId, io: &mut dyn Transport) -> Result<()> {
        self.ensure_open()?;
        let finished = self.stream_mut(id)?.finish();
        if finished.is_ok() {
            self.flush(now, io);
        }
        self.reap_streams();
        finished.map_err(Error::from)
    }

    pub fn read(&mut self, now: Instant, id: StreamId, max: usize, io: &mut dyn Transport) -> Result<ReadOutcome> {
        let outcome = self.stream_mut(id)?.read(max);
        if let Ok(ReadOutcome::Data(data)) = &outcome {
            self.engine.extend_stream_window(id, data.len() as u64);
            self.flush(now, io);
        }
        self.reap_streams();
        Ok(outcome?)
    }

    pub fn reset_stream(&mut self, now: Instant, id: StreamId, code: u64, io: &mut dyn Transport) -> Result<()> {
        if self.stream_mut(id)?.reset_send(code) {
            self.engine.reset_stream(id, code)?;
            self.flush(now, io);
        }
        self.reap_streams();
        Ok(())
    }

    pub fn stop_sending(&mut self, now: Instant, id: StreamId, code: u64, io: &mut dyn Transport) -> Result<()> {
        if self.stream_mut(id)?.stop_recv(code) {
            self.engine.stop_sending(id, code)?;
            self.flush(now, io);
        }
        self.reap_streams();
        Ok(())
    }

    pub fn stream_state(&self, id: StreamId) -> Result<StreamState> {
        self.streams
            .get(&id)
            .map(Stream::state)
            .ok_or(Error::Stream(StreamError::UnknownStream(id)))
    }

    pub fn send_credit(&self, id: StreamId) -> Result<u64> {
        self.streams
            .get(&id)
            .map(Stream::send_credit)
            .ok_or(Error::Stream(StreamError::UnknownStream(id)))
    }
}

/// (send limit, receive limit) for a new stream.
fn stream_limits(
    side: Side,
    id: StreamId,
    local: &TransportParams,
    remote: Option<&TransportParams>,
) -> (u64, u64) {
    let locally_initiated = id.initiator() == side;
    match (id.dir(), locally_initiated) {
        (Dir::Bi, true) => (
            remote.map_or(0, |p| p.initial_max_stream_data_bidi_remote),
            local.initial_max_stream_data_bidi_local,
        ),
        (Dir::Bi, false) => (
            remote.map_or(0, |p| p.initial_max_stream_data_bidi_local),
            local.initial_max_stream_data_bidi_remote,
        ),
        (Dir::Uni, true) => (remote.map_or(0, |p| p.initial_max_stream_data_uni), 0),
        (Dir::Uni, false) => (0, local.initial_max_stream_data_uni),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Transmit;
    use crate::transport_params::convert_to_old;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct MockState {
        events: VecDeque<EngineEvent>,
        transmits: VecDeque<Transmit>,
        next_timeout: Option<Instant>,
        validated: Vec<Path>,
        written: Vec<(StreamId, Vec<u8>, bool)>,
        extended: Vec<(StreamId, u64)>,
        closed: Option<u64>,
        next_stream: u64,
        timeouts_handled: usize,
    }

    struct MockEngine(Rc<RefCell<MockState>>);

    impl ProtocolEngine for MockEngine {
        fn handle_datagram(&mut self, _now: Instant, _path: &Path, payload: &[u8]) -> std::result::Result<(), EngineError> {
            if payload == b"garbage" {
                return Err(EngineError::Undecryptable);
            }
            self.0.borrow_mut().transmits.push_back(Transmit::new(Bytes::from_static(b"ack")));
            Ok(())
        }
        fn poll_transmit(&mut self, _now: Instant) -> Option<Transmit> {
            self.0.borrow_mut().transmits.pop_front()
        }
        fn poll_event(&mut self) -> Option<EngineEvent> {
            self.0.borrow_mut().events.pop_front()
        }
        fn next_timeout(&self) -> Option<Instant> {
            self.0.borrow().next_timeout
        }
        fn handle_timeout(&mut self, _now: Instant) -> std::result::Result<(), EngineError> {
            self.0.borrow_mut().timeouts_handled += 1;
            Ok(())
        }
        fn open_stream(&mut self, dir: Dir) -> std::result::Result<StreamId, EngineError> {
            let mut state = self.0.borrow_mut();
            let id = StreamId::new(Side::Client, dir, state.next_stream);
            state.next_stream += 1;
            Ok(id)
        }
        fn write_stream(&mut self, id: StreamId, data: &[u8], fin: bool) -> std::result::Result<usize, EngineError> {
            self.0.borrow_mut().written.push((id, data.to_vec(), fin));
            Ok(data.len())
        }
        fn reset_stream(&mut self, _id: StreamId, _code: u64) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        fn stop_sending(&mut self, _id: StreamId, _code: u64) -> std::result::Result<(), EngineError> {
            Ok(())
        }
        fn extend_stream_window(&mut self, id: StreamId, bytes: u64) {
            self.0.borrow_mut().extended.push((id, bytes));
        }
        fn validate_path(&mut self, _now: Instant, path: &Path) -> std::result::Result<(), EngineError> {
            self.0.borrow_mut().validated.push(*path);
            Ok(())
        }
        fn close(&mut self, _now: Instant, code: u64, _reason: &[u8]) {
            self.0.borrow_mut().closed = Some(code);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Vec<(Address, Bytes)>,
        timers: Vec<(Instant, TimerHandle)>,
    }

    impl Transport for MockTransport {
        fn send(&mut self, destination: Address, payload: Bytes) {
            self.sent.push((destination, payload));
        }
        fn arm_timer(&mut self, deadline: Instant) -> Option<TimerHandle> {
            let handle = TimerHandle::detached();
            self.timers.push((deadline, handle.clone()));
            Some(handle)
        }
    }

    struct Fixture {
        conn: Connection,
        engine: Rc<RefCell<MockState>>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        io: MockTransport,
    }

    fn addr(s: &str, port: u16) -> Address {
        Address::new(s, port).unwrap()
    }

    fn original_path() -> Path {
        Path::new(addr("10.0.0.1", 4433), addr("10.0.0.2", 5000))
    }

    fn fixture() -> Fixture {
        let engine = Rc::new(RefCell::new(MockState::default()));
        let (tx, events) = mpsc::unbounded_channel();
        let conn = Connection::new(
            Side::Client,
            original_path(),
            ConnectionId::random(8),
            Box::new(MockEngine(engine.clone())),
            ConnectionConfig::default(),
            ParamsVersion::LATEST,
            tx,
        );
        Fixture {
            conn,
            engine,
            events,
            io: MockTransport::default(),
        }
    }

    fn established() -> Fixture {
        let mut f = fixture();
        let remote = TransportParams {
            initial_max_stream_data_bidi_local: 64,
            initial_max_stream_data_bidi_remote: 4,
            ..TransportParams::default()
        };
        f.push(EngineEvent::RemoteTransportParams {
            version: ParamsVersion::LATEST as u32,
            params: Bytes::from(remote.encode()),
        });
        f.push(EngineEvent::HandshakeCompleted);
        f.datagram(original_path(), b"hello");
        assert_eq!(f.next_event(), Some(ConnectionEvent::Established));
        f
    }

    impl Fixture {
        fn push(&self, event: EngineEvent) {
            self.engine.borrow_mut().events.push_back(event);
        }

        fn datagram(&mut self, path: Path, payload: &[u8]) -> bool {
            self.conn.handle_datagram(Instant::now(), path, payload, &mut self.io)
        }

        fn next_event(&mut self) -> Option<ConnectionEvent> {
            self.events.try_recv().ok()
        }
    }

    #[test]
    fn test_handshake_establishes() {
        let f = established();
        assert_eq!(f.conn.state(), ConnectionState::Active);
        assert_eq!(f.io.sent.len(), 1);
        assert_eq!(f.io.sent[0].0, original_path().remote);
    }

    #[test]
    fn test_old_peer_params_default_new_fields() {
        let mut f = fixture();
        let theirs = TransportParams {
            initial_max_data: 777,
            min_ack_delay_us: 55,
            ..TransportParams::default()
        };
        let mut v1 = vec![0u8; ParamsVersion::V1.prefix_len()];
        convert_to_old(ParamsVersion::V1, &mut v1, &theirs).unwrap();
        f.push(EngineEvent::RemoteTransportParams {
            version: 1,
            params: Bytes::from(v1),
        });
        f.datagram(original_path(), b"x");

        let remote = f.conn.remote_params().unwrap();
        assert_eq!(remote.initial_max_data, 777);
        assert_eq!(remote.min_ack_delay_us, 0);
    }

    #[test]
    fn test_unknown_old_params_version_fails_handshake() {
        let mut f = fixture();
        f.push(EngineEvent::RemoteTransportParams {
            version: 0,
            params: Bytes::new(),
        });
        f.datagram(original_path(), b"x");
        assert_eq!(f.conn.state(), ConnectionState::Draining);
        assert!(matches!(
            f.next_event(),
            Some(ConnectionEvent::Closed(ConnectionError::HandshakeFailed(_)))
        ));
    }

    #[test]
    fn test_undecryptable_is_reported_not_fatal() {
        let mut f = established();
        assert!(!f.datagram(original_path(), b"garbage"));
        assert_eq!(f.conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_handshake_ignores_other_paths() {
        let mut f = fixture();
        let other = original_path().with_remote(addr("10.9.9.9", 1));
        f.datagram(other, b"x");
        assert!(f.engine.borrow().validated.is_empty());
        assert!(f.io.sent.is_empty());
        assert_eq!(f.conn.path(), original_path());
    }

    #[test]
    fn test_migration_waits_for_validation() {
        let mut f = established();
        let rebound = original_path().with_remote(addr("10.0.0.2", 6000));

        f.datagram(rebound, b"moved");
        assert_eq!(f.engine.borrow().validated, vec![rebound]);
        assert_eq!(f.conn.path(), original_path());
        assert_eq!(f.io.sent.last().unwrap().0, original_path().remote);

        // Repeated packets on the same candidate do not restart validation
        f.datagram(rebound, b"moved");
        assert_eq!(f.engine.borrow().validated.len(), 1);

        f.push(EngineEvent::PathValidated { path: rebound });
        f.datagram(rebound, b"moved");
        assert_eq!(f.conn.path(), rebound);
        assert_eq!(f.next_event(), Some(ConnectionEvent::PathMigrated(rebound)));
        assert_eq!(f.io.sent.last().unwrap().0, rebound.remote);
    }

    #[test]
    fn test_failed_validation_keeps_original_path() {
        let mut f = established();
        let spoofed = original_path().with_remote(addr("10.6.6.6", 6666));

        f.datagram(spoofed, b"spoof");
        f.push(EngineEvent::PathValidationFailed { path: spoofed });
        f.conn.handle_timeout(Instant::now(), &mut f.io);
        assert_eq!(f.conn.path(), original_path());

        let before = f.io.sent.len();
        f.datagram(original_path(), b"legit");
        assert_eq!(f.io.sent.len(), before + 1);
        assert_eq!(f.io.sent.last().unwrap().0, original_path().remote);
        assert_eq!(f.next_event(), None);
    }

    #[test]
    fn test_single_timer_rearmed() {
        let mut f = established();
        let t1 = Instant::now() + Duration::from_millis(100);
        let t2 = t1 + Duration::from_millis(100);

        f.engine.borrow_mut().next_timeout = Some(t1);
        f.datagram(original_path(), b"a");
        f.datagram(original_path(), b"b");
        assert_eq!(f.io.timers.len(), 1);

        f.engine.borrow_mut().next_timeout = Some(t2);
        f.datagram(original_path(), b"c");
        assert_eq!(f.io.timers.len(), 2);
        assert!(f.io.timers[0].1.is_cancelled());
        assert!(!f.io.timers[1].1.is_cancelled());
        assert_eq!(f.io.timers.iter().filter(|(_, h)| !h.is_cancelled()).count(), 1);
    }

    #[test]
    fn test_timeout_drives_engine() {
        let mut f = established();
        f.engine.borrow_mut().next_timeout = Some(Instant::now());
        f.conn.handle_timeout(Instant::now(), &mut f.io);
        assert_eq!(f.engine.borrow().timeouts_handled, 1);
    }

    #[test]
    fn test_peer_close_drains_then_closes_once() {
        let mut f = established();
        f.push(EngineEvent::PeerClosed {
            code: 42,
            reason: Bytes::from_static(b"bye"),
        });
        f.datagram(original_path(), b"close");
        assert_eq!(f.conn.state(), ConnectionState::Draining);
        let expected = ConnectionError::PeerClosed {
            code: 42,
            reason: b"bye".to_vec(),
        };
        assert_eq!(f.next_event(), Some(ConnectionEvent::Closed(expected.clone())));

        let (deadline, _) = *f.io.timers.last().unwrap();
        f.conn.handle_timeout(deadline, &mut f.io);
        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert_eq!(f.conn.poll_endpoint_event(), Some(EndpointEvent::Closed));
        assert_eq!(f.next_event(), None);
        assert_eq!(f.conn.close_reason(), Some(&expected));
    }

    #[test]
    fn test_idle_timeout_closes_and_forces_streams() {
        let mut f = established();
        let id = f.conn.open_stream(Dir::Bi).unwrap();
        f.push(EngineEvent::IdleTimeout);
        f.conn.handle_timeout(Instant::now(), &mut f.io);

        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert_eq!(
            f.next_event(),
            Some(ConnectionEvent::Closed(ConnectionError::IdleTimeout))
        );
        assert!(f.conn.stream_state(id).is_err());
        assert!(matches!(
            f.conn.open_stream(Dir::Bi),
            Err(Error::Connection(ConnectionError::IdleTimeout))
        ));
    }

    #[test]
    fn test_local_close_reports_code() {
        let mut f = established();
        f.conn.close(Instant::now(), 7, b"done", &mut f.io);
        assert_eq!(f.engine.borrow().closed, Some(7));
        assert_eq!(
            f.next_event(),
            Some(ConnectionEvent::Closed(ConnectionError::LocallyClosed {
                code: 7,
                reason: b"done".to_vec()
            }))
        );
        f.conn.close(Instant::now(), 8, b"again", &mut f.io);
        assert_eq!(f.engine.borrow().closed, Some(7));
        assert_eq!(f.next_event(), None);
    }

    #[test]
    fn test_peer_stream_data_and_window() {
        let mut f = established();
        let id = StreamId::new(Side::Server, Dir::Bi, 0);
        f.push(EngineEvent::StreamData {
            id,
            offset: 0,
            data: Bytes::from_static(b"ping"),
            fin: false,
        });
        f.datagram(original_path(), b"d");
        assert_eq!(f.next_event(), Some(ConnectionEvent::StreamOpened(id)));
        assert_eq!(f.next_event(), Some(ConnectionEvent::StreamReadable(id)));

        let data = f.conn.read(Instant::now(), id, 64, &mut f.io).unwrap();
        assert_eq!(data, ReadOutcome::Data(Bytes::from_static(b"ping")));
        assert_eq!(f.engine.borrow().extended, vec![(id, 4)]);
    }

    #[test]
    fn test_reset_isolated_to_one_stream() {
        let mut f = established();
        let a = StreamId::new(Side::Server, Dir::Bi, 0);
        let b = StreamId::new(Side::Server, Dir::Bi, 1);
        for id in [a, b] {
            f.push(EngineEvent::StreamData {
                id,
                offset: 0,
                data: Bytes::from_static(b"xy"),
                fin: false,
            });
        }
        f.push(EngineEvent::StreamReset {
            id: a,
            code: 9,
            final_size: 2,
        });
        f.datagram(original_path(), b"d");

        assert!(matches!(
            f.conn.read(Instant::now(), a, 64, &mut f.io),
            Err(Error::Stream(StreamError::Reset { code: 9, .. }))
        ));
        assert_eq!(
            f.conn.read(Instant::now(), b, 64, &mut f.io).unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"xy"))
        );
    }

    #[test]
    fn test_write_blocks_until_credit() {
        let mut f = established();
        let id = f.conn.open_stream(Dir::Bi).unwrap();
        assert_eq!(f.conn.send_credit(id).unwrap(), 4);

        let outcome = f.conn.write(Instant::now(), id, b"0123456789", &mut f.io).unwrap();
        assert_eq!(outcome.accepted, 4);
        assert!(outcome.blocked);
        assert_eq!(f.engine.borrow().written, vec![(id, b"0123".to_vec(), false)]);

        f.push(EngineEvent::StreamCredit { id, max_offset: 10 });
        f.datagram(original_path(), b"credit");
        assert_eq!(f.next_event(), Some(ConnectionEvent::StreamWritable(id)));

        let outcome = f.conn.write(Instant::now(), id, b"456789", &mut f.io).unwrap();
        assert_eq!(outcome.accepted, 6);
        assert_eq!(outcome.remaining_credit, 0);
    }

    #[test]
    fn test_stop_sending_resets_our_side() {
        let mut f = established();
        let id = f.conn.open_stream(Dir::Bi).unwrap();
        f.push(EngineEvent::StopSending { id, code: 5 });
        f.datagram(original_path(), b"stop");
        assert_eq!(f.next_event(), Some(ConnectionEvent::StreamStopped { id, code: 5 }));
        assert!(matches!(
            f.conn.write(Instant::now(), id, b"x", &mut f.io),
            Err(Error::Stream(StreamError::Reset { code: 5, .. }))
        ));
    }

    #[test]
    fn test_peer_stop_sending_on_untouched_uni_stream() {
        let mut f = established();
        let id = f.conn.open_stream(Dir::Uni).unwrap();
        f.push(EngineEvent::StopSending { id, code: 5 });
        f.datagram(original_path(), b"stop");
        assert_eq!(f.next_event(), Some(ConnectionEvent::StreamStopped { id, code: 5 }));
        assert!(!f.conn.is_destroyed(id));
        assert_eq!(f.conn.stream_state(id).unwrap(), StreamState::Reset);
        assert_eq!(f.conn.send_credit(id).unwrap(), 0);

        assert!(matches!(
            f.conn.write(Instant::now(), id, b"late", &mut f.io),
            Err(Error::Stream(StreamError::Reset { code: 5, .. }))
        ));
        assert!(f.conn.is_destroyed(id));
    }

    #[test]
    fn test_finished_stream_is_destroyed_after_observation() {
        let mut f = established();
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        f.push(EngineEvent::StreamData {
            id,
            offset: 0,
            data: Bytes::from_static(b"last"),
            fin: true,
        });
        f.datagram(original_path(), b"d");
        assert!(!f.conn.is_destroyed(id));

        f.conn.read(Instant::now(), id, 64, &mut f.io).unwrap();
        assert_eq!(
            f.conn.read(Instant::now(), id, 64, &mut f.io).unwrap(),
            ReadOutcome::Finished
        );
        assert!(f.conn.is_destroyed(id));

        // A retransmission for the destroyed stream is ignored
        f.push(EngineEvent::StreamData {
            id,
            offset: 0,
            data: Bytes::from_static(b"last"),
            fin: true,
        });
        f.datagram(original_path(), b"d");
        assert!(f.conn.is_destroyed(id));
    }

    #[test]
    fn test_connection_ids_tracked() {
        let mut f = established();
        let extra = ConnectionId::random(8);
        f.push(EngineEvent::NewConnectionId { cid: extra });
        f.datagram(original_path(), b"d");
        assert_eq!(f.conn.poll_endpoint_event(), Some(EndpointEvent::NewConnectionId(extra)));
        assert_eq!(f.conn.local_cids().len(), 2);

        f.push(EngineEvent::RetireConnectionId { cid: extra });
        f.datagram(original_path(), b"d");
        assert_eq!(f.conn.poll_endpoint_event(), Some(EndpointEvent::RetireConnectionId(extra)));
        assert_eq!(f.conn.local_cids().len(), 1);
    }
}
