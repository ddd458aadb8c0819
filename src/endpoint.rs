//! UDP endpoints: socket ownership, connection-id routing and the paced
//! send queue.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::address::{Address, Path};
use crate::config::EndpointConfig;
use crate::connection::{Connection, EndpointEvent, Transport};
use crate::engine::{EngineFactory, HandshakeContext, ProtocolEngine, Side};
use crate::error::{ConnectionError, Error, Result};
use crate::event_loop::{LoopHandle, TimerHandle};
use crate::handle::ConnectionHandle;
use crate::network::NetworkState;
use crate::packet::{ConnectionId, Header, MIN_INITIAL_SIZE};
use crate::transport_params::{convert_to_old, ParamsVersion};

pub type EndpointId = u64;

/// Stable key of a connection within its endpoint. Connection ids come and
/// go; the key does not.
pub type ConnectionKey = u64;

/// Diagnostic counters. Dropped datagrams only ever show up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Datagrams read from the socket
    pub received: u64,
    /// Datagrams written to the socket
    pub sent: u64,
    /// Unparseable header or undecryptable payload
    pub malformed: u64,
    /// Well-formed but matching no connection
    pub unroutable: u64,
    /// Initials refused (not listening, too short, engine said no)
    pub rejected: u64,
    /// Send failures other than would-block
    pub send_errors: u64,
}

/// Outbound side of an endpoint: socket, send queue, pacing.
struct EndpointIo {
    id: EndpointId,
    socket: Arc<UdpSocket>,
    /// Socket is AF_INET6, so IPv4 peers need the mapped form
    ipv6_socket: bool,
    handle: LoopHandle<NetworkState>,
    queue: VecDeque<(SocketAddr, Bytes)>,
    pacing: Option<Duration>,
    next_send: Option<Instant>,
    /// A pacing timer or writability wait will call back into `flush`
    flush_pending: bool,
    stats: EndpointStats,
}

impl EndpointIo {
    fn enqueue(&mut self, destination: Address, payload: Bytes) {
        let to = if self.ipv6_socket && destination.is_ipv4() {
            destination
                .mapped_ipv4_as_ipv6()
                .map(|a| a.socket_addr())
                .unwrap_or_else(|_| destination.socket_addr())
        } else {
            destination.socket_addr()
        };
        self.queue.push_back((to, payload));
        if !self.flush_pending {
            self.flush();
        }
    }

    /// Write queued datagrams until the queue empties, pacing holds us back
    /// or the socket would block.
    fn flush(&mut self) {
        while let Some((to, payload)) = self.queue.front() {
            let now = Instant::now();
            if let Some(next) = self.next_send.filter(|next| *next > now) {
                self.flush_at(next);
                return;
            }

            match self.socket.try_send_to(payload, *to) {
                Ok(n) => {
                    trace!("Sent {} bytes to {}", n, to);
                    self.stats.sent += 1;
                    self.queue.pop_front();
                    self.next_send = self.pacing.map(|interval| now + interval);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable();
                    return;
                }
                Err(e) => {
                    warn!("Failed to send to {}: {}", to, e);
                    self.stats.send_errors += 1;
                    self.queue.pop_front();
                }
            }
        }
    }

    fn flush_at(&mut self, deadline: Instant) {
        self.flush_pending = true;
        let id = self.id;
        if self
            .handle
            .call_at(deadline, move |net| net.flush_endpoint(id))
            .is_err()
        {
            self.flush_pending = false;
        }
    }

    fn wait_writable(&mut self) {
        self.flush_pending = true;
        let socket = self.socket.clone();
        let handle = self.handle.clone();
        let id = self.id;
        tokio::task::spawn_local(async move {
            if let Err(e) = socket.writable().await {
                error!("Socket writability wait failed: {}", e);
            }
            let _ = handle.call_soon(move |net| net.flush_endpoint(id));
        });
    }
}

/// [`Transport`] for one connection, borrowed from its endpoint.
struct ConnIo<'a> {
    io: &'a mut EndpointIo,
    key: ConnectionKey,
}

impl Transport for ConnIo<'_> {
    fn send(&mut self, destination: Address, payload: Bytes) {
        self.io.enqueue(destination, payload);
    }

    fn arm_timer(&mut self, deadline: Instant) -> Option<TimerHandle> {
        let (id, key) = (self.io.id, self.key);
        self.io
            .handle
            .call_at(deadline, move |net| net.connection_timeout(id, key))
            .ok()
    }
}

/// A bound UDP socket and every connection reached through it.
pub struct Endpoint {
    local: Address,
    config: EndpointConfig,
    factory: Arc<dyn EngineFactory>,

    /// Exclusive owner of the connections
    connections: HashMap<ConnectionKey, Connection>,

    /// Every live connection id, pointing at its owner
    routes: HashMap<ConnectionId, ConnectionKey>,

    next_key: ConnectionKey,

    /// Present while listening
    accept_tx: Option<mpsc::UnboundedSender<ConnectionHandle>>,

    closing: bool,
    io: EndpointIo,
    cancel: CancellationToken,
}

impl Endpoint {
    /// Bind `local` and start reading. Must run on the loop thread.
    pub fn bind(
        id: EndpointId,
        local: Address,
        config: EndpointConfig,
        factory: Arc<dyn EngineFactory>,
        handle: LoopHandle<NetworkState>,
    ) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::from_std(bind_socket(&local)?)?);
        let mut local = local;
        local.set_port(socket.local_addr()?.port());
        debug!("Endpoint {} bound to {}", id, local);

        let cancel = CancellationToken::new();
        tokio::task::spawn_local(reader_task(
            socket.clone(),
            handle.clone(),
            id,
            config.max_datagram_size,
            cancel.clone(),
        ));

        Ok(Self {
            local,
            factory,
            connections: HashMap::new(),
            routes: HashMap::new(),
            next_key: 0,
            accept_tx: None,
            closing: false,
            io: EndpointIo {
                id,
                socket,
                ipv6_socket: local.is_ipv6(),
                handle,
                queue: VecDeque::new(),
                pacing: config.pacing_interval(),
                next_send: None,
                flush_pending: false,
                stats: EndpointStats::default(),
            },
            config,
            cancel,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.io.id
    }

    pub fn local_addr(&self) -> Address {
        self.local
    }

    pub fn stats(&self) -> EndpointStats {
        self.io.stats
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn connection(&self, key: ConnectionKey) -> Option<&Connection> {
        self.connections.get(&key)
    }

    /// Start handing inbound connections to the returned channel. A second
    /// call replaces the first listener.
    pub fn listen(&mut self) -> mpsc::UnboundedReceiver<ConnectionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.accept_tx = Some(tx);
        debug!("Endpoint {} listening on {}", self.io.id, self.local);
        rx
    }

    /// Open a client connection to `remote`.
    pub fn connect(&mut self, remote: Address) -> Result<ConnectionHandle> {
        if self.closing {
            return Err(Error::Connection(ConnectionError::EndpointClosed));
        }
        if self.local.is_ipv4() && remote.is_ipv6() && !remote.is_ipv4_mapped_ipv6() {
            return Err(Error::AddressFamily(format!(
                "cannot reach {} from IPv4 endpoint {}",
                remote, self.local
            )));
        }
        let remote = normalize(remote);
        let path = Path::new(self.local, remote);
        let local_cid = ConnectionId::random(self.config.cid_len);
        let initial_dcid = ConnectionId::random(self.config.cid_len.max(8));

        let version = self.factory.params_version();
        let ctx = HandshakeContext {
            side: Side::Client,
            path,
            local_cid,
            remote_cid: initial_dcid,
            original_dcid: initial_dcid,
            transport_params: self.local_params(version, local_cid, None)?,
            params_version: version,
        };
        let engine = self.factory.connect(&ctx)?;

        let (key, handle) = self.insert(Side::Client, path, local_cid, engine, version);
        debug!("Connecting to {} (cid {})", remote, local_cid);
        self.with_connection(key, |conn, io| conn.flush(Instant::now(), io));
        Ok(handle)
    }

    /// Demultiplex one inbound datagram.
    pub fn handle_datagram(&mut self, from: SocketAddr, data: Bytes) {
        self.io.stats.received += 1;
        let path = Path::new(self.local, normalize(Address::from(from)));
        trace!("Received {} bytes on {}", data.len(), path);

        let header = match Header::decode(&data, self.config.cid_len) {
            Ok(header) => header,
            Err(e) => {
                trace!("Dropping malformed datagram from {}: {}", path.remote, e);
                self.io.stats.malformed += 1;
                return;
            }
        };

        if let Some(&key) = self.routes.get(header.dcid()) {
            let accepted = self
                .with_connection(key, |conn, io| conn.handle_datagram(Instant::now(), path, &data, io));
            if accepted == Some(false) {
                self.io.stats.malformed += 1;
            }
            return;
        }

        if header.is_initial() {
            self.accept(path, &header, &data);
        } else {
            trace!("No connection for dcid {} from {}", header.dcid(), path.remote);
            self.io.stats.unroutable += 1;
        }
    }

    fn accept(&mut self, path: Path, header: &Header, data: &[u8]) {
        let Some(accept_tx) = self.accept_tx.clone().filter(|_| !self.closing) else {
            trace!("Not listening; dropping initial from {}", path.remote);
            self.io.stats.rejected += 1;
            return;
        };
        if data.len() < MIN_INITIAL_SIZE {
            trace!("Initial from {} too short ({} bytes)", path.remote, data.len());
            self.io.stats.rejected += 1;
            return;
        }
        let Some(&remote_cid) = header.scid() else {
            self.io.stats.malformed += 1;
            return;
        };

        let local_cid = ConnectionId::random(self.config.cid_len);
        let original_dcid = *header.dcid();
        let version = self.factory.params_version();
        let transport_params = match self.local_params(version, local_cid, Some(original_dcid)) {
            Ok(params) => params,
            Err(e) => {
                error!("Could not encode transport parameters: {}", e);
                return;
            }
        };
        let ctx = HandshakeContext {
            side: Side::Server,
            path,
            local_cid,
            remote_cid,
            original_dcid,
            transport_params,
            params_version: version,
        };
        let engine = match self.factory.accept(&ctx, data) {
            Ok(engine) => engine,
            Err(e) => {
                debug!("Rejected initial from {}: {}", path.remote, e);
                self.io.stats.rejected += 1;
                return;
            }
        };

        let (key, handle) = self.insert(Side::Server, path, local_cid, engine, version);
        self.routes.insert(original_dcid, key);
        debug!("Accepted connection from {} (cid {})", path.remote, local_cid);

        let accepted = self.with_connection(key, |conn, io| conn.handle_datagram(Instant::now(), path, data, io));
        if accepted == Some(false) {
            self.io.stats.malformed += 1;
        }
        if accept_tx.send(handle).is_err() {
            warn!("Listener dropped; connection from {} not delivered", path.remote);
        }
    }

    fn insert(
        &mut self,
        side: Side,
        path: Path,
        local_cid: ConnectionId,
        engine: Box<dyn ProtocolEngine>,
        version: ParamsVersion,
    ) -> (ConnectionKey, ConnectionHandle) {
        let key = self.next_key;
        self.next_key += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            side,
            path,
            local_cid,
            engine,
            self.config.connection.clone(),
            version,
            tx,
        );
        self.connections.insert(key, connection);
        self.routes.insert(local_cid, key);

        let handle = ConnectionHandle::new(self.io.handle.clone(), self.io.id, key, side, rx);
        (key, handle)
    }

    /// Local transport parameters in the engine's layout version.
    fn local_params(
        &self,
        version: ParamsVersion,
        local_cid: ConnectionId,
        original_dcid: Option<ConnectionId>,
    ) -> Result<Vec<u8>> {
        let mut params = self.config.connection.transport_params();
        params.initial_scid = local_cid;
        if let Some(original_dcid) = original_dcid {
            params.original_dcid = original_dcid;
        }
        let mut buf = vec![0u8; version.prefix_len()];
        convert_to_old(version, &mut buf, &params)?;
        Ok(buf)
    }

    /// Run `f` against one connection with a transport bound to this
    /// endpoint, then apply the routing changes it produced.
    ///
    /// `None` if the connection no longer exists.
    pub fn with_connection<R>(
        &mut self,
        key: ConnectionKey,
        f: impl FnOnce(&mut Connection, &mut dyn Transport) -> R,
    ) -> Option<R> {
        let conn = self.connections.get_mut(&key)?;
        let mut io = ConnIo {
            io: &mut self.io,
            key,
        };
        let result = f(conn, &mut io);
        self.apply_endpoint_events(key);
        Some(result)
    }

    fn apply_endpoint_events(&mut self, key: ConnectionKey) {
        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        let mut closed = false;
        while let Some(event) = conn.poll_endpoint_event() {
            match event {
                EndpointEvent::NewConnectionId(cid) => {
                    self.routes.insert(cid, key);
                }
                EndpointEvent::RetireConnectionId(cid) => {
                    self.routes.remove(&cid);
                }
                EndpointEvent::Closed => closed = true,
            }
        }
        if closed {
            self.routes.retain(|_, k| *k != key);
            self.connections.remove(&key);
            debug!("Connection {} unregistered from endpoint {}", key, self.io.id);
        }
    }

    pub fn connection_timeout(&mut self, key: ConnectionKey) {
        self.with_connection(key, |conn, io| conn.handle_timeout(Instant::now(), io));
    }

    pub fn flush(&mut self) {
        self.io.flush_pending = false;
        self.io.flush();
    }

    /// Stop accepting and close every connection gracefully.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.accept_tx = None;
        let keys: Vec<_> = self.connections.keys().copied().collect();
        for key in keys {
            self.with_connection(key, |conn, io| conn.close(Instant::now(), 0, b"", io));
        }
        debug!("Endpoint {} closing with {} connections draining", self.io.id, self.connections.len());
    }

    /// Tear everything down now, without a closing handshake.
    pub fn abort(&mut self) {
        self.closing = true;
        self.accept_tx = None;
        let keys: Vec<_> = self.connections.keys().copied().collect();
        for key in keys {
            self.with_connection(key, |conn, _| conn.abort(ConnectionError::EndpointClosed));
        }
        self.cancel.cancel();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// IPv4-mapped peers are tracked by their plain IPv4 address.
fn normalize(address: Address) -> Address {
    address.unmapped_ipv4_from_ipv6().unwrap_or(address)
}

/// Bind a non-blocking UDP socket; IPv6 any-addresses flagged dual-stack
/// also accept IPv4.
fn bind_socket(local: &Address) -> Result<std::net::UdpSocket> {
    let addr = local.socket_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(!local.dual_stack())?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Errors after which the socket is still usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Background reader task
///
/// Reads datagrams and hands each one to the loop as its own job.
async fn reader_task(
    socket: Arc<UdpSocket>,
    handle: LoopHandle<NetworkState>,
    id: EndpointId,
    max_datagram_size: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; max_datagram_size];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, from)) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if handle.call_soon(move |net| net.dispatch_datagram(id, from, data)).is_err() {
                        return;
                    }
                }
                Err(e) if is_transient(&e) => {
                    trace!("Transient receive error on endpoint {}: {}", id, e);
                }
                Err(e) => {
                    error!("Reader task error on endpoint {}: {}", id, e);
                    return;
                }
            },
            _ = cancel.cancelled() => {
                debug!("Reader task cancelled for endpoint {}", id);
                return;
            }
        }
    }
}
