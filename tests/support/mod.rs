// Plaintext protocol engine used to drive real endpoints in tests.
//
// Packets carry the routing header followed by unencrypted frames:
//
//   Initial / Handshake: long header, then frames (Initial padded to 1200)
//   everything else:     short header, then frames

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quic_session::address::Path;
use quic_session::connection::{ConnectionEvent, ConnectionState};
use quic_session::engine::{
    EngineError, EngineEvent, EngineFactory, HandshakeContext, ProtocolEngine, Side, Transmit,
};
use quic_session::handle::ConnectionHandle;
use quic_session::packet::{ConnectionId, Header, LongType, MIN_INITIAL_SIZE};
use quic_session::stream::{Dir, ReadOutcome, StreamId};
use quic_session::transport_params::{convert_to_latest, ParamsVersion};

pub const VERSION: u32 = 1;

/// Largest STREAM frame payload
const MAX_STREAM_CHUNK: usize = 1000;

/// Frames are packed into packets up to this size
const MAX_PACKET: usize = 1200;

/// Unanswered path challenges fail after this long
pub const PATH_TIMEOUT: Duration = Duration::from_millis(300);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,quic_session=debug")
        .try_init();
}

// ── frames ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Params { version: u32, bytes: Bytes },
    HandshakeDone,
    Stream { id: u64, offset: u64, fin: bool, data: Bytes },
    MaxStreamData { id: u64, max: u64 },
    ResetStream { id: u64, code: u64, final_size: u64 },
    StopSending { id: u64, code: u64 },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    Close { code: u64, reason: Bytes },
}

impl Frame {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Ping => buf.put_u8(0x06),
            Frame::Params { version, bytes } => {
                buf.put_u8(0x01);
                buf.put_u32(*version);
                buf.put_u16(bytes.len() as u16);
                buf.put_slice(bytes);
            }
            Frame::HandshakeDone => buf.put_u8(0x02),
            Frame::Stream { id, offset, fin, data } => {
                buf.put_u8(0x08);
                buf.put_u64(*id);
                buf.put_u64(*offset);
                buf.put_u8(*fin as u8);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            Frame::MaxStreamData { id, max } => {
                buf.put_u8(0x10);
                buf.put_u64(*id);
                buf.put_u64(*max);
            }
            Frame::ResetStream { id, code, final_size } => {
                buf.put_u8(0x04);
                buf.put_u64(*id);
                buf.put_u64(*code);
                buf.put_u64(*final_size);
            }
            Frame::StopSending { id, code } => {
                buf.put_u8(0x05);
                buf.put_u64(*id);
                buf.put_u64(*code);
            }
            Frame::PathChallenge(token) => {
                buf.put_u8(0x1a);
                buf.put_slice(token);
            }
            Frame::PathResponse(token) => {
                buf.put_u8(0x1b);
                buf.put_slice(token);
            }
            Frame::Close { code, reason } => {
                buf.put_u8(0x1c);
                buf.put_u64(*code);
                buf.put_u16(reason.len() as u16);
                buf.put_slice(reason);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }
}

fn take(buf: &mut &[u8], n: usize) -> Option<Bytes> {
    if buf.len() < n {
        return None;
    }
    let out = Bytes::copy_from_slice(&buf[..n]);
    buf.advance(n);
    Some(out)
}

fn token(buf: &mut &[u8]) -> Option<[u8; 8]> {
    let bytes = take(buf, 8)?;
    let mut token = [0u8; 8];
    token.copy_from_slice(&bytes);
    Some(token)
}

fn u64s<const N: usize>(buf: &mut &[u8]) -> Option<[u64; N]> {
    if buf.len() < N * 8 {
        return None;
    }
    let mut out = [0u64; N];
    for v in out.iter_mut() {
        *v = buf.get_u64();
    }
    Some(out)
}

/// Parse frames; `None` for anything unrecognised or truncated.
pub fn decode_frames(mut buf: &[u8]) -> Option<Vec<Frame>> {
    let mut frames = Vec::new();
    while buf.has_remaining() {
        let frame = match buf.get_u8() {
            0x00 => break,
            0x06 => Frame::Ping,
            0x01 => {
                if buf.len() < 6 {
                    return None;
                }
                let version = buf.get_u32();
                let len = buf.get_u16() as usize;
                Frame::Params {
                    version,
                    bytes: take(&mut buf, len)?,
                }
            }
            0x02 => Frame::HandshakeDone,
            0x08 => {
                let [id, offset] = u64s::<2>(&mut buf)?;
                if buf.len() < 3 {
                    return None;
                }
                let fin = buf.get_u8() != 0;
                let len = buf.get_u16() as usize;
                Frame::Stream {
                    id,
                    offset,
                    fin,
                    data: take(&mut buf, len)?,
                }
            }
            0x10 => {
                let [id, max] = u64s::<2>(&mut buf)?;
                Frame::MaxStreamData { id, max }
            }
            0x04 => {
                let [id, code, final_size] = u64s::<3>(&mut buf)?;
                Frame::ResetStream { id, code, final_size }
            }
            0x05 => {
                let [id, code] = u64s::<2>(&mut buf)?;
                Frame::StopSending { id, code }
            }
            0x1a => Frame::PathChallenge(token(&mut buf)?),
            0x1b => Frame::PathResponse(token(&mut buf)?),
            0x1c => {
                let [code] = u64s::<1>(&mut buf)?;
                if buf.len() < 2 {
                    return None;
                }
                let len = buf.get_u16() as usize;
                Frame::Close {
                    code,
                    reason: take(&mut buf, len)?,
                }
            }
            _ => return None,
        };
        frames.push(frame);
    }
    Some(frames)
}

fn header_len(header: &Header) -> usize {
    match header {
        Header::Long { dcid, scid, .. } | Header::VersionNegotiation { dcid, scid } => {
            1 + 4 + 1 + dcid.len() + 1 + scid.len()
        }
        Header::Short { dcid } => 1 + dcid.len(),
    }
}

/// Split a datagram into its header and frame bytes.
pub fn split_packet(datagram: &[u8], local_cid_len: usize) -> Option<(Header, &[u8])> {
    let header = Header::decode(datagram, local_cid_len).ok()?;
    let len = header_len(&header);
    Some((header, datagram.get(len..)?))
}

/// Build one datagram, zero-padded to `pad_to` bytes.
pub fn packet(header: Header, frames: &[Frame], pad_to: usize) -> Bytes {
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    for frame in frames {
        frame.encode(&mut buf);
    }
    if buf.len() < pad_to {
        buf.put_bytes(0, pad_to - buf.len());
    }
    buf.freeze()
}

// ── engine ───────────────────────────────────────────────────────────────

pub struct PlainEngine {
    side: Side,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    /// Parameters as advertised to the peer
    advertised: (u32, Bytes),
    stream_window: u64,
    idle_timeout: Option<Duration>,
    established: bool,
    closed: bool,
    last_activity: Instant,
    next_stream: [u64; 2],
    send_offset: HashMap<StreamId, u64>,
    recv_granted: HashMap<StreamId, u64>,
    /// Long header type for the next packet, if it still needs one
    long_type: Option<LongType>,
    pending: VecDeque<Frame>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<EngineEvent>,
    challenge: Option<(Path, [u8; 8], Instant)>,
}

impl PlainEngine {
    fn new(ctx: &HandshakeContext, advertise_as: Option<u32>, trailing: usize) -> Result<Self, EngineError> {
        let local = convert_to_latest(ctx.params_version, &ctx.transport_params)
            .map_err(|e| EngineError::Handshake(e.to_string()))?;

        let mut bytes = BytesMut::from(&ctx.transport_params[..]);
        bytes.put_bytes(0xab, trailing);
        let version = advertise_as.unwrap_or(ctx.params_version as u32);

        let mut engine = Self {
            side: ctx.side,
            local_cid: ctx.local_cid,
            remote_cid: ctx.remote_cid,
            advertised: (version, bytes.freeze()),
            stream_window: local.initial_max_stream_data_bidi_local,
            idle_timeout: (local.max_idle_timeout_ms > 0)
                .then(|| Duration::from_millis(local.max_idle_timeout_ms)),
            established: false,
            closed: false,
            last_activity: Instant::now(),
            next_stream: [0; 2],
            send_offset: HashMap::new(),
            recv_granted: HashMap::new(),
            long_type: None,
            pending: VecDeque::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            challenge: None,
        };

        if ctx.side == Side::Client {
            let params = engine.params_frame();
            engine.long_type = Some(LongType::Initial);
            engine.pending.push_back(params);
        }
        Ok(engine)
    }

    fn params_frame(&self) -> Frame {
        Frame::Params {
            version: self.advertised.0,
            bytes: self.advertised.1.clone(),
        }
    }

    fn on_frame(&mut self, path: &Path, frame: Frame) {
        match frame {
            Frame::Ping => {}
            Frame::Params { version, bytes } => {
                self.events.push_back(EngineEvent::RemoteTransportParams {
                    version,
                    params: bytes,
                });
                if self.side == Side::Server && !self.established {
                    let params = self.params_frame();
                    self.long_type = Some(LongType::Handshake);
                    self.pending.push_back(params);
                    self.pending.push_back(Frame::HandshakeDone);
                    self.established = true;
                    self.events.push_back(EngineEvent::HandshakeCompleted);
                }
            }
            Frame::HandshakeDone => {
                if self.side == Side::Client && !self.established {
                    self.established = true;
                    self.events.push_back(EngineEvent::HandshakeCompleted);
                }
            }
            Frame::Stream { id, offset, fin, data } => {
                self.events.push_back(EngineEvent::StreamData {
                    id: StreamId(id),
                    offset,
                    data,
                    fin,
                });
            }
            Frame::MaxStreamData { id, max } => {
                self.events.push_back(EngineEvent::StreamCredit {
                    id: StreamId(id),
                    max_offset: max,
                });
            }
            Frame::ResetStream { id, code, final_size } => {
                self.events.push_back(EngineEvent::StreamReset {
                    id: StreamId(id),
                    code,
                    final_size,
                });
            }
            Frame::StopSending { id, code } => {
                self.events.push_back(EngineEvent::StopSending {
                    id: StreamId(id),
                    code,
                });
            }
            Frame::PathChallenge(token) => {
                let response = packet(
                    Header::Short {
                        dcid: self.remote_cid,
                    },
                    &[Frame::PathResponse(token)],
                    0,
                );
                self.transmits.push_back(Transmit::to(path.remote, response));
            }
            Frame::PathResponse(token) => {
                if let Some((challenged, expected, _)) = self.challenge {
                    if expected == token {
                        self.challenge = None;
                        self.events.push_back(EngineEvent::PathValidated { path: challenged });
                    }
                }
            }
            Frame::Close { code, reason } => {
                if !self.closed {
                    self.closed = true;
                    self.events.push_back(EngineEvent::PeerClosed { code, reason });
                }
            }
        }
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        self.idle_timeout.map(|t| self.last_activity + t)
    }
}

impl ProtocolEngine for PlainEngine {
    fn handle_datagram(&mut self, now: Instant, path: &Path, payload: &[u8]) -> Result<(), EngineError> {
        let (header, body) =
            split_packet(payload, self.local_cid.len()).ok_or(EngineError::Undecryptable)?;
        let frames = decode_frames(body).ok_or(EngineError::Undecryptable)?;

        if let Header::Long {
            ty: LongType::Handshake,
            scid,
            ..
        } = header
        {
            if self.side == Side::Client {
                self.remote_cid = scid;
            }
        }

        self.last_activity = now;
        for frame in frames {
            self.on_frame(path, frame);
        }
        Ok(())
    }

    fn poll_transmit(&mut self, _now: Instant) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }
        if self.pending.is_empty() {
            return None;
        }

        let ty = self.long_type.take();
        let header = match ty {
            Some(ty) => Header::Long {
                ty,
                version: VERSION,
                dcid: self.remote_cid,
                scid: self.local_cid,
            },
            None => Header::Short {
                dcid: self.remote_cid,
            },
        };

        let mut frames = Vec::new();
        let mut size = 1 + 4 + 2 + 2 * 20;
        while let Some(frame) = self.pending.front() {
            let len = frame.encoded_len();
            if !frames.is_empty() && size + len > MAX_PACKET {
                break;
            }
            size += len;
            frames.extend(self.pending.pop_front());
        }

        let pad_to = if ty == Some(LongType::Initial) {
            MIN_INITIAL_SIZE
        } else {
            0
        };
        Some(Transmit::new(packet(header, &frames, pad_to)))
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn next_timeout(&self) -> Option<Instant> {
        let challenge = self.challenge.map(|(_, _, deadline)| deadline);
        match (self.idle_deadline(), challenge) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), EngineError> {
        if let Some((path, _, deadline)) = self.challenge {
            if deadline <= now {
                self.challenge = None;
                self.events.push_back(EngineEvent::PathValidationFailed { path });
            }
        }
        if self.idle_deadline().is_some_and(|d| d <= now) {
            self.closed = true;
            self.events.push_back(EngineEvent::IdleTimeout);
        }
        Ok(())
    }

    fn open_stream(&mut self, dir: Dir) -> Result<StreamId, EngineError> {
        if self.closed {
            return Err(EngineError::InvalidState("closed".to_string()));
        }
        let slot = match dir {
            Dir::Bi => 0,
            Dir::Uni => 1,
        };
        let id = StreamId::new(self.side, dir, self.next_stream[slot]);
        self.next_stream[slot] += 1;
        Ok(id)
    }

    fn write_stream(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, EngineError> {
        if self.closed {
            return Err(EngineError::InvalidState("closed".to_string()));
        }
        let offset = self.send_offset.entry(id).or_insert(0);
        let mut chunks = data.chunks(MAX_STREAM_CHUNK).peekable();
        if chunks.peek().is_none() && fin {
            self.pending.push_back(Frame::Stream {
                id: id.0,
                offset: *offset,
                fin: true,
                data: Bytes::new(),
            });
        }
        while let Some(chunk) = chunks.next() {
            self.pending.push_back(Frame::Stream {
                id: id.0,
                offset: *offset,
                fin: fin && chunks.peek().is_none(),
                data: Bytes::copy_from_slice(chunk),
            });
            *offset += chunk.len() as u64;
        }
        Ok(data.len())
    }

    fn reset_stream(&mut self, id: StreamId, code: u64) -> Result<(), EngineError> {
        let final_size = self.send_offset.get(&id).copied().unwrap_or(0);
        self.pending.retain(|f| !matches!(f, Frame::Stream { id: sid, .. } if *sid == id.0));
        self.pending.push_back(Frame::ResetStream {
            id: id.0,
            code,
            final_size,
        });
        Ok(())
    }

    fn stop_sending(&mut self, id: StreamId, code: u64) -> Result<(), EngineError> {
        self.pending.push_back(Frame::StopSending { id: id.0, code });
        Ok(())
    }

    fn extend_stream_window(&mut self, id: StreamId, bytes: u64) {
        let granted = self.recv_granted.entry(id).or_insert(self.stream_window);
        *granted += bytes;
        let max = *granted;
        self.pending.push_back(Frame::MaxStreamData { id: id.0, max });
    }

    fn validate_path(&mut self, now: Instant, path: &Path) -> Result<(), EngineError> {
        let token: [u8; 8] = rand::random();
        let challenge = packet(
            Header::Short {
                dcid: self.remote_cid,
            },
            &[Frame::PathChallenge(token)],
            0,
        );
        self.transmits.push_back(Transmit::to(path.remote, challenge));
        self.challenge = Some((*path, token, now + PATH_TIMEOUT));
        Ok(())
    }

    fn close(&mut self, _now: Instant, code: u64, reason: &[u8]) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.pending.push_back(Frame::Close {
            code,
            reason: Bytes::copy_from_slice(reason),
        });
    }
}

// ── factory ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PlainFactory {
    params_version: Option<ParamsVersion>,
    advertise_as: Option<u32>,
    trailing: usize,
    reject: bool,
    /// Local connection ids of accepted (server side) connections
    pub accepted: Mutex<Vec<ConnectionId>>,
}

impl PlainFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine build that speaks an older parameter layout.
    pub fn speaking(version: ParamsVersion) -> Arc<Self> {
        Arc::new(Self {
            params_version: Some(version),
            ..Self::default()
        })
    }

    /// Pretend to be a newer build: advertise `version` and append
    /// `trailing` bytes of unknown fields.
    pub fn advertising(version: u32, trailing: usize) -> Arc<Self> {
        Arc::new(Self {
            advertise_as: Some(version),
            trailing,
            ..Self::default()
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject: true,
            ..Self::default()
        })
    }

    pub fn first_accepted(&self) -> Option<ConnectionId> {
        self.accepted.lock().unwrap().first().copied()
    }
}

impl EngineFactory for PlainFactory {
    fn params_version(&self) -> ParamsVersion {
        self.params_version.unwrap_or(ParamsVersion::LATEST)
    }

    fn connect(&self, ctx: &HandshakeContext) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        Ok(Box::new(PlainEngine::new(ctx, self.advertise_as, self.trailing)?))
    }

    fn accept(&self, ctx: &HandshakeContext, initial: &[u8]) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        if self.reject {
            return Err(EngineError::Handshake("rejected by test factory".to_string()));
        }
        let (header, _) = split_packet(initial, 0).ok_or(EngineError::Undecryptable)?;
        if !matches!(header, Header::Long { version: VERSION, .. }) {
            return Err(EngineError::Handshake("unsupported version".to_string()));
        }
        self.accepted.lock().unwrap().push(ctx.local_cid);
        Ok(Box::new(PlainEngine::new(ctx, self.advertise_as, self.trailing)?))
    }
}

// ── helpers for blocking tests ───────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll events until one matches, returning it.
pub fn wait_event<F>(conn: &mut ConnectionHandle, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        while let Some(event) = conn.try_next_event() {
            if pred(&event) {
                return event;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for event");
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn wait_established(conn: &mut ConnectionHandle) {
    wait_event(conn, |e| *e == ConnectionEvent::Established);
    assert_eq!(conn.state().unwrap(), ConnectionState::Active);
}

/// Read a stream until the peer finishes it.
pub fn read_to_end(conn: &ConnectionHandle, id: StreamId) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    let mut out = Vec::new();
    loop {
        match conn.read(id, 64 * 1024).unwrap() {
            ReadOutcome::Data(data) => out.extend_from_slice(&data),
            ReadOutcome::Finished => return out,
            ReadOutcome::Blocked => {
                assert!(Instant::now() < deadline, "timed out reading stream {}", id);
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
}

/// Poll until `f` returns `Some`.
pub fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(2));
    }
}
