//! Streams: ids, per-direction state, send credit and receive reassembly.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::engine::Side;
use crate::error::StreamError;

/// QUIC stream identifier.
///
/// Bit 0 is the initiator (0 = client), bit 1 the direction (0 = bidirectional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        let side_bit = match initiator {
            Side::Client => 0,
            Side::Server => 1,
        };
        let dir_bit = match dir {
            Dir::Bi => 0,
            Dir::Uni => 2,
        };
        StreamId(index << 2 | dir_bit | side_bit)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn dir(self) -> Dir {
        if self.0 & 2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Initiator/direction class, 0..4
    pub(crate) fn kind(self) -> usize {
        (self.0 & 3) as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream directionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    Bi,
    Uni,
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open
    Open,
    /// We finished (or have no) sending direction
    HalfClosedLocal,
    /// Peer finished (or has no) sending direction
    HalfClosedRemote,
    /// Both directions finished gracefully
    Closed,
    /// Both directions done, at least one by reset
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Open,
    Finished,
    Reset(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Open,
    Finished,
    Reset(u64),
}

/// Result of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes taken into the outbound buffer
    pub accepted: usize,
    /// Credit left after this write
    pub remaining_credit: u64,
    /// Some bytes were refused for lack of credit; retry after a
    /// `StreamWritable` notification
    pub blocked: bool,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Nothing contiguous yet
    Blocked,
    /// Peer finished and every byte was delivered
    Finished,
}

/// One ordered byte channel inside a connection.
///
/// Owned by its [`Connection`](crate::connection::Connection) and only ever
/// touched on the loop thread, so it carries no locks.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,

    // ── send half ─────────────────────────────────────────────────────────
    send: Option<SendState>,

    /// Accepted from the application but not yet handed to the engine
    outbound: VecDeque<Bytes>,

    /// Total bytes accepted from the application
    send_offset: u64,

    /// Peer-granted limit on `send_offset`
    send_max: u64,

    /// FIN still has to be passed to the engine
    fin_pending: bool,

    fin_sent: bool,

    /// The application drove or has seen the send side's end
    send_observed: bool,

    // ── receive half ──────────────────────────────────────────────────────
    recv: Option<RecvState>,

    /// Out-of-order chunks keyed by stream offset
    chunks: BTreeMap<u64, Bytes>,

    /// Everything below this offset was delivered to the application
    read_offset: u64,

    /// Limit we granted the peer
    recv_max: u64,

    highest_recv: u64,

    final_size: Option<u64>,

    /// The application has seen the receive side's end (EOF or reset)
    recv_observed: bool,

    /// Error to report instead of a plain reset
    recv_error: Option<StreamError>,
}

impl Stream {
    /// Create a stream as seen from `local` side.
    ///
    /// Unidirectional streams only get the half that exists locally.
    pub fn new(id: StreamId, local: Side, send_max: u64, recv_max: u64) -> Self {
        let (has_send, has_recv) = match id.dir() {
            Dir::Bi => (true, true),
            Dir::Uni if id.initiator() == local => (true, false),
            Dir::Uni => (false, true),
        };

        Self {
            id,
            send: has_send.then_some(SendState::Open),
            outbound: VecDeque::new(),
            send_offset: 0,
            send_max,
            fin_pending: false,
            fin_sent: false,
            send_observed: !has_send,
            recv: has_recv.then_some(RecvState::Open),
            chunks: BTreeMap::new(),
            read_offset: 0,
            recv_max,
            highest_recv: 0,
            final_size: None,
            recv_observed: !has_recv,
            recv_error: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        let local_closed = !matches!(self.send, Some(SendState::Open));
        let remote_closed = !matches!(self.recv, Some(RecvState::Open)) || self.final_size.is_some();
        let reset = matches!(self.send, Some(SendState::Reset(_)))
            || matches!(self.recv, Some(RecvState::Reset(_)));

        match (local_closed, remote_closed) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) if reset => StreamState::Reset,
            (true, true) => StreamState::Closed,
        }
    }

    pub fn has_send(&self) -> bool {
        self.send.is_some()
    }

    pub fn has_recv(&self) -> bool {
        self.recv.is_some()
    }

    // ── sending ───────────────────────────────────────────────────────────

    /// Remaining peer-granted credit.
    pub fn send_credit(&self) -> u64 {
        self.send_max.saturating_sub(self.send_offset)
    }

    /// Buffer as much of `data` as credit allows.
    pub fn write(&mut self, data: &[u8]) -> Result<WriteOutcome, StreamError> {
        match self.send {
            None => return Err(StreamError::WrongDirection(self.id)),
            Some(SendState::Reset(code)) => {
                self.send_observed = true;
                return Err(StreamError::Reset { id: self.id, code });
            }
            Some(SendState::Finished) => return Err(StreamError::WriteAfterClose(self.id)),
            Some(SendState::Open) => {}
        }

        let credit = self.send_credit();
        let accepted = (data.len() as u64).min(credit) as usize;
        if accepted > 0 {
            self.outbound.push_back(Bytes::copy_from_slice(&data[..accepted]));
            self.send_offset += accepted as u64;
        }

        trace!(
            "stream {} write: requested={} accepted={} credit_left={}",
            self.id,
            data.len(),
            accepted,
            self.send_credit()
        );

        Ok(WriteOutcome {
            accepted,
            remaining_credit: self.send_credit(),
            blocked: accepted < data.len(),
        })
    }

    /// Graceful half-close of the sending direction.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        match self.send {
            None => Err(StreamError::WrongDirection(self.id)),
            Some(SendState::Open) => {
                self.send = Some(SendState::Finished);
                self.fin_pending = true;
                self.send_observed = true;
                Ok(())
            }
            Some(SendState::Finished) => Ok(()),
            Some(SendState::Reset(code)) => {
                self.send_observed = true;
                Err(StreamError::Reset { id: self.id, code })
            }
        }
    }

    /// Abort the sending direction on behalf of the application, discarding
    /// unsent bytes.
    ///
    /// Returns `false` if there was nothing left to abort.
    pub fn reset_send(&mut self, code: u64) -> bool {
        if self.send.is_some() {
            self.send_observed = true;
        }
        self.abort_send(code)
    }

    /// Peer asked us to stop sending. The stream stays alive until the
    /// application's next write or finish reports the reset.
    pub fn on_stop_sending(&mut self, code: u64) -> bool {
        self.abort_send(code)
    }

    fn abort_send(&mut self, code: u64) -> bool {
        match self.send {
            Some(SendState::Open) | Some(SendState::Finished) if !self.fin_sent => {
                self.send = Some(SendState::Reset(code));
                self.outbound.clear();
                self.fin_pending = false;
                true
            }
            _ => false,
        }
    }

    /// Raise the send limit to `max_offset`. Returns whether credit grew.
    pub fn grant_credit(&mut self, max_offset: u64) -> bool {
        if max_offset > self.send_max {
            self.send_max = max_offset;
            true
        } else {
            false
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.iter().map(Bytes::len).sum()
    }

    /// Next chunk to hand to the engine and whether it carries FIN.
    pub(crate) fn outbound_chunk(&self) -> Option<(Bytes, bool)> {
        match self.outbound.front() {
            Some(chunk) => Some((chunk.clone(), self.fin_pending && self.outbound.len() == 1)),
            None if self.fin_pending => Some((Bytes::new(), true)),
            None => None,
        }
    }

    /// The engine took `n` bytes of the front chunk (and FIN, if `fin`).
    pub(crate) fn consume_outbound(&mut self, n: usize, fin: bool) {
        if let Some(front) = self.outbound.front_mut() {
            if n >= front.len() {
                self.outbound.pop_front();
            } else {
                front.advance(n);
            }
        }
        if fin && self.outbound.is_empty() {
            self.fin_pending = false;
            self.fin_sent = true;
        }
    }

    // ── receiving ─────────────────────────────────────────────────────────

    /// Store an arriving chunk. Returns whether newly readable data (or EOF)
    /// became available.
    pub fn receive(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<bool, StreamError> {
        match self.recv {
            None => return Err(StreamError::WrongDirection(self.id)),
            Some(RecvState::Reset(_)) | Some(RecvState::Finished) => return Ok(false),
            Some(RecvState::Open) => {}
        }

        let end = offset + data.len() as u64;
        if end > self.recv_max {
            return Err(StreamError::FlowControl {
                id: self.id,
                offset: end,
                limit: self.recv_max,
            });
        }
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(StreamError::FinalSize(self.id));
            }
        }
        if fin {
            if end < self.highest_recv {
                return Err(StreamError::FinalSize(self.id));
            }
            self.final_size = Some(end);
        }
        self.highest_recv = self.highest_recv.max(end);

        let before = self.readable_len();

        if end > self.read_offset && !data.is_empty() {
            let (offset, data) = if offset < self.read_offset {
                let skip = (self.read_offset - offset) as usize;
                (self.read_offset, data.slice(skip..))
            } else {
                (offset, data)
            };
            let keep_existing = self
                .chunks
                .get(&offset)
                .is_some_and(|existing| existing.len() >= data.len());
            if !keep_existing {
                self.chunks.insert(offset, data);
            }
        }

        let after = self.readable_len();
        trace!(
            "stream {} rx: offset={} end={} fin={} readable {} -> {}",
            self.id,
            offset,
            end,
            fin,
            before,
            after
        );
        Ok(after > before || self.at_eof())
    }

    /// Length of the contiguous run starting at the read offset.
    pub fn readable_len(&self) -> u64 {
        let mut cursor = self.read_offset;
        for (&offset, chunk) in &self.chunks {
            if offset > cursor {
                break;
            }
            cursor = cursor.max(offset + chunk.len() as u64);
        }
        cursor - self.read_offset
    }

    fn at_eof(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    /// Deliver up to `max` contiguous bytes, in stream order.
    pub fn read(&mut self, max: usize) -> Result<ReadOutcome, StreamError> {
        match self.recv {
            None => return Err(StreamError::WrongDirection(self.id)),
            Some(RecvState::Reset(code)) => {
                self.recv_observed = true;
                return Err(self
                    .recv_error
                    .clone()
                    .unwrap_or(StreamError::Reset { id: self.id, code }));
            }
            Some(RecvState::Finished) => return Ok(ReadOutcome::Finished),
            Some(RecvState::Open) => {}
        }

        let mut out = BytesMut::new();
        while out.len() < max {
            let Some((&offset, _)) = self.chunks.first_key_value() else {
                break;
            };
            if offset > self.read_offset {
                break;
            }
            let Some(chunk) = self.chunks.remove(&offset) else {
                break;
            };
            let skip = (self.read_offset - offset) as usize;
            if skip >= chunk.len() {
                continue;
            }
            let take = (chunk.len() - skip).min(max - out.len());
            out.extend_from_slice(&chunk[skip..skip + take]);
            self.read_offset += take as u64;
            if skip + take < chunk.len() {
                self.chunks.insert(self.read_offset, chunk.slice(skip + take..));
            }
        }

        if !out.is_empty() {
            self.recv_max += out.len() as u64;
            return Ok(ReadOutcome::Data(out.freeze()));
        }

        if self.at_eof() {
            self.recv = Some(RecvState::Finished);
            self.recv_observed = true;
            return Ok(ReadOutcome::Finished);
        }

        Ok(ReadOutcome::Blocked)
    }

    /// Peer aborted its sending direction; drop everything buffered.
    pub fn on_reset(&mut self, code: u64) -> bool {
        match self.recv {
            Some(RecvState::Open) => {
                self.recv = Some(RecvState::Reset(code));
                self.chunks.clear();
                true
            }
            _ => false,
        }
    }

    /// Abort the receive side because of `err`; the next read reports it.
    pub fn fail_recv(&mut self, code: u64, err: StreamError) -> bool {
        if self.on_reset(code) {
            self.recv_error = Some(err);
            true
        } else {
            false
        }
    }

    /// Local stop-sending: we will not read further, so nothing is left to
    /// observe on this side.
    pub fn stop_recv(&mut self, code: u64) -> bool {
        if self.on_reset(code) {
            self.recv_observed = true;
            true
        } else {
            false
        }
    }

    /// Current receive limit granted to the peer.
    pub fn recv_window_limit(&self) -> u64 {
        self.recv_max
    }

    /// Connection teardown: abort whatever is still open.
    pub(crate) fn force_close(&mut self) {
        self.reset_send(0);
        if self.on_reset(0) {
            self.recv_observed = true;
        }
        self.outbound.clear();
        self.fin_pending = false;
    }

    /// Both directions are over and the application has seen the end.
    pub(crate) fn is_reapable(&self) -> bool {
        let send_done = match self.send {
            None | Some(SendState::Reset(_)) => true,
            Some(SendState::Finished) => self.fin_sent && self.outbound.is_empty(),
            Some(SendState::Open) => false,
        };
        send_done && self.send_observed && self.recv_observed
    }
}
