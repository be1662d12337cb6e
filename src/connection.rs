//! Connection table
//!
//! Each live file descriptor owns one [`Connection`]: its socket, TLS
//! state, capped receive buffer, protocol context, and a generation id
//! that defeats use-after-close worker completions. The table itself
//! (a [`slab::Slab`] indexed by `Token`) lives in [`crate::reactor`];
//! this module only defines the per-slot state and its transitions,
//! keeping the plaintext/TLS socket split generalized to the framework's
//! HTTP + WebSocket + raw-TCP roles.

use std::borrow::BorrowMut;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::buffer::Buffer;
use crate::dispatch::HandlerReply;
use crate::error::{Error, Result};
use crate::net::tcp_stream::TcpStream;
use crate::parser::h1::request::{self, BodyMode, ChunkedDecoder, ParseOutcome};
use crate::parser::h1::response::Response;
use crate::parser::{Method, Version};
use crate::tls::{TlsAdapter, TlsOutcome};
use crate::ws::{self, FragmentAssembler, Opcode};

/// An owned, dispatch-ready HTTP request. Built immediately out of the
/// borrowed parse result so it can cross into a worker task or outlive
/// the receive buffer being compacted.
#[derive(Debug, Clone)]
pub struct HttpRequestContext {
    /// Request method.
    pub method: Method,
    /// Request target, e.g. `/ping?x=1`.
    pub target: String,
    /// HTTP version on the request line.
    pub version: Version,
    /// Header fields, in receive order.
    pub headers: Vec<(String, String)>,
    /// Decoded body (fixed-length or reassembled from chunks).
    pub body: Vec<u8>,
    /// Set by the dispatch key extractor; drives handler lookup.
    pub key: Option<String>,
}

impl HttpRequestContext {
    /// The path component of the target, stripping any query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// First header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// In-progress body accumulation for a request whose header block has
/// already been parsed but whose body hasn't finished arriving.
#[derive(Debug)]
pub(crate) struct PendingBody {
    head: HttpRequestContext,
    mode: BodyMode,
    chunk_decoder: Option<ChunkedDecoder>,
}

/// HTTP/1.x protocol state for a connection: IDLE while waiting for a
/// request line, or accumulating a body once headers are parsed.
#[derive(Debug, Default)]
pub(crate) enum HttpPhase {
    #[default]
    Idle,
    Body(PendingBody),
}

/// Local/remote halves of the WebSocket close handshake, tracked as an
/// explicit two-bit state rather than a single overloaded flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloseFlags {
    /// We have sent a close frame.
    pub local_sent: bool,
    /// We have received a close frame from the peer.
    pub remote_received: bool,
}

impl CloseFlags {
    /// Once either half has happened, the socket should be shut down
    /// after the close frame (if any) has been flushed.
    pub fn should_close(&self) -> bool {
        self.local_sent || self.remote_received
    }
}

/// WebSocket protocol state for a connection that has completed the
/// opening handshake.
#[derive(Debug)]
pub struct WsState {
    assembler: FragmentAssembler,
    /// Last time any message (data or control) was received.
    pub last_message: Instant,
    /// When a heartbeat ping was sent and not yet acknowledged.
    pub heartbeat_sent: Option<Instant>,
    /// Local/remote close handshake progress.
    pub close: CloseFlags,
}

impl WsState {
    fn new() -> Self {
        Self {
            assembler: FragmentAssembler::new(),
            last_message: Instant::now(),
            heartbeat_sent: None,
            close: CloseFlags::default(),
        }
    }
}

/// Which protocol, if any, a connection has negotiated.
#[derive(Debug)]
pub(crate) enum ProtocolMode {
    /// Headers not yet parsed enough to know the protocol.
    Http(HttpPhase),
    /// Upgraded to WebSocket.
    Ws(WsState),
}

impl Default for ProtocolMode {
    fn default() -> Self {
        Self::Http(HttpPhase::Idle)
    }
}

/// One message delivered to the dispatcher by [`Connection::poll_read`].
#[derive(Debug)]
pub enum Delivered {
    /// A complete HTTP request.
    Http(HttpRequestContext),
    /// A complete WebSocket message (control frames are handled inline
    /// and never surface here).
    Ws(Opcode, Vec<u8>),
}

/// A live connection: socket, optional TLS, receive buffer, and protocol
/// state. Owned exclusively by the reactor thread.
pub struct Connection<S>
where
    S: TcpStream + Read + Write + Source,
{
    stream: S,
    tls: Option<TlsAdapter>,
    token: Token,
    generation: u64,
    peer_ip: IpAddr,
    buf: Buffer,
    write_queue: VecDeque<Vec<u8>>,
    mode: ProtocolMode,
    closed: bool,
    close_after_flush: bool,
    /// At most one outstanding worker task per connection; set while a
    /// request has been deferred and cleared when its completion lands.
    pub pending_worker: bool,
}

impl<S> Connection<S>
where
    S: TcpStream + Read + Write + Source,
{
    /// Builds a new plaintext connection slot.
    pub fn new(
        stream: S,
        token: Token,
        generation: u64,
        peer_ip: IpAddr,
        buffer_cap: usize,
    ) -> Self {
        Self {
            stream,
            tls: None,
            token,
            generation,
            peer_ip,
            buf: Buffer::new(4096, buffer_cap),
            write_queue: VecDeque::new(),
            mode: ProtocolMode::default(),
            closed: false,
            close_after_flush: false,
            pending_worker: false,
        }
    }

    /// Builds a new connection slot that must complete a TLS handshake
    /// before any plaintext is available.
    pub fn new_tls(
        stream: S,
        token: Token,
        generation: u64,
        peer_ip: IpAddr,
        buffer_cap: usize,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        let tls = TlsAdapter::new(config)
            .map_err(|e| Error::fatal_io("failed to start TLS session", io::Error::other(e)))?;
        Ok(Self {
            stream,
            tls: Some(tls),
            token,
            generation,
            peer_ip,
            buf: Buffer::new(4096, buffer_cap),
            write_queue: VecDeque::new(),
            mode: ProtocolMode::default(),
            closed: false,
            close_after_flush: false,
            pending_worker: false,
        })
    }

    /// Slab token identifying this connection.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Generation id at the time this connection was created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Originating IP, used for security-gate bookkeeping.
    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    /// Whether the connection has finished (or failed) and should be torn
    /// down by the reactor.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the connection for close on the next reactor pass.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    fn interest(&self) -> Interest {
        if let Some(tls) = &self.tls {
            if tls.wants_write() || !self.write_queue.is_empty() {
                return Interest::READABLE | Interest::WRITABLE;
            }
            return Interest::READABLE;
        }
        if self.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Registers the socket with `registry`.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.interest();
        registry.register(&mut self.stream, self.token, interest)
    }

    /// Re-registers with updated interest (e.g. once a response queues
    /// writable data).
    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.interest();
        registry.reregister(&mut self.stream, self.token, interest)
    }

    /// Deregisters the socket ahead of close.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Advances a TLS handshake if one is in progress. Returns `Ok(true)`
    /// once the handshake (or plaintext passthrough) is ready for
    /// application data.
    pub fn drive_handshake(&mut self) -> io::Result<bool> {
        let Some(tls) = &mut self.tls else {
            return Ok(true);
        };
        match tls.handshake_step(&mut self.stream)? {
            TlsOutcome::Done => Ok(true),
            TlsOutcome::Eof => {
                self.closed = true;
                Ok(false)
            }
            TlsOutcome::NeedRead | TlsOutcome::NeedWrite => Ok(false),
        }
    }

    /// Reads as much as is available into the receive buffer, parses as
    /// many complete messages as the buffer holds, and returns them in
    /// arrival order. Call sites should invoke this until it returns an
    /// empty vec after a readable event, to drain edge-triggered
    /// readiness.
    pub fn poll_read(&mut self) -> io::Result<Vec<Delivered>> {
        if self.buf.at_capacity_limit() {
            self.closed = true;
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
        }

        let n = self.read_into_buffer()?;
        if n == 0 {
            self.closed = true;
            return Ok(Vec::new());
        }

        self.drain_buffer()
    }

    fn read_into_buffer(&mut self) -> io::Result<usize> {
        if !self.buf.reserve(4096) && self.buf.remaining_mut() == 0 {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            if self.buf.remaining_mut() == 0 {
                break;
            }
            let dest: &mut [u8] = self.buf.borrow_mut();
            let read_result = match &mut self.tls {
                Some(tls) => {
                    let (n, outcome) = tls.read(&mut self.stream, dest)?;
                    if outcome == TlsOutcome::NeedRead && n == 0 {
                        break;
                    }
                    Ok(n)
                }
                None => self.stream.read(dest),
            };
            match read_result {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    self.buf.mark_written(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn drain_buffer(&mut self) -> io::Result<Vec<Delivered>> {
        let mut delivered = Vec::new();
        loop {
            let progressed = match &mut self.mode {
                ProtocolMode::Http(_) => self.drain_http(&mut delivered)?,
                ProtocolMode::Ws(_) => self.drain_ws(&mut delivered)?,
            };
            if !progressed {
                break;
            }
        }
        Ok(delivered)
    }

    fn drain_http(&mut self, out: &mut Vec<Delivered>) -> io::Result<bool> {
        let phase = match std::mem::take(&mut self.mode) {
            ProtocolMode::Http(phase) => phase,
            other @ ProtocolMode::Ws(_) => {
                self.mode = other;
                return Ok(false);
            }
        };

        match phase {
            HttpPhase::Idle => {
                let raw: &[u8] = &self.buf;
                let outcome = request::parse_request(raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                let ParseOutcome::Complete(parsed) = outcome else {
                    self.mode = ProtocolMode::Http(HttpPhase::Idle);
                    return Ok(false);
                };

                let head = HttpRequestContext {
                    method: parsed.method,
                    target: parsed.target.to_string(),
                    version: parsed.version,
                    headers: parsed
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                String::from_utf8_lossy(h.name).into_owned(),
                                h.value_str().unwrap_or_default().to_string(),
                            )
                        })
                        .collect(),
                    body: Vec::new(),
                    key: None,
                };
                let mode = request::body_mode(&parsed.headers)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                let consumed = parsed.consumed;
                self.buf.mark_read(consumed);

                match mode {
                    BodyMode::None | BodyMode::Fixed(0) => {
                        self.mode = ProtocolMode::Http(HttpPhase::Idle);
                        out.push(Delivered::Http(head));
                        Ok(true)
                    }
                    BodyMode::Fixed(_) | BodyMode::Chunked => {
                        let chunk_decoder = matches!(mode, BodyMode::Chunked).then(ChunkedDecoder::new);
                        self.mode = ProtocolMode::Http(HttpPhase::Body(PendingBody {
                            head,
                            mode,
                            chunk_decoder,
                        }));
                        Ok(true)
                    }
                }
            }
            HttpPhase::Body(mut pending) => match pending.mode {
                BodyMode::Fixed(len) => {
                    if self.buf.remaining() < len {
                        self.mode = ProtocolMode::Http(HttpPhase::Body(pending));
                        return Ok(false);
                    }
                    let raw: &[u8] = &self.buf;
                    pending.head.body = raw[..len].to_vec();
                    self.buf.mark_read(len);
                    self.mode = ProtocolMode::Http(HttpPhase::Idle);
                    out.push(Delivered::Http(pending.head));
                    Ok(true)
                }
                BodyMode::Chunked => {
                    let decoder = pending.chunk_decoder.as_mut().expect("chunked body has a decoder");
                    let raw: &[u8] = &self.buf;
                    let outcome = decoder
                        .decode(raw)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    match outcome {
                        request::ChunkOutcome::Incomplete => {
                            self.mode = ProtocolMode::Http(HttpPhase::Body(pending));
                            Ok(false)
                        }
                        request::ChunkOutcome::Data(data, consumed) => {
                            pending.head.body.extend_from_slice(data);
                            self.buf.mark_read(consumed);
                            self.mode = ProtocolMode::Http(HttpPhase::Body(pending));
                            Ok(true)
                        }
                        request::ChunkOutcome::Done(consumed) => {
                            self.buf.mark_read(consumed);
                            self.mode = ProtocolMode::Http(HttpPhase::Idle);
                            out.push(Delivered::Http(pending.head));
                            Ok(true)
                        }
                    }
                }
                BodyMode::None => unreachable!("None body never enters HttpPhase::Body"),
            },
        }
    }

    fn drain_ws(&mut self, out: &mut Vec<Delivered>) -> io::Result<bool> {
        let ProtocolMode::Ws(state) = &mut self.mode else {
            return Ok(false);
        };

        let raw: &[u8] = &self.buf;
        let outcome = ws::decode_frame(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let ws::FrameOutcome::Frame(frame) = outcome else {
            return Ok(false);
        };
        let consumed = frame.consumed;
        state.last_message = Instant::now();

        match frame.opcode {
            Opcode::Ping => {
                let pong = ws::encode_frame(Opcode::Pong, true, &frame.payload);
                self.write_queue.push_back(pong);
            }
            Opcode::Pong => {
                state.heartbeat_sent = None;
            }
            Opcode::Close => {
                state.close.remote_received = true;
                if !state.close.local_sent {
                    let payload = ws::close_payload(ws::CloseCode::Normal, "bye");
                    self.write_queue
                        .push_back(ws::encode_frame(Opcode::Close, true, &payload));
                    state.close.local_sent = true;
                }
                self.closed = true;
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                if let Some((opcode, message)) = state
                    .assembler
                    .push(frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
                {
                    out.push(Delivered::Ws(opcode, message));
                }
            }
        }

        self.buf.mark_read(consumed);
        Ok(true)
    }

    /// Upgrades this connection from HTTP to WebSocket after a
    /// successful handshake response has been queued.
    pub fn upgrade_to_ws(&mut self) {
        self.mode = ProtocolMode::Ws(WsState::new());
    }

    /// Current WebSocket state, if upgraded.
    pub fn ws_state(&self) -> Option<&WsState> {
        match &self.mode {
            ProtocolMode::Ws(state) => Some(state),
            ProtocolMode::Http(_) => None,
        }
    }

    /// Queues an HTTP response for writing.
    pub fn queue_response(&mut self, response: Response) {
        let mut bytes = Vec::new();
        let _ = response.write_to(&mut bytes);
        if response.wants_close() {
            self.close_after_flush = true;
        }
        self.write_queue.push_back(bytes);
    }

    /// Queues a raw WebSocket frame for writing.
    pub fn queue_ws_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        self.write_queue
            .push_back(ws::encode_frame(opcode, true, payload));
    }

    /// Queues whatever a dispatch handler asked to send back, in whichever
    /// wire form matches this connection's current protocol.
    pub fn apply_reply(&mut self, reply: HandlerReply) {
        match reply {
            HandlerReply::Http { status, headers, body } => {
                let mut response = Response::new(status).with_version(Version::H1_1);
                for (name, value) in headers {
                    response = response.header(name, value);
                }
                self.queue_response(response.body(body));
            }
            HandlerReply::Ws(opcode, payload) => self.queue_ws_frame(opcode, &payload),
            HandlerReply::None => {}
        }
    }

    /// Sends a ping if the WS connection has been idle past
    /// `heartbeat_idle` seconds, and closes it if a prior ping has gone
    /// unacknowledged past `heartbeat_ack_timeout` seconds.
    pub fn tick_heartbeat(&mut self, idle: std::time::Duration, ack_timeout: std::time::Duration) {
        let ProtocolMode::Ws(state) = &mut self.mode else {
            return;
        };
        let now = Instant::now();
        if let Some(sent) = state.heartbeat_sent {
            if now.duration_since(sent) > ack_timeout {
                self.closed = true;
            }
            return;
        }
        if now.duration_since(state.last_message) > idle {
            state.heartbeat_sent = Some(now);
            self.write_queue.push_back(ws::encode_frame(Opcode::Ping, true, &[]));
        }
    }

    /// Flushes as much of the write queue as the socket accepts.
    pub fn poll_write(&mut self) -> io::Result<()> {
        while let Some(front) = self.write_queue.front() {
            let write_result = match &mut self.tls {
                Some(tls) => tls.write(&mut self.stream, front).map(|(n, _)| n),
                None => self.stream.write(front),
            };
            match write_result {
                Ok(0) => break,
                Ok(n) if n == front.len() => {
                    self.write_queue.pop_front();
                }
                Ok(n) => {
                    let remaining = front[n..].to_vec();
                    self.write_queue.pop_front();
                    self.write_queue.push_front(remaining);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if let Some(tls) = &mut self.tls {
            let _ = tls.write(&mut self.stream, &[]);
        }
        if self.close_after_flush && self.write_queue.is_empty() {
            self.closed = true;
        }
        Ok(())
    }
}
