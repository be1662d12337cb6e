//! Reactor
//!
//! The single thread that owns I/O readiness polling, the connection
//! table, and the security gate. Nothing else mutates those structures.
//! Drives the protocol state machine, the dispatch registry, and the
//! worker pool directly from the accept/event loop, rather than just
//! forwarding raw readiness events.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::config::ServerConfig;
use crate::connection::{Connection, Delivered, HttpRequestContext};
use crate::dispatch::{DispatchContext, DispatchRegistry, Outcome};
use crate::log::{Level, LogSink};
use crate::mpsc::BoundedMpsc;
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream;
use crate::parser::h1::response::Response;
use crate::parser::status::Status;
use crate::security::{ConnectDecision, RequestDecision, SecurityGate};
use crate::worker::{Completion, CompletionOutcome, Task, TaskQueue, Worker};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Called once when the security gate closes a connection at the
/// request stage, before the close path runs.
pub type OnSecurityViolation = Arc<dyn Fn(usize, IpAddr) + Send + Sync>;
/// Called after a connection's close path has fully run.
pub type OnClose = Arc<dyn Fn(usize) + Send + Sync>;

struct Slot<S>
where
    S: TcpStream + Read + Write + Source,
{
    connection: Arc<Mutex<Connection<S>>>,
    generation: u64,
}

fn is_ws_upgrade(req: &HttpRequestContext) -> bool {
    req.header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// The event loop: accepts connections, drives protocol parsing, and
/// feeds deferred work to the worker pool, applying completions as they
/// arrive. Generic over the listener/stream pair so tests can run it
/// against `std::net` as well as `mio::net`.
pub struct Reactor<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    listener: T,
    poll: Poll,
    connections: Slab<Slot<S>>,
    config: ServerConfig,
    security: SecurityGate,
    registry: Arc<DispatchRegistry>,
    tasks: Arc<TaskQueue<S>>,
    completions: Arc<BoundedMpsc<Completion>>,
    close_requests: Arc<BoundedMpsc<usize>>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    log: LogSink,
    workers: Vec<JoinHandle<()>>,
    next_generation: u64,
    last_tick: Instant,
    last_zombie_sweep: Instant,
    on_security_violation: Option<OnSecurityViolation>,
    on_close: Option<OnClose>,
}

impl<T, S> Reactor<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    /// Binds the poller to `listener`, spawns the worker pool, and
    /// returns a reactor ready for [`run`](Self::run).
    pub fn new(
        mut listener: T,
        config: ServerConfig,
        registry: Arc<DispatchRegistry>,
        log: LogSink,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let tasks = Arc::new(TaskQueue::new());
        let completions = Arc::new(BoundedMpsc::new(config.finish_queue_cap));
        let close_requests = Arc::new(BoundedMpsc::new(256));
        let security = SecurityGate::new(
            config.connection_num_limit,
            config.request_times,
            config.request_secs,
            config.connection_timeout.map(Duration::from_secs),
        );

        let mut workers = Vec::with_capacity(config.worker_threads);
        for _ in 0..config.worker_threads {
            let worker = Worker::new(
                tasks.clone(),
                completions.clone(),
                registry.clone(),
                waker.clone(),
                log.clone(),
            );
            workers.push(worker.spawn());
        }

        let now = Instant::now();
        Ok(Self {
            listener,
            poll,
            connections: Slab::with_capacity(config.max_fd),
            config,
            security,
            registry,
            tasks,
            completions,
            close_requests,
            waker,
            shutdown,
            log,
            workers,
            next_generation: 0,
            last_tick: now,
            last_zombie_sweep: now,
            on_security_violation: None,
            on_close: None,
        })
    }

    /// Registers a callback invoked when the security gate closes a
    /// connection during request-stage processing.
    pub fn set_on_security_violation(&mut self, cb: OnSecurityViolation) {
        self.on_security_violation = Some(cb);
    }

    /// Registers a callback invoked once a connection's close path has
    /// finished.
    pub fn set_on_close(&mut self, cb: OnClose) {
        self.on_close = Some(cb);
    }

    /// The waker other threads use to interrupt a blocked `poll` (e.g.
    /// after requesting shutdown or a forced close).
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// The queue other threads push fds onto to force a single
    /// connection closed.
    pub fn close_sender(&self) -> Arc<BoundedMpsc<usize>> {
        self.close_requests.clone()
    }

    /// Runs the event loop until shutdown is requested. Returns only if
    /// polling itself fails; per spec this is treated as fatal and
    /// propagated to the caller.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            self.poll.poll(&mut events, Some(Duration::from_secs(1)))?;

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => {
                        if let Err(e) = self.accept() {
                            self.log.write(Level::Error, format!("accept loop failed: {e}"));
                        }
                    }
                    WAKE_TOKEN => {
                        self.drain_completions();
                        while let Some(fd) = self.close_requests.pop() {
                            self.close_connection(Token(fd));
                        }
                    }
                    token => self.handle_io(token, event),
                }
            }

            self.tick();
        }
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            let ip = addr.ip();
            let entry = self.connections.vacant_entry();
            let fd = entry.key();

            let decision =
                self.security
                    .allow_connect(ip, fd, self.config.connection_times, self.config.connection_secs);
            if decision == ConnectDecision::Close {
                self.log.write(Level::Info, format!("security gate rejected connect from {ip}"));
                continue;
            }

            let token = Token(fd);
            let generation = self.next_generation;
            self.next_generation += 1;

            let mut connection = if let Some(tls_config) = self.config.tls.clone() {
                match Connection::new_tls(stream, token, generation, ip, self.config.buffer_size, tls_config) {
                    Ok(c) => c,
                    Err(e) => {
                        self.log.write(Level::Error, format!("tls session setup failed: {e}"));
                        self.security.clear(ip, fd);
                        continue;
                    }
                }
            } else {
                Connection::new(stream, token, generation, ip, self.config.buffer_size)
            };

            if let Err(e) = connection.register(self.poll.registry()) {
                self.log.write(Level::Error, format!("register failed for fd {fd}: {e}"));
                self.security.clear(ip, fd);
                continue;
            }

            entry.insert(Slot {
                connection: Arc::new(Mutex::new(connection)),
                generation,
            });
        }
    }

    fn handle_io(&mut self, token: Token, event: &Event) {
        let Some(slot) = self.connections.get(token.0) else {
            return;
        };
        let connection_arc = slot.connection.clone();
        let generation = slot.generation;

        let closed = {
            let mut connection = connection_arc.lock().unwrap();

            if connection.pending_worker {
                if event.is_writable() {
                    let _ = connection.poll_write();
                }
            } else {
                match connection.drive_handshake() {
                    Ok(true) => {
                        if event.is_readable() {
                            match connection.poll_read() {
                                Ok(delivered) => {
                                    for msg in delivered {
                                        self.handle_delivered(&connection_arc, &mut connection, token, generation, msg);
                                    }
                                }
                                Err(e) => {
                                    self.log
                                        .write(Level::Warn, format!("read error on fd {}: {e}", token.0));
                                    connection.mark_closed();
                                }
                            }
                        }
                        if event.is_writable() {
                            let _ = connection.poll_write();
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.log.write(Level::Warn, format!("handshake error on fd {}: {e}", token.0));
                        connection.mark_closed();
                    }
                }
            }

            let closed = connection.is_closed();
            if !closed {
                if let Err(e) = connection.reregister(self.poll.registry()) {
                    self.log
                        .write(Level::Warn, format!("reregister failed for fd {}: {e}", token.0));
                }
            }
            closed
        };

        if closed {
            self.close_connection(token);
        }
    }

    fn handle_delivered(
        &mut self,
        connection_arc: &Arc<Mutex<Connection<S>>>,
        connection: &mut Connection<S>,
        token: Token,
        generation: u64,
        msg: Delivered,
    ) {
        match msg {
            Delivered::Http(req) if is_ws_upgrade(&req) => {
                match req.header("sec-websocket-key") {
                    Some(key) => {
                        let accept = crate::ws::handshake::compute_accept(key);
                        let response = Response::new(Status::SwitchingProtocols)
                            .header("Upgrade", "websocket")
                            .header("Connection", "Upgrade")
                            .header("Sec-WebSocket-Accept", accept);
                        connection.queue_response(response.body(Vec::new()));
                        connection.upgrade_to_ws();
                    }
                    None => {
                        connection.queue_response(Response::new(Status::BadRequest).body(Vec::new()));
                    }
                }
            }
            Delivered::Http(req) => {
                let ip = connection.peer_ip();
                let fd = token.0;
                match self.security.allow_request(ip, fd, Some(req.path())) {
                    RequestDecision::Close => {
                        if let Some(cb) = &self.on_security_violation {
                            cb(fd, ip);
                        }
                        connection.mark_closed();
                    }
                    RequestDecision::Drop => {}
                    RequestDecision::Allow => {
                        self.apply_dispatch(connection_arc, connection, token, generation, DispatchContext::Http(req));
                    }
                }
            }
            Delivered::Ws(opcode, payload) => {
                self.apply_dispatch(
                    connection_arc,
                    connection,
                    token,
                    generation,
                    DispatchContext::Ws(opcode, payload),
                );
            }
        }
    }

    fn apply_dispatch(
        &mut self,
        connection_arc: &Arc<Mutex<Connection<S>>>,
        connection: &mut Connection<S>,
        token: Token,
        generation: u64,
        ctx: DispatchContext,
    ) {
        let (outcome, reply) = self.registry.dispatch(&ctx);
        match outcome {
            Outcome::Ok => connection.apply_reply(reply),
            Outcome::FailKeep => {
                self.log.write(Level::Warn, "handler failed, connection kept open");
            }
            Outcome::FailClose => connection.mark_closed(),
            Outcome::Deferred => {
                connection.pending_worker = true;
                self.tasks.push(Task {
                    connection: connection_arc.clone(),
                    token,
                    generation,
                    work: ctx,
                });
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Some(completion) = self.completions.pop() {
            let Some(slot) = self.connections.get(completion.token.0) else {
                continue;
            };
            if slot.generation != completion.generation {
                continue;
            }
            let connection_arc = slot.connection.clone();

            let closed = {
                let mut connection = connection_arc.lock().unwrap();
                connection.pending_worker = false;
                match completion.outcome {
                    CompletionOutcome::Ok => {}
                    CompletionOutcome::FailKeep => {
                        self.log.write(Level::Warn, "deferred task failed, connection kept open");
                    }
                    CompletionOutcome::FailClose => connection.mark_closed(),
                }
                let _ = connection.poll_write();

                let closed = connection.is_closed();
                if !closed {
                    let _ = connection.reregister(self.poll.registry());
                }
                closed
            };

            if closed {
                self.close_connection(completion.token);
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_tick) < Duration::from_secs(1) {
            return;
        }
        self.last_tick = now;

        let run_zombie_sweep = match self.config.check_frequency {
            Some(secs) if now.duration_since(self.last_zombie_sweep) >= Duration::from_secs(secs) => {
                self.last_zombie_sweep = now;
                true
            }
            _ => false,
        };

        let heartbeat_idle = Duration::from_secs(self.config.heartbeat_idle);
        let heartbeat_ack_timeout = Duration::from_secs(self.config.heartbeat_ack_timeout);

        let mut to_close = Vec::new();
        for (key, slot) in self.connections.iter() {
            let mut connection = slot.connection.lock().unwrap();
            connection.tick_heartbeat(heartbeat_idle, heartbeat_ack_timeout);

            if run_zombie_sweep && self.security.connection_detect(connection.peer_ip(), key) {
                connection.mark_closed();
            }

            let _ = connection.poll_write();
            if connection.is_closed() {
                to_close.push(Token(key));
            } else {
                let _ = connection.reregister(self.poll.registry());
            }
        }

        for token in to_close {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        let Some(slot) = self.connections.try_remove(token.0) else {
            return;
        };
        let mut connection = slot.connection.lock().unwrap();
        if let Err(e) = connection.deregister(self.poll.registry()) {
            self.log
                .write(Level::Warn, format!("deregister failed for fd {}: {e}", token.0));
        }
        let ip = connection.peer_ip();
        drop(connection);

        self.security.clear(ip, token.0);
        if let Some(cb) = &self.on_close {
            cb(token.0);
        }
        self.log.write(Level::Info, format!("closed fd {}", token.0));
    }

    /// Stops accepting new work, drains the worker pool, and joins its
    /// threads. In-flight tasks run to completion before their threads
    /// exit; their completions are simply never drained afterward.
    pub fn shutdown(self) {
        self.tasks.shutdown();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}
