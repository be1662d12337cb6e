// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single-host reactor network server: TCP, HTTP/1.x, and WebSocket
//! over a readiness-based event loop, with a per-IP/per-FD connection
//! security gate and a fixed worker thread pool for handlers that can't
//! run on the reactor thread.
//!
//! [`Server`] is the entry point: build one from a [`ServerConfig`],
//! register handlers through [`DispatchRegistry`]-shaped setters, then
//! call [`Server::start_listen`].

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod mpsc;
pub mod net;
pub mod parser;
pub mod reactor;
pub mod security;
pub mod tls;
pub mod worker;
pub mod ws;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::TcpListener as MioTcpListener;
use mio::net::TcpStream as MioTcpStream;
use mio::Waker;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use config::ServerConfig;
use dispatch::{DispatchRegistry, Handler, KeyExtractor};
use log::{Level, LogHandle, LogSink};
use mpsc::BoundedMpsc;
use reactor::{OnClose, OnSecurityViolation, Reactor};

/// The framework's entry point: owns configuration and handler
/// registration before [`start_listen`](Self::start_listen) hands
/// everything off to the reactor thread.
pub struct Server {
    config: ServerConfig,
    registry: DispatchRegistry,
    on_close: Option<OnClose>,
    on_security_violation: Option<OnSecurityViolation>,
    log: Option<LogSink>,
    log_handle: Option<LogHandle>,
    handle: Option<JoinHandle<io::Result<()>>>,
    shutdown: Option<Arc<AtomicBool>>,
    waker: Option<Arc<Waker>>,
    close_requests: Option<Arc<BoundedMpsc<usize>>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Builds a server from `config`. Nothing is bound or spawned until
    /// [`start_listen`](Self::start_listen).
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: DispatchRegistry::new(),
            on_close: None,
            on_security_violation: None,
            log: None,
            log_handle: None,
            handle: None,
            shutdown: None,
            waker: None,
            close_requests: None,
            local_addr: None,
        }
    }

    /// Registers the callback run once when the security gate closes a
    /// connection during request-stage processing.
    pub fn on_security_violation(&mut self, cb: impl Fn(usize, IpAddr) + Send + Sync + 'static) {
        self.on_security_violation = Some(Arc::new(cb));
    }

    /// Registers the callback run after a connection's close path has
    /// fully completed.
    pub fn on_close(&mut self, cb: impl Fn(usize) + Send + Sync + 'static) {
        self.on_close = Some(Arc::new(cb));
    }

    /// Overrides the default dispatch key extractor (HTTP path or raw WS
    /// payload).
    pub fn set_key_function(&mut self, key_fn: KeyExtractor) {
        self.registry.set_key_function(key_fn);
    }

    /// Registers a handler under `key`, appended after any already
    /// registered for that key.
    pub fn set_function(&mut self, key: impl Into<String>, handler: Handler) {
        self.registry.set_function(key, handler);
    }

    /// Registers a fallback handler, run when no key-specific chain
    /// matches.
    pub fn set_global_solve_function(&mut self, handler: Handler) {
        self.registry.set_global_solve_function(handler);
    }

    /// Loads a TLS certificate/key pair and enables TLS for subsequent
    /// connections. On any failure, returns `false` and leaves a
    /// previously configured TLS context (if any) untouched.
    ///
    /// `key_passphrase` is accepted for interface parity with the
    /// original implementation but is not applied: encrypted private
    /// keys aren't supported by the PEM parser this framework uses.
    /// `ca_path`, when given, enables mutual TLS by requiring client
    /// certificates signed by one of the CAs in that bundle.
    pub fn set_tls(
        &mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        _key_passphrase: Option<&str>,
        ca_path: Option<impl AsRef<Path>>,
    ) -> bool {
        match build_tls_config(cert_path.as_ref(), key_path.as_ref(), ca_path.as_ref().map(|p| p.as_ref())) {
            Ok(tls) => {
                self.config.tls = Some(Arc::new(tls));
                true
            }
            Err(e) => {
                if let Some(log) = &self.log {
                    log.write(Level::Error, format!("set_tls failed: {e}"));
                }
                false
            }
        }
    }

    /// Opens the log sink, binds the listener, and spawns the reactor
    /// and worker threads. Blocks only long enough to bind and register;
    /// the event loop itself runs on its own thread.
    pub fn start_listen(&mut self, port: u16, threads: usize) -> io::Result<()> {
        let (log, log_handle) = LogSink::open(&self.config.log_path, self.config.log_level)?;
        self.config.worker_threads = threads;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = MioTcpListener::bind(addr)?;
        self.local_addr = Some(listener.local_addr()?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(std::mem::take(&mut self.registry));

        let mut reactor: Reactor<MioTcpListener, MioTcpStream> =
            Reactor::new(listener, self.config.clone(), registry, log.clone(), shutdown.clone())?;

        if let Some(cb) = self.on_close.take() {
            reactor.set_on_close(cb);
        }
        if let Some(cb) = self.on_security_violation.take() {
            reactor.set_on_security_violation(cb);
        }

        self.waker = Some(reactor.waker());
        self.close_requests = Some(reactor.close_sender());
        self.shutdown = Some(shutdown);
        self.log = Some(log);
        self.log_handle = Some(log_handle);
        self.handle = Some(std::thread::spawn(move || reactor.run()));

        Ok(())
    }

    /// The address the listener is bound to, once [`start_listen`](Self::start_listen)
    /// has succeeded. Useful when binding to port 0 for an OS-assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Forces a single connection closed. A no-op if the reactor isn't
    /// running or the fd is already gone.
    pub fn close_fd(&self, fd: usize) {
        if let (Some(queue), Some(waker)) = (&self.close_requests, &self.waker) {
            let _ = queue.push(fd);
            let _ = waker.wake();
        }
    }

    /// Stops accepting new connections, drains in-flight work, and
    /// blocks until the reactor and worker threads have fully exited.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(shutdown) = &self.shutdown {
            shutdown.store(true, Ordering::Relaxed);
        }
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
        if let Some(handle) = self.handle.take() {
            handle.join().expect("reactor thread panicked")?;
        }
        // Dropping the log handle joins its consumer thread after
        // flushing anything still queued.
        self.log_handle.take();
        Ok(())
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()
}

fn load_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}

fn build_tls_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> io::Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let config = match ca_path {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    };

    config.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

// DispatchContext/HandlerReply/Outcome re-exported at crate root so user
// handler closures don't need to reach into the `dispatch` module by
// hand for every signature.
pub use dispatch::{DispatchContext as Context, HandlerReply as Reply, Outcome as HandlerOutcome};
