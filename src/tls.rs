//! TLS adapter
//!
//! Wraps a [`rustls::ServerConnection`] with the non-blocking
//! `handshake_step`/`read`/`write` surface the reactor expects, hiding
//! retry and `WANT_READ`/`WANT_WRITE` bookkeeping behind an outcome enum.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use rustls::ServerConnection;

/// Outcome of advancing (or attempting to use) a TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsOutcome {
    /// The operation completed.
    Done,
    /// The underlying socket would block on a read; re-arm readable
    /// interest and retry later.
    NeedRead,
    /// The underlying socket would block on a write; re-arm writable
    /// interest and retry later.
    NeedWrite,
    /// The peer closed the connection.
    Eof,
}

/// Non-blocking adapter over a server-side TLS session.
pub struct TlsAdapter {
    session: ServerConnection,
}

impl TlsAdapter {
    /// Starts a new session from a (possibly hot-reloaded) server config.
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(Self {
            session: ServerConnection::new(config)?,
        })
    }

    /// Advances the handshake by pumping ciphertext in both directions.
    /// Returns [`TlsOutcome::Done`] once `is_handshaking()` goes false.
    pub fn handshake_step(&mut self, socket: &mut (impl Read + Write)) -> io::Result<TlsOutcome> {
        if !self.session.is_handshaking() {
            return Ok(TlsOutcome::Done);
        }

        if self.session.wants_write() {
            match self.session.write_tls(socket) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(TlsOutcome::NeedWrite),
                Err(e) => return Err(e),
            }
        }

        if self.session.wants_read() {
            match self.session.read_tls(socket) {
                Ok(0) => return Ok(TlsOutcome::Eof),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(TlsOutcome::NeedRead),
                Err(e) => return Err(e),
            }
        }

        Ok(if self.session.is_handshaking() {
            TlsOutcome::NeedRead
        } else {
            TlsOutcome::Done
        })
    }

    /// Reads decrypted application data into `buf`, pumping ciphertext
    /// off the socket first.
    pub fn read(
        &mut self,
        socket: &mut (impl Read + Write),
        buf: &mut [u8],
    ) -> io::Result<(usize, TlsOutcome)> {
        match self.session.read_tls(socket) {
            Ok(0) => return Ok((0, TlsOutcome::Eof)),
            Ok(_) => {
                self.session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match self.session.reader().read(buf) {
            Ok(n) => Ok((n, TlsOutcome::Done)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((0, TlsOutcome::NeedRead)),
            Err(e) => Err(e),
        }
    }

    /// Queues application data for encryption, then flushes ciphertext to
    /// the socket.
    pub fn write(
        &mut self,
        socket: &mut (impl Read + Write),
        buf: &[u8],
    ) -> io::Result<(usize, TlsOutcome)> {
        let n = self.session.writer().write(buf)?;
        match self.session.write_tls(socket) {
            Ok(_) => Ok((n, TlsOutcome::Done)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((n, TlsOutcome::NeedWrite)),
            Err(e) => Err(e),
        }
    }

    /// Sends a `close_notify` alert.
    pub fn shutdown(&mut self) {
        self.session.send_close_notify();
    }

    /// Negotiated ALPN protocol, if any (used to detect an h2 client
    /// preface, which this framework rejects).
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.alpn_protocol()
    }

    /// Whether the session has ciphertext queued to send, e.g. mid
    /// handshake or holding a `close_notify`.
    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    fn test_config() -> Arc<rustls::ServerConfig> {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = CertificateDer::from(key.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));
        Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der)
                .unwrap(),
        )
    }

    #[test]
    fn new_session_starts_handshaking() {
        let adapter = TlsAdapter::new(test_config()).unwrap();
        assert!(adapter.session.is_handshaking());
    }
}
