//! WebSocket opening handshake (RFC 6455 Section 4.2.2).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

/// The fixed GUID appended to the client's key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` header value for a given
/// `Sec-WebSocket-Key`.
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    STANDARD.encode(digest)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_rfc_6455_worked_example() {
        assert_eq!(
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
            compute_accept("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }
}
