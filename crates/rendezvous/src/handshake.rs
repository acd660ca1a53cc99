//! Rendezvous handshake codec.
//!
//! # Wire Format
//!
//! A terminal window connecting to the rendezvous listener sends exactly one
//! line:
//! - N bytes: the security key, ASCII lowercase hex
//! - 1 byte: `\n`
//!
//! The server sends no response. After the line the connection is a raw
//! duplex byte pipe.

use crate::error::{ProtocolError, Result};
use crate::key::SecurityKey;

/// Maximum handshake line size including the terminator.
pub const MAX_HANDSHAKE_SIZE: usize = 1024;

/// Line terminator for the handshake.
pub const HANDSHAKE_TERMINATOR: u8 = b'\n';

/// Default TCP port for the rendezvous listener.
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 8888;

/// Encodes the handshake line for `key`.
pub fn encode_handshake(key: &SecurityKey) -> Vec<u8> {
    let mut line = Vec::with_capacity(key.as_str().len() + 1);
    line.extend_from_slice(key.as_str().as_bytes());
    line.push(HANDSHAKE_TERMINATOR);
    line
}

/// Decodes a handshake line as read from the connection.
///
/// `line` must contain the terminator; a missing terminator means the peer
/// closed the connection before finishing the handshake. A trailing `\r`
/// is tolerated for peers that emit CRLF.
pub fn decode_handshake(line: &[u8]) -> Result<SecurityKey> {
    if line.len() > MAX_HANDSHAKE_SIZE {
        return Err(ProtocolError::HandshakeTooLong {
            size: line.len(),
            max: MAX_HANDSHAKE_SIZE,
        });
    }

    let body = line
        .strip_suffix(&[HANDSHAKE_TERMINATOR])
        .ok_or_else(|| ProtocolError::MalformedHandshake("missing newline".to_string()))?;
    let body = body.strip_suffix(b"\r").unwrap_or(body);

    let text = std::str::from_utf8(body)
        .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))?;

    SecurityKey::parse(text)
}
