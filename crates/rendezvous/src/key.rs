//! Single-use security keys.
//!
//! A [`SecurityKey`] is the only secret shared between a waiting registration
//! and the terminal window that dials back into the rendezvous listener. It is
//! derived by hashing the window title together with fresh OS randomness with
//! SHA-512, and is hex encoded so it can travel on a shell command line.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::error::{ProtocolError, Result};

/// Length of an encoded security key in characters (hex encoded SHA-512).
pub const SECURITY_KEY_LENGTH: usize = 128;

/// Amount of fresh randomness mixed into every key.
const ENTROPY_BYTES: usize = 512;

/// Domain separation prefix for key derivation.
const KEY_DOMAIN: &[u8] = b"security-key";

/// An opaque, random secret identifying one rendezvous registration.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SecurityKey(String);

impl SecurityKey {
    /// Generates a new random key bound to `title`.
    pub fn generate(title: &str) -> Self {
        let mut entropy = [0u8; ENTROPY_BYTES];
        OsRng.fill_bytes(&mut entropy);

        let mut hasher = Sha512::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(b"::");
        hasher.update(title.as_bytes());
        hasher.update(b"::");
        hasher.update(entropy);

        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a key received from the wire.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != SECURITY_KEY_LENGTH {
            return Err(ProtocolError::MalformedHandshake(format!(
                "expected {} characters, got {}",
                SECURITY_KEY_LENGTH,
                value.len()
            )));
        }

        if !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ProtocolError::MalformedHandshake(
                "key is not lowercase hex".to_string(),
            ));
        }

        Ok(Self(value.to_string()))
    }

    /// Returns the encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short, non-secret prefix suitable for log output.
    pub fn fingerprint(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Debug for SecurityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurityKey({}…)", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_length_and_alphabet() {
        let key = SecurityKey::generate("scripting ls");
        assert_eq!(key.as_str().len(), SECURITY_KEY_LENGTH);
        assert!(key
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let first = SecurityKey::generate("same title");
        let second = SecurityKey::generate("same title");
        assert_ne!(first, second);
    }

    #[test]
    fn test_parse_accepts_generated_key() {
        let key = SecurityKey::generate("title");
        let parsed = SecurityKey::parse(key.as_str()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = SecurityKey::parse("abc").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHandshake(_)));
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        let value = "z".repeat(SECURITY_KEY_LENGTH);
        assert!(SecurityKey::parse(&value).is_err());

        let upper = "A".repeat(SECURITY_KEY_LENGTH);
        assert!(SecurityKey::parse(&upper).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = SecurityKey::generate("title");
        let debug = format!("{:?}", key);
        assert!(debug.contains(key.fingerprint()));
        assert!(!debug.contains(key.as_str()));
    }
}
