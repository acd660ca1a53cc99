//! # Rendezvous Protocol Library
//!
//! This crate provides the runtime-independent pieces of the terminal
//! rendezvous protocol used by the `scripting` crate to hand a running
//! command off to an interactive terminal window.
//!
//! ## Overview
//!
//! - **State Machine**: A generic guarded finite-state machine, shared by the
//!   session server lifecycle and the session client connection state
//! - **Security Keys**: Single-use random secrets matching a terminal
//!   connection to the registration waiting for it
//! - **Handshake Codec**: The one-line wire format the terminal sends
//!
//! ## Protocol Flow
//!
//! ```text
//! caller                      server                    terminal window
//!   │  register(client) ──────▶ │                             │
//!   │                           │ ── launch(title, key) ────▶ │
//!   │                           │ ◀──── "<key>\n" over TCP ── │
//!   │ ◀──── connection ──────── │                             │
//!   │ ═══════════ raw duplex byte pipe ═════════════════════▶ │
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use rendezvous::{decode_handshake, encode_handshake, SecurityKey};
//!
//! let key = SecurityKey::generate("scripting make test");
//! let line = encode_handshake(&key);
//! assert_eq!(decode_handshake(&line).unwrap(), key);
//! ```
//!
//! ## Modules
//!
//! - [`state`]: Finite-state machine helper
//! - [`key`]: Security key generation and parsing
//! - [`handshake`]: Handshake line codec
//! - [`error`]: Error types

pub mod error;
pub mod handshake;
pub mod key;
pub mod state;

pub use error::{ProtocolError, Result};
pub use handshake::{
    decode_handshake, encode_handshake, DEFAULT_RENDEZVOUS_PORT, HANDSHAKE_TERMINATOR,
    MAX_HANDSHAKE_SIZE,
};
pub use key::{SecurityKey, SECURITY_KEY_LENGTH};
pub use state::StateMachine;
