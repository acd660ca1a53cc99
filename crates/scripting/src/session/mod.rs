//! Terminal rendezvous.
//!
//! Interactive commands stream their output into a separate terminal window.
//! The window is opened by a [`TerminalLauncher`] and dials back to a local
//! [`SessionServer`], presenting the [`SessionClient`]'s security key as its
//! first line. The server hands the matched connection to the client, which
//! then forwards bytes into it.

mod client;
mod launcher;
mod server;

pub use client::{ClientState, Connection, SessionClient};
pub use launcher::{InlineLauncher, MultiplexerLauncher, TerminalLauncher};
pub use server::{ServerState, SessionServer};

use std::time::Duration;

use rendezvous::ProtocolError;
use thiserror::Error;

/// Errors that can occur during rendezvous operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Invalid state transition or handshake.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The listener could not be bound.
    #[error("failed to bind rendezvous listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// The listener is not running.
    #[error("rendezvous listener is not running")]
    NotListening,

    /// The terminal window could not be opened.
    #[error("failed to launch terminal: {0}")]
    Launch(String),

    /// No terminal presented the key in time.
    #[error("no terminal connected within {0:?}")]
    Timeout(Duration),

    /// The registration was cancelled before a terminal connected.
    #[error("registration was cancelled before a terminal connected")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
