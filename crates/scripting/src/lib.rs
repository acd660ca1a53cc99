//! # Scripting
//!
//! Run shell commands from async Rust and talk to them while they run.
//!
//! ## Overview
//!
//! - **Streamers**: turn a child's stdout/stderr into one ordered stream of
//!   [`OutputEvent`]s ending in exactly one return-code event, and write to
//!   its stdin
//! - **Terminal sessions**: open a terminal window that dials back over a
//!   local socket, matched to the waiting call by a single-use key
//! - **Orchestrator**: template a command, run it, capture its output or
//!   forward it into a terminal, and validate the return code
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Scripting (orchestrator)                  │
//! │   render cmd/input ──► CommandStreamer ──► capture / forward  │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │  Templating                   │  SessionServer                │
//! │  (PlaceholderTemplating)      │  ├─ TerminalLauncher          │
//! │                               │  └─ SessionClient ◄── socket  │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │  ProcessStreamer / DryRunStreamer        rendezvous crate     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scripting::{CallOptions, Scripting, ScriptingConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scripting = Scripting::new(&ScriptingConfig::load_default()?);
//!
//!     let listing = scripting
//!         .capture("ls -la {{ dir|quote }}", &CallOptions::new().set("dir", "/tmp"))
//!         .await?;
//!     print!("{listing}");
//!
//!     let code = scripting.interact("top -n 1", &CallOptions::new()).await?;
//!     assert_eq!(code, 0);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`streamer`]: Process stream multiplexing
//! - [`session`]: Terminal rendezvous server, client and launchers
//! - [`templating`]: Command templating and shell quoting
//! - [`orchestrator`]: `call` / `capture` / `interact`
//! - [`blocking`]: Synchronous facade

pub mod blocking;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod streamer;
pub mod templating;

// Re-export the protocol crate for convenience
pub use rendezvous;

pub use blocking::BlockingScripting;
pub use config::{ScriptingConfig, TerminalKind};
pub use error::{InvalidReturnCode, ScriptingError};
pub use orchestrator::{CallOptions, CapturedOutput, Scripting};
pub use session::{
    ClientState, InlineLauncher, MultiplexerLauncher, ServerState, SessionClient, SessionError,
    SessionServer, TerminalLauncher,
};
pub use streamer::{
    Chunk, CommandStreamer, DryRunStreamer, OutputEvent, ProcessStreamer, Source, StreamError,
    Streamer, StreamerOptions,
};
pub use templating::{Context, PlaceholderTemplating, TemplateError, Templating};
