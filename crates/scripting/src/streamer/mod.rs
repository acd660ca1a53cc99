//! Process stream multiplexing.
//!
//! A [`Streamer`] turns a child process's stdout/stderr into one ordered
//! sequence of [`OutputEvent`]s terminated by exactly one
//! [`OutputEvent::ReturnCode`], and optionally accepts input on stdin.
//!
//! Two implementations share the contract:
//! - [`ProcessStreamer`] spawns `<shell> -c <cmd>` and reads its pipes.
//! - [`DryRunStreamer`] never spawns anything and immediately reports a
//!   successful exit.
//!
//! [`CommandStreamer`] dispatches to either one so callers only deal with a
//! single type.

mod dry_run;
mod event;
mod process;

pub use dry_run::DryRunStreamer;
pub use event::{Chunk, OutputEvent, Source};
pub use process::ProcessStreamer;

use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::process::ChildStdin;

use crate::config::ProcessConfig;

/// Errors that can occur while driving a streamer.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The shell could not be launched.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// The command that was being launched.
        command: String,
        /// Underlying spawn failure.
        source: std::io::Error,
    },

    /// Stdin was never opened or has already been closed.
    #[error("stdin is not writable: the streamer was created without can_write or stdin has been closed")]
    WriteAfterClose,

    /// The streamer was used before `create` was called.
    #[error("streamer has not been created")]
    NotCreated,

    /// `create` was called twice on the same streamer.
    #[error("streamer has already been created")]
    AlreadyCreated,

    /// A line read with encoding management was not valid UTF-8.
    #[error("{stream} produced output that was not valid UTF-8")]
    Decode {
        /// The stream the line came from.
        stream: Source,
        /// Underlying decoding failure.
        #[source]
        error: std::string::FromUtf8Error,
    },

    /// I/O error on one of the pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default size of a single pipe read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Configuration fixed when a streamer is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerOptions {
    /// Whether stdin is opened for writing.
    pub can_write: bool,
    /// Whether stderr is folded into stdout.
    pub merge_stderr: bool,
    /// Whether line reads decode their payload to text.
    pub manage_encoding: bool,
    /// Shell used to interpret commands, invoked as `<shell> -c <cmd>`.
    pub shell: String,
    /// Whether dropping the streamer kills the child.
    pub kill_on_drop: bool,
    /// Size of a single pipe read for unlimited chunk reads.
    pub read_buffer_size: usize,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            can_write: true,
            merge_stderr: true,
            manage_encoding: true,
            shell: "/bin/sh".to_string(),
            kill_on_drop: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl StreamerOptions {
    /// Creates options from the process section of the configuration.
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            kill_on_drop: config.kill_on_drop,
            read_buffer_size: config.read_buffer_size,
            ..Self::default()
        }
    }

    /// Sets whether stdin is writable.
    pub fn can_write(mut self, can_write: bool) -> Self {
        self.can_write = can_write;
        self
    }

    /// Sets whether stderr is merged into stdout.
    pub fn merge_stderr(mut self, merge_stderr: bool) -> Self {
        self.merge_stderr = merge_stderr;
        self
    }

    /// Sets whether line reads are decoded to text.
    pub fn manage_encoding(mut self, manage_encoding: bool) -> Self {
        self.manage_encoding = manage_encoding;
        self
    }
}

/// How a streamer should cut the next data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Up to `limit` bytes; `None` reads whatever is available.
    Chunk(Option<usize>),
    /// Up to and including the next newline, or EOF.
    Line { manage_newline: bool },
}

/// The capability contract shared by all streamers.
#[allow(async_fn_in_trait)]
pub trait Streamer {
    /// Starts the command. A streamer is created at most once.
    async fn create(&mut self, cmd: &str) -> Result<(), StreamError>;

    /// Returns the next chunk of at most `limit` bytes, or the terminal event
    /// once every stream is exhausted and the process has exited.
    ///
    /// Stderr takes priority over stdout when both have data ready.
    async fn read(&mut self, limit: Option<usize>) -> Result<OutputEvent, StreamError>;

    /// Like [`Streamer::read`], but each data event is one line.
    ///
    /// With `manage_newline` the trailing line terminator is removed.
    async fn read_line(&mut self, manage_newline: bool) -> Result<OutputEvent, StreamError>;

    /// Writes `data` to stdin, closing stdin afterwards when `close` is set.
    async fn write(&mut self, data: &[u8], close: bool) -> Result<(), StreamError>;

    /// Writes each line in order, then applies the same close semantics.
    async fn write_lines<B>(&mut self, lines: &[B], close: bool) -> Result<(), StreamError>
    where
        B: AsRef<[u8]>;

    /// Returns the exit code once the terminal event has been observed.
    fn get_return_code(&self) -> Option<i32>;

    /// Iterates over data chunks until the terminal event.
    ///
    /// The terminal event itself is not yielded; its value is available from
    /// [`Streamer::get_return_code`] afterwards. The stream stops after the
    /// first error.
    fn iter(
        &mut self,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<OutputEvent, StreamError>> + '_
    where
        Self: Sized,
    {
        events(self, ReadMode::Chunk(limit))
    }

    /// Iterates over lines until the terminal event.
    fn iter_lines(
        &mut self,
        manage_newline: bool,
    ) -> impl Stream<Item = Result<OutputEvent, StreamError>> + '_
    where
        Self: Sized,
    {
        events(self, ReadMode::Line { manage_newline })
    }
}

fn events<S: Streamer>(
    streamer: &mut S,
    mode: ReadMode,
) -> impl Stream<Item = Result<OutputEvent, StreamError>> + '_ {
    stream::unfold(Some(streamer), move |state| async move {
        let streamer = state?;
        let next = match mode {
            ReadMode::Chunk(limit) => streamer.read(limit).await,
            ReadMode::Line { manage_newline } => streamer.read_line(manage_newline).await,
        };

        match next {
            Ok(event) if event.has_more() => Some((Ok(event), Some(streamer))),
            Ok(_) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// A streamer that is either process-backed or a dry run.
#[derive(Debug)]
pub enum CommandStreamer {
    /// Backed by a real child process.
    Process(ProcessStreamer),
    /// Simulated successful run.
    DryRun(DryRunStreamer),
}

impl CommandStreamer {
    /// Creates a streamer of the requested kind, not yet started.
    pub fn new(options: StreamerOptions, dry_run: bool) -> Self {
        if dry_run {
            CommandStreamer::DryRun(DryRunStreamer::new())
        } else {
            CommandStreamer::Process(ProcessStreamer::new(options))
        }
    }

    /// Returns true when no process backs this streamer.
    pub fn is_dry_run(&self) -> bool {
        matches!(self, CommandStreamer::DryRun(_))
    }

    /// Returns the child's process id while it is running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            CommandStreamer::Process(streamer) => streamer.pid(),
            CommandStreamer::DryRun(_) => None,
        }
    }

    /// Hands over the child's stdin. Dry runs have none and return `None`.
    pub fn take_stdin(&mut self) -> Result<Option<ChildStdin>, StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.take_stdin().map(Some),
            CommandStreamer::DryRun(_) => Ok(None),
        }
    }

    /// Forcibly terminates the child. A no-op for dry runs.
    pub fn kill(&mut self) -> Result<(), StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.kill(),
            CommandStreamer::DryRun(_) => Ok(()),
        }
    }
}

impl Streamer for CommandStreamer {
    async fn create(&mut self, cmd: &str) -> Result<(), StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.create(cmd).await,
            CommandStreamer::DryRun(streamer) => streamer.create(cmd).await,
        }
    }

    async fn read(&mut self, limit: Option<usize>) -> Result<OutputEvent, StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.read(limit).await,
            CommandStreamer::DryRun(streamer) => streamer.read(limit).await,
        }
    }

    async fn read_line(&mut self, manage_newline: bool) -> Result<OutputEvent, StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.read_line(manage_newline).await,
            CommandStreamer::DryRun(streamer) => streamer.read_line(manage_newline).await,
        }
    }

    async fn write(&mut self, data: &[u8], close: bool) -> Result<(), StreamError> {
        match self {
            CommandStreamer::Process(streamer) => streamer.write(data, close).await,
            CommandStreamer::DryRun(streamer) => streamer.write(data, close).await,
        }
    }

    async fn write_lines<B>(&mut self, lines: &[B], close: bool) -> Result<(), StreamError>
    where
        B: AsRef<[u8]>,
    {
        match self {
            CommandStreamer::Process(streamer) => streamer.write_lines(lines, close).await,
            CommandStreamer::DryRun(streamer) => streamer.write_lines(lines, close).await,
        }
    }

    fn get_return_code(&self) -> Option<i32> {
        match self {
            CommandStreamer::Process(streamer) => streamer.get_return_code(),
            CommandStreamer::DryRun(streamer) => streamer.get_return_code(),
        }
    }
}
