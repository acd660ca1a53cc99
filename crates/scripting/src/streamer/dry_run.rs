//! Dry-run streamer.

use super::{OutputEvent, StreamError, Streamer};

/// A streamer that never launches a process.
///
/// Every read returns the terminal event with code 0 and writes are
/// discarded. A dry run is observably identical to a real command that
/// succeeded without output; use [`super::CommandStreamer::is_dry_run`] to
/// tell them apart.
#[derive(Debug, Default, Clone)]
pub struct DryRunStreamer {
    command: Option<String>,
}

impl DryRunStreamer {
    /// Creates a dry-run streamer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the command that would have been run.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }
}

impl Streamer for DryRunStreamer {
    async fn create(&mut self, cmd: &str) -> Result<(), StreamError> {
        tracing::debug!(command = %cmd, "Dry run, not spawning");
        self.command = Some(cmd.to_string());
        Ok(())
    }

    async fn read(&mut self, _limit: Option<usize>) -> Result<OutputEvent, StreamError> {
        Ok(OutputEvent::ReturnCode(0))
    }

    async fn read_line(&mut self, _manage_newline: bool) -> Result<OutputEvent, StreamError> {
        Ok(OutputEvent::ReturnCode(0))
    }

    async fn write(&mut self, _data: &[u8], _close: bool) -> Result<(), StreamError> {
        Ok(())
    }

    async fn write_lines<B>(&mut self, _lines: &[B], _close: bool) -> Result<(), StreamError>
    where
        B: AsRef<[u8]>,
    {
        Ok(())
    }

    fn get_return_code(&self) -> Option<i32> {
        Some(0)
    }
}
