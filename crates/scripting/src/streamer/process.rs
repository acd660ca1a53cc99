//! Process-backed streamer.

use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::{Chunk, OutputEvent, ReadMode, Source, StreamError, Streamer, StreamerOptions};

/// One readable pipe of the child.
#[derive(Debug)]
struct StreamSlot<R> {
    source: Source,
    reader: BufReader<R>,
    /// Bytes of a line read that was interrupted before reaching a newline.
    partial: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamSlot<R> {
    fn new(source: Source, reader: R) -> Self {
        Self {
            source,
            reader: BufReader::new(reader),
            partial: Vec::new(),
            eof: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.eof
    }

    /// Reads the next piece of data, or `None` at end of stream.
    ///
    /// Cancel safe: a line read that loses a race keeps its bytes in
    /// `partial` and the next call picks up where it stopped.
    async fn next(&mut self, mode: ReadMode, buffer_size: usize) -> std::io::Result<Option<Vec<u8>>> {
        match mode {
            ReadMode::Chunk(limit) => {
                let want = limit.unwrap_or(buffer_size).max(1);

                if !self.partial.is_empty() {
                    let take = want.min(self.partial.len());
                    return Ok(Some(self.partial.drain(..take).collect()));
                }

                let mut buf = vec![0u8; want];
                let n = self.reader.read(&mut buf).await?;
                if n == 0 {
                    self.eof = true;
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
            ReadMode::Line { .. } => {
                self.reader.read_until(b'\n', &mut self.partial).await?;
                if self.partial.is_empty() {
                    self.eof = true;
                    return Ok(None);
                }
                Ok(Some(std::mem::take(&mut self.partial)))
            }
        }
    }
}

/// A streamer backed by a child process run through the configured shell.
///
/// With `kill_on_drop` set (the default) dropping the streamer before the
/// child has exited kills the child.
#[derive(Debug)]
pub struct ProcessStreamer {
    options: StreamerOptions,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<StreamSlot<ChildStderr>>,
    stdout: Option<StreamSlot<ChildStdout>>,
    return_code: Option<i32>,
}

impl ProcessStreamer {
    /// Creates a streamer; the process starts on [`Streamer::create`].
    pub fn new(options: StreamerOptions) -> Self {
        Self {
            options,
            child: None,
            stdin: None,
            stderr: None,
            stdout: None,
            return_code: None,
        }
    }

    /// Returns the options this streamer was constructed with.
    pub fn options(&self) -> &StreamerOptions {
        &self.options
    }

    /// Returns the child's process id while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Sends a kill signal to the child.
    ///
    /// The terminal event is still produced by the next read, once the pipes
    /// drain and the exit status is collected.
    pub fn kill(&mut self) -> Result<(), StreamError> {
        let child = self.child.as_mut().ok_or(StreamError::NotCreated)?;
        if self.return_code.is_none() {
            tracing::debug!(pid = ?child.id(), "Killing child process");
            child.start_kill()?;
        }
        Ok(())
    }

    /// Hands over the child's stdin so it can be written from another task.
    ///
    /// Later writes through the streamer fail with
    /// [`StreamError::WriteAfterClose`]. Dropping the returned handle closes
    /// stdin.
    pub fn take_stdin(&mut self) -> Result<ChildStdin, StreamError> {
        self.writable_stdin()?;
        self.stdin.take().ok_or(StreamError::WriteAfterClose)
    }

    fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            tracing::debug!("Streamer closed stdin");
        }
    }

    async fn next_event(&mut self, mode: ReadMode) -> Result<OutputEvent, StreamError> {
        if let Some(code) = self.return_code {
            return Ok(OutputEvent::ReturnCode(code));
        }
        if self.child.is_none() {
            return Err(StreamError::NotCreated);
        }

        let buffer_size = self.options.read_buffer_size;
        loop {
            let stderr_open = self.stderr.as_ref().is_some_and(StreamSlot::is_open);
            let stdout_open = self.stdout.as_ref().is_some_and(StreamSlot::is_open);

            let (source, data) = match (
                self.stderr.as_mut().filter(|_| stderr_open),
                self.stdout.as_mut().filter(|_| stdout_open),
            ) {
                (Some(err), Some(out)) => tokio::select! {
                    biased;
                    data = err.next(mode, buffer_size) => (Source::Stderr, data?),
                    data = out.next(mode, buffer_size) => (Source::Stdout, data?),
                },
                (Some(err), None) => (err.source, err.next(mode, buffer_size).await?),
                (None, Some(out)) => (out.source, out.next(mode, buffer_size).await?),
                (None, None) => break,
            };

            if let Some(data) = data {
                tracing::debug!(bytes = data.len(), source = %source, "Streamer read");
                return self.to_event(source, data, mode);
            }
        }

        self.wait().await
    }

    fn to_event(
        &self,
        source: Source,
        mut data: Vec<u8>,
        mode: ReadMode,
    ) -> Result<OutputEvent, StreamError> {
        let chunk = match mode {
            ReadMode::Chunk(_) => Chunk::Bytes(Bytes::from(data)),
            ReadMode::Line { manage_newline } => {
                if manage_newline {
                    strip_newline(&mut data);
                }
                if self.options.manage_encoding {
                    let text = String::from_utf8(data)
                        .map_err(|error| StreamError::Decode { stream: source, error })?;
                    Chunk::Text(text)
                } else {
                    Chunk::Bytes(Bytes::from(data))
                }
            }
        };

        Ok(OutputEvent::data(source, chunk))
    }

    async fn wait(&mut self) -> Result<OutputEvent, StreamError> {
        // The child has closed its output; nothing written now could be read.
        self.close_stdin();

        let child = self.child.as_mut().ok_or(StreamError::NotCreated)?;
        let status = child.wait().await?;
        let code = exit_code(status);

        tracing::debug!(return_code = code, "Process exited");
        self.return_code = Some(code);
        Ok(OutputEvent::ReturnCode(code))
    }

    fn writable_stdin(&mut self) -> Result<&mut ChildStdin, StreamError> {
        if self.child.is_none() {
            return Err(StreamError::NotCreated);
        }
        self.stdin.as_mut().ok_or(StreamError::WriteAfterClose)
    }
}

impl Streamer for ProcessStreamer {
    async fn create(&mut self, cmd: &str) -> Result<(), StreamError> {
        if self.child.is_some() {
            return Err(StreamError::AlreadyCreated);
        }

        // Merging happens in the shell so the child's own interleaving of
        // stdout and stderr is preserved on a single pipe.
        let script = if self.options.merge_stderr {
            format!("exec 2>&1\n{}", cmd)
        } else {
            cmd.to_string()
        };

        let mut command = Command::new(&self.options.shell);
        command
            .arg("-c")
            .arg(&script)
            .stdin(if self.options.can_write {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(if self.options.merge_stderr {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .kill_on_drop(self.options.kill_on_drop);

        let mut child = command.spawn().map_err(|source| StreamError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

        tracing::debug!(
            pid = ?child.id(),
            shell = %self.options.shell,
            merge_stderr = self.options.merge_stderr,
            can_write = self.options.can_write,
            "Streamer created process"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
        self.stdout = Some(StreamSlot::new(Source::Stdout, stdout));
        self.stderr = child
            .stderr
            .take()
            .map(|stderr| StreamSlot::new(Source::Stderr, stderr));
        self.stdin = child.stdin.take();
        self.child = Some(child);

        Ok(())
    }

    async fn read(&mut self, limit: Option<usize>) -> Result<OutputEvent, StreamError> {
        self.next_event(ReadMode::Chunk(limit)).await
    }

    async fn read_line(&mut self, manage_newline: bool) -> Result<OutputEvent, StreamError> {
        self.next_event(ReadMode::Line { manage_newline }).await
    }

    async fn write(&mut self, data: &[u8], close: bool) -> Result<(), StreamError> {
        let stdin = self.writable_stdin()?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        tracing::debug!(bytes = data.len(), "Streamer wrote");

        if close {
            self.close_stdin();
        }
        Ok(())
    }

    async fn write_lines<B>(&mut self, lines: &[B], close: bool) -> Result<(), StreamError>
    where
        B: AsRef<[u8]>,
    {
        let stdin = self.writable_stdin()?;
        let mut total = 0;
        for line in lines {
            let line = line.as_ref();
            stdin.write_all(line).await?;
            total += line.len();
        }
        stdin.flush().await?;
        tracing::debug!(bytes = total, lines = lines.len(), "Streamer wrote lines");

        if close {
            self.close_stdin();
        }
        Ok(())
    }

    fn get_return_code(&self) -> Option<i32> {
        self.return_code
    }
}

/// Removes one trailing `\n` and a `\r` before it.
fn strip_newline(data: &mut Vec<u8>) {
    if data.last() == Some(&b'\n') {
        data.pop();
        if data.last() == Some(&b'\r') {
            data.pop();
        }
    }
}

/// Maps an exit status to an integer code; signals are reported negated.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
