//! Opening the terminal that dials back to the rendezvous listener.

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::process::Stdio;

use bytes::Bytes;
use rendezvous::{encode_handshake, SecurityKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::SessionError;
use crate::config::{RendezvousConfig, TerminalKind};

/// Opens a terminal for a registration.
///
/// The terminal must connect to `addr` and send the key followed by a
/// newline. Everything it receives afterwards is the command's output.
pub trait TerminalLauncher: Send + Sync {
    fn launch(
        &self,
        title: &str,
        key: &SecurityKey,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Opens a window in GNU screen or tmux running netcat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerLauncher {
    kind: TerminalKind,
    program: String,
    netcat: String,
}

impl MultiplexerLauncher {
    pub fn new(kind: TerminalKind, program: impl Into<String>, netcat: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            netcat: netcat.into(),
        }
    }

    pub fn from_config(config: &RendezvousConfig) -> Self {
        Self::new(
            config.terminal,
            config.terminal_program.clone(),
            config.netcat_program.clone(),
        )
    }

    /// Arguments passed to the multiplexer to open the window.
    pub fn args(&self, title: &str, key: &SecurityKey, addr: SocketAddr) -> Vec<String> {
        let dial = format!(
            "printf '%s\\n' {} | {} {} {}",
            key.as_str(),
            shell_escape::unix::escape(Cow::Borrowed(self.netcat.as_str())),
            addr.ip(),
            addr.port()
        );

        match self.kind {
            TerminalKind::Screen => vec![
                "-t".to_string(),
                title.to_string(),
                "/bin/sh".to_string(),
                "-c".to_string(),
                dial,
            ],
            TerminalKind::Tmux => vec![
                "new-window".to_string(),
                "-n".to_string(),
                title.to_string(),
                dial,
            ],
        }
    }
}

impl Default for MultiplexerLauncher {
    fn default() -> Self {
        Self::from_config(&RendezvousConfig::default())
    }
}

impl TerminalLauncher for MultiplexerLauncher {
    async fn launch(
        &self,
        title: &str,
        key: &SecurityKey,
        addr: SocketAddr,
    ) -> Result<(), SessionError> {
        let program = which::which(&self.program)
            .map_err(|e| SessionError::Launch(format!("{}: {}", self.program, e)))?;

        tracing::debug!(
            program = %program.display(),
            title = %title,
            key = %key.fingerprint(),
            %addr,
            "Opening terminal window"
        );

        let output = Command::new(&program)
            .args(self.args(title, key, addr))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SessionError::Launch(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionError::Launch(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Dials the listener from inside this process.
///
/// Everything the command forwards is delivered on the receiver returned by
/// [`InlineLauncher::new`]. Useful where no multiplexer is running.
#[derive(Debug, Clone)]
pub struct InlineLauncher {
    output: mpsc::UnboundedSender<Bytes>,
}

impl InlineLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (output, rx) = mpsc::unbounded_channel();
        (Self { output }, rx)
    }
}

impl TerminalLauncher for InlineLauncher {
    async fn launch(
        &self,
        title: &str,
        key: &SecurityKey,
        addr: SocketAddr,
    ) -> Result<(), SessionError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&encode_handshake(key)).await?;

        let output = self.output.clone();
        let title = title.to_string();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 8192];
            loop {
                match stream.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if output.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(title = %title, error = %e, "Inline terminal read failed");
                        break;
                    }
                }
            }
            tracing::debug!(title = %title, "Inline terminal closed");
        });
        Ok(())
    }
}
