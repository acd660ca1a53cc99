//! Orchestrator composing templating, streamers and terminal sessions.
//!
//! [`Scripting`] is the entry point for running shell commands:
//!
//! - [`Scripting::call`] renders and starts a command and hands back the
//!   live [`CommandStreamer`]
//! - [`Scripting::capture`] and friends drain the command and validate its
//!   return code
//! - [`Scripting::interact`] forwards the command's output into a terminal
//!   window opened through the configured [`TerminalLauncher`]

use std::pin::pin;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{ProcessConfig, ScriptingConfig};
use crate::error::{InvalidReturnCode, ScriptingError};
use crate::session::{MultiplexerLauncher, SessionClient, SessionServer, TerminalLauncher};
use crate::streamer::{CommandStreamer, OutputEvent, StreamError, Streamer, StreamerOptions};
use crate::templating::{Context, PlaceholderTemplating, Templating};

/// Per-call options.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    /// Text written to stdin, after which stdin is closed. Rendered with the
    /// same context as the command.
    pub input: Option<String>,
    /// Values available to the command and input templates.
    pub context: Context,
    /// Fold stderr into stdout.
    pub merge_stderr: bool,
    /// Do not start anything; report success.
    pub dry_run: bool,
    /// Decode line reads to text.
    pub manage_encoding: bool,
    /// Return codes treated as success.
    pub valid_codes: Vec<i32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            input: None,
            context: Context::new(),
            merge_stderr: true,
            dry_run: false,
            manage_encoding: true,
            valid_codes: vec![0],
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Adds one template value.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    pub fn merge_stderr(mut self, merge_stderr: bool) -> Self {
        self.merge_stderr = merge_stderr;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn manage_encoding(mut self, manage_encoding: bool) -> Self {
        self.manage_encoding = manage_encoding;
        self
    }

    pub fn valid_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.valid_codes = codes.into_iter().collect();
        self
    }

    /// Returns true when `code` counts as success.
    pub fn accepts(&self, code: i32) -> bool {
        self.valid_codes.contains(&code)
    }
}

/// Output of a drained command, streams kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub return_code: i32,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs shell commands.
pub struct Scripting<T = PlaceholderTemplating, L = MultiplexerLauncher> {
    templating: T,
    process: ProcessConfig,
    sessions: SessionServer<L>,
}

impl Scripting {
    /// Creates an orchestrator with the built-in templating and the
    /// configured terminal multiplexer.
    pub fn new(config: &ScriptingConfig) -> Self {
        Self::with_parts(
            config,
            PlaceholderTemplating,
            MultiplexerLauncher::from_config(&config.rendezvous),
        )
    }
}

impl Default for Scripting {
    fn default() -> Self {
        Self::new(&ScriptingConfig::default())
    }
}

impl<T: Templating, L: TerminalLauncher> Scripting<T, L> {
    pub fn with_parts(config: &ScriptingConfig, templating: T, launcher: L) -> Self {
        Self {
            templating,
            process: config.process.clone(),
            sessions: SessionServer::new(&config.rendezvous, launcher),
        }
    }

    pub fn templating(&self) -> &T {
        &self.templating
    }

    pub fn sessions(&self) -> &SessionServer<L> {
        &self.sessions
    }

    /// Renders and starts `cmd`.
    ///
    /// When the rendered input is non-empty it is written in the background
    /// and stdin is closed once the child has taken all of it. Otherwise
    /// stdin stays open for the caller.
    pub async fn call(&self, cmd: &str, options: &CallOptions) -> Result<CommandStreamer, ScriptingError> {
        self.start(cmd, options, false).await
    }

    /// Runs `cmd` to completion and returns its stdout as text.
    pub async fn capture(&self, cmd: &str, options: &CallOptions) -> Result<String, ScriptingError> {
        let stdout = self.capture_bytes(cmd, options).await?;
        Ok(String::from_utf8(stdout)?)
    }

    /// Runs `cmd` to completion and returns its raw stdout.
    pub async fn capture_bytes(&self, cmd: &str, options: &CallOptions) -> Result<Vec<u8>, ScriptingError> {
        let output = self.drain(cmd, options).await?;
        Ok(output.stdout)
    }

    /// Runs `cmd` to completion with stderr kept separate.
    pub async fn capture_output(
        &self,
        cmd: &str,
        options: &CallOptions,
    ) -> Result<CapturedOutput, ScriptingError> {
        let options = options.clone().merge_stderr(false);
        self.drain(cmd, &options).await
    }

    /// Runs `cmd` to completion and returns its accepted return code.
    pub async fn run(&self, cmd: &str, options: &CallOptions) -> Result<i32, ScriptingError> {
        let output = self.drain(cmd, options).await?;
        Ok(output.return_code)
    }

    /// Runs `cmd` with its output forwarded into a new terminal window.
    ///
    /// The window is titled `scripting <cmd>`. Stderr is always merged.
    /// A dry run opens no window and returns 0.
    pub async fn interact(&self, cmd: &str, options: &CallOptions) -> Result<i32, ScriptingError> {
        let call_options = options.clone().merge_stderr(true).manage_encoding(false);

        if options.dry_run {
            let mut streamer = self.start(cmd, &call_options, true).await?;
            return Ok(finish(&mut streamer).await?);
        }

        let rendered = self.render(cmd, &call_options)?;
        let client = SessionClient::new(format!("scripting {}", cmd));

        let mut registering = pin!(self.sessions.register(client));
        let mut starting = pin!(self.spawn(rendered, &call_options, true));

        // An unfinished registration is released when dropped, a started
        // child is killed when its streamer is dropped.
        let (mut client, mut streamer) = tokio::select! {
            called = &mut starting => {
                let streamer = called?;
                (registering.await?, streamer)
            }
            registered = &mut registering => {
                let mut client = registered?;
                match starting.await {
                    Ok(streamer) => (client, streamer),
                    Err(e) => {
                        self.sessions.un_register(&mut client).await?;
                        return Err(e);
                    }
                }
            }
        };

        let forwarded = forward(&mut streamer, &mut client).await;
        self.sessions.un_register(&mut client).await?;
        forwarded?;

        let return_code = streamer
            .get_return_code()
            .ok_or(StreamError::NotCreated)?;
        validate(options, return_code, None, None)?;
        Ok(return_code)
    }

    async fn start(
        &self,
        cmd: &str,
        options: &CallOptions,
        close_stdin: bool,
    ) -> Result<CommandStreamer, ScriptingError> {
        let rendered = self.render(cmd, options)?;
        self.spawn(rendered, options, close_stdin).await
    }

    fn render(&self, cmd: &str, options: &CallOptions) -> Result<Rendered, ScriptingError> {
        let cmd = self.templating.render(cmd, &options.context)?;
        let input = match &options.input {
            Some(input) => self.templating.render(input, &options.context)?,
            None => String::new(),
        };
        Ok(Rendered { cmd, input })
    }

    async fn spawn(
        &self,
        rendered: Rendered,
        options: &CallOptions,
        close_stdin: bool,
    ) -> Result<CommandStreamer, ScriptingError> {
        let Rendered { cmd, input } = rendered;

        if input.is_empty() {
            info!("{}", cmd);
        } else {
            info!("echo {} | {}", self.templating.quote(&input), cmd);
        }

        let streamer_options = StreamerOptions::from_config(&self.process)
            .can_write(!close_stdin || !input.is_empty())
            .merge_stderr(options.merge_stderr)
            .manage_encoding(options.manage_encoding);
        let mut streamer = CommandStreamer::new(streamer_options, options.dry_run);
        streamer.create(&cmd).await?;

        if !input.is_empty() {
            feed(&mut streamer, input).await?;
        }
        Ok(streamer)
    }

    async fn drain(&self, cmd: &str, options: &CallOptions) -> Result<CapturedOutput, ScriptingError> {
        let options = options.clone().manage_encoding(false);
        let mut streamer = self.start(cmd, &options, true).await?;

        let mut output = CapturedOutput::default();
        {
            let mut events = pin!(streamer.iter(None));
            while let Some(event) = events.next().await {
                match event? {
                    OutputEvent::Stdout(chunk) => output.stdout.extend_from_slice(chunk.as_bytes()),
                    OutputEvent::Stderr(chunk) => output.stderr.extend_from_slice(chunk.as_bytes()),
                    OutputEvent::ReturnCode(_) => {}
                }
            }
        }
        output.return_code = finish(&mut streamer).await?;

        if !streamer.is_dry_run() {
            validate(
                &options,
                output.return_code,
                Some(output.stdout.as_slice()),
                Some(output.stderr.as_slice()),
            )?;
        }
        Ok(output)
    }
}

/// A command and its input after templating.
struct Rendered {
    cmd: String,
    input: String,
}

/// Writes `input` to the child and closes its stdin.
///
/// The write runs in its own task: a child echoing its input blocks on a
/// full stdout pipe until someone reads it.
async fn feed(streamer: &mut CommandStreamer, input: String) -> Result<(), StreamError> {
    let Some(mut stdin) = streamer.take_stdin()? else {
        return streamer.write(input.as_bytes(), true).await;
    };

    tokio::spawn(async move {
        match stdin.write_all(input.as_bytes()).await {
            Ok(()) => debug!(bytes = input.len(), "Input written, closing stdin"),
            Err(e) => debug!(error = %e, "Child stopped reading its input"),
        }
    });
    Ok(())
}

/// Reads the remaining events and returns the exit code.
async fn finish(streamer: &mut CommandStreamer) -> Result<i32, StreamError> {
    loop {
        if let OutputEvent::ReturnCode(code) = streamer.read(None).await? {
            return Ok(code);
        }
    }
}

async fn forward(streamer: &mut CommandStreamer, client: &mut SessionClient) -> Result<(), ScriptingError> {
    let mut lines = pin!(streamer.iter_lines(false));
    while let Some(event) = lines.next().await {
        if let Some(chunk) = event?.chunk() {
            client.write_all(chunk.as_bytes()).await?;
        }
    }
    debug!(title = %client.title(), "Command output fully forwarded");
    Ok(())
}

fn validate(
    options: &CallOptions,
    return_code: i32,
    stdout: Option<&[u8]>,
    stderr: Option<&[u8]>,
) -> Result<(), ScriptingError> {
    if options.accepts(return_code) {
        return Ok(());
    }
    Err(ScriptingError::InvalidReturnCode(InvalidReturnCode {
        return_code,
        stdout: stdout.map(<[u8]>::to_vec),
        stderr: stderr.map(<[u8]>::to_vec),
    }))
}
