//! Synchronous facade over [`Scripting`].
//!
//! For callers without an async runtime. Each call drives its command to
//! completion on a private current-thread runtime. Calling these methods from
//! inside another tokio runtime panics.

use tokio::runtime::{Builder, Runtime};

use crate::config::ScriptingConfig;
use crate::error::ScriptingError;
use crate::orchestrator::{CallOptions, CapturedOutput, Scripting};
use crate::session::{MultiplexerLauncher, TerminalLauncher};
use crate::templating::{PlaceholderTemplating, Templating};

/// Blocking counterpart of [`Scripting`].
pub struct BlockingScripting<T = PlaceholderTemplating, L = MultiplexerLauncher> {
    runtime: Runtime,
    scripting: Scripting<T, L>,
}

impl BlockingScripting {
    pub fn new(config: &ScriptingConfig) -> Result<Self, ScriptingError> {
        Self::from_scripting(Scripting::new(config))
    }
}

impl<T: Templating, L: TerminalLauncher> BlockingScripting<T, L> {
    /// Wraps an existing orchestrator.
    pub fn from_scripting(scripting: Scripting<T, L>) -> Result<Self, ScriptingError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ScriptingError::Runtime)?;
        Ok(Self { runtime, scripting })
    }

    pub fn scripting(&self) -> &Scripting<T, L> {
        &self.scripting
    }

    /// See [`Scripting::capture`].
    pub fn capture(&self, cmd: &str, options: &CallOptions) -> Result<String, ScriptingError> {
        self.runtime.block_on(self.scripting.capture(cmd, options))
    }

    /// See [`Scripting::capture_output`].
    pub fn capture_output(
        &self,
        cmd: &str,
        options: &CallOptions,
    ) -> Result<CapturedOutput, ScriptingError> {
        self.runtime
            .block_on(self.scripting.capture_output(cmd, options))
    }

    /// See [`Scripting::run`].
    pub fn run(&self, cmd: &str, options: &CallOptions) -> Result<i32, ScriptingError> {
        self.runtime.block_on(self.scripting.run(cmd, options))
    }

    /// See [`Scripting::interact`].
    pub fn interact(&self, cmd: &str, options: &CallOptions) -> Result<i32, ScriptingError> {
        self.runtime.block_on(self.scripting.interact(cmd, options))
    }
}
