//! Scripting CLI
//!
//! Run templated shell commands, capture their output, or watch them in a
//! terminal window.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use scripting::config::{default_config_path, ScriptingConfig};
use scripting::{
    CallOptions, InlineLauncher, OutputEvent, PlaceholderTemplating, Scripting, ScriptingError,
    StreamError, Streamer,
};

/// Run shell commands with templating, capture and interactive terminals.
#[derive(Parser, Debug)]
#[command(name = "scripting")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command and print its captured stdout
    Capture {
        /// Command template
        cmd: String,

        #[command(flatten)]
        args: CallArgs,
    },

    /// Run a command, streaming its output as it arrives
    Call {
        /// Command template
        cmd: String,

        #[command(flatten)]
        args: CallArgs,
    },

    /// Run a command with its output forwarded into a terminal window
    Interact {
        /// Command template
        cmd: String,

        #[command(flatten)]
        args: CallArgs,

        /// Dial the rendezvous from this process and print here instead of
        /// opening a multiplexer window
        #[arg(long)]
        inline: bool,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// Options shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct CallArgs {
    /// Text written to the command's stdin
    #[arg(long, short)]
    pub input: Option<String>,

    /// Template value, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    /// Only log the command, do not run it
    #[arg(long)]
    pub dry_run: bool,

    /// Keep stderr separate from stdout
    #[arg(long)]
    pub no_merge_stderr: bool,

    /// Accepted return code, repeatable (default: 0)
    #[arg(long = "valid-code", value_name = "N", allow_negative_numbers = true)]
    pub valid_codes: Vec<i32>,
}

impl CallArgs {
    fn options(&self) -> CallOptions {
        let mut options = CallOptions::new()
            .merge_stderr(!self.no_merge_stderr)
            .dry_run(self.dry_run);
        if let Some(input) = &self.input {
            options = options.input(input.clone());
        }
        for (key, value) in &self.set {
            options = options.set(key.clone(), value.clone());
        }
        if !self.valid_codes.is_empty() {
            options = options.valid_codes(self.valid_codes.iter().copied());
        }
        options
    }
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Maps a return code to a process exit status.
fn exit_status(return_code: i32) -> i32 {
    if return_code < 0 {
        128 - return_code
    } else {
        return_code
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        ScriptingConfig::load(config_path)?
    } else {
        ScriptingConfig::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing on stderr so captured output stays clean
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    // Validate configuration
    config.validate()?;

    let code = match cli.command {
        Commands::Capture { cmd, args } => {
            let scripting = Scripting::new(&config);
            match scripting.capture(&cmd, &args.options()).await {
                Ok(stdout) => {
                    print!("{}", stdout);
                    0
                }
                Err(ScriptingError::InvalidReturnCode(invalid)) => {
                    if let Some(stdout) = invalid.stdout_lossy() {
                        print!("{}", stdout);
                    }
                    if let Some(stderr) = invalid.stderr_lossy() {
                        eprint!("{}", stderr);
                    }
                    tracing::error!("Command failed with return code {}", invalid.return_code);
                    exit_status(invalid.return_code)
                }
                Err(e) => return Err(e).context("capture failed"),
            }
        }
        Commands::Call { cmd, args } => {
            let scripting = Scripting::new(&config);
            stream(&scripting, &cmd, &args).await?
        }
        Commands::Interact { cmd, args, inline } => {
            let result = if inline {
                let (launcher, mut output) = InlineLauncher::new();
                let printer = tokio::spawn(async move {
                    let mut stdout = std::io::stdout();
                    while let Some(bytes) = output.recv().await {
                        stdout.write_all(&bytes).ok();
                        stdout.flush().ok();
                    }
                });
                let scripting = Scripting::with_parts(&config, PlaceholderTemplating, launcher);
                let result = scripting.interact(&cmd, &args.options()).await;
                drop(scripting);
                printer.await.ok();
                result
            } else {
                Scripting::new(&config)
                    .interact(&cmd, &args.options())
                    .await
            };

            match result {
                Ok(code) => code,
                Err(ScriptingError::InvalidReturnCode(invalid)) => {
                    tracing::error!("Command failed with return code {}", invalid.return_code);
                    exit_status(invalid.return_code)
                }
                Err(e) => return Err(e).context("interact failed"),
            }
        }
        Commands::Config(cmd) => {
            match cmd {
                ConfigCommands::Show => print!("{}", config.to_toml()?),
                ConfigCommands::Init { force } => {
                    let path = cli.config.clone().unwrap_or_else(default_config_path);
                    init_config(&path, force)?;
                    println!("Configuration written to: {}", path.display());
                }
            }
            0
        }
    };

    std::process::exit(code);
}

/// Writes the default configuration to `path`.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    ScriptingConfig::default().save(path)
}

/// Streams a command's lines to our stdout/stderr and returns its exit status.
async fn stream(scripting: &Scripting, cmd: &str, args: &CallArgs) -> anyhow::Result<i32> {
    let options = args.options().manage_encoding(false);
    let mut streamer = scripting.call(cmd, &options).await?;

    // Nothing else will write, let the child see EOF
    match streamer.write(&[], true).await {
        Ok(()) | Err(StreamError::WriteAfterClose) => {}
        Err(e) => return Err(e.into()),
    }

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        match streamer.read_line(false).await? {
            OutputEvent::Stdout(chunk) => {
                stdout.write_all(chunk.as_bytes())?;
                stdout.flush()?;
            }
            OutputEvent::Stderr(chunk) => {
                stderr.write_all(chunk.as_bytes())?;
                stderr.flush()?;
            }
            OutputEvent::ReturnCode(code) => {
                if !streamer.is_dry_run() && !options.accepts(code) {
                    tracing::error!("Command failed with return code {}", code);
                }
                return Ok(exit_status(code));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_capture_command() {
        let cli = Cli::try_parse_from(["scripting", "capture", "ls -la"]).unwrap();
        match cli.command {
            Commands::Capture { cmd, args } => {
                assert_eq!(cmd, "ls -la");
                assert!(args.input.is_none());
                assert!(!args.dry_run);
                assert!(!args.no_merge_stderr);
                assert!(args.valid_codes.is_empty());
            }
            _ => panic!("Expected Capture command"),
        }
    }

    #[test]
    fn test_call_with_options() {
        let cli = Cli::try_parse_from([
            "scripting",
            "call",
            "cat {{ file|quote }}",
            "--set",
            "file=a b.txt",
            "--input",
            "hello",
            "--dry-run",
            "--no-merge-stderr",
            "--valid-code",
            "0",
            "--valid-code",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Call { args, .. } => {
                assert_eq!(args.set, vec![("file".to_string(), "a b.txt".to_string())]);
                let options = args.options();
                assert_eq!(options.input.as_deref(), Some("hello"));
                assert!(options.dry_run);
                assert!(!options.merge_stderr);
                assert_eq!(options.valid_codes, vec![0, 2]);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_interact_inline() {
        let cli = Cli::try_parse_from(["scripting", "-v", "interact", "top", "--inline"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Interact { cmd, inline, .. } => {
                assert_eq!(cmd, "top");
                assert!(inline);
            }
            _ => panic!("Expected Interact command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["scripting", "capture", "true", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_bad_assignment_rejected() {
        assert!(Cli::try_parse_from(["scripting", "capture", "true", "--set", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["scripting", "capture", "true", "--set", "=x"]).is_err());
    }

    #[test]
    fn test_default_options_accept_zero() {
        let options = CallArgs::default().options();
        assert_eq!(options.valid_codes, vec![0]);
        assert!(options.merge_stderr);
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["scripting", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["scripting", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_init_config_writes_defaults_once() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        init_config(&path, false).unwrap();
        assert_eq!(ScriptingConfig::load(&path).unwrap(), ScriptingConfig::default());

        std::fs::write(&path, "[logging]\nlog_level = \"warn\"\n").unwrap();
        assert!(init_config(&path, false).is_err());
        assert_eq!(ScriptingConfig::load(&path).unwrap().logging.log_level, "warn");

        init_config(&path, true).unwrap();
        assert_eq!(ScriptingConfig::load(&path).unwrap(), ScriptingConfig::default());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(-9), 137);
    }
}
