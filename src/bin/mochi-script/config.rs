//! Configuration for mochi-script
//!
//! Precedence: CLI > env > file > defaults. The file lives at
//! `$XDG_CONFIG_HOME/mochi/script.toml`:
//!
//! ```toml
//! shell = "/bin/zsh"
//! file = "session.log"
//! append = false
//!
//! [pty]
//! slave_echo = true
//! handle_resize = true
//! chunk_size = 4096
//! ```
//!
//! A `[pty]` table starts from the library's `SpawnOptions` defaults, which
//! leave resize forwarding off.

use clap::Parser;
use mochi_spawn::SpawnOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// CLI arguments for mochi-script
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mochi-script")]
#[command(author = "Mochi Team")]
#[command(version)]
#[command(about = "Record a terminal session to a file", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Append to the transcript instead of overwriting it
    #[arg(short, long)]
    pub append: bool,

    /// Run CMD through `sh -c` instead of an interactive shell
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub command: Option<String>,

    /// Shell to run when no command is given
    #[arg(short, long, value_name = "SHELL")]
    pub shell: Option<String>,

    /// Do not forward terminal resizes to the session
    #[arg(long)]
    pub no_resize: bool,

    /// Transcript file
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,
}

/// Resolved settings for a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Shell to run; falls back to `$SHELL`, then `sh`
    pub shell: Option<String>,
    /// Transcript path
    pub file: PathBuf,
    /// Append to an existing transcript
    pub append: bool,
    /// One-off command, only settable from the command line
    #[serde(skip)]
    pub command: Option<String>,
    /// Spawner settings
    pub pty: SpawnOptions,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig {
            shell: None,
            file: PathBuf::from("typescript"),
            append: false,
            command: None,
            pty: SpawnOptions {
                handle_resize: true,
                ..SpawnOptions::default()
            },
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ScriptConfig {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = ScriptConfig::default();

        let config_path = args.config.clone().or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    Err(e) => {
                        // An explicitly requested file must load
                        if args.config.is_some() {
                            return Err(e);
                        }
                        tracing::warn!("Ignoring config {:?}: {}", path, e);
                    },
                }
            } else if args.config.is_some() {
                return Err(ConfigError {
                    message: format!("{} does not exist", path.display()),
                    field: None,
                });
            }
        }

        config.apply_env(|key| env::var(key).ok());
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file: {}", e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mochi").join("script.toml"))
    }

    /// Apply `MOCHI_SCRIPT_*` variables as seen through `lookup`.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("MOCHI_SCRIPT_SHELL") {
            self.shell = Some(val);
        }
        if let Some(val) = lookup("MOCHI_SCRIPT_FILE") {
            self.file = PathBuf::from(val);
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(shell) = &args.shell {
            self.shell = Some(shell.clone());
        }
        if let Some(file) = &args.file {
            self.file = file.clone();
        }
        if args.append {
            self.append = true;
        }
        if args.no_resize {
            self.pty.handle_resize = false;
        }
        if let Some(command) = &args.command {
            self.command = Some(command.clone());
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pty.chunk_size == 0 {
            return Err(ConfigError {
                message: "Chunk size must be at least 1".to_string(),
                field: Some("pty.chunk_size".to_string()),
            });
        }
        if self.file.as_os_str().is_empty() {
            return Err(ConfigError {
                message: "Transcript path must not be empty".to_string(),
                field: Some("file".to_string()),
            });
        }
        if matches!(&self.shell, Some(shell) if shell.is_empty()) {
            return Err(ConfigError {
                message: "Shell must not be empty".to_string(),
                field: Some("shell".to_string()),
            });
        }
        Ok(())
    }

    /// The argv to spawn. `login_shell` stands in for `$SHELL`.
    pub fn argv(&self, login_shell: Option<String>) -> Vec<String> {
        if let Some(command) = &self.command {
            return vec!["sh".to_string(), "-c".to_string(), command.clone()];
        }
        let shell = self
            .shell
            .clone()
            .or(login_shell)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "sh".to_string());
        vec![shell]
    }
}
