//! Engine configuration.
//!
//! Loaded from JSON, first match wins:
//! - the path passed on the command line
//! - the `DEVMUX_CONFIG` environment variable
//! - `<config_dir>/devmux/engine.json` (`~/.config/devmux/engine.json` on Linux)
//!
//! With none present the defaults apply. Every field is optional in the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devmux_terminal::{TerminalSize, DEFAULT_MAX_BUFFER_LINES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_NAME: &str = "devmux";
const CONFIG_FILE: &str = "engine.json";

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "DEVMUX_CONFIG";

/// Replaced by the target id in `remote_shell.args`.
pub const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Command that opens an interactive shell on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteShellCommand {
    pub program: String,
    /// Arguments; `{target}` is replaced by the target id.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for RemoteShellCommand {
    fn default() -> Self {
        let env = [("TERM", "xterm-256color"), ("COLORTERM", "truecolor")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            program: "ssh".to_string(),
            args: vec!["-tt".to_string(), TARGET_PLACEHOLDER.to_string()],
            env,
        }
    }
}

impl RemoteShellCommand {
    /// Arguments with the target substituted.
    pub fn args_for(&self, target_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, target_id))
            .collect()
    }
}

/// How a terminal resize reaches the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeStrategy {
    /// Write `ESC [ 8 ; rows ; cols t` into the input stream.
    #[default]
    EscapeReport,
    /// Resize the local PTY and let the kernel signal the child.
    Native,
    Both,
}

impl ResizeStrategy {
    pub fn writes_escape_report(self) -> bool {
        matches!(self, ResizeStrategy::EscapeReport | ResizeStrategy::Both)
    }

    pub fn resizes_pty(self) -> bool {
        matches!(self, ResizeStrategy::Native | ResizeStrategy::Both)
    }
}

/// What the output pump keeps from escape sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Strip sequences; the buffer sees text only.
    Plain,
    /// Also project sequences (pen, erase, alternate screen) onto the buffer.
    #[default]
    Styled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for SizeConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

impl From<SizeConfig> for TerminalSize {
    fn from(size: SizeConfig) -> Self {
        TerminalSize::new(size.cols, size.rows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub remote_shell: RemoteShellCommand,
    /// Local working directory for the spawned command, and the session's
    /// initial working directory until the remote reports one.
    pub working_directory: Option<String>,
    pub default_size: SizeConfig,
    pub max_buffer_lines: usize,
    pub input_channel_capacity: usize,
    pub output_channel_capacity: usize,
    pub read_buffer_size: usize,
    pub write_chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub resize_strategy: ResizeStrategy,
    pub output_mode: OutputMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_shell: RemoteShellCommand::default(),
            working_directory: None,
            default_size: SizeConfig::default(),
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            input_channel_capacity: 1024,
            output_channel_capacity: 256,
            read_buffer_size: 4096,
            write_chunk_size: 512,
            connect_timeout_ms: 10_000,
            resize_strategy: ResizeStrategy::default(),
            output_mode: OutputMode::default(),
        }
    }
}

impl EngineConfig {
    /// `<config_dir>/devmux/engine.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Resolve and load the configuration. An explicit or environment path
    /// must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config.normalized())
    }

    /// Bump zero capacities and sizes to 1.
    pub fn normalized(mut self) -> Self {
        self.max_buffer_lines = self.max_buffer_lines.max(1);
        self.input_channel_capacity = self.input_channel_capacity.max(1);
        self.output_channel_capacity = self.output_channel_capacity.max(1);
        self.read_buffer_size = self.read_buffer_size.max(1);
        self.write_chunk_size = self.write_chunk_size.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
