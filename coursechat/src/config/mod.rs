//! Configuration for the `coursechat` binary.
//!
//! Layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/coursechat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use coursechat_proto::message::{ConversationId, REPLY_EXCERPT_CHARS, UserId};

use crate::history::DEFAULT_PAGE_SIZE;
use crate::live::{DEFAULT_RECONNECT_INITIAL, DEFAULT_RECONNECT_MAX};
use crate::optimistic::DEFAULT_MATCH_WINDOW;
use crate::session::{DEFAULT_CHANNEL_CAPACITY, SessionConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    session: SessionFileConfig,
    history: HistoryFileConfig,
    live: LiveFileConfig,
    optimistic: OptimisticFileConfig,
}

/// `[session]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<u64>,
    conversation: Option<String>,
    channel_capacity: Option<usize>,
    timestamp_format: Option<String>,
}

/// `[history]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    page_size: Option<usize>,
}

/// `[live]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LiveFileConfig {
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

/// `[optimistic]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OptimisticFileConfig {
    match_window_secs: Option<u64>,
    reply_excerpt_chars: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Signed-in user.
    pub user_id: UserId,
    /// Conversation opened at startup.
    pub conversation: ConversationId,
    /// Worker command channel capacity.
    pub channel_capacity: usize,
    /// History rows per page.
    pub page_size: usize,
    /// First live reconnect delay.
    pub reconnect_initial: Duration,
    /// Live reconnect delay ceiling.
    pub reconnect_max: Duration,
    /// Pending-message match window.
    pub match_window: Duration,
    /// Reply preview excerpt length.
    pub reply_excerpt_chars: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: UserId::new(1),
            conversation: ConversationId::new("general"),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            match_window: DEFAULT_MATCH_WINDOW,
            reply_excerpt_chars: REPLY_EXCERPT_CHARS,
            timestamp_format: "%H:%M:%S".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            user_id: cli
                .user_id
                .or(file.session.user_id)
                .map_or(defaults.user_id, UserId::new),
            conversation: cli
                .conversation
                .clone()
                .or_else(|| file.session.conversation.clone())
                .map_or(defaults.conversation, ConversationId::new),
            channel_capacity: file
                .session
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            page_size: cli
                .page_size
                .or(file.history.page_size)
                .unwrap_or(defaults.page_size),
            reconnect_initial: file
                .live
                .reconnect_initial_ms
                .map_or(defaults.reconnect_initial, Duration::from_millis),
            reconnect_max: file
                .live
                .reconnect_max_ms
                .map_or(defaults.reconnect_max, Duration::from_millis),
            match_window: file
                .optimistic
                .match_window_secs
                .map_or(defaults.match_window, Duration::from_secs),
            reply_excerpt_chars: file
                .optimistic
                .reply_excerpt_chars
                .unwrap_or(defaults.reply_excerpt_chars),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.session.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            user_id: self.user_id,
            channel_capacity: self.channel_capacity,
            page_size: self.page_size,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            match_window: self.match_window,
            reply_excerpt_chars: self.reply_excerpt_chars,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Course chat reconciliation engine demo")]
pub struct CliArgs {
    /// Signed-in user id.
    #[arg(long, env = "COURSECHAT_USER_ID")]
    pub user_id: Option<u64>,

    /// Conversation to open.
    #[arg(long, env = "COURSECHAT_CONVERSATION")]
    pub conversation: Option<String>,

    /// History rows per page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Message to send once the conversation has loaded.
    #[arg(long, default_value = "hello from coursechat")]
    pub message: String,

    /// Path to config file (default: `~/.config/coursechat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURSECHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/coursechat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist. Otherwise the default
/// path is tried and a missing file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("coursechat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
