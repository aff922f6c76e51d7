//! Configuration system for the `AreaChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/areachat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error. The bearer credential is
//! only ever taken from `--token` / `AREACHAT_TOKEN`, never from the file.

use std::path::PathBuf;
use std::time::Duration;

use areachat_proto::api::DEFAULT_PAGE_SIZE;
use areachat_proto::message::{AreaRef, UserId};

use crate::chat::delivery::DEFAULT_ASSISTANT_PREFIX;
use crate::chat::typing::DEFAULT_TYPING_WINDOW;
use crate::connection::backoff::{Backoff, Jitter};
use crate::conversation::{AreaTarget, Participant};

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

    /// The server URL is not an `http(s)` URL.
    #[error("invalid server url {url}: {reason}")]
    InvalidServerUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    chat: ChatFileConfig,
    reconnect: ReconnectFileConfig,
    typing: TypingFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    team: Option<String>,
    area: Option<String>,
    user_id: Option<String>,
    display_name: Option<String>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    page_size: Option<usize>,
    max_recovery_pages: Option<usize>,
    send_timeout_secs: Option<u64>,
    delete_timeout_secs: Option<u64>,
    assistant_prefix: Option<String>,
    event_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    jitter: Option<bool>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    window_ms: Option<u64>,
    tick_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Conversation behaviour: pagination, delivery and the assistant prefix.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// History page size requested from the backend.
    pub page_size: usize,
    /// Older pages walked during reconnect catch-up before giving up.
    pub max_recovery_pages: usize,
    /// How long a send may stay pending before it fails.
    pub send_timeout: Duration,
    /// How long a delete may stay requested before it fails.
    pub delete_timeout: Duration,
    /// Leading token that routes input to the assistant.
    pub assistant_prefix: String,
    /// Capacity of the conversation event channel.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_recovery_pages: 5,
            send_timeout: Duration::from_secs(15),
            delete_timeout: Duration::from_secs(15),
            assistant_prefix: DEFAULT_ASSISTANT_PREFIX.to_string(),
            event_buffer: 64,
        }
    }
}

/// Channel lifecycle settings used by the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First retry delay.
    pub base_delay: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
    /// Jitter applied to each delay.
    pub jitter: Jitter,
    /// Timeout for opening the transport.
    pub connect_timeout: Duration,
    /// Timeout for the `auth:ok` reply.
    pub handshake_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the channel counts as dropped.
    pub heartbeat_timeout: Duration,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Jitter::Full,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            outbound_buffer: 64,
        }
    }
}

impl ReconnectConfig {
    /// Backoff policy described by this configuration.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.jitter)
    }
}

/// Typing indicator timing.
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// How long a typing entry lives without a refresh.
    pub window: Duration,
    /// How often expired entries are pruned and the local debounce checked.
    pub tick: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_TYPING_WINDOW,
            tick: Duration::from_millis(500),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Backend base URL (`http://host:port`).
    pub server_url: Option<String>,
    /// Timeout for individual REST requests.
    pub request_timeout: Duration,

    // -- Session --
    /// Team of the area to open.
    pub team: Option<String>,
    /// Area to open.
    pub area: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Local display name.
    pub display_name: Option<String>,
    /// Bearer credential.
    pub token: Option<String>,

    // -- Subsystems --
    /// Conversation behaviour.
    pub chat: ChatConfig,
    /// Channel lifecycle.
    pub reconnect: ReconnectConfig,
    /// Typing indicator timing.
    pub typing: TypingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            request_timeout: Duration::from_secs(20),
            team: None,
            area: None,
            user_id: None,
            display_name: None,
            token: None,
            chat: ChatConfig::default(),
            reconnect: ReconnectConfig::default(),
            typing: TypingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/areachat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let rc = &file.reconnect;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.server.url.clone()),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            team: cli.team.clone().or_else(|| file.session.team.clone()),
            area: cli.area.clone().or_else(|| file.session.area.clone()),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.session.user_id.clone()),
            display_name: cli
                .display_name
                .clone()
                .or_else(|| file.session.display_name.clone()),
            token: cli.token.clone().filter(|t| !t.trim().is_empty()),
            chat: ChatConfig {
                page_size: file
                    .chat
                    .page_size
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.chat.page_size),
                max_recovery_pages: file
                    .chat
                    .max_recovery_pages
                    .unwrap_or(defaults.chat.max_recovery_pages),
                send_timeout: file
                    .chat
                    .send_timeout_secs
                    .map_or(defaults.chat.send_timeout, Duration::from_secs),
                delete_timeout: file
                    .chat
                    .delete_timeout_secs
                    .map_or(defaults.chat.delete_timeout, Duration::from_secs),
                assistant_prefix: cli
                    .assistant_prefix
                    .clone()
                    .or_else(|| file.chat.assistant_prefix.clone())
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or(defaults.chat.assistant_prefix),
                event_buffer: file
                    .chat
                    .event_buffer
                    .unwrap_or(defaults.chat.event_buffer),
            },
            reconnect: ReconnectConfig {
                base_delay: rc
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                max_delay: rc
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                jitter: rc.jitter.map_or(defaults.reconnect.jitter, |on| {
                    if on { Jitter::Full } else { Jitter::None }
                }),
                connect_timeout: rc
                    .connect_timeout_secs
                    .map_or(defaults.reconnect.connect_timeout, Duration::from_secs),
                handshake_timeout: rc
                    .handshake_timeout_secs
                    .map_or(defaults.reconnect.handshake_timeout, Duration::from_secs),
                heartbeat_interval: rc
                    .heartbeat_interval_secs
                    .map_or(defaults.reconnect.heartbeat_interval, Duration::from_secs),
                heartbeat_timeout: rc
                    .heartbeat_timeout_secs
                    .map_or(defaults.reconnect.heartbeat_timeout, Duration::from_secs),
                outbound_buffer: defaults.reconnect.outbound_buffer,
            },
            typing: TypingConfig {
                window: file
                    .typing
                    .window_ms
                    .map_or(defaults.typing.window, Duration::from_millis),
                tick: file
                    .typing
                    .tick_ms
                    .map_or(defaults.typing.tick, Duration::from_millis),
            },
        }
    }

    /// Build the [`AreaTarget`] this configuration points at.
    ///
    /// Returns `None` if team, area or user id is missing. A missing token is
    /// not checked here: the connection manager reports it as a fatal error.
    #[must_use]
    pub fn to_target(&self) -> Option<AreaTarget> {
        let team = self.team.clone().filter(|t| !t.is_empty())?;
        let area = self.area.clone().filter(|a| !a.is_empty())?;
        let user_id = self.user_id.clone().filter(|u| !u.is_empty())?;
        let display_name = self.display_name.clone().unwrap_or_else(|| user_id.clone());

        Some(AreaTarget {
            area: AreaRef::new(team, area),
            user: Participant {
                user_id: UserId::new(user_id),
                display_name,
            },
            token: self.token.clone(),
        })
    }

    /// WebSocket channel URL derived from the server URL
    /// (`http` → `ws`, `https` → `wss`, path `/ws`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServerUrl`] if no server URL is set or
    /// it is not an `http(s)` URL.
    pub fn channel_url(&self) -> Result<String, ConfigError> {
        let raw = self.server_url.as_deref().unwrap_or_default();
        let invalid = |reason: &str| ConfigError::InvalidServerUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let mut url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            _ => return Err(invalid("scheme must be http or https")),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid("cannot switch to a WebSocket scheme"))?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url.to_string())
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal client for an area chat")]
pub struct CliArgs {
    /// Backend base URL (e.g. `http://127.0.0.1:9100`).
    #[arg(long, env = "AREACHAT_SERVER")]
    pub server_url: Option<String>,

    /// Team id of the area.
    #[arg(long, env = "AREACHAT_TEAM")]
    pub team: Option<String>,

    /// Area id to open.
    #[arg(long, env = "AREACHAT_AREA")]
    pub area: Option<String>,

    /// Your user id.
    #[arg(long, env = "AREACHAT_USER")]
    pub user_id: Option<String>,

    /// Your display name.
    #[arg(long)]
    pub display_name: Option<String>,

    /// Bearer credential.
    #[arg(long, env = "AREACHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Leading token that routes input to the assistant.
    #[arg(long)]
    pub assistant_prefix: Option<String>,

    /// Path to config file (default: `~/.config/areachat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "AREACHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/areachat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("areachat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
