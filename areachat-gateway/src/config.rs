//! Configuration for the development gateway.
//!
//! Priority (highest first): CLI arguments, environment variables (via clap
//! `env`), the TOML file (`~/.config/areachat-gateway/config.toml`), then
//! compiled defaults.
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:9100"
//! history_limit_max = 100
//!
//! [assistant]
//! reply = "No documents match that question yet."
//!
//! [[users]]
//! token = "dev-ana"
//! id = "u1"
//! name = "Ana"
//!
//! [[areas]]
//! team = "t1"
//! area = "general"
//! ```

use std::path::PathBuf;

use areachat_proto::message::AreaRef;

/// Errors that can occur when loading gateway configuration.
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

/// A user the gateway accepts, keyed by bearer token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UserEntry {
    /// Bearer credential.
    pub token: String,
    /// Platform user id.
    pub id: String,
    /// Display name used on messages and typing events.
    pub name: String,
}

impl UserEntry {
    /// Convenience constructor.
    #[must_use]
    pub fn new(token: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct AreaEntry {
    team: String,
    area: String,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayConfigFile {
    server: ServerFileConfig,
    assistant: AssistantFileConfig,
    users: Vec<UserEntry>,
    areas: Vec<AreaEntry>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    history_limit_max: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AssistantFileConfig {
    reply: Option<String>,
}

/// CLI arguments for the gateway.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "AreaChat development gateway")]
pub struct GatewayCliArgs {
    /// Address to bind the gateway to.
    #[arg(short, long, env = "AREACHAT_GATEWAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/areachat-gateway/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest history page the REST API will return.
    #[arg(long)]
    pub history_limit_max: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "AREACHAT_GATEWAY_LOG")]
    pub log_level: String,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to (e.g. `127.0.0.1:9100`).
    pub bind_addr: String,
    /// Largest history page size; requests above it are clamped.
    pub history_limit_max: usize,
    /// Canned assistant answer.
    pub assistant_reply: String,
    /// Accepted users.
    pub users: Vec<UserEntry>,
    /// Known areas. Empty means every area is open.
    pub areas: Vec<AreaRef>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            history_limit_max: 100,
            assistant_reply: "No documents match that question yet.".to_string(),
            users: Vec::new(),
            areas: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// An explicit `--config` that does not exist is an error; a missing
    /// default file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &GatewayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    fn resolve(cli: &GatewayCliArgs, file: GatewayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            history_limit_max: cli
                .history_limit_max
                .or(file.server.history_limit_max)
                .unwrap_or(defaults.history_limit_max)
                .max(1),
            assistant_reply: file.assistant.reply.unwrap_or(defaults.assistant_reply),
            users: file.users,
            areas: file
                .areas
                .into_iter()
                .map(|entry| AreaRef::new(entry.team, entry.area))
                .collect(),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<GatewayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(GatewayConfigFile::default());
        };
        config_dir.join("areachat-gateway").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
