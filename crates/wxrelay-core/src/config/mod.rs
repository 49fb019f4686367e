mod defaults;
mod notices;

#[cfg(test)]
mod tests;

pub use notices::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::RelayError;
use crate::message::ContentKind;
use defaults::*;

/// Environment variable that overrides `backend.api_key`.
pub const API_KEY_ENV: &str = "WXRELAY_BACKEND_API_KEY";

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Persona name → system prompt.
    #[serde(default)]
    pub personas: BTreeMap<String, String>,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub notices: Notices,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Daily-rolling log file. Empty = stdout only.
    #[serde(default)]
    pub log_file: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_file: String::new(),
        }
    }
}

/// Flavour of the protocol service API.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[default]
    #[serde(rename = "849")]
    V849,
    #[serde(rename = "855")]
    V855,
    #[serde(rename = "ipad")]
    Ipad,
}

impl ProtocolVersion {
    /// Path prefix the service mounts its API under.
    pub fn api_prefix(&self) -> &'static str {
        match self {
            Self::V849 => "/VXAPI",
            Self::V855 | Self::Ipad => "/api",
        }
    }
}

/// Protocol service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_protocol_host")]
    pub host: String,
    #[serde(default = "default_protocol_port")]
    pub port: u16,
    #[serde(default)]
    pub version: ProtocolVersion,
    /// Account id of the logged-in bot.
    #[serde(default)]
    pub wxid: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_protocol_timeout")]
    pub request_timeout_secs: u64,
    /// How long a message id is remembered for dedup.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Events older than this are history replay and get skipped.
    #[serde(default = "default_max_message_age")]
    pub max_message_age_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            host: default_protocol_host(),
            port: default_protocol_port(),
            version: ProtocolVersion::default(),
            wxid: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_protocol_timeout(),
            dedup_window_secs: default_dedup_window(),
            max_message_age_secs: default_max_message_age(),
        }
    }
}

impl ProtocolConfig {
    /// `http://host:port/prefix` without a trailing slash.
    pub fn base_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.host,
            self.port,
            self.version.api_prefix()
        )
    }
}

/// Which backend client to build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    ChatApi,
    Openai,
}

/// How the chat API delivers its answer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Blocking,
    Streaming,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Streaming => "streaming",
        }
    }
}

/// AI backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Model name (OpenAI-compatible backends only).
    #[serde(default = "default_backend_model")]
    pub model: String,
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// Upper bound for one AI exchange.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: default_backend_base_url(),
            api_key: String::new(),
            model: default_backend_model(),
            response_mode: ResponseMode::default(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

/// Which identifier set the admission filter consults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreMode {
    #[default]
    #[serde(alias = "none")]
    None,
    #[serde(alias = "whitelist")]
    Whitelist,
    #[serde(alias = "blacklist")]
    Blacklist,
}

/// Admission rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub ignore_mode: IgnoreMode,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Private-chat trigger prefixes. Empty list or `""` = accept everything.
    #[serde(default = "default_single_chat_prefix")]
    pub single_chat_prefix: Vec<String>,
    /// Group trigger prefixes.
    #[serde(default = "default_group_chat_prefix")]
    pub group_chat_prefix: Vec<String>,
    /// Media kinds forwarded as descriptor lines (`image`, `voice`, `file`).
    #[serde(default)]
    pub accept_media: Vec<ContentKind>,
    /// Drop official, platform, and payment-notice accounts.
    #[serde(default = "default_true")]
    pub ignore_system_accounts: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignore_mode: IgnoreMode::default(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            single_chat_prefix: default_single_chat_prefix(),
            group_chat_prefix: default_group_chat_prefix(),
            accept_media: Vec::new(),
            ignore_system_accounts: true,
        }
    }
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_persona")]
    pub default_persona: String,
    /// Conversations idle for longer than this are evicted.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// One context per group instead of one per group member.
    #[serde(default)]
    pub group_shared_session: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            default_persona: default_persona(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            group_shared_session: false,
        }
    }
}

/// Admin mode settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Shared secret for the `auth` command. Empty = admin mode disabled.
    #[serde(default)]
    pub secret: String,
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrent exchanges across all conversations.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Admitted messages allowed to wait for a worker. Beyond this the
    /// sender gets the `overloaded` notice.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Prefix group replies with `@sender`.
    #[serde(default = "default_true")]
    pub group_reply_mention: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_pending: default_max_pending(),
            group_reply_mention: true,
        }
    }
}

impl Config {
    /// Check the settings `start` cannot run without.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.protocol.wxid.trim().is_empty() {
            return Err(RelayError::Config(
                "protocol.wxid is empty; set it to the logged-in bot account".into(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(RelayError::Config("backend.base_url is empty".into()));
        }
        if self.dispatch.max_workers == 0 {
            return Err(RelayError::Config(
                "dispatch.max_workers must be at least 1".into(),
            ));
        }
        if self.dispatch.max_pending < self.dispatch.max_workers {
            return Err(RelayError::Config(
                "dispatch.max_pending must be at least dispatch.max_workers".into(),
            ));
        }
        if !self.personas.is_empty() && !self.personas.contains_key(&self.session.default_persona) {
            return Err(RelayError::Config(format!(
                "session.default_persona '{}' is not defined in [personas]",
                self.session.default_persona
            )));
        }
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.backend.api_key = key;
            }
        }
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, RelayError> {
    let path = Path::new(path);
    if !path.exists() {
        info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        let mut config = Config::default();
        config.apply_env();
        return Ok(config);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let mut config = parse(&content)?;
    config.apply_env();
    Ok(config)
}

/// Parse configuration from TOML text.
pub fn parse(content: &str) -> Result<Config, RelayError> {
    toml::from_str(content).map_err(|e| RelayError::Config(format!("failed to parse config: {e}")))
}
