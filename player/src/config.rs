use crate::{coordinator::CoordinatorConfig, strategy};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use unobot_client::RetryPolicy;
use unobot_types::api::JoinRequest;
use url::Url;

pub mod defaults {
    pub const BOT_FIRST_NAME: &str = "WorldClass";
    pub const BOT_LAST_NAME: &str = "UnoBot";
    pub const MAC_ADDRESS: &str = "00:11:22:33:44:55";
    pub const STRATEGY: &str = "base";
    pub const SESSION_FILE: &str = "session.json";
    pub const LOG_LEVEL: &str = "info";
    pub const TURN_TIMEOUT_MS: u64 = 15_000;
    pub const DECISION_MARGIN_MS: u64 = 500;
    pub const ACK_WATCHDOG_MS: u64 = 4_000;
    pub const RETRY_MAX_ATTEMPTS: usize = 5;
    pub const RETRY_INITIAL_BACKOFF_MS: u64 = 250;
    pub const RETRY_MAX_BACKOFF_MS: u64 = 5_000;
    pub const RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;
    pub const RECONNECT_MAX_BACKOFF_MS: u64 = 15_000;
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
    pub const MAX_RESYNC_ATTEMPTS: u32 = 5;
    pub const FEED_BUFFER: usize = 1024;
}

/// Display name used for one strategy instead of the bot default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub first_name: String,
    pub last_name: String,
}

/// Bot settings as read from YAML.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub api_base_url: String,
    pub socket_url: String,
    #[serde(default = "default_first_name")]
    pub bot_first_name: String,
    #[serde(default = "default_last_name")]
    pub bot_last_name: String,
    #[serde(default = "default_mac_address")]
    pub mac_address: String,
    #[serde(default = "default_true")]
    pub is_sandbox: bool,
    #[serde(default)]
    pub only_players: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub identities: BTreeMap<String, Identity>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub practice_mode: bool,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_decision_margin_ms")]
    pub decision_margin_ms: u64,
    #[serde(default = "default_ack_watchdog_ms")]
    pub ack_watchdog_ms: u64,
    #[serde(default = "default_true")]
    pub auto_catchout: bool,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_resync_attempts")]
    pub max_resync_attempts: u32,
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,
}

fn default_first_name() -> String {
    defaults::BOT_FIRST_NAME.to_string()
}

fn default_last_name() -> String {
    defaults::BOT_LAST_NAME.to_string()
}

fn default_mac_address() -> String {
    defaults::MAC_ADDRESS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> String {
    defaults::STRATEGY.to_string()
}

fn default_session_file() -> PathBuf {
    PathBuf::from(defaults::SESSION_FILE)
}

fn default_log_level() -> String {
    defaults::LOG_LEVEL.to_string()
}

fn default_turn_timeout_ms() -> u64 {
    defaults::TURN_TIMEOUT_MS
}

fn default_decision_margin_ms() -> u64 {
    defaults::DECISION_MARGIN_MS
}

fn default_ack_watchdog_ms() -> u64 {
    defaults::ACK_WATCHDOG_MS
}

fn default_retry_max_attempts() -> usize {
    defaults::RETRY_MAX_ATTEMPTS
}

fn default_retry_initial_backoff_ms() -> u64 {
    defaults::RETRY_INITIAL_BACKOFF_MS
}

fn default_retry_max_backoff_ms() -> u64 {
    defaults::RETRY_MAX_BACKOFF_MS
}

fn default_reconnect_initial_backoff_ms() -> u64 {
    defaults::RECONNECT_INITIAL_BACKOFF_MS
}

fn default_reconnect_max_backoff_ms() -> u64 {
    defaults::RECONNECT_MAX_BACKOFF_MS
}

fn default_max_reconnect_attempts() -> u32 {
    defaults::MAX_RECONNECT_ATTEMPTS
}

fn default_max_resync_attempts() -> u32 {
    defaults::MAX_RESYNC_ATTEMPTS
}

fn default_feed_buffer() -> usize {
    defaults::FEED_BUFFER
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be one of {allowed}: {value}")]
    InvalidUrlScheme {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },
    #[error("unknown strategy {name} (known: {known})")]
    UnknownStrategy { name: String, known: String },
    #[error("{field} ({value}ms) must be shorter than turn_timeout_ms ({timeout}ms)")]
    ExceedsTurnTimeout {
        field: &'static str,
        value: u64,
        timeout: u64,
    },
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn validate_url(
    field: &'static str,
    value: &str,
    allowed: &'static [&'static str],
) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    };
    let url = Url::parse(value).map_err(|_| invalid())?;
    if !allowed.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrlScheme {
            field,
            value: value.to_string(),
            allowed: if allowed.len() == 2 {
                "http, https"
            } else {
                "ws, wss, http, https"
            },
        });
    }
    if url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(())
}

/// Settings after validation, in the types the runtime uses.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub api_base_url: String,
    pub socket_url: String,
    pub identity: Identity,
    pub mac_address: String,
    pub is_sandbox: bool,
    pub only_players: bool,
    pub strategy: &'static str,
    pub room_id: Option<String>,
    pub session_file: PathBuf,
    pub log_level: Level,
    pub log_json: bool,
    /// `None` in practice mode: decisions have no deadline.
    pub turn_timeout: Option<Duration>,
    pub decision_margin: Duration,
    pub ack_watchdog: Duration,
    pub auto_catchout: bool,
    pub retry_policy: RetryPolicy,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub max_resync_attempts: u32,
    pub feed_buffer: usize,
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        validate_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        validate_url(
            "socket_url",
            &self.socket_url,
            &["ws", "wss", "http", "https"],
        )?;
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        ensure_nonzero("retry_max_attempts", self.retry_max_attempts as u64)?;
        ensure_nonzero("retry_initial_backoff_ms", self.retry_initial_backoff_ms)?;
        ensure_nonzero("retry_max_backoff_ms", self.retry_max_backoff_ms)?;
        ensure_nonzero(
            "reconnect_initial_backoff_ms",
            self.reconnect_initial_backoff_ms,
        )?;
        ensure_nonzero("reconnect_max_backoff_ms", self.reconnect_max_backoff_ms)?;
        ensure_nonzero("max_reconnect_attempts", self.max_reconnect_attempts as u64)?;
        ensure_nonzero("max_resync_attempts", self.max_resync_attempts as u64)?;
        ensure_nonzero("feed_buffer", self.feed_buffer as u64)?;
        ensure_nonzero("ack_watchdog_ms", self.ack_watchdog_ms)?;

        let turn_timeout = if self.practice_mode {
            None
        } else {
            ensure_nonzero("turn_timeout_ms", self.turn_timeout_ms)?;
            for (field, value) in [
                ("decision_margin_ms", self.decision_margin_ms),
                ("ack_watchdog_ms", self.ack_watchdog_ms),
            ] {
                if value >= self.turn_timeout_ms {
                    return Err(ConfigError::ExceedsTurnTimeout {
                        field,
                        value,
                        timeout: self.turn_timeout_ms,
                    });
                }
            }
            Some(Duration::from_millis(self.turn_timeout_ms))
        };

        let strategy = strategy::by_name(&self.strategy)
            .ok_or_else(|| ConfigError::UnknownStrategy {
                name: self.strategy.clone(),
                known: strategy::registered()
                    .iter()
                    .map(|factory| factory.name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?
            .name;
        let identity = self
            .identities
            .get(strategy)
            .cloned()
            .unwrap_or_else(|| Identity {
                first_name: self.bot_first_name.clone(),
                last_name: self.bot_last_name.clone(),
            });

        Ok(ValidatedConfig {
            api_base_url: self.api_base_url,
            socket_url: self.socket_url,
            identity,
            mac_address: self.mac_address,
            is_sandbox: self.is_sandbox,
            only_players: self.only_players,
            strategy,
            room_id: self.room_id,
            session_file: self.session_file,
            log_level,
            log_json: self.log_json,
            turn_timeout,
            decision_margin: Duration::from_millis(self.decision_margin_ms),
            ack_watchdog: Duration::from_millis(self.ack_watchdog_ms),
            auto_catchout: self.auto_catchout,
            retry_policy: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                retry_non_idempotent: false,
            },
            reconnect_initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            reconnect_max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_resync_attempts: self.max_resync_attempts,
            feed_buffer: self.feed_buffer,
        })
    }
}

impl ValidatedConfig {
    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            first_name: self.identity.first_name.clone(),
            last_name: self.identity.last_name.clone(),
            mac: self.mac_address.clone(),
            is_sandbox: self.is_sandbox,
            only_players: self.only_players,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            turn_timeout: self.turn_timeout,
            decision_margin: self.decision_margin,
            ack_watchdog: self.ack_watchdog,
            auto_catchout: self.auto_catchout,
            max_resync_attempts: self.max_resync_attempts,
            resync_backoff: self.retry_policy.initial_backoff,
        }
    }
}
