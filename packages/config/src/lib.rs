#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Server configuration, read once from the environment before the hub
//! starts accepting connections.

use std::collections::BTreeMap;

use chatbox_frame::DEFAULT_MAX_FRAME_SIZE;
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CREDENTIAL_HEADER: &str = "Authorization";

pub const ENV_LISTEN_ADDR: &str = "CHATBOX_ADDR";
pub const ENV_MAX_FRAME_SIZE: &str = "CHATBOX_MAX_FRAME_SIZE";
pub const ENV_MAX_MESSAGE_SIZE: &str = "CHATBOX_MAX_MESSAGE_SIZE";
pub const ENV_BROADCAST_TO_SENDER: &str = "CHATBOX_BROADCAST_TO_SENDER";
pub const ENV_CREDENTIAL_HEADER: &str = "CHATBOX_CREDENTIAL_HEADER";
pub const ENV_TOKEN_SECRET: &str = "CHATBOX_TOKEN_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Source of environment variables.
pub trait EnvProvider {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardEnv;

impl EnvProvider for StandardEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of variables, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: BTreeMap<String, String>,
}

impl MapEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvProvider for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: String,
    /// Largest payload written into one outbound data frame.
    pub max_frame_size: usize,
    /// Largest reassembled inbound message.
    pub max_message_size: usize,
    /// Whether a broadcast is also delivered back to its sender.
    pub broadcast_to_sender: bool,
    /// Handshake header carrying the client's credential.
    pub credential_header: String,
    /// Mixed into every issued token when set.
    pub token_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            broadcast_to_sender: false,
            credential_header: DEFAULT_CREDENTIAL_HEADER.to_string(),
            token_secret: None,
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// * If any `CHATBOX_*` variable is set to a value that does not parse
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_provider(&StandardEnv)
    }

    /// # Errors
    ///
    /// * If any variable is set to a value that does not parse
    pub fn from_provider(env: &impl EnvProvider) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            listen_addr: env
                .var(ENV_LISTEN_ADDR)
                .filter(|addr| !addr.trim().is_empty())
                .unwrap_or(defaults.listen_addr),
            max_frame_size: env
                .var(ENV_MAX_FRAME_SIZE)
                .map(|value| parse_size(ENV_MAX_FRAME_SIZE, &value))
                .transpose()?
                .unwrap_or(defaults.max_frame_size),
            max_message_size: env
                .var(ENV_MAX_MESSAGE_SIZE)
                .map(|value| parse_size(ENV_MAX_MESSAGE_SIZE, &value))
                .transpose()?
                .unwrap_or(defaults.max_message_size),
            broadcast_to_sender: env
                .var(ENV_BROADCAST_TO_SENDER)
                .map(|value| parse_bool(ENV_BROADCAST_TO_SENDER, &value))
                .transpose()?
                .unwrap_or(defaults.broadcast_to_sender),
            credential_header: env
                .var(ENV_CREDENTIAL_HEADER)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.credential_header),
            token_secret: env.var(ENV_TOKEN_SECRET).filter(|s| !s.is_empty()),
        };

        log::debug!(
            "Loaded config listen_addr={} max_frame_size={} max_message_size={} broadcast_to_sender={}",
            config.listen_addr,
            config.max_frame_size,
            config.max_message_size,
            config.broadcast_to_sender,
        );

        Ok(config)
    }

    #[must_use]
    pub fn with_listen_addr(mut self, listen_addr: impl Into<String>) -> Self {
        self.listen_addr = listen_addr.into();
        self
    }

    #[must_use]
    pub const fn with_broadcast_to_sender(mut self, broadcast_to_sender: bool) -> Self {
        self.broadcast_to_sender = broadcast_to_sender;
        self
    }

    /// Values of zero are ignored.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        if max_frame_size > 0 {
            self.max_frame_size = max_frame_size;
        }
        self
    }

    /// Values of zero are ignored.
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        if max_message_size > 0 {
            self.max_message_size = max_message_size;
        }
        self
    }

    #[must_use]
    pub fn with_credential_header(mut self, credential_header: impl Into<String>) -> Self {
        self.credential_header = credential_header.into();
        self
    }
}

fn parse_size(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}
