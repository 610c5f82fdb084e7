use std::{net::SocketAddr, path::Path, time::Duration};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{guild::GuildConfig, resolver::DEFAULT_LINK_MARKER};

pub const ENV_PREFIX: &str = "GUILDCAST";

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub command_prefix: String,
    pub connect_timeout_ms: u64,
    pub guild_idle_timeout_ms: u64,
    pub guild_mailbox: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<SocketAddr>,
    pub link_preview_marker: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            command_prefix: "!".to_string(),
            connect_timeout_ms: 10_000,
            guild_idle_timeout_ms: 30_000,
            guild_mailbox: 32,
            http_addr: None,
            link_preview_marker: DEFAULT_LINK_MARKER.to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from an optional TOML file, overridden by
    /// `GUILDCAST__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = path.map(|p| File::from(p).format(FileFormat::Toml));
        Self::build(file, environment())
    }

    fn build<S>(file: Option<S>, env: Environment) -> Result<Self, SettingsError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.command_prefix.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "command_prefix",
                reason: "must not be blank".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::Invalid {
                key: "connect_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.guild_mailbox == 0 {
            return Err(SettingsError::Invalid {
                key: "guild_mailbox",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.link_preview_marker.is_empty() {
            return Err(SettingsError::Invalid {
                key: "link_preview_marker",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn guild_config(&self) -> GuildConfig {
        GuildConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_millis(self.guild_idle_timeout_ms),
            mailbox: self.guild_mailbox,
        }
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
