//! Server configuration.
//!
//! Every setting has a default; `from_env` overrides them from
//! environment variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COLLAB_BIND_ADDR` | `127.0.0.1:8080` |
//! | `COLLAB_PONG_WAIT_SECS` | `60` |
//! | `COLLAB_OUTBOUND_CAPACITY` | `256` |
//! | `COLLAB_HUB_CAPACITY` | `1024` |

use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::hub::HubConfig;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let pong_wait_secs: u64 = parse_var(&lookup, "COLLAB_PONG_WAIT_SECS", 60)?;
        if pong_wait_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "COLLAB_PONG_WAIT_SECS".into(),
                value: "0".into(),
            });
        }

        Ok(Self {
            bind_addr: lookup("COLLAB_BIND_ADDR").unwrap_or(defaults.bind_addr),
            hub: HubConfig {
                command_capacity: parse_var(&lookup, "COLLAB_HUB_CAPACITY", defaults.hub.command_capacity)?,
            },
            connection: ConnectionConfig {
                pong_wait: Duration::from_secs(pong_wait_secs),
                outbound_capacity: parse_var(
                    &lookup,
                    "COLLAB_OUTBOUND_CAPACITY",
                    defaults.connection.outbound_capacity,
                )?,
            },
        })
    }
}

/// Parse `key` if set, otherwise fall back to `default`.
pub(crate) fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
