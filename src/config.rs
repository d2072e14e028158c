use std::{env, fmt::Display, str::FromStr};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Postgres connection string. Without one, state lives in memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How many user ids may register from one ip/device fingerprint.
    pub max_users_per_ip: i64,
}

#[derive(Error, Debug)]
#[error("invalid {key} value {value:?}: {reason}")]
pub struct ConfigError {
    key: &'static str,
    value: String,
    reason: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            database_url: None,
            db_max_connections: 5,
            max_users_per_ip: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            port: parse_or("PORT", var("PORT"), defaults.port)?,
            database_url: var("DATABASE_URL"),
            db_max_connections: parse_or(
                "DB_MAX_CONNECTIONS",
                var("DB_MAX_CONNECTIONS"),
                defaults.db_max_connections,
            )?,
            max_users_per_ip: parse_or(
                "MAX_USERS_PER_IP",
                var("MAX_USERS_PER_IP"),
                defaults.max_users_per_ip,
            )?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = raw else {
        info!("{key} not set, using default: {default}");
        return Ok(default);
    };

    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        reason: e.to_string(),
        value: raw,
    })
}
