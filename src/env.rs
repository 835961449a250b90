use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::config::QueueConfig;
use crate::rabbitmq::errors::{RabbitMQError, Result};

pub const QUEUE_VAR: &str = "RABBITMQ_QUEUE";
pub const USER_VAR: &str = "RABBITMQ_USER";
pub const PASSWORD_VAR: &str = "RABBITMQ_PASSWORD";
pub const HOST_VAR: &str = "RABBITMQ_HOST";
pub const PORT_VAR: &str = "RABBITMQ_PORT";
pub const DURABLE_VAR: &str = "RABBITMQ_DURABLE";
pub const AUTO_DELETE_VAR: &str = "RABBITMQ_AUTO_DELETE";
pub const EXCLUSIVE_VAR: &str = "RABBITMQ_EXCLUSIVE";
pub const NO_WAIT_VAR: &str = "RABBITMQ_NO_WAIT";

/// Builds a `QueueConfig` from the process environment (and `.env`, if present).
///
/// Only `RABBITMQ_QUEUE` is required; every other variable falls back to the
/// `QueueConfig` default when unset.
pub fn queue_config_from_env() -> Result<QueueConfig> {
    dotenv().ok();
    queue_config_from_lookup(|key| env::var(key).ok())
}

pub fn queue_config_from_lookup<F>(lookup: F) -> Result<QueueConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let name = lookup(QUEUE_VAR)
        .ok_or_else(|| RabbitMQError::ConfigError(format!("{} is not set", QUEUE_VAR)))?;
    let mut config = QueueConfig::new(name)?;

    if let Some(user_name) = lookup(USER_VAR) {
        config.user_name = user_name;
    }
    if let Some(password) = lookup(PASSWORD_VAR) {
        config.password = password;
    }
    if let Some(host_name) = lookup(HOST_VAR) {
        config.host_name = host_name;
    }
    if let Some(port) = lookup(PORT_VAR) {
        config.port = port.trim().parse()?;
    }
    config.durable = parse_flag(&lookup, DURABLE_VAR, config.durable)?;
    config.auto_delete = parse_flag(&lookup, AUTO_DELETE_VAR, config.auto_delete)?;
    config.exclusive = parse_flag(&lookup, EXCLUSIVE_VAR, config.exclusive)?;
    config.no_wait = parse_flag(&lookup, NO_WAIT_VAR, config.no_wait)?;

    config.validate()?;
    Ok(config)
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => bool::from_str(value.trim().to_ascii_lowercase().as_str()).map_err(|_| {
            RabbitMQError::ConfigError(format!("{} must be true or false, got {:?}", key, value))
        }),
        None => Ok(default),
    }
}
