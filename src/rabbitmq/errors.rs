// src/rabbitmq/errors.rs

use thiserror::Error;

/// Everything that can stop a consumer or producer.
///
/// Payloads are plain strings so an error can be stored as the instance's
/// last error and cloned out to any number of readers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ queue declare error: {0}")]
    DeclareError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("Message handler error: {0}")]
    CallbackError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Instance stopped: {0}")]
    InstanceStopped(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RabbitMQError {
    /// True for failures raised before the delivery/publish loop ever ran.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::DeclareError(_)
                | RabbitMQError::ConsumeError(_)
        )
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}
