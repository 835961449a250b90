//! Queue consumers and producers that own their broker connection, channel
//! and queue declaration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rabbit_queue::{LapinBroker, Message, QueueConfig, QueueConsumer};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Arc::new(QueueConfig::new("orders")?);
//! let consumer = QueueConsumer::new(config, Arc::new(LapinBroker::new()));
//! consumer
//!     .run(|message: Message| async move {
//!         println!("{}", message.to_json()?);
//!         Ok::<(), anyhow::Error>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::{ArgumentValue, QueueArguments, QueueConfig, QueueFlags};
pub use message::Message;
pub use rabbitmq::{
    LapinBroker, MessageHandler, QueueConsumer, QueueProducer, RabbitMQError, Result, State,
    StopReason,
};
