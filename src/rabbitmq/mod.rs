// src/rabbitmq/mod.rs
// Queue consumers and producers over a RabbitMQ broker

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod errors;
mod lifecycle;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use broker::{
    BrokerChannel, BrokerClient, BrokerConnection, Delivery, DeliveryStream, PublishFields,
    PublishOptions, QueueHandle,
};
pub use connection::LapinBroker;
pub use consumer::{MessageHandler, QueueConsumer};
pub use errors::{RabbitMQError, Result};
pub use lifecycle::{State, StopReason};
pub use publisher::QueueProducer;
