// src/rabbitmq/connection.rs
// lapin-backed implementation of the broker traits.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::broker::{
    BrokerChannel, BrokerClient, BrokerConnection, Delivery, DeliveryStream, PublishFields,
    PublishOptions, QueueHandle,
};
use super::errors::{RabbitMQError, Result};
use crate::config::{ArgumentValue, QueueArguments, QueueFlags};

/// Talks to a real RabbitMQ server.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        LapinBroker
    }
}

pub struct LapinConnection {
    connection: Connection,
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerClient for LapinBroker {
    type Connection = LapinConnection;

    async fn connect(&self, uri: &str) -> Result<LapinConnection> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        info!("Successfully connected to RabbitMQ");
        Ok(LapinConnection { connection })
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "Channel created");
        Ok(LapinChannel { channel })
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueHandle> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: flags.durable,
            exclusive: flags.exclusive,
            auto_delete: flags.auto_delete,
            nowait: flags.no_wait,
        };

        let queue = self
            .channel
            .queue_declare(name, options, field_table(arguments))
            .await
            .map_err(|e| RabbitMQError::DeclareError(format!("Failed to declare queue {}: {}", name, e)))?;

        Ok(QueueHandle {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn open_delivery_stream(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("Failed to start consuming: {}", e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Delivery {
                    message_id: short_string(d.properties.message_id()),
                    kind: short_string(d.properties.kind()),
                    correlation_id: short_string(d.properties.correlation_id()),
                    app_id: short_string(d.properties.app_id()),
                    content_type: short_string(d.properties.content_type()),
                    body: d.data,
                })
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        fields: PublishFields,
    ) -> Result<()> {
        let properties = publish_properties(&fields);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                &fields.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        match confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
        {
            Confirmation::Nack(_) => Err(RabbitMQError::PublishError(format!(
                "Broker rejected message {}",
                fields.message_id
            ))),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

fn short_string(value: &Option<ShortString>) -> String {
    value
        .as_ref()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default()
}

// Empty strings are left unset on the wire.
fn publish_properties(fields: &PublishFields) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if !fields.message_id.is_empty() {
        properties = properties.with_message_id(fields.message_id.clone().into());
    }
    if !fields.kind.is_empty() {
        properties = properties.with_kind(fields.kind.clone().into());
    }
    if !fields.content_type.is_empty() {
        properties = properties.with_content_type(fields.content_type.clone().into());
    }
    if !fields.correlation_id.is_empty() {
        properties = properties.with_correlation_id(fields.correlation_id.clone().into());
    }
    if !fields.app_id.is_empty() {
        properties = properties.with_app_id(fields.app_id.clone().into());
    }
    properties
}

fn field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgumentValue::Bool(b) => AMQPValue::Boolean(*b),
            ArgumentValue::Int(i) => AMQPValue::LongLongInt(*i),
            ArgumentValue::Float(f) => AMQPValue::Double(*f),
            ArgumentValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}
