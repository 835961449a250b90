// src/rabbitmq/broker.rs
// The broker operations consumers and producers are written against.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use super::errors::Result;
use crate::config::{QueueArguments, QueueConfig, QueueFlags};

/// Wire fields of one inbound delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub kind: String,
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub app_id: String,
    pub content_type: String,
}

/// Wire fields of one outbound publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishFields {
    pub message_id: String,
    pub kind: String,
    pub content_type: String,
    pub correlation_id: String,
    pub app_id: String,
    pub body: Vec<u8>,
}

impl From<PublishFields> for Delivery {
    fn from(fields: PublishFields) -> Self {
        Delivery {
            message_id: fields.message_id,
            kind: fields.kind,
            body: fields.body,
            correlation_id: fields.correlation_id,
            app_id: fields.app_id,
            content_type: fields.content_type,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// What the broker reported back from a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueHandle>;

    /// Subscribes to `queue`; deliveries are acknowledged on receipt.
    async fn open_delivery_stream(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        fields: PublishFields,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Connection, channel and declared queue held by a running instance.
pub(crate) struct QueueSession<B: BrokerClient> {
    pub connection: B::Connection,
    pub channel: <B::Connection as BrokerConnection>::Channel,
    pub queue: QueueHandle,
}

/// Connects, opens a channel and declares the configured queue.
///
/// Whatever was acquired before a failing step is released again.
pub(crate) async fn open_session<B: BrokerClient>(
    broker: &B,
    config: &QueueConfig,
) -> Result<QueueSession<B>> {
    let connection = broker.connect(&config.connection_string()).await?;

    let channel = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(error) => {
            close_connection(&connection).await;
            return Err(error);
        }
    };

    match channel
        .declare_queue(&config.name, config.flags(), &config.arguments)
        .await
    {
        Ok(queue) => {
            debug!(queue = %queue.name, messages = queue.message_count, "queue declared");
            Ok(QueueSession { connection, channel, queue })
        }
        Err(error) => {
            close_channel(&channel).await;
            close_connection(&connection).await;
            Err(error)
        }
    }
}

impl<B: BrokerClient> QueueSession<B> {
    /// Closes the channel, then the connection.
    pub(crate) async fn close(self) {
        close_channel(&self.channel).await;
        close_connection(&self.connection).await;
    }
}

async fn close_channel<Ch: BrokerChannel>(channel: &Ch) {
    if let Err(error) = channel.close().await {
        warn!(%error, "failed to close channel");
    }
}

async fn close_connection<C: BrokerConnection>(connection: &C) {
    if let Err(error) = connection.close().await {
        warn!(%error, "failed to close connection");
    }
}
