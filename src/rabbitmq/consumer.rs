// src/rabbitmq/consumer.rs

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, Instrument};
use uuid::Uuid;

use super::broker::{open_session, BrokerChannel, BrokerClient, DeliveryStream, QueueSession};
use super::errors::{RabbitMQError, Result};
use super::lifecycle::{Lifecycle, State, StopReason};
use crate::config::QueueConfig;
use crate::message::Message;

/// Called once for each message received, in delivery order.
///
/// Returning an error stops the consumer; the error becomes its last error.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Consumes one queue, handing each delivery to a [`MessageHandler`].
///
/// A consumer is single-use: once stopped it stays stopped.
pub struct QueueConsumer<B: BrokerClient> {
    name: String,
    config: Arc<QueueConfig>,
    broker: Arc<B>,
    lifecycle: Arc<Lifecycle>,
}

impl<B: BrokerClient> QueueConsumer<B> {
    pub fn new(config: Arc<QueueConfig>, broker: Arc<B>) -> Self {
        let name = Uuid::new_v4().to_string();
        QueueConsumer {
            lifecycle: Arc::new(Lifecycle::new(format!("consumer:{}", name))),
            name,
            config,
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// The failure that stopped this consumer, if any.
    pub fn last_error(&self) -> Option<RabbitMQError> {
        self.lifecycle.last_error()
    }

    /// Subscribes to the queue and spawns the delivery loop.
    ///
    /// Only the first call has any effect. A setup failure is recorded as the
    /// last error, returned, and leaves the consumer stopped.
    #[instrument(skip(self, handler), fields(consumer = %self.name, queue = %self.config.name))]
    pub async fn start<H: MessageHandler>(&self, handler: H) -> Result<()> {
        if !self.lifecycle.begin_start() {
            if self.lifecycle.state() == State::Stopped {
                return Err(RabbitMQError::InstanceStopped(format!(
                    "start() called for dead consumer {}",
                    self.name
                )));
            }
            debug!("consumer already started");
            return Ok(());
        }

        info!("consumer is alive");

        // Setup runs in the spawned task so dropping this future cannot strand
        // the consumer half-started.
        let (ready, ready_rx) = oneshot::channel();
        let name = self.name.clone();
        let config = self.config.clone();
        let broker = self.broker.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(
            async move {
                let Some((session, deliveries)) =
                    subscribe(broker.as_ref(), &config, &name, &lifecycle, ready).await
                else {
                    return;
                };
                deliver(&name, &lifecycle, deliveries, handler).await;
                session.close().await;
                lifecycle.finish();
                info!(consumer = %name, "consumer is dead");
            }
            .in_current_span(),
        );

        self.lifecycle.setup_outcome(ready_rx).await
    }

    /// Starts the consumer and waits until it has stopped.
    ///
    /// Returns the last error, so a failure-triggered stop is an `Err` and a
    /// requested stop is `Ok`.
    pub async fn run<H: MessageHandler>(&self, handler: H) -> Result<()> {
        self.start(handler).await?;
        self.wait_until_stopped().await;
        match self.last_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Sends the stop signal. Returns false when it had already been sent.
    pub fn stop(&self) -> bool {
        let sent = self.lifecycle.request_stop(StopReason::Requested);
        if sent {
            info!(consumer = %self.name, "stop requested");
        }
        sent
    }

    /// Resolves once the consumer is stopped and its resources released.
    ///
    /// Never resolves for a consumer that is neither started nor stopped.
    pub async fn wait_until_stopped(&self) {
        self.lifecycle.stopped().await;
    }
}

impl<B: BrokerClient> Drop for QueueConsumer<B> {
    fn drop(&mut self) {
        // Nobody is left to stop a running delivery loop.
        self.lifecycle.request_stop(StopReason::Requested);
    }
}

/// Opens the session and the delivery stream, reporting the outcome on `ready`.
///
/// Returns `None` when setup failed or a stop arrived meanwhile; either way the
/// consumer is already `Stopped` and nothing is left open.
async fn subscribe<B: BrokerClient>(
    broker: &B,
    config: &QueueConfig,
    name: &str,
    lifecycle: &Lifecycle,
    ready: oneshot::Sender<Result<()>>,
) -> Option<(QueueSession<B>, DeliveryStream)> {
    let session = match open_session(broker, config).await {
        Ok(session) => session,
        Err(error) => {
            let _ = ready.send(Err(lifecycle.abort_start(error)));
            return None;
        }
    };

    let consumer_tag = format!("consumer-{}", name);
    let opened = session
        .channel
        .open_delivery_stream(&session.queue.name, &consumer_tag)
        .await;
    let deliveries = match opened {
        Ok(deliveries) => deliveries,
        Err(error) => {
            session.close().await;
            let _ = ready.send(Err(lifecycle.abort_start(error)));
            return None;
        }
    };

    if !lifecycle.mark_running() {
        info!(consumer = %name, "stop requested during setup");
        drop(deliveries);
        session.close().await;
        lifecycle.finish();
        let _ = ready.send(Ok(()));
        return None;
    }

    let _ = ready.send(Ok(()));
    Some((session, deliveries))
}

async fn deliver<H: MessageHandler>(
    name: &str,
    lifecycle: &Lifecycle,
    mut deliveries: DeliveryStream,
    handler: H,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = lifecycle.stop_requested() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(error)) => {
                lifecycle.fail(error);
                break;
            }
            None => {
                lifecycle.fail(RabbitMQError::ConsumeError(
                    "delivery stream closed by broker".to_string(),
                ));
                break;
            }
        };

        let message = Message::from(delivery);
        debug!(consumer = %name, message_id = %message.id(), "received delivery");

        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                lifecycle.fail(RabbitMQError::CallbackError(format!("{:#}", error)));
                break;
            }
            Err(_) => {
                lifecycle.fail(RabbitMQError::CallbackError(
                    "message handler panicked".to_string(),
                ));
                break;
            }
        }
    }
}
