// src/rabbitmq/publisher.rs

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, Instrument};
use uuid::Uuid;

use super::broker::{open_session, BrokerChannel, BrokerClient, PublishFields, PublishOptions};
use super::errors::{RabbitMQError, Result};
use super::lifecycle::{Lifecycle, State, StopReason};
use crate::config::QueueConfig;
use crate::message::Message;

/// A message on its way to the publish loop; `accepted` fires once the loop
/// has taken it.
struct Envelope {
    message: Message,
    accepted: oneshot::Sender<()>,
}

/// Publishes messages handed to [`QueueProducer::send`] onto one queue.
///
/// A producer is single-use: once stopped it stays stopped.
pub struct QueueProducer<B: BrokerClient> {
    name: String,
    config: Arc<QueueConfig>,
    broker: Arc<B>,
    lifecycle: Arc<Lifecycle>,
    outbox: mpsc::Sender<Envelope>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl<B: BrokerClient> QueueProducer<B> {
    pub fn new(config: Arc<QueueConfig>, broker: Arc<B>) -> Self {
        let name = Uuid::new_v4().to_string();
        let (outbox, inbox) = mpsc::channel(1);
        QueueProducer {
            lifecycle: Arc::new(Lifecycle::new(format!("producer:{}", name))),
            name,
            config,
            broker,
            outbox,
            inbox: Mutex::new(Some(inbox)),
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

    /// The failure that stopped this producer, if any.
    pub fn last_error(&self) -> Option<RabbitMQError> {
        self.lifecycle.last_error()
    }

    /// Declares the queue and spawns the publish loop.
    ///
    /// Only the first call has any effect. A setup failure is recorded as the
    /// last error, returned, and leaves the producer stopped.
    #[instrument(skip(self), fields(producer = %self.name, queue = %self.config.name))]
    pub async fn start(&self) -> Result<()> {
        if !self.lifecycle.begin_start() {
            if self.lifecycle.state() == State::Stopped {
                return Err(self.stopped_error());
            }
            debug!("producer already started");
            return Ok(());
        }

        info!("started producing");

        let inbox = match self.inbox.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(inbox) = inbox else {
            return Err(self.lifecycle.abort_start(RabbitMQError::Unknown(
                "publish conduit already taken".to_string(),
            )));
        };

        // Setup runs in the spawned task so dropping this future cannot strand
        // the producer half-started.
        let (ready, ready_rx) = oneshot::channel();
        let name = self.name.clone();
        let config = self.config.clone();
        let broker = self.broker.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(
            async move {
                let session = match open_session(broker.as_ref(), &config).await {
                    Ok(session) => session,
                    Err(error) => {
                        let _ = ready.send(Err(lifecycle.abort_start(error)));
                        return;
                    }
                };

                if !lifecycle.mark_running() {
                    info!(producer = %name, "stop requested during setup");
                    session.close().await;
                    lifecycle.finish();
                    let _ = ready.send(Ok(()));
                    return;
                }

                let _ = ready.send(Ok(()));
                publish(&name, &lifecycle, inbox, &session.channel, &session.queue.name).await;
                session.close().await;
                lifecycle.finish();
                info!(producer = %name, "stopped producing");
            }
            .in_current_span(),
        );

        self.lifecycle.setup_outcome(ready_rx).await
    }

    /// Starts the producer and waits until it has stopped.
    ///
    /// Returns the last error, so a failure-triggered stop is an `Err` and a
    /// requested stop is `Ok`.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.wait_until_stopped().await;
        match self.last_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Hands `message` to the publish loop.
    ///
    /// Returns once the loop has taken the message, which makes this call the
    /// producer's backpressure point. Waits while the producer is still
    /// starting and fails with `InstanceStopped` once a stop was signalled.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.lifecycle.state().is_stopping_or_stopped() {
            return Err(self.stopped_error());
        }

        let (accepted, accepted_rx) = oneshot::channel();
        let handoff = async {
            self.outbox
                .send(Envelope { message, accepted })
                .await
                .map_err(|_| ())?;
            accepted_rx.await.map_err(|_| ())
        };

        tokio::select! {
            biased;
            taken = handoff => taken.map_err(|_| self.stopped_error()),
            _ = self.lifecycle.stop_requested() => Err(self.stopped_error()),
        }
    }

    /// Sends the stop signal. Returns false when it had already been sent.
    pub fn stop(&self) -> bool {
        let sent = self.lifecycle.request_stop(StopReason::Requested);
        if sent {
            info!(producer = %self.name, "stop requested");
        }
        sent
    }

    /// Resolves once the producer is stopped and its resources released.
    ///
    /// Never resolves for a producer that is neither started nor stopped.
    pub async fn wait_until_stopped(&self) {
        self.lifecycle.stopped().await;
    }

    fn stopped_error(&self) -> RabbitMQError {
        RabbitMQError::InstanceStopped(format!("producer {} is stopped", self.name))
    }
}

impl<B: BrokerClient> Drop for QueueProducer<B> {
    fn drop(&mut self) {
        self.lifecycle.request_stop(StopReason::Requested);
    }
}

async fn publish<Ch: BrokerChannel>(
    name: &str,
    lifecycle: &Lifecycle,
    mut inbox: mpsc::Receiver<Envelope>,
    channel: &Ch,
    routing_key: &str,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = lifecycle.stop_requested() => break,
            envelope = inbox.recv() => envelope,
        };

        let Some(Envelope { message, accepted }) = envelope else {
            lifecycle.request_stop(StopReason::Requested);
            break;
        };

        // The sender gave up waiting, so the message was never accepted.
        if accepted.send(()).is_err() {
            continue;
        }

        match channel
            .publish("", routing_key, PublishOptions::default(), PublishFields::from(&message))
            .await
        {
            Ok(()) => debug!(
                producer = %name,
                correlation_id = %message.correlation_id(),
                "produced a message"
            ),
            Err(error) => {
                lifecycle.fail(error);
                break;
            }
        }
    }

    // Pending senders see the conduit close.
    inbox.close();
}
