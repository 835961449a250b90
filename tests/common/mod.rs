// In-memory broker shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rabbit_queue::rabbitmq::{
    BrokerChannel, BrokerClient, BrokerConnection, Delivery, DeliveryStream, PublishFields,
    PublishOptions, QueueHandle,
};
use rabbit_queue::{QueueArguments, QueueFlags, RabbitMQError, Result};
use tokio::sync::{mpsc, Notify};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub options: PublishOptions,
    pub fields: PublishFields,
}

#[derive(Default)]
struct Faults {
    connect: AtomicBool,
    channel: AtomicBool,
    declare: AtomicBool,
    hold_connect: AtomicBool,
    publish_on: Mutex<Option<usize>>,
}

struct Inner {
    connects: AtomicUsize,
    declares: AtomicUsize,
    channels_closed: AtomicUsize,
    connections_closed: AtomicUsize,
    publishes: AtomicUsize,
    faults: Faults,
    connect_released: Notify,
    declared: Mutex<Option<(String, QueueFlags, QueueArguments)>>,
    published: Mutex<Vec<Published>>,
    deliveries_tx: Mutex<Option<mpsc::UnboundedSender<Result<Delivery>>>>,
    deliveries_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Delivery>>>>,
}

/// Single-queue broker: everything published is fed back out of the
/// delivery stream, and tests can push deliveries of their own.
#[derive(Clone)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        FakeBroker {
            inner: Arc::new(Inner {
                connects: AtomicUsize::new(0),
                declares: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
                publishes: AtomicUsize::new(0),
                faults: Faults::default(),
                connect_released: Notify::new(),
                declared: Mutex::new(None),
                published: Mutex::new(Vec::new()),
                deliveries_tx: Mutex::new(Some(tx)),
                deliveries_rx: Mutex::new(Some(rx)),
            }),
        }
    }

    pub fn fail_connect(&self) {
        self.inner.faults.connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_channel(&self) {
        self.inner.faults.channel.store(true, Ordering::SeqCst);
    }

    pub fn fail_declare(&self) {
        self.inner.faults.declare.store(true, Ordering::SeqCst);
    }

    /// The `n`th publish (1-based) is rejected.
    pub fn fail_publish_on(&self, n: usize) {
        *self.inner.faults.publish_on.lock().unwrap() = Some(n);
    }

    /// `connect` parks until `release_connect` is called.
    pub fn hold_connect(&self) {
        self.inner.faults.hold_connect.store(true, Ordering::SeqCst);
    }

    pub fn release_connect(&self) {
        self.inner.connect_released.notify_one();
    }

    pub fn push_delivery(&self, delivery: Delivery) {
        if let Some(tx) = self.inner.deliveries_tx.lock().unwrap().as_ref() {
            tx.send(Ok(delivery)).unwrap();
        }
    }

    pub fn push_stream_error(&self, error: RabbitMQError) {
        if let Some(tx) = self.inner.deliveries_tx.lock().unwrap().as_ref() {
            tx.send(Err(error)).unwrap();
        }
    }

    /// Ends the delivery stream as a broker-side cancel would.
    pub fn close_stream(&self) {
        self.inner.deliveries_tx.lock().unwrap().take();
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn declares(&self) -> usize {
        self.inner.declares.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.inner.channels_closed.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    pub fn declared(&self) -> Option<(String, QueueFlags, QueueArguments)> {
        self.inner.declared.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.published.lock().unwrap().clone()
    }

    pub async fn wait_for_connects(&self, n: usize) {
        tokio::time::timeout(WAIT, async {
            while self.connects() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connect was never attempted");
    }
}

pub struct FakeConnection {
    inner: Arc<Inner>,
}

pub struct FakeChannel {
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerClient for FakeBroker {
    type Connection = FakeConnection;

    async fn connect(&self, uri: &str) -> Result<FakeConnection> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.inner.faults.hold_connect.load(Ordering::SeqCst) {
            self.inner.connect_released.notified().await;
        }
        if self.inner.faults.connect.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError(format!("refused: {}", uri)));
        }
        Ok(FakeConnection {
            inner: self.inner.clone(),
        })
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> Result<FakeChannel> {
        if self.inner.faults.channel.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("no channels left".to_string()));
        }
        Ok(FakeChannel {
            inner: self.inner.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueHandle> {
        self.inner.declares.fetch_add(1, Ordering::SeqCst);
        if self.inner.faults.declare.load(Ordering::SeqCst) {
            return Err(RabbitMQError::DeclareError(format!(
                "PRECONDITION_FAILED for {}",
                name
            )));
        }
        *self.inner.declared.lock().unwrap() = Some((name.to_string(), flags, arguments.clone()));
        Ok(QueueHandle {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn open_delivery_stream(&self, _queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let rx = self
            .inner
            .deliveries_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RabbitMQError::ConsumeError("queue already has a consumer".to_string()))?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
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
        let n = self.inner.publishes.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.inner.faults.publish_on.lock().unwrap() == Some(n) {
            return Err(RabbitMQError::PublishError(format!("publish {} rejected", n)));
        }

        self.inner.published.lock().unwrap().push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            options,
            fields: fields.clone(),
        });
        if let Some(tx) = self.inner.deliveries_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Delivery::from(fields)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn delivery(id: &str) -> Delivery {
    Delivery {
        message_id: id.to_string(),
        kind: "test".to_string(),
        body: id.as_bytes().to_vec(),
        correlation_id: format!("corr-{}", id),
        app_id: "tests".to_string(),
        content_type: "text/plain".to_string(),
    }
}
