use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rabbit_queue::{config, env, LapinBroker, Message, QueueConfig, QueueConsumer, QueueProducer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const USAGE: &str = "usage: rabbit_queue <consume | produce <text>... | init-config <queue> [path]>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("consume") => consume(load_queue_config()?).await,
        Some("produce") => produce(load_queue_config()?, &args[1..]).await,
        Some("init-config") => {
            let queue = args.get(1).context(USAGE)?;
            let path = args.get(2).map(String::as_str).unwrap_or("rabbit_queue.json");
            config::create_default_config_file(Path::new(path), queue)
        }
        _ => bail!(USAGE),
    }
}

// A config file wins over the environment.
fn load_queue_config() -> Result<Arc<QueueConfig>> {
    let config = match config::load_config() {
        Ok(config) => config,
        Err(file_error) => {
            info!("No usable config file ({}), reading the environment", file_error);
            env::queue_config_from_env().context("Failed to load queue configuration")?
        }
    };
    info!(queue = %config.name, host = %config.host_name, port = config.port, "Loaded queue configuration");
    Ok(Arc::new(config))
}

async fn consume(config: Arc<QueueConfig>) -> Result<()> {
    let consumer = Arc::new(QueueConsumer::new(config, Arc::new(LapinBroker::new())));

    let stopper = consumer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping consumer");
            stopper.stop();
        }
    });

    consumer
        .run(|message: Message| async move {
            println!("{}", message.to_json()?);
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    Ok(())
}

async fn produce(config: Arc<QueueConfig>, texts: &[String]) -> Result<()> {
    if texts.is_empty() {
        bail!(USAGE);
    }

    let producer = Arc::new(QueueProducer::new(config, Arc::new(LapinBroker::new())));
    let runner = {
        let producer = producer.clone();
        tokio::spawn(async move { producer.run().await })
    };

    for text in texts {
        let message = Message::create(
            Uuid::new_v4().to_string(),
            "rabbit_queue",
            "text",
            "text/plain",
            text.as_bytes().to_vec(),
        );
        if let Err(send_error) = producer.send(message).await {
            warn!(%send_error, "producer stopped before all messages were sent");
            break;
        }
    }

    producer.stop();
    runner.await.context("producer task panicked")??;
    Ok(())
}
