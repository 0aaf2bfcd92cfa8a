// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Starts a client from a topology document, consumes every configured queue and
//! logs what arrives, until interrupted.
//!
//! The document path is the first argument or `RABBIT_TOPOLOGY`.

use async_trait::async_trait;
use rabbitmq_topology::{
    message::{Delivery, MessageHandler},
    topology::Topology,
    AmqpError, Client,
};
use std::{env, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const TOPOLOGY_ENV: &str = "RABBIT_TOPOLOGY";

struct LoggingHandler {
    queue: String,
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, delivery: Delivery) {
        info!(
            queue = self.queue,
            routing_key = delivery.routing_key,
            bytes = delivery.data.len(),
            "message received"
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "unrecoverable error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AmqpError> {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var(TOPOLOGY_ENV).ok())
        .ok_or_else(|| {
            AmqpError::InvalidConfig(format!("no topology path given, set {}", TOPOLOGY_ENV))
        })?;

    let topology = Topology::from_json_file(&path)?.with_env_overrides()?;
    let client = Arc::new(Client::with_lapin(topology));
    client.start().await?;

    let interrupt = client.shutdown_on_interrupt();

    let queues: Vec<String> = client
        .topology()
        .consumers
        .iter()
        .map(|def| def.name.clone())
        .collect();

    for queue in queues {
        let consumer = client.new_consumer_for(&queue).await?;
        consumer.set_handler(Arc::new(LoggingHandler {
            queue: queue.clone(),
        }));
        consumer.consume().await?;
    }

    if let Err(err) = interrupt.await {
        error!(error = err.to_string(), "interrupt watcher failed");
    }

    Ok(())
}
