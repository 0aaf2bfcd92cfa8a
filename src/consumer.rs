// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A consumer owns a private channel and the queue declared on it. Once a handler
//! is attached, `consume` spawns a single task that feeds every delivery to the
//! handler in broker order. The task ends when the delivery stream closes, which
//! happens when the channel is killed; it never redeclares or reconnects.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    errors::AmqpError,
    message::MessageHandler,
    otel,
    queue::{ConsumerConfig, QueueConfig},
    registry::Resource,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::trace::{Span, Status};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::{debug, error, warn};

/// Subscriber of one queue.
///
/// Created and cached by the client; shared as `Arc<Consumer>` between callers.
pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    queue_def: ConsumerConfig,
    consume_opts: QueueConfig,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    running: Arc<AtomicBool>,
    killed: AtomicBool,
}

impl Consumer {
    /// Declares the queue on `channel` and wraps both into a consumer.
    ///
    /// The channel is closed again when the broker rejects the declaration.
    ///
    /// # Parameters
    /// * `channel` - Private channel of the new consumer
    /// * `queue_def` - Queue to declare, with its optional limits
    /// * `consume_opts` - Options the delivery loop subscribes with
    ///
    /// # Returns
    /// The consumer, or the declaration error
    pub async fn declare(
        channel: Arc<dyn BrokerChannel>,
        queue_def: ConsumerConfig,
        consume_opts: QueueConfig,
    ) -> Result<Consumer, AmqpError> {
        debug!(queue = queue_def.name, "declaring queue...");

        if let Err(err) = channel.declare_queue(&queue_def).await {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to release channel");
            }
            return Err(err);
        }

        debug!(queue = queue_def.name, "queue declared");

        Ok(Consumer {
            channel,
            queue_def,
            consume_opts,
            handler: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            killed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.queue_def.name
    }

    /// Attaches the delivery callback, replacing any previous one.
    ///
    /// A delivery loop that is already running keeps the handler it started with.
    ///
    /// # Parameters
    /// * `handler` - Callback invoked once per delivery, in broker order
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Whether a delivery loop is running.
    pub fn is_consuming(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Starts the delivery loop on its own task and returns once the broker accepted the consumer.
    ///
    /// # Returns
    /// Ok(()) once subscribed, `MissingHandler` without a handler, `AlreadyClosed`
    /// after kill, `AlreadyConsuming` while a loop runs, or the subscribe error
    pub async fn consume(&self) -> Result<(), AmqpError> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AmqpError::MissingHandler)?;

        if self.is_killed() {
            return Err(AmqpError::AlreadyClosed);
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyConsuming(self.queue_def.name.clone()));
        }

        let stream = match self.channel.consume(&self.consume_opts).await {
            Ok(stream) => stream,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        debug!(queue = self.consume_opts.queue, "consuming...");

        tokio::spawn(deliver(
            stream,
            handler,
            self.channel.clone(),
            self.consume_opts.clone(),
            self.running.clone(),
        ));

        Ok(())
    }
}

async fn deliver(
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    channel: Arc<dyn BrokerChannel>,
    opts: QueueConfig,
    running: Arc<AtomicBool>,
) {
    while let Some(result) = stream.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), queue = opts.queue, "errors consume msg");
                continue;
            }
        };

        let (_ctx, mut span) = otel::new_span(&delivery.properties, &opts.queue);
        let delivery_tag = delivery.delivery_tag;

        handler.handle(delivery).await;

        if !opts.auto_ack {
            if let Err(err) = channel.ack(delivery_tag).await {
                error!(error = err.to_string(), queue = opts.queue, "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                continue;
            }
        }

        span.set_status(Status::Ok);
    }

    running.store(false, Ordering::SeqCst);
    debug!(queue = opts.queue, "delivery stream closed");
}

#[async_trait]
impl Resource for Consumer {
    /// Closes the private channel, which the broker sees as a consumer cancellation.
    async fn kill(&self) -> Result<(), AmqpError> {
        if self.is_killed() {
            return Err(AmqpError::AlreadyClosed);
        }

        debug!(queue = self.queue_def.name, "killing consumer");

        match self.channel.close().await {
            Ok(()) => {
                self.killed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(AmqpError::AlreadyClosed) => {
                self.killed.store(true, Ordering::SeqCst);
                Err(AmqpError::AlreadyClosed)
            }
            Err(err) => Err(err),
        }
    }
}
