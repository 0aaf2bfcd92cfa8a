// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Producer
//!
//! A producer owns a private channel and the exchange declared on it. Publishes
//! from concurrent callers are serialized by a per-producer lock, since a channel
//! is not safe for concurrent publishers; callers wait on the lock while the
//! broker applies flow control. There is no buffering and no retry.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::MessageTypeConfig,
    otel,
    registry::Resource,
};
use async_trait::async_trait;
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Publisher bound to one exchange and one default routing key.
///
/// Created and cached by the client; shared as `Arc<Producer>` between callers.
pub struct Producer {
    channel: Arc<dyn BrokerChannel>,
    exchange_def: ExchangeConfig,
    message_def: MessageTypeConfig,
    publish_lock: Mutex<()>,
    killed: AtomicBool,
}

impl Producer {
    /// Declares the exchange on `channel` and wraps both into a producer.
    ///
    /// The channel is closed again when the broker rejects the declaration.
    ///
    /// # Parameters
    /// * `channel` - Private channel of the new producer
    /// * `exchange_def` - Exchange to declare
    /// * `message_def` - Addressing used by `produce`
    ///
    /// # Returns
    /// The producer, or the declaration error
    pub async fn declare(
        channel: Arc<dyn BrokerChannel>,
        exchange_def: ExchangeConfig,
        message_def: MessageTypeConfig,
    ) -> Result<Producer, AmqpError> {
        debug!(exchange = exchange_def.name, "declaring exchange...");

        if let Err(err) = channel.declare_exchange(&exchange_def).await {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to release channel");
            }
            return Err(err);
        }

        debug!(exchange = exchange_def.name, "exchange declared");

        Ok(Producer {
            channel,
            exchange_def,
            message_def,
            publish_lock: Mutex::new(()),
            killed: AtomicBool::new(false),
        })
    }

    /// Exchange the producer declared.
    pub fn exchange(&self) -> &ExchangeConfig {
        &self.exchange_def
    }

    pub fn message_type(&self) -> &MessageTypeConfig {
        &self.message_def
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Publishes `payload` with the addressing the producer was created with.
    ///
    /// # Parameters
    /// * `cancel` - Aborts the wait for the publish lock or the broker confirm
    /// * `payload` - Message body
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed, `Canceled`, `AlreadyClosed` after kill,
    /// or `PublishFailed`
    pub async fn produce(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish(cancel, payload, &self.message_def).await
    }

    /// Publishes `payload` with per-call addressing.
    ///
    /// Canceling `cancel` before the broker acknowledged the publish fails with
    /// `Canceled`; the message may or may not have been sent.
    ///
    /// # Parameters
    /// * `cancel` - Aborts the wait for the publish lock or the broker confirm
    /// * `payload` - Message body
    /// * `params` - Exchange, routing key, flags and content type of this message
    ///
    /// # Returns
    /// Same outcomes as `produce`
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        params: &MessageTypeConfig,
    ) -> Result<(), AmqpError> {
        if self.is_killed() {
            return Err(AmqpError::AlreadyClosed);
        }

        let properties = properties(params, &Context::current());

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!(exchange = params.exchange, routing_key = params.routing_key, "publish canceled");
                Err(AmqpError::Canceled)
            }
            result = async {
                let _guard = self.publish_lock.lock().await;
                self.channel.publish(params, payload, properties).await
            } => {
                if let Err(err) = &result {
                    error!(
                        error = err.to_string(),
                        exchange = params.exchange,
                        routing_key = params.routing_key,
                        "error during message producing"
                    );
                }
                result
            }
        }
    }
}

/// Message id, trace headers and content type of an outgoing message.
fn properties(params: &MessageTypeConfig, ctx: &Context) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(otel::inject_headers(ctx));

    if !params.content_type.is_empty() {
        properties = properties.with_content_type(ShortString::from(params.content_type.clone()));
    }

    properties
}

#[async_trait]
impl Resource for Producer {
    /// Closes the private channel once in-flight publishes have released the lock.
    async fn kill(&self) -> Result<(), AmqpError> {
        if self.is_killed() {
            return Err(AmqpError::AlreadyClosed);
        }

        debug!(exchange = self.exchange_def.name, "killing producer");

        let _guard = self.publish_lock.lock().await;
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
