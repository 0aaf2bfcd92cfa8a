// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the single shared connection to the broker and the channels
//! multiplexed over it. `LapinDialer` establishes the connection, `ChannelProvider`
//! hands every consumer and producer a private channel of its own, so a slow
//! consumer or a flow-control block on one resource cannot stall another.

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream, Dialer},
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::{Delivery, MessageTypeConfig},
    queue::{ConsumerConfig, QueueConfig},
    topology::ServerConfig,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials the broker with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinDialer;

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, server: &ServerConfig) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = server.host, port = server.port, "creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &server.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(&server.uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::DialFailed(err.to_string()))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(lapin::Error::InvalidConnectionState(_)) => Err(AmqpError::ConnectionUnavailable),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelFailed(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(close_error)
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, def: &ConsumerConfig) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete_when_unused,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = def.name, "error to declare the queue");
                Err(AmqpError::DeclarationFailed(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_exchange(&self, def: &ExchangeConfig) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclarationFailed(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, opts: &QueueConfig) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                &opts.queue,
                &opts.consumer,
                BasicConsumeOptions {
                    no_local: opts.no_local,
                    no_ack: opts.auto_ack,
                    exclusive: opts.exclusive,
                    nowait: opts.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = opts.queue, "error to create the consumer");
                Err(AmqpError::ConsumeFailed(opts.queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumeFailed(err.to_string()))
            })
            .boxed())
    }

    async fn publish(
        &self,
        params: &MessageTypeConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                &params.exchange,
                &params.routing_key,
                BasicPublishOptions {
                    mandatory: params.mandatory,
                    immediate: params.immediate,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishFailed(err.to_string())
            })?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange = params.exchange, "message was nacked by the broker");
                Err(AmqpError::PublishFailed("nacked by the broker".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error confirming message");
                Err(AmqpError::PublishFailed(err.to_string()))
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckFailed(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!(id = self.channel.id(), "closing channel");
        self.channel
            .close(REPLY_SUCCESS, "killed")
            .await
            .map_err(close_error)
    }
}

fn close_error(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            AmqpError::AlreadyClosed
        }
        err => AmqpError::CloseFailed(err.to_string()),
    }
}

/// Opens one private channel per resource from the shared connection.
#[derive(Default)]
pub struct ChannelProvider {
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
}

impl ChannelProvider {
    pub fn new() -> ChannelProvider {
        ChannelProvider::default()
    }

    pub(crate) async fn attach(&self, connection: Arc<dyn BrokerConnection>) {
        *self.connection.write().await = Some(connection);
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Fails with `ConnectionUnavailable` before the connection is attached or after it is closed.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(AmqpError::ConnectionUnavailable)?;

        connection.open_channel().await
    }

    /// Closes the shared connection. The provider stays attached if closing fails.
    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        let mut guard = self.connection.write().await;
        let Some(connection) = guard.as_ref() else {
            return Err(AmqpError::ConnectionUnavailable);
        };

        match connection.close().await {
            Ok(()) | Err(AmqpError::AlreadyClosed) => {
                *guard = None;
                debug!("amqp connection closed");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(err)
            }
        }
    }
}
