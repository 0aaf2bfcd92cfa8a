// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Interface
//!
//! The narrow surface the engines use to talk to the broker: dial, open a channel,
//! declare, consume, publish, acknowledge and close. `channel` implements it over
//! lapin; tests implement it in memory or with mocks.

use crate::{
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::{Delivery, MessageTypeConfig},
    queue::{ConsumerConfig, QueueConfig},
    topology::ServerConfig,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Deliveries of one consumer, ending when its channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Establishes the single shared connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, server: &ServerConfig) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A physical broker connection, multiplexed into channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Closing an already-closed connection fails with `AlreadyClosed`.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel is not safe for concurrent publishers; callers serialize publishes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, def: &ConsumerConfig) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeConfig) -> Result<(), AmqpError>;

    async fn consume(&self, opts: &QueueConfig) -> Result<DeliveryStream, AmqpError>;

    async fn publish(
        &self,
        params: &MessageTypeConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Closing an already-closed channel fails with `AlreadyClosed`.
    async fn close(&self) -> Result<(), AmqpError>;
}
