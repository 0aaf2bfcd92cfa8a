// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Handlers
//!
//! Addressing of outgoing messages (`MessageTypeConfig`), the shape of an incoming
//! `Delivery`, and the `MessageHandler` capability application code implements to
//! receive deliveries.

use async_trait::async_trait;
use lapin::BasicProperties;
use serde::Deserialize;
use std::fmt;

/// Content type for plain text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Addressing of a message type.
///
/// The exchange name together with the routing key is the registry key for producers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageTypeConfig {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: String,
}

impl MessageTypeConfig {
    pub fn new(exchange: &str, routing_key: &str) -> MessageTypeConfig {
        MessageTypeConfig {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..MessageTypeConfig::default()
        }
    }

    /// Asks the broker to return the message when no queue is bound for the routing key.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Asks the broker to return the message when no consumer can take it right away.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Registry key shared by every producer of this exchange and routing key.
    pub fn key(&self) -> ProducerKey {
        ProducerKey::new(&self.exchange, &self.routing_key)
    }
}

/// Identity of a producer: the exchange and routing key pair.
///
/// Compared field by field, so dotted names such as (`a.b`, `c`) and (`a`, `b.c`)
/// stay distinct. The joined `<exchange>.<routing_key>` form is only used for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerKey {
    pub exchange: String,
    pub routing_key: String,
}

impl ProducerKey {
    pub fn new(exchange: &str, routing_key: &str) -> ProducerKey {
        ProducerKey {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

impl fmt::Display for ProducerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.exchange, self.routing_key)
    }
}

/// One message handed from the broker to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Receives the deliveries of one consumer.
///
/// Invoked once per delivery, in the order the broker handed them out, on the
/// consumer's own task. The next delivery is not dispatched before the call returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Delivery) + Send + Sync,
{
    async fn handle(&self, delivery: Delivery) {
        self(delivery)
    }
}
