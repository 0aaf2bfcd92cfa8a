// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! This module provides the two descriptors a consumer is built from:
//! `ConsumerConfig` says how the queue is declared, `QueueConfig` says how the
//! delivery stream is opened on it. Both are keyed by queue name.

use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration parameters of a queue. The queue name is the registry key for consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(rename = "queue_name")]
    pub name: String,
    pub durable: bool,
    pub delete_when_unused: bool,
    #[serde(rename = "is_exclusive")]
    pub exclusive: bool,
    pub no_wait: bool,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
}

impl ConsumerConfig {
    /// Creates a new queue declaration with standard settings (non-durable, non-exclusive).
    pub fn new(name: &str) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_owned(),
            ..ConsumerConfig::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete_when_unused = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets no_wait flag, making the declaration non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Builds the `x-*` declare arguments for the optional limits.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.message_ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];

        for (header, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(header),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// Options the delivery stream is opened with.
///
/// An empty consumer tag lets the broker generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub queue: String,
    pub consumer: String,
    pub auto_ack: bool,
    #[serde(rename = "is_exclusive")]
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

impl QueueConfig {
    /// Creates consume options for the given queue with explicit acknowledgement.
    pub fn new(queue: &str) -> QueueConfig {
        QueueConfig {
            queue: queue.to_owned(),
            ..QueueConfig::default()
        }
    }

    /// Sets the consumer tag.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer = tag.to_owned();
        self
    }

    /// Lets the broker consider deliveries acknowledged on handoff.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Requests exclusive consumer access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Asks the broker not to deliver messages published on this connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Sets no_wait flag on the consume request.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}
