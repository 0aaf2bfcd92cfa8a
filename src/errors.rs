// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topology Client
//!
//! This module provides the single error type shared by every layer of the crate.
//! The `AmqpError` enum covers configuration, connection, channel, declaration,
//! consumption, publishing and teardown failures. Payloads are plain strings so
//! errors stay comparable.

use thiserror::Error;

/// Represents errors that can occur while driving broker resources.
///
/// Declaration and dial errors are never retried by this crate; they are returned
/// to the caller, who decides whether to try again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// No server configuration was supplied before `start`
    #[error("missing server config")]
    MissingConfig,

    /// A topology descriptor is missing, empty or inconsistent
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    DialFailed(String),

    /// The shared connection was never established or has been closed
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelFailed(String),

    /// The broker rejected a queue or exchange declaration
    #[error("failure to declare `{0}`")]
    DeclarationFailed(String),

    /// `consume` was called before a handler was attached
    #[error("missing handler")]
    MissingHandler,

    /// The delivery loop for the given queue is already running
    #[error("consumer `{0}` is already consuming")]
    AlreadyConsuming(String),

    /// The broker refused to start a consumer on the queue
    #[error("failure to consume `{0}`")]
    ConsumeFailed(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message `{0}`")]
    AckFailed(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishFailed(String),

    /// The publish was canceled before the broker acknowledged it
    #[error("publish canceled")]
    Canceled,

    /// The channel or connection was already closed
    #[error("already closed")]
    AlreadyClosed,

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseFailed(String),

    /// No live resource is registered under the given name
    #[error("`{0}` not found")]
    NotFound(String),

    /// The client is not in a state that allows the operation
    #[error("invalid client state: {0}")]
    InvalidState(String),
}

impl AmqpError {
    /// Whether the error only reports that the target was already closed.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, AmqpError::AlreadyClosed)
    }
}
