// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod memory;

pub mod broker;
pub mod channel;
pub mod client;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod topology;

pub use client::{Client, ClientState};
pub use errors::AmqpError;
