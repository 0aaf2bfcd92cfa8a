// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Document
//!
//! This module provides the declarative description the client is driven by: the
//! broker server to dial and the exchanges, queues, consume options and message
//! types resources are created from.
//!
//! The main components are:
//! - `ServerConfig`: credentials and address of the broker
//! - `Topology`: the whole document, loaded from JSON and looked up by key

use crate::{
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::MessageTypeConfig,
    queue::{ConsumerConfig, QueueConfig},
};
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::{debug, error};

pub const RABBITMQ_USER_ENV: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_HOST_ENV: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV: &str = "RABBITMQ_PORT";
pub const RABBITMQ_VHOST_ENV: &str = "RABBITMQ_VHOST";

/// Credentials and address of the broker. Only used at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Virtual host path segment, already percent-encoded (`%2f` for `/`).
    pub vhost: String,
    /// Name announced to the broker for the shared connection.
    pub connection_name: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            vhost: String::new(),
            connection_name: None,
        }
    }
}

impl ServerConfig {
    /// Broker address the shared connection is dialed with.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Declarative description of every broker resource the client may create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub server_config: Option<ServerConfig>,
    pub consumers: Vec<ConsumerConfig>,
    pub queues: Vec<QueueConfig>,
    pub exchanges: Vec<ExchangeConfig>,
    pub message_types: Vec<MessageTypeConfig>,
}

impl Topology {
    pub fn new(server_config: ServerConfig) -> Topology {
        Topology {
            server_config: Some(server_config),
            ..Topology::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Topology, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse topology");
            AmqpError::InvalidConfig(err.to_string())
        })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Topology, AmqpError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading topology...");

        let raw = fs::read_to_string(path).map_err(|err| {
            error!(error = err.to_string(), path = %path.display(), "failure to read topology");
            AmqpError::InvalidConfig(format!("{}: {}", path.display(), err))
        })?;

        Topology::from_json_str(&raw)
    }

    /// Overrides server settings with the `RABBITMQ_*` environment variables.
    ///
    /// A server config is created from defaults when the document has none and
    /// `RABBITMQ_HOST` is set.
    pub fn with_env_overrides(self) -> Result<Topology, AmqpError> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Topology, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.server_config.is_none() && lookup(RABBITMQ_HOST_ENV).is_some() {
            self.server_config = Some(ServerConfig::default());
        }

        let Some(server) = self.server_config.as_mut() else {
            return Ok(self);
        };

        if let Some(user) = lookup(RABBITMQ_USER_ENV) {
            server.user = user;
        }
        if let Some(password) = lookup(RABBITMQ_PASSWORD_ENV) {
            server.password = password;
        }
        if let Some(host) = lookup(RABBITMQ_HOST_ENV) {
            server.host = host;
        }
        if let Some(port) = lookup(RABBITMQ_PORT_ENV) {
            server.port = port.parse().map_err(|_| {
                AmqpError::InvalidConfig(format!("{} `{}` is not a port", RABBITMQ_PORT_ENV, port))
            })?;
        }
        if let Some(vhost) = lookup(RABBITMQ_VHOST_ENV) {
            server.vhost = vhost;
        }

        Ok(self)
    }

    /// Adds a queue declaration to the topology.
    pub fn consumer(mut self, def: ConsumerConfig) -> Self {
        self.consumers.push(def);
        self
    }

    /// Adds consume options to the topology.
    pub fn queue(mut self, def: QueueConfig) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeConfig) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a message type to the topology.
    pub fn message_type(mut self, def: MessageTypeConfig) -> Self {
        self.message_types.push(def);
        self
    }

    pub fn consumer_config(&self, queue_name: &str) -> Option<&ConsumerConfig> {
        self.consumers.iter().find(|def| def.name == queue_name)
    }

    pub fn queue_config(&self, queue_name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|def| def.queue == queue_name)
    }

    pub fn exchange_config(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|def| def.name == name)
    }

    pub fn message_type_config(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Option<&MessageTypeConfig> {
        self.message_types
            .iter()
            .find(|def| def.exchange == exchange && def.routing_key == routing_key)
    }
}
