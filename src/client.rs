// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Client
//!
//! The facade application code talks to. It owns the shared connection (through
//! the `ChannelProvider`) and one registry each for consumers and producers, and
//! turns topology descriptors into cached, reusable resources.
//!
//! Lifecycle: `Uninitialized -> Connected -> ShuttingDown -> Closed`. Resource
//! creation holds the state read lock and `shutdown` holds the write lock for the
//! whole teardown, so no resource can be created while the client is torn down.

use crate::{
    broker::Dialer,
    channel::{ChannelProvider, LapinDialer},
    consumer::Consumer,
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::{MessageTypeConfig, ProducerKey},
    producer::Producer,
    queue::{ConsumerConfig, QueueConfig},
    registry::Registry,
    topology::Topology,
};
use std::{fmt, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Connected,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Connected => "connected",
            ClientState::ShuttingDown => "shutting down",
            ClientState::Closed => "closed",
        };
        f.write_str(state)
    }
}

pub struct Client {
    topology: Topology,
    dialer: Arc<dyn Dialer>,
    state: RwLock<ClientState>,
    channels: ChannelProvider,
    consumers: Registry<String, Consumer>,
    producers: Registry<ProducerKey, Producer>,
}

impl Client {
    pub fn new(topology: Topology, dialer: Arc<dyn Dialer>) -> Client {
        Client {
            topology,
            dialer,
            state: RwLock::new(ClientState::Uninitialized),
            channels: ChannelProvider::new(),
            consumers: Registry::new("consumer"),
            producers: Registry::new("producer"),
        }
    }

    /// Client dialing the broker with lapin.
    pub fn with_lapin(topology: Topology) -> Client {
        Client::new(topology, Arc::new(LapinDialer))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Dials the broker. Only valid while uninitialized; on failure the client stays uninitialized.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut state = self.state.write().await;
        if *state != ClientState::Uninitialized {
            return Err(AmqpError::InvalidState(state.to_string()));
        }

        let server = self
            .topology
            .server_config
            .as_ref()
            .ok_or(AmqpError::MissingConfig)?;

        let connection = self.dialer.dial(server).await?;
        self.channels.attach(connection).await;
        *state = ClientState::Connected;

        info!(host = server.host, port = server.port, "amqp client started");
        Ok(())
    }

    /// Returns the consumer of `queue_def.name`, declaring the queue on a new channel the first time.
    ///
    /// Concurrent callers for the same queue share one declaration and one consumer.
    ///
    /// # Parameters
    /// * `queue_def` - How the queue is declared
    /// * `consume_opts` - How deliveries are consumed; an empty queue name defaults to the declared queue
    ///
    /// # Returns
    /// The cached consumer, or `InvalidConfig`, `ConnectionUnavailable` or the declaration error
    pub async fn new_consumer(
        &self,
        queue_def: &ConsumerConfig,
        consume_opts: &QueueConfig,
    ) -> Result<Arc<Consumer>, AmqpError> {
        if queue_def.name.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "can not create a consumer, queue name is empty".to_owned(),
            ));
        }

        let mut consume_opts = consume_opts.clone();
        if consume_opts.queue.is_empty() {
            consume_opts.queue = queue_def.name.clone();
        }
        if consume_opts.queue != queue_def.name {
            return Err(AmqpError::InvalidConfig(format!(
                "consume options for `{}` can not be used with queue `{}`",
                consume_opts.queue, queue_def.name
            )));
        }

        let state = self.state.read().await;
        if *state != ClientState::Connected {
            return Err(AmqpError::ConnectionUnavailable);
        }

        self.consumers
            .get_or_create(queue_def.name.clone(), || async {
                let channel = self.channels.open_channel().await?;
                Consumer::declare(channel, queue_def.clone(), consume_opts).await
            })
            .await
    }

    /// Returns the producer of `message_def`'s exchange and routing key, declaring the
    /// exchange on a new channel the first time.
    ///
    /// # Parameters
    /// * `exchange_def` - How the exchange is declared
    /// * `message_def` - Addressing of the messages; the routing key must not be empty
    ///
    /// # Returns
    /// The cached producer, or `InvalidConfig`, `ConnectionUnavailable` or the declaration error
    pub async fn new_producer(
        &self,
        exchange_def: &ExchangeConfig,
        message_def: &MessageTypeConfig,
    ) -> Result<Arc<Producer>, AmqpError> {
        if message_def.routing_key.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "can not create a producer, routing key is empty".to_owned(),
            ));
        }
        if exchange_def.name.is_empty() || message_def.exchange != exchange_def.name {
            return Err(AmqpError::InvalidConfig(format!(
                "message type for exchange `{}` can not be used with exchange `{}`",
                message_def.exchange, exchange_def.name
            )));
        }

        let state = self.state.read().await;
        if *state != ClientState::Connected {
            return Err(AmqpError::ConnectionUnavailable);
        }

        self.producers
            .get_or_create(message_def.key(), || async {
                let channel = self.channels.open_channel().await?;
                Producer::declare(channel, exchange_def.clone(), message_def.clone()).await
            })
            .await
    }

    /// Consumer of `queue_name` built from the loaded topology.
    ///
    /// Without consume options for the queue, deliveries are auto-acked.
    pub async fn new_consumer_for(&self, queue_name: &str) -> Result<Arc<Consumer>, AmqpError> {
        let queue_def = self.topology.consumer_config(queue_name).ok_or_else(|| {
            AmqpError::InvalidConfig(format!("no consumer configured for queue `{}`", queue_name))
        })?;

        let consume_opts = self
            .topology
            .queue_config(queue_name)
            .cloned()
            .unwrap_or_else(|| QueueConfig::new(queue_name).auto_ack());

        self.new_consumer(queue_def, &consume_opts).await
    }

    /// Producer of `exchange` and `routing_key` built from the loaded topology.
    pub async fn new_producer_for(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Arc<Producer>, AmqpError> {
        let exchange_def = self.topology.exchange_config(exchange).ok_or_else(|| {
            AmqpError::InvalidConfig(format!("no exchange configured named `{}`", exchange))
        })?;

        let message_def = self
            .topology
            .message_type_config(exchange, routing_key)
            .ok_or_else(|| {
                AmqpError::InvalidConfig(format!(
                    "no message type configured for `{}`",
                    ProducerKey::new(exchange, routing_key)
                ))
            })?;

        self.new_producer(exchange_def, message_def).await
    }

    /// Looks up a consumer created earlier, failing with `NotFound` otherwise.
    pub async fn consumer(&self, queue_name: &str) -> Result<Arc<Consumer>, AmqpError> {
        self.consumers.get(queue_name).await
    }

    /// Looks up the producer of an exchange and routing key created earlier.
    ///
    /// # Parameters
    /// * `exchange` - Exchange name
    /// * `routing_key` - Routing key
    ///
    /// # Returns
    /// The shared producer, or `NotFound` carrying `<exchange>.<routing_key>`
    pub async fn producer(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Arc<Producer>, AmqpError> {
        self.producers
            .get(&ProducerKey::new(exchange, routing_key))
            .await
    }

    /// Kills every consumer, then every producer, then closes the connection.
    ///
    /// The first failure aborts the sequence and leaves the connection open and
    /// the client connected. Resources already killed do not count as failures,
    /// and shutting down a closed client succeeds.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let mut state = self.state.write().await;
        match *state {
            ClientState::Closed => return Ok(()),
            ClientState::Uninitialized => return Err(AmqpError::ConnectionUnavailable),
            ClientState::Connected | ClientState::ShuttingDown => {}
        }

        debug!("shutting down amqp client...");
        *state = ClientState::ShuttingDown;

        if let Err(err) = self.teardown().await {
            error!(error = err.to_string(), "error during shutdown");
            *state = ClientState::Connected;
            return Err(err);
        }

        *state = ClientState::Closed;
        info!("amqp client closed");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), AmqpError> {
        self.consumers.remove_all().await?;
        self.producers.remove_all().await?;
        self.channels.close().await
    }

    /// Spawns a task that shuts the client down on the first interrupt signal.
    ///
    /// Further interrupts are swallowed once the watcher has fired.
    pub fn shutdown_on_interrupt(self: &Arc<Self>) -> JoinHandle<()> {
        let client = self.clone();

        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "failure to listen for interrupt");
                return;
            }

            info!("interrupt received");
            if let Err(err) = client.shutdown().await {
                error!(error = err.to_string(), "failure to shut down on interrupt");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryBroker, message::Delivery, registry::Resource, topology::ServerConfig,
    };
    use std::time::Duration;
    use tokio::{sync::mpsc, time::timeout};
    use tokio_util::sync::CancellationToken;

    fn orders_topology() -> Topology {
        Topology::new(ServerConfig::default())
            .consumer(ConsumerConfig::new("orders").durable())
            .queue(QueueConfig::new("orders").auto_ack())
            .exchange(ExchangeConfig::new("sales").direct().durable())
            .message_type(MessageTypeConfig::new("sales", "orders"))
    }

    async fn started(topology: Topology) -> (Client, MemoryBroker) {
        let broker = MemoryBroker::default();
        let client = Client::new(topology, Arc::new(broker.clone()));
        client.start().await.unwrap();
        (client, broker)
    }

    fn collecting_handler() -> (
        Arc<dyn crate::message::MessageHandler>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn crate::message::MessageHandler> =
            Arc::new(move |delivery: Delivery| {
                let _ = tx.send(delivery.data);
            });
        (handler, rx)
    }

    async fn receive(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, count: usize) -> Vec<Vec<u8>> {
        let mut received = vec![];
        for _ in 0..count {
            received.push(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap());
        }
        received
    }

    #[tokio::test]
    async fn start_without_server_config_fails() {
        let broker = MemoryBroker::default();
        let client = Client::new(Topology::default(), Arc::new(broker.clone()));

        assert_eq!(client.start().await, Err(AmqpError::MissingConfig));
        assert_eq!(client.state().await, ClientState::Uninitialized);
        assert_eq!(broker.dials(), 0);
    }

    #[tokio::test]
    async fn dial_failure_keeps_client_uninitialized() {
        let broker = MemoryBroker::default();
        broker.refuse_dial();
        let client = Client::new(orders_topology(), Arc::new(broker));

        assert!(matches!(client.start().await, Err(AmqpError::DialFailed(_))));
        assert_eq!(client.state().await, ClientState::Uninitialized);
    }

    #[tokio::test]
    async fn start_is_only_valid_once() {
        let (client, broker) = started(orders_topology()).await;

        assert_eq!(client.state().await, ClientState::Connected);
        assert!(matches!(client.start().await, Err(AmqpError::InvalidState(_))));
        assert_eq!(broker.dials(), 1);
    }

    #[tokio::test]
    async fn new_consumer_before_start_is_unavailable() {
        let client = Client::new(orders_topology(), Arc::new(MemoryBroker::default()));

        assert!(matches!(
            client.new_consumer_for("orders").await,
            Err(AmqpError::ConnectionUnavailable)
        ));
    }

    #[tokio::test]
    async fn concurrent_new_consumer_declares_once() {
        let (client, broker) = started(orders_topology()).await;
        let client = Arc::new(client);

        let (a, b) = tokio::join!(
            tokio::spawn({
                let client = client.clone();
                async move { client.new_consumer_for("orders").await }
            }),
            tokio::spawn({
                let client = client.clone();
                async move { client.new_consumer_for("orders").await }
            }),
        );

        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(broker.queue_declarations(), 1);
        assert!(Arc::ptr_eq(&a, &client.consumer("orders").await.unwrap()));
    }

    #[tokio::test]
    async fn orders_are_delivered_to_handler() {
        let (client, _broker) = started(orders_topology()).await;

        let consumer = client.new_consumer_for("orders").await.unwrap();
        assert_eq!(consumer.consume().await, Err(AmqpError::MissingHandler));

        let (handler, mut rx) = collecting_handler();
        consumer.set_handler(handler);
        consumer.consume().await.unwrap();

        let producer = client.new_producer_for("sales", "orders").await.unwrap();
        let cancel = CancellationToken::new();
        producer.produce(&cancel, b"a").await.unwrap();
        producer.produce(&cancel, b"b").await.unwrap();

        assert_eq!(receive(&mut rx, 2).await, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn deliveries_keep_publish_order() {
        let (client, _broker) = started(orders_topology()).await;
        let consumer = client.new_consumer_for("orders").await.unwrap();
        let producer = client.new_producer_for("sales", "orders").await.unwrap();
        let cancel = CancellationToken::new();

        producer.produce(&cancel, b"m1").await.unwrap();

        let (handler, mut rx) = collecting_handler();
        consumer.set_handler(handler);
        consumer.consume().await.unwrap();

        producer.produce(&cancel, b"m2").await.unwrap();
        producer.produce(&cancel, b"m3").await.unwrap();

        assert_eq!(
            receive(&mut rx, 3).await,
            vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]
        );
    }

    #[tokio::test]
    async fn empty_routing_key_declares_nothing() {
        let (client, broker) = started(orders_topology()).await;

        let result = client
            .new_producer(
                &ExchangeConfig::new("sales"),
                &MessageTypeConfig::new("sales", ""),
            )
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidConfig(_))));
        assert_eq!(broker.exchange_declarations(), 0);
    }

    #[tokio::test]
    async fn dotted_names_get_distinct_producers() {
        let (client, broker) = started(orders_topology()).await;

        let first = client
            .new_producer(
                &ExchangeConfig::new("a.b").topic(),
                &MessageTypeConfig::new("a.b", "c"),
            )
            .await
            .unwrap();
        let second = client
            .new_producer(
                &ExchangeConfig::new("a").topic(),
                &MessageTypeConfig::new("a", "b.c"),
            )
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(broker.exchange_declarations(), 2);
        assert_eq!(first.exchange().name, "a.b");
        assert_eq!(second.exchange().name, "a");
        assert_eq!(second.message_type().routing_key, "b.c");
        assert!(Arc::ptr_eq(&first, &client.producer("a.b", "c").await.unwrap()));
        assert!(Arc::ptr_eq(&second, &client.producer("a", "b.c").await.unwrap()));
    }

    #[tokio::test]
    async fn unknown_topology_entries_are_invalid_config() {
        let (client, _broker) = started(orders_topology()).await;

        assert!(matches!(
            client.new_consumer_for("payments").await,
            Err(AmqpError::InvalidConfig(_))
        ));
        assert!(matches!(
            client.new_producer_for("sales", "refunds").await,
            Err(AmqpError::InvalidConfig(_))
        ));
        assert!(matches!(
            client.producer("sales", "refunds").await,
            Err(AmqpError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_consume_options_default_to_auto_ack() {
        let topology = Topology::new(ServerConfig::default())
            .consumer(ConsumerConfig::new("audit"));
        let (client, _broker) = started(topology).await;

        let consumer = client.new_consumer_for("audit").await.unwrap();
        assert_eq!(consumer.name(), "audit");
    }

    #[tokio::test]
    async fn mismatched_consume_options_are_rejected() {
        let (client, broker) = started(orders_topology()).await;

        let result = client
            .new_consumer(&ConsumerConfig::new("orders"), &QueueConfig::new("payments"))
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidConfig(_))));
        assert_eq!(broker.queue_declarations(), 0);
    }

    #[tokio::test]
    async fn killed_resources_reject_further_use() {
        let (client, _broker) = started(orders_topology()).await;
        let consumer = client.new_consumer_for("orders").await.unwrap();
        let producer = client.new_producer_for("sales", "orders").await.unwrap();

        consumer.kill().await.unwrap();
        producer.kill().await.unwrap();

        let (handler, _rx) = collecting_handler();
        consumer.set_handler(handler);
        assert!(consumer.consume().await.is_err());
        assert!(producer
            .produce(&CancellationToken::new(), b"late")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn shutdown_tolerates_pre_killed_resources() {
        let (client, broker) = started(orders_topology()).await;
        let consumer = client.new_consumer_for("orders").await.unwrap();
        let producer = client.new_producer_for("sales", "orders").await.unwrap();

        consumer.kill().await.unwrap();
        producer.kill().await.unwrap();

        client.shutdown().await.unwrap();
        assert_eq!(client.state().await, ClientState::Closed);
        assert!(broker.connection_closed());
        assert!(matches!(
            client.consumer("orders").await,
            Err(AmqpError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_delivery_loops() {
        let (client, _broker) = started(orders_topology()).await;
        let consumer = client.new_consumer_for("orders").await.unwrap();
        let (handler, _rx) = collecting_handler();
        consumer.set_handler(handler);
        consumer.consume().await.unwrap();

        client.shutdown().await.unwrap();

        timeout(Duration::from_secs(1), async {
            while consumer.is_consuming() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(consumer.is_killed());
    }

    #[tokio::test]
    async fn shutdown_twice_succeeds() {
        let (client, _broker) = started(orders_topology()).await;

        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(client.state().await, ClientState::Closed);
    }

    #[tokio::test]
    async fn shutdown_before_start_is_unavailable() {
        let client = Client::new(orders_topology(), Arc::new(MemoryBroker::default()));

        assert_eq!(
            client.shutdown().await,
            Err(AmqpError::ConnectionUnavailable)
        );
    }

    #[tokio::test]
    async fn failed_teardown_leaves_connection_open() {
        let (client, broker) = started(orders_topology()).await;
        client.new_consumer_for("orders").await.unwrap();
        broker.fail_channel_close(true);

        assert!(matches!(
            client.shutdown().await,
            Err(AmqpError::CloseFailed(_))
        ));
        assert_eq!(client.state().await, ClientState::Connected);
        assert!(!broker.connection_closed());
        assert!(client.consumer("orders").await.is_ok());

        broker.fail_channel_close(false);
        client.shutdown().await.unwrap();
        assert!(broker.connection_closed());
    }

    #[tokio::test]
    async fn no_resources_after_shutdown() {
        let (client, _broker) = started(orders_topology()).await;
        client.shutdown().await.unwrap();

        assert!(matches!(
            client.new_consumer_for("orders").await,
            Err(AmqpError::ConnectionUnavailable)
        ));
        assert!(matches!(
            client.new_producer_for("sales", "orders").await,
            Err(AmqpError::ConnectionUnavailable)
        ));
    }
}
