// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker for tests.
//!
//! Publishes are routed to the queue named by the routing key, whatever the
//! exchange, the way the broker's default exchange routes. Closing a channel ends
//! the delivery streams of the consumers opened on it.

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream, Dialer},
    errors::AmqpError,
    exchange::ExchangeConfig,
    message::{Delivery, MessageTypeConfig},
    queue::{ConsumerConfig, QueueConfig},
    topology::ServerConfig,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{self, UnboundedSender};

type Subscriber = (u64, UnboundedSender<Result<Delivery, AmqpError>>);

#[derive(Default)]
struct MemoryQueue {
    pending: VecDeque<Delivery>,
    subscriber: Option<Subscriber>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    queue_declarations: usize,
    exchange_declarations: usize,
    next_channel: u64,
    next_tag: u64,
    dials: usize,
    refuse_dial: bool,
    connection_closed: bool,
    fail_channel_close: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn refuse_dial(&self) {
        self.state().refuse_dial = true;
    }

    pub(crate) fn fail_channel_close(&self, fail: bool) {
        self.state().fail_channel_close = fail;
    }

    pub(crate) fn dials(&self) -> usize {
        self.state().dials
    }

    pub(crate) fn queue_declarations(&self) -> usize {
        self.state().queue_declarations
    }

    pub(crate) fn exchange_declarations(&self) -> usize {
        self.state().exchange_declarations
    }

    pub(crate) fn connection_closed(&self) -> bool {
        self.state().connection_closed
    }
}

#[async_trait]
impl Dialer for MemoryBroker {
    async fn dial(&self, server: &ServerConfig) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        if state.refuse_dial {
            return Err(AmqpError::DialFailed(server.uri()));
        }
        state.dials += 1;

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.connection_closed {
            return Err(AmqpError::ConnectionUnavailable);
        }
        state.next_channel += 1;

        Ok(Arc::new(MemoryChannel {
            id: state.next_channel,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.connection_closed {
            return Err(AmqpError::AlreadyClosed);
        }
        state.connection_closed = true;
        for queue in state.queues.values_mut() {
            queue.subscriber = None;
        }
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, def: &ConsumerConfig) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::DeclarationFailed(def.name.clone()));
        }
        let mut state = self.state.lock().unwrap();
        state.queue_declarations += 1;
        state.queues.entry(def.name.clone()).or_default();
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeConfig) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::DeclarationFailed(def.name.clone()));
        }
        self.state.lock().unwrap().exchange_declarations += 1;
        Ok(())
    }

    async fn consume(&self, opts: &QueueConfig) -> Result<DeliveryStream, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ConsumeFailed(opts.queue.clone()));
        }
        let mut state = self.state.lock().unwrap();
        let queue = state
            .queues
            .get_mut(&opts.queue)
            .ok_or_else(|| AmqpError::ConsumeFailed(opts.queue.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in queue.pending.drain(..) {
            let _ = tx.send(Ok(delivery));
        }
        queue.subscriber = Some((self.id, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn publish(
        &self,
        params: &MessageTypeConfig,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishFailed("channel closed".to_owned()));
        }
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: state.next_tag,
            exchange: params.exchange.clone(),
            routing_key: params.routing_key.clone(),
            redelivered: false,
            properties,
            data: payload.to_vec(),
        };

        let Some(queue) = state.queues.get_mut(&params.routing_key) else {
            return Ok(());
        };

        let delivery = match &queue.subscriber {
            Some((_, tx)) => match tx.send(Ok(delivery)) {
                Ok(()) => return Ok(()),
                Err(returned) => match returned.0 {
                    Ok(delivery) => delivery,
                    Err(_) => return Ok(()),
                },
            },
            None => delivery,
        };
        queue.subscriber = None;
        queue.pending.push_back(delivery);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::AckFailed(delivery_tag.to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_channel_close {
            return Err(AmqpError::CloseFailed(format!("channel {}", self.id)));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyClosed);
        }

        for queue in state.queues.values_mut() {
            if matches!(queue.subscriber, Some((id, _)) if id == self.id) {
                queue.subscriber = None;
            }
        }
        Ok(())
    }
}
