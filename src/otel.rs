// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: producers inject the
//! current context into outgoing headers, the consume loop extracts it and opens
//! one consumer span per delivery.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter exposing AMQP headers to OpenTelemetry propagators.
///
/// Implements both `Injector` and `Extractor`, so the same wrapper serves the
/// publish side and the consume side.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Wraps a header map.
    ///
    /// # Parameters
    /// * `headers` - Header map of an outgoing or incoming message
    ///
    /// # Returns
    /// A propagator reading from and writing into `headers`
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores one trace context entry as a long string header.
    ///
    /// Keys are lowercased so extraction does not depend on the casing the
    /// propagator used.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Header value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads one trace context entry.
    ///
    /// # Parameters
    /// * `key` - Header name
    ///
    /// # Returns
    /// The header as UTF-8 text, or None when absent or not a long string
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Names of every header on the message.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Headers carrying the given context, ready to be set on an outgoing message.
///
/// # Parameters
/// * `ctx` - Context of the publishing caller
///
/// # Returns
/// A header table holding whatever the global propagator injected
pub(crate) fn inject_headers(ctx: &Context) -> FieldTable {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });

    FieldTable::from(headers)
}

/// Extracts the remote context from the delivery headers and starts a consumer span under it.
///
/// # Parameters
/// * `props` - Properties of the delivery
/// * `name` - Span name, the queue the delivery came from
///
/// # Returns
/// The extracted context and the started span
pub(crate) fn new_span(props: &BasicProperties, name: &str) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let tracer = global::tracer(CONSUMER_TRACER);
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}
