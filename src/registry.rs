// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Registry
//!
//! A get-or-create cache from logical names to live resources. For any name at
//! most one resource is ever created: the factory runs under the write lock,
//! after a second lookup, so concurrent callers for the same name share one
//! declaration.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::{borrow::Borrow, collections::HashMap, fmt, future::Future, hash::Hash, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// A live broker resource that can be torn down.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Closes the resource. Killing a closed resource fails with `AlreadyClosed`.
    async fn kill(&self) -> Result<(), AmqpError>;
}

/// Resources of one kind keyed by `K`: queue names for consumers, exchange and
/// routing key pairs for producers.
pub struct Registry<K, R> {
    kind: &'static str,
    entries: RwLock<HashMap<K, Arc<R>>>,
}

impl<K, R> Registry<K, R>
where
    K: Eq + Hash + Clone + fmt::Display,
    R: Resource,
{
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `kind` - Label of the resources, only used in log lines
    pub fn new(kind: &'static str) -> Registry<K, R> {
        Registry {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a registered resource without creating it.
    ///
    /// # Parameters
    /// * `key` - Key the resource was registered under
    ///
    /// # Returns
    /// The shared resource, or `NotFound` carrying the displayed key
    pub async fn get<Q>(&self, key: &Q) -> Result<Arc<R>, AmqpError>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + fmt::Display + ?Sized,
    {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| AmqpError::NotFound(key.to_string()))
    }

    /// Returns the resource registered under `key`, creating it with `factory` on a miss.
    ///
    /// A failed factory leaves nothing registered.
    ///
    /// # Parameters
    /// * `key` - Key of the resource
    /// * `factory` - Builds the resource; runs at most once per key
    ///
    /// # Returns
    /// The shared resource, or the factory error
    pub async fn get_or_create<F, Fut>(&self, key: K, factory: F) -> Result<Arc<R>, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, AmqpError>>,
    {
        if let Some(resource) = self.entries.read().await.get(&key) {
            return Ok(resource.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(resource) = entries.get(&key) {
            return Ok(resource.clone());
        }

        let resource = Arc::new(factory().await?);
        debug!(kind = self.kind, key = %key, "resource registered");
        entries.insert(key, resource.clone());

        Ok(resource)
    }

    /// Kills and unregisters every resource, stopping at the first failure.
    ///
    /// Resources already closed count as killed. On failure the failing resource
    /// and every resource not reached yet stay registered.
    pub async fn remove_all(&self) -> Result<(), AmqpError> {
        let mut entries = self.entries.write().await;
        let keys: Vec<K> = entries.keys().cloned().collect();

        for key in keys {
            let Some(resource) = entries.get(&key) else {
                continue;
            };

            match resource.kill().await {
                Ok(()) => {}
                Err(err) if err.is_already_closed() => {
                    warn!(kind = self.kind, key = %key, "resource was already closed");
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        kind = self.kind,
                        key = %key,
                        "failure to kill resource"
                    );
                    return Err(err);
                }
            }

            entries.remove(&key);
        }

        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
