//! Relay pool for multi-relay fanout.
//!
//! Members are unique by normalized URL and kept in insertion order. The pool
//! owns one handler table and copies it onto every member, so a handler
//! registered once fires for all relays with the originating connection.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filters};
use crate::relay::{
    HandlerKind, HandlerTable, RelayConfig, RelayConnection, RelayNotification, parse_relay_url,
};
use crate::transport::{Transport, WebSocketTransport};
use nostr::Event;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
    /// Start connecting relays as soon as they are added by URL.
    pub auto_connect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
            auto_connect: true,
        }
    }
}

/// Subset of pool members targeted by an operation.
#[derive(Debug, Clone)]
pub enum RelaySelector {
    Connection(RelayConnection),
    Urls(Vec<String>),
    Connections(Vec<RelayConnection>),
}

impl From<RelayConnection> for RelaySelector {
    fn from(connection: RelayConnection) -> Self {
        Self::Connection(connection)
    }
}

impl From<Vec<RelayConnection>> for RelaySelector {
    fn from(connections: Vec<RelayConnection>) -> Self {
        Self::Connections(connections)
    }
}

impl From<Vec<String>> for RelaySelector {
    fn from(urls: Vec<String>) -> Self {
        Self::Urls(urls)
    }
}

impl From<&[&str]> for RelaySelector {
    fn from(urls: &[&str]) -> Self {
        Self::Urls(urls.iter().map(ToString::to_string).collect())
    }
}

/// Multi-relay pool.
pub struct RelayPool {
    relays: Arc<RwLock<Vec<RelayConnection>>>,
    handlers: RwLock<HandlerTable>,
    config: PoolConfig,
    transport: Arc<dyn Transport>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// Create a pool whose relays open streams through `transport`.
    pub fn with_transport(config: PoolConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            relays: Arc::new(RwLock::new(Vec::new())),
            handlers: RwLock::new(HashMap::new()),
            config,
            transport,
        }
    }

    /// Add relay URL to pool. Returns `false` if it is already a member.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let relay_url = parse_relay_url(url)?;
        let handlers = self.handlers.read().await;
        let mut relays = self.relays.write().await;
        if relays.iter().any(|relay| relay.url() == relay_url.as_str()) {
            return Ok(false);
        }
        self.check_capacity(relays.len())?;

        let relay = RelayConnection::with_transport(
            relay_url.as_str(),
            self.config.relay_config.clone(),
            Arc::clone(&self.transport),
        )?;
        relay.set_handlers(handlers.clone()).await;
        relays.push(relay.clone());
        drop(relays);
        drop(handlers);

        info!("added relay {}", relay.url());
        if self.config.auto_connect {
            relay.connect_in_background();
        }
        Ok(true)
    }

    /// Add a caller-built connection. It is not connected by the pool.
    pub async fn add_connection(&self, relay: RelayConnection) -> Result<bool> {
        let handlers = self.handlers.read().await;
        let mut relays = self.relays.write().await;
        if relays.iter().any(|member| member.url() == relay.url()) {
            return Ok(false);
        }
        self.check_capacity(relays.len())?;

        relay.set_handlers(handlers.clone()).await;
        relays.push(relay);
        Ok(true)
    }

    fn check_capacity(&self, len: usize) -> Result<()> {
        if len >= self.config.max_relays {
            return Err(ClientError::Internal(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        Ok(())
    }

    /// Close and drop the member with `url`.
    pub async fn remove(&self, url: &str) -> bool {
        let Ok(relay_url) = parse_relay_url(url) else {
            return false;
        };
        let removed = {
            let mut relays = self.relays.write().await;
            relays
                .iter()
                .position(|relay| relay.url() == relay_url.as_str())
                .map(|index| relays.remove(index))
        };
        match removed {
            Some(relay) => {
                relay.close().await;
                info!("removed relay {}", relay.url());
                true
            }
            None => false,
        }
    }

    pub async fn has(&self, url: &str) -> bool {
        self.relay(url).await.is_some()
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<RelayConnection> {
        let relay_url = parse_relay_url(url).ok()?;
        self.relays
            .read()
            .await
            .iter()
            .find(|relay| relay.url() == relay_url.as_str())
            .cloned()
    }

    /// Members in pool order.
    pub async fn relays(&self) -> Vec<RelayConnection> {
        self.relays.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.relays.read().await.is_empty()
    }

    /// Register `handler` for `kind` on the pool and every member.
    pub async fn on<F>(&self, kind: HandlerKind, handler: F)
    where
        F: Fn(&RelayConnection, &RelayNotification) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, Arc::new(handler));
        for relay in self.relays.read().await.iter() {
            relay.set_handlers(handlers.clone()).await;
        }
    }

    /// Resolve `selector` to members, in pool order.
    pub async fn find_relays(&self, selector: &RelaySelector) -> Result<Vec<RelayConnection>> {
        let relays = self.relays.read().await;
        match selector {
            RelaySelector::Connection(connection) => Ok(relays
                .iter()
                .filter(|relay| relay.ptr_eq(connection))
                .cloned()
                .collect()),
            RelaySelector::Connections(connections) => Ok(relays
                .iter()
                .filter(|relay| connections.iter().any(|wanted| relay.ptr_eq(wanted)))
                .cloned()
                .collect()),
            RelaySelector::Urls(urls) => {
                match urls.first() {
                    None => return Ok(Vec::new()),
                    Some(first) if first.is_empty() => {
                        return Err(ClientError::InvalidRequest(
                            "relay selector starts with an empty URL".to_string(),
                        ));
                    }
                    Some(_) => {}
                }
                let wanted: Vec<String> = urls
                    .iter()
                    .filter_map(|url| parse_relay_url(url).ok())
                    .map(String::from)
                    .collect();
                Ok(relays
                    .iter()
                    .filter(|relay| wanted.iter().any(|url| url == relay.url()))
                    .cloned()
                    .collect())
            }
        }
    }

    async fn targets(&self, selector: Option<&RelaySelector>) -> Result<Vec<RelayConnection>> {
        match selector {
            Some(selector) => self.find_relays(selector).await,
            None => Ok(self.relays().await),
        }
    }

    /// Queue `payload` on every targeted relay. Returns how many relays
    /// accepted it; closed members are skipped with a warning.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        selector: Option<&RelaySelector>,
    ) -> Result<usize> {
        let frame = serde_json::to_value(payload)?;
        let mut queued = 0;
        for relay in self.targets(selector).await? {
            match relay.enqueue(&frame).await {
                Ok(()) => queued += 1,
                Err(error) => warn!("not sending to {}: {}", relay.url(), error),
            }
        }
        debug!("queued frame for {} relays", queued);
        Ok(queued)
    }

    pub async fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filters: impl Into<Filters>,
        selector: Option<&RelaySelector>,
    ) -> Result<usize> {
        let frame: Value = ClientMessage::req(subscription_id, filters).to_value();
        self.send(&frame, selector).await
    }

    pub async fn unsubscribe(
        &self,
        subscription_id: impl Into<String>,
        selector: Option<&RelaySelector>,
    ) -> Result<usize> {
        self.send(&ClientMessage::close(subscription_id).to_value(), selector)
            .await
    }

    pub async fn publish(&self, event: &Event, selector: Option<&RelaySelector>) -> Result<usize> {
        self.send(&ClientMessage::Event(event.clone()).to_value(), selector)
            .await
    }

    /// Close every member.
    pub async fn close(&self) {
        for relay in self.relays().await {
            relay.close().await;
        }
    }
}
