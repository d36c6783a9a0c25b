//! Single relay connection management.
//!
//! A [`RelayConnection`] is a cheap handle around shared state. Each live
//! transport handle gets a reader task that dispatches inbound frames in
//! delivery order and, once the handle dies, runs the reconnect loop. Outbound
//! frames go through one ordered outbox task that waits for the connection to
//! be open. Background tasks hold weak references, so dropping the last handle
//! stops them.

use crate::backoff::{ExponentialBackoff, ReconnectPolicy};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filters, RelayMessage};
use crate::transport::{OutboundFrame, Transport, TransportSignal, WebSocketTransport};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nostr::Event;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Closed by the caller. Terminal.
    Closed,
}

/// Notification categories a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Open,
    Close,
    Error,
    Message,
    Event,
    Eose,
    Notice,
    Ok,
}

/// What a handler is called with, alongside the originating connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotification {
    Open,
    Close,
    Error(String),
    /// Raw text frame, fired after protocol dispatch.
    Message(String),
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose {
        subscription_id: String,
    },
    Notice(Vec<Value>),
    Ok(Vec<Value>),
}

impl RelayNotification {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Open => HandlerKind::Open,
            Self::Close => HandlerKind::Close,
            Self::Error(_) => HandlerKind::Error,
            Self::Message(_) => HandlerKind::Message,
            Self::Event { .. } => HandlerKind::Event,
            Self::Eose { .. } => HandlerKind::Eose,
            Self::Notice(_) => HandlerKind::Notice,
            Self::Ok(_) => HandlerKind::Ok,
        }
    }

    fn from_message(message: RelayMessage) -> Option<Self> {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => Some(Self::Event {
                subscription_id,
                event,
            }),
            RelayMessage::Eose { subscription_id } => Some(Self::Eose { subscription_id }),
            RelayMessage::Notice(rest) => Some(Self::Notice(rest)),
            RelayMessage::Ok(rest) => Some(Self::Ok(rest)),
            RelayMessage::Ignored | RelayMessage::Invalid(_) => None,
        }
    }
}

/// Callback invoked with the connection a notification came from.
pub type RelayHandler = Arc<dyn Fn(&RelayConnection, &RelayNotification) + Send + Sync>;

/// One handler per kind.
pub type HandlerTable = HashMap<HandlerKind, RelayHandler>;

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bound on a single transport open.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct OutboxItem {
    text: String,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct RelayInner {
    url: Url,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    handlers: RwLock<HandlerTable>,
    manual_close: AtomicBool,
    /// Shared across reconnect episodes; reset once a connection delivers a
    /// frame.
    backoff: Mutex<ExponentialBackoff>,
    writer: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    outbox_tx: mpsc::UnboundedSender<OutboxItem>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboxItem>>>,
}

/// Relay connection.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Self::with_transport(url, config, Arc::new(WebSocketTransport))
    }

    /// Create a relay connection over a caller-supplied transport.
    pub fn with_transport(
        url: &str,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let url = parse_relay_url(url)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let backoff = config.reconnect.backoff();

        Ok(Self {
            inner: Arc::new(RelayInner {
                url,
                config,
                transport,
                state,
                handlers: RwLock::new(HashMap::new()),
                manual_close: AtomicBool::new(false),
                backoff: Mutex::new(backoff),
                writer: Mutex::new(None),
                outbox_tx,
                outbox_rx: Mutex::new(Some(outbox_rx)),
            }),
        })
    }

    fn upgrade(inner: &Weak<RelayInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.inner.url.as_str()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_manually_closed(&self) -> bool {
        self.inner.manual_close.load(Ordering::SeqCst)
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    pub async fn on<F>(&self, kind: HandlerKind, handler: F)
    where
        F: Fn(&RelayConnection, &RelayNotification) + Send + Sync + 'static,
    {
        self.set_handler(kind, Arc::new(handler)).await;
    }

    pub async fn set_handler(&self, kind: HandlerKind, handler: RelayHandler) {
        self.inner.handlers.write().await.insert(kind, handler);
    }

    /// Replace the whole handler table.
    pub async fn set_handlers(&self, handlers: HandlerTable) {
        *self.inner.handlers.write().await = handlers;
    }

    async fn dispatch(&self, notification: &RelayNotification) {
        let handler = self
            .inner
            .handlers
            .read()
            .await
            .get(&notification.kind())
            .cloned();
        if let Some(handler) = handler {
            handler(self, notification);
        }
    }

    /// Open the transport. Resolves once the connection is open.
    pub async fn connect(&self) -> Result<()> {
        if self.is_manually_closed() {
            return Err(ClientError::Closed);
        }

        let mut started = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                started = true;
            }
            started
        });
        if !started {
            return Err(match self.state() {
                ConnectionState::Closed => ClientError::Closed,
                _ => ClientError::AlreadyConnected,
            });
        }

        self.ensure_outbox().await;
        match self.open_transport().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                if !matches!(error, ClientError::Closed) {
                    warn!("failed to connect to {}: {}", self.url(), error);
                    self.dispatch(&RelayNotification::Error(error.to_string()))
                        .await;
                }
                Err(error)
            }
        }
    }

    /// Connect from a background task, retrying per the reconnect policy if
    /// the first attempt fails.
    pub fn connect_in_background(&self) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            match connection.connect().await {
                Ok(()) | Err(ClientError::AlreadyConnected | ClientError::Closed) => {}
                Err(_) if connection.inner.config.reconnect.enabled => {
                    connection.inner.state.send_if_modified(|state| {
                        if *state == ConnectionState::Disconnected {
                            *state = ConnectionState::Reconnecting;
                            true
                        } else {
                            false
                        }
                    });
                    if connection.state() == ConnectionState::Reconnecting {
                        let inner = Arc::downgrade(&connection.inner);
                        drop(connection);
                        reconnect_loop(inner).await;
                    }
                }
                Err(_) => {}
            }
        })
    }

    async fn open_transport(&self) -> Result<()> {
        let handle = timeout(
            self.inner.config.connect_timeout,
            self.inner.transport.open(&self.inner.url),
        )
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connection timeout after {:?}",
                self.inner.config.connect_timeout
            ))
        })??;

        let outbound = handle.outbound.clone();
        {
            let mut writer = self.inner.writer.lock().await;
            if self.is_manually_closed() {
                let _ = handle.outbound.send(OutboundFrame::Close);
                return Err(ClientError::Closed);
            }
            let opened = self.inner.state.send_if_modified(|state| {
                if *state == ConnectionState::Closed {
                    false
                } else {
                    *state = ConnectionState::Open;
                    true
                }
            });
            if !opened {
                let _ = handle.outbound.send(OutboundFrame::Close);
                return Err(ClientError::Closed);
            }
            if let Some(previous) = writer.replace(handle.outbound) {
                let _ = previous.send(OutboundFrame::Close);
            }
            // Under the writer lock so a concurrent close() reports after open.
            info!("connected to {}", self.url());
            self.dispatch(&RelayNotification::Open).await;
        }

        tokio::spawn(run_reader(
            Arc::downgrade(&self.inner),
            handle.inbound,
            outbound,
        ));
        Ok(())
    }

    async fn handle_frame(&self, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(RelayMessage::Invalid(reason)) => {
                warn!("dropping frame from {}: {}", self.url(), reason);
            }
            Ok(message) => match RelayNotification::from_message(message) {
                Some(notification) => self.dispatch(&notification).await,
                None => debug!("ignoring frame from {}: {}", self.url(), text),
            },
            Err(error) => warn!("dropping frame from {}: {}", self.url(), error),
        }
        self.dispatch(&RelayNotification::Message(text.to_string()))
            .await;
    }

    /// Handle the end of the transport whose writer is `outbound`. Returns
    /// whether the reconnect loop should run.
    async fn handle_transport_end(
        &self,
        outbound: &mpsc::UnboundedSender<OutboundFrame>,
        error: Option<String>,
    ) -> bool {
        {
            let mut writer = self.inner.writer.lock().await;
            if !writer
                .as_ref()
                .is_some_and(|current| current.same_channel(outbound))
            {
                return false;
            }
            *writer = None;
        }

        let next = if self.is_manually_closed() {
            ConnectionState::Closed
        } else if self.inner.config.reconnect.enabled {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = next;
                true
            }
        });

        match error {
            Some(error) => {
                warn!("transport error on {}: {}", self.url(), error);
                self.dispatch(&RelayNotification::Error(error)).await;
            }
            None => {
                info!("disconnected from {}", self.url());
                self.dispatch(&RelayNotification::Close).await;
            }
        }
        self.state() == ConnectionState::Reconnecting
    }

    async fn ensure_outbox(&self) {
        let Some(queue) = self.inner.outbox_rx.lock().await.take() else {
            return;
        };
        tokio::spawn(run_outbox(
            Arc::downgrade(&self.inner),
            self.inner.state.subscribe(),
            queue,
        ));
    }

    async fn push_outbox(
        &self,
        text: String,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        self.ensure_outbox().await;
        self.inner
            .outbox_tx
            .send(OutboxItem { text, ack })
            .map_err(|_| ClientError::NotConnected)
    }

    /// Serialize `payload` and transmit it once the connection is open.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push_outbox(text, Some(ack_tx)).await?;
        ack_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Queue `payload` without waiting for delivery.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.push_outbox(text, None).await
    }

    /// Send `["REQ", subscription_id, filter...]`.
    pub async fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filters: impl Into<Filters>,
    ) -> Result<()> {
        self.send(&ClientMessage::req(subscription_id, filters).to_value())
            .await
    }

    /// Send `["CLOSE", subscription_id]`.
    pub async fn unsubscribe(&self, subscription_id: impl Into<String>) -> Result<()> {
        self.send(&ClientMessage::close(subscription_id).to_value())
            .await
    }

    /// Send `["EVENT", event]`.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.send(&ClientMessage::Event(event.clone()).to_value())
            .await
    }

    /// Close the connection for good. Pending and later sends fail with
    /// [`ClientError::Closed`] and no reconnect is attempted.
    pub async fn close(&self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Closed);

        let writer = self.inner.writer.lock().await.take();
        if let Some(writer) = writer {
            let _ = writer.send(OutboundFrame::Close);
            info!("closed connection to {}", self.url());
            self.dispatch(&RelayNotification::Close).await;
        }
    }
}

pub(crate) fn parse_relay_url(url: &str) -> Result<Url> {
    let parsed_url = Url::parse(url)?;
    if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed_url.scheme()
        )));
    }
    Ok(parsed_url)
}

async fn run_reader(
    inner: Weak<RelayInner>,
    mut inbound: mpsc::UnboundedReceiver<TransportSignal>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
) {
    let mut settled = false;
    let error = loop {
        match inbound.recv().await {
            Some(TransportSignal::Message(text)) => {
                let Some(connection) = RelayConnection::upgrade(&inner) else {
                    return;
                };
                if !settled {
                    connection.inner.backoff.lock().await.reset();
                    settled = true;
                }
                connection.handle_frame(&text).await;
            }
            Some(TransportSignal::Error(error)) => break Some(error),
            Some(TransportSignal::Closed) | None => break None,
        }
    };

    let Some(connection) = RelayConnection::upgrade(&inner) else {
        return;
    };
    if connection.handle_transport_end(&outbound, error).await {
        drop(connection);
        reconnect_loop(inner).await;
    }
}

/// Boxed to break the `open_transport` -> reader -> reconnect future cycle.
fn reconnect_loop(inner: Weak<RelayInner>) -> BoxFuture<'static, ()> {
    async move {
        let Some(connection) = RelayConnection::upgrade(&inner) else {
            return;
        };
        let mut state = connection.state_changes();
        drop(connection);

        loop {
            let Some(connection) = RelayConnection::upgrade(&inner) else {
                return;
            };
            let (next, attempts) = {
                let mut backoff = connection.inner.backoff.lock().await;
                let next = backoff.next_delay();
                if next.is_none() {
                    backoff.reset();
                }
                (next, backoff.attempt())
            };
            let Some(delay) = next else {
                warn!(
                    "giving up on {} after {} reconnect attempts",
                    connection.url(),
                    connection.inner.config.reconnect.max_attempts
                );
                connection.inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Closed {
                        false
                    } else {
                        *state = ConnectionState::Disconnected;
                        true
                    }
                });
                connection
                    .dispatch(&RelayNotification::Error(
                        "reconnect attempts exhausted".to_string(),
                    ))
                    .await;
                return;
            };
            drop(connection);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = state.wait_for(|state| *state == ConnectionState::Closed) => return,
            }

            let Some(connection) = RelayConnection::upgrade(&inner) else {
                return;
            };
            if connection.is_manually_closed() {
                return;
            }
            match connection.open_transport().await {
                Ok(()) => {
                    info!(
                        "reconnected to {} after {} attempts",
                        connection.url(),
                        attempts
                    );
                    return;
                }
                Err(ClientError::Closed) => return,
                Err(error) => {
                    warn!("reconnect to {} failed: {}", connection.url(), error);
                    connection
                        .dispatch(&RelayNotification::Error(error.to_string()))
                        .await;
                }
            }
        }
    }
    .boxed()
}

async fn run_outbox(
    inner: Weak<RelayInner>,
    mut state: watch::Receiver<ConnectionState>,
    mut queue: mpsc::UnboundedReceiver<OutboxItem>,
) {
    while let Some(item) = queue.recv().await {
        let result = deliver(&inner, &mut state, &item.text).await;
        match &result {
            Ok(()) => debug!("sent frame: {}", item.text),
            Err(error) => debug!("frame not sent ({}): {}", error, item.text),
        }
        if let Some(ack) = item.ack {
            let _ = ack.send(result);
        }
    }
}

async fn deliver(
    inner: &Weak<RelayInner>,
    state: &mut watch::Receiver<ConnectionState>,
    text: &str,
) -> Result<()> {
    loop {
        let current = state
            .wait_for(|state| matches!(state, ConnectionState::Open | ConnectionState::Closed))
            .await
            .map(|state| *state);
        match current {
            Ok(ConnectionState::Open) => {}
            _ => return Err(ClientError::Closed),
        }

        let Some(relay) = inner.upgrade() else {
            return Err(ClientError::Closed);
        };
        let writer = relay.writer.lock().await.clone();
        drop(relay);

        if let Some(writer) = writer
            && writer.send(OutboundFrame::Text(text.to_owned())).is_ok()
        {
            return Ok(());
        }
        // Writer died before the reader noticed; wait for the state to move.
        if state.changed().await.is_err() {
            return Err(ClientError::Closed);
        }
    }
}
