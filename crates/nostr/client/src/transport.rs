//! Message-stream transport seam.
//!
//! A transport opens a bidirectional text stream to a relay URL. The returned
//! [`TransportHandle`] is owned by exactly one connection: frames go out on
//! `outbound`, and `inbound` yields text frames until a single terminal
//! [`TransportSignal::Closed`] or [`TransportSignal::Error`]. Dropping the
//! outbound sender closes the stream.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Frame written to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Signal read from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Message(String),
    Closed,
    Error(String),
}

/// Live stream returned by [`Transport::open`].
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportSignal>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve once the stream to `url` is open.
    async fn open(&self, url: &Url) -> Result<TransportHandle>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportHandle> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let relay_url = url.to_string();

        tokio::spawn(async move {
            let terminal = loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(OutboundFrame::Text(text)) => {
                            if let Err(error) = writer.send(Message::Text(text.into())).await {
                                warn!("websocket write error on {}: {}", relay_url, error);
                                break TransportSignal::Error(error.to_string());
                            }
                        }
                        Some(OutboundFrame::Close) | None => {
                            if let Err(error) = writer.send(Message::Close(None)).await {
                                debug!("websocket close frame not sent to {}: {}", relay_url, error);
                            }
                            break TransportSignal::Closed;
                        }
                    },
                    frame = reader.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx
                                .send(TransportSignal::Message(text.as_str().to_owned()))
                                .is_err()
                            {
                                break TransportSignal::Closed;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                        }
                        Some(Ok(Message::Close(_))) | None => break TransportSignal::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!("websocket read error on {}: {}", relay_url, error);
                            break TransportSignal::Error(error.to_string());
                        }
                    },
                }
            };
            let _ = inbound_tx.send(terminal);
        });

        Ok(TransportHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport for driving connections from tests.

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Relay side of one opened mock stream.
    pub(crate) struct MockRemote {
        pub url: String,
        pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        pub inbound: mpsc::UnboundedSender<TransportSignal>,
    }

    impl MockRemote {
        pub fn push(&self, frame: &str) {
            let _ = self.inbound.send(TransportSignal::Message(frame.to_string()));
        }

        pub fn drop_connection(&self) {
            let _ = self.inbound.send(TransportSignal::Closed);
        }

        /// Next text frame the client wrote.
        pub async fn next_text(&mut self) -> Option<String> {
            loop {
                match self.outbound.recv().await? {
                    OutboundFrame::Text(text) => return Some(text),
                    OutboundFrame::Close => {}
                }
            }
        }
    }

    pub(crate) struct MockTransport {
        remotes: mpsc::UnboundedSender<MockRemote>,
        attempts: AtomicUsize,
        refuse: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockRemote>) {
            let (remotes, remotes_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                remotes,
                attempts: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            });
            (transport, remotes_rx)
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, url: &Url) -> Result<TransportHandle> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ClientError::Connection(format!("{url} refused")));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let _ = self.remotes.send(MockRemote {
                url: url.to_string(),
                outbound: outbound_rx,
                inbound: inbound_tx,
            });
            Ok(TransportHandle {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
    }
}
