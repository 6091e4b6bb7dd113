//! Signaling transport
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying text frames
//! to and from the server. The production connector speaks WebSocket via
//! tokio-tungstenite; tests substitute an in-memory one.

use super::SignalingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Message delivered from the server side of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Text(String),
    /// The link ended; carries the reason
    Closed(String),
}

/// An open connection to the signaling server
pub struct Link {
    /// Frames to write to the server. Dropping every sender closes the link.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames read from the server
    pub inbound: mpsc::UnboundedReceiver<LinkMessage>,
}

/// Opens links to the signaling server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, SignalingError>;
}

/// Reports whether any network path currently exists
pub trait NetworkMonitor: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Monitor for hosts that cannot observe connectivity
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_available(&self) -> bool {
        true
    }
}

/// Connectivity flag toggled by the host integration
#[derive(Debug)]
pub struct NetworkFlag {
    online: AtomicBool,
}

impl NetworkFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl NetworkMonitor for NetworkFlag {
    fn is_available(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// WebSocket connector
pub struct WebSocketConnector {
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    /// `handshake_timeout` bounds the TCP connect plus the upgrade exchange
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, SignalingError> {
        let handshake = tokio_tungstenite::connect_async(url);
        let (ws_stream, _) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                SignalingError::Connect(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                ))
            })?
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        debug!("WebSocket handshake completed with {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkMessage>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Signaling write failed: {}", e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(LinkMessage::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbound_tx.send(LinkMessage::Closed(reason));
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
