//! Signaling client
//!
//! Owns the connection to the signaling server. A single background task
//! performs connect attempts, runs the link while connected and schedules
//! retries with bounded exponential backoff. Everything it learns is
//! published as [`SignalingEvent`]s; it never touches negotiation state.

use super::backoff::Backoff;
use super::protocol::{parse_inbound, Frame, InboundMessage, SignalPayload};
use super::transport::{Connector, Link, LinkMessage, NetworkMonitor};
use crate::config::SignalingConfig;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the signaling connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingStatus {
    pub state: ConnectionState,
    pub backoff_attempt: u32,
    /// Id assigned by the server for this connection
    pub self_id: Option<String>,
}

impl Default for SignalingStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff_attempt: 0,
            self_id: None,
        }
    }
}

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Connected,
    ConnectError(String),
    Disconnected(String),
    ViewerReady(String),
    ViewerDisconnected(String),
    Signal { viewer_id: String, payload: SignalPayload },
    /// Retry budget exhausted; no further attempts will be made
    Unavailable { attempts: u32 },
}

/// Cheap cloneable send/status handle
#[derive(Clone)]
pub struct SignalingHandle {
    status: watch::Receiver<SignalingStatus>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl SignalingHandle {
    pub fn status(&self) -> SignalingStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }

    pub fn self_id(&self) -> Option<String> {
        self.status.borrow().self_id.clone()
    }

    /// Send an event. Logged no-op when not connected.
    pub fn send(&self, event: &str, payload: Value) -> bool {
        self.send_frame(Frame::new(event, payload))
    }

    /// Send a negotiation payload to a viewer
    pub fn send_signal(&self, to: &str, payload: &SignalPayload) -> bool {
        match Frame::signal(to, self.self_id().as_deref(), payload) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!("Dropping {} for {}: {}", payload.kind(), to, e);
                false
            }
        }
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        if !self.is_connected() {
            warn!("Signaling not connected; dropping '{}' event", frame.event);
            return false;
        }
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping '{}' event: {}", frame.event, e);
                return false;
            }
        };
        let sent = match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        };
        if !sent {
            warn!("Signaling link closed; dropping '{}' event", frame.event);
        }
        sent
    }
}

struct Shared {
    url: String,
    backoff: Backoff,
    network_poll: Duration,
    connector: Arc<dyn Connector>,
    network: Arc<dyn NetworkMonitor>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    status: watch::Sender<SignalingStatus>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

struct Run {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum LinkEnd {
    Cancelled,
    Closed(String),
}

/// Connection owner with reconnect logic
pub struct SignalingClient {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<SignalingStatus>,
    run: Mutex<Option<Run>>,
}

impl SignalingClient {
    pub fn new(
        config: &SignalingConfig,
        connector: Arc<dyn Connector>,
        network: Arc<dyn NetworkMonitor>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let (status, status_rx) = watch::channel(SignalingStatus::default());
        Self {
            shared: Arc::new(Shared {
                url: config.url.clone(),
                backoff: Backoff::from_config(config),
                network_poll: config.network_poll(),
                connector,
                network,
                events,
                status,
                outbound: Arc::new(Mutex::new(None)),
            }),
            status_rx,
            run: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> SignalingHandle {
        SignalingHandle {
            status: self.status_rx.clone(),
            outbound: self.shared.outbound.clone(),
        }
    }

    pub fn status(&self) -> SignalingStatus {
        self.status_rx.borrow().clone()
    }

    /// Start connecting. No-op while a connection task is alive.
    pub fn connect(&self) {
        let mut run = self.run.lock();
        if let Some(existing) = run.as_ref() {
            if !existing.task.is_finished() {
                debug!("Signaling connect already in progress");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let task = tokio::spawn(connection_loop(shared, cancel.clone()));
        *run = Some(Run { cancel, task });
    }

    /// Stop the connection task, cancelling any pending retry timer.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.task.await {
                warn!("Signaling task ended abnormally: {}", e);
            }
            info!("Signaling client disconnected");
        }
        self.shared.outbound.lock().take();
        self.shared.set_state(ConnectionState::Disconnected, None);
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState, attempt: Option<u32>) {
        self.status.send_modify(|status| {
            if status.state != state {
                debug!("Signaling state {:?} -> {:?}", status.state, state);
            }
            status.state = state;
            if let Some(attempt) = attempt {
                status.backoff_attempt = attempt;
            }
            if state != ConnectionState::Connected {
                status.self_id = None;
            }
        });
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    /// Drive an established link until it closes or is cancelled
    async fn run_link(&self, mut link: Link, cancel: &CancellationToken) -> LinkEnd {
        match Frame::identify().to_json() {
            Ok(text) => {
                let _ = link.outbound.send(text);
            }
            Err(e) => warn!("Failed to encode identify frame: {}", e),
        }
        *self.outbound.lock() = Some(link.outbound.clone());
        self.set_state(ConnectionState::Connected, Some(0));
        info!("Connected to signaling server {}", self.url);
        self.emit(SignalingEvent::Connected);

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break LinkEnd::Cancelled,
                msg = link.inbound.recv() => match msg {
                    Some(LinkMessage::Text(text)) => self.dispatch(&text),
                    Some(LinkMessage::Closed(reason)) => break LinkEnd::Closed(reason),
                    None => break LinkEnd::Closed("link dropped".to_string()),
                },
            }
        };

        self.outbound.lock().take();
        end
    }

    fn dispatch(&self, text: &str) {
        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping signaling frame: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::AssignedId(id) => {
                debug!("Signaling server assigned id {}", id);
                self.status.send_modify(|status| status.self_id = Some(id));
            }
            InboundMessage::ViewerReady(id) => self.emit(SignalingEvent::ViewerReady(id)),
            InboundMessage::ViewerDisconnected(id) => self.emit(SignalingEvent::ViewerDisconnected(id)),
            InboundMessage::Signal { viewer_id, payload } => {
                self.emit(SignalingEvent::Signal { viewer_id, payload })
            }
            InboundMessage::ServerError { message, code } => {
                warn!("Signaling server error ({}): {}", code.as_deref().unwrap_or("-"), message);
            }
            InboundMessage::Unknown(event) => debug!("Ignoring signaling event '{}'", event),
        }
    }
}

async fn connection_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        while !shared.network.is_available() {
            debug!("No network path; deferring signaling connect");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.network_poll) => {}
            }
        }

        shared.set_state(ConnectionState::Connecting, Some(attempt));
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.connector.connect(&shared.url) => result,
        };

        match result {
            Ok(link) => {
                attempt = 0;
                match shared.run_link(link, &cancel).await {
                    LinkEnd::Cancelled => return,
                    LinkEnd::Closed(reason) => {
                        warn!("Signaling connection lost: {}", reason);
                        shared.emit(SignalingEvent::Disconnected(reason));
                    }
                }
            }
            Err(e) => {
                warn!("Signaling connect failed: {}", e);
                shared.emit(SignalingEvent::ConnectError(e.to_string()));
            }
        }

        if !shared.backoff.allows(attempt) {
            error!(
                "Signaling unavailable after {} reconnect attempts; giving up",
                attempt
            );
            shared.set_state(ConnectionState::Disconnected, Some(attempt));
            shared.emit(SignalingEvent::Unavailable { attempts: attempt });
            return;
        }

        let delay = shared.backoff.delay(attempt);
        attempt += 1;
        shared.set_state(ConnectionState::Reconnecting, Some(attempt));
        info!(
            "Reconnecting to signaling in {:?} (attempt {}/{})",
            delay,
            attempt,
            shared.backoff.max_attempts()
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
