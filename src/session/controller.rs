//! Peer session controller
//!
//! Owns the single live peer session and drives it through
//! `Idle -> Negotiating -> Active -> Closed`. All methods take `&mut self`:
//! the controller is meant to live inside one serial event loop together
//! with the viewer registry and the pending signal queue.

use super::backend::{OfferConstraints, PeerBackend, PeerBackendFactory};
use super::pending::PendingSignalQueue;
use super::registry::ViewerRegistry;
use super::sdp::force_sendonly;
use super::{NegotiationError, PeerEvent, TransportState};
use crate::capture::{CaptureManager, SourceKind};
use crate::signaling::{SignalPayload, SignalingHandle};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consecutive rebuilds allowed before a viewer is given up on
pub const MAX_REBUILDS: u32 = 3;

/// Outbound path for negotiation messages
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, to: &str, payload: &SignalPayload) -> bool;
}

impl SignalSink for SignalingHandle {
    fn send_signal(&self, to: &str, payload: &SignalPayload) -> bool {
        SignalingHandle::send_signal(self, to, payload)
    }
}

/// Negotiation state of the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Active,
    Closed,
}

struct PeerSession {
    generation: u64,
    viewer_id: String,
    backend: Box<dyn PeerBackend>,
    local_description: Option<String>,
    remote_description: Option<String>,
    awaiting_answer: bool,
    ice_candidates_sent: usize,
    attached: BTreeSet<SourceKind>,
    /// Ready sources when the last offer went out
    offered: BTreeSet<SourceKind>,
    renegotiate_pending: bool,
}

enum Disposition {
    Applied,
    Deferred,
    Dropped,
}

pub struct PeerSessionController {
    factory: Arc<dyn PeerBackendFactory>,
    signals: Arc<dyn SignalSink>,
    capture: Arc<CaptureManager>,
    gating: HashSet<SourceKind>,
    registry: ViewerRegistry,
    pending: PendingSignalQueue,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    state: SessionState,
    session: Option<PeerSession>,
    assigned_viewer: Option<String>,
    generation: u64,
    rebuilds: u32,
    offers_sent: u64,
}

impl PeerSessionController {
    pub fn new(
        factory: Arc<dyn PeerBackendFactory>,
        signals: Arc<dyn SignalSink>,
        capture: Arc<CaptureManager>,
        gating: HashSet<SourceKind>,
        pending: PendingSignalQueue,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            signals,
            capture,
            gating,
            registry: ViewerRegistry::new(),
            pending,
            peer_events,
            state: SessionState::Idle,
            session: None,
            assigned_viewer: None,
            generation: 0,
            rebuilds: 0,
            offers_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn registry(&self) -> &ViewerRegistry {
        &self.registry
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Viewer of the live session, if any
    pub fn session_viewer(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.viewer_id.as_str())
    }

    pub fn assigned_viewer(&self) -> Option<&str> {
        self.assigned_viewer.as_deref()
    }

    /// Generation of the live peer connection
    pub fn generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    pub fn offers_sent(&self) -> u64 {
        self.offers_sent
    }

    pub fn ice_candidates_sent(&self) -> usize {
        self.session.as_ref().map(|s| s.ice_candidates_sent).unwrap_or(0)
    }

    /// A viewer announced itself
    pub async fn on_viewer_ready(&mut self, viewer_id: &str) {
        self.registry.note_seen(viewer_id);
        if self.registry.is_handled(viewer_id) {
            debug!("Viewer {} already has an offer; ignoring", viewer_id);
            return;
        }

        self.assigned_viewer = Some(viewer_id.to_string());
        self.rebuilds = 0;

        if !self.capture.is_ready(&self.gating) {
            info!("Viewer {} waiting for required capture sources", viewer_id);
            return;
        }
        self.start_session(viewer_id).await;
    }

    /// A viewer went away
    pub async fn on_viewer_disconnected(&mut self, viewer_id: &str) {
        self.registry.clear(viewer_id);
        let purged = self.pending.purge_viewer(viewer_id);
        if purged > 0 {
            debug!("Purged {} pending signals from {}", purged, viewer_id);
        }
        if self.assigned_viewer.as_deref() == Some(viewer_id) {
            self.assigned_viewer = None;
        }
        if self.session_viewer() == Some(viewer_id) {
            info!("Viewer {} disconnected; closing session", viewer_id);
            self.close_session().await;
            self.state = SessionState::Closed;
        }
    }

    /// An inbound negotiation message arrived
    pub async fn on_signal(&mut self, viewer_id: &str, payload: SignalPayload) {
        let is_answer = matches!(payload, SignalPayload::Answer { .. });
        match self.apply_signal(viewer_id, &payload).await {
            Ok(Disposition::Applied) => {
                if is_answer {
                    self.replay_pending().await;
                    self.resume_renegotiation().await;
                }
            }
            Ok(Disposition::Deferred) => self.pending.enqueue(viewer_id, payload),
            Ok(Disposition::Dropped) => {}
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    /// Capture readiness changed
    pub async fn on_sources_changed(&mut self) {
        if self.capture.is_ready(&self.gating) {
            let waiting = self.registry.unhandled();
            if !waiting.is_empty() {
                for viewer_id in waiting {
                    self.rebuilds = 0;
                    self.start_session(&viewer_id).await;
                }
            } else if self.readiness_changed() {
                match self.state {
                    SessionState::Active => self.renegotiate().await,
                    SessionState::Negotiating => {
                        if let Some(session) = self.session.as_mut() {
                            debug!("Sources changed mid-negotiation; renegotiating after answer");
                            session.renegotiate_pending = true;
                        }
                    }
                    SessionState::Idle | SessionState::Closed => {}
                }
            }
        } else {
            debug!("Required capture sources not ready");
        }

        self.replay_pending().await;
    }

    /// Callback from the peer backend
    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        let current = self.generation();
        if current != Some(event.generation()) {
            debug!(
                "Dropping peer event from stale generation {} (current {:?})",
                event.generation(),
                current
            );
            return;
        }

        match event {
            PeerEvent::LocalCandidate { candidate, .. } => {
                let Some(viewer_id) = self.assigned_viewer.clone() else {
                    debug!("No viewer assigned; dropping local ICE candidate");
                    return;
                };
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.viewer_id != viewer_id {
                    debug!("Local ICE candidate for a superseded viewer; dropping");
                    return;
                }
                if self.signals.send_signal(&viewer_id, &SignalPayload::Candidate(candidate)) {
                    session.ice_candidates_sent += 1;
                }
            }
            PeerEvent::Transport { state, .. } => {
                debug!("ICE transport state: {:?}", state);
                match state {
                    TransportState::Connected | TransportState::Completed => {
                        info!("Peer transport connected");
                        self.rebuilds = 0;
                    }
                    _ if state.needs_rebuild() => {
                        warn!("Peer transport {:?}; rebuilding connection", state);
                        self.rebuild().await;
                    }
                    _ => {}
                }
            }
        }
    }

    /// The signaling link dropped. Viewer ids and parked signals belong to
    /// that link, so everything is forgotten and viewers re-announced on
    /// the next link are offered from scratch.
    pub async fn on_signaling_lost(&mut self) {
        let forgotten = self.registry.clear_all();
        let dropped = self.pending.clear();
        if self.session.is_some() {
            info!("Signaling lost; closing peer session");
            self.close_session().await;
        }
        self.assigned_viewer = None;
        self.rebuilds = 0;
        self.state = SessionState::Idle;
        debug!(
            "Forgot {} viewers and {} pending signals after signaling loss",
            forgotten, dropped
        );
    }

    /// Drop all pending signals and close the live session
    pub async fn shutdown(&mut self) -> Result<(), NegotiationError> {
        let dropped = self.pending.clear();
        if dropped > 0 {
            debug!("Dropped {} pending signals on shutdown", dropped);
        }
        self.assigned_viewer = None;
        self.state = SessionState::Closed;
        match self.session.take() {
            Some(session) => session.backend.close().await,
            None => Ok(()),
        }
    }

    async fn apply_signal(
        &mut self,
        viewer_id: &str,
        payload: &SignalPayload,
    ) -> Result<Disposition, NegotiationError> {
        match payload {
            SignalPayload::Offer { .. } => {
                warn!("Ignoring offer from {}; this endpoint only publishes", viewer_id);
                Ok(Disposition::Dropped)
            }
            SignalPayload::Answer { sdp } => {
                let Some(session) = self.session.as_mut().filter(|s| s.viewer_id == viewer_id) else {
                    return Ok(Disposition::Deferred);
                };
                if session.local_description.is_none() {
                    return Ok(Disposition::Deferred);
                }
                if !session.awaiting_answer {
                    debug!("Duplicate answer from {}; dropping", viewer_id);
                    return Ok(Disposition::Dropped);
                }
                session.backend.set_remote_answer(sdp).await?;
                session.remote_description = Some(sdp.clone());
                session.awaiting_answer = false;
                self.state = SessionState::Active;
                info!("Session with {} active", viewer_id);
                Ok(Disposition::Applied)
            }
            SignalPayload::Candidate(candidate) => {
                let Some(session) = self.session.as_mut().filter(|s| s.viewer_id == viewer_id) else {
                    return Ok(Disposition::Deferred);
                };
                if session.remote_description.is_none() {
                    return Ok(Disposition::Deferred);
                }
                match session.backend.add_remote_candidate(candidate).await {
                    Ok(()) => Ok(Disposition::Applied),
                    Err(e) => {
                        warn!("Dropping ICE candidate from {}: {}", viewer_id, e);
                        Ok(Disposition::Dropped)
                    }
                }
            }
        }
    }

    /// Re-route parked signals until a pass makes no progress
    async fn replay_pending(&mut self) {
        loop {
            let ready = self.pending.drain_ready();
            if ready.is_empty() {
                return;
            }

            let mut progressed = false;
            for signal in ready {
                match self.apply_signal(&signal.viewer_id, &signal.payload).await {
                    Ok(Disposition::Applied) => progressed = true,
                    Ok(Disposition::Deferred) => self.pending.requeue(signal),
                    Ok(Disposition::Dropped) => {}
                    Err(e) => self.negotiation_failed(e).await,
                }
            }
            if !progressed {
                return;
            }
        }
    }

    async fn resume_renegotiation(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !std::mem::take(&mut session.renegotiate_pending) {
            return;
        }
        if self.state == SessionState::Active && self.readiness_changed() {
            self.renegotiate().await;
        }
    }

    fn ready_kinds(&self) -> BTreeSet<SourceKind> {
        self.capture.ready_tracks().into_iter().map(|(kind, _)| kind).collect()
    }

    /// Whether the ready source set differs from what the live session offered
    fn readiness_changed(&self) -> bool {
        match self.session.as_ref() {
            Some(session) => session.offered != self.ready_kinds(),
            None => false,
        }
    }

    /// Offer to a viewer, rebuilding on failure within the budget
    async fn start_session(&mut self, viewer_id: &str) {
        loop {
            if !self.capture.is_ready(&self.gating) {
                debug!("Not offering to {}: required sources not ready", viewer_id);
                return;
            }

            match self.try_offer(viewer_id).await {
                Ok(()) => return,
                Err(NegotiationError::NotDelivered(_)) => {
                    warn!("Offer to {} not delivered; will retry on next trigger", viewer_id);
                    self.close_session().await;
                    self.state = SessionState::Idle;
                    return;
                }
                Err(e) => {
                    warn!("Negotiation with {} failed: {}", viewer_id, e);
                    self.close_session().await;
                    if self.rebuilds >= MAX_REBUILDS {
                        self.give_up(viewer_id);
                        return;
                    }
                    self.rebuilds += 1;
                }
            }
        }
    }

    async fn try_offer(&mut self, viewer_id: &str) -> Result<(), NegotiationError> {
        self.close_session().await;

        self.generation += 1;
        let generation = self.generation;
        let backend = self.factory.create(generation, self.peer_events.clone()).await?;
        debug!("Created peer connection generation {} for {}", generation, viewer_id);

        self.session = Some(PeerSession {
            generation,
            viewer_id: viewer_id.to_string(),
            backend,
            local_description: None,
            remote_description: None,
            awaiting_answer: false,
            ice_candidates_sent: 0,
            attached: BTreeSet::new(),
            offered: BTreeSet::new(),
            renegotiate_pending: false,
        });
        self.state = SessionState::Negotiating;
        self.assigned_viewer = Some(viewer_id.to_string());

        self.attach_ready_tracks().await?;
        self.send_offer().await?;
        self.registry.mark_handled(viewer_id);
        Ok(())
    }

    async fn attach_ready_tracks(&mut self) -> Result<(), NegotiationError> {
        let tracks = self.capture.ready_tracks();
        let session = self.session.as_mut().ok_or(NegotiationError::NoSession)?;
        for (kind, track) in tracks {
            if session.attached.contains(&kind) {
                continue;
            }
            session.backend.attach_track(kind, track).await?;
            session.attached.insert(kind);
            debug!("Attached {} track to generation {}", kind, session.generation);
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        let ready = self.ready_kinds();
        let session = self.session.as_mut().ok_or(NegotiationError::NoSession)?;
        let offer = session.backend.create_offer(OfferConstraints::send_only()).await?;
        let applied = session.backend.set_local_offer(&force_sendonly(&offer)).await?;
        session.local_description = Some(applied.clone());
        session.awaiting_answer = true;
        session.offered = ready;
        self.state = SessionState::Negotiating;

        let viewer_id = session.viewer_id.clone();
        if !self.signals.send_signal(&viewer_id, &SignalPayload::Offer { sdp: applied }) {
            return Err(NegotiationError::NotDelivered(viewer_id));
        }
        self.offers_sent += 1;
        info!("Sent offer to {}", viewer_id);
        Ok(())
    }

    /// Fresh offer on the live connection for the same viewer
    async fn renegotiate(&mut self) {
        if !self.capture.is_ready(&self.gating) {
            debug!("Required sources lost; keeping current session");
            return;
        }
        let Some(viewer_id) = self.session_viewer().map(str::to_string) else {
            return;
        };
        info!("Renegotiating with {}", viewer_id);

        let result = match self.attach_ready_tracks().await {
            Ok(()) => self.send_offer().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.renegotiate_pending = false;
                }
            }
            Err(NegotiationError::NotDelivered(_)) => {
                warn!("Renegotiation offer to {} not delivered; will retry on next trigger", viewer_id);
                self.close_session().await;
                self.registry.unmark(&viewer_id);
                self.state = SessionState::Idle;
            }
            Err(e) => self.negotiation_failed(e).await,
        }
    }

    async fn negotiation_failed(&mut self, err: NegotiationError) {
        warn!("Negotiation failure: {}", err);
        self.rebuild().await;
    }

    /// Replace the peer connection and re-offer to the same viewer
    async fn rebuild(&mut self) {
        let viewer_id = self
            .session_viewer()
            .map(str::to_string)
            .or_else(|| self.assigned_viewer.clone());
        self.close_session().await;

        let Some(viewer_id) = viewer_id else {
            self.state = SessionState::Idle;
            return;
        };
        if self.rebuilds >= MAX_REBUILDS {
            self.give_up(&viewer_id);
            return;
        }
        self.rebuilds += 1;
        info!(
            "Rebuilding peer connection for {} ({}/{})",
            viewer_id, self.rebuilds, MAX_REBUILDS
        );

        // Unhandled until the new offer goes out, so a later readiness
        // change can pick the viewer up again.
        self.registry.unmark(&viewer_id);
        self.state = SessionState::Idle;
        self.start_session(&viewer_id).await;
    }

    fn give_up(&mut self, viewer_id: &str) {
        error!(
            "Giving up on viewer {} after {} rebuilds",
            viewer_id, MAX_REBUILDS
        );
        self.registry.unmark(viewer_id);
        self.state = SessionState::Idle;
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                "Closing peer connection generation {} for {}",
                session.generation, session.viewer_id
            );
            if let Err(e) = session.backend.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
    }
}
