//! Capture source readiness tracking

use super::device::CaptureDevice;
use super::source::{CaptureSource, SourceKind, TrackHandle};
use super::{CaptureError, CaptureEvent};
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Owns every capture source and reports readiness transitions.
///
/// Sources are independent: one failing never blocks or aborts another,
/// and initialization of several sources runs concurrently.
pub struct CaptureManager {
    devices: HashMap<SourceKind, Arc<dyn CaptureDevice>>,
    sources: Mutex<BTreeMap<SourceKind, CaptureSource>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    shut_down: AtomicBool,
}

impl CaptureManager {
    pub fn new(
        devices: Vec<Arc<dyn CaptureDevice>>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let devices = devices.into_iter().map(|d| (d.kind(), d)).collect();
        Self {
            devices,
            sources: Mutex::new(BTreeMap::new()),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Acquire one source. On failure the source stays not-ready and a
    /// `SourceFailed` event is raised; nothing else is affected.
    pub async fn initialize_source(&self, kind: SourceKind) -> Result<(), CaptureError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CaptureError::ShutDown);
        }

        let Some(device) = self.devices.get(&kind).cloned() else {
            let err = CaptureError::Unavailable {
                kind,
                reason: "no device configured".to_string(),
            };
            self.record_failure(kind, &err);
            return Err(err);
        };

        self.sources
            .lock()
            .entry(kind)
            .or_insert_with(|| CaptureSource::new(kind));

        match device.acquire().await {
            Ok(track) => {
                if self.shut_down.load(Ordering::Acquire) {
                    // Acquisition raced with shutdown; hand the device back.
                    let _ = device.release().await;
                    return Err(CaptureError::ShutDown);
                }
                {
                    let mut sources = self.sources.lock();
                    let source = sources.entry(kind).or_insert_with(|| CaptureSource::new(kind));
                    source.ready = true;
                    source.track = Some(track);
                }
                info!("Capture source {} ready", kind);
                let _ = self.events.send(CaptureEvent::SourceReady(kind));
                Ok(())
            }
            Err(err) => {
                self.record_failure(kind, &err);
                Err(err)
            }
        }
    }

    /// Initialize several sources concurrently, returning each outcome
    pub async fn initialize_all(&self, kinds: &[SourceKind]) -> Vec<(SourceKind, Result<(), CaptureError>)> {
        let attempts = kinds.iter().map(|kind| async move {
            (*kind, self.initialize_source(*kind).await)
        });
        join_all(attempts).await
    }

    /// Mark a previously ready source as lost (device unplugged, revoked)
    pub fn mark_lost(&self, kind: SourceKind, reason: &str) {
        let was_ready = {
            let mut sources = self.sources.lock();
            match sources.get_mut(&kind) {
                Some(source) if source.ready => {
                    source.ready = false;
                    source.track = None;
                    true
                }
                _ => false,
            }
        };
        if was_ready {
            warn!("Capture source {} lost: {}", kind, reason);
            let _ = self.events.send(CaptureEvent::SourceFailed {
                kind,
                reason: reason.to_string(),
            });
        }
    }

    /// Release every acquired source. Safe to call repeatedly.
    pub async fn shutdown_all(&self) -> Vec<CaptureError> {
        self.shut_down.store(true, Ordering::Release);

        let acquired: Vec<SourceKind> = {
            let mut sources = self.sources.lock();
            let kinds = sources
                .values()
                .filter(|s| s.track.is_some())
                .map(|s| s.kind)
                .collect();
            sources.clear();
            kinds
        };

        let mut errors = Vec::new();
        for kind in acquired {
            if let Some(device) = self.devices.get(&kind) {
                match device.release().await {
                    Ok(()) => debug!("Released capture source {}", kind),
                    Err(e) => {
                        warn!("Failed to release capture source {}: {}", kind, e);
                        errors.push(e);
                    }
                }
            }
        }
        errors
    }

    pub fn is_ready(&self, required: &HashSet<SourceKind>) -> bool {
        let sources = self.sources.lock();
        required
            .iter()
            .all(|kind| sources.get(kind).map(|s| s.ready).unwrap_or(false))
    }

    pub fn is_source_ready(&self, kind: SourceKind) -> bool {
        self.sources.lock().get(&kind).map(|s| s.ready).unwrap_or(false)
    }

    /// Tracks of every ready source, in stable kind order
    pub fn ready_tracks(&self) -> Vec<(SourceKind, TrackHandle)> {
        self.sources
            .lock()
            .values()
            .filter(|s| s.ready)
            .filter_map(|s| s.track.clone().map(|t| (s.kind, t)))
            .collect()
    }

    fn record_failure(&self, kind: SourceKind, err: &CaptureError) {
        {
            let mut sources = self.sources.lock();
            let source = sources.entry(kind).or_insert_with(|| CaptureSource::new(kind));
            source.ready = false;
            source.track = None;
        }
        warn!("Capture source {} failed: {}", kind, err);
        let _ = self.events.send(CaptureEvent::SourceFailed {
            kind,
            reason: err.to_string(),
        });
    }
}
