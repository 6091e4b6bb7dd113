//! Parking for inbound signals that cannot be applied yet

use crate::clock::Clock;
use crate::signaling::SignalPayload;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An inbound negotiation message waiting for the session to catch up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSignal {
    pub viewer_id: String,
    pub payload: SignalPayload,
    pub received_at: Instant,
}

/// FIFO of parked signals with lazy expiry.
///
/// Entries older than the TTL are dropped when the queue is drained; no
/// timer is involved.
pub struct PendingSignalQueue {
    entries: VecDeque<PendingSignal>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl PendingSignalQueue {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: VecDeque::new(),
            ttl,
            clock,
        }
    }

    /// Park a signal, stamping it with the current time
    pub fn enqueue(&mut self, viewer_id: &str, payload: SignalPayload) {
        debug!("Parking {} from {}", payload.kind(), viewer_id);
        self.entries.push_back(PendingSignal {
            viewer_id: viewer_id.to_string(),
            payload,
            received_at: self.clock.now(),
        });
    }

    /// Park a previously drained signal again, keeping its original stamp
    pub fn requeue(&mut self, signal: PendingSignal) {
        self.entries.push_back(signal);
    }

    /// Remove every entry, returning the live ones in arrival order
    pub fn drain_ready(&mut self) -> Vec<PendingSignal> {
        let now = self.clock.now();
        let mut ready = Vec::with_capacity(self.entries.len());
        for signal in self.entries.drain(..) {
            let age = now.saturating_duration_since(signal.received_at);
            if age > self.ttl {
                warn!(
                    "Discarding expired {} from {} (age {:?})",
                    signal.payload.kind(),
                    signal.viewer_id,
                    age
                );
                continue;
            }
            ready.push(signal);
        }
        ready
    }

    /// Drop every entry belonging to one viewer
    pub fn purge_viewer(&mut self, viewer_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| s.viewer_id != viewer_id);
        before - self.entries.len()
    }

    /// Drop everything
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
