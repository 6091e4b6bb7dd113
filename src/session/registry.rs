//! Viewer bookkeeping

use std::collections::HashMap;

/// A remote viewer seen on the signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    pub handled: bool,
    seen_seq: u64,
}

/// Tracks which viewers already received an offer.
///
/// An entry lives from the viewer's first `viewer-ready` until its
/// `viewer-disconnected`; while `handled` is set no further offer is built
/// for that id.
#[derive(Debug, Default)]
pub struct ViewerRegistry {
    viewers: HashMap<String, Viewer>,
    next_seq: u64,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a viewer announced itself. Returns true for a new id.
    pub fn note_seen(&mut self, id: &str) -> bool {
        if self.viewers.contains_key(id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.viewers.insert(
            id.to_string(),
            Viewer {
                id: id.to_string(),
                handled: false,
                seen_seq: seq,
            },
        );
        true
    }

    pub fn mark_handled(&mut self, id: &str) {
        self.note_seen(id);
        if let Some(viewer) = self.viewers.get_mut(id) {
            viewer.handled = true;
        }
    }

    pub fn is_handled(&self, id: &str) -> bool {
        self.viewers.get(id).map(|v| v.handled).unwrap_or(false)
    }

    /// Keep the viewer but allow a fresh offer
    pub fn unmark(&mut self, id: &str) {
        if let Some(viewer) = self.viewers.get_mut(id) {
            viewer.handled = false;
        }
    }

    /// Forget a viewer entirely
    pub fn clear(&mut self, id: &str) -> bool {
        self.viewers.remove(id).is_some()
    }

    /// Forget every viewer, returning how many were known
    pub fn clear_all(&mut self) -> usize {
        let count = self.viewers.len();
        self.viewers.clear();
        count
    }

    /// Seen viewers still waiting for an offer, oldest first
    pub fn unhandled(&self) -> Vec<String> {
        let mut waiting: Vec<&Viewer> = self.viewers.values().filter(|v| !v.handled).collect();
        waiting.sort_by_key(|v| v.seen_seq);
        waiting.into_iter().map(|v| v.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.viewers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handled_until_cleared() {
        let mut registry = ViewerRegistry::new();
        assert!(!registry.is_handled("v1"));
        registry.mark_handled("v1");
        assert!(registry.is_handled("v1"));
        assert!(registry.clear("v1"));
        assert!(!registry.is_handled("v1"));
        assert!(!registry.clear("v1"));
    }

    #[test]
    fn clear_all_forgets_everyone() {
        let mut registry = ViewerRegistry::new();
        registry.mark_handled("v1");
        registry.note_seen("v2");
        assert_eq!(registry.clear_all(), 2);
        assert!(registry.is_empty());
        assert!(!registry.is_handled("v1"));
        assert!(registry.note_seen("v1"));
    }

    #[test]
    fn unhandled_in_arrival_order() {
        let mut registry = ViewerRegistry::new();
        registry.note_seen("b");
        registry.note_seen("a");
        registry.note_seen("c");
        registry.note_seen("b");
        registry.mark_handled("a");
        assert_eq!(registry.unhandled(), vec!["b".to_string(), "c".to_string()]);

        registry.unmark("a");
        assert_eq!(registry.unhandled(), vec!["b".to_string(), "a".to_string(), "c".to_string()]);
    }
}
