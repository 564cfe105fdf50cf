/// Detection log
///
/// Ordered, append-only record of detections for the presentation layer.
/// Cleared only on explicit request. Unbounded unless the host sets a
/// capacity, in which case the oldest entries are evicted.

use crate::engine::DetectionEvent;
use parking_lot::RwLock;
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::debug;

pub struct DetectionLog {
    entries: RwLock<VecDeque<DetectionEvent>>,
    capacity: Option<usize>,
    /// Number of entries, published on every change
    revision: watch::Sender<usize>,
}

impl DetectionLog {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Log that keeps at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    fn build(capacity: Option<usize>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity,
            revision,
        }
    }

    pub fn append(&self, event: DetectionEvent) {
        let len = {
            let mut entries = self.entries.write();
            if let Some(capacity) = self.capacity {
                while entries.len() >= capacity {
                    entries.pop_front();
                }
            }
            entries.push_back(event);
            entries.len()
        };
        self.revision.send_replace(len);
    }

    pub fn clear(&self) {
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.len();
            entries.clear();
            removed
        };
        debug!("Cleared {} detections", removed);
        self.revision.send_replace(0);
    }

    /// Every entry, oldest first
    pub fn all(&self) -> Vec<DetectionEvent> {
        self.entries.read().iter().cloned().collect()
    }

    /// Most recent entry
    pub fn last(&self) -> Option<DetectionEvent> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Notified with the entry count whenever the log changes
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.revision.subscribe()
    }
}

impl Default for DetectionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, n: u32) -> DetectionEvent {
        DetectionEvent::new(name, json!({ "name": name, "n": n }))
    }

    #[test]
    fn test_insertion_order() {
        let log = DetectionLog::new();
        log.append(event("memory", 1));
        log.append(event("hey", 2));
        log.append(event("memory", 3));

        let all = log.all();
        let order: Vec<u64> = all
            .iter()
            .map(|e| e.raw_payload()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(log.last().unwrap().raw_payload()["n"], 3);
        assert_eq!(log.capacity(), None);
    }

    #[test]
    fn test_clear() {
        let log = DetectionLog::new();
        log.append(event("memory", 1));
        assert_eq!(log.len(), 1);

        log.clear();
        assert!(log.is_empty());
        assert!(log.last().is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = DetectionLog::with_capacity(2);
        for n in 1..=4 {
            log.append(event("memory", n));
        }

        let all = log.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].raw_payload()["n"], 3);
        assert_eq!(all[1].raw_payload()["n"], 4);
    }

    #[test]
    fn test_revision_tracks_length() {
        let log = DetectionLog::new();
        let rx = log.subscribe();

        log.append(event("memory", 1));
        log.append(event("memory", 2));
        assert_eq!(*rx.borrow(), 2);

        log.clear();
        assert_eq!(*rx.borrow(), 0);
    }
}
