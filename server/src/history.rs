//! Time-indexed record of past world states
//!
//! Keeps one [`Snapshot`] per captured tick, newest first, and forgets any
//! snapshot that falls further behind the newest one than the retention
//! window. Lag compensation looks shots up here.

use log::{debug, warn};
use shared::snapshot::{EntityDesc, Snapshot};
use shared::{EntityId, SnapshotId, Tick};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct SnapshotHistory {
    snapshots: VecDeque<Snapshot>,
    next_id: SnapshotId,
    window: Tick,
}

impl SnapshotHistory {
    /// `window` is the largest age, in ticks, a retained snapshot may have
    pub fn new(window: Tick) -> Self {
        Self {
            snapshots: VecDeque::new(),
            next_id: 0,
            window,
        }
    }

    pub fn window(&self) -> Tick {
        self.window
    }

    /// Captures the world at `tick`
    ///
    /// Capturing a tick that is already the newest returns the existing
    /// snapshot without calling `produce`. Ticks older than the newest are
    /// refused.
    pub fn capture<F>(&mut self, tick: Tick, produce: F) -> Option<&Snapshot>
    where
        F: FnOnce() -> (Vec<EntityDesc>, Vec<EntityId>),
    {
        if let Some(newest) = self.snapshots.front().map(|s| s.tick) {
            if newest == tick {
                return self.snapshots.front();
            }
            if newest > tick {
                warn!("refusing snapshot for tick {} older than newest tick {}", tick, newest);
                return None;
            }
        }

        let (entities, despawned) = produce();
        let snapshot = Snapshot {
            id: self.next_id,
            tick,
            entities,
            despawned,
        };
        self.next_id = self.next_id.wrapping_add(1);
        self.snapshots.push_front(snapshot);
        self.prune(tick);

        self.snapshots.front()
    }

    fn prune(&mut self, newest: Tick) {
        let horizon = newest.saturating_sub(self.window);
        while let Some(oldest) = self.snapshots.back() {
            if oldest.tick >= horizon {
                break;
            }
            debug!("forgetting snapshot {} (tick {})", oldest.id, oldest.tick);
            self.snapshots.pop_back();
        }
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.front()
    }

    pub fn oldest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    /// Most recent snapshot taken at or before `tick`
    pub fn at_or_before(&self, tick: Tick) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.tick <= tick)
    }

    pub fn get_by_id(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Snapshots newest first
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> (Vec<EntityDesc>, Vec<EntityId>) {
        (Vec::new(), Vec::new())
    }

    #[test]
    fn test_capture_assigns_increasing_ids() {
        let mut history = SnapshotHistory::new(100);
        let a = history.capture(3, empty).unwrap().id;
        let b = history.capture(6, empty).unwrap().id;
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(history.latest().unwrap().tick, 6);
    }

    #[test]
    fn test_same_tick_returns_existing() {
        let mut history = SnapshotHistory::new(100);
        history.capture(3, || (Vec::new(), vec![9]));

        let again = history
            .capture(3, || panic!("world captured twice for one tick"))
            .unwrap();
        assert_eq!(again.id, 0);
        assert_eq!(again.despawned, vec![9]);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_older_tick_is_refused() {
        let mut history = SnapshotHistory::new(100);
        history.capture(10, empty);
        assert!(history.capture(5, empty).is_none());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_retention_window() {
        let mut history = SnapshotHistory::new(9);
        for tick in (0..60).step_by(3) {
            history.capture(tick, empty);

            let newest = history.latest().unwrap().tick;
            let oldest = history.oldest().unwrap().tick;
            assert!(newest - oldest <= 9);
        }
        // newest 57, window reaches back to 48
        let ticks: Vec<Tick> = history.iter().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![57, 54, 51, 48]);
    }

    #[test]
    fn test_pruned_entries_never_return() {
        let mut history = SnapshotHistory::new(5);
        history.capture(0, empty);
        history.capture(10, empty);
        assert!(history.get_by_id(0).is_none());
        assert!(history.at_or_before(4).is_none());
    }

    #[test]
    fn test_at_or_before() {
        let mut history = SnapshotHistory::new(100);
        for tick in [3, 6, 9] {
            history.capture(tick, empty);
        }

        assert_eq!(history.at_or_before(9).unwrap().tick, 9);
        assert_eq!(history.at_or_before(8).unwrap().tick, 6);
        assert_eq!(history.at_or_before(100).unwrap().tick, 9);
        assert!(history.at_or_before(2).is_none());
    }
}
