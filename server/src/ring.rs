//! Fixed-capacity history keyed by monotonically increasing ids
//!
//! The ring keeps the most recent entries of a stream whose ids only grow,
//! but whose entries may arrive late, twice, or never. Capacity is always a
//! power of two so slot indices are computed by masking. One slot is kept
//! free to tell a full ring from an empty one, so at most `capacity - 1`
//! ids are retained.
//!
//! Ids skipped when the head jumps forward become explicit gaps: the slot is
//! marked absent and can still be filled later by a late write.

use log::error;
use shared::control::set_ack_bit;

#[derive(Debug)]
pub struct HistoryRing<T> {
    slots: Vec<Option<T>>,
    mask: usize,
    head: usize,
    tail: usize,
    head_id: u32,
}

impl<T> HistoryRing<T> {
    /// Creates a ring holding at least `min_len` slots (at least 4)
    pub fn new(min_len: usize) -> Self {
        let len = min_len.max(4).next_power_of_two();
        Self {
            slots: (0..len).map(|_| None).collect(),
            mask: len - 1,
            head: 0,
            tail: 0,
            head_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of ids in the retained window, gaps included
    pub fn size(&self) -> usize {
        self.head.wrapping_sub(self.tail) & self.mask
    }

    pub fn space(&self) -> usize {
        self.tail.wrapping_sub(self.head).wrapping_sub(1) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Id of the newest slot
    pub fn head_id(&self) -> Option<u32> {
        (!self.is_empty()).then_some(self.head_id)
    }

    /// Id of the oldest slot still in the retained window
    pub fn oldest_id(&self) -> Option<u32> {
        (!self.is_empty()).then(|| self.head_id - (self.size() as u32 - 1))
    }

    /// The i-th most recent slot, 0 being the newest
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.size() {
            return None;
        }
        self.slot(self.head.wrapping_sub(i + 1) & self.mask)
    }

    pub fn get_by_id(&self, id: u32) -> Option<&T> {
        self.index_of(id).and_then(|i| self.slot(i))
    }

    /// Whether a value is held for `id`
    pub fn mem(&self, id: u32) -> bool {
        self.get_by_id(id).is_some()
    }

    /// Stores `value` under `id`
    ///
    /// A newer id moves the head forward, marking skipped ids as gaps and
    /// dropping the oldest entries once the ring is full. An id inside the
    /// window overwrites its slot in place. An id older than the window is
    /// ignored.
    pub fn write(&mut self, id: u32, value: T) {
        if self.is_empty() {
            self.push(value);
            self.head_id = id;
            return;
        }

        if id > self.head_id {
            let gap = (id - self.head_id - 1) as usize;
            if gap >= self.capacity() {
                // every retained id falls out of the window
                self.slots.iter_mut().for_each(|slot| *slot = None);
                self.head = self.head.wrapping_add(gap) & self.mask;
                self.tail = self.head;
            } else {
                for _ in 0..gap {
                    self.skip();
                }
            }
            self.push(value);
            self.head_id = id;
            return;
        }

        let dist = (self.head_id - id) as usize;
        if dist >= self.mask {
            return;
        }

        let i = self.head.wrapping_sub(dist + 1) & self.mask;
        self.set_slot(i, value);
        if dist >= self.size() {
            // late fill behind the oldest retained id
            self.tail = i;
        }
    }

    /// Fills `ack` with one bit per id, newest first
    ///
    /// Bit `i` is set iff a value is held for `head_id - i`.
    pub fn make_ack(&self, ack: &mut [u8]) {
        ack.iter_mut().for_each(|byte| *byte = 0);
        let bits = (ack.len() * 8).min(self.capacity());
        for i in 0..bits {
            if self.get(i).is_some() {
                set_ack_bit(ack, i);
            }
        }
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        if self.is_empty() || id > self.head_id {
            return None;
        }
        let dist = (self.head_id - id) as usize;
        if dist >= self.size() {
            return None;
        }
        Some(self.head.wrapping_sub(dist + 1) & self.mask)
    }

    fn slot(&self, i: usize) -> Option<&T> {
        match self.slots.get(i) {
            Some(slot) => slot.as_ref(),
            None => {
                error!("ring index {} out of bounds 0..{}", i, self.capacity());
                None
            }
        }
    }

    fn set_slot(&mut self, i: usize, value: T) {
        let len = self.capacity();
        match self.slots.get_mut(i) {
            Some(slot) => *slot = Some(value),
            None => error!("ring index {} out of bounds 0..{}", i, len),
        }
    }

    fn push(&mut self, value: T) {
        if self.space() == 0 {
            self.tail = (self.tail + 1) & self.mask;
        }
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) & self.mask;
    }

    fn skip(&mut self) {
        if self.space() == 0 {
            self.tail = (self.tail + 1) & self.mask;
        }
        self.slots[self.head] = None;
        self.head = (self.head + 1) & self.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use shared::control::ack_bit;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(HistoryRing::<u32>::new(0).capacity(), 4);
        assert_eq!(HistoryRing::<u32>::new(4).capacity(), 4);
        assert_eq!(HistoryRing::<u32>::new(5).capacity(), 8);
        assert_eq!(HistoryRing::<u32>::new(16).capacity(), 16);
        assert_eq!(HistoryRing::<u32>::new(17).capacity(), 32);
    }

    #[test]
    fn test_gap_is_observable() {
        let mut ring = HistoryRing::new(8);
        ring.write(1, "one");
        ring.write(2, "two");
        ring.write(4, "four");

        assert!(!ring.mem(3));
        assert!(ring.mem(4));
        assert_eq!(ring.get_by_id(4), Some(&"four"));
        assert_eq!(ring.get_by_id(3), None);
        assert_eq!(ring.size(), 4);
        assert_eq!(ring.head_id(), Some(4));
        assert_eq!(ring.get(0), Some(&"four"));
        assert_eq!(ring.get(1), None);
        assert_eq!(ring.get(2), Some(&"two"));
    }

    #[test]
    fn test_late_write_fills_gap() {
        let mut ring = HistoryRing::new(8);
        ring.write(1, 1);
        ring.write(4, 4);
        ring.write(3, 3);

        assert!(ring.mem(3));
        assert!(!ring.mem(2));
        assert_eq!(ring.head_id(), Some(4));
    }

    #[test]
    fn test_increasing_writes_stay_bounded() {
        let mut ring = HistoryRing::new(8);
        let mut rng = rand::thread_rng();
        let mut id = 0u32;

        for _ in 0..1000 {
            id += rng.gen_range(1..4);
            ring.write(id, id * 10);
            assert!(ring.size() <= ring.capacity() - 1);
            assert_eq!(ring.get(0), Some(&(id * 10)));
            assert_eq!(ring.head_id(), Some(id));
        }
    }

    #[test]
    fn test_write_older_than_window_is_noop() {
        let mut ring = HistoryRing::new(4);
        for id in 10..14 {
            ring.write(id, id);
        }
        // retained: 11, 12, 13
        assert_eq!(ring.oldest_id(), Some(11));

        ring.write(10, 999);
        ring.write(2, 999);

        assert!(!ring.mem(10));
        assert_eq!(ring.size(), 3);
        assert_eq!(ring.get_by_id(11), Some(&11));
        assert_eq!(ring.get(0), Some(&13));
    }

    #[test]
    fn test_overwrite_in_window() {
        let mut ring = HistoryRing::new(8);
        ring.write(5, "a");
        ring.write(6, "b");
        ring.write(5, "c");
        assert_eq!(ring.get_by_id(5), Some(&"c"));
        assert_eq!(ring.size(), 2);
    }

    #[test]
    fn test_late_fill_extends_window_backwards() {
        let mut ring = HistoryRing::new(8);
        ring.write(10, 10);
        assert_eq!(ring.oldest_id(), Some(10));

        ring.write(7, 7);
        assert_eq!(ring.oldest_id(), Some(7));
        assert_eq!(ring.size(), 4);
        assert!(ring.mem(7));
        assert!(!ring.mem(8));
        assert!(!ring.mem(9));
        assert!(ring.mem(10));
    }

    #[test]
    fn test_large_jump_clears_history() {
        let mut ring = HistoryRing::new(8);
        for id in 0..5 {
            ring.write(id, id);
        }
        ring.write(1000, 1000);

        assert_eq!(ring.size(), 1);
        assert_eq!(ring.get(0), Some(&1000));
        for id in 0..5 {
            assert!(!ring.mem(id));
        }

        ring.write(999, 999);
        assert!(ring.mem(999));
    }

    #[test]
    fn test_make_ack_matches_membership() {
        let mut ring = HistoryRing::new(16);
        let mut rng = rand::thread_rng();

        for id in 0..200u32 {
            if rng.gen_bool(0.7) {
                ring.write(id, ());
            }
            // a few late arrivals
            if id > 5 && rng.gen_bool(0.2) {
                ring.write(id - rng.gen_range(1..5), ());
            }

            let mut ack = [0u8; 2];
            ring.make_ack(&mut ack);

            let head = match ring.head_id() {
                Some(head) => head,
                None => continue,
            };
            for i in 0..16u32 {
                let expected = head >= i && ring.mem(head - i);
                assert_eq!(ack_bit(&ack, i as usize), expected, "bit {} at head {}", i, head);
            }
        }
    }

    #[test]
    fn test_make_ack_on_empty_ring() {
        let ring: HistoryRing<u8> = HistoryRing::new(16);
        let mut ack = [0xffu8; 2];
        ring.make_ack(&mut ack);
        assert_eq!(ack, [0, 0]);
    }
}
