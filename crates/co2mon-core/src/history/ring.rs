//! Fixed-capacity circular sample store with windowed statistics.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::IndexOutOfRange;

/// Circular buffer of samples that keeps only the last `capacity` values.
///
/// Logical positions are oldest-first: `get_value(0)` is the oldest retained
/// sample and `get_value(count() - 1)` the most recent. Statistics return
/// `None` when the window they cover is empty.
///
/// Insertion takes `&mut self`, so a query can never observe a slot that is
/// only partly written.
#[derive(Debug, Clone)]
pub struct RingStatBuffer {
    /// Backing storage, allocated once at construction
    slots: Vec<f32>,
    /// Slot the next value is written to
    head: usize,
    /// Number of retained values
    count: usize,
    /// Every value ever inserted, including overwritten ones
    total_inserted: u64,
}

impl RingStatBuffer {
    /// Create a buffer holding at most `capacity` values (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0.0; capacity.max(1)],
            head: 0,
            count: 0,
            total_inserted: 0,
        }
    }

    /// Insert a value, overwriting the oldest one once full.
    pub fn add_value(&mut self, value: f32) {
        let capacity = self.slots.len();
        self.slots[self.head] = value;
        self.head = (self.head + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
        }
        self.total_inserted += 1;
    }

    /// Value at logical position `index`, oldest first.
    pub fn get_value(&self, index: usize) -> Result<f32, IndexOutOfRange> {
        if index >= self.count {
            return Err(IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        Ok(self.slots[self.physical(index)])
    }

    /// Most recently inserted value
    pub fn last(&self) -> Option<f32> {
        self.count.checked_sub(1).map(|i| self.slots[self.physical(i)])
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Number of values inserted since construction or the last [`clear`](Self::clear).
    pub fn total_inserted(&self) -> u64 {
        self.total_inserted
    }

    /// Forget all retained values. Capacity is unchanged and the old slot
    /// contents are left in place, unreachable.
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
        self.total_inserted = 0;
    }

    /// Retained values, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = f32> + ExactSizeIterator + '_ {
        (0..self.count).map(move |i| self.slots[self.physical(i)])
    }

    /// Retained values of the most recent `k` entries, oldest first.
    pub fn iter_last(&self, k: usize) -> impl DoubleEndedIterator<Item = f32> + '_ {
        let start = self.count - k.min(self.count);
        (start..self.count).map(move |i| self.slots[self.physical(i)])
    }

    pub fn average(&self) -> Option<f32> {
        self.average_last(self.count)
    }

    pub fn min(&self) -> Option<f32> {
        self.min_last(self.count)
    }

    pub fn max(&self) -> Option<f32> {
        self.max_last(self.count)
    }

    /// Mean of the most recent `min(k, count)` values.
    pub fn average_last(&self, k: usize) -> Option<f32> {
        let n = k.min(self.count);
        if n == 0 {
            return None;
        }
        // f64 keeps an hour of 5-digit ppm values exact
        let sum: f64 = self.iter_last(n).map(f64::from).sum();
        Some((sum / n as f64) as f32)
    }

    /// Smallest of the most recent `min(k, count)` values.
    pub fn min_last(&self, k: usize) -> Option<f32> {
        self.iter_last(k).reduce(f32::min)
    }

    /// Largest of the most recent `min(k, count)` values.
    pub fn max_last(&self, k: usize) -> Option<f32> {
        self.iter_last(k).reduce(f32::max)
    }

    /// Map a logical position to a slot index.
    fn physical(&self, index: usize) -> usize {
        let capacity = self.slots.len();
        let oldest = (self.head + capacity - self.count) % capacity;
        (oldest + index) % capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, values: &[f32]) -> RingStatBuffer {
        let mut buffer = RingStatBuffer::new(capacity);
        for &v in values {
            buffer.add_value(v);
        }
        buffer
    }

    #[test]
    fn test_empty_buffer_has_no_statistics() {
        let buffer = RingStatBuffer::new(4);

        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.average(), None);
        assert_eq!(buffer.min(), None);
        assert_eq!(buffer.max(), None);
        assert_eq!(buffer.average_last(3), None);
        assert_eq!(buffer.last(), None);
    }

    #[test]
    fn test_overwrite_keeps_latest_at_end() {
        let buffer = filled(3, &[1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(buffer.count(), 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.get_value(0), Ok(3.0));
        assert_eq!(buffer.get_value(2), Ok(5.0));
        assert_eq!(buffer.last(), Some(5.0));
        assert_eq!(buffer.total_inserted(), 5);
    }

    #[test]
    fn test_get_value_out_of_range() {
        let buffer = filled(4, &[10.0, 20.0]);

        assert_eq!(
            buffer.get_value(2),
            Err(IndexOutOfRange { index: 2, count: 2 })
        );
    }

    #[test]
    fn test_windowed_statistics() {
        let buffer = filled(5, &[100.0, 400.0, 200.0, 600.0, 300.0]);

        assert_eq!(buffer.average_last(2), Some(450.0));
        assert_eq!(buffer.min_last(3), Some(200.0));
        assert_eq!(buffer.max_last(3), Some(600.0));
        assert_eq!(buffer.average(), Some(320.0));
        assert_eq!(buffer.min(), Some(100.0));
        assert_eq!(buffer.max(), Some(600.0));
    }

    #[test]
    fn test_window_larger_than_count_is_clamped() {
        let buffer = filled(10, &[500.0, 700.0, 900.0]);

        assert_eq!(buffer.average_last(50), buffer.average_last(3));
        assert_eq!(buffer.min_last(50), Some(500.0));
        assert_eq!(buffer.max_last(50), Some(900.0));
    }

    #[test]
    fn test_window_after_wrap_ignores_overwritten_values() {
        // 1000 is overwritten and must not leak into the window
        let buffer = filled(3, &[1000.0, 10.0, 20.0, 30.0]);

        assert_eq!(buffer.max_last(3), Some(30.0));
        assert_eq!(buffer.average_last(3), Some(20.0));
    }

    #[test]
    fn test_clear_keeps_capacity_and_hides_values() {
        let mut buffer = filled(4, &[1.0, 2.0, 3.0]);
        buffer.clear();

        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.capacity(), 4);
        assert!(buffer.get_value(0).is_err());
        assert_eq!(buffer.average(), None);

        buffer.add_value(9.0);
        assert_eq!(buffer.get_value(0), Ok(9.0));
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn test_iter_is_oldest_first() {
        let buffer = filled(3, &[1.0, 2.0, 3.0, 4.0]);
        let values: Vec<f32> = buffer.iter().collect();

        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        let tail: Vec<f32> = buffer.iter_last(2).collect();
        assert_eq!(tail, vec![3.0, 4.0]);
    }

    #[test]
    fn test_zero_capacity_is_promoted_to_one() {
        let buffer = filled(0, &[7.0, 8.0]);

        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.get_value(0), Ok(8.0));
    }
}
