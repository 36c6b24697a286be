//! Fixed-capacity circular sample buffer
//!
//! Holds the most recent `capacity` samples of a single channel on top of a
//! `ringbuf` heap ring that is kept full at all times. Writing overwrites the
//! oldest entry. The ring starts out zero-filled, so reads before it has been
//! filled once return leading zeros.
//!
//! Not synchronized: the owner serializes access.

use std::fmt;

use ringbuf::{
    traits::{Consumer, Producer, RingBuffer},
    HeapRb,
};

/// Circular buffer of `i16` samples with logically ordered readout
pub struct CircularSampleBuffer {
    rb: HeapRb<i16>,
    capacity: usize,
}

impl CircularSampleBuffer {
    /// Create a zero-filled buffer holding `capacity` samples
    ///
    /// A capacity of zero is bumped to one so that writes are always valid.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut rb = HeapRb::new(capacity);
        rb.push_iter(std::iter::repeat(0).take(capacity));
        Self { rb, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a single sample, overwriting the oldest one
    #[inline]
    pub fn add_end(&mut self, sample: i16) {
        self.rb.push_overwrite(sample);
    }

    /// Append a run of samples in order
    ///
    /// When `samples` is longer than the buffer only its last `capacity`
    /// entries survive.
    pub fn add(&mut self, samples: &[i16]) {
        let kept = &samples[samples.len().saturating_sub(self.capacity)..];
        self.rb.push_slice_overwrite(kept);
    }

    /// All samples in chronological order (oldest first)
    pub fn to_ordered_vec(&self) -> Vec<i16> {
        self.rb.iter().copied().collect()
    }

    /// The most recent `n` samples, oldest first
    ///
    /// `n` is clamped to the capacity.
    pub fn tail(&self, n: usize) -> Vec<i16> {
        let skip = self.capacity - n.min(self.capacity);
        self.rb.iter().skip(skip).copied().collect()
    }

    /// Zero the contents
    pub fn clear(&mut self) {
        *self = Self::new(self.capacity);
    }
}

impl fmt::Debug for CircularSampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularSampleBuffer")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_zero_filled() {
        let buffer = CircularSampleBuffer::new(4);
        assert_eq!(buffer.to_ordered_vec(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_ordered_readout_after_wrap() {
        let mut buffer = CircularSampleBuffer::new(3);

        for value in 1..=5 {
            buffer.add_end(value);
        }

        assert_eq!(buffer.to_ordered_vec(), vec![3, 4, 5]);
    }

    #[test]
    fn test_bulk_add_matches_single_adds() {
        let mut bulk = CircularSampleBuffer::new(5);
        let mut single = CircularSampleBuffer::new(5);

        let data: Vec<i16> = (0..13).collect();
        bulk.add(&data[..4]);
        bulk.add(&data[4..]);
        for &s in &data {
            single.add_end(s);
        }

        assert_eq!(bulk.to_ordered_vec(), single.to_ordered_vec());
        assert_eq!(bulk.to_ordered_vec(), vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_oversized_add_keeps_newest() {
        let mut buffer = CircularSampleBuffer::new(4);
        buffer.add_end(-1);
        buffer.add(&[1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(buffer.to_ordered_vec(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_tail() {
        let mut buffer = CircularSampleBuffer::new(4);
        buffer.add(&[1, 2, 3, 4, 5, 6]);

        assert_eq!(buffer.tail(2), vec![5, 6]);
        assert_eq!(buffer.tail(0), Vec::<i16>::new());
        assert_eq!(buffer.tail(10), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = CircularSampleBuffer::new(3);
        buffer.add(&[7, 8]);
        buffer.clear();

        assert_eq!(buffer.to_ordered_vec(), vec![0, 0, 0]);
        buffer.add_end(1);
        assert_eq!(buffer.tail(1), vec![1]);
    }
}
