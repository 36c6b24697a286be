//! Byte ring shared between the transport reader and the processing thread
//!
//! The reader thread pushes whatever the transport hands it; the processing
//! thread drains everything available once per chunk. Capacity is fixed
//! (roughly two seconds of wire data). When the processing side falls behind,
//! the oldest unread bytes are overwritten instead of blocking the reader:
//! recent data matters more than complete data for a live display.
//!
//! Overwriting needs both ends of the ring, so it is not split into
//! producer/consumer halves. Each side holds the lock only for a single
//! slice copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

/// Minimum ring size regardless of sample rate
pub const MIN_CAPACITY: usize = 64 * 1024;

/// Ring capacity for about two seconds of wire data
///
/// Every sample costs two bytes on the wire.
pub fn capacity_for(sample_rate: u32, channels: usize) -> usize {
    let per_second = sample_rate as usize * channels.max(1) * 2;
    (per_second * 2).max(MIN_CAPACITY)
}

/// Overwrite-on-full byte ring
pub struct ByteRing {
    inner: Arc<Mutex<HeapRb<u8>>>,
    bytes_overwritten: Arc<AtomicU64>,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(capacity))),
            bytes_overwritten: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<u8>> {
        // A panicking holder cannot leave the ring structurally broken
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push bytes, overwriting the oldest unread bytes if there is no room
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        // Only the newest `capacity` bytes could survive anyway
        let kept = &bytes[bytes.len().saturating_sub(self.capacity)..];
        let dropped_up_front = (bytes.len() - kept.len()) as u64;

        let overwritten = {
            let mut rb = self.lock();
            let vacant = rb.vacant_len();
            let overwritten = kept.len().saturating_sub(vacant) as u64;
            rb.push_slice_overwrite(kept);
            overwritten
        };

        let lost = overwritten + dropped_up_front;
        if lost > 0 {
            self.bytes_overwritten.fetch_add(lost, Ordering::Relaxed);
            log::debug!("Byte ring overrun, {} unread bytes overwritten", lost);
        }
    }

    /// Move every available byte to the end of `out`
    ///
    /// Returns the number of bytes moved.
    pub fn drain_into(&self, out: &mut Vec<u8>) -> usize {
        let mut rb = self.lock();
        let available = rb.occupied_len();
        if available == 0 {
            return 0;
        }

        let start = out.len();
        out.resize(start + available, 0);
        let read = rb.pop_slice(&mut out[start..]);
        out.truncate(start + read);
        read
    }

    /// Discard all unread bytes
    pub fn clear(&self) {
        let mut rb = self.lock();
        while rb.try_pop().is_some() {}
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes lost to overruns
    pub fn bytes_overwritten(&self) -> u64 {
        self.bytes_overwritten.load(Ordering::Relaxed)
    }

    /// Clone reference to share between threads
    pub fn clone_ref(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            bytes_overwritten: Arc::clone(&self.bytes_overwritten),
            capacity: self.capacity,
        }
    }
}

impl Clone for ByteRing {
    fn clone(&self) -> Self {
        self.clone_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain() {
        let ring = ByteRing::new(8);
        ring.push(&[1, 2, 3]);

        let mut out = vec![0xAA];
        assert_eq!(ring.drain_into(&mut out), 3);
        assert_eq!(out, vec![0xAA, 1, 2, 3]);
        assert_eq!(ring.drain_into(&mut out), 0);
        assert_eq!(ring.bytes_overwritten(), 0);
    }

    #[test]
    fn test_overrun_keeps_newest() {
        let ring = ByteRing::new(4);
        ring.push(&[1, 2, 3]);
        ring.push(&[4, 5, 6]);

        let mut out = Vec::new();
        ring.drain_into(&mut out);
        assert_eq!(out, vec![3, 4, 5, 6]);
        assert_eq!(ring.bytes_overwritten(), 2);
    }

    #[test]
    fn test_oversized_push() {
        let ring = ByteRing::new(3);
        ring.push(&[1, 2, 3, 4, 5]);

        let mut out = Vec::new();
        ring.drain_into(&mut out);
        assert_eq!(out, vec![3, 4, 5]);
        assert_eq!(ring.bytes_overwritten(), 2);
    }

    #[test]
    fn test_shared_between_threads() {
        let ring = ByteRing::new(1024);
        let writer = ring.clone_ref();

        let handle = std::thread::spawn(move || {
            for i in 0..10u8 {
                writer.push(&[i; 10]);
            }
        });
        handle.join().unwrap();

        let mut out = Vec::new();
        ring.drain_into(&mut out);
        assert_eq!(out.len(), 100);
        assert_eq!(out[99], 9);
    }

    #[test]
    fn test_clear() {
        let ring = ByteRing::new(16);
        ring.push(&[1, 2, 3]);
        ring.clear();

        let mut out = Vec::new();
        assert_eq!(ring.drain_into(&mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_capacity_for_rate() {
        assert_eq!(capacity_for(10_000, 1), MIN_CAPACITY);
        assert_eq!(capacity_for(10_000, 4), 160_000);
    }
}
