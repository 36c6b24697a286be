//! Capture window opened by a trigger crossing

use std::ops::Range;

/// One triggered capture
///
/// Filled front to back; `next_sample_index` is the write cursor and
/// `last_averaged_index` marks how far the contents have been folded into
/// the running average.
#[derive(Debug, Clone)]
pub struct TriggerWindow {
    samples: Vec<i16>,
    next_sample_index: usize,
    last_averaged_index: usize,
}

impl TriggerWindow {
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0; len],
            next_sample_index: 0,
            last_averaged_index: 0,
        }
    }

    /// Copy as many of `samples` as still fit; returns how many were taken
    pub fn append(&mut self, samples: &[i16]) -> usize {
        let room = self.samples.len() - self.next_sample_index;
        let taken = samples.len().min(room);
        let end = self.next_sample_index + taken;
        self.samples[self.next_sample_index..end].copy_from_slice(&samples[..taken]);
        self.next_sample_index = end;
        taken
    }

    pub fn is_full(&self) -> bool {
        self.next_sample_index == self.samples.len()
    }

    pub fn next_sample_index(&self) -> usize {
        self.next_sample_index
    }

    pub fn last_averaged_index(&self) -> usize {
        self.last_averaged_index
    }

    /// Positions written but not yet folded into the average
    pub fn pending_range(&self) -> Range<usize> {
        self.last_averaged_index..self.next_sample_index
    }

    pub fn mark_averaged(&mut self) {
        self.last_averaged_index = self.next_sample_index;
    }

    #[inline]
    pub fn value(&self, position: usize) -> i16 {
        self.samples[position]
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }
}
