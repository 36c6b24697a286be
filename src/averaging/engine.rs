//! Spike-triggered averaging
//!
//! Every time the selected channel crosses the trigger level, a window
//! centered on the crossing is captured: the first half comes from a rolling
//! buffer of recent samples, the second half is filled as new chunks arrive.
//! Windows are folded into per-position running sums as soon as their samples
//! exist, so the average is available while windows are still filling.
//!
//! At most `averaged_sample_count` windows contribute at any position. When a
//! position is saturated, the window that came `averaged_sample_count` windows
//! before the incoming one is subtracted first. Windows reach each position in
//! the order they were opened, so that window is always the oldest surviving
//! contributor, and it is still held either in flight or in the completed
//! history (which keeps exactly `averaged_sample_count` entries).
//!
//! ```text
//! trigger state:  Normal --crossing--> DeadPeriod --dead_period_count samples--> Normal
//! ```

use std::collections::VecDeque;

use crate::acquisition::CircularSampleBuffer;

use super::config::AveragingConfig;
use super::window::TriggerWindow;

/// Trigger detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Normal,
    /// Crossings are ignored for `remaining` more samples
    DeadPeriod { remaining: usize },
}

/// Whether the step from `prev` to `curr` crosses `trigger`
///
/// Non-negative levels fire on rising edges, negative levels on falling ones.
#[inline]
pub fn crosses(prev: i16, curr: i16, trigger: i32) -> bool {
    let (prev, curr) = (i32::from(prev), i32::from(curr));
    if trigger >= 0 {
        prev <= trigger && trigger < curr
    } else {
        prev >= trigger && trigger > curr
    }
}

/// Threshold-triggered running average over a bounded number of windows
#[derive(Debug)]
pub struct ThresholdAveragingEngine {
    config: AveragingConfig,
    total_window_samples: usize,
    buffer_sample_count: usize,
    dead_period_count: usize,

    /// Pre-trigger context from previous chunks
    history: CircularSampleBuffer,
    state: TriggerState,
    last_sample: Option<i16>,

    in_flight: VecDeque<TriggerWindow>,
    completed: VecDeque<TriggerWindow>,

    sum: Vec<i64>,
    count: Vec<usize>,
    averaged: Vec<i16>,

    trigger_count: u64,
}

impl ThresholdAveragingEngine {
    /// Create an engine; invalid fields of `config` fall back to defaults
    pub fn new(config: AveragingConfig) -> Self {
        let config = config.sanitized(&AveragingConfig::default());
        let mut engine = Self {
            config,
            total_window_samples: 0,
            buffer_sample_count: 0,
            dead_period_count: 0,
            history: CircularSampleBuffer::new(1),
            state: TriggerState::Normal,
            last_sample: None,
            in_flight: VecDeque::new(),
            completed: VecDeque::new(),
            sum: Vec::new(),
            count: Vec::new(),
            averaged: Vec::new(),
            trigger_count: 0,
        };
        engine.reset();
        engine
    }

    pub fn config(&self) -> &AveragingConfig {
        &self.config
    }

    pub fn total_window_samples(&self) -> usize {
        self.total_window_samples
    }

    pub fn buffer_sample_count(&self) -> usize {
        self.buffer_sample_count
    }

    pub fn dead_period_count(&self) -> usize {
        self.dead_period_count
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Triggers recognized since the last reset
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    pub fn in_flight_windows(&self) -> usize {
        self.in_flight.len()
    }

    pub fn completed_windows(&self) -> usize {
        self.completed.len()
    }

    /// Number of windows currently summed at `position`
    pub fn contributions_at(&self, position: usize) -> usize {
        self.count.get(position).copied().unwrap_or(0)
    }

    /// Running average, `total_window_samples` long
    ///
    /// Positions no window has reached yet read as zero.
    pub fn averaged_samples(&self) -> &[i16] {
        &self.averaged
    }

    /// Drop all windows, sums and context, and resize for the current config
    pub fn reset(&mut self) {
        self.total_window_samples = self.config.total_window_samples();
        self.buffer_sample_count = self.config.buffer_sample_count();
        self.dead_period_count = self.config.dead_period_count();

        self.history = CircularSampleBuffer::new(self.buffer_sample_count);
        self.state = TriggerState::Normal;
        self.last_sample = None;
        self.in_flight.clear();
        self.completed.clear();

        self.sum = vec![0; self.total_window_samples];
        self.count = vec![0; self.total_window_samples];
        self.averaged = vec![0; self.total_window_samples];
        self.trigger_count = 0;

        log::debug!(
            "Averager reset: window {} samples, pre-trigger {}, dead period {}, depth {}",
            self.total_window_samples,
            self.buffer_sample_count,
            self.dead_period_count,
            self.config.averaged_sample_count
        );
    }

    /// Apply a new configuration
    ///
    /// Invalid fields keep their previous value. Any effective change resets
    /// the engine.
    pub fn apply_config(&mut self, config: AveragingConfig) {
        let config = config.sanitized(&self.config);
        if config != self.config {
            self.config = config;
            self.reset();
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.apply_config(AveragingConfig {
            sample_rate,
            ..self.config
        });
    }

    pub fn set_averaged_sample_count(&mut self, averaged_sample_count: usize) {
        self.apply_config(AveragingConfig {
            averaged_sample_count,
            ..self.config
        });
    }

    pub fn set_max_processed_seconds(&mut self, max_processed_seconds: f32) {
        self.apply_config(AveragingConfig {
            max_processed_seconds,
            ..self.config
        });
    }

    pub fn set_dead_period_seconds(&mut self, dead_period_seconds: f32) {
        self.apply_config(AveragingConfig {
            dead_period_seconds,
            ..self.config
        });
    }

    pub fn set_trigger_value(&mut self, trigger_value: Option<i32>) {
        self.apply_config(AveragingConfig {
            trigger_value,
            ..self.config
        });
    }

    /// Feed the next chunk of the selected channel
    ///
    /// Returns the number of triggers recognized in the chunk.
    pub fn process(&mut self, samples: &[i16]) -> usize {
        if samples.is_empty() {
            return 0;
        }

        for window in self.in_flight.iter_mut() {
            window.append(samples);
        }

        let fired = self.detect_triggers(samples);

        self.history.add(samples);
        self.last_sample = samples.last().copied();

        self.fold_pending();
        self.retire_full_windows();

        fired
    }

    fn detect_triggers(&mut self, samples: &[i16]) -> usize {
        let Some(trigger) = self.config.trigger_value else {
            return 0;
        };

        let mut fired = 0;
        let mut prev = self.last_sample;

        for (i, &curr) in samples.iter().enumerate() {
            if let TriggerState::DeadPeriod { remaining } = self.state {
                self.state = if remaining <= 1 {
                    TriggerState::Normal
                } else {
                    TriggerState::DeadPeriod {
                        remaining: remaining - 1,
                    }
                };
            }

            if self.state == TriggerState::Normal
                && prev.is_some_and(|prev| crosses(prev, curr, trigger))
            {
                self.open_window(samples, i);
                fired += 1;
                if self.dead_period_count > 0 {
                    self.state = TriggerState::DeadPeriod {
                        remaining: self.dead_period_count,
                    };
                }
            }

            prev = Some(curr);
        }

        fired
    }

    /// Start a window whose center is `samples[crossing]`
    fn open_window(&mut self, samples: &[i16], crossing: usize) {
        let from_chunk = crossing.min(self.buffer_sample_count);
        let from_history = self.buffer_sample_count - from_chunk;

        let mut window = TriggerWindow::new(self.total_window_samples);
        window.append(&self.history.tail(from_history));
        window.append(&samples[crossing - from_chunk..crossing]);
        window.append(&samples[crossing..]);

        self.in_flight.push_back(window);
        self.trigger_count += 1;
        log::debug!(
            "Trigger #{} at chunk offset {}",
            self.trigger_count,
            crossing
        );
    }

    /// Fold every newly written window position into the running sums
    fn fold_pending(&mut self) {
        let depth = self.config.averaged_sample_count;
        let Self {
            completed,
            in_flight,
            sum,
            count,
            averaged,
            ..
        } = self;
        let completed_len = completed.len();

        for k in 0..in_flight.len() {
            let pending = in_flight[k].pending_range();
            if pending.is_empty() {
                continue;
            }

            // Recency index across completed history followed by in-flight windows
            let index = completed_len + k;
            let oldest = match index.checked_sub(depth) {
                Some(i) if i < completed_len => completed.get(i),
                Some(i) => in_flight.get(i - completed_len),
                None => None,
            };

            let window = &in_flight[k];
            for p in pending {
                let value = i64::from(window.value(p));
                if count[p] >= depth {
                    debug_assert!(oldest.is_some(), "saturated position without a contributor");
                    if let Some(oldest) = oldest {
                        sum[p] -= i64::from(oldest.value(p));
                    }
                } else {
                    count[p] += 1;
                }
                sum[p] += value;
                averaged[p] = (sum[p] / count[p] as i64) as i16;
            }

            in_flight[k].mark_averaged();
        }
    }

    fn retire_full_windows(&mut self) {
        while self.in_flight.front().is_some_and(TriggerWindow::is_full) {
            if let Some(window) = self.in_flight.pop_front() {
                self.completed.push_back(window);
            }
            while self.completed.len() > self.config.averaged_sample_count {
                self.completed.pop_front();
            }
        }
    }
}
