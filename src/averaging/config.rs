//! Averaging configuration and derived window sizes

use serde::{Deserialize, Serialize};

/// Longest accepted capture window
const MAX_WINDOW_SECONDS: f32 = 10.0;

/// Parameters of the spike-triggered averager
///
/// `trigger_value` of `None` disables triggering entirely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingConfig {
    pub sample_rate: u32,
    /// Maximum number of windows summed into the average
    pub averaged_sample_count: usize,
    /// Length of a capture window; half of it precedes the trigger
    pub max_processed_seconds: f32,
    /// Minimum time between two recognized triggers
    pub dead_period_seconds: f32,
    pub trigger_value: Option<i32>,
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10_000,
            averaged_sample_count: 30,
            max_processed_seconds: 1.0,
            dead_period_seconds: 0.005,
            trigger_value: None,
        }
    }
}

impl AveragingConfig {
    /// Samples in one capture window, at least one
    pub fn total_window_samples(&self) -> usize {
        seconds_to_samples(self.sample_rate, self.max_processed_seconds).max(1)
    }

    /// Samples captured ahead of the trigger point
    pub fn buffer_sample_count(&self) -> usize {
        self.total_window_samples() / 2
    }

    pub fn dead_period_count(&self) -> usize {
        seconds_to_samples(self.sample_rate, self.dead_period_seconds)
    }

    /// Replace every invalid field with the value from `previous`
    pub fn sanitized(self, previous: &Self) -> Self {
        let mut config = self;

        if config.sample_rate == 0 {
            log::warn!("Ignoring sample rate of zero");
            config.sample_rate = previous.sample_rate;
        }
        if config.averaged_sample_count == 0 {
            log::warn!("Ignoring averaging depth of zero");
            config.averaged_sample_count = previous.averaged_sample_count;
        }
        if !(config.max_processed_seconds > 0.0
            && config.max_processed_seconds <= MAX_WINDOW_SECONDS)
        {
            log::warn!(
                "Ignoring window length of {} s",
                config.max_processed_seconds
            );
            config.max_processed_seconds = previous.max_processed_seconds;
        }
        if !(config.dead_period_seconds.is_finite() && config.dead_period_seconds >= 0.0) {
            log::warn!(
                "Ignoring dead period of {} s",
                config.dead_period_seconds
            );
            config.dead_period_seconds = previous.dead_period_seconds;
        }

        config
    }
}

fn seconds_to_samples(sample_rate: u32, seconds: f32) -> usize {
    (f64::from(sample_rate) * f64::from(seconds)).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_sizes() {
        let config = AveragingConfig {
            sample_rate: 10_000,
            max_processed_seconds: 1.0,
            dead_period_seconds: 0.005,
            ..Default::default()
        };

        assert_eq!(config.total_window_samples(), 10_000);
        assert_eq!(config.buffer_sample_count(), 5_000);
        assert_eq!(config.dead_period_count(), 50);
    }

    #[test]
    fn test_sanitized_keeps_previous_values() {
        let previous = AveragingConfig::default();
        let requested = AveragingConfig {
            sample_rate: 0,
            averaged_sample_count: 0,
            max_processed_seconds: -1.0,
            dead_period_seconds: f32::NAN,
            trigger_value: Some(-40),
        };

        let config = requested.sanitized(&previous);

        assert_eq!(config.sample_rate, previous.sample_rate);
        assert_eq!(config.averaged_sample_count, previous.averaged_sample_count);
        assert_eq!(config.max_processed_seconds, previous.max_processed_seconds);
        assert_eq!(config.dead_period_seconds, previous.dead_period_seconds);
        assert_eq!(config.trigger_value, Some(-40));
    }

    #[test]
    fn test_window_length_is_bounded() {
        let previous = AveragingConfig::default();
        let requested = AveragingConfig {
            max_processed_seconds: 1e6,
            ..Default::default()
        };
        assert_eq!(
            requested.sanitized(&previous).max_processed_seconds,
            previous.max_processed_seconds
        );

        let longest = AveragingConfig {
            max_processed_seconds: MAX_WINDOW_SECONDS,
            ..Default::default()
        };
        assert_eq!(longest.sanitized(&previous), longest);
        assert!(AveragingConfig {
            max_processed_seconds: f32::INFINITY,
            ..Default::default()
        }
        .sanitized(&previous)
        .max_processed_seconds
        .is_finite());
    }

    #[test]
    fn test_zero_dead_period_is_valid() {
        let requested = AveragingConfig {
            dead_period_seconds: 0.0,
            ..Default::default()
        };
        let config = requested.sanitized(&AveragingConfig::default());

        assert_eq!(config.dead_period_count(), 0);
    }
}
