//! Optional per-channel filtering
//!
//! Biquad sections (RBJ cookbook coefficients, Direct Form II Transposed)
//! chained per channel: mains notch, high-pass, low-pass. Filtering runs after
//! DC removal, on the centered signal.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

/// Mains frequency to notch out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotchFrequency {
    Hz50,
    Hz60,
}

impl NotchFrequency {
    pub fn hz(self) -> f32 {
        match self {
            Self::Hz50 => 50.0,
            Self::Hz60 => 60.0,
        }
    }
}

/// Which filters to run; all off by default
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub notch: Option<NotchFrequency>,
    pub high_pass_hz: Option<f32>,
    pub low_pass_hz: Option<f32>,
}

impl FilterSettings {
    pub fn is_empty(&self) -> bool {
        self.notch.is_none() && self.high_pass_hz.is_none() && self.low_pass_hz.is_none()
    }
}

const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;
const NOTCH_Q: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    /// Normalize raw cookbook coefficients by `a0`
    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    fn low_pass(cutoff: f32, sample_rate: f32) -> Self {
        let (cos, alpha) = omega(cutoff, sample_rate, BUTTERWORTH_Q);
        Self::normalized(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn high_pass(cutoff: f32, sample_rate: f32) -> Self {
        let (cos, alpha) = omega(cutoff, sample_rate, BUTTERWORTH_Q);
        Self::normalized(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn notch(center: f32, sample_rate: f32) -> Self {
        let (cos, alpha) = omega(center, sample_rate, NOTCH_Q);
        Self::normalized(1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }
}

fn omega(frequency: f32, sample_rate: f32, q: f32) -> (f32, f32) {
    let w0 = 2.0 * PI * frequency / sample_rate;
    (w0.cos(), w0.sin() / (2.0 * q))
}

#[derive(Debug, Clone)]
struct Biquad {
    coeffs: Coefficients,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn new(coeffs: Coefficients) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let c = &self.coeffs;
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }
}

/// Filter chain for one channel
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    sections: Vec<Biquad>,
}

impl ChannelFilter {
    /// Build the chain for `settings` at `sample_rate`
    ///
    /// Cutoffs at or above Nyquist, or not positive, are skipped.
    pub fn new(settings: &FilterSettings, sample_rate: u32) -> Self {
        let rate = sample_rate as f32;
        let nyquist = rate / 2.0;
        let usable = |hz: f32| hz > 0.0 && hz < nyquist;

        let mut sections = Vec::new();
        if let Some(notch) = settings.notch {
            if usable(notch.hz()) {
                sections.push(Biquad::new(Coefficients::notch(notch.hz(), rate)));
            }
        }
        if let Some(hz) = settings.high_pass_hz.filter(|&hz| usable(hz)) {
            sections.push(Biquad::new(Coefficients::high_pass(hz, rate)));
        }
        if let Some(hz) = settings.low_pass_hz.filter(|&hz| usable(hz)) {
            sections.push(Biquad::new(Coefficients::low_pass(hz, rate)));
        }

        Self { sections }
    }

    pub fn is_passthrough(&self) -> bool {
        self.sections.is_empty()
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        self.sections
            .iter_mut()
            .fold(input, |acc, section| section.process(acc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn peak_after_settling(filter: &mut ChannelFilter, input: &[f32]) -> f32 {
        let settle = input.len() / 2;
        input
            .iter()
            .enumerate()
            .map(|(i, &x)| (i, filter.process(x)))
            .filter(|(i, _)| *i >= settle)
            .map(|(_, y)| y.abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_default_is_passthrough() {
        let mut filter = ChannelFilter::new(&FilterSettings::default(), 10_000);
        assert!(filter.is_passthrough());
        assert_eq!(filter.process(123.0), 123.0);
    }

    #[test]
    fn test_notch_removes_mains() {
        let settings = FilterSettings {
            notch: Some(NotchFrequency::Hz60),
            ..Default::default()
        };
        let mut filter = ChannelFilter::new(&settings, 10_000);
        let hum = sine(60.0, 10_000, 20_000, 1000.0);

        assert!(peak_after_settling(&mut filter, &hum) < 50.0);
    }

    #[test]
    fn test_notch_passes_other_frequencies() {
        let settings = FilterSettings {
            notch: Some(NotchFrequency::Hz50),
            ..Default::default()
        };
        let mut filter = ChannelFilter::new(&settings, 10_000);
        let tone = sine(1000.0, 10_000, 20_000, 1000.0);

        assert!(peak_after_settling(&mut filter, &tone) > 900.0);
    }

    #[test]
    fn test_low_pass_attenuates_high_frequencies() {
        let settings = FilterSettings {
            low_pass_hz: Some(100.0),
            ..Default::default()
        };
        let mut filter = ChannelFilter::new(&settings, 10_000);
        let tone = sine(3000.0, 10_000, 10_000, 1000.0);

        assert!(peak_after_settling(&mut filter, &tone) < 10.0);
    }

    #[test]
    fn test_high_pass_removes_constant() {
        let settings = FilterSettings {
            high_pass_hz: Some(10.0),
            ..Default::default()
        };
        let mut filter = ChannelFilter::new(&settings, 1_000);
        let constant = vec![500.0; 5_000];

        assert!(peak_after_settling(&mut filter, &constant) < 1.0);
    }

    #[test]
    fn test_cutoff_above_nyquist_is_skipped() {
        let settings = FilterSettings {
            low_pass_hz: Some(8_000.0),
            ..Default::default()
        };
        assert!(ChannelFilter::new(&settings, 10_000).is_passthrough());
    }
}
