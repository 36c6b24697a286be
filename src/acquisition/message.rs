//! Control messages embedded in the sample stream
//!
//! The device interleaves short ASCII messages with sample data, delimited by
//! escape sequences. Once the decoder has cut a message out of the stream,
//! [`ControlMessage::parse`] classifies it:
//!
//! - `HWT:<NAME>;` identifies the board
//! - `MSF:<rate>;MNC:<channels>;` announces sample rate and channel count
//! - `EVNT:<id>;` marks an event at the current sample position

use serde::{Deserialize, Serialize};

const HARDWARE_PREFIX: &str = "HWT:";
const SAMPLE_RATE_PREFIX: &str = "MSF:";
const CHANNEL_COUNT_PREFIX: &str = "MNC:";
const EVENT_PREFIX: &str = "EVNT:";

/// Board family reported by `HWT:`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareType {
    Plant,
    Muscle,
    Heart,
    Neuron,
    HumanHuman,
    Unknown(String),
}

impl HardwareType {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "PLANTSS" => Self::Plant,
            "MUSCLESS" | "MUSCLEUSB" => Self::Muscle,
            "HEARTSS" | "HEARTUSB" => Self::Heart,
            "NEURONSS" | "NEURONUSB" => Self::Neuron,
            "HHIBOX" => Self::HumanHuman,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Plant => "Plant SpikerBox",
            Self::Muscle => "Muscle SpikerBox",
            Self::Heart => "Heart and Brain SpikerBox",
            Self::Neuron => "Neuron SpikerBox",
            Self::HumanHuman => "Human-Human Interface",
            Self::Unknown(name) => name.as_str(),
        }
    }
}

/// A classified control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    HardwareType(HardwareType),
    SampleRateAndChannelCount { sample_rate: u32, channels: usize },
    Event { label: String },
}

impl ControlMessage {
    /// Classify the text between a start and an end escape sequence
    ///
    /// Returns `None` for text that matches no known message or carries
    /// unparsable numbers.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if text.contains(SAMPLE_RATE_PREFIX) && text.contains(CHANNEL_COUNT_PREFIX) {
            let sample_rate = field_after(text, SAMPLE_RATE_PREFIX)?.parse().ok()?;
            let channels = field_after(text, CHANNEL_COUNT_PREFIX)?.parse().ok()?;
            if sample_rate == 0 || channels == 0 {
                return None;
            }
            return Some(Self::SampleRateAndChannelCount {
                sample_rate,
                channels,
            });
        }

        if let Some(rest) = text.strip_prefix(HARDWARE_PREFIX) {
            let name = rest.split(';').next().unwrap_or_default();
            return Some(Self::HardwareType(HardwareType::from_name(name)));
        }

        if let Some(rest) = text.strip_prefix(EVENT_PREFIX) {
            let label = rest.split(';').next().unwrap_or_default().trim();
            return Some(Self::Event {
                label: label.to_string(),
            });
        }

        None
    }
}

/// Digits following `prefix`, up to the first non-digit
fn field_after<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let start = text.find(prefix)? + prefix.len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_type() {
        assert_eq!(
            ControlMessage::parse("HWT:PLANTSS;"),
            Some(ControlMessage::HardwareType(HardwareType::Plant))
        );
        assert_eq!(
            ControlMessage::parse("HWT:MUSCLEUSB;"),
            Some(ControlMessage::HardwareType(HardwareType::Muscle))
        );
        assert_eq!(
            ControlMessage::parse("HWT:PROTO7;"),
            Some(ControlMessage::HardwareType(HardwareType::Unknown(
                "PROTO7".to_string()
            )))
        );
    }

    #[test]
    fn test_sample_rate_and_channels() {
        let expected = Some(ControlMessage::SampleRateAndChannelCount {
            sample_rate: 10_000,
            channels: 2,
        });
        assert_eq!(ControlMessage::parse("MSF:10000;MNC:2;"), expected);
        assert_eq!(ControlMessage::parse("MSF:10000MNC:2;"), expected);
        assert_eq!(ControlMessage::parse("MNC:2;MSF:10000;"), expected);
    }

    #[test]
    fn test_config_requires_both_fields() {
        assert_eq!(ControlMessage::parse("MSF:10000;"), None);
        assert_eq!(ControlMessage::parse("MSF:;MNC:2;"), None);
        assert_eq!(ControlMessage::parse("MSF:10000;MNC:0;"), None);
    }

    #[test]
    fn test_event() {
        assert_eq!(
            ControlMessage::parse("EVNT:3;"),
            Some(ControlMessage::Event {
                label: "3".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_text() {
        assert_eq!(ControlMessage::parse("hello"), None);
        assert_eq!(ControlMessage::parse(""), None);
    }
}
