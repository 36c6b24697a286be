//! Byte stream decoder for the acquisition board's serial protocol
//!
//! The wire format is a sequence of two-byte samples, one per channel, grouped
//! into frames:
//!
//! ```text
//! MSB: 1hhhhhhh   LSB: 0lllllll   value = hhhhhhh << 7 | lllllll  (14 bit)
//! ```
//!
//! ASCII control messages are spliced into the stream between escape
//! sequences:
//!
//! ```text
//! FF FF 01 01 80 FF  <message bytes>  FF FF 01 01 81 FF
//! ```
//!
//! `FF FF` can never occur in sample data (an MSB is always followed by a byte
//! with the high bit clear), so bytes matching the start of the opening marker
//! are held back and only handed to the sample path once the match fails.
//!
//! Malformed input never produces an error. A high bit on an LSB drops the
//! frame being assembled and that byte becomes the channel 0 MSB of a new
//! frame; an unterminated message is dropped after [`MAX_MESSAGE_LEN`] bytes.

use super::filter::{ChannelFilter, FilterSettings};
use super::message::ControlMessage;

/// Opening escape sequence
pub const ESCAPE_START: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x80, 0xFF];

/// Closing escape sequence
pub const ESCAPE_END: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x81, 0xFF];

/// Bytes buffered inside an escape sequence before giving up on it
pub const MAX_MESSAGE_LEN: usize = 64;

/// Smoothing factor of the per-channel DC offset tracker
pub const DC_OFFSET_ALPHA: f32 = 1e-4;

const HIGH_BIT: u8 = 0x80;
const LOW_BITS: u8 = 0x7F;

/// Position of the decoder relative to escape sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeState {
    Idle,
    /// The last `n` bytes match the start of [`ESCAPE_START`]
    MatchingStart(usize),
    InMessage,
    /// The last `n` message bytes match the start of [`ESCAPE_END`]
    MatchingEnd(usize),
}

/// Mapping from raw 14-bit values to centered sample units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleScaling {
    /// Raw value mapped to zero
    pub center: i32,
    pub gain: f32,
}

impl Default for SampleScaling {
    fn default() -> Self {
        Self {
            center: 512,
            gain: 30.0,
        }
    }
}

/// Output of one [`ByteStreamDecoder::decode`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedChunk {
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<i16>>,
    /// Control messages with the number of frames decoded before them
    pub messages: Vec<(usize, ControlMessage)>,
}

impl DecodedChunk {
    fn with_channels(channel_count: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channel_count],
            messages: Vec::new(),
        }
    }

    /// Frames decoded in this chunk
    pub fn sample_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples of one channel; empty when the channel does not exist
    pub fn channel(&self, index: usize) -> &[i16] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Msb,
    /// Holding the MSB of the current sample
    Lsb(u8),
}

/// Streaming decoder; keeps parser, offset and filter state across calls
#[derive(Debug)]
pub struct ByteStreamDecoder {
    channel_count: usize,
    sample_rate: u32,
    scaling: SampleScaling,
    filter_settings: FilterSettings,

    escape: EscapeState,
    /// Bytes matching a prefix of the opening marker
    held: Vec<u8>,
    message: Vec<u8>,

    expect: Expect,
    /// Raw values of the frame being assembled
    frame: Vec<u16>,
    dc_offsets: Vec<f32>,
    filters: Vec<ChannelFilter>,

    frames_decoded: u64,
    frames_dropped: u64,
    messages_dropped: u64,
}

impl ByteStreamDecoder {
    pub fn new(channel_count: usize, sample_rate: u32) -> Self {
        let channel_count = channel_count.max(1);
        let filter_settings = FilterSettings::default();

        Self {
            channel_count,
            sample_rate: sample_rate.max(1),
            scaling: SampleScaling::default(),
            filter_settings,
            escape: EscapeState::Idle,
            held: Vec::with_capacity(ESCAPE_START.len()),
            message: Vec::with_capacity(MAX_MESSAGE_LEN + 1),
            expect: Expect::Msb,
            frame: Vec::with_capacity(channel_count),
            dc_offsets: vec![0.0; channel_count],
            filters: vec![ChannelFilter::default(); channel_count],
            frames_decoded: 0,
            frames_dropped: 0,
            messages_dropped: 0,
        }
    }

    pub fn with_scaling(mut self, scaling: SampleScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn escape_state(&self) -> EscapeState {
        self.escape
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Frames thrown away by resynchronization
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Escape sequences abandoned for exceeding the length limit
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }

    /// Change the channel count, discarding the frame in flight
    ///
    /// Zero is ignored.
    pub fn set_channel_count(&mut self, channel_count: usize) {
        if channel_count == 0 {
            log::warn!("Ignoring channel count of zero");
            return;
        }
        if channel_count == self.channel_count {
            return;
        }

        log::info!(
            "Decoder channel count {} -> {}",
            self.channel_count,
            channel_count
        );
        self.channel_count = channel_count;
        self.reset_frame_state();
    }

    /// Change the sample rate used by the filters
    ///
    /// Zero is ignored.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == 0 {
            log::warn!("Ignoring sample rate of zero");
            return;
        }
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.rebuild_filters();
        }
    }

    pub fn set_filters(&mut self, settings: FilterSettings) {
        self.filter_settings = settings;
        self.rebuild_filters();
    }

    /// Forget everything, including a partially received message
    pub fn reset(&mut self) {
        self.escape = EscapeState::Idle;
        self.held.clear();
        self.message.clear();
        self.reset_frame_state();
    }

    fn reset_frame_state(&mut self) {
        self.expect = Expect::Msb;
        self.frame.clear();
        self.dc_offsets = vec![0.0; self.channel_count];
        self.rebuild_filters();
    }

    fn rebuild_filters(&mut self) {
        let filter = ChannelFilter::new(&self.filter_settings, self.sample_rate);
        self.filters = vec![filter; self.channel_count];
    }

    /// Decode a chunk of raw bytes
    pub fn decode(&mut self, bytes: &[u8]) -> DecodedChunk {
        let mut out = DecodedChunk::with_channels(self.channel_count);
        for &byte in bytes {
            self.push_byte(byte, &mut out);
        }
        out
    }

    fn push_byte(&mut self, byte: u8, out: &mut DecodedChunk) {
        match self.escape {
            EscapeState::Idle | EscapeState::MatchingStart(_) => self.scan_for_start(byte, out),
            EscapeState::InMessage | EscapeState::MatchingEnd(_) => self.buffer_message(byte, out),
        }
    }

    fn scan_for_start(&mut self, byte: u8, out: &mut DecodedChunk) {
        self.held.push(byte);

        if ESCAPE_START.starts_with(&self.held) {
            if self.held.len() == ESCAPE_START.len() {
                self.held.clear();
                self.message.clear();
                self.escape = EscapeState::InMessage;
            } else {
                self.escape = EscapeState::MatchingStart(self.held.len());
            }
            return;
        }

        // Hand bytes to the sample path until what is left could still open a marker
        let held = std::mem::take(&mut self.held);
        let keep_from = (0..=held.len())
            .find(|&start| ESCAPE_START.starts_with(&held[start..]))
            .unwrap_or(held.len());
        for &b in &held[..keep_from] {
            self.decode_sample_byte(b, out);
        }
        self.held = held[keep_from..].to_vec();

        self.escape = if self.held.is_empty() {
            EscapeState::Idle
        } else {
            EscapeState::MatchingStart(self.held.len())
        };
    }

    fn buffer_message(&mut self, byte: u8, out: &mut DecodedChunk) {
        self.message.push(byte);

        let matched = marker_overlap(&self.message, &ESCAPE_END);
        if matched == ESCAPE_END.len() {
            let text_len = self.message.len() - ESCAPE_END.len();
            let text = String::from_utf8_lossy(&self.message[..text_len]).into_owned();
            self.message.clear();
            self.escape = EscapeState::Idle;
            self.handle_message(&text, out);
        } else if self.message.len() > MAX_MESSAGE_LEN {
            log::debug!(
                "Dropping unterminated escape sequence after {} bytes",
                self.message.len()
            );
            self.messages_dropped += 1;
            self.message.clear();
            self.escape = EscapeState::Idle;
        } else if matched > 0 {
            self.escape = EscapeState::MatchingEnd(matched);
        } else {
            self.escape = EscapeState::InMessage;
        }
    }

    fn handle_message(&mut self, text: &str, out: &mut DecodedChunk) {
        let Some(message) = ControlMessage::parse(text) else {
            log::debug!("Ignoring unrecognized control message {:?}", text);
            return;
        };

        log::debug!("Control message: {:?}", message);

        if let ControlMessage::SampleRateAndChannelCount {
            sample_rate,
            channels,
        } = message
        {
            self.set_sample_rate(sample_rate);
            if channels != self.channel_count {
                self.set_channel_count(channels);
                // Samples decoded under the old layout cannot be merged with the new one
                *out = DecodedChunk {
                    channels: vec![Vec::new(); self.channel_count],
                    messages: out.messages.drain(..).map(|(_, m)| (0, m)).collect(),
                };
            }
        }

        out.messages.push((out.sample_count(), message));
    }

    fn decode_sample_byte(&mut self, byte: u8, out: &mut DecodedChunk) {
        let high_bit = byte & HIGH_BIT != 0;

        match (self.expect, high_bit) {
            (Expect::Msb, true) => self.expect = Expect::Lsb(byte),
            // Low byte where a sample should start: wait for the next MSB
            (Expect::Msb, false) => {}
            // The offending byte is an MSB candidate: it opens a fresh frame at channel 0
            (Expect::Lsb(_), true) => {
                log::trace!("Malformed LSB {:#04x}, dropping frame", byte);
                self.frames_dropped += 1;
                self.frame.clear();
                self.expect = Expect::Lsb(byte);
            }
            (Expect::Lsb(msb), false) => {
                let value = u16::from(msb & LOW_BITS) << 7 | u16::from(byte & LOW_BITS);
                self.frame.push(value);
                self.expect = Expect::Msb;

                if self.frame.len() == self.channel_count {
                    self.commit_frame(out);
                }
            }
        }
    }

    fn commit_frame(&mut self, out: &mut DecodedChunk) {
        for (channel, &raw) in self.frame.iter().enumerate() {
            let centered = (i32::from(raw) - self.scaling.center) as f32 * self.scaling.gain;

            let offset = &mut self.dc_offsets[channel];
            *offset += DC_OFFSET_ALPHA * (centered - *offset);
            let corrected = self.filters[channel].process(centered - *offset);

            out.channels[channel].push(saturate(corrected));
        }

        self.frame.clear();
        self.frames_decoded += 1;
    }
}

fn saturate(value: f32) -> i16 {
    value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Length of the longest tail of `buffer` that is a head of `marker`
fn marker_overlap(buffer: &[u8], marker: &[u8]) -> usize {
    (1..=marker.len().min(buffer.len()))
        .rev()
        .find(|&n| buffer.ends_with(&marker[..n]))
        .unwrap_or(0)
}

/// Encode one frame of raw 14-bit values in wire format
pub fn encode_frame(values: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 2);
    for &value in values {
        let value = value & 0x3FFF;
        bytes.push(HIGH_BIT | (value >> 7) as u8);
        bytes.push((value as u8) & LOW_BITS);
    }
    bytes
}

/// Wrap a control message in escape sequences
pub fn encode_message(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + ESCAPE_START.len() + ESCAPE_END.len());
    bytes.extend_from_slice(&ESCAPE_START);
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(&ESCAPE_END);
    bytes
}
