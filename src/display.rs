//! Snapshot of the acquisition shared with the UI
//!
//! The session listener writes into it on the processing thread; the UI
//! locks it once per frame to draw.

use std::collections::VecDeque;

use spike_scope::acquisition::{CircularSampleBuffer, ControlMessage, SessionOutput};

/// Device events kept for display
const MAX_EVENTS: usize = 32;

pub struct DisplayState {
    pub sample_rate: u32,
    pub channel_count: usize,
    /// Recent samples per channel
    pub traces: Vec<CircularSampleBuffer>,
    pub averaged: Vec<i16>,
    pub selected_channel: usize,
    pub trigger_count: u64,
    pub samples_received: u64,
    pub bytes_overwritten: u64,
    pub hardware: Option<String>,
    /// Device events as (absolute sample index, label)
    pub events: VecDeque<(u64, String)>,
    trace_seconds: f32,
}

impl DisplayState {
    pub fn new(sample_rate: u32, channel_count: usize, trace_seconds: f32) -> Self {
        let mut state = Self {
            sample_rate,
            channel_count,
            traces: Vec::new(),
            averaged: Vec::new(),
            selected_channel: 0,
            trigger_count: 0,
            samples_received: 0,
            bytes_overwritten: 0,
            hardware: None,
            events: VecDeque::new(),
            trace_seconds,
        };
        state.rebuild_traces();
        state
    }

    fn rebuild_traces(&mut self) {
        let len = (self.sample_rate as f32 * self.trace_seconds.max(0.01)) as usize;
        self.traces = (0..self.channel_count.max(1))
            .map(|_| CircularSampleBuffer::new(len))
            .collect();
    }

    /// Change the visible time span; drops what was shown so far
    pub fn set_trace_seconds(&mut self, trace_seconds: f32) {
        if trace_seconds != self.trace_seconds {
            self.trace_seconds = trace_seconds;
            self.rebuild_traces();
        }
    }

    pub fn update(&mut self, output: &SessionOutput<'_>) {
        if output.sample_rate != self.sample_rate || output.channel_count != self.channel_count {
            self.sample_rate = output.sample_rate;
            self.channel_count = output.channel_count;
            self.rebuild_traces();
        }

        let chunk = output.chunk;
        for (channel, trace) in self.traces.iter_mut().enumerate() {
            trace.add(chunk.channel(channel));
        }

        for (index, message) in &chunk.messages {
            match message {
                ControlMessage::Event { label } => {
                    self.events
                        .push_back((self.samples_received + *index as u64, label.clone()));
                    if self.events.len() > MAX_EVENTS {
                        self.events.pop_front();
                    }
                }
                ControlMessage::HardwareType(hardware) => {
                    self.hardware = Some(hardware.name().to_string());
                }
                ControlMessage::SampleRateAndChannelCount { .. } => {}
            }
        }

        self.samples_received += chunk.sample_count() as u64;
        self.averaged.clear();
        self.averaged.extend_from_slice(output.averaged);
        self.selected_channel = output.selected_channel;
        self.trigger_count = output.trigger_count;
        self.bytes_overwritten = output.bytes_overwritten;
    }

    /// Events visible in a trace, indexed relative to the trace start
    pub fn visible_events(&self) -> Vec<(usize, String)> {
        let len = self.traces.first().map_or(0, |t| t.capacity()) as u64;
        let start = self.samples_received.saturating_sub(len);
        // Traces are zero-filled ahead of the first sample
        let offset = len.saturating_sub(self.samples_received);

        self.events
            .iter()
            .filter(|(at, _)| *at >= start)
            .map(|(at, label)| ((at - start + offset) as usize, label.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spike_scope::acquisition::{DecodedChunk, HardwareType};

    fn output<'a>(chunk: &'a DecodedChunk, averaged: &'a [i16], rate: u32) -> SessionOutput<'a> {
        SessionOutput {
            chunk,
            averaged,
            selected_channel: 0,
            sample_rate: rate,
            channel_count: chunk.channel_count(),
            trigger_count: 3,
            triggers_fired: 1,
            bytes_overwritten: 0,
        }
    }

    #[test]
    fn test_update_collects_samples_and_events() {
        let mut state = DisplayState::new(100, 2, 1.0);
        let chunk = DecodedChunk {
            channels: vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]],
            messages: vec![
                (0, ControlMessage::HardwareType(HardwareType::Heart)),
                (
                    2,
                    ControlMessage::Event {
                        label: "4".to_string(),
                    },
                ),
            ],
        };

        state.update(&output(&chunk, &[9, 9], 100));

        assert_eq!(state.samples_received, 4);
        assert_eq!(state.trigger_count, 3);
        assert_eq!(state.averaged, vec![9, 9]);
        assert_eq!(state.hardware.as_deref(), Some("Heart and Brain SpikerBox"));
        assert_eq!(state.traces[1].tail(4), vec![5, 6, 7, 8]);
        // Trace of 100 samples, 4 received: the event sits 2 before the end
        assert_eq!(state.visible_events(), vec![(98, "4".to_string())]);
    }

    #[test]
    fn test_layout_change_rebuilds_traces() {
        let mut state = DisplayState::new(100, 1, 1.0);
        let chunk = DecodedChunk {
            channels: vec![vec![1; 10], vec![2; 10], vec![3; 10]],
            messages: Vec::new(),
        };

        state.update(&output(&chunk, &[], 500));

        assert_eq!(state.traces.len(), 3);
        assert_eq!(state.traces[0].capacity(), 500);
        assert_eq!(state.traces[2].tail(1), vec![3]);
    }
}
