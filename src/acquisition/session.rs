//! Acquisition session
//!
//! Owns one transport and two threads:
//! - a reader thread that pulls bytes from the transport into the byte ring
//!   (optionally teeing them into a raw capture file)
//! - a processing thread that drains the ring, decodes, feeds the selected
//!   channel to the averager and calls the listener
//!
//! Decoder and averager live on the processing thread only. Commands from
//! the owner arrive over a channel and are applied between chunks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::averaging::{AveragingConfig, ThresholdAveragingEngine};

use super::byte_ring::{capacity_for, ByteRing};
use super::decoder::{ByteStreamDecoder, DecodedChunk, SampleScaling};
use super::filter::FilterSettings;
use super::message::ControlMessage;
use super::transport::{Transport, TransportError};

/// Bytes requested from the transport per read
const READ_SIZE: usize = 4096;

/// Idle wait of either thread when there is nothing to do
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Initial session parameters
///
/// The channel count and sample rate are only a starting point: a sample
/// rate / channel count announcement from the device overrides both.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_count: usize,
    pub selected_channel: usize,
    pub averaging: AveragingConfig,
    pub filters: FilterSettings,
    pub scaling: SampleScaling,
    /// Tee raw wire bytes into this file
    pub capture_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_count: 1,
            selected_channel: 0,
            averaging: AveragingConfig::default(),
            filters: FilterSettings::default(),
            scaling: SampleScaling::default(),
            capture_path: None,
        }
    }
}

/// Reconfiguration requests, applied between chunks
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// New averaging parameters; the sample rate stays the device's
    SetAveraging(AveragingConfig),
    /// Average a different channel; restarts the average
    SelectChannel(usize),
    SetFilters(FilterSettings),
    /// Drop all windows and start averaging over
    ResetAverage,
}

/// What the listener sees after every processed chunk
#[derive(Debug)]
pub struct SessionOutput<'a> {
    pub chunk: &'a DecodedChunk,
    pub averaged: &'a [i16],
    pub selected_channel: usize,
    pub sample_rate: u32,
    pub channel_count: usize,
    /// Triggers since the last averager reset
    pub trigger_count: u64,
    /// Triggers recognized in this chunk
    pub triggers_fired: usize,
    pub bytes_overwritten: u64,
}

/// A running acquisition
pub struct AcquisitionSession {
    name: String,
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    commands: Sender<SessionCommand>,
    ring: ByteRing,
    reader: Option<thread::JoinHandle<()>>,
    processor: Option<thread::JoinHandle<()>>,
}

impl AcquisitionSession {
    /// Start reading from `transport`, calling `listener` once per chunk
    ///
    /// The listener runs on the processing thread; a slow listener stalls
    /// processing, and the byte ring then overwrites the oldest input.
    pub fn start<F>(transport: Box<dyn Transport>, config: SessionConfig, listener: F) -> Self
    where
        F: FnMut(&SessionOutput<'_>) + Send + 'static,
    {
        let name = transport.name();
        log::info!("Starting acquisition from {}", name);

        let ring = ByteRing::new(capacity_for(
            config.averaging.sample_rate,
            config.channel_count,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = crossbeam_channel::unbounded();

        let capture = config.capture_path.as_ref().and_then(|path| {
            match File::create(path) {
                Ok(file) => {
                    log::info!("Recording raw capture to {:?}", path);
                    Some(BufWriter::new(file))
                }
                Err(e) => {
                    log::error!("Failed to create capture file {:?}: {}", path, e);
                    None
                }
            }
        });

        let reader = {
            let ring = ring.clone_ref();
            let running = Arc::clone(&running);
            let reader_done = Arc::clone(&reader_done);
            thread::spawn(move || {
                reader_thread(transport, ring, capture, &running);
                reader_done.store(true, Ordering::Release);
            })
        };

        let processor = {
            let ring = ring.clone_ref();
            let running = Arc::clone(&running);
            let finished = Arc::clone(&finished);
            let pipeline = Pipeline::new(&config);
            thread::spawn(move || {
                processing_thread(pipeline, ring, command_rx, listener, &running, &reader_done);
                finished.store(true, Ordering::Release);
            })
        };

        Self {
            name,
            running,
            finished,
            commands,
            ring,
            reader: Some(reader),
            processor: Some(processor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once stopped, or once the transport closed and all its bytes
    /// were processed
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.finished.load(Ordering::Acquire)
    }

    pub fn bytes_overwritten(&self) -> u64 {
        self.ring.bytes_overwritten()
    }

    pub fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Acquisition {} no longer accepts commands", self.name);
        }
    }

    /// Stop both threads; unprocessed bytes, frames and windows are discarded
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        for handle in [self.reader.take(), self.processor.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::error!("Acquisition thread panicked");
            }
        }
        self.ring.clear();
        log::info!("Stopped acquisition from {}", self.name);
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        if self.reader.is_some() || self.processor.is_some() {
            self.stop();
        }
    }
}

fn reader_thread(
    mut transport: Box<dyn Transport>,
    ring: ByteRing,
    mut capture: Option<BufWriter<File>>,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; READ_SIZE];

    while running.load(Ordering::Relaxed) {
        match transport.read(&mut buf) {
            Ok(0) => thread::sleep(IDLE_SLEEP),
            Ok(n) => {
                ring.push(&buf[..n]);
                if let Some(writer) = capture.as_mut() {
                    if let Err(e) = writer.write_all(&buf[..n]) {
                        log::error!("Raw capture write failed, recording stopped: {}", e);
                        capture = None;
                    }
                }
            }
            Err(TransportError::Closed) => {
                log::info!("{} closed", transport.name());
                break;
            }
            Err(e) => {
                log::error!("{} failed: {}", transport.name(), e);
                break;
            }
        }
    }

    if let Some(mut writer) = capture {
        if let Err(e) = writer.flush() {
            log::error!("Failed to flush raw capture: {}", e);
        }
    }
}

fn processing_thread<F>(
    mut pipeline: Pipeline,
    ring: ByteRing,
    commands: Receiver<SessionCommand>,
    mut listener: F,
    running: &AtomicBool,
    reader_done: &AtomicBool,
) where
    F: FnMut(&SessionOutput<'_>),
{
    let mut bytes = Vec::with_capacity(ring.capacity());

    while running.load(Ordering::Relaxed) {
        // Sampled before draining so bytes pushed just before the reader
        // finished are still seen
        let reader_finished = reader_done.load(Ordering::Acquire);

        bytes.clear();
        let drained = ring.drain_into(&mut bytes);

        // Commands sent before these bytes arrived apply to them
        for command in commands.try_iter() {
            pipeline.apply(command);
        }

        if drained == 0 {
            if reader_finished {
                break;
            }
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        pipeline.process(&bytes, ring.bytes_overwritten(), &mut listener);
    }
}

/// Decoder and averager state owned by the processing thread
struct Pipeline {
    decoder: ByteStreamDecoder,
    engine: ThresholdAveragingEngine,
    selected_channel: usize,
}

impl Pipeline {
    fn new(config: &SessionConfig) -> Self {
        let mut decoder =
            ByteStreamDecoder::new(config.channel_count, config.averaging.sample_rate)
                .with_scaling(config.scaling);
        decoder.set_filters(config.filters);

        Self {
            decoder,
            engine: ThresholdAveragingEngine::new(config.averaging),
            selected_channel: config.selected_channel,
        }
    }

    fn apply(&mut self, command: SessionCommand) {
        log::debug!("Session command: {:?}", command);

        match command {
            SessionCommand::SetAveraging(config) => {
                self.engine.apply_config(AveragingConfig {
                    sample_rate: self.decoder.sample_rate(),
                    ..config
                });
            }
            SessionCommand::SelectChannel(channel) => {
                if channel != self.selected_channel {
                    self.selected_channel = channel;
                    self.engine.reset();
                }
            }
            SessionCommand::SetFilters(settings) => self.decoder.set_filters(settings),
            SessionCommand::ResetAverage => self.engine.reset(),
        }
    }

    fn process<F>(&mut self, bytes: &[u8], bytes_overwritten: u64, listener: &mut F)
    where
        F: FnMut(&SessionOutput<'_>),
    {
        let mut channel_count = self.decoder.channel_count();
        let chunk = self.decoder.decode(bytes);

        // Samples ahead of the last effective reconfiguration are not averaged
        let mut feed_from = 0;
        for (index, message) in &chunk.messages {
            match message {
                ControlMessage::SampleRateAndChannelCount {
                    sample_rate,
                    channels,
                } => {
                    log::info!(
                        "Device announced {} Hz, {} channel(s)",
                        sample_rate,
                        channels
                    );
                    let rate_changed =
                        *sample_rate != 0 && *sample_rate != self.engine.config().sample_rate;
                    let layout_changed = *channels != 0 && *channels != channel_count;

                    if rate_changed {
                        self.engine.set_sample_rate(*sample_rate);
                    } else if layout_changed {
                        self.engine.reset();
                    }
                    if layout_changed {
                        channel_count = *channels;
                    }
                    if rate_changed || layout_changed {
                        feed_from = *index;
                    }
                }
                ControlMessage::HardwareType(hardware) => {
                    log::info!("Device hardware type: {}", hardware.name());
                }
                ControlMessage::Event { label } => {
                    log::debug!("Device event {}", label);
                }
            }
        }

        let samples = chunk.channel(self.selected_channel);
        let triggers_fired = self
            .engine
            .process(samples.get(feed_from..).unwrap_or_default());

        listener(&SessionOutput {
            chunk: &chunk,
            averaged: self.engine.averaged_samples(),
            selected_channel: self.selected_channel,
            sample_rate: self.decoder.sample_rate(),
            channel_count: self.decoder.channel_count(),
            trigger_count: self.engine.trigger_count(),
            triggers_fired,
            bytes_overwritten,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::decoder::{encode_frame, encode_message};
    use crate::acquisition::transport::{FileTransport, SyntheticTransport};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Transport fed from a channel; closes when the sender is dropped
    struct ChannelTransport {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Transport for ChannelTransport {
        fn name(&self) -> String {
            "channel".to_string()
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            if self.pending.is_empty() {
                match self.rx.try_recv() {
                    Ok(bytes) => self.pending = bytes,
                    Err(crossbeam_channel::TryRecvError::Empty) => return Ok(0),
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        return Err(TransportError::Closed)
                    }
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[derive(Debug, Default)]
    struct Observed {
        samples: usize,
        messages: Vec<ControlMessage>,
        trigger_count: u64,
        sample_rate: u32,
        channel_count: usize,
        averaged: Vec<i16>,
    }

    fn observing_listener(
        observed: &Arc<Mutex<Observed>>,
    ) -> impl FnMut(&SessionOutput<'_>) + Send + 'static {
        let observed = Arc::clone(observed);
        move |output: &SessionOutput<'_>| {
            let mut o = observed.lock().unwrap();
            o.samples += output.chunk.sample_count();
            o.messages
                .extend(output.chunk.messages.iter().map(|(_, m)| m.clone()));
            o.trigger_count = output.trigger_count;
            o.sample_rate = output.sample_rate;
            o.channel_count = output.channel_count;
            o.averaged = output.averaged.to_vec();
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn averaging(trigger_value: Option<i32>) -> AveragingConfig {
        AveragingConfig {
            sample_rate: 10_000,
            averaged_sample_count: 8,
            max_processed_seconds: 0.2,
            dead_period_seconds: 0.1,
            trigger_value,
        }
    }

    /// Raw frames of one channel: baseline with a pulse every `period`
    fn pulse_frames(count: usize, period: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|i| {
                let value = if i % period == period / 2 { 812 } else { 512 };
                encode_frame(&[value])
            })
            .collect()
    }

    fn pipeline_at(rate: u32) -> Pipeline {
        Pipeline::new(&SessionConfig {
            averaging: AveragingConfig {
                sample_rate: rate,
                ..averaging(Some(3_000))
            },
            ..Default::default()
        })
    }

    fn feed(pipeline: &mut Pipeline, bytes: &[u8]) -> u64 {
        let mut trigger_count = 0;
        pipeline.process(bytes, 0, &mut |output: &SessionOutput<'_>| {
            trigger_count = output.trigger_count;
        });
        trigger_count
    }

    #[test]
    fn test_channel_count_change_resets_average() {
        let mut pipeline = pipeline_at(1_000);

        let mut bytes = encode_message("MSF:1000;MNC:1;");
        bytes.extend(pulse_frames(300, 100));
        assert_eq!(feed(&mut pipeline, &bytes), 3);

        let mut bytes = encode_message("MSF:1000;MNC:2;");
        bytes.extend(encode_frame(&[512, 512]));
        assert_eq!(feed(&mut pipeline, &bytes), 0);
        assert_eq!(pipeline.engine.completed_windows(), 0);
        assert_eq!(pipeline.engine.in_flight_windows(), 0);
    }

    #[test]
    fn test_samples_before_rate_change_are_not_averaged() {
        let mut pipeline = pipeline_at(1_000);

        let mut bytes = pulse_frames(300, 100);
        bytes.extend(encode_message("MSF:2000;MNC:1;"));
        bytes.extend(pulse_frames(10, 100));
        assert_eq!(feed(&mut pipeline, &bytes), 0);
        assert_eq!(pipeline.engine.total_window_samples(), 400);

        // An announcement that changes nothing keeps the chunk whole;
        // pulses 250 apart clear the 200 sample dead period
        let mut bytes = encode_message("MSF:2000;MNC:1;");
        bytes.extend(pulse_frames(750, 250));
        assert_eq!(feed(&mut pipeline, &bytes), 3);
    }

    #[test]
    fn test_replayed_synthetic_capture() {
        let rate = 1_000;
        let frames = 10_000;
        let announcement = encode_message("HWT:HEARTSS;").len()
            + encode_message(&format!("MSF:{};MNC:1;", rate)).len();
        let wanted = announcement + 2 * frames;

        let mut synthetic = SyntheticTransport::new(rate, 1)
            .with_beats_per_minute(120.0)
            .unpaced();
        let mut bytes = Vec::new();
        let mut buf = vec![0u8; 4096];
        while bytes.len() < wanted {
            let want = (wanted - bytes.len()).min(buf.len());
            let n = synthetic.read(&mut buf[..want]).unwrap();
            bytes.extend_from_slice(&buf[..n]);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, &bytes).unwrap();

        let observed = Arc::new(Mutex::new(Observed::default()));
        let config = SessionConfig {
            // Deliberately wrong; the announcement corrects both
            channel_count: 2,
            averaging: averaging(Some(3_000)),
            ..Default::default()
        };
        let mut session = AcquisitionSession::start(
            Box::new(FileTransport::open(&path).unwrap()),
            config,
            observing_listener(&observed),
        );
        wait_until(|| !session.is_running());
        session.stop();

        let o = observed.lock().unwrap();
        assert_eq!(o.samples, frames);
        assert_eq!(o.sample_rate, rate);
        assert_eq!(o.channel_count, 1);
        assert!(o
            .messages
            .contains(&ControlMessage::SampleRateAndChannelCount {
                sample_rate: rate,
                channels: 1
            }));

        // One beat every 500 samples, first at 250
        assert_eq!(o.trigger_count, 20);

        // 0.2 s at the announced rate; crossing lands at 100, peak shortly after
        assert_eq!(o.averaged.len(), 200);
        let (peak_at, &peak) = o
            .averaged
            .iter()
            .enumerate()
            .max_by_key(|&(_, &v)| v)
            .unwrap();
        assert!((100..=110).contains(&peak_at), "peak at {}", peak_at);
        assert!(peak > 5_000, "peak {}", peak);
    }

    #[test]
    fn test_commands_apply_between_chunks() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = ChannelTransport {
            rx,
            pending: Vec::new(),
        };
        let observed = Arc::new(Mutex::new(Observed::default()));
        let config = SessionConfig {
            averaging: AveragingConfig {
                sample_rate: 1_000,
                ..averaging(None)
            },
            ..Default::default()
        };
        let mut session =
            AcquisitionSession::start(Box::new(transport), config, observing_listener(&observed));

        tx.send(pulse_frames(1_000, 250)).unwrap();
        wait_until(|| observed.lock().unwrap().samples == 1_000);
        assert_eq!(observed.lock().unwrap().trigger_count, 0);

        session.send(SessionCommand::SetAveraging(AveragingConfig {
            sample_rate: 1_000,
            ..averaging(Some(3_000))
        }));
        tx.send(pulse_frames(1_000, 250)).unwrap();
        wait_until(|| observed.lock().unwrap().samples == 2_000);
        assert_eq!(observed.lock().unwrap().trigger_count, 4);

        session.send(SessionCommand::ResetAverage);
        tx.send(encode_frame(&[512])).unwrap();
        wait_until(|| observed.lock().unwrap().samples == 2_001);
        assert_eq!(observed.lock().unwrap().trigger_count, 0);

        drop(tx);
        wait_until(|| !session.is_running());
        session.stop();
    }

    #[test]
    fn test_stop_ends_endless_source() {
        let observed = Arc::new(Mutex::new(Observed::default()));
        let mut session = AcquisitionSession::start(
            Box::new(SyntheticTransport::new(10_000, 1)),
            SessionConfig::default(),
            observing_listener(&observed),
        );
        wait_until(|| observed.lock().unwrap().samples > 0);
        assert!(session.is_running());

        session.stop();
        assert!(!session.is_running());

        let seen = observed.lock().unwrap().samples;
        thread::sleep(Duration::from_millis(20));
        assert_eq!(observed.lock().unwrap().samples, seen);
    }

    #[test]
    fn test_raw_capture_records_input() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = ChannelTransport {
            rx,
            pending: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");
        let config = SessionConfig {
            capture_path: Some(path.clone()),
            ..Default::default()
        };
        let observed = Arc::new(Mutex::new(Observed::default()));
        let mut session =
            AcquisitionSession::start(Box::new(transport), config, observing_listener(&observed));

        let mut sent = encode_message("EVNT:3;");
        sent.extend(pulse_frames(300, 100));
        tx.send(sent.clone()).unwrap();
        drop(tx);

        wait_until(|| !session.is_running());
        session.stop();

        assert_eq!(std::fs::read(&path).unwrap(), sent);
        let o = observed.lock().unwrap();
        assert_eq!(o.samples, 300);
        assert_eq!(
            o.messages,
            vec![ControlMessage::Event {
                label: "3".to_string()
            }]
        );
    }
}
