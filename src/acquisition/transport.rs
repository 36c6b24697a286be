//! Byte sources for an acquisition session
//!
//! A transport hands out raw wire bytes with no alignment guarantee. The
//! session's reader thread polls it in a loop: `Ok(0)` means nothing is
//! available right now, `Err(TransportError::Closed)` ends the stream.

use std::f32::consts::PI;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::decoder::{encode_frame, encode_message};

/// Baud rate of the SpikerBox family of serial devices
pub const DEFAULT_BAUD_RATE: u32 = 230_400;

/// Serial read timeout; a timeout reads as "no data"
const SERIAL_TIMEOUT: Duration = Duration::from_millis(10);

/// How long a paced transport waits when its byte budget is exhausted
const PACING_SLEEP: Duration = Duration::from_millis(5);

/// Errors that can occur while reading from a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Transport closed")]
    Closed,
}

/// Source of raw wire bytes
pub trait Transport: Send {
    /// Human readable description for logs and the status line
    fn name(&self) -> String;

    /// Read whatever is available into `buf`
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Names of the serial ports present on this machine
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Serial/USB connection to the acquisition hardware
pub struct SerialTransport {
    path: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        log::info!("Opened serial port {} at {} baud", path, baud_rate);

        Ok(Self {
            path: path.to_string(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        format!("Serial {}", self.path)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Limits delivery to a fixed byte rate measured from the first read
#[derive(Debug)]
struct Pacer {
    bytes_per_second: Option<f64>,
    started: Option<Instant>,
    delivered: u64,
}

impl Pacer {
    fn new(bytes_per_second: Option<usize>) -> Self {
        Self {
            bytes_per_second: bytes_per_second.map(|b| b as f64),
            started: None,
            delivered: 0,
        }
    }

    /// How many of `wanted` bytes may go out now; sleeps briefly when none
    fn budget(&mut self, wanted: usize) -> usize {
        let Some(rate) = self.bytes_per_second else {
            return wanted;
        };

        let started = *self.started.get_or_insert_with(Instant::now);
        let due = (started.elapsed().as_secs_f64() * rate) as u64;
        let allowed = due.saturating_sub(self.delivered).min(wanted as u64) as usize;
        if allowed == 0 {
            thread::sleep(PACING_SLEEP);
        }
        allowed
    }

    fn consumed(&mut self, n: usize) {
        self.delivered += n as u64;
    }
}

/// Replays a raw byte capture of the wire stream
pub struct FileTransport {
    path: PathBuf,
    file: File,
    pacer: Pacer,
    looping: bool,
}

impl FileTransport {
    /// Open a capture for replay as fast as the session drains it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        log::info!("Replaying capture {:?}", path);

        Ok(Self {
            path,
            file,
            pacer: Pacer::new(None),
            looping: false,
        })
    }

    /// Deliver at the wire rate of `sample_rate` x `channels`
    pub fn paced(mut self, sample_rate: u32, channels: usize) -> Self {
        self.pacer = Pacer::new(Some(sample_rate as usize * channels.max(1) * 2));
        self
    }

    /// Start over at the end of the file instead of closing
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

impl Transport for FileTransport {
    fn name(&self) -> String {
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "capture".to_string());
        format!("File {}", filename)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let budget = self.pacer.budget(buf.len());
        if budget == 0 {
            return Ok(0);
        }

        let n = self.file.read(&mut buf[..budget])?;
        if n == 0 {
            if !self.looping {
                log::info!("End of capture {:?}", self.path);
                return Err(TransportError::Closed);
            }
            self.file.seek(SeekFrom::Start(0))?;
            log::debug!("Capture {:?} looped", self.path);
            return Ok(0);
        }

        self.pacer.consumed(n);
        Ok(n)
    }
}

/// Simulated device producing a heartbeat-like signal in wire format
///
/// The stream opens with a hardware type and a sample rate / channel count
/// announcement. Every channel carries the same beat with a per-channel
/// amplitude, on top of a little mains hum. An `EVNT` message follows every
/// `event_every` beats when enabled.
pub struct SyntheticTransport {
    sample_rate: u32,
    channels: usize,
    beats_per_minute: f32,
    event_every: Option<u64>,
    pacer: Pacer,

    pending: Vec<u8>,
    cursor: usize,
    sample_index: u64,
    beats: u64,
    announced: bool,
}

/// Raw value of the signal baseline
const SYNTHETIC_BASELINE: f32 = 512.0;
/// Peak height of a beat in raw units above the baseline
const SYNTHETIC_AMPLITUDE: f32 = 300.0;
/// Raw amplitude of the hum riding on the baseline
const SYNTHETIC_HUM: f32 = 4.0;
/// Width of the beat pulse in seconds
const SYNTHETIC_PULSE_WIDTH: f32 = 0.004;

impl SyntheticTransport {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let sample_rate = sample_rate.max(1);
        let channels = channels.max(1);

        Self {
            sample_rate,
            channels,
            beats_per_minute: 72.0,
            event_every: None,
            pacer: Pacer::new(Some(sample_rate as usize * channels * 2)),
            pending: Vec::new(),
            cursor: 0,
            sample_index: 0,
            beats: 0,
            announced: false,
        }
    }

    pub fn with_beats_per_minute(mut self, beats_per_minute: f32) -> Self {
        if beats_per_minute > 0.0 {
            self.beats_per_minute = beats_per_minute;
        }
        self
    }

    pub fn with_event_every(mut self, beats: u64) -> Self {
        self.event_every = (beats > 0).then_some(beats);
        self
    }

    /// Produce bytes as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.pacer = Pacer::new(None);
        self
    }

    fn beat_period(&self) -> u64 {
        ((self.sample_rate as f32 * 60.0 / self.beats_per_minute) as u64).max(1)
    }

    /// Raw 14-bit value of channel `channel` at sample `n`
    fn raw_value(&self, n: u64, channel: usize) -> u16 {
        let rate = self.sample_rate as f32;
        let t = n as f32 / rate;
        let hum = SYNTHETIC_HUM * (2.0 * PI * 50.0 * t).sin();

        let period = self.beat_period();
        let center = period / 2;
        let offset = (n % period) as f32 - center as f32;
        let width = SYNTHETIC_PULSE_WIDTH * rate;
        let pulse = SYNTHETIC_AMPLITUDE * (-(offset / width).powi(2)).exp();
        let scale = 1.0 / (channel + 1) as f32;

        (SYNTHETIC_BASELINE + hum + pulse * scale)
            .round()
            .clamp(0.0, 16383.0) as u16
    }

    /// Append one frame (and any message due before it) to `pending`
    fn generate_frame(&mut self) {
        let n = self.sample_index;
        let period = self.beat_period();

        if n % period == 0 && n > 0 {
            self.beats += 1;
            if let Some(every) = self.event_every {
                if self.beats % every == 0 {
                    let label = (self.beats / every) % 10;
                    self.pending
                        .extend(encode_message(&format!("EVNT:{};", label)));
                }
            }
        }

        let frame: Vec<u16> = (0..self.channels).map(|c| self.raw_value(n, c)).collect();
        self.pending.extend(encode_frame(&frame));
        self.sample_index += 1;
    }

    fn refill(&mut self, wanted: usize) {
        if self.cursor > 0 {
            self.pending.drain(..self.cursor);
            self.cursor = 0;
        }

        if !self.announced {
            self.pending.extend(encode_message("HWT:HEARTSS;"));
            self.pending.extend(encode_message(&format!(
                "MSF:{};MNC:{};",
                self.sample_rate, self.channels
            )));
            self.announced = true;
        }

        while self.pending.len() < wanted {
            self.generate_frame();
        }
    }
}

impl Transport for SyntheticTransport {
    fn name(&self) -> String {
        format!(
            "Synthetic {} Hz x{} @ {} bpm",
            self.sample_rate, self.channels, self.beats_per_minute
        )
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let budget = self.pacer.budget(buf.len());
        if budget == 0 {
            return Ok(0);
        }

        if self.pending.len() - self.cursor < budget {
            self.refill(budget);
        }

        let n = budget.min(self.pending.len() - self.cursor);
        buf[..n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
        self.cursor += n;
        self.pacer.consumed(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::decoder::ByteStreamDecoder;
    use crate::acquisition::message::{ControlMessage, HardwareType};
    use std::io::Write;

    fn read_all(transport: &mut dyn Transport, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 500];
        while out.len() < limit {
            match transport.read(&mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(TransportError::Closed) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        out
    }

    #[test]
    fn test_file_transport_replays_and_closes() {
        let mut capture = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        capture.write_all(&bytes).unwrap();
        capture.flush().unwrap();

        let mut transport = FileTransport::open(capture.path()).unwrap();
        assert!(transport.name().starts_with("File "));

        let replayed = read_all(&mut transport, usize::MAX);
        assert_eq!(replayed, bytes);
        assert!(matches!(
            transport.read(&mut [0u8; 16]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_file_transport_loops() {
        let mut capture = tempfile::NamedTempFile::new().unwrap();
        capture.write_all(&[1, 2, 3]).unwrap();
        capture.flush().unwrap();

        let mut transport = FileTransport::open(capture.path()).unwrap().looping(true);
        let replayed = read_all(&mut transport, 9);

        assert_eq!(replayed, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileTransport::open(dir.path().join("missing.bin"));

        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_synthetic_stream_decodes() {
        let rate = 1_000;
        let mut transport = SyntheticTransport::new(rate, 2)
            .with_beats_per_minute(120.0)
            .with_event_every(1)
            .unpaced();
        // Four seconds of two-channel frames, four bytes each
        let bytes = read_all(&mut transport, 4 * rate as usize * 4 + 200);

        // Start the decoder with the wrong layout; the announcement fixes it
        let mut decoder = ByteStreamDecoder::new(1, 10_000);
        let chunk = decoder.decode(&bytes);

        assert_eq!(decoder.channel_count(), 2);
        assert_eq!(decoder.sample_rate(), rate);
        assert_eq!(chunk.channel_count(), 2);
        assert!(chunk.sample_count() >= 3_800);

        let messages: Vec<&ControlMessage> = chunk.messages.iter().map(|(_, m)| m).collect();
        assert_eq!(
            messages[0],
            &ControlMessage::HardwareType(HardwareType::Heart)
        );
        assert_eq!(
            messages[1],
            &ControlMessage::SampleRateAndChannelCount {
                sample_rate: rate,
                channels: 2,
            }
        );
        let events = messages
            .iter()
            .filter(|m| matches!(m, ControlMessage::Event { .. }))
            .count();
        // One beat every 500 samples
        assert!(events >= 6, "only {} events", events);

        // Beats rise well above the hum on the first channel, less on the second
        let peak0 = chunk.channel(0).iter().copied().max().unwrap_or(0);
        let peak1 = chunk.channel(1).iter().copied().max().unwrap_or(0);
        assert!(peak0 > 5_000, "peak0 {}", peak0);
        assert!(peak1 > 2_000 && peak1 < peak0, "peak1 {}", peak1);
    }

    #[test]
    fn test_pacing_limits_delivery() {
        let mut transport = SyntheticTransport::new(1_000, 1);
        let mut buf = [0u8; 100_000];
        let started = Instant::now();

        let mut total = 0;
        while started.elapsed() < Duration::from_millis(100) {
            total += transport.read(&mut buf).unwrap();
        }

        // 2000 bytes per second; generous upper bound for slow machines
        assert!(total < 1_000, "delivered {}", total);
    }
}
