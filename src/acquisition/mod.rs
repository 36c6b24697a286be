//! Acquisition module - turns the device byte stream into samples
//!
//! This module provides:
//! - Transports (serial port, raw capture replay, synthetic device)
//! - Byte ring between the reader thread and the processing thread
//! - The wire-format decoder and control message parser
//! - Optional per-channel filtering
//! - The acquisition session tying everything to the averager

mod byte_ring;
mod decoder;
mod filter;
mod message;
mod ring;
mod session;
mod transport;

pub use byte_ring::{capacity_for, ByteRing};
pub use decoder::{
    encode_frame, encode_message, ByteStreamDecoder, DecodedChunk, EscapeState, SampleScaling,
    DC_OFFSET_ALPHA, ESCAPE_END, ESCAPE_START, MAX_MESSAGE_LEN,
};
pub use filter::{ChannelFilter, FilterSettings, NotchFrequency};
pub use message::{ControlMessage, HardwareType};
pub use ring::CircularSampleBuffer;
pub use session::{AcquisitionSession, SessionCommand, SessionConfig, SessionOutput};
pub use transport::{
    available_ports, FileTransport, SerialTransport, SyntheticTransport, Transport,
    TransportError, DEFAULT_BAUD_RATE,
};
