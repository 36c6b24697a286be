//! Spike Scope - bioelectric signal acquisition and spike-triggered averaging
//!
//! The `acquisition` module decodes the device byte stream into per-channel
//! samples and control messages; the `averaging` module builds a running
//! average of windows centered on threshold crossings.

pub mod acquisition;
pub mod averaging;
