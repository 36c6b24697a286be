//! Averaging module - spike-triggered signal averaging
//!
//! This module provides:
//! - Averaging configuration and derived window sizes
//! - Trigger windows filled across chunks
//! - The threshold averaging engine with bounded depth

mod config;
mod engine;
mod window;

pub use config::AveragingConfig;
pub use engine::{crosses, ThresholdAveragingEngine, TriggerState};
pub use window::TriggerWindow;
