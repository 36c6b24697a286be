use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use spike_scope::acquisition::{FilterSettings, DEFAULT_BAUD_RATE};
use spike_scope::averaging::AveragingConfig;

use crate::render::ColorTheme;
use crate::{ScopeApp, SourceKind};

/// Returns the path to the settings file: `~/.config/spike-scope/settings.json`
fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("spike-scope");
    path.push("settings.json");
    path
}

/// Persisted application settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // Source
    pub source: SourceKind,
    pub serial_port: String,
    pub baud_rate: u32,
    /// Channel count assumed until the device announces its own
    pub channel_count: usize,
    pub capture_file: Option<PathBuf>,
    pub loop_playback: bool,
    pub synthetic_channels: usize,
    pub synthetic_bpm: f32,

    // Averaging
    pub averaging: AveragingConfig,
    pub selected_channel: usize,
    pub filters: FilterSettings,

    // Display
    pub color_theme: ColorTheme,
    pub line_width: f32,
    pub show_graticule: bool,
    pub vertical_range: f32,
    pub trace_seconds: f32,

    // Window
    pub show_settings: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            channel_count: 1,
            capture_file: None,
            loop_playback: false,
            synthetic_channels: 2,
            synthetic_bpm: 72.0,

            averaging: AveragingConfig {
                trigger_value: Some(3_000),
                ..AveragingConfig::default()
            },
            selected_channel: 0,
            filters: FilterSettings::default(),

            color_theme: ColorTheme::default(),
            line_width: 1.5,
            show_graticule: true,
            vertical_range: 16_384.0,
            trace_seconds: 2.0,

            show_settings: true,
        }
    }
}

impl AppSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&settings_path())
    }

    fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        self.save_to(&settings_path());
    }

    fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Failed to write settings: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }

    /// Extract current settings from the running application.
    pub fn from_app(app: &ScopeApp) -> Self {
        let view = &app.waveform.settings;
        Self {
            source: app.source,
            serial_port: app.serial_port.clone(),
            baud_rate: app.baud_rate,
            channel_count: app.channel_count,
            capture_file: app.capture_file.clone(),
            loop_playback: app.loop_playback,
            synthetic_channels: app.synthetic_channels,
            synthetic_bpm: app.synthetic_bpm,

            averaging: app.averaging,
            selected_channel: app.selected_channel,
            filters: app.filters,

            color_theme: view.theme,
            line_width: view.line_width,
            show_graticule: view.show_graticule,
            vertical_range: view.vertical_range,
            trace_seconds: app.trace_seconds,

            show_settings: app.show_settings,
        }
    }

    /// Apply loaded settings to the running application.
    pub fn apply(&self, app: &mut ScopeApp) {
        app.source = self.source;
        app.serial_port = self.serial_port.clone();
        app.baud_rate = self.baud_rate;
        app.channel_count = self.channel_count.max(1);
        app.capture_file = self.capture_file.clone();
        app.loop_playback = self.loop_playback;
        app.synthetic_channels = self.synthetic_channels.max(1);
        app.synthetic_bpm = self.synthetic_bpm;

        app.averaging = self.averaging.sanitized(&AveragingConfig::default());
        app.selected_channel = self.selected_channel;
        app.filters = self.filters;

        let view = &mut app.waveform.settings;
        view.apply_theme(self.color_theme);
        view.line_width = self.line_width;
        view.show_graticule = self.show_graticule;
        view.vertical_range = self.vertical_range;
        app.trace_seconds = self.trace_seconds;

        app.show_settings = self.show_settings;
    }
}
