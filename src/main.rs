//! spike-scope - Bioelectric signal viewer with spike-triggered averaging
//!
//! Streams samples from a SpikerBox style device (or a raw capture, or a
//! built-in synthetic heart), shows the live traces and the running average
//! of windows centered on threshold crossings.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use eframe::egui;
use serde::{Deserialize, Serialize};

mod display;
mod render;
mod settings;

use display::DisplayState;
use render::{ColorTheme, Overlay, WaveformView};
use settings::AppSettings;
use spike_scope::acquisition::{
    available_ports, AcquisitionSession, FileTransport, FilterSettings, NotchFrequency,
    SerialTransport, SessionCommand, SessionConfig, SessionOutput, SyntheticTransport, Transport,
};
use spike_scope::averaging::AveragingConfig;

/// Where samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceKind {
    #[default]
    Synthetic,
    Serial,
    File,
}

impl SourceKind {
    fn all() -> &'static [SourceKind] {
        &[Self::Synthetic, Self::Serial, Self::File]
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Synthetic => "Synthetic",
            Self::Serial => "Serial",
            Self::File => "File",
        }
    }
}

/// Common baud rates offered in the selector
const BAUD_RATES: [u32; 4] = [115_200, 222_222, 230_400, 500_000];

/// Height of one live trace
const TRACE_HEIGHT: f32 = 110.0;

fn main() -> eframe::Result<()> {
    env_logger::init();
    log::info!("Starting spike-scope");

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1000.0, 700.0])
            .with_title("spike-scope"),
        ..Default::default()
    };

    eframe::run_native(
        "spike-scope",
        options,
        Box::new(|cc| Ok(Box::new(ScopeApp::new(cc)))),
    )
}

pub struct ScopeApp {
    // Source
    source: SourceKind,
    serial_port: String,
    serial_ports: Vec<String>,
    baud_rate: u32,
    channel_count: usize,
    capture_file: Option<PathBuf>,
    loop_playback: bool,
    synthetic_channels: usize,
    synthetic_bpm: f32,
    record_raw: bool,

    // Averaging
    averaging: AveragingConfig,
    /// Threshold remembered while triggering is switched off
    trigger_level: i32,
    selected_channel: usize,
    filters: FilterSettings,

    // Display
    waveform: WaveformView,
    trace_seconds: f32,
    show_settings: bool,

    session: Option<AcquisitionSession>,
    display: Arc<Mutex<DisplayState>>,
    status: String,
}

impl ScopeApp {
    fn new(_cc: &eframe::CreationContext<'_>) -> Self {
        let defaults = AppSettings::default();
        let mut app = Self {
            source: defaults.source,
            serial_port: String::new(),
            serial_ports: available_ports(),
            baud_rate: defaults.baud_rate,
            channel_count: defaults.channel_count,
            capture_file: None,
            loop_playback: false,
            synthetic_channels: defaults.synthetic_channels,
            synthetic_bpm: defaults.synthetic_bpm,
            record_raw: false,

            averaging: defaults.averaging,
            trigger_level: 3_000,
            selected_channel: 0,
            filters: FilterSettings::default(),

            waveform: WaveformView::new(),
            trace_seconds: defaults.trace_seconds,
            show_settings: true,

            session: None,
            display: Arc::new(Mutex::new(DisplayState::new(
                defaults.averaging.sample_rate,
                1,
                defaults.trace_seconds,
            ))),
            status: "Stopped".to_string(),
        };

        AppSettings::load().apply(&mut app);
        if let Some(level) = app.averaging.trigger_value {
            app.trigger_level = level;
        }
        if app.serial_port.is_empty() {
            if let Some(first) = app.serial_ports.first() {
                app.serial_port = first.clone();
            }
        }
        app
    }

    fn display(&self) -> MutexGuard<'_, DisplayState> {
        self.display.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_running(&self) -> bool {
        self.session.is_some()
    }

    fn open_transport(&self) -> Result<Box<dyn Transport>, String> {
        match self.source {
            SourceKind::Synthetic => Ok(Box::new(
                SyntheticTransport::new(self.averaging.sample_rate, self.synthetic_channels)
                    .with_beats_per_minute(self.synthetic_bpm)
                    .with_event_every(10),
            )),
            SourceKind::Serial => {
                if self.serial_port.is_empty() {
                    return Err("No serial port selected".to_string());
                }
                SerialTransport::open(&self.serial_port, self.baud_rate)
                    .map(|t| Box::new(t) as Box<dyn Transport>)
                    .map_err(|e| format!("Error: {}", e))
            }
            SourceKind::File => {
                let path = self
                    .capture_file
                    .as_ref()
                    .ok_or_else(|| "No capture file selected".to_string())?;
                FileTransport::open(path)
                    .map(|t| {
                        Box::new(
                            t.paced(self.averaging.sample_rate, self.channel_count)
                                .looping(self.loop_playback),
                        ) as Box<dyn Transport>
                    })
                    .map_err(|e| format!("Error: {}", e))
            }
        }
    }

    fn start(&mut self) {
        if self.session.is_some() {
            return;
        }

        let transport = match self.open_transport() {
            Ok(t) => t,
            Err(e) => {
                log::error!("Failed to open source: {}", e);
                self.status = e;
                return;
            }
        };

        let capture_path = if self.record_raw {
            let picked = rfd::FileDialog::new()
                .add_filter("Raw capture", &["bin"])
                .set_file_name("capture.bin")
                .save_file();
            if picked.is_none() {
                log::info!("Raw recording cancelled");
            }
            picked
        } else {
            None
        };

        let channel_count = match self.source {
            SourceKind::Synthetic => self.synthetic_channels,
            _ => self.channel_count,
        };
        let config = SessionConfig {
            channel_count,
            selected_channel: self.selected_channel,
            averaging: self.averaging,
            filters: self.filters,
            capture_path,
            ..Default::default()
        };

        *self.display() = DisplayState::new(
            self.averaging.sample_rate,
            channel_count,
            self.trace_seconds,
        );

        let display = Arc::clone(&self.display);
        let session = AcquisitionSession::start(
            transport,
            config,
            move |output: &SessionOutput<'_>| {
                display
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update(output);
            },
        );

        self.status = format!("Running: {}", session.name());
        self.session = Some(session);
    }

    fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        self.status = "Stopped".to_string();
    }

    fn toggle(&mut self) {
        if self.is_running() {
            self.stop();
        } else {
            self.start();
        }
    }

    fn send(&self, command: SessionCommand) {
        if let Some(session) = &self.session {
            session.send(command);
        }
    }

    fn source_controls(&mut self, ui: &mut egui::Ui) {
        let running = self.is_running();

        match self.source {
            SourceKind::Serial => {
                egui::ComboBox::from_id_salt("serial_port")
                    .selected_text(if self.serial_port.is_empty() {
                        "None"
                    } else {
                        self.serial_port.as_str()
                    })
                    .show_ui(ui, |ui| {
                        for name in &self.serial_ports {
                            ui.selectable_value(&mut self.serial_port, name.clone(), name.as_str());
                        }
                    });
                if ui.add_enabled(!running, egui::Button::new("⟳")).clicked() {
                    self.serial_ports = available_ports();
                }

                egui::ComboBox::from_id_salt("baud_rate")
                    .selected_text(format!("{} baud", self.baud_rate))
                    .show_ui(ui, |ui| {
                        for baud in BAUD_RATES {
                            ui.selectable_value(&mut self.baud_rate, baud, baud.to_string());
                        }
                    });
            }
            SourceKind::File => {
                if ui.add_enabled(!running, egui::Button::new("📂 Open")).clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .add_filter("Raw capture", &["bin", "raw"])
                        .pick_file()
                    {
                        log::info!("Selected capture {}", path.display());
                        self.capture_file = Some(path);
                    }
                }
                if let Some(name) = self
                    .capture_file
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                {
                    ui.label(name);
                }
                ui.checkbox(&mut self.loop_playback, "Loop");
            }
            SourceKind::Synthetic => {
                ui.label("Channels:");
                ui.add_enabled(
                    !running,
                    egui::DragValue::new(&mut self.synthetic_channels).range(1..=6),
                );
                ui.label("BPM:");
                ui.add_enabled(
                    !running,
                    egui::DragValue::new(&mut self.synthetic_bpm).range(20.0..=240.0),
                );
            }
        }
    }

    fn averaging_controls(&mut self, ui: &mut egui::Ui) {
        let mut changed = false;

        let mut enabled = self.averaging.trigger_value.is_some();
        ui.horizontal(|ui| {
            changed |= ui.checkbox(&mut enabled, "Trigger at").changed();
            changed |= ui
                .add_enabled(
                    enabled,
                    egui::DragValue::new(&mut self.trigger_level)
                        .range(-32_768..=32_767)
                        .speed(10.0),
                )
                .changed();
        });
        ui.small("Negative levels trigger on falling edges");

        ui.horizontal(|ui| {
            ui.label("Windows averaged:");
            changed |= ui
                .add(egui::Slider::new(&mut self.averaging.averaged_sample_count, 1..=100))
                .changed();
        });

        ui.horizontal(|ui| {
            ui.label("Window (s):");
            changed |= ui
                .add(
                    egui::Slider::new(&mut self.averaging.max_processed_seconds, 0.01..=2.0)
                        .logarithmic(true),
                )
                .changed();
        });

        ui.horizontal(|ui| {
            ui.label("Dead period (s):");
            changed |= ui
                .add(egui::Slider::new(
                    &mut self.averaging.dead_period_seconds,
                    0.0..=0.5,
                ))
                .changed();
        });

        if changed {
            self.averaging.trigger_value = enabled.then_some(self.trigger_level);
            self.send(SessionCommand::SetAveraging(self.averaging));
        }

        if ui.button("Reset average").clicked() {
            self.send(SessionCommand::ResetAverage);
        }
    }

    fn channel_controls(&mut self, ui: &mut egui::Ui) {
        let channel_count = self.display().channel_count.max(1);

        ui.horizontal(|ui| {
            ui.label("Average channel:");
            let before = self.selected_channel;
            egui::ComboBox::from_id_salt("selected_channel")
                .selected_text(format!("Channel {}", self.selected_channel + 1))
                .show_ui(ui, |ui| {
                    for channel in 0..channel_count {
                        ui.selectable_value(
                            &mut self.selected_channel,
                            channel,
                            format!("Channel {}", channel + 1),
                        );
                    }
                });
            if self.selected_channel != before {
                self.send(SessionCommand::SelectChannel(self.selected_channel));
            }
        });

        ui.horizontal(|ui| {
            ui.label("Assumed channels:");
            ui.add_enabled(
                !self.is_running(),
                egui::DragValue::new(&mut self.channel_count).range(1..=6),
            );
        });

        ui.horizontal(|ui| {
            ui.label("Sample rate:");
            ui.add_enabled(
                !self.is_running(),
                egui::DragValue::new(&mut self.averaging.sample_rate)
                    .range(100..=100_000)
                    .suffix(" Hz"),
            );
        });
    }

    fn filter_controls(&mut self, ui: &mut egui::Ui) {
        let before = self.filters;

        ui.horizontal(|ui| {
            ui.label("Notch:");
            let label = |notch: Option<NotchFrequency>| match notch {
                None => "Off".to_string(),
                Some(n) => format!("{} Hz", n.hz()),
            };
            egui::ComboBox::from_id_salt("notch")
                .selected_text(label(self.filters.notch))
                .show_ui(ui, |ui| {
                    for notch in [None, Some(NotchFrequency::Hz50), Some(NotchFrequency::Hz60)] {
                        ui.selectable_value(&mut self.filters.notch, notch, label(notch));
                    }
                });
        });

        for (name, cutoff, default_hz, range) in [
            ("High-pass", &mut self.filters.high_pass_hz, 1.0, 0.1..=500.0),
            ("Low-pass", &mut self.filters.low_pass_hz, 1_000.0, 10.0..=5_000.0),
        ] {
            ui.horizontal(|ui| {
                let mut on = cutoff.is_some();
                if ui.checkbox(&mut on, name).changed() {
                    *cutoff = on.then_some(default_hz);
                }
                if let Some(hz) = cutoff.as_mut() {
                    ui.add(egui::Slider::new(hz, range).logarithmic(true).suffix(" Hz"));
                }
            });
        }

        if self.filters != before {
            self.send(SessionCommand::SetFilters(self.filters));
        }
    }

    fn display_controls(&mut self, ui: &mut egui::Ui) {
        let view = &mut self.waveform.settings;

        ui.horizontal(|ui| {
            ui.label("Theme:");
            egui::ComboBox::from_id_salt("color_theme")
                .selected_text(view.theme.name())
                .show_ui(ui, |ui| {
                    for theme in ColorTheme::all() {
                        if ui.selectable_label(view.theme == *theme, theme.name()).clicked() {
                            view.apply_theme(*theme);
                        }
                    }
                });
        });

        ui.horizontal(|ui| {
            ui.label("Range:");
            ui.add(egui::Slider::new(&mut view.vertical_range, 100.0..=32_768.0).logarithmic(true));
        });

        ui.horizontal(|ui| {
            ui.label("Line width:");
            ui.add(egui::Slider::new(&mut view.line_width, 0.5..=4.0));
        });

        ui.checkbox(&mut view.show_graticule, "Show grid");

        ui.horizontal(|ui| {
            ui.label("Trace (s):");
            if ui
                .add(egui::Slider::new(&mut self.trace_seconds, 0.5..=10.0))
                .changed()
            {
                let seconds = self.trace_seconds;
                self.display().set_trace_seconds(seconds);
            }
        });
    }
}

impl eframe::App for ScopeApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint();

        // A finished capture ends the session on its own
        if self.session.as_ref().is_some_and(|s| !s.is_running()) {
            self.stop();
            self.status = "Source finished".to_string();
        }

        // Top panel
        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("spike-scope");
                ui.separator();

                let running = self.is_running();
                for kind in SourceKind::all() {
                    ui.add_enabled_ui(!running, |ui| {
                        ui.selectable_value(&mut self.source, *kind, kind.name());
                    });
                }
                ui.separator();

                self.source_controls(ui);
                ui.separator();

                let button_text = if running { "⏹ Stop" } else { "▶ Start" };
                if ui.button(button_text).clicked() {
                    self.toggle();
                }
                ui.add_enabled(!running, egui::Checkbox::new(&mut self.record_raw, "Record"));

                ui.separator();
                ui.label(&self.status);

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    ui.toggle_value(&mut self.show_settings, "⚙ Settings");
                });
            });
        });

        // Settings panel
        if self.show_settings {
            egui::SidePanel::right("settings_panel")
                .min_width(240.0)
                .show(ctx, |ui| {
                    ui.heading("Settings");
                    ui.separator();

                    ui.collapsing("Averaging", |ui| self.averaging_controls(ui));
                    ui.separator();
                    ui.collapsing("Channels", |ui| self.channel_controls(ui));
                    ui.separator();
                    ui.collapsing("Filters", |ui| self.filter_controls(ui));
                    ui.separator();
                    ui.collapsing("Display", |ui| self.display_controls(ui));
                });
        }

        // Status bar
        egui::TopBottomPanel::bottom("status_panel").show(ctx, |ui| {
            let display = self.display();
            ui.horizontal(|ui| {
                ui.small(format!("Samples: {}", display.samples_received));
                ui.separator();
                ui.small(format!(
                    "{} Hz x {}",
                    display.sample_rate, display.channel_count
                ));
                ui.separator();
                ui.small(format!("Triggers: {}", display.trigger_count));
                ui.separator();
                ui.small(format!("Overrun: {} B", display.bytes_overwritten));
                if let Some(hardware) = &display.hardware {
                    ui.separator();
                    ui.small(hardware);
                }
            });
        });

        // Traces and average
        egui::CentralPanel::default().show(ctx, |ui| {
            let display = self.display.lock().unwrap_or_else(|e| e.into_inner());
            let width = ui.available_width();
            let events = display.visible_events();

            egui::ScrollArea::vertical()
                .max_height(ui.available_height() * 0.55)
                .show(ui, |ui| {
                    for (channel, trace) in display.traces.iter().enumerate() {
                        let selected = channel == display.selected_channel;
                        ui.small(format!(
                            "Channel {}{}",
                            channel + 1,
                            if selected { " (averaged)" } else { "" }
                        ));
                        let overlay = Overlay {
                            threshold: self.averaging.trigger_value.filter(|_| selected),
                            marker: None,
                            events: events.clone(),
                        };
                        self.waveform.show(
                            ui,
                            &trace.to_ordered_vec(),
                            &overlay,
                            egui::vec2(width, TRACE_HEIGHT),
                        );
                    }
                });

            ui.separator();
            ui.small(format!(
                "Average of up to {} windows, {:.3} s",
                self.averaging.averaged_sample_count, self.averaging.max_processed_seconds
            ));
            let overlay = Overlay {
                threshold: self.averaging.trigger_value,
                marker: Some(display.averaged.len() / 2),
                events: Vec::new(),
            };
            let height = ui.available_height().max(TRACE_HEIGHT);
            self.waveform
                .show(ui, &display.averaged, &overlay, egui::vec2(width, height));
        });
    }
}

impl Drop for ScopeApp {
    fn drop(&mut self) {
        self.stop();
        AppSettings::from_app(self).save();
    }
}
