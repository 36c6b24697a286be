//! Time-domain waveform display widget
//!
//! Draws a trace of `i16` samples left to right over a graticule, with
//! optional threshold line and trigger marker. Long traces are reduced to one
//! min/max pair per pixel column so that spikes survive decimation.

use eframe::egui::{self, Color32, Pos2, Rect, Stroke, Vec2};
use serde::{Deserialize, Serialize};

/// Trace color themes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorTheme {
    #[default]
    Green,
    Amber,
    Blue,
    White,
}

impl ColorTheme {
    pub fn all() -> &'static [ColorTheme] {
        &[Self::Green, Self::Amber, Self::Blue, Self::White]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Green => "Green",
            Self::Amber => "Amber",
            Self::Blue => "Blue",
            Self::White => "White",
        }
    }

    /// Trace and background colors
    pub fn colors(&self) -> (Color32, Color32) {
        match self {
            Self::Green => (Color32::from_rgb(100, 255, 100), Color32::from_rgb(10, 20, 10)),
            Self::Amber => (Color32::from_rgb(255, 180, 60), Color32::from_rgb(20, 14, 6)),
            Self::Blue => (Color32::from_rgb(110, 180, 255), Color32::from_rgb(8, 12, 24)),
            Self::White => (Color32::from_gray(230), Color32::from_gray(16)),
        }
    }
}

/// Display settings shared by all traces
#[derive(Clone)]
pub struct WaveformSettings {
    pub theme: ColorTheme,
    pub color: Color32,
    pub background: Color32,
    pub line_width: f32,
    pub show_graticule: bool,
    /// Sample value at the top edge; the bottom edge is its negative
    pub vertical_range: f32,
}

impl Default for WaveformSettings {
    fn default() -> Self {
        let theme = ColorTheme::default();
        let (color, background) = theme.colors();
        Self {
            theme,
            color,
            background,
            line_width: 1.5,
            show_graticule: true,
            vertical_range: 16_384.0,
        }
    }
}

impl WaveformSettings {
    pub fn apply_theme(&mut self, theme: ColorTheme) {
        self.theme = theme;
        let (color, background) = theme.colors();
        self.color = color;
        self.background = background;
    }
}

/// Extra decorations drawn over a trace
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    /// Horizontal line at this sample value
    pub threshold: Option<i32>,
    /// Vertical marker at this sample index
    pub marker: Option<usize>,
    /// Labelled ticks along the top edge, as (sample index, label)
    pub events: Vec<(usize, String)>,
}

/// Waveform widget
pub struct WaveformView {
    pub settings: WaveformSettings,
}

impl Default for WaveformView {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveformView {
    pub fn new() -> Self {
        Self {
            settings: WaveformSettings::default(),
        }
    }

    fn value_to_y(&self, value: f32, rect: Rect) -> f32 {
        let range = self.settings.vertical_range.max(1.0);
        let norm = (value / range).clamp(-1.0, 1.0);
        rect.center().y - norm * rect.height() / 2.0
    }

    fn index_to_x(index: usize, len: usize, rect: Rect) -> f32 {
        let t = index as f32 / len.saturating_sub(1).max(1) as f32;
        rect.left() + t * rect.width()
    }

    pub fn show(
        &self,
        ui: &mut egui::Ui,
        samples: &[i16],
        overlay: &Overlay,
        size: Vec2,
    ) -> egui::Response {
        let (response, painter) = ui.allocate_painter(size, egui::Sense::hover());
        let rect = response.rect;

        painter.rect_filled(rect, 4.0, self.settings.background);

        if self.settings.show_graticule {
            self.draw_graticule(&painter, rect);
        }

        self.draw_overlay(&painter, rect, samples.len(), overlay);
        self.draw_trace(&painter, rect, samples);

        response
    }

    fn draw_graticule(&self, painter: &egui::Painter, rect: Rect) {
        let grid_color = Color32::from_rgba_unmultiplied(60, 80, 60, 100);
        let axis_color = Color32::from_rgba_unmultiplied(80, 100, 80, 150);

        let stroke_grid = Stroke::new(0.5, grid_color);
        let stroke_axis = Stroke::new(1.0, axis_color);

        for i in 0..=10 {
            let x = rect.left() + i as f32 / 10.0 * rect.width();
            painter.line_segment(
                [Pos2::new(x, rect.top()), Pos2::new(x, rect.bottom())],
                stroke_grid,
            );
        }
        for i in 0..=8 {
            let y = rect.top() + i as f32 / 8.0 * rect.height();
            let stroke = if i == 4 { stroke_axis } else { stroke_grid };
            painter.line_segment([Pos2::new(rect.left(), y), Pos2::new(rect.right(), y)], stroke);
        }
    }

    fn draw_overlay(&self, painter: &egui::Painter, rect: Rect, len: usize, overlay: &Overlay) {
        if let Some(threshold) = overlay.threshold {
            let y = self.value_to_y(threshold as f32, rect);
            painter.line_segment(
                [Pos2::new(rect.left(), y), Pos2::new(rect.right(), y)],
                Stroke::new(1.0, Color32::from_rgb(220, 70, 70)),
            );
        }

        if len == 0 {
            return;
        }

        if let Some(marker) = overlay.marker.filter(|&m| m < len) {
            let x = Self::index_to_x(marker, len, rect);
            painter.line_segment(
                [Pos2::new(x, rect.top()), Pos2::new(x, rect.bottom())],
                Stroke::new(1.0, Color32::from_rgba_unmultiplied(200, 200, 80, 160)),
            );
        }

        for (index, label) in overlay.events.iter().filter(|(i, _)| *i < len) {
            let x = Self::index_to_x(*index, len, rect);
            painter.line_segment(
                [Pos2::new(x, rect.top()), Pos2::new(x, rect.top() + 10.0)],
                Stroke::new(1.5, Color32::LIGHT_BLUE),
            );
            painter.text(
                Pos2::new(x + 2.0, rect.top() + 2.0),
                egui::Align2::LEFT_TOP,
                label,
                egui::FontId::monospace(10.0),
                Color32::LIGHT_BLUE,
            );
        }
    }

    fn draw_trace(&self, painter: &egui::Painter, rect: Rect, samples: &[i16]) {
        if samples.len() < 2 {
            return;
        }

        let stroke = Stroke::new(self.settings.line_width, self.settings.color);
        let columns = rect.width().max(1.0) as usize;

        if samples.len() <= columns {
            let points: Vec<Pos2> = samples
                .iter()
                .enumerate()
                .map(|(i, &s)| {
                    Pos2::new(
                        Self::index_to_x(i, samples.len(), rect),
                        self.value_to_y(f32::from(s), rect),
                    )
                })
                .collect();
            painter.add(egui::Shape::line(points, stroke));
            return;
        }

        for (column, (low, high)) in min_max_columns(samples, columns).into_iter().enumerate() {
            let x = rect.left() + column as f32 + 0.5;
            let top = self.value_to_y(f32::from(high), rect);
            let bottom = self.value_to_y(f32::from(low), rect);
            // Keep flat stretches visible
            let bottom = bottom.max(top + 1.0);
            painter.line_segment([Pos2::new(x, top), Pos2::new(x, bottom)], stroke);
        }
    }
}

/// Reduce `samples` to `columns` (min, max) pairs covering equal spans
pub fn min_max_columns(samples: &[i16], columns: usize) -> Vec<(i16, i16)> {
    if samples.is_empty() || columns == 0 {
        return Vec::new();
    }

    let columns = columns.min(samples.len());
    (0..columns)
        .map(|c| {
            let start = c * samples.len() / columns;
            let end = ((c + 1) * samples.len() / columns).max(start + 1);
            samples[start..end]
                .iter()
                .fold((i16::MAX, i16::MIN), |(lo, hi), &s| (lo.min(s), hi.max(s)))
        })
        .collect()
}
