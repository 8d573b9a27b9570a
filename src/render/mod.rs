// Boundary between the analysis pipeline and whatever draws the charts.

mod render_loop;

pub use render_loop::RenderLoop;

/// A chart-ready `(x, y)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayPoint {
    pub x: f64,
    pub y: f64,
}

impl DisplayPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<DisplayPoint> for (f64, f64) {
    fn from(point: DisplayPoint) -> Self {
        (point.x, point.y)
    }
}

/// Identifies one drawable on a chart surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesId {
    /// Instantaneous time-domain samples
    Waveform,
    /// Scrolling time-domain history
    WaveformHistory,
    /// Instantaneous frequency magnitudes
    Spectrum,
    Decay,
    PeakHold,
    Spectrogram,
}

impl SeriesId {
    pub fn title(&self) -> &'static str {
        match self {
            SeriesId::Waveform => "Waveform",
            SeriesId::WaveformHistory => "Waveform History",
            SeriesId::Spectrum => "Spectrum",
            SeriesId::Decay => "Decay",
            SeriesId::PeakHold => "Peak",
            SeriesId::Spectrogram => "Spectrogram",
        }
    }
}

/// Anything that can display point series, scrolling history and a heatmap.
#[cfg_attr(test, mockall::automock)]
pub trait ChartSurface: Send {
    /// Replaces the series content wholesale.
    fn set_series(&mut self, id: SeriesId, points: &[DisplayPoint]);

    /// Appends to a scrolling series; retention is the surface's concern.
    fn append_history(&mut self, id: SeriesId, points: &[DisplayPoint]);

    /// Writes the next heatmap column, scrolling older ones out.
    fn write_grid_column(&mut self, id: SeriesId, column: &[f32]);

    fn reset_series(&mut self, id: SeriesId);
}
