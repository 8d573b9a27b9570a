// Audioscope: real-time audio visualizer
// Expose public modules for use in integration tests

pub mod analysis;
pub mod app;
pub mod audio;
pub mod error;
pub mod render;
pub mod scaler;
pub mod ui;

// Re-export commonly used types for convenience
pub use app::catalog::{Preset, SourceOption};
pub use app::config::VisualizerConfig;
pub use app::{SelectOutcome, Visualizer};
pub use audio::{AudioBackend, ContextState, CpalBackend, OfflineBackend, SignalSource, SourceKind};
pub use error::{Result, VisualizerError};
pub use render::{ChartSurface, DisplayPoint, RenderLoop, SeriesId};
pub use ui::TerminalChartSurface;
