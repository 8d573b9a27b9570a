use thiserror::Error;

/// Error type shared by every visualizer component.
#[derive(Debug, Error)]
pub enum VisualizerError {
    /// No audio processing capability, or the context has been closed.
    #[error("Audio processing unavailable: {0}")]
    UnsupportedContext(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Failed to decode {url}: {reason}")]
    Decode { url: String, reason: String },

    /// A scaler was built over a zero-width source range.
    #[error("Degenerate range [{start}, {end}]")]
    InvalidRange { start: f64, end: f64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VisualizerError>;
