use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::{MAX_FFT_SIZE, MIN_FFT_SIZE};
use crate::error::{Result, VisualizerError};

/// Highest accepted render loop rate in frames per second.
pub const MAX_FRAME_RATE: u32 = 1000;

/// Construction-time settings of a visualizer instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Analyser window, a power of two
    pub fft_size: usize,
    /// Samples per tap block
    pub block_size: usize,
    pub min_decibels: f64,
    pub max_decibels: f64,
    pub smoothing_time_constant: f64,
    /// Byte units the decay envelope falls per block
    pub decay_rate: f32,
    /// Retained waveform history in seconds
    pub history_seconds: f64,
    pub history_decimation: usize,
    pub spectrogram_columns: usize,
    /// Display refresh rate of the render loop
    pub frame_rate: u32,
    /// Directory holding the preset audio files
    pub asset_dir: PathBuf,
    /// Output gain at startup, 0 is muted
    pub initial_gain: f32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            block_size: 2048,
            min_decibels: -100.0,
            max_decibels: -30.0,
            smoothing_time_constant: 0.8,
            decay_rate: 0.025,
            history_seconds: 10.0,
            history_decimation: 16,
            spectrogram_columns: 256,
            frame_rate: 60,
            asset_dir: PathBuf::from("assets"),
            initial_gain: 0.0,
        }
    }
}

impl VisualizerConfig {
    /// `<config dir>/audioscope/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("audioscope").join("config.toml"))
    }

    /// Loads settings from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| VisualizerError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| VisualizerError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two()
            || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&self.fft_size)
        {
            return Err(VisualizerError::Config(format!(
                "fft_size must be a power of two in [{}, {}], got {}",
                MIN_FFT_SIZE, MAX_FFT_SIZE, self.fft_size
            )));
        }
        if self.block_size == 0 {
            return Err(VisualizerError::Config("block_size must be non-zero".to_string()));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(VisualizerError::InvalidRange {
                start: self.min_decibels,
                end: self.max_decibels,
            });
        }
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(VisualizerError::Config(format!(
                "smoothing_time_constant must be in [0, 1], got {}",
                self.smoothing_time_constant
            )));
        }
        if !(self.decay_rate >= 0.0) {
            return Err(VisualizerError::Config(format!(
                "decay_rate must be non-negative, got {}",
                self.decay_rate
            )));
        }
        if !(self.history_seconds > 0.0) {
            return Err(VisualizerError::Config(format!(
                "history_seconds must be positive, got {}",
                self.history_seconds
            )));
        }
        if self.history_decimation == 0 || self.spectrogram_columns == 0 || self.frame_rate == 0 {
            return Err(VisualizerError::Config(
                "history_decimation, spectrogram_columns and frame_rate must be non-zero"
                    .to_string(),
            ));
        }
        if self.frame_rate > MAX_FRAME_RATE {
            return Err(VisualizerError::Config(format!(
                "frame_rate must be at most {}, got {}",
                MAX_FRAME_RATE, self.frame_rate
            )));
        }
        if !(self.initial_gain >= 0.0) {
            return Err(VisualizerError::Config(format!(
                "initial_gain must be non-negative, got {}",
                self.initial_gain
            )));
        }
        Ok(())
    }
}
