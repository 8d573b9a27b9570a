// Per-block signal processing: decay and peak-hold envelopes, scaling into
// display units, and the rolling waveform and spectrogram models.
//
// Every buffer is allocated once in AnalysisPipeline::new and mutated in
// place for the lifetime of the pipeline.

mod history;
mod spectrogram;

pub use history::WaveformHistory;
pub use spectrogram::SpectrogramGrid;

use log::debug;
use std::sync::{Arc, Mutex};

use crate::app::config::VisualizerConfig;
use crate::error::{Result, VisualizerError};
use crate::render::DisplayPoint;
use crate::scaler::Scaler;

pub type SharedPipeline = Arc<Mutex<AnalysisPipeline>>;

/// One tap block as captured from the analyser.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisBlock {
    /// Byte samples, 128 is zero amplitude
    pub time_domain: Vec<u8>,
    /// Byte magnitudes, 0 is the silence floor
    pub frequency: Vec<u8>,
}

impl AnalysisBlock {
    pub fn silent(fft_size: usize) -> Self {
        Self {
            time_domain: vec![128; fft_size],
            frequency: vec![0; fft_size / 2],
        }
    }
}

/// Construction-time parameters of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub fft_size: usize,
    /// Samples between two tap invocations
    pub block_size: usize,
    pub sample_rate: u32,
    pub min_decibels: f64,
    pub max_decibels: f64,
    /// Byte units subtracted from the decay envelope per block
    pub decay_rate: f32,
    pub history_seconds: f64,
    /// Keep every n-th sample in the waveform history
    pub history_decimation: usize,
    pub spectrogram_columns: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &VisualizerConfig, sample_rate: u32) -> Self {
        Self {
            fft_size: config.fft_size,
            block_size: config.block_size,
            sample_rate,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            decay_rate: config.decay_rate,
            history_seconds: config.history_seconds,
            history_decimation: config.history_decimation,
            spectrogram_columns: config.spectrogram_columns,
        }
    }
}

pub struct AnalysisPipeline {
    settings: PipelineSettings,
    time_domain: Vec<u8>,
    frequency: Vec<u8>,
    decay: Vec<f32>,
    peaks: Vec<u8>,
    waveform_points: Vec<DisplayPoint>,
    spectrum_points: Vec<DisplayPoint>,
    decay_points: Vec<DisplayPoint>,
    peak_points: Vec<DisplayPoint>,
    frequency_x: Scaler,
    magnitude_y: Scaler,
    sample_x: Scaler,
    amplitude_y: Scaler,
    history: WaveformHistory,
    /// Points appended to the history by the most recent block
    last_run: Vec<DisplayPoint>,
    spectrogram: SpectrogramGrid,
    /// Running sample counter driving the history x axis
    samples_processed: u64,
    blocks_processed: u64,
}

impl AnalysisPipeline {
    pub fn new(settings: PipelineSettings) -> Result<Self> {
        if settings.fft_size < 2 {
            return Err(VisualizerError::Config(format!(
                "fft_size too small: {}",
                settings.fft_size
            )));
        }
        if settings.block_size == 0 || settings.sample_rate == 0 {
            return Err(VisualizerError::Config(
                "block_size and sample_rate must be non-zero".to_string(),
            ));
        }
        if settings.min_decibels >= settings.max_decibels {
            return Err(VisualizerError::InvalidRange {
                start: settings.min_decibels,
                end: settings.max_decibels,
            });
        }

        let bins = settings.fft_size / 2;
        let frequency_x =
            Scaler::multiplier(settings.sample_rate as f64 / settings.fft_size as f64);
        let magnitude_y = Scaler::decibels(settings.min_decibels, settings.max_decibels)?;
        let sample_x = Scaler::identity();
        let amplitude_y = Scaler::amplitude();

        let mut pipeline = Self {
            time_domain: vec![128; settings.fft_size],
            frequency: vec![0; bins],
            decay: vec![0.0; bins],
            peaks: vec![0; bins],
            waveform_points: vec![DisplayPoint::default(); settings.fft_size],
            spectrum_points: vec![DisplayPoint::default(); bins],
            decay_points: vec![DisplayPoint::default(); bins],
            peak_points: vec![DisplayPoint::default(); bins],
            frequency_x,
            magnitude_y,
            sample_x,
            amplitude_y,
            history: WaveformHistory::new(settings.history_seconds),
            last_run: Vec::with_capacity(settings.block_size.min(settings.fft_size)),
            spectrogram: SpectrogramGrid::new(bins, settings.spectrogram_columns),
            samples_processed: 0,
            blocks_processed: 0,
            settings,
        };
        pipeline.rescale();

        debug!(
            "Analysis pipeline ready: {} bins, {:.2} Hz per bin",
            bins,
            pipeline.bin_frequency(1)
        );
        Ok(pipeline)
    }

    pub fn shared(self) -> SharedPipeline {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.frequency.len()
    }

    /// Centre frequency of `bin` in Hz.
    pub fn bin_frequency(&self, bin: usize) -> f64 {
        self.frequency_x.apply(bin as f64)
    }

    /// Advances the pipeline by one tap block.
    pub fn process_block(&mut self, block: &AnalysisBlock) -> Result<()> {
        if block.time_domain.len() != self.time_domain.len()
            || block.frequency.len() != self.frequency.len()
        {
            return Err(VisualizerError::AnalysisFailed(format!(
                "block shape {}x{} does not match {}x{}",
                block.time_domain.len(),
                block.frequency.len(),
                self.time_domain.len(),
                self.frequency.len()
            )));
        }

        self.time_domain.copy_from_slice(&block.time_domain);
        self.frequency.copy_from_slice(&block.frequency);

        let rate = self.settings.decay_rate;
        for (decay, &current) in self.decay.iter_mut().zip(self.frequency.iter()) {
            *decay = (*decay - rate).max(0.0).max(current as f32);
        }
        for (peak, &current) in self.peaks.iter_mut().zip(self.frequency.iter()) {
            *peak = (*peak).max(current);
        }

        self.rescale();
        self.append_history();

        self.samples_processed += self.settings.block_size as u64;
        self.blocks_processed += 1;
        let elapsed = self.elapsed_seconds();
        self.spectrogram.push_column(&self.frequency, elapsed);

        Ok(())
    }

    /// Zeroes the peak-hold envelope and its points. Decay and the current
    /// frequency reading are untouched.
    pub fn reset_peaks(&mut self) {
        self.peaks.iter_mut().for_each(|p| *p = 0);
        for (i, point) in self.peak_points.iter_mut().enumerate() {
            *point = DisplayPoint::new(
                self.frequency_x.apply(i as f64),
                self.magnitude_y.apply(0.0),
            );
        }
    }

    fn rescale(&mut self) {
        for (i, (point, &value)) in self
            .waveform_points
            .iter_mut()
            .zip(self.time_domain.iter())
            .enumerate()
        {
            *point = DisplayPoint::new(
                self.sample_x.apply(i as f64),
                self.amplitude_y.apply(value as f64),
            );
        }

        let frequency_x = &self.frequency_x;
        let magnitude_y = &self.magnitude_y;
        let scale_bins = |points: &mut [DisplayPoint], values: &mut dyn Iterator<Item = f64>| {
            for (i, (point, value)) in points.iter_mut().zip(values).enumerate() {
                *point = DisplayPoint::new(frequency_x.apply(i as f64), magnitude_y.apply(value));
            }
        };
        scale_bins(
            &mut self.spectrum_points,
            &mut self.frequency.iter().map(|&v| v as f64),
        );
        scale_bins(
            &mut self.decay_points,
            &mut self.decay.iter().map(|&v| v as f64),
        );
        scale_bins(
            &mut self.peak_points,
            &mut self.peaks.iter().map(|&v| v as f64),
        );
    }

    /// Appends the samples new since the previous block to the history.
    fn append_history(&mut self) {
        let fft_size = self.settings.fft_size;
        let block_size = self.settings.block_size;
        let run_len = block_size.min(fft_size);
        let stride = self.settings.history_decimation.max(1) as u64;
        let sample_rate = self.settings.sample_rate as f64;
        // Absolute index of the first sample of this run
        let base = self.samples_processed + (block_size - run_len) as u64;

        self.last_run.clear();
        for (k, &value) in self.time_domain[fft_size - run_len..].iter().enumerate() {
            let index = base + k as u64;
            if index % stride != 0 {
                continue;
            }
            self.last_run.push(DisplayPoint::new(
                index as f64 / sample_rate,
                self.amplitude_y.apply(value as f64),
            ));
        }
        self.history.append(&self.last_run);
    }

    pub fn time_domain(&self) -> &[u8] {
        &self.time_domain
    }

    pub fn frequency(&self) -> &[u8] {
        &self.frequency
    }

    pub fn decay(&self) -> &[f32] {
        &self.decay
    }

    pub fn peaks(&self) -> &[u8] {
        &self.peaks
    }

    pub fn waveform_points(&self) -> &[DisplayPoint] {
        &self.waveform_points
    }

    pub fn spectrum_points(&self) -> &[DisplayPoint] {
        &self.spectrum_points
    }

    pub fn decay_points(&self) -> &[DisplayPoint] {
        &self.decay_points
    }

    pub fn peak_points(&self) -> &[DisplayPoint] {
        &self.peak_points
    }

    pub fn history(&self) -> &WaveformHistory {
        &self.history
    }

    pub fn last_history_run(&self) -> &[DisplayPoint] {
        &self.last_run
    }

    pub fn spectrogram(&self) -> &SpectrogramGrid {
        &self.spectrogram
    }

    /// Latest spectrogram column as intensities in `[0, 1]`.
    pub fn latest_column_intensity(&self, out: &mut Vec<f32>) {
        out.clear();
        if let Some((_, column)) = self.spectrogram.latest() {
            out.extend(column.iter().map(|&v| v as f32 / 255.0));
        }
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.samples_processed as f64 / self.settings.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            fft_size: 2048,
            block_size: 2048,
            sample_rate: 44100,
            min_decibels: -100.0,
            max_decibels: -30.0,
            decay_rate: 0.025,
            history_seconds: 1.0,
            history_decimation: 1,
            spectrogram_columns: 8,
        }
    }

    fn block_with(frequency: &[u8]) -> AnalysisBlock {
        let mut block = AnalysisBlock::silent(2048);
        block.frequency[..frequency.len()].copy_from_slice(frequency);
        block
    }

    #[test]
    fn test_buffer_sizes_follow_fft_size() {
        let pipeline = AnalysisPipeline::new(settings()).unwrap();
        assert_eq!(pipeline.frequency_bin_count(), 1024);
        assert_eq!(pipeline.time_domain().len(), 2048);
        assert_eq!(pipeline.decay().len(), 1024);
        assert_eq!(pipeline.peak_points().len(), 1024);
        assert_eq!(pipeline.waveform_points().len(), 2048);
    }

    #[test]
    fn test_bin_frequency() {
        let pipeline = AnalysisPipeline::new(settings()).unwrap();
        let hz = pipeline.bin_frequency(100);
        assert!((hz - 2153.32).abs() < 0.01);
        assert_eq!(pipeline.spectrum_points()[100].x, hz);
    }

    #[test]
    fn test_decay_falls_toward_current_value() {
        let mut s = settings();
        s.decay_rate = 10.0;
        let mut pipeline = AnalysisPipeline::new(s).unwrap();

        pipeline.process_block(&block_with(&[200, 50])).unwrap();
        assert_eq!(pipeline.decay()[0], 200.0);

        pipeline.process_block(&block_with(&[0, 100])).unwrap();
        assert_eq!(pipeline.decay()[0], 190.0);
        assert_eq!(pipeline.decay()[1], 100.0);

        for _ in 0..30 {
            pipeline.process_block(&block_with(&[0, 0])).unwrap();
            for (d, &f) in pipeline.decay().iter().zip(pipeline.frequency()) {
                assert!(*d >= f as f32);
                assert!(*d >= 0.0);
            }
        }
        assert_eq!(pipeline.decay()[0], 0.0);
    }

    #[test]
    fn test_peaks_are_monotonic_until_reset() {
        let mut pipeline = AnalysisPipeline::new(settings()).unwrap();
        let readings: [&[u8]; 4] = [&[10, 90], &[50, 20], &[5, 95], &[0, 0]];
        let mut previous = pipeline.peaks().to_vec();
        for reading in readings {
            pipeline.process_block(&block_with(reading)).unwrap();
            for (i, (&now, &before)) in pipeline.peaks().iter().zip(previous.iter()).enumerate() {
                assert!(now >= before);
                assert!(now >= pipeline.frequency()[i]);
            }
            previous = pipeline.peaks().to_vec();
        }
        assert_eq!(&pipeline.peaks()[..2], &[50, 95]);

        pipeline.reset_peaks();
        assert!(pipeline.peaks().iter().all(|&p| p == 0));
        pipeline.reset_peaks();
        assert!(pipeline.peaks().iter().all(|&p| p == 0));
        assert!(pipeline.peak_points().iter().all(|p| p.y == -100.0));
    }

    #[test]
    fn test_reset_peaks_keeps_decay_and_frequency() {
        let mut pipeline = AnalysisPipeline::new(settings()).unwrap();
        pipeline.process_block(&block_with(&[120])).unwrap();
        pipeline.reset_peaks();
        assert_eq!(pipeline.frequency()[0], 120);
        assert_eq!(pipeline.decay()[0], 120.0);
    }

    #[test]
    fn test_points_are_scaled() {
        let mut pipeline = AnalysisPipeline::new(settings()).unwrap();
        let mut block = block_with(&[255]);
        block.time_domain[0] = 0;
        block.time_domain[1] = 255;
        pipeline.process_block(&block).unwrap();

        assert_eq!(pipeline.spectrum_points()[0].y, -30.0);
        assert_eq!(pipeline.spectrum_points()[1].y, -100.0);
        assert_eq!(pipeline.waveform_points()[0], DisplayPoint::new(0.0, -1.0));
        assert_eq!(pipeline.waveform_points()[1], DisplayPoint::new(1.0, 1.0));
    }

    #[test]
    fn test_history_and_grid_advance_per_block() {
        let mut s = settings();
        s.sample_rate = 2048;
        s.history_decimation = 4;
        let mut pipeline = AnalysisPipeline::new(s).unwrap();

        for _ in 0..5 {
            pipeline.process_block(&AnalysisBlock::silent(2048)).unwrap();
        }
        assert_eq!(pipeline.samples_processed(), 5 * 2048);
        assert_eq!(pipeline.last_history_run().len(), 512);
        assert_eq!(pipeline.spectrogram().len(), 5);
        assert_eq!(pipeline.spectrogram().latest().unwrap().0, 5.0);

        // One second retained at 2048Hz
        let history = pipeline.history();
        let newest = history.newest().unwrap().x;
        assert!(history.points().all(|p| p.x >= newest - 1.0));
        assert!(history.oldest().unwrap().x > 3.0);
    }

    #[test]
    fn test_rejects_mismatched_block() {
        let mut pipeline = AnalysisPipeline::new(settings()).unwrap();
        let block = AnalysisBlock::silent(1024);
        assert!(matches!(
            pipeline.process_block(&block),
            Err(VisualizerError::AnalysisFailed(_))
        ));
        assert_eq!(pipeline.blocks_processed(), 0);
    }

    #[test]
    fn test_degenerate_db_range_fails() {
        let mut s = settings();
        s.max_decibels = s.min_decibels;
        assert!(matches!(
            AnalysisPipeline::new(s),
            Err(VisualizerError::InvalidRange { .. })
        ));
    }
}
