// Time/frequency extraction with the byte-output contract of a platform
// analyser node.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::error::{Result, VisualizerError};

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;

/// Analyser node that keeps the most recent `fft_size` samples.
pub struct Analyser {
    fft_size: usize,
    min_decibels: f64,
    max_decibels: f64,
    smoothing_time_constant: f64,
    fft: Arc<dyn Fft<f32>>,
    /// Pre-computed Blackman window
    window: Vec<f32>,
    /// Circular sample buffer
    samples: Vec<f32>,
    write_index: usize,
    /// Smoothed linear magnitudes, one per bin
    smoothed: Vec<f64>,
    scratch: Vec<Complex<f32>>,
}

impl Analyser {
    pub fn new(
        fft_size: usize,
        min_decibels: f64,
        max_decibels: f64,
        smoothing_time_constant: f64,
    ) -> Result<Self> {
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(VisualizerError::Config(format!(
                "fft_size must be a power of two in [{}, {}], got {}",
                MIN_FFT_SIZE, MAX_FFT_SIZE, fft_size
            )));
        }
        if min_decibels >= max_decibels || min_decibels.is_nan() || max_decibels.is_nan() {
            return Err(VisualizerError::InvalidRange {
                start: min_decibels,
                end: max_decibels,
            });
        }
        if !(0.0..=1.0).contains(&smoothing_time_constant) {
            return Err(VisualizerError::Config(format!(
                "smoothing_time_constant must be in [0, 1], got {}",
                smoothing_time_constant
            )));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
            })
            .collect();

        Ok(Self {
            fft_size,
            min_decibels,
            max_decibels,
            smoothing_time_constant,
            fft,
            window,
            samples: vec![0.0; fft_size],
            write_index: 0,
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed new mono samples into the analysis window.
    pub fn write(&mut self, input: &[f32]) {
        for &sample in input {
            self.samples[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % self.fft_size;
        }
    }

    /// Oldest-first iterator over the current window.
    fn window_samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.samples[self.write_index..]
            .iter()
            .chain(self.samples[..self.write_index].iter())
            .copied()
    }

    /// Fills `out` with the most recent samples as bytes, 128 being zero.
    pub fn byte_time_domain_data(&self, out: &mut [u8]) {
        let skip = self.fft_size.saturating_sub(out.len());
        for (dst, sample) in out.iter_mut().zip(self.window_samples().skip(skip)) {
            let value = (128.0 * (1.0 + sample as f64)).floor();
            *dst = value.clamp(0.0, 255.0) as u8;
        }
    }

    /// Computes a smoothed spectrum and fills `out` with byte magnitudes.
    ///
    /// Each call advances the smoothing state by one step.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let mut scratch = std::mem::take(&mut self.scratch);
        for ((dst, sample), w) in scratch
            .iter_mut()
            .zip(self.window_samples())
            .zip(self.window.iter())
        {
            *dst = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut scratch);

        let n = self.fft_size as f64;
        let tau = self.smoothing_time_constant;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(scratch.iter()) {
            let magnitude = (bin.norm() as f64) / n;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
        }
        self.scratch = scratch;

        let range = self.max_decibels - self.min_decibels;
        for (dst, &magnitude) in out.iter_mut().zip(self.smoothed.iter()) {
            let db = 20.0 * magnitude.log10();
            let scaled = (255.0 / range * (db - self.min_decibels)).floor();
            // -inf (silence) and NaN both land on the floor.
            *dst = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, 255.0) as u8
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_rejects_bad_fft_size() {
        assert!(Analyser::new(1000, -100.0, -30.0, 0.8).is_err());
        assert!(Analyser::new(16, -100.0, -30.0, 0.8).is_err());
        assert!(Analyser::new(2048, -30.0, -100.0, 0.8).is_err());
    }

    #[test]
    fn test_silence_is_floor_and_midpoint() {
        let mut analyser = Analyser::new(2048, -100.0, -30.0, 0.8).unwrap();
        let mut time = vec![0u8; 2048];
        let mut freq = vec![255u8; 1024];
        analyser.byte_time_domain_data(&mut time);
        analyser.byte_frequency_data(&mut freq);
        assert!(time.iter().all(|&b| b == 128));
        assert!(freq.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sine_peaks_at_expected_bin() {
        let mut analyser = Analyser::new(2048, -100.0, -30.0, 0.0).unwrap();
        // Bin 100 at 44.1kHz / 2048
        let freq_hz = 100.0 * 44100.0 / 2048.0;
        analyser.write(&sine(freq_hz, 44100.0, 2048, 0.01));

        let mut freq = vec![0u8; 1024];
        analyser.byte_frequency_data(&mut freq);
        let (peak_bin, _) = freq
            .iter()
            .enumerate()
            .max_by_key(|(_, &v)| v)
            .unwrap();
        assert_eq!(peak_bin, 100);
    }

    #[test]
    fn test_time_domain_keeps_latest_samples() {
        let mut analyser = Analyser::new(32, -100.0, -30.0, 0.8).unwrap();
        analyser.write(&[0.0; 40]);
        analyser.write(&[1.0, -1.0]);
        let mut time = vec![0u8; 32];
        analyser.byte_time_domain_data(&mut time);
        assert_eq!(time[30], 255);
        assert_eq!(time[31], 0);
        assert_eq!(time[0], 128);
    }
}
