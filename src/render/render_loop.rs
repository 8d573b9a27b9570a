use log::debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::{ChartSurface, SeriesId};
use crate::analysis::SharedPipeline;
use crate::app::config::MAX_FRAME_RATE;

/// Pushes the pipeline's point buffers to the surface once per display
/// frame. It never waits for audio: a tick with no new blocks redraws the
/// last state, which is what keeps a paused context on screen.
pub struct RenderLoop<S: ChartSurface> {
    pipeline: SharedPipeline,
    surface: Arc<Mutex<S>>,
    frame_interval: Duration,
    frames: u64,
}

impl<S: ChartSurface> RenderLoop<S> {
    pub fn new(pipeline: SharedPipeline, surface: Arc<Mutex<S>>, frame_rate: u32) -> Self {
        Self {
            pipeline,
            surface,
            frame_interval: Duration::from_secs_f64(
                1.0 / frame_rate.clamp(1, MAX_FRAME_RATE) as f64,
            ),
            frames: 0,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Replaces the waveform, spectrum, decay and peak series.
    pub fn tick(&mut self) {
        let pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        let mut surface = self.surface.lock().unwrap_or_else(PoisonError::into_inner);

        surface.set_series(SeriesId::Waveform, pipeline.waveform_points());
        surface.set_series(SeriesId::Spectrum, pipeline.spectrum_points());
        surface.set_series(SeriesId::Decay, pipeline.decay_points());
        surface.set_series(SeriesId::PeakHold, pipeline.peak_points());

        self.frames += 1;
    }

    /// Ticks at the frame rate until `shutdown` fires or its sender is
    /// dropped.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.frame_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = &mut shutdown => break,
            }
        }
        debug!("Render loop stopped after {} frames", self.frames);
    }
}
