pub mod catalog;
pub mod config;

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::analysis::{AnalysisPipeline, PipelineSettings, SharedPipeline};
use crate::audio::{
    AssetFetcher, AudioBackend, AudioGraph, BlockStream, ContextState, HttpFetcher, SignalSource,
    SourceKind, SourceLoader,
};
use crate::error::{Result, VisualizerError};
use crate::render::{ChartSurface, RenderLoop, SeriesId};
use catalog::SourceOption;
use config::VisualizerConfig;

/// Result of a source selection that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    Connected,
    /// A later selection started while this one was loading; the loaded
    /// source was released without being connected.
    Superseded,
}

/// One visualizer instance: the audio context, the analysis worker and the
/// chart surface they feed. Methods take `&self` so the instance can sit
/// behind an `Arc` shared by the UI and background tasks.
pub struct Visualizer<S: ChartSurface + 'static> {
    config: VisualizerConfig,
    backend: Arc<dyn AudioBackend>,
    graph: AudioGraph,
    pipeline: SharedPipeline,
    surface: Arc<Mutex<S>>,
    loader: SourceLoader,
    /// Bumped by every source change, stale acquisitions compare against it
    generation: AtomicU64,
    /// Serialises the generation check with the connect that follows it
    swap_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    analysis_running: Arc<AtomicBool>,
}

impl<S: ChartSurface + 'static> Visualizer<S> {
    pub fn new(config: VisualizerConfig, backend: Arc<dyn AudioBackend>, surface: S) -> Result<Self> {
        Self::with_fetcher(config, backend, Arc::new(HttpFetcher::new()), surface)
    }

    /// Builds the context suspended, with the configured initial gain, and
    /// starts the analysis worker.
    pub fn with_fetcher(
        config: VisualizerConfig,
        backend: Arc<dyn AudioBackend>,
        fetcher: Arc<dyn AssetFetcher>,
        surface: S,
    ) -> Result<Self> {
        config.validate()?;

        let sample_rate = backend.sample_rate();
        let pipeline =
            AnalysisPipeline::new(PipelineSettings::from_config(&config, sample_rate))?.shared();
        let (graph, stream) = AudioGraph::new(backend.as_ref(), &config)?;
        let surface = Arc::new(Mutex::new(surface));

        let analysis_running = Arc::new(AtomicBool::new(true));
        let worker = {
            let pipeline = Arc::clone(&pipeline);
            let surface = Arc::clone(&surface);
            let running = Arc::clone(&analysis_running);
            thread::Builder::new()
                .name("audioscope-analysis".to_string())
                .spawn(move || {
                    run_analysis(stream, pipeline, surface);
                    running.store(false, Ordering::Release);
                })?
        };

        info!(
            "Visualizer ready: {} Hz, {} bins, context {}",
            sample_rate,
            config.fft_size / 2,
            graph.state()
        );

        Ok(Self {
            loader: SourceLoader::new(fetcher, sample_rate),
            config,
            backend,
            graph,
            pipeline,
            surface,
            generation: AtomicU64::new(0),
            swap_lock: Mutex::new(()),
            worker: Mutex::new(Some(worker)),
            analysis_running,
        })
    }

    pub fn config(&self) -> &VisualizerConfig {
        &self.config
    }

    pub fn play(&self) -> Result<()> {
        self.graph.resume()
    }

    pub fn pause(&self) -> Result<()> {
        self.graph.suspend()
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.graph.set_gain(gain)
    }

    pub fn gain(&self) -> f32 {
        self.graph.gain()
    }

    pub fn state(&self) -> ContextState {
        self.graph.state()
    }

    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ContextState::Closed {
            return Err(VisualizerError::UnsupportedContext(
                "visualizer is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Connects `source`, or disconnects the current one on `None`. The
    /// previous source is always released first. Pending selections are
    /// superseded.
    pub fn set_source(&self, source: Option<SignalSource>) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        match source {
            Some(source) => self.graph.connect_source(source),
            None => {
                self.graph.disconnect_current_source();
                Ok(())
            }
        }
    }

    pub fn current_source(&self) -> Option<(String, SourceKind)> {
        self.graph.current_source()
    }

    /// Opens the default microphone without connecting it.
    pub async fn create_mic_source(&self) -> Result<SignalSource> {
        self.ensure_open()?;
        let backend = Arc::clone(&self.backend);
        let (device, capture) = tokio::task::spawn_blocking(move || backend.open_input())
            .await
            .map_err(|e| VisualizerError::DeviceUnavailable(e.to_string()))??;
        Ok(SignalSource::microphone(capture, device, self.sample_rate()))
    }

    /// Fetches and decodes `url` (through the decode cache) without
    /// connecting it.
    pub async fn create_url_source(&self, url: &str) -> Result<SignalSource> {
        self.ensure_open()?;
        let buffer = self.loader.load(url).await?;
        Ok(SignalSource::buffer(url, buffer))
    }

    /// Acquires the selected source and swaps it in, then resumes the
    /// context. On failure the previous source stays connected.
    pub async fn select(&self, option: SourceOption) -> Result<SelectOutcome> {
        self.ensure_open()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Selecting {} (generation {})", option, generation);

        let acquired = match &option {
            SourceOption::Microphone => self.create_mic_source().await,
            SourceOption::Preset(preset) => self
                .create_url_source(&preset.url(&self.config.asset_dir))
                .await
                .map(|source| source.with_label(preset.label())),
            SourceOption::Url(url) => self.create_url_source(url).await,
        };
        let source = match acquired {
            Ok(source) => source,
            Err(e) => {
                warn!("Could not select {}: {}", option, e);
                return Err(e);
            }
        };

        {
            let _guard = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Discarding superseded selection {}", option);
                return Ok(SelectOutcome::Superseded);
            }
            self.graph.connect_source(source)?;
        }
        self.play()?;
        Ok(SelectOutcome::Connected)
    }

    /// Zeroes the peak-hold envelope and clears the displayed peak series.
    pub fn reset_peaks(&self) -> Result<()> {
        self.ensure_open()?;
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_peaks();
        self.surface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_series(SeriesId::PeakHold);
        debug!("Peaks reset");
        Ok(())
    }

    /// A render loop over this instance's pipeline and surface.
    pub fn render_loop(&self) -> RenderLoop<S> {
        RenderLoop::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.surface),
            self.config.frame_rate,
        )
    }

    pub fn pipeline(&self) -> SharedPipeline {
        Arc::clone(&self.pipeline)
    }

    pub fn surface(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.surface)
    }

    pub fn blocks_processed(&self) -> u64 {
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks_processed()
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.graph.blocks_dropped()
    }

    /// `false` once the analysis worker has stopped, after close or a fatal
    /// block failure.
    pub fn analysis_running(&self) -> bool {
        self.analysis_running.load(Ordering::Acquire)
    }

    /// Releases the source and the audio device and waits for the analysis
    /// worker. Idempotent.
    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.graph.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Analysis worker panicked");
            }
        }
    }
}

impl<S: ChartSurface + 'static> Drop for Visualizer<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the analysis worker. Feeds every tap block through the pipeline
/// and appends the scrolling series to the surface. Exits when the graph
/// goes away or a block fails.
fn run_analysis<S: ChartSurface>(
    mut stream: BlockStream,
    pipeline: SharedPipeline,
    surface: Arc<Mutex<S>>,
) {
    let mut history = Vec::new();
    let mut column = Vec::new();
    let mut reported_drops = 0;

    while let Some(block) = stream.blocking_recv() {
        {
            let mut pipeline = pipeline.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = pipeline.process_block(&block) {
                error!("Analysis stopped: {}", e);
                break;
            }
            history.clear();
            history.extend_from_slice(pipeline.last_history_run());
            pipeline.latest_column_intensity(&mut column);
        }
        {
            let mut surface = surface.lock().unwrap_or_else(PoisonError::into_inner);
            surface.append_history(SeriesId::WaveformHistory, &history);
            surface.write_grid_column(SeriesId::Spectrogram, &column);
        }
        stream.recycle(block);

        let dropped = stream.dropped();
        if dropped > reported_drops {
            warn!(
                "Analysis fell behind, {} blocks dropped",
                dropped - reported_drops
            );
            reported_drops = dropped;
        }
    }
    debug!("Analysis worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{OfflineBackend, PcmBuffer};
    use crate::render::MockChartSurface;

    fn config() -> VisualizerConfig {
        VisualizerConfig {
            fft_size: 256,
            block_size: 256,
            ..VisualizerConfig::default()
        }
    }

    fn quiet_surface() -> MockChartSurface {
        let mut surface = MockChartSurface::new();
        surface.expect_set_series().returning(|_, _| ());
        surface.expect_append_history().returning(|_, _| ());
        surface.expect_write_grid_column().returning(|_, _| ());
        surface.expect_reset_series().returning(|_| ());
        surface
    }

    fn tone() -> SignalSource {
        SignalSource::buffer(
            "tone",
            Arc::new(PcmBuffer {
                samples: (0..64).map(|i| (i as f32 / 10.0).sin()).collect(),
                sample_rate: 8000,
            }),
        )
    }

    #[test]
    fn test_starts_suspended_and_muted() {
        let backend = Arc::new(OfflineBackend::new(8000, 1));
        let visualizer = Visualizer::new(config(), backend, quiet_surface()).unwrap();
        assert_eq!(visualizer.state(), ContextState::Suspended);
        assert_eq!(visualizer.gain(), 0.0);
        assert!(visualizer.analysis_running());
    }

    #[test]
    fn test_invalid_config_fails_before_audio() {
        let backend = Arc::new(OfflineBackend::new(8000, 1));
        let mut bad = config();
        bad.fft_size = 300;
        assert!(Visualizer::new(bad, backend.clone(), quiet_surface()).is_err());
        assert!(!backend.has_output());
    }

    #[test]
    fn test_play_pause_and_source_swap() {
        let backend = Arc::new(OfflineBackend::new(8000, 1));
        let visualizer = Visualizer::new(config(), backend.clone(), quiet_surface()).unwrap();

        visualizer.play().unwrap();
        assert_eq!(visualizer.state(), ContextState::Running);
        visualizer.pause().unwrap();
        assert_eq!(visualizer.state(), ContextState::Suspended);

        visualizer.set_source(Some(tone())).unwrap();
        assert_eq!(
            visualizer.current_source(),
            Some(("tone".to_string(), SourceKind::Buffer))
        );
        visualizer.set_source(None).unwrap();
        assert!(visualizer.current_source().is_none());
        // Disconnecting twice is a no-op
        visualizer.set_source(None).unwrap();
    }

    #[test]
    fn test_reset_peaks_clears_surface_series() {
        let backend = Arc::new(OfflineBackend::new(8000, 1));
        let mut surface = MockChartSurface::new();
        surface
            .expect_reset_series()
            .with(mockall::predicate::eq(SeriesId::PeakHold))
            .times(2)
            .returning(|_| ());

        let visualizer = Visualizer::new(config(), backend, surface).unwrap();
        visualizer.reset_peaks().unwrap();
        visualizer.reset_peaks().unwrap();
        let pipeline = visualizer.pipeline();
        assert!(pipeline.lock().unwrap().peaks().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_closed_visualizer_rejects_operations() {
        let backend = Arc::new(OfflineBackend::new(8000, 1));
        let visualizer = Visualizer::new(config(), backend, quiet_surface()).unwrap();
        visualizer.close();
        visualizer.close();

        assert_eq!(visualizer.state(), ContextState::Closed);
        assert!(!visualizer.analysis_running());
        assert!(matches!(
            visualizer.play(),
            Err(VisualizerError::UnsupportedContext(_))
        ));
        assert!(matches!(
            visualizer.set_source(Some(tone())),
            Err(VisualizerError::UnsupportedContext(_))
        ));
        assert!(matches!(
            visualizer.reset_peaks(),
            Err(VisualizerError::UnsupportedContext(_))
        ));
        let result = tokio_test::block_on(visualizer.create_url_source("anything.wav"));
        assert!(matches!(result, Err(VisualizerError::UnsupportedContext(_))));
    }
}
