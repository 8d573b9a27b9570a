// The processing context: source, analyser, block tap and output gain.
//
// Everything that touches samples lives in GraphProcessor, which the
// backend drives from its realtime thread. AudioGraph is the control
// side. The two talk through atomics and a command channel so the realtime
// side never waits on a lock.

use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::analyser::Analyser;
use super::backend::{AudioBackend, DeviceHandle};
use super::source::{SignalSource, SourceKind, SourceNode};
use crate::analysis::AnalysisBlock;
use crate::app::config::VisualizerConfig;
use crate::error::{Result, VisualizerError};

/// Tap blocks waiting for the analysis worker before new ones are dropped.
const BLOCK_QUEUE_DEPTH: usize = 8;

/// Blocks allocated up front: the queue, one held by the worker, one spare.
const BLOCK_POOL_SIZE: usize = BLOCK_QUEUE_DEPTH + 2;

/// Frames pulled from the source per pass. Larger device buffers are
/// rendered in several passes.
const MAX_RENDER_FRAMES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Suspended,
            1 => ContextState::Running,
            _ => ContextState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ContextState::Suspended => 0,
            ContextState::Running => 1,
            ContextState::Closed => 2,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Suspended => write!(f, "suspended"),
            ContextState::Running => write!(f, "running"),
            ContextState::Closed => write!(f, "closed"),
        }
    }
}

enum GraphCommand {
    Connect(Box<dyn SourceNode>),
    Disconnect,
}

/// Values shared with the realtime thread.
struct GraphControl {
    state: AtomicU8,
    /// f32 bits
    gain: AtomicU32,
    blocks_emitted: AtomicU64,
    blocks_dropped: AtomicU64,
}

impl GraphControl {
    fn new(gain: f32) -> Self {
        Self {
            state: AtomicU8::new(ContextState::Suspended.as_u8()),
            gain: AtomicU32::new(gain.to_bits()),
            blocks_emitted: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }
}

/// Receiving end of the tap. Processed blocks should be handed back with
/// [`BlockStream::recycle`] so the realtime side can reuse their buffers.
pub struct BlockStream {
    blocks: mpsc::Receiver<AnalysisBlock>,
    recycle: mpsc::UnboundedSender<AnalysisBlock>,
    control: Arc<GraphControl>,
}

impl BlockStream {
    /// Waits for the next block from a non-async thread. `None` once the
    /// graph is gone.
    pub fn blocking_recv(&mut self) -> Option<AnalysisBlock> {
        self.blocks.blocking_recv()
    }

    pub async fn recv(&mut self) -> Option<AnalysisBlock> {
        self.blocks.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AnalysisBlock> {
        self.blocks.try_recv().ok()
    }

    pub fn recycle(&self, block: AnalysisBlock) {
        let _ = self.recycle.send(block);
    }

    /// Blocks the tap discarded because this end fell behind.
    pub fn dropped(&self) -> u64 {
        self.control.blocks_dropped.load(Ordering::Relaxed)
    }
}

/// Collects a fixed number of samples, then snapshots the analyser into an
/// [`AnalysisBlock`] and hands it to the analysis worker.
pub struct BlockTap {
    block_size: usize,
    filled: usize,
    sender: mpsc::Sender<AnalysisBlock>,
    recycled: mpsc::UnboundedReceiver<AnalysisBlock>,
    /// Never grows past `BLOCK_POOL_SIZE`
    free: Vec<AnalysisBlock>,
    control: Arc<GraphControl>,
}

impl BlockTap {
    fn new(
        block_size: usize,
        fft_size: usize,
        sender: mpsc::Sender<AnalysisBlock>,
        recycled: mpsc::UnboundedReceiver<AnalysisBlock>,
        control: Arc<GraphControl>,
    ) -> Self {
        Self {
            block_size,
            filled: 0,
            sender,
            recycled,
            free: (0..BLOCK_POOL_SIZE)
                .map(|_| AnalysisBlock::silent(fft_size))
                .collect(),
            control,
        }
    }

    /// Feeds `input` to the analyser, emitting a block at every block
    /// boundary crossed. Blocks come from the preallocated pool; with the
    /// pool exhausted the block is counted as dropped.
    fn process(&mut self, input: &[f32], analyser: &mut Analyser) {
        let mut rest = input;
        while !rest.is_empty() {
            let take = (self.block_size - self.filled).min(rest.len());
            analyser.write(&rest[..take]);
            self.filled += take;
            rest = &rest[take..];
            if self.filled == self.block_size {
                self.filled = 0;
                self.emit(analyser);
            }
        }
    }

    fn emit(&mut self, analyser: &mut Analyser) {
        let block = match self.free.pop() {
            Some(block) => Some(block),
            None => self.recycled.try_recv().ok(),
        };
        let Some(mut block) = block else {
            self.control.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        analyser.byte_time_domain_data(&mut block.time_domain);
        analyser.byte_frequency_data(&mut block.frequency);

        match self.sender.try_send(block) {
            Ok(()) => {
                self.control.blocks_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(block)) | Err(TrySendError::Closed(block)) => {
                self.control.blocks_dropped.fetch_add(1, Ordering::Relaxed);
                self.free.push(block);
            }
        }
    }
}

/// Realtime half of the graph: `source -> analyser -> tap -> gain -> output`.
pub struct GraphProcessor {
    commands: mpsc::UnboundedReceiver<GraphCommand>,
    control: Arc<GraphControl>,
    source: Option<Box<dyn SourceNode>>,
    analyser: Analyser,
    tap: BlockTap,
    mono: Vec<f32>,
}

impl GraphProcessor {
    /// Renders one interleaved buffer. The tap input is copied to every
    /// output channel scaled by the current gain.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                GraphCommand::Connect(node) => self.source = Some(node),
                GraphCommand::Disconnect => self.source = None,
            }
        }

        if self.control.state() != ContextState::Running {
            out.iter_mut().for_each(|s| *s = 0.0);
            return;
        }

        let channels = channels.max(1);
        let gain = self.control.gain();
        for pass in out.chunks_mut(self.mono.len() * channels) {
            let frames = pass.len() / channels;
            let mono = &mut self.mono[..frames];
            match self.source.as_mut() {
                Some(source) => source.pull(mono),
                None => mono.iter_mut().for_each(|s| *s = 0.0),
            }

            self.tap.process(mono, &mut self.analyser);

            for (frame, &sample) in pass.chunks_mut(channels).zip(mono.iter()) {
                frame.iter_mut().for_each(|s| *s = sample * gain);
            }
        }
    }
}

struct Connected {
    label: String,
    kind: SourceKind,
    device: Option<DeviceHandle>,
}

/// Control half of the processing context. Starts suspended.
pub struct AudioGraph {
    control: Arc<GraphControl>,
    commands: mpsc::UnboundedSender<GraphCommand>,
    output: Mutex<Option<DeviceHandle>>,
    current: Mutex<Option<Connected>>,
    sample_rate: u32,
    fft_size: usize,
    block_size: usize,
}

impl AudioGraph {
    /// Builds the processor and starts the backend output. Output failures
    /// surface as `UnsupportedContext`.
    pub fn new(
        backend: &dyn AudioBackend,
        config: &VisualizerConfig,
    ) -> Result<(Self, BlockStream)> {
        let analyser = Analyser::new(
            config.fft_size,
            config.min_decibels,
            config.max_decibels,
            config.smoothing_time_constant,
        )?;
        if config.block_size == 0 {
            return Err(VisualizerError::Config("block_size must be non-zero".to_string()));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (block_tx, block_rx) = mpsc::channel(BLOCK_QUEUE_DEPTH);
        let (recycle_tx, recycle_rx) = mpsc::unbounded_channel();
        let control = Arc::new(GraphControl::new(config.initial_gain));

        let mut processor = GraphProcessor {
            commands: command_rx,
            control: Arc::clone(&control),
            source: None,
            analyser,
            tap: BlockTap::new(
                config.block_size,
                config.fft_size,
                block_tx,
                recycle_rx,
                Arc::clone(&control),
            ),
            mono: vec![0.0; MAX_RENDER_FRAMES],
        };

        let output = backend
            .open_output(Box::new(move |out: &mut [f32], channels: usize| {
                processor.render(out, channels)
            }))
            .map_err(|e| match e {
                unsupported @ VisualizerError::UnsupportedContext(_) => unsupported,
                other => VisualizerError::UnsupportedContext(other.to_string()),
            })?;

        debug!(
            "Audio graph ready at {} Hz, fft {} block {}",
            backend.sample_rate(),
            config.fft_size,
            config.block_size
        );

        let graph = Self {
            control,
            commands: command_tx,
            output: Mutex::new(Some(output)),
            current: Mutex::new(None),
            sample_rate: backend.sample_rate(),
            fft_size: config.fft_size,
            block_size: config.block_size,
        };
        let stream = BlockStream {
            blocks: block_rx,
            recycle: recycle_tx,
            control: Arc::clone(&graph.control),
        };
        Ok((graph, stream))
    }

    pub fn state(&self) -> ContextState {
        self.control.state()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ContextState::Closed {
            return Err(VisualizerError::UnsupportedContext(
                "audio context is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn transition(&self, to: ContextState) -> Result<()> {
        self.ensure_open()?;
        let from = ContextState::from_u8(self.control.state.swap(to.as_u8(), Ordering::AcqRel));
        if from != to {
            info!("Audio context {} -> {}", from, to);
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(ContextState::Running)
    }

    pub fn suspend(&self) -> Result<()> {
        self.transition(ContextState::Suspended)
    }

    /// Takes effect on the next rendered buffer.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.ensure_open()?;
        if !gain.is_finite() {
            return Err(VisualizerError::Config(format!("gain must be finite, got {}", gain)));
        }
        self.control.gain.store(gain.to_bits(), Ordering::Relaxed);
        debug!("Output gain set to {}", gain);
        Ok(())
    }

    pub fn gain(&self) -> f32 {
        self.control.gain()
    }

    /// Replaces the analysis input. The previous source is disconnected and
    /// its device released first.
    pub fn connect_source(&self, source: SignalSource) -> Result<()> {
        self.ensure_open()?;
        self.disconnect_current_source();

        let label = source.label().to_string();
        let kind = source.kind();
        let (node, device) = source.into_parts();
        // A closed channel means the output is gone, which only happens on close
        let _ = self.commands.send(GraphCommand::Connect(node));

        info!("Connected {} source: {}", kind, label);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Connected {
            label,
            kind,
            device,
        });
        Ok(())
    }

    /// Disconnects and releases the current source. Returns `false` when
    /// nothing was connected.
    pub fn disconnect_current_source(&self) -> bool {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some(connected) => {
                let _ = self.commands.send(GraphCommand::Disconnect);
                if let Some(device) = connected.device {
                    device.release();
                }
                info!("Disconnected {} source: {}", connected.kind, connected.label);
                true
            }
            None => false,
        }
    }

    pub fn current_source(&self) -> Option<(String, SourceKind)> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| (c.label.clone(), c.kind))
    }

    pub fn blocks_emitted(&self) -> u64 {
        self.control.blocks_emitted.load(Ordering::Relaxed)
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.control.blocks_dropped.load(Ordering::Relaxed)
    }

    /// Releases the source and the output device. Every later operation
    /// fails with `UnsupportedContext`.
    pub fn close(&self) {
        if self.state() == ContextState::Closed {
            return;
        }
        self.disconnect_current_source();
        self.control
            .state
            .store(ContextState::Closed.as_u8(), Ordering::Release);
        if let Some(output) = self
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            output.release();
        }
        info!("Audio context closed");
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::OfflineBackend;
    use crate::audio::decode::PcmBuffer;

    fn config() -> VisualizerConfig {
        VisualizerConfig {
            fft_size: 256,
            block_size: 256,
            ..VisualizerConfig::default()
        }
    }

    fn constant_source(value: f32) -> SignalSource {
        SignalSource::buffer(
            "constant",
            Arc::new(PcmBuffer {
                samples: vec![value; 64],
                sample_rate: 8000,
            }),
        )
    }

    #[test]
    fn test_starts_suspended_and_silent() {
        let backend = OfflineBackend::new(8000, 2);
        let (graph, mut stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.set_gain(1.0).unwrap();
        graph.connect_source(constant_source(0.5)).unwrap();

        assert_eq!(graph.state(), ContextState::Suspended);
        assert!(backend.render(512).iter().all(|&s| s == 0.0));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_passthrough_scaled_by_gain() {
        let backend = OfflineBackend::new(8000, 2);
        let (graph, _stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.connect_source(constant_source(0.5)).unwrap();
        graph.resume().unwrap();

        // Muted by default
        assert!(backend.render(16).iter().all(|&s| s == 0.0));

        graph.set_gain(1.0).unwrap();
        assert_eq!(backend.render(16), vec![0.5; 32]);
        graph.set_gain(0.5).unwrap();
        assert_eq!(backend.render(16), vec![0.25; 32]);
    }

    #[test]
    fn test_emits_one_block_per_block_size() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, mut stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.resume().unwrap();

        backend.render(100);
        assert!(stream.try_recv().is_none());
        backend.render(412);
        let mut blocks = 0;
        while let Some(block) = stream.try_recv() {
            assert_eq!(block.time_domain.len(), 256);
            assert_eq!(block.frequency.len(), 128);
            stream.recycle(block);
            blocks += 1;
        }
        assert_eq!(blocks, 2);
        assert_eq!(graph.blocks_emitted(), 2);
    }

    #[test]
    fn test_full_queue_drops_blocks() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.resume().unwrap();

        backend.render(256 * (BLOCK_QUEUE_DEPTH + 3));
        assert_eq!(graph.blocks_emitted(), BLOCK_QUEUE_DEPTH as u64);
        assert_eq!(graph.blocks_dropped(), 3);
        assert_eq!(stream.dropped(), 3);
    }

    #[test]
    fn test_exhausted_pool_drops_until_recycled() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, mut stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.resume().unwrap();

        let mut held = Vec::new();
        for _ in 0..BLOCK_POOL_SIZE {
            backend.render(256);
            held.push(stream.try_recv().unwrap());
        }
        assert_eq!(graph.blocks_emitted(), BLOCK_POOL_SIZE as u64);

        backend.render(256);
        assert!(stream.try_recv().is_none());
        assert_eq!(graph.blocks_dropped(), 1);

        stream.recycle(held.pop().unwrap());
        backend.render(256);
        assert_eq!(stream.try_recv().unwrap().frequency.len(), 128);
        assert_eq!(graph.blocks_emitted(), BLOCK_POOL_SIZE as u64 + 1);
    }

    #[test]
    fn test_large_device_buffer_renders_in_passes() {
        let backend = OfflineBackend::new(8000, 2);
        let (graph, mut stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.connect_source(constant_source(0.5)).unwrap();
        graph.set_gain(1.0).unwrap();
        graph.resume().unwrap();

        let frames = MAX_RENDER_FRAMES * 2 + 256;
        assert_eq!(backend.render(frames), vec![0.5; frames * 2]);
        let mut blocks = 0;
        while stream.try_recv().is_some() {
            blocks += 1;
        }
        assert_eq!(blocks, BLOCK_QUEUE_DEPTH);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, _stream) = AudioGraph::new(&backend, &config()).unwrap();
        assert!(!graph.disconnect_current_source());

        graph.connect_source(constant_source(0.1)).unwrap();
        assert_eq!(
            graph.current_source(),
            Some(("constant".to_string(), SourceKind::Buffer))
        );
        assert!(graph.disconnect_current_source());
        assert!(!graph.disconnect_current_source());
        assert!(graph.current_source().is_none());
    }

    #[test]
    fn test_closed_context_rejects_operations() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, mut stream) = AudioGraph::new(&backend, &config()).unwrap();
        graph.close();

        assert_eq!(graph.state(), ContextState::Closed);
        assert!(!backend.has_output());
        assert!(matches!(
            graph.resume(),
            Err(VisualizerError::UnsupportedContext(_))
        ));
        assert!(matches!(
            graph.set_gain(1.0),
            Err(VisualizerError::UnsupportedContext(_))
        ));
        assert!(graph.connect_source(constant_source(0.1)).is_err());
        // The processor was dropped with the output, closing the stream
        assert!(stream.blocking_recv().is_none());
    }

    #[test]
    fn test_rejects_non_finite_gain() {
        let backend = OfflineBackend::new(8000, 1);
        let (graph, _stream) = AudioGraph::new(&backend, &config()).unwrap();
        assert!(graph.set_gain(f32::NAN).is_err());
        assert_eq!(graph.gain(), 0.0);
    }
}
