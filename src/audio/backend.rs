// Device abstraction under the audio graph.
//
// A backend drives a render callback at its own pace and hands out
// microphone samples through a ring buffer. CpalBackend talks to the
// system devices, OfflineBackend is pulled by hand and is what the
// tests run against.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{debug, error, info};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::error::{Result, VisualizerError};

/// Fills an interleaved output buffer. The second argument is the channel
/// count. Runs on the realtime thread and must not block.
pub type RenderCallback = Box<dyn FnMut(&mut [f32], usize) + Send>;

/// Seconds of microphone audio the capture ring buffer holds.
const INPUT_BUFFER_SECONDS: usize = 1;

/// Keeps a device stream alive. Dropping the handle stops the stream.
pub struct DeviceHandle {
    label: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceHandle {
    pub fn new<F>(label: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label: label.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stops the underlying stream now instead of at drop time.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing device {}", self.label);
            release();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("label", &self.label)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Mono microphone samples at the device rate.
pub struct InputCapture {
    pub consumer: HeapConsumer<f32>,
    pub sample_rate: u32,
    pub device_name: String,
}

pub trait AudioBackend: Send + Sync {
    /// Rate the render callback runs at.
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Starts driving `render`. Only one output is expected at a time.
    fn open_output(&self, render: RenderCallback) -> Result<DeviceHandle>;

    /// Opens the default microphone.
    fn open_input(&self) -> Result<(DeviceHandle, InputCapture)>;
}

/// Backend over the default cpal host.
pub struct CpalBackend {
    sample_rate: u32,
    channels: u16,
}

impl CpalBackend {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            VisualizerError::UnsupportedContext("no audio output device".to_string())
        })?;
        let config = device.default_output_config().map_err(|e| {
            VisualizerError::UnsupportedContext(format!("no usable output config: {}", e))
        })?;

        info!(
            "Audio output: {} at {} Hz, {} channels",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.sample_rate().0,
            config.channels()
        );

        Ok(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        })
    }
}

impl AudioBackend for CpalBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn open_output(&self, render: RenderCallback) -> Result<DeviceHandle> {
        let (handle, ()) = spawn_stream_thread("audioscope-output", "output", move || {
            let unsupported = |e: String| VisualizerError::UnsupportedContext(e);
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| unsupported("no audio output device".to_string()))?;
            let supported = device
                .default_output_config()
                .map_err(|e| unsupported(e.to_string()))?;
            let format = supported.sample_format();
            let config: cpal::StreamConfig = supported.into();

            let stream = match format {
                cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, render),
                cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, render),
                cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, render),
                other => {
                    return Err(unsupported(format!("unsupported sample format {:?}", other)))
                }
            }
            .map_err(|e| unsupported(format!("failed to build output stream: {}", e)))?;

            stream
                .play()
                .map_err(|e| unsupported(format!("failed to start output stream: {}", e)))?;
            Ok((stream, ()))
        })?;
        Ok(handle)
    }

    fn open_input(&self) -> Result<(DeviceHandle, InputCapture)> {
        spawn_stream_thread("audioscope-input", "microphone", move || {
            let unavailable = |e: String| VisualizerError::DeviceUnavailable(e);
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| unavailable("no input device found".to_string()))?;
            let device_name = device.name().unwrap_or_else(|_| "microphone".to_string());
            let supported = device
                .default_input_config()
                .map_err(|e| unavailable(format!("default config not supported: {}", e)))?;
            let format = supported.sample_format();
            let config: cpal::StreamConfig = supported.into();
            let sample_rate = config.sample_rate.0;

            let rb = HeapRb::<f32>::new(sample_rate as usize * INPUT_BUFFER_SECONDS);
            let (producer, consumer) = rb.split();

            let stream = match format {
                cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, producer),
                cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, producer),
                cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, producer),
                other => return Err(unavailable(format!("unsupported sample format {:?}", other))),
            }
            .map_err(|e| unavailable(format!("failed to build input stream: {}", e)))?;

            stream
                .play()
                .map_err(|e| unavailable(format!("failed to start input stream: {}", e)))?;

            info!("Microphone open: {} at {} Hz", device_name, sample_rate);
            Ok((
                stream,
                InputCapture {
                    consumer,
                    sample_rate,
                    device_name,
                },
            ))
        })
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderCallback,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let buffer = &mut scratch[..data.len()];
            render(buffer, channels);
            for (dst, &src) in data.iter_mut().zip(buffer.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| error!("Output stream error: {}", err),
        None,
    )
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProducer<f32>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                // A full buffer means nobody is reading; newest samples are lost
                let _ = producer.push(sum / channels as f32);
            }
        },
        |err| error!("Input stream error: {}", err),
        None,
    )
}

/// Builds a stream on a dedicated thread and parks the thread until the
/// returned handle is released. cpal streams are not `Send`, so the stream
/// never leaves the thread that created it.
fn spawn_stream_thread<T, F>(name: &str, label: &str, build: F) -> Result<(DeviceHandle, T)>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(cpal::Stream, T)> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<Result<T>>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
        let (stream, extra) = match build() {
            Ok(built) => built,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(extra));
        // Returns on release or when the handle is dropped
        let _ = stop_rx.recv();
        drop(stream);
    })?;

    match ready_rx.recv() {
        Ok(Ok(extra)) => {
            let handle = DeviceHandle::new(label, move || {
                let _ = stop_tx.send(());
                let _ = worker.join();
            });
            Ok((handle, extra))
        }
        Ok(Err(e)) => {
            let _ = worker.join();
            Err(e)
        }
        Err(_) => Err(VisualizerError::DeviceUnavailable(format!(
            "{} thread exited before the stream started",
            label
        ))),
    }
}

/// Backend without a device. Output is rendered on demand with
/// [`OfflineBackend::render`]; microphone samples are pushed by hand.
pub struct OfflineBackend {
    sample_rate: u32,
    channels: u16,
    renderer: Arc<Mutex<Option<RenderCallback>>>,
    input_rate: Mutex<Option<u32>>,
    /// Producer of the most recently opened input, tagged with its open id
    input: Arc<Mutex<Option<(u64, HeapProducer<f32>)>>>,
    next_input_id: AtomicU64,
}

impl OfflineBackend {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            renderer: Arc::new(Mutex::new(None)),
            input_rate: Mutex::new(None),
            input: Arc::new(Mutex::new(None)),
            next_input_id: AtomicU64::new(0),
        }
    }

    /// Makes `open_input` succeed with a microphone running at `sample_rate`.
    pub fn enable_microphone(&self, sample_rate: u32) {
        *self
            .input_rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sample_rate);
    }

    pub fn has_output(&self) -> bool {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Pulls `frames` frames through the open output, interleaved. Silence
    /// when no output is open.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let channels = self.channels as usize;
        let mut buffer = vec![0.0; frames * channels];
        if let Some(render) = self
            .renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            render(&mut buffer, channels);
        }
        buffer
    }

    /// Feeds microphone samples. Returns how many fit in the buffer.
    pub fn push_input(&self, samples: &[f32]) -> usize {
        match self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some((_, producer)) => producer.push_slice(samples),
            None => 0,
        }
    }
}

impl AudioBackend for OfflineBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn open_output(&self, render: RenderCallback) -> Result<DeviceHandle> {
        *self
            .renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(render);
        let renderer = Arc::clone(&self.renderer);
        Ok(DeviceHandle::new("offline output", move || {
            renderer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }))
    }

    fn open_input(&self) -> Result<(DeviceHandle, InputCapture)> {
        let sample_rate = self
            .input_rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or_else(|| {
                VisualizerError::DeviceUnavailable("no microphone attached".to_string())
            })?;

        let rb = HeapRb::<f32>::new(sample_rate as usize * INPUT_BUFFER_SECONDS);
        let (producer, consumer) = rb.split();
        let id = self.next_input_id.fetch_add(1, Ordering::Relaxed);
        *self.input.lock().unwrap_or_else(PoisonError::into_inner) = Some((id, producer));

        let input = Arc::clone(&self.input);
        let handle = DeviceHandle::new("offline microphone", move || {
            let mut input = input.lock().unwrap_or_else(PoisonError::into_inner);
            // A later open owns the producer now
            if input.as_ref().map_or(false, |(owner, _)| *owner == id) {
                input.take();
            }
        });
        Ok((
            handle,
            InputCapture {
                consumer,
                sample_rate,
                device_name: "offline microphone".to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_handle_releases_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let handle = DeviceHandle::new("test", move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        assert_eq!(handle.label(), "test");
        drop(handle);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_offline_output_renders_until_released() {
        let backend = OfflineBackend::new(8000, 2);
        assert!(backend.render(4).iter().all(|&s| s == 0.0));

        let handle = backend
            .open_output(Box::new(|out: &mut [f32], channels: usize| {
                assert_eq!(channels, 2);
                out.iter_mut().for_each(|s| *s = 0.5);
            }))
            .unwrap();
        assert!(backend.has_output());
        assert_eq!(backend.render(4), vec![0.5; 8]);

        handle.release();
        assert!(!backend.has_output());
        assert_eq!(backend.render(2), vec![0.0; 4]);
    }

    #[test]
    fn test_offline_microphone() {
        let backend = OfflineBackend::new(8000, 1);
        assert!(matches!(
            backend.open_input(),
            Err(VisualizerError::DeviceUnavailable(_))
        ));
        assert_eq!(backend.push_input(&[1.0]), 0);

        backend.enable_microphone(16000);
        let (handle, mut capture) = backend.open_input().unwrap();
        assert_eq!(capture.sample_rate, 16000);
        assert_eq!(backend.push_input(&[0.25, 0.5]), 2);
        assert_eq!(capture.consumer.pop(), Some(0.25));
        assert_eq!(capture.consumer.pop(), Some(0.5));

        drop(handle);
        assert_eq!(backend.push_input(&[1.0]), 0);
    }

    #[test]
    fn test_releasing_old_input_keeps_newer_one() {
        let backend = OfflineBackend::new(8000, 1);
        backend.enable_microphone(8000);
        let (first, _first_capture) = backend.open_input().unwrap();
        let (second, mut second_capture) = backend.open_input().unwrap();

        first.release();
        assert_eq!(backend.push_input(&[0.5; 64]), 64);
        assert_eq!(second_capture.consumer.len(), 64);

        second.release();
        assert_eq!(backend.push_input(&[0.5]), 0);
    }
}
