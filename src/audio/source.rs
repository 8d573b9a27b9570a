use ringbuf::HeapConsumer;
use std::fmt;
use std::sync::Arc;

use super::backend::{DeviceHandle, InputCapture};
use super::decode::PcmBuffer;
use super::resample::StreamResampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Microphone,
    Buffer,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Microphone => write!(f, "microphone"),
            SourceKind::Buffer => write!(f, "buffer"),
        }
    }
}

/// Producer of mono samples at the context rate, pulled from the render
/// thread.
pub trait SourceNode: Send {
    fn kind(&self) -> SourceKind;

    /// Fills `out` completely. Must not block or allocate.
    fn pull(&mut self, out: &mut [f32]);
}

/// Live input. Underflow is rendered as silence.
pub struct MicrophoneNode {
    consumer: HeapConsumer<f32>,
    resampler: StreamResampler,
}

impl MicrophoneNode {
    pub fn new(capture: InputCapture, context_rate: u32) -> Self {
        Self {
            resampler: StreamResampler::new(capture.sample_rate, context_rate),
            consumer: capture.consumer,
        }
    }
}

impl SourceNode for MicrophoneNode {
    fn kind(&self) -> SourceKind {
        SourceKind::Microphone
    }

    fn pull(&mut self, out: &mut [f32]) {
        let consumer = &mut self.consumer;
        self.resampler
            .process(out, || consumer.pop().unwrap_or(0.0));
    }
}

/// Decoded audio played from the start and looped forever.
pub struct LoopingBufferNode {
    buffer: Arc<PcmBuffer>,
    position: usize,
}

impl LoopingBufferNode {
    pub fn new(buffer: Arc<PcmBuffer>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl SourceNode for LoopingBufferNode {
    fn kind(&self) -> SourceKind {
        SourceKind::Buffer
    }

    fn pull(&mut self, out: &mut [f32]) {
        let samples = &self.buffer.samples;
        if samples.is_empty() {
            out.iter_mut().for_each(|s| *s = 0.0);
            return;
        }
        let mut written = 0;
        while written < out.len() {
            let run = (samples.len() - self.position).min(out.len() - written);
            out[written..written + run]
                .copy_from_slice(&samples[self.position..self.position + run]);
            written += run;
            self.position = (self.position + run) % samples.len();
        }
    }
}

/// A connectable producer of samples. Owns the device it reads from, if
/// any, so releasing the source releases the device.
pub struct SignalSource {
    label: String,
    node: Box<dyn SourceNode>,
    device: Option<DeviceHandle>,
}

impl SignalSource {
    pub fn new(label: impl Into<String>, node: Box<dyn SourceNode>) -> Self {
        Self {
            label: label.into(),
            node,
            device: None,
        }
    }

    pub fn microphone(capture: InputCapture, device: DeviceHandle, context_rate: u32) -> Self {
        let label = capture.device_name.clone();
        Self {
            label,
            node: Box::new(MicrophoneNode::new(capture, context_rate)),
            device: Some(device),
        }
    }

    pub fn buffer(label: impl Into<String>, buffer: Arc<PcmBuffer>) -> Self {
        Self::new(label, Box::new(LoopingBufferNode::new(buffer)))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> SourceKind {
        self.node.kind()
    }

    /// Splits the source into the part that moves to the render thread and
    /// the device handle that stays with the caller.
    pub(crate) fn into_parts(self) -> (Box<dyn SourceNode>, Option<DeviceHandle>) {
        (self.node, self.device)
    }
}

impl fmt::Debug for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSource")
            .field("label", &self.label)
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::HeapRb;

    #[test]
    fn test_buffer_node_loops() {
        let pcm = Arc::new(PcmBuffer {
            samples: vec![1.0, 2.0, 3.0],
            sample_rate: 8000,
        });
        let mut node = LoopingBufferNode::new(pcm);
        let mut out = [0.0f32; 7];
        node.pull(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 1.0]);
        assert_eq!(node.position(), 1);
    }

    #[test]
    fn test_empty_buffer_is_silent() {
        let pcm = Arc::new(PcmBuffer {
            samples: vec![],
            sample_rate: 8000,
        });
        let mut node = LoopingBufferNode::new(pcm);
        let mut out = [1.0f32; 4];
        node.pull(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_microphone_underflow_is_silence() {
        let (mut producer, consumer) = HeapRb::<f32>::new(16).split();
        producer.push_slice(&[0.5, 0.25]);
        let capture = InputCapture {
            consumer,
            sample_rate: 8000,
            device_name: "test mic".to_string(),
        };
        let mut node = MicrophoneNode::new(capture, 8000);
        let mut out = [1.0f32; 4];
        node.pull(&mut out);
        assert_eq!(out, [0.5, 0.25, 0.0, 0.0]);
        assert_eq!(node.kind(), SourceKind::Microphone);
    }

    #[test]
    fn test_source_labels() {
        let (_, consumer) = HeapRb::<f32>::new(4).split();
        let capture = InputCapture {
            consumer,
            sample_rate: 8000,
            device_name: "USB mic".to_string(),
        };
        let source = SignalSource::microphone(capture, DeviceHandle::new("mic", || {}), 8000);
        assert_eq!(source.label(), "USB mic");
        assert_eq!(source.kind(), SourceKind::Microphone);
    }
}
