mod analyser;
pub mod backend;
mod decode;
pub mod fetch;
pub mod graph;
mod resample;
pub mod source;

pub use analyser::{Analyser, MAX_FFT_SIZE, MIN_FFT_SIZE};
pub use backend::{AudioBackend, CpalBackend, DeviceHandle, InputCapture, OfflineBackend};
pub use decode::{decode_audio, PcmBuffer};
pub use fetch::{AssetFetcher, DecodeCache, HttpFetcher, SourceLoader};
pub use graph::{AudioGraph, BlockStream, ContextState};
pub use resample::{resample_linear, StreamResampler};
pub use source::{SignalSource, SourceKind, SourceNode};
