mod spectrogram;

pub use spectrogram::{heat_color, Spectrogram};
