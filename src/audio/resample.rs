// Linear-interpolation sample-rate conversion, offline and streaming.

/// Resamples a whole buffer from `source_rate` to `target_rate`.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        let sample = if src_idx + 1 < samples.len() {
            samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac
        } else if src_idx < samples.len() {
            samples[src_idx]
        } else {
            0.0
        };
        output.push(sample);
    }

    output
}

/// Converts a live stream one output sample at a time.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    /// Input samples advanced per output sample
    step: f64,
    phase: f64,
    current: f32,
    next: f32,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            step: source_rate as f64 / target_rate.max(1) as f64,
            phase: 1.0,
            current: 0.0,
            next: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Fills `out`, pulling input from `source` as needed.
    pub fn process<F>(&mut self, out: &mut [f32], mut source: F)
    where
        F: FnMut() -> f32,
    {
        if self.is_passthrough() {
            out.iter_mut().for_each(|s| *s = source());
            return;
        }
        for sample in out.iter_mut() {
            while self.phase >= 1.0 {
                self.current = self.next;
                self.next = source();
                self.phase -= 1.0;
            }
            *sample = self.current + (self.next - self.current) * self.phase as f32;
            self.phase += self.step;
        }
    }
}
