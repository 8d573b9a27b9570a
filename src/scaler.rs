// Numeric mapping functions that turn raw byte-domain analyser output into
// chart units.

use crate::error::{Result, VisualizerError};

/// Domain of the analyser's byte output.
pub const BYTE_RANGE: (f64, f64) = (0.0, 255.0);

/// Affine map of `value` from `source` onto `target`.
///
/// Fails with `InvalidRange` when `source` has zero width.
pub fn linear_rescale(value: f64, source: (f64, f64), target: (f64, f64)) -> Result<f64> {
    let width = source.1 - source.0;
    if width == 0.0 || !width.is_finite() {
        return Err(VisualizerError::InvalidRange {
            start: source.0,
            end: source.1,
        });
    }
    Ok((value - source.0) * (target.1 - target.0) / width + target.0)
}

/// A pure `f64 -> f64` mapping.
///
/// Linear scalers validate their source range on construction, so `apply`
/// is total.
#[derive(Debug, Clone, PartialEq)]
pub enum Scaler {
    Identity,
    Offset(f64),
    Multiplier(f64),
    Linear {
        source: (f64, f64),
        target: (f64, f64),
    },
    Chain(Box<Scaler>, Box<Scaler>),
}

impl Scaler {
    pub fn identity() -> Self {
        Scaler::Identity
    }

    pub fn offset(offset: f64) -> Self {
        Scaler::Offset(offset)
    }

    pub fn multiplier(k: f64) -> Self {
        Scaler::Multiplier(k)
    }

    pub fn linear(source: (f64, f64), target: (f64, f64)) -> Result<Self> {
        // Validates the range once so `apply` never divides by zero.
        linear_rescale(source.0, source, target)?;
        Ok(Scaler::Linear { source, target })
    }

    /// Byte magnitude onto `[min_db, max_db]`.
    pub fn decibels(min_db: f64, max_db: f64) -> Result<Self> {
        Self::linear(BYTE_RANGE, (min_db, max_db))
    }

    /// Byte sample onto `[-1, 1]`.
    pub fn amplitude() -> Self {
        Scaler::Linear {
            source: BYTE_RANGE,
            target: (-1.0, 1.0),
        }
    }

    /// Applies `self`, then `next`.
    pub fn then(self, next: Scaler) -> Self {
        Scaler::Chain(Box::new(self), Box::new(next))
    }

    pub fn apply(&self, value: f64) -> f64 {
        match self {
            Scaler::Identity => value,
            Scaler::Offset(offset) => value + offset,
            Scaler::Multiplier(k) => value * k,
            Scaler::Linear { source, target } => {
                (value - source.0) * (target.1 - target.0) / (source.1 - source.0) + target.0
            }
            Scaler::Chain(first, second) => second.apply(first.apply(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_rescale_endpoints() {
        assert_eq!(linear_rescale(0.0, BYTE_RANGE, (-100.0, -30.0)).unwrap(), -100.0);
        assert_eq!(linear_rescale(255.0, BYTE_RANGE, (-100.0, -30.0)).unwrap(), -30.0);
    }

    #[test]
    fn test_linear_rescale_is_monotonic() {
        let mut last = f64::NEG_INFINITY;
        for v in 0..=255 {
            let y = linear_rescale(v as f64, BYTE_RANGE, (-90.0, -10.0)).unwrap();
            assert!(y > last);
            last = y;
        }
    }

    #[test]
    fn test_degenerate_range_is_rejected() {
        assert!(matches!(
            linear_rescale(1.0, (5.0, 5.0), (0.0, 1.0)),
            Err(VisualizerError::InvalidRange { .. })
        ));
        assert!(Scaler::linear((3.0, 3.0), (0.0, 1.0)).is_err());
    }

    #[test]
    fn test_offset_round_trip() {
        for k in [-1e6, -3.5, 0.0, 0.25, 42.0, 1e9] {
            let scaler = Scaler::offset(k).then(Scaler::offset(-k));
            for v in [-10.0, 0.0, 1.5, 255.0] {
                assert!((scaler.apply(v) - Scaler::identity().apply(v)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_amplitude_and_multiplier() {
        let amp = Scaler::amplitude();
        assert_eq!(amp.apply(0.0), -1.0);
        assert_eq!(amp.apply(255.0), 1.0);

        let hz = Scaler::multiplier(44100.0 / 2048.0);
        assert!((hz.apply(100.0) - 2153.3203125).abs() < 1e-9);
    }
}
