use std::collections::VecDeque;

use crate::render::DisplayPoint;

/// Rolling `(seconds, amplitude)` history bounded by a retained duration.
///
/// X coordinates are strictly increasing as long as callers append runs in
/// sample-counter order.
#[derive(Debug, Clone)]
pub struct WaveformHistory {
    points: VecDeque<DisplayPoint>,
    max_duration: f64,
}

impl WaveformHistory {
    pub fn new(max_duration: f64) -> Self {
        Self {
            points: VecDeque::new(),
            max_duration,
        }
    }

    /// Appends a run and evicts everything older than `max_duration` behind
    /// the newest point.
    pub fn append(&mut self, run: &[DisplayPoint]) {
        self.points.extend(run.iter().copied());

        let Some(newest) = self.points.back().map(|p| p.x) else {
            return;
        };
        let cutoff = newest - self.max_duration;
        while self.points.front().map_or(false, |p| p.x < cutoff) {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &DisplayPoint> {
        self.points.iter()
    }

    pub fn oldest(&self) -> Option<DisplayPoint> {
        self.points.front().copied()
    }

    pub fn newest(&self) -> Option<DisplayPoint> {
        self.points.back().copied()
    }
}
