use std::collections::{HashMap, VecDeque};

use crate::render::{ChartSurface, DisplayPoint, SeriesId};

/// Chart surface backing the terminal panes. Keeps plain `(x, y)` tuples so
/// ratatui datasets can borrow them directly.
#[derive(Debug, Clone)]
pub struct TerminalChartSurface {
    series: HashMap<SeriesId, Vec<(f64, f64)>>,
    history: VecDeque<(f64, f64)>,
    history_window: f64,
    grid: VecDeque<Vec<f32>>,
    grid_capacity: usize,
}

impl TerminalChartSurface {
    /// `history_window` is in seconds on the history x axis.
    pub fn new(history_window: f64, grid_capacity: usize) -> Self {
        Self {
            series: HashMap::new(),
            history: VecDeque::new(),
            history_window,
            grid: VecDeque::with_capacity(grid_capacity),
            grid_capacity,
        }
    }

    pub fn series(&self, id: SeriesId) -> &[(f64, f64)] {
        self.series.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// History points, oldest first.
    pub fn history(&self) -> &[(f64, f64)] {
        // Kept contiguous by append_history
        self.history.as_slices().0
    }

    /// `(oldest x, newest x)` of the retained history.
    pub fn history_bounds(&self) -> Option<(f64, f64)> {
        Some((self.history.front()?.0, self.history.back()?.0))
    }

    /// Oldest-to-newest heatmap columns.
    pub fn grid(&self) -> &VecDeque<Vec<f32>> {
        &self.grid
    }
}

impl ChartSurface for TerminalChartSurface {
    fn set_series(&mut self, id: SeriesId, points: &[DisplayPoint]) {
        let series = self.series.entry(id).or_default();
        series.clear();
        series.extend(points.iter().map(|&p| <(f64, f64)>::from(p)));
    }

    fn append_history(&mut self, _id: SeriesId, points: &[DisplayPoint]) {
        self.history.extend(points.iter().map(|&p| <(f64, f64)>::from(p)));
        if let Some(&(newest, _)) = self.history.back() {
            let cutoff = newest - self.history_window;
            while self.history.front().map_or(false, |&(x, _)| x < cutoff) {
                self.history.pop_front();
            }
        }
        self.history.make_contiguous();
    }

    fn write_grid_column(&mut self, _id: SeriesId, column: &[f32]) {
        if self.grid_capacity == 0 {
            return;
        }
        // Reuse the evicted column's allocation
        let mut slot = if self.grid.len() == self.grid_capacity {
            self.grid.pop_front().unwrap_or_default()
        } else {
            Vec::with_capacity(column.len())
        };
        slot.clear();
        slot.extend_from_slice(column);
        self.grid.push_back(slot);
    }

    fn reset_series(&mut self, id: SeriesId) {
        match id {
            SeriesId::WaveformHistory => self.history.clear(),
            SeriesId::Spectrogram => self.grid.clear(),
            other => {
                self.series.remove(&other);
            }
        }
    }
}
