// Spectrogram widget
// Scrolling heatmap, newest column on the right, low frequencies at the bottom

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Style},
    symbols,
    widgets::{Block, Widget},
};
use std::collections::VecDeque;

pub struct Spectrogram<'a> {
    block: Option<Block<'a>>,
    columns: &'a VecDeque<Vec<f32>>,
    /// Fraction of the bins shown, starting from 0 Hz
    visible_bins: f32,
}

impl<'a> Spectrogram<'a> {
    pub fn new(columns: &'a VecDeque<Vec<f32>>) -> Self {
        Self {
            block: None,
            columns,
            visible_bins: 1.0,
        }
    }

    pub fn block(mut self, block: Block<'a>) -> Self {
        self.block = Some(block);
        self
    }

    pub fn visible_bins(mut self, fraction: f32) -> Self {
        self.visible_bins = fraction.clamp(0.01, 1.0);
        self
    }
}

/// Maps an intensity in `[0, 1]` to a dark-blue to yellow ramp.
pub fn heat_color(intensity: f32) -> Color {
    let t = intensity.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        let k = t * 2.0;
        (0.0, 0.4 * k, 0.3 + 0.5 * k)
    } else {
        let k = (t - 0.5) * 2.0;
        (k, 0.4 + 0.6 * k, 0.8 * (1.0 - k))
    };
    Color::Rgb((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

impl<'a> Widget for Spectrogram<'a> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let block = self.block.unwrap_or_default();
        let inner_area = block.inner(area);
        block.render(area, buf);

        if inner_area.width < 1 || inner_area.height < 1 || self.columns.is_empty() {
            return;
        }

        let width = inner_area.width as usize;
        let height = inner_area.height as usize;
        let shown = self.columns.len().min(width);
        let first = self.columns.len() - shown;
        let x_offset = width - shown;

        for (i, column) in self.columns.iter().skip(first).enumerate() {
            let bins = ((column.len() as f32 * self.visible_bins) as usize).max(1);
            let x = inner_area.left() + (x_offset + i) as u16;

            for row in 0..height {
                // Loudest bin in the band this row covers
                let lo = row * bins / height;
                let hi = ((row + 1) * bins / height).max(lo + 1).min(column.len());
                let value = column
                    .get(lo..hi)
                    .map(|band| band.iter().fold(0.0f32, |a, &b| a.max(b)))
                    .unwrap_or(0.0);

                let y = inner_area.bottom() - 1 - row as u16;
                buf.get_mut(x, y)
                    .set_symbol(symbols::block::FULL)
                    .set_style(Style::default().fg(heat_color(value)));
            }
        }
    }
}
