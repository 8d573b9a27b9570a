/// Circular grid of frequency snapshots, one column per audio block.
#[derive(Debug, Clone)]
pub struct SpectrogramGrid {
    rows: usize,
    capacity: usize,
    /// Column-major storage, `capacity * rows` cells
    cells: Vec<u8>,
    /// Elapsed seconds at which each stored column was written
    timestamps: Vec<f64>,
    /// Next column to overwrite
    cursor: usize,
    len: usize,
}

impl SpectrogramGrid {
    pub fn new(rows: usize, capacity: usize) -> Self {
        Self {
            rows,
            capacity,
            cells: vec![0; rows * capacity],
            timestamps: vec![0.0; capacity],
            cursor: 0,
            len: 0,
        }
    }

    /// Number of stored columns, never above `capacity`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `column` at the cursor, overwriting the oldest column once full.
    ///
    /// Extra values are ignored and missing values are written as zero.
    pub fn push_column(&mut self, column: &[u8], timestamp: f64) {
        if self.capacity == 0 {
            return;
        }
        let start = self.cursor * self.rows;
        let slot = &mut self.cells[start..start + self.rows];
        for (i, cell) in slot.iter_mut().enumerate() {
            *cell = column.get(i).copied().unwrap_or(0);
        }
        self.timestamps[self.cursor] = timestamp;
        self.cursor = (self.cursor + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    /// Raw slot access by physical index.
    pub fn slot(&self, index: usize) -> Option<&[u8]> {
        if index >= self.len {
            return None;
        }
        let start = index * self.rows;
        Some(&self.cells[start..start + self.rows])
    }

    /// Column by age, 0 being the oldest stored column.
    pub fn column(&self, age: usize) -> Option<(f64, &[u8])> {
        if age >= self.len {
            return None;
        }
        let oldest = (self.cursor + self.capacity - self.len) % self.capacity;
        let index = (oldest + age) % self.capacity;
        let start = index * self.rows;
        Some((self.timestamps[index], &self.cells[start..start + self.rows]))
    }

    pub fn latest(&self) -> Option<(f64, &[u8])> {
        self.len.checked_sub(1).and_then(|age| self.column(age))
    }

    /// Oldest-to-newest columns.
    pub fn columns(&self) -> impl Iterator<Item = (f64, &[u8])> {
        (0..self.len).filter_map(move |age| self.column(age))
    }
}
