use crate::types::{ClassError, ClassResult};

/// One rectangular processing unit of the raster.
///
/// The core region is what gets written to the output; the padded window
/// adds context pixels around it so windowed post-processing (relaxation,
/// morphology) stays artifact-free at tile boundaries. Padding is clamped
/// at the raster edges, so edge tiles carry a smaller padded window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// 1-based position in row-major tile order
    pub sequence: u64,
    pub row_start: usize,
    pub col_start: usize,
    pub core_rows: usize,
    pub core_cols: usize,
    pub padded_row_start: usize,
    pub padded_col_start: usize,
    pub padded_rows: usize,
    pub padded_cols: usize,
    pub pad: usize,
    /// Offset of the core region inside the padded window (0 at the
    /// top/left raster edge, otherwise equal to `pad`)
    pub core_row_offset: usize,
    pub core_col_offset: usize,
}

impl Tile {
    /// Number of pixels in the padded window
    pub fn padded_pixels(&self) -> usize {
        self.padded_rows * self.padded_cols
    }
}

/// Computes the ordered set of tiles covering a raster (or a sub-extent
/// of it), with optional padding and an optional block-index range.
#[derive(Debug, Clone)]
pub struct BlockPlanner {
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    pad: usize,
    row_start: usize,
    col_start: usize,
    target_rows: usize,
    target_cols: usize,
    block_range: Option<(u64, u64)>,
}

impl BlockPlanner {
    pub fn new(
        rows: usize,
        cols: usize,
        block_rows: usize,
        block_cols: usize,
    ) -> ClassResult<Self> {
        if block_rows == 0 || block_cols == 0 {
            return Err(ClassError::Configuration(format!(
                "Block size must be positive, got {}x{}",
                block_rows, block_cols
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(ClassError::Configuration(format!(
                "Raster size must be positive, got {}x{}",
                rows, cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            block_rows,
            block_cols,
            pad: 0,
            row_start: 0,
            col_start: 0,
            target_rows: rows,
            target_cols: cols,
            block_range: None,
        })
    }

    /// Context pixels to read around each core region
    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    /// Restrict planning to a sub-extent starting at (row_start, col_start)
    pub fn with_start(mut self, row_start: usize, col_start: usize) -> ClassResult<Self> {
        if row_start >= self.rows || col_start >= self.cols {
            return Err(ClassError::Configuration(format!(
                "Start offset ({}, {}) outside raster {}x{}",
                row_start, col_start, self.rows, self.cols
            )));
        }
        self.row_start = row_start;
        self.col_start = col_start;
        self.target_rows = self.target_rows.min(self.rows - row_start);
        self.target_cols = self.target_cols.min(self.cols - col_start);
        Ok(self)
    }

    /// Limit the planned extent to at most (n_rows, n_cols) from the start
    pub fn with_extent(mut self, n_rows: usize, n_cols: usize) -> Self {
        self.target_rows = n_rows.min(self.rows - self.row_start);
        self.target_cols = n_cols.min(self.cols - self.col_start);
        self
    }

    /// Process only tiles with 1-based sequence numbers in [lo, hi].
    /// Filtered tiles are skipped, never renumbered.
    pub fn with_block_range(mut self, lo: u64, hi: u64) -> ClassResult<Self> {
        if lo == 0 || hi < lo {
            return Err(ClassError::Configuration(format!(
                "Invalid block range [{}, {}]",
                lo, hi
            )));
        }
        self.block_range = Some((lo, hi));
        Ok(self)
    }

    fn row_tiles(&self) -> usize {
        (self.target_rows + self.block_rows - 1) / self.block_rows
    }

    fn col_tiles(&self) -> usize {
        (self.target_cols + self.block_cols - 1) / self.block_cols
    }

    /// Total tile count of the plan, before any block-range filtering
    pub fn tile_count(&self) -> usize {
        self.row_tiles() * self.col_tiles()
    }

    /// Global start offset of the planned sub-extent
    pub fn start_offset(&self) -> (usize, usize) {
        (self.row_start, self.col_start)
    }

    /// Shape of the planned sub-extent (equals the raster shape unless a
    /// start offset or extent limit was set)
    pub fn target_shape(&self) -> (usize, usize) {
        (self.target_rows, self.target_cols)
    }

    /// All tiles of the plan in row-major order, honoring the block range
    pub fn tiles(&self) -> Vec<Tile> {
        let mut tiles = Vec::with_capacity(self.tile_count());
        let mut sequence = 0u64;

        for tile_row in 0..self.row_tiles() {
            for tile_col in 0..self.col_tiles() {
                sequence += 1;
                if let Some((lo, hi)) = self.block_range {
                    if sequence < lo {
                        continue;
                    }
                    if sequence > hi {
                        return tiles;
                    }
                }

                let row_start = self.row_start + tile_row * self.block_rows;
                let col_start = self.col_start + tile_col * self.block_cols;
                let core_rows = self
                    .block_rows
                    .min(self.row_start + self.target_rows - row_start);
                let core_cols = self
                    .block_cols
                    .min(self.col_start + self.target_cols - col_start);

                let padded_row_start = row_start.saturating_sub(self.pad);
                let padded_col_start = col_start.saturating_sub(self.pad);
                let padded_row_end = (row_start + core_rows + self.pad).min(self.rows);
                let padded_col_end = (col_start + core_cols + self.pad).min(self.cols);

                tiles.push(Tile {
                    sequence,
                    row_start,
                    col_start,
                    core_rows,
                    core_cols,
                    padded_row_start,
                    padded_col_start,
                    padded_rows: padded_row_end - padded_row_start,
                    padded_cols: padded_col_end - padded_col_start,
                    pad: self.pad,
                    core_row_offset: row_start - padded_row_start,
                    core_col_offset: col_start - padded_col_start,
                });
            }
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_tile_plan() {
        let planner = BlockPlanner::new(10, 10, 6, 6).unwrap();
        let tiles = planner.tiles();
        assert_eq!(tiles.len(), 4);
        assert_eq!(planner.tile_count(), 4);

        let shapes: Vec<_> = tiles
            .iter()
            .map(|t| (t.row_start, t.col_start, t.core_rows, t.core_cols))
            .collect();
        assert_eq!(
            shapes,
            vec![(0, 0, 6, 6), (0, 6, 6, 4), (6, 0, 4, 6), (6, 6, 4, 4)]
        );
    }

    #[test]
    fn test_core_regions_cover_raster_exactly() {
        for &(rows, cols, block) in &[(10usize, 10usize, 6usize), (7, 13, 4), (5, 5, 5), (9, 3, 2)]
        {
            let planner = BlockPlanner::new(rows, cols, block, block).unwrap();
            let mut hits = vec![0u32; rows * cols];
            for tile in planner.tiles() {
                for r in tile.row_start..tile.row_start + tile.core_rows {
                    for c in tile.col_start..tile.col_start + tile.core_cols {
                        hits[r * cols + c] += 1;
                    }
                }
            }
            assert!(
                hits.iter().all(|&h| h == 1),
                "coverage gap or overlap for {}x{} block {}",
                rows,
                cols,
                block
            );
        }
    }

    #[test]
    fn test_padding_clamped_at_edges() {
        let planner = BlockPlanner::new(20, 20, 8, 8).unwrap().with_pad(3);
        let tiles = planner.tiles();

        // Top-left tile: no room to pad up/left
        let first = &tiles[0];
        assert_eq!(first.padded_row_start, 0);
        assert_eq!(first.core_row_offset, 0);
        assert_eq!(first.padded_rows, 8 + 3);

        // Interior tile: full pad on both leading dimensions
        let interior = tiles
            .iter()
            .find(|t| t.row_start == 8 && t.col_start == 8)
            .unwrap();
        assert_eq!(interior.core_row_offset, 3);
        assert_eq!(interior.core_col_offset, 3);
        assert_eq!(interior.padded_rows, 8 + 3 + 3);

        // Bottom-right tile: pad clamped at the far edge
        let last = tiles.last().unwrap();
        assert_eq!(last.padded_row_start, 16 - 3);
        assert_eq!(last.padded_rows, 4 + 3);
    }

    #[test]
    fn test_block_range_skips_without_renumbering() {
        let planner = BlockPlanner::new(10, 10, 5, 2)
            .unwrap()
            .with_block_range(2, 3)
            .unwrap();
        let tiles = planner.tiles();
        let sequences: Vec<_> = tiles.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn test_sub_extent_plan() {
        let planner = BlockPlanner::new(100, 100, 10, 10)
            .unwrap()
            .with_start(20, 30)
            .unwrap()
            .with_extent(25, 15);
        let tiles = planner.tiles();
        assert_eq!(tiles.len(), 3 * 2);
        assert_eq!(tiles[0].row_start, 20);
        assert_eq!(tiles[0].col_start, 30);
        let last = tiles.last().unwrap();
        assert_eq!(last.core_rows, 5);
        assert_eq!(last.core_cols, 5);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(BlockPlanner::new(10, 10, 0, 6).is_err());
        assert!(BlockPlanner::new(10, 10, 6, 0).is_err());
    }

    #[test]
    fn test_invalid_block_range_rejected() {
        let planner = BlockPlanner::new(10, 10, 5, 5).unwrap();
        assert!(planner.clone().with_block_range(0, 2).is_err());
        assert!(planner.with_block_range(3, 2).is_err());
    }
}
