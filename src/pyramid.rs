//! Deep Zoom level and tile geometry.
//!
//! Level 0 is the smallest image (1x1), level `max_level` is full resolution,
//! `max_level = ceil(log2(max(width, height)))`. Every level halves the one
//! above it, rounding up.

/// Tile sizes accepted by the builder.
pub const ALLOWED_TILE_SIZES: [u32; 3] = [128, 256, 512];

pub const DEFAULT_TILE_SIZE: u32 = 256;

/// ceil(log2(max(width, height))), 0 for a single pixel.
pub fn max_level(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height);
    if max_dim <= 1 {
        return 0;
    }
    u32::BITS - (max_dim - 1).leading_zeros()
}

/// A rectangle in level pixel coordinates, half-open on the right and bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PyramidGeometry {
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
    max_level: u32,
}

impl PyramidGeometry {
    pub fn new(width: u32, height: u32, tile_size: u32, overlap: u32) -> Self {
        Self {
            width,
            height,
            tile_size,
            overlap,
            max_level: max_level(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn level_count(&self) -> u32 {
        self.max_level + 1
    }

    /// Level dimensions: ceil(full / 2^(max_level - level)) on each axis.
    pub fn level_dimensions(&self, level: u32) -> (u32, u32) {
        debug_assert!(level <= self.max_level);
        let shift = self.max_level - level;
        let scale = 1u64 << shift;
        let scaled = |full: u32| (full as u64).div_ceil(scale).max(1) as u32;
        (scaled(self.width), scaled(self.height))
    }

    /// Number of tile columns and rows at `level`.
    pub fn tile_grid(&self, level: u32) -> (u32, u32) {
        let (width, height) = self.level_dimensions(level);
        (
            width.div_ceil(self.tile_size),
            height.div_ceil(self.tile_size),
        )
    }

    /// Vertical pixel span `[start, end)` covered by tile row `row`, overlap included.
    pub fn row_span(&self, level: u32, row: u32) -> (u32, u32) {
        let (_, height) = self.level_dimensions(level);
        self.span(row, height)
    }

    /// Horizontal pixel span `[start, end)` covered by tile column `col`, overlap included.
    pub fn column_span(&self, level: u32, col: u32) -> (u32, u32) {
        let (width, _) = self.level_dimensions(level);
        self.span(col, width)
    }

    pub fn tile_rect(&self, level: u32, col: u32, row: u32) -> TileRect {
        let (x0, x1) = self.column_span(level, col);
        let (y0, y1) = self.row_span(level, row);
        TileRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// Total tile count over all levels.
    pub fn total_tiles(&self) -> u64 {
        (0..=self.max_level)
            .map(|level| {
                let (cols, rows) = self.tile_grid(level);
                cols as u64 * rows as u64
            })
            .sum()
    }

    fn span(&self, index: u32, extent: u32) -> (u32, u32) {
        let start = index as u64 * self.tile_size as u64;
        let begin = start.saturating_sub(self.overlap as u64);
        let end = (start + self.tile_size as u64 + self.overlap as u64).min(extent as u64);
        (begin as u32, end as u32)
    }
}
