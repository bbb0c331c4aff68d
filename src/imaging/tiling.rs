//! Tile grid planning for tiled inference.
//!
//! Large images don't fit through an upscale network in one piece, so they
//! are cut into overlapping square tiles. The grid is laid out with a fixed
//! stride of `tile_size - overlap`; the last row and column are clamped flush
//! against the image edge rather than running past it. Near the edges this
//! makes tiles overlap more than nominal, but no tile ever leaves the image
//! and every pixel is covered.
//!
//! ```text
//!  stride = tile - overlap
//!  |<-- tile -->|
//!  +------------+--+---------+--+------+
//!  |   (0,0)    |##|  (0,1)  |##| (0,2)|   ## = overlap
//!  +------------+--+---------+--+------+   last column shifted left so it
//!                                          ends exactly at the image edge
//! ```

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TilingError {
    #[error("tile size must be positive")]
    ZeroTileSize,
    #[error("tile overlap {overlap} must be smaller than tile size {tile_size}")]
    OverlapTooLarge { tile_size: u32, overlap: u32 },
    #[error("scale factor must be at least 1")]
    ZeroScale,
    #[error("image is empty ({0}x{1})")]
    EmptyImage(u32, u32),
}

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Multiply every coordinate by `factor`.
    pub fn scaled(&self, factor: u32) -> Rect {
        Rect {
            x0: self.x0 * factor,
            y0: self.y0 * factor,
            x1: self.x1 * factor,
            y1: self.y1 * factor,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

/// One tile: where it reads from and where its output lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    /// Rectangle in the input image.
    pub source: Rect,
    /// Rectangle in the output canvas (`source` scaled by the magnification).
    pub dest: Rect,
}

/// The full set of tiles for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: u32,
    pub cols: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub scale: u32,
    pub tiles: Vec<Tile>,
}

impl TileGrid {
    /// Plan the tiles for an `height × width` image.
    ///
    /// An image that fits inside a single tile gets exactly one tile equal to
    /// the whole image.
    pub fn new(
        height: u32,
        width: u32,
        tile_size: u32,
        overlap: u32,
        scale: u32,
    ) -> Result<Self, TilingError> {
        if tile_size == 0 {
            return Err(TilingError::ZeroTileSize);
        }
        if overlap >= tile_size {
            return Err(TilingError::OverlapTooLarge { tile_size, overlap });
        }
        if scale == 0 {
            return Err(TilingError::ZeroScale);
        }
        if width == 0 || height == 0 {
            return Err(TilingError::EmptyImage(width, height));
        }

        if height <= tile_size && width <= tile_size {
            let source = Rect {
                x0: 0,
                y0: 0,
                x1: width,
                y1: height,
            };
            return Ok(Self {
                rows: 1,
                cols: 1,
                tile_size,
                overlap,
                scale,
                tiles: vec![Tile {
                    row: 0,
                    col: 0,
                    source,
                    dest: source.scaled(scale),
                }],
            });
        }

        let stride = tile_size - overlap;
        let rows = tile_count(height, overlap, stride);
        let cols = tile_count(width, overlap, stride);

        let mut tiles = Vec::with_capacity((rows * cols) as usize);
        for row in 0..rows {
            let (y0, y1) = axis_span(row, height, tile_size, stride);
            for col in 0..cols {
                let (x0, x1) = axis_span(col, width, tile_size, stride);
                let source = Rect { x0, y0, x1, y1 };
                tiles.push(Tile {
                    row,
                    col,
                    source,
                    dest: source.scaled(scale),
                });
            }
        }

        Ok(Self {
            rows,
            cols,
            tile_size,
            overlap,
            scale,
            tiles,
        })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.tiles.len() == 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }
}

/// `ceil((dim - overlap) / stride)`, at least 1.
fn tile_count(dim: u32, overlap: u32, stride: u32) -> u32 {
    dim.saturating_sub(overlap).div_ceil(stride).max(1)
}

/// Start/end of tile `i` along an axis, clamped flush to the far edge.
fn axis_span(i: u32, dim: u32, tile_size: u32, stride: u32) -> (u32, u32) {
    let start = if dim > tile_size {
        (i * stride).min(dim - tile_size)
    } else {
        0
    };
    (start, (start + tile_size).min(dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_full_coverage(grid: &TileGrid, height: u32, width: u32) {
        let (out_h, out_w) = (height * grid.scale, width * grid.scale);
        for y in 0..out_h {
            for x in 0..out_w {
                assert!(
                    grid.iter().any(|t| t.dest.contains(x, y)),
                    "pixel ({x}, {y}) not covered"
                );
            }
        }
    }

    // =========================================================================
    // Single-tile shortcut
    // =========================================================================

    #[test]
    fn small_image_is_single_tile() {
        let grid = TileGrid::new(300, 200, 512, 32, 4).unwrap();
        assert!(grid.is_single());
        let tile = grid.tiles[0];
        assert_eq!(
            tile.source,
            Rect {
                x0: 0,
                y0: 0,
                x1: 200,
                y1: 300
            }
        );
        assert_eq!(tile.dest.width(), 800);
        assert_eq!(tile.dest.height(), 1200);
    }

    #[test]
    fn exact_tile_size_is_single_tile() {
        let grid = TileGrid::new(512, 512, 512, 32, 2).unwrap();
        assert_eq!(grid.len(), 1);
    }

    // =========================================================================
    // Grid layout
    // =========================================================================

    #[test]
    fn counts_follow_stride() {
        // stride 480: (1000 - 32) / 480 = 2.02 → 3 tiles; (600 - 32) / 480 → 2
        let grid = TileGrid::new(600, 1000, 512, 32, 1).unwrap();
        assert_eq!((grid.rows, grid.cols), (2, 3));
        assert_eq!(grid.len(), 6);
    }

    #[test]
    fn last_tile_is_clamped_flush_to_edge() {
        let grid = TileGrid::new(600, 1000, 512, 32, 1).unwrap();
        let last = grid.tiles.last().unwrap();
        assert_eq!(last.source.x1, 1000);
        assert_eq!(last.source.x0, 1000 - 512);
        assert_eq!(last.source.y1, 600);
        assert_eq!(last.source.y0, 600 - 512);
        for t in grid.iter() {
            assert_eq!(t.source.width(), 512);
            assert_eq!(t.source.height(), 512);
        }
    }

    #[test]
    fn narrow_axis_uses_full_extent() {
        // Height fits in one tile, width doesn't.
        let grid = TileGrid::new(100, 900, 256, 16, 2).unwrap();
        assert_eq!(grid.rows, 1);
        for t in grid.iter() {
            assert_eq!((t.source.y0, t.source.y1), (0, 100));
            assert_eq!(t.dest.height(), 200);
        }
    }

    #[test]
    fn dest_is_source_scaled() {
        let grid = TileGrid::new(700, 700, 256, 32, 4).unwrap();
        for t in grid.iter() {
            assert_eq!(t.dest, t.source.scaled(4));
        }
    }

    #[test]
    fn covers_every_output_pixel() {
        for &(h, w, tile, overlap, scale) in &[
            (70, 130, 32, 8, 2),
            (97, 41, 16, 4, 3),
            (64, 64, 20, 0, 1),
            (33, 200, 32, 31, 1),
        ] {
            let grid = TileGrid::new(h, w, tile, overlap, scale).unwrap();
            assert_full_coverage(&grid, h, w);
        }
    }

    #[test]
    fn tiles_never_leave_image() {
        let grid = TileGrid::new(523, 1037, 128, 24, 1).unwrap();
        for t in grid.iter() {
            assert!(t.source.x1 <= 1037 && t.source.y1 <= 523);
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn rejects_overlap_not_smaller_than_tile() {
        assert_eq!(
            TileGrid::new(1000, 1000, 64, 64, 1),
            Err(TilingError::OverlapTooLarge {
                tile_size: 64,
                overlap: 64
            })
        );
    }

    #[test]
    fn rejects_zero_sizes() {
        assert_eq!(
            TileGrid::new(10, 10, 0, 0, 1),
            Err(TilingError::ZeroTileSize)
        );
        assert_eq!(TileGrid::new(10, 10, 8, 0, 0), Err(TilingError::ZeroScale));
        assert_eq!(
            TileGrid::new(0, 10, 8, 0, 1),
            Err(TilingError::EmptyImage(10, 0))
        );
    }
}
