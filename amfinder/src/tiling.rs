//! Tile grid geometry and tile extraction for mosaic images.

use image::{imageops, RgbImage};
use ndarray::{s, Array4};

/// Grid of square tiles covering the top-left part of a mosaic.
///
/// Partial tiles on the right and bottom edges are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub nrows: u32,
    pub ncols: u32,
    pub tile_edge: u32,
}

impl TileGrid {
    /// Grid for an image of `width × height` pixels. `None` when the tile edge
    /// exceeds either dimension (or is zero).
    pub fn new(width: u32, height: u32, tile_edge: u32) -> Option<Self> {
        if tile_edge == 0 {
            return None;
        }
        let nrows = height / tile_edge;
        let ncols = width / tile_edge;
        if nrows == 0 || ncols == 0 {
            return None;
        }
        Some(Self {
            nrows,
            ncols,
            tile_edge,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.nrows as usize * self.ncols as usize
    }

    /// Pixel size `(width, height)` of the tiled area.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.ncols * self.tile_edge, self.nrows * self.tile_edge)
    }

    /// Top-left pixel `(x, y)` of tile (r, c).
    pub fn tile_origin(&self, r: u32, c: u32) -> (u32, u32) {
        (c * self.tile_edge, r * self.tile_edge)
    }
}

/// Copy out the pixels of tile (r, c). Caller keeps `r < nrows`, `c < ncols`.
pub fn extract_tile(image: &RgbImage, r: u32, c: u32, tile_edge: u32) -> RgbImage {
    imageops::crop_imm(image, c * tile_edge, r * tile_edge, tile_edge, tile_edge).to_image()
}

/// All tiles of row `r` as a `[ncols, edge, edge, 3]` batch scaled to [0, 1].
pub fn row_batch(image: &RgbImage, r: u32, grid: &TileGrid) -> Array4<f32> {
    let edge = grid.tile_edge as usize;
    let mut batch = Array4::<f32>::zeros((grid.ncols as usize, edge, edge, 3));
    for c in 0..grid.ncols {
        let tile = extract_tile(image, r, c, grid.tile_edge);
        let mut slot = batch.slice_mut(s![c as usize, .., .., ..]);
        for (x, y, pixel) in tile.enumerate_pixels() {
            for ch in 0..3 {
                slot[[y as usize, x as usize, ch]] = normalize(pixel[ch]);
            }
        }
    }
    batch
}

fn normalize(value: u8) -> f32 {
    value as f32 / 255.0
}
