//! Tile grid geometry shared by the host tile service and the plug-in cache.

/// Pixel rectangle covered by one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A drawable cut into fixed-size tiles, numbered row-major. Tiles in the
/// last column and row are cropped to the drawable edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            width,
            height,
            tile_width,
            tile_height,
        }
    }

    pub fn cols(&self) -> u32 {
        if self.tile_width == 0 {
            return 0;
        }
        self.width.div_ceil(self.tile_width)
    }

    pub fn rows(&self) -> u32 {
        if self.tile_height == 0 {
            return 0;
        }
        self.height.div_ceil(self.tile_height)
    }

    pub fn count(&self) -> u32 {
        self.cols() * self.rows()
    }

    pub fn tile_rect(&self, tile_num: u32) -> Option<TileRect> {
        let cols = self.cols();
        if cols == 0 || tile_num >= self.count() {
            return None;
        }
        let col = tile_num % cols;
        let row = tile_num / cols;
        let x = col * self.tile_width;
        let y = row * self.tile_height;
        Some(TileRect {
            x,
            y,
            width: self.tile_width.min(self.width - x),
            height: self.tile_height.min(self.height - y),
        })
    }
}
