//! Pixel storage the tile service reads from and writes to.

use pixwire_wire::{ProtocolError, TileRect};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableGeometry {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl DrawableGeometry {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bpp as usize
    }

    pub fn byte_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}

/// Drawables owned by the image editor.
pub trait DrawableStore: Send {
    fn geometry(&self, drawable_id: i32) -> Option<DrawableGeometry>;

    /// Copies a rectangle of pixels, rows packed, out of the drawable or its
    /// shadow buffer.
    fn read_rect(
        &self,
        drawable_id: i32,
        shadow: bool,
        rect: TileRect,
    ) -> Result<Vec<u8>, ProtocolError>;

    fn write_rect(
        &mut self,
        drawable_id: i32,
        shadow: bool,
        rect: TileRect,
        data: &[u8],
    ) -> Result<(), ProtocolError>;
}

#[derive(Debug, Clone)]
struct MemoryDrawable {
    geometry: DrawableGeometry,
    pixels: Vec<u8>,
    shadow: Option<Vec<u8>>,
}

impl MemoryDrawable {
    fn buffer(&self, shadow: bool) -> &[u8] {
        match (&self.shadow, shadow) {
            (Some(buffer), true) => buffer,
            _ => &self.pixels,
        }
    }

    fn buffer_mut(&mut self, shadow: bool) -> &mut Vec<u8> {
        if shadow {
            let len = self.pixels.len();
            self.shadow.get_or_insert_with(|| vec![0; len])
        } else {
            &mut self.pixels
        }
    }
}

/// Drawables held in memory, for tests and headless use.
#[derive(Debug, Clone, Default)]
pub struct MemoryDrawables {
    drawables: HashMap<i32, MemoryDrawable>,
    next_id: i32,
}

impl MemoryDrawables {
    pub fn new() -> Self {
        Self {
            drawables: HashMap::new(),
            next_id: 1,
        }
    }

    /// Adds a zero-filled drawable and returns its id.
    pub fn create(&mut self, width: u32, height: u32, bpp: u32) -> i32 {
        let geometry = DrawableGeometry { width, height, bpp };
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.drawables.insert(
            id,
            MemoryDrawable {
                geometry,
                pixels: vec![0; geometry.byte_len()],
                shadow: None,
            },
        );
        id
    }

    /// Adds a drawable with the given contents.
    pub fn insert(&mut self, width: u32, height: u32, bpp: u32, pixels: Vec<u8>) -> Option<i32> {
        let geometry = DrawableGeometry { width, height, bpp };
        if pixels.len() != geometry.byte_len() {
            return None;
        }
        let id = self.create(width, height, bpp);
        if let Some(drawable) = self.drawables.get_mut(&id) {
            drawable.pixels = pixels;
        }
        Some(id)
    }

    pub fn pixels(&self, drawable_id: i32) -> Option<&[u8]> {
        self.drawables
            .get(&drawable_id)
            .map(|drawable| drawable.pixels.as_slice())
    }

    pub fn shadow_pixels(&self, drawable_id: i32) -> Option<&[u8]> {
        self.drawables
            .get(&drawable_id)
            .and_then(|drawable| drawable.shadow.as_deref())
    }

    pub fn remove(&mut self, drawable_id: i32) -> bool {
        self.drawables.remove(&drawable_id).is_some()
    }

    fn checked(&self, drawable_id: i32, rect: TileRect) -> Result<&MemoryDrawable, ProtocolError> {
        let drawable = self
            .drawables
            .get(&drawable_id)
            .ok_or(ProtocolError::InvalidDrawable(drawable_id))?;
        check_bounds(drawable_id, &drawable.geometry, rect)?;
        Ok(drawable)
    }
}

fn check_bounds(
    drawable_id: i32,
    geometry: &DrawableGeometry,
    rect: TileRect,
) -> Result<(), ProtocolError> {
    let inside = rect.x.checked_add(rect.width).is_some_and(|right| right <= geometry.width)
        && rect.y.checked_add(rect.height).is_some_and(|bottom| bottom <= geometry.height);
    if inside {
        Ok(())
    } else {
        Err(ProtocolError::InvalidTile {
            drawable_id,
            tile_num: 0,
        })
    }
}

impl DrawableStore for MemoryDrawables {
    fn geometry(&self, drawable_id: i32) -> Option<DrawableGeometry> {
        self.drawables.get(&drawable_id).map(|drawable| drawable.geometry)
    }

    fn read_rect(
        &self,
        drawable_id: i32,
        shadow: bool,
        rect: TileRect,
    ) -> Result<Vec<u8>, ProtocolError> {
        let drawable = self.checked(drawable_id, rect)?;
        let geometry = drawable.geometry;
        let bpp = geometry.bpp as usize;
        let row_len = rect.width as usize * bpp;
        let source = drawable.buffer(shadow);
        let mut out = Vec::with_capacity(row_len * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * geometry.row_bytes() + rect.x as usize * bpp;
            out.extend_from_slice(&source[start..start + row_len]);
        }
        Ok(out)
    }

    fn write_rect(
        &mut self,
        drawable_id: i32,
        shadow: bool,
        rect: TileRect,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let geometry = self.checked(drawable_id, rect)?.geometry;
        let bpp = geometry.bpp as usize;
        let row_len = rect.width as usize * bpp;
        let expected = row_len * rect.height as usize;
        if data.len() != expected {
            return Err(ProtocolError::TileSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let drawable = self
            .drawables
            .get_mut(&drawable_id)
            .ok_or(ProtocolError::InvalidDrawable(drawable_id))?;
        let target = drawable.buffer_mut(shadow);
        for (index, row) in (rect.y..rect.y + rect.height).enumerate() {
            let start = row as usize * geometry.row_bytes() + rect.x as usize * bpp;
            let source = &data[index * row_len..(index + 1) * row_len];
            target[start..start + row_len].copy_from_slice(source);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u32, y: u32, width: u32, height: u32) -> TileRect {
        TileRect { x, y, width, height }
    }

    #[test]
    fn rectangles_round_trip_through_rows() {
        let mut store = MemoryDrawables::new();
        let pixels: Vec<u8> = (0..4 * 3 * 2).map(|v| v as u8).collect();
        let id = store.insert(4, 3, 2, pixels).unwrap();

        // Row stride is 8 bytes; the 2x2 block at (1, 1) starts at offset 10.
        let block = store.read_rect(id, false, rect(1, 1, 2, 2)).unwrap();
        assert_eq!(block, vec![10, 11, 12, 13, 18, 19, 20, 21]);

        store.write_rect(id, false, rect(1, 1, 2, 2), &[0xff; 8]).unwrap();
        let after = store.pixels(id).unwrap();
        assert_eq!(&after[8..16], &[8, 9, 0xff, 0xff, 0xff, 0xff, 14, 15]);
    }

    #[test]
    fn shadow_writes_leave_pixels_alone() {
        let mut store = MemoryDrawables::new();
        let id = store.create(2, 2, 1);
        store.write_rect(id, true, rect(0, 0, 2, 1), &[5, 6]).unwrap();
        assert_eq!(store.pixels(id).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(store.shadow_pixels(id).unwrap(), &[5, 6, 0, 0]);
        assert_eq!(store.read_rect(id, true, rect(0, 0, 2, 1)).unwrap(), vec![5, 6]);
    }

    #[test]
    fn bad_ids_bounds_and_sizes_are_rejected() {
        let mut store = MemoryDrawables::new();
        let id = store.create(4, 4, 1);
        assert!(matches!(
            store.read_rect(99, false, rect(0, 0, 1, 1)),
            Err(ProtocolError::InvalidDrawable(99))
        ));
        assert!(matches!(
            store.read_rect(id, false, rect(3, 0, 2, 1)),
            Err(ProtocolError::InvalidTile { .. })
        ));
        assert!(matches!(
            store.write_rect(id, false, rect(0, 0, 2, 2), &[0; 3]),
            Err(ProtocolError::TileSizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(store.insert(2, 2, 1, vec![0; 3]).is_none());
    }
}
