//! Plug-in side tile cache.
//!
//! Tiles are fetched from the host on first reference and held in a
//! byte-bounded LRU. Releasing the last reference writes a dirty tile back
//! before its buffer is freed; evicting writes it back and drops the buffer
//! while keeping the reference so the next access fetches it again.

use crate::error::PluginError;
use lru::LruCache;
use pixwire_wire::{TileGrid, WireError};
use std::collections::HashMap;

/// Fraction of the cache kept free after an eviction pass.
pub const FREE_QUANTUM: f64 = 0.1;

/// Bytes per pixel assumed when sizing the cache by tile count.
const SIZING_BPP: usize = 4;

pub type TileResult<T> = Result<T, PluginError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub drawable_id: i32,
    pub tile_num: u32,
    pub shadow: bool,
}

/// Identity and shape of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub key: TileKey,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl TileSpec {
    pub fn size(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp as usize
    }
}

/// Size and pixel depth of a drawable as seen by the plug-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableInfo {
    pub id: i32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl DrawableInfo {
    pub fn new(id: i32, width: u32, height: u32, bpp: u32) -> Self {
        Self {
            id,
            width,
            height,
            bpp,
        }
    }

    pub fn tile_spec(
        &self,
        tile_num: u32,
        shadow: bool,
        tile_width: u32,
        tile_height: u32,
    ) -> Option<TileSpec> {
        let grid = TileGrid::new(self.width, self.height, tile_width, tile_height);
        let rect = grid.tile_rect(tile_num)?;
        Some(TileSpec {
            key: TileKey {
                drawable_id: self.id,
                tile_num,
                shadow,
            },
            width: rect.width,
            height: rect.height,
            bpp: self.bpp,
        })
    }
}

/// How the cache moves pixels to and from the host.
pub trait TileWire {
    /// Fetches the current contents of a tile.
    fn fetch(&mut self, spec: &TileSpec) -> Result<Vec<u8>, WireError>;

    /// Writes a tile's pixels back to the host.
    fn store(&mut self, spec: &TileSpec, data: &[u8]) -> Result<(), WireError>;
}

#[derive(Debug)]
struct Entry {
    spec: TileSpec,
    ref_count: u32,
    dirty: bool,
    data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct TileCache {
    entries: HashMap<TileKey, Entry>,
    lru: LruCache<TileKey, ()>,
    max_bytes: usize,
    resident_bytes: usize,
}

impl TileCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruCache::unbounded(),
            max_bytes,
            resident_bytes: 0,
        }
    }

    /// Size that makes room for `ntiles` RGBA tiles of the given shape.
    pub fn bytes_for_tiles(ntiles: usize, tile_width: u32, tile_height: u32) -> usize {
        ntiles * tile_width as usize * tile_height as usize * SIZING_BPP
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    /// Number of tiles currently holding pixel buffers.
    pub fn resident_tiles(&self) -> usize {
        self.lru.len()
    }

    pub fn ref_count(&self, key: &TileKey) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.ref_count)
    }

    pub fn is_resident(&self, key: &TileKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.data.is_some())
    }

    pub fn is_dirty(&self, key: &TileKey) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.dirty)
    }

    /// Changes the budget, evicting until resident usage fits it.
    pub fn set_max_bytes(&mut self, max_bytes: usize, wire: &mut dyn TileWire) -> TileResult<()> {
        self.max_bytes = max_bytes;
        while self.resident_bytes > self.max_bytes {
            if !self.evict_lru(wire)? {
                break;
            }
        }
        Ok(())
    }

    /// Takes a reference, fetching the tile if it is not resident.
    pub fn ref_tile(&mut self, spec: TileSpec, wire: &mut dyn TileWire) -> TileResult<TileKey> {
        self.reference(spec, wire, false)
    }

    /// Takes a reference to a tile whose initial contents are zero. Nothing
    /// is fetched from the host.
    pub fn ref_zero(&mut self, spec: TileSpec, wire: &mut dyn TileWire) -> TileResult<TileKey> {
        self.reference(spec, wire, true)
    }

    fn reference(
        &mut self,
        spec: TileSpec,
        wire: &mut dyn TileWire,
        zeroed: bool,
    ) -> TileResult<TileKey> {
        let key = spec.key;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.ref_count += 1;
            if entry.data.is_some() {
                self.lru.promote(&key);
                return Ok(key);
            }
        } else {
            self.entries.insert(
                key,
                Entry {
                    spec,
                    ref_count: 1,
                    dirty: false,
                    data: None,
                },
            );
        }

        let loaded = if zeroed {
            self.make_room(spec.size(), wire)
                .map(|()| vec![0u8; spec.size()])
        } else {
            self.load(spec, wire)
        };
        match loaded {
            Ok(data) => {
                self.install(key, data);
                Ok(key)
            }
            Err(err) => {
                self.release_failed(key);
                Err(err)
            }
        }
    }

    /// Pixel data of a referenced tile, fetched again if it was evicted.
    pub fn data(&mut self, key: TileKey, wire: &mut dyn TileWire) -> TileResult<&[u8]> {
        self.ensure_resident(key, wire)?;
        self.entries
            .get(&key)
            .and_then(|entry| entry.data.as_deref())
            .ok_or(PluginError::NotReferenced(key))
    }

    /// Mutable pixel data; the tile is marked dirty.
    pub fn data_mut(&mut self, key: TileKey, wire: &mut dyn TileWire) -> TileResult<&mut [u8]> {
        self.ensure_resident(key, wire)?;
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(PluginError::NotReferenced(key))?;
        entry.dirty = true;
        entry
            .data
            .as_deref_mut()
            .ok_or(PluginError::NotReferenced(key))
    }

    /// Drops a reference. The last one writes the tile back if it is dirty
    /// and frees its buffer.
    pub fn unref(&mut self, key: TileKey, dirty: bool, wire: &mut dyn TileWire) -> TileResult<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(PluginError::NotReferenced(key))?;
        entry.dirty |= dirty;
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }

        let Some(entry) = self.entries.remove(&key) else {
            return Ok(());
        };
        let flushed = match (&entry.data, entry.dirty) {
            (Some(data), true) => wire.store(&entry.spec, data).map_err(PluginError::from),
            _ => Ok(()),
        };
        if entry.data.is_some() {
            self.lru.pop(&key);
            self.resident_bytes -= entry.spec.size();
        }
        tracing::trace!(?key, dirty = entry.dirty, "tile released");
        flushed
    }

    /// Writes a dirty tile back without giving up the reference.
    pub fn flush(&mut self, key: TileKey, wire: &mut dyn TileWire) -> TileResult<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(PluginError::NotReferenced(key))?;
        if let (Some(data), true) = (&entry.data, entry.dirty) {
            wire.store(&entry.spec, data)?;
            entry.dirty = false;
        }
        Ok(())
    }

    /// Drops every tile of a drawable, writing dirty ones back first.
    pub fn purge(&mut self, drawable_id: i32, wire: &mut dyn TileWire) -> TileResult<()> {
        let keys: Vec<TileKey> = self
            .entries
            .keys()
            .filter(|key| key.drawable_id == drawable_id)
            .copied()
            .collect();
        let mut first_error = None;
        for key in keys {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            if let (Some(data), true) = (&entry.data, entry.dirty) {
                if let Err(err) = wire.store(&entry.spec, data) {
                    first_error.get_or_insert(PluginError::from(err));
                }
            }
            if entry.data.is_some() {
                self.lru.pop(&key);
                self.resident_bytes -= entry.spec.size();
            }
        }
        tracing::debug!(drawable_id, resident = self.resident_bytes, "drawable tiles purged");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_resident(&mut self, key: TileKey, wire: &mut dyn TileWire) -> TileResult<()> {
        let spec = match self.entries.get(&key) {
            None => return Err(PluginError::NotReferenced(key)),
            Some(entry) if entry.data.is_some() => {
                self.lru.promote(&key);
                return Ok(());
            }
            Some(entry) => entry.spec,
        };
        let data = self.load(spec, wire)?;
        self.install(key, data);
        Ok(())
    }

    fn load(&mut self, spec: TileSpec, wire: &mut dyn TileWire) -> TileResult<Vec<u8>> {
        self.make_room(spec.size(), wire)?;
        let data = wire.fetch(&spec)?;
        tracing::trace!(key = ?spec.key, bytes = data.len(), "tile fetched");
        Ok(data)
    }

    fn install(&mut self, key: TileKey, data: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            self.resident_bytes += entry.spec.size();
            entry.data = Some(data);
            self.lru.put(key, ());
        }
    }

    /// Undoes the reference taken by a failed `reference` call.
    fn release_failed(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 && entry.data.is_none() {
                self.entries.remove(&key);
            }
        }
    }

    fn high_water(&self) -> usize {
        self.max_bytes - (self.max_bytes as f64 * FREE_QUANTUM) as usize
    }

    fn make_room(&mut self, size: usize, wire: &mut dyn TileWire) -> TileResult<()> {
        if size > self.max_bytes {
            return Err(PluginError::TileTooLarge {
                size,
                max: self.max_bytes,
            });
        }
        let high_water = self.high_water();
        if self.resident_bytes + size > high_water {
            while self.resident_bytes + size > high_water {
                if !self.evict_lru(wire)? {
                    break;
                }
            }
            tracing::debug!(
                resident = self.resident_bytes,
                max = self.max_bytes,
                "tile cache shrunk"
            );
        }
        if self.resident_bytes + size > self.max_bytes {
            return Err(PluginError::CacheExhausted { needed: size });
        }
        Ok(())
    }

    /// Evicts the least recently used resident tile. Returns false when
    /// nothing is resident.
    fn evict_lru(&mut self, wire: &mut dyn TileWire) -> TileResult<bool> {
        let Some((key, ())) = self.lru.pop_lru() else {
            return Ok(false);
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return Ok(true);
        };
        let Some(data) = entry.data.take() else {
            return Ok(true);
        };
        let spec = entry.spec;
        let dirty = entry.dirty;
        entry.dirty = false;
        if entry.ref_count == 0 {
            self.entries.remove(&key);
        }
        self.resident_bytes -= spec.size();
        tracing::trace!(?key, dirty, "tile evicted");
        if dirty {
            wire.store(&spec, &data)?;
        }
        Ok(true)
    }
}
