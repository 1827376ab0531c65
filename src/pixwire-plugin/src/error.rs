use crate::tile_cache::TileKey;
use pixwire_wire::WireError;
use thiserror::Error;

/// Errors raised on the plug-in side of the protocol.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("{program} is a pixwire plug-in and must be run by the host")]
    Usage { program: String },
    #[error("unsupported channel descriptors {read}/{write}; only stdin/stdout are supported")]
    UnsupportedDescriptors { read: String, write: String },
    #[error("host protocol {host} is older than plug-in protocol {plugin}")]
    HostTooOld { host: u32, plugin: u32 },
    #[error("plug-in protocol {plugin} is older than host protocol {host}")]
    PluginTooOld { host: u32, plugin: u32 },
    #[error("tile of {size} bytes exceeds the tile cache size of {max}")]
    TileTooLarge { size: usize, max: usize },
    #[error("tile cache cannot make room for {needed} bytes")]
    CacheExhausted { needed: usize },
    #[error("tile {0:?} is not referenced")]
    NotReferenced(TileKey),
    #[error("host does not know drawable {0}")]
    UnknownDrawable(i32),
    #[error("host reported drawable {drawable_id} as {width}x{height} with {bpp} bytes per pixel")]
    InvalidGeometry {
        drawable_id: i32,
        width: i32,
        height: i32,
        bpp: i32,
    },
    #[error("tile {tile_num} is outside drawable {drawable_id}")]
    NoSuchTile { drawable_id: i32, tile_num: u32 },
}
