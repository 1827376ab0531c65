//! Plug-in side of the pixwire protocol.
//!
//! A plug-in implements [`Plugin`] and hands itself to [`plugin_main`] (or to
//! a [`PluginRuntime`] over any transport). The runtime answers the host's
//! `Config`, `ProcRun` and `TempProcRun` messages. Procedures reach the host
//! through [`PluginContext`], which also owns the tile cache.
//!
//! ```rust,ignore
//! struct Invert;
//!
//! impl Plugin for Invert {
//!     fn procedures(&self) -> Vec<ProcInstall> { /* ... */ }
//!
//!     fn run(&mut self, ctx: &mut PluginContext, _name: &str, params: &[Param]) -> Vec<Param> {
//!         let drawable = ctx.drawable_info(params[2].as_id().unwrap_or(-1));
//!         // ref tiles, edit them through tile_data_mut, unref dirty ...
//!         vec![Param::status(PdbStatus::Success)]
//!     }
//! }
//!
//! fn main() {
//!     if let Err(err) = pixwire_plugin::plugin_main(Invert) {
//!         eprintln!("{err}");
//!     }
//! }
//! ```

pub mod error;
pub mod runtime;
pub mod tile_cache;

pub use error::PluginError;
pub use runtime::{
    plugin_main, Plugin, PluginArgs, PluginContext, PluginMode, PluginRuntime, TempHandler,
    WireTiles, DEFAULT_TILE_CACHE_BYTES,
};
pub use tile_cache::{DrawableInfo, TileCache, TileKey, TileSpec, TileWire, FREE_QUANTUM};
