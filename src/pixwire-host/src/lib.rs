//! Host side of the pixwire plug-in protocol.
//!
//! A [`HostSession`] owns everything the image editor needs to talk to its
//! plug-ins: the open plug-in processes, the [`ProcedureDb`], the call stack
//! of pending waits and the tile service that moves pixels in and out of the
//! [`DrawableStore`].
//!
//! ```no_run
//! use pixwire_core::HostSettings;
//! use pixwire_host::{HostSession, ProcessLauncher};
//! use std::path::Path;
//!
//! let settings = HostSettings::default();
//! let launcher = ProcessLauncher::from_settings(&settings);
//! let mut session = HostSession::new(settings, launcher);
//! let def = session.query(Path::new("blur"))?;
//! for procedure in &def.procedures {
//!     println!("{}", procedure.name);
//! }
//! # Ok::<(), pixwire_host::HostError>(())
//! ```

pub mod context;
pub mod drawable;
pub mod error;
pub mod install;
pub mod marshal;
pub mod pdb;
pub mod process;
pub mod session;
pub mod stack;
mod tiles;

pub use context::{
    default_args, register_builtins, ActiveContext, ActiveImage, CallContext, LogProgress,
    ProgressSink,
};
pub use drawable::{DrawableGeometry, DrawableStore, MemoryDrawables};
pub use error::{HostError, ProcedureError};
pub use install::{validate_install, ImageTypes, MenuLocation};
pub use marshal::{
    args_to_params, params_to_args, ArgValue, Argument, BorrowedArgs, OwnedArgs, ReturnValues,
    WireArgs,
};
pub use pdb::{Dispatch, InternalFn, ProcedureDb, ProcedureLookup, ProcedureRecord};
pub use process::{
    resolve_program, Launched, Launcher, OpenMode, PluginChild, PluginFlags, PluginId,
    PluginProcess, PluginState, ProcessLauncher, ThreadChild, ThreadEntry, ThreadLauncher,
};
pub use session::{ExtensionCallback, HostSession, PluginDef};
pub use stack::{CallStack, Frame, WaitId};
