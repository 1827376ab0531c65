use crate::process::PluginId;
use pixwire_wire::{ParamType, WireError};
use std::path::PathBuf;
use thiserror::Error;

/// A procedure call or install that does not fit the procedure database.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcedureError {
    #[error("procedure {0} not found")]
    NotFound(String),
    #[error("{name} takes {expected} arguments, got {actual}")]
    ArgumentCount {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("argument {index} of {name} must be {expected}, got {actual}")]
    ArgumentKind {
        name: String,
        index: usize,
        expected: ParamType,
        actual: ParamType,
    },
    #[error("{name}: array {which} {index} is not preceded by an Int32 element count")]
    NonCompliantArray {
        name: String,
        which: &'static str,
        index: usize,
    },
    #[error("{name}: invalid menu location {menu_path:?}")]
    InvalidMenuLocation { name: String, menu_path: String },
    #[error("{name}: procedures under {location} must take ({expected})")]
    MenuArguments {
        name: String,
        location: &'static str,
        expected: &'static str,
    },
    #[error("return value {index} of {name} must be {expected}, got {actual}")]
    ReturnKind {
        name: String,
        index: usize,
        expected: ParamType,
        actual: ParamType,
    },
    #[error("{name}: returned array {index} does not match its element count")]
    ReturnArrayCount { name: String, index: usize },
    #[error("plug-in serving temporary procedure {name} is busy")]
    OwnerBusy { name: String },
}

/// Errors surfaced to the code driving a [`crate::HostSession`].
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start plug-in {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("plug-in program {0} not found on the plug-in path")]
    ProgramNotFound(PathBuf),
    #[error("no open plug-in {0}")]
    UnknownPlugin(PluginId),
    #[error(transparent)]
    Procedure(#[from] ProcedureError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
