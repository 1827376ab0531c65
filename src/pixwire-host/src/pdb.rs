//! The procedure database.

use crate::context::CallContext;
use crate::error::ProcedureError;
use crate::install::{ImageTypes, MenuLocation};
use crate::marshal::{Argument, ReturnValues};
use crate::process::PluginId;
use pixwire_wire::{ParamDef, ProcInstall, ProcKind};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Body of an internal procedure.
pub type InternalFn = Arc<dyn Fn(&mut CallContext<'_>, &[Argument]) -> ReturnValues + Send + Sync>;

/// Where a call to a procedure goes.
#[derive(Clone)]
pub enum Dispatch {
    Internal(InternalFn),
    /// Run by launching this program.
    Program(PathBuf),
    /// Served by the open plug-in that installed it.
    Temporary(PluginId),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Internal(_) => f.write_str("Internal"),
            Dispatch::Program(path) => f.debug_tuple("Program").field(path).finish(),
            Dispatch::Temporary(owner) => f.debug_tuple("Temporary").field(owner).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcedureRecord {
    pub name: String,
    pub blurb: String,
    pub help: String,
    pub author: String,
    pub copyright: String,
    pub date: String,
    pub menu_path: Option<String>,
    pub image_types: Option<String>,
    pub kind: ProcKind,
    pub args: Vec<ParamDef>,
    pub returns: Vec<ParamDef>,
    pub dispatch: Dispatch,
}

impl ProcedureRecord {
    pub fn internal<F>(
        name: impl Into<String>,
        args: Vec<ParamDef>,
        returns: Vec<ParamDef>,
        body: F,
    ) -> Self
    where
        F: Fn(&mut CallContext<'_>, &[Argument]) -> ReturnValues + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            blurb: String::new(),
            help: String::new(),
            author: String::new(),
            copyright: String::new(),
            date: String::new(),
            menu_path: None,
            image_types: None,
            kind: ProcKind::Internal,
            args,
            returns,
            dispatch: Dispatch::Internal(Arc::new(body)),
        }
    }

    pub fn with_blurb(mut self, blurb: impl Into<String>) -> Self {
        self.blurb = blurb.into();
        self
    }

    pub fn from_install(install: ProcInstall, dispatch: Dispatch) -> Self {
        Self {
            name: install.name,
            blurb: install.blurb,
            help: install.help,
            author: install.author,
            copyright: install.copyright,
            date: install.date,
            menu_path: install.menu_path,
            image_types: install.image_types,
            kind: install.kind,
            args: install.params,
            returns: install.returns,
            dispatch,
        }
    }

    pub fn to_install(&self) -> ProcInstall {
        ProcInstall {
            name: self.name.clone(),
            blurb: self.blurb.clone(),
            help: self.help.clone(),
            author: self.author.clone(),
            copyright: self.copyright.clone(),
            date: self.date.clone(),
            menu_path: self.menu_path.clone(),
            image_types: self.image_types.clone(),
            kind: self.kind,
            params: self.args.clone(),
            returns: self.returns.clone(),
        }
    }

    /// The plug-in serving this procedure, for temporary procedures.
    pub fn owner(&self) -> Option<PluginId> {
        match self.dispatch {
            Dispatch::Temporary(owner) => Some(owner),
            _ => None,
        }
    }

    pub fn menu_location(&self) -> Option<MenuLocation> {
        self.menu_path.as_deref().and_then(MenuLocation::from_menu_path)
    }

    /// Image types this procedure accepts; empty means any.
    pub fn accepted_types(&self) -> ImageTypes {
        self.image_types
            .as_deref()
            .map(ImageTypes::parse)
            .unwrap_or_default()
    }

    pub fn accepts(&self, image_type: ImageTypes) -> bool {
        let accepted = self.accepted_types();
        accepted.is_empty() || accepted.intersects(image_type)
    }

    /// Checks argument count and kinds against the declaration.
    pub fn check_args(&self, args: &[Argument]) -> Result<(), ProcedureError> {
        if args.len() != self.args.len() {
            return Err(ProcedureError::ArgumentCount {
                name: self.name.clone(),
                expected: self.args.len(),
                actual: args.len(),
            });
        }
        for (index, (arg, def)) in args.iter().zip(&self.args).enumerate() {
            if arg.kind() != def.kind {
                return Err(ProcedureError::ArgumentKind {
                    name: self.name.clone(),
                    index,
                    expected: def.kind,
                    actual: arg.kind(),
                });
            }
        }
        Ok(())
    }
}

/// Name lookup into a procedure table.
pub trait ProcedureLookup {
    fn lookup(&self, name: &str) -> Option<&ProcedureRecord>;

    /// Looks up `name` and checks `args` against its declaration.
    fn lookup_checked(
        &self,
        name: &str,
        args: &[Argument],
    ) -> Result<&ProcedureRecord, ProcedureError> {
        let record = self
            .lookup(name)
            .ok_or_else(|| ProcedureError::NotFound(name.to_string()))?;
        record.check_args(args)?;
        Ok(record)
    }
}

/// All procedures known to a host session, keyed by name.
#[derive(Debug, Default)]
pub struct ProcedureDb {
    procedures: BTreeMap<String, ProcedureRecord>,
}

impl ProcedureDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a procedure, returning the one it replaced.
    pub fn register(&mut self, record: ProcedureRecord) -> Option<ProcedureRecord> {
        tracing::debug!(procedure = %record.name, kind = ?record.kind, "procedure registered");
        self.procedures.insert(record.name.clone(), record)
    }

    pub fn unregister(&mut self, name: &str) -> Option<ProcedureRecord> {
        let removed = self.procedures.remove(name);
        if removed.is_some() {
            tracing::debug!(procedure = name, "procedure unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&ProcedureRecord> {
        self.procedures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Procedures in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcedureRecord> {
        self.procedures.values()
    }

    /// Removes every temporary procedure served by `owner`.
    pub fn remove_owned_by(&mut self, owner: PluginId) -> Vec<String> {
        let names: Vec<String> = self
            .procedures
            .values()
            .filter(|record| record.owner() == Some(owner))
            .map(|record| record.name.clone())
            .collect();
        for name in &names {
            self.procedures.remove(name);
        }
        if !names.is_empty() {
            tracing::debug!(plugin = %owner, count = names.len(), "temporary procedures removed");
        }
        names
    }
}

impl ProcedureLookup for ProcedureDb {
    fn lookup(&self, name: &str) -> Option<&ProcedureRecord> {
        self.get(name)
    }
}
