//! The host session: open plug-ins, the procedure database and the wait stack
//! that schedules them.
//!
//! Nothing here recurses. A call into a plug-in registers a wait and pushes a
//! frame; [`HostSession::run_procedure`] then services whichever plug-in is on
//! top of the stack until its own wait resolves. A plug-in that calls another
//! plug-in simply adds a frame above its own, and the reply is forwarded to it
//! when the inner wait resolves.

use crate::context::{
    default_args, register_builtins, ActiveContext, CallContext, LogProgress, ProgressSink,
};
use crate::drawable::{DrawableStore, MemoryDrawables};
use crate::error::{HostError, ProcedureError};
use crate::install::validate_install;
use crate::marshal::{Argument, BorrowedArgs, OwnedArgs, ReturnValues};
use crate::pdb::{Dispatch, ProcedureDb, ProcedureLookup, ProcedureRecord};
use crate::process::{Launcher, OpenMode, PluginId, PluginProcess, PluginState};
use crate::stack::{CallStack, WaitId};
use crate::tiles::TileService;
use pixwire_core::HostSettings;
use pixwire_wire::{
    Config, Message, MessageRef, ParamDef, PdbStatus, ProcCall, ProcCallRef, ProcInstall, ProcKind,
    ProtocolError, RunMode, SharedSegment, WireError,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Procedures a plug-in program installed during its query pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDef {
    pub program: PathBuf,
    pub procedures: Vec<ProcInstall>,
}

/// Completion callback of an asynchronous extension launch.
pub type ExtensionCallback = Box<dyn FnOnce(ReturnValues) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Return,
    TempReturn,
    ExtensionAck,
}

impl Awaiting {
    fn accepts(self, reply: Awaiting) -> bool {
        match reply {
            // An extension may finish without ever acknowledging.
            Awaiting::Return => matches!(self, Awaiting::Return | Awaiting::ExtensionAck),
            other => self == other,
        }
    }
}

enum Resume {
    /// The host code that started the call collects the result.
    Caller,
    /// A plug-in is blocked in its own `ProcRun` and gets the result back.
    Forward { caller: PluginId, proc_name: String },
    Callback(ExtensionCallback),
}

struct Wait {
    plugin: PluginId,
    awaiting: Awaiting,
    proc_name: String,
    returns: Vec<ParamDef>,
    resume: Resume,
}

enum Started {
    Done(ReturnValues),
    Waiting { plugin: PluginId, awaiting: Awaiting },
}

/// Overrides the run mode of another context.
struct WithRunMode<'a> {
    inner: &'a dyn ActiveContext,
    mode: RunMode,
}

impl ActiveContext for WithRunMode<'_> {
    fn run_mode(&self) -> RunMode {
        self.mode
    }

    fn image(&self) -> Option<i32> {
        self.inner.image()
    }

    fn drawable(&self) -> Option<i32> {
        self.inner.drawable()
    }

    fn display(&self) -> Option<i32> {
        self.inner.display()
    }
}

pub struct HostSession {
    settings: HostSettings,
    pdb: ProcedureDb,
    plugins: BTreeMap<PluginId, PluginProcess>,
    stack: CallStack,
    waits: HashMap<WaitId, Wait>,
    finished: HashMap<WaitId, ReturnValues>,
    next_plugin: u64,
    next_wait: u64,
    launcher: Box<dyn Launcher>,
    drawables: Box<dyn DrawableStore>,
    progress: Box<dyn ProgressSink>,
    shm: Option<SharedSegment>,
    plugin_defs: Vec<PluginDef>,
    last_run: Option<String>,
}

impl HostSession {
    pub fn new(settings: HostSettings, launcher: impl Launcher + 'static) -> Self {
        let mut pdb = ProcedureDb::new();
        register_builtins(&mut pdb);
        let shm = settings
            .use_shm
            .then(|| SharedSegment::allocate(settings.max_tile_bytes()));
        Self {
            settings,
            pdb,
            plugins: BTreeMap::new(),
            stack: CallStack::new(),
            waits: HashMap::new(),
            finished: HashMap::new(),
            next_plugin: 1,
            next_wait: 1,
            launcher: Box::new(launcher),
            drawables: Box::new(MemoryDrawables::new()),
            progress: Box::new(LogProgress),
            shm,
            plugin_defs: Vec::new(),
            last_run: None,
        }
    }

    pub fn with_drawables(mut self, drawables: impl DrawableStore + 'static) -> Self {
        self.drawables = Box::new(drawables);
        self
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn pdb(&self) -> &ProcedureDb {
        &self.pdb
    }

    pub fn pdb_mut(&mut self) -> &mut ProcedureDb {
        &mut self.pdb
    }

    pub fn drawables(&self) -> &dyn DrawableStore {
        self.drawables.as_ref()
    }

    /// Results of every query pass so far.
    pub fn plugin_defs(&self) -> &[PluginDef] {
        &self.plugin_defs
    }

    pub fn plugin(&self, id: PluginId) -> Option<&PluginProcess> {
        self.plugins.get(&id)
    }

    /// State of a plug-in this session started, open or not.
    pub fn plugin_state(&self, id: PluginId) -> Option<PluginState> {
        match self.plugins.get(&id) {
            Some(process) => Some(process.state()),
            None if id.0 > 0 && id.0 < self.next_plugin => Some(PluginState::Closed),
            None => None,
        }
    }

    pub fn open_plugins(&self) -> impl Iterator<Item = PluginId> + '_ {
        self.plugins.keys().copied()
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    /// The procedure `repeat_last` would run.
    pub fn last_run(&self) -> Option<&str> {
        self.last_run.as_deref()
    }

    fn wire_config(&self, shm_attached: bool) -> Config {
        let mut config = Config::new(self.settings.tile_width, self.settings.tile_height);
        config.shm_id = match (&self.shm, shm_attached) {
            (Some(segment), true) => segment.id(),
            _ => -1,
        };
        config.gamma = self.settings.gamma;
        config.install_cmap = self.settings.install_cmap;
        config.use_xshm = self.settings.use_xshm;
        config.color_cube = self.settings.color_cube;
        config
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.settings.close_grace_ms)
    }

    /// Launches a plug-in program. In run mode the host configuration is sent
    /// straight away.
    pub fn open_plugin(&mut self, program: &Path, mode: OpenMode) -> Result<PluginId, HostError> {
        let path = self
            .launcher
            .resolve(program, &self.settings.plugin_path)
            .ok_or_else(|| HostError::ProgramNotFound(program.to_path_buf()))?;
        let id = PluginId(self.next_plugin);
        self.next_plugin += 1;

        let mut argv = vec![
            path.display().to_string(),
            "-gimp".to_string(),
            "0".to_string(),
            "1".to_string(),
        ];
        match mode {
            OpenMode::Query => argv.push("-query".to_string()),
            OpenMode::Run => {
                argv.push(self.settings.tile_width.to_string());
                argv.push(self.settings.tile_height.to_string());
            }
        }

        let mut process = PluginProcess::new(id, path, argv, mode);
        process.open(self.launcher.as_mut(), self.shm.as_ref())?;
        if mode == OpenMode::Run {
            let config = self.wire_config(process.shm_attached());
            if let Err(err) = process.send(MessageRef::Config(&config)) {
                tracing::error!(plugin = %id, error = %err, "failed to configure plug-in");
                process.close(false, Duration::ZERO);
                return Err(err.into());
            }
        }
        tracing::info!(
            plugin = %id,
            program = %process.program().display(),
            mode = ?mode,
            shm = process.shm_attached(),
            "plug-in opened"
        );
        self.plugins.insert(id, process);
        Ok(id)
    }

    /// Runs a program in query mode and registers what it installs.
    pub fn query(&mut self, program: &Path) -> Result<PluginDef, HostError> {
        let id = self.open_plugin(program, OpenMode::Query)?;
        let path = self
            .plugins
            .get(&id)
            .map(|process| process.program().to_path_buf())
            .ok_or(HostError::UnknownPlugin(id))?;

        while self.plugins.contains_key(&id) {
            match self.service(id) {
                Ok(()) => {}
                Err(HostError::Wire(err)) if err.is_eof() => break,
                Err(err) => return Err(err),
            }
        }
        let def = self
            .plugin_defs
            .iter()
            .find(|def| def.program == path)
            .cloned()
            .unwrap_or(PluginDef {
                program: path,
                procedures: Vec::new(),
            });
        tracing::info!(
            program = %def.program.display(),
            procedures = def.procedures.len(),
            "query pass finished"
        );
        Ok(def)
    }

    fn lookup_checked(
        &self,
        name: &str,
        args: &[Argument],
    ) -> Result<ProcedureRecord, ProcedureError> {
        self.pdb.lookup_checked(name, args).cloned()
    }

    /// Runs a procedure to completion and returns its values, status first.
    pub fn run_procedure(
        &mut self,
        name: &str,
        args: &[Argument],
    ) -> Result<ReturnValues, HostError> {
        let record = self.lookup_checked(name, args)?;
        match self.start_call(&record, args, None)? {
            Started::Done(values) => Ok(values),
            Started::Waiting { plugin, awaiting } => {
                let wait = self.add_wait(plugin, awaiting, &record, Resume::Caller);
                Ok(self.drive(wait).unwrap_or_else(|| {
                    ReturnValues::defaults(PdbStatus::ExecutionError, &record.returns)
                }))
            }
        }
    }

    /// Starts an extension without blocking. `callback` runs once it
    /// acknowledges or returns. `None` means the call completed, and the
    /// callback ran, before this returned.
    pub fn start_extension(
        &mut self,
        name: &str,
        args: &[Argument],
        callback: impl FnOnce(ReturnValues) + Send + 'static,
    ) -> Result<Option<WaitId>, HostError> {
        let record = self.lookup_checked(name, args)?;
        match self.start_call(&record, args, None)? {
            Started::Done(values) => {
                callback(values);
                Ok(None)
            }
            Started::Waiting { plugin, awaiting } => Ok(Some(self.add_wait(
                plugin,
                awaiting,
                &record,
                Resume::Callback(Box::new(callback)),
            ))),
        }
    }

    /// Services plug-ins until `wait` has resolved. Waits that resume a
    /// host caller yield their values; callback waits, and waits that no
    /// longer exist, yield `None`.
    pub fn wait_for(&mut self, wait: WaitId) -> Option<ReturnValues> {
        self.drive(wait)
    }

    /// Runs a procedure with arguments filled from the active image, and
    /// remembers it for [`HostSession::repeat_last`].
    pub fn run_with_defaults(
        &mut self,
        name: &str,
        ctx: &dyn ActiveContext,
    ) -> Result<ReturnValues, HostError> {
        let record = self
            .pdb
            .lookup(name)
            .ok_or_else(|| ProcedureError::NotFound(name.to_string()))?;
        let args = default_args(record, ctx);
        if matches!(record.dispatch, Dispatch::Program(_)) {
            self.last_run = Some(name.to_string());
        }
        self.run_procedure(name, &args)
    }

    /// Runs the last procedure again with its previous values.
    pub fn repeat_last(
        &mut self,
        ctx: &dyn ActiveContext,
    ) -> Result<Option<ReturnValues>, HostError> {
        let Some(name) = self.last_run.clone() else {
            return Ok(None);
        };
        let ctx = WithRunMode {
            inner: ctx,
            mode: RunMode::WithLastVals,
        };
        self.run_with_defaults(&name, &ctx).map(Some)
    }

    fn start_call(
        &mut self,
        record: &ProcedureRecord,
        args: &[Argument],
        caller: Option<PluginId>,
    ) -> Result<Started, HostError> {
        match &record.dispatch {
            Dispatch::Internal(body) => {
                let mut ctx = CallContext {
                    progress: self.progress.as_mut(),
                    drawables: self.drawables.as_ref(),
                    caller,
                    depth: self.stack.depth(),
                };
                let values = body(&mut ctx, args);
                Ok(Started::Done(conformed(&record.name, &record.returns, values)))
            }
            Dispatch::Program(program) => {
                let plugin = self.open_plugin(program, OpenMode::Run)?;
                let awaiting = if record.kind == ProcKind::Extension && record.args.is_empty() {
                    Awaiting::ExtensionAck
                } else {
                    Awaiting::Return
                };
                let borrowed = BorrowedArgs::new(args, args.len());
                let call = ProcCallRef {
                    name: &record.name,
                    params: borrowed.as_list(),
                };
                let sent = match self.plugins.get_mut(&plugin) {
                    Some(process) => {
                        process.set_busy(true);
                        process.send(MessageRef::ProcRun(call))
                    }
                    None => return Err(HostError::UnknownPlugin(plugin)),
                };
                if let Err(err) = sent {
                    self.terminate(plugin);
                    return Err(err.into());
                }
                Ok(Started::Waiting { plugin, awaiting })
            }
            Dispatch::Temporary(owner) => {
                let owner = *owner;
                let Some(process) = self.plugins.get_mut(&owner) else {
                    tracing::warn!(
                        procedure = %record.name,
                        plugin = %owner,
                        "owner of temporary procedure is gone"
                    );
                    return Ok(Started::Done(ReturnValues::defaults(
                        PdbStatus::ExecutionError,
                        &record.returns,
                    )));
                };
                if process.is_busy() {
                    let err = ProcedureError::OwnerBusy {
                        name: record.name.clone(),
                    };
                    tracing::warn!(
                        plugin = %owner,
                        error = %err,
                        "temporary procedure call refused"
                    );
                    return Ok(Started::Done(ReturnValues::defaults(
                        PdbStatus::CallingError,
                        &record.returns,
                    )));
                }
                process.set_busy(true);
                let borrowed = BorrowedArgs::new(args, args.len());
                let call = ProcCallRef {
                    name: &record.name,
                    params: borrowed.as_list(),
                };
                if let Err(err) = process.send(MessageRef::TempProcRun(call)) {
                    self.terminate(owner);
                    return Err(err.into());
                }
                Ok(Started::Waiting {
                    plugin: owner,
                    awaiting: Awaiting::TempReturn,
                })
            }
        }
    }

    fn add_wait(
        &mut self,
        plugin: PluginId,
        awaiting: Awaiting,
        record: &ProcedureRecord,
        resume: Resume,
    ) -> WaitId {
        let id = WaitId(self.next_wait);
        self.next_wait += 1;
        if let Some(process) = self.plugins.get_mut(&plugin) {
            process.flags.synchronous = !matches!(resume, Resume::Callback(_));
        }
        if let Resume::Forward { caller, .. } = &resume {
            if let Some(process) = self.plugins.get_mut(caller) {
                process.flags.recursing = true;
            }
        }
        self.waits.insert(
            id,
            Wait {
                plugin,
                awaiting,
                proc_name: record.name.clone(),
                returns: record.returns.clone(),
                resume,
            },
        );
        self.stack.push(plugin, id);
        id
    }

    /// Services the stack until `wait` resolves. Yields the values for
    /// waits collected by the caller.
    fn drive(&mut self, wait: WaitId) -> Option<ReturnValues> {
        loop {
            if let Some(values) = self.finished.remove(&wait) {
                return Some(values);
            }
            if !self.waits.contains_key(&wait) {
                return None;
            }
            let plugin = self.stack.current_plugin()?;
            if let Err(err) = self.service(plugin) {
                tracing::error!(
                    plugin = %plugin,
                    error = %err,
                    "plug-in failed while a call was pending"
                );
            }
        }
    }

    /// Services the plug-in on top of the stack once. Returns false when
    /// nothing is waiting.
    pub fn pump(&mut self) -> Result<bool, HostError> {
        match self.stack.current_plugin() {
            Some(plugin) => self.service(plugin).map(|()| true),
            None => Ok(false),
        }
    }

    /// Pumps until no call is pending.
    pub fn run_until_idle(&mut self) {
        while let Some(plugin) = self.stack.current_plugin() {
            if let Err(err) = self.service(plugin) {
                tracing::error!(
                    plugin = %plugin,
                    error = %err,
                    "plug-in failed while a call was pending"
                );
            }
        }
    }

    /// Reads and handles one message from `plugin`. Transport and protocol
    /// errors close the plug-in and fail its waits before they are returned.
    pub fn service(&mut self, plugin: PluginId) -> Result<(), HostError> {
        let Some(process) = self.plugins.get_mut(&plugin) else {
            self.fail_waits_for(plugin);
            return Err(HostError::UnknownPlugin(plugin));
        };
        let message = match process.read() {
            Ok(message) => message,
            Err(err) => {
                if err.is_eof() {
                    tracing::debug!(plugin = %plugin, "plug-in channel closed");
                } else {
                    tracing::error!(
                        plugin = %plugin,
                        error = %err,
                        "unreadable message from plug-in"
                    );
                }
                self.terminate(plugin);
                return Err(err.into());
            }
        };
        let received = message.message_type();
        tracing::trace!(plugin = %plugin, message = %received, "message received");

        match message {
            Message::Quit => {
                self.close_with(plugin, false, self.grace());
                Ok(())
            }
            Message::Config(_)
            | Message::TileAck
            | Message::TileData(_)
            | Message::TempProcRun(_) => {
                tracing::warn!(
                    plugin = %plugin,
                    message = %received,
                    "unexpected message from plug-in"
                );
                self.terminate(plugin);
                Err(WireError::from(ProtocolError::UnexpectedMessage {
                    expected: "a plug-in request",
                    received,
                })
                .into())
            }
            Message::TileReq(request) => {
                let result = match self.plugins.get_mut(&plugin) {
                    Some(process) => TileService::new(
                        process,
                        self.drawables.as_mut(),
                        self.shm.as_ref(),
                        self.settings.tile_width,
                        self.settings.tile_height,
                    )
                    .serve(request),
                    None => return Err(HostError::UnknownPlugin(plugin)),
                };
                if let Err(err) = result {
                    tracing::error!(plugin = %plugin, error = %err, "tile transfer failed");
                    self.terminate(plugin);
                    return Err(err.into());
                }
                Ok(())
            }
            Message::ProcRun(call) => self.handle_proc_run(plugin, call),
            Message::ProcReturn(call) => {
                let values = ReturnValues::from_params(call.params);
                self.resolve_reply(plugin, Awaiting::Return, values);
                self.close_with(plugin, true, self.grace());
                Ok(())
            }
            Message::TempProcReturn(call) => {
                if let Some(process) = self.plugins.get_mut(&plugin) {
                    process.set_busy(false);
                }
                let values = ReturnValues::from_params(call.params);
                self.resolve_reply(plugin, Awaiting::TempReturn, values);
                Ok(())
            }
            Message::ProcInstall(install) => {
                self.handle_install(plugin, install);
                Ok(())
            }
            Message::ProcUninstall(name) => {
                self.handle_uninstall(plugin, &name);
                Ok(())
            }
            Message::ExtensionAck => {
                if let Some(process) = self.plugins.get_mut(&plugin) {
                    process.set_busy(false);
                }
                self.resolve_reply(
                    plugin,
                    Awaiting::ExtensionAck,
                    ReturnValues::status_only(PdbStatus::Success),
                );
                Ok(())
            }
        }
    }

    fn handle_proc_run(&mut self, plugin: PluginId, call: ProcCall) -> Result<(), HostError> {
        let ProcCall { name, params } = call;
        let args = OwnedArgs::from(params).into_arguments();
        let record = match self.lookup_checked(&name, &args) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    plugin = %plugin,
                    procedure = %name,
                    error = %err,
                    "call from plug-in refused"
                );
                let returns = self
                    .pdb
                    .lookup(&name)
                    .map(|record| record.returns.clone())
                    .unwrap_or_default();
                return self
                    .reply(plugin, &name, ReturnValues::defaults(PdbStatus::CallingError, &returns))
                    .map_err(HostError::from);
            }
        };

        tracing::debug!(plugin = %plugin, procedure = %name, "plug-in called procedure");
        match self.start_call(&record, &args, Some(plugin)) {
            Ok(Started::Done(values)) => self.reply(plugin, &name, values).map_err(HostError::from),
            Ok(Started::Waiting { plugin: target, awaiting }) => {
                self.add_wait(
                    target,
                    awaiting,
                    &record,
                    Resume::Forward {
                        caller: plugin,
                        proc_name: name,
                    },
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    plugin = %plugin,
                    procedure = %name,
                    error = %err,
                    "nested call failed to start"
                );
                self.reply(
                    plugin,
                    &name,
                    ReturnValues::defaults(PdbStatus::ExecutionError, &record.returns),
                )
                .map_err(HostError::from)
            }
        }
    }

    /// Sends a `ProcReturn` with owned copies of `values` to a blocked plug-in.
    fn reply(
        &mut self,
        plugin: PluginId,
        name: &str,
        values: ReturnValues,
    ) -> Result<(), WireError> {
        let Some(process) = self.plugins.get_mut(&plugin) else {
            tracing::debug!(plugin = %plugin, procedure = name, "caller closed before its reply");
            return Ok(());
        };
        let owned = OwnedArgs::from(values.into_params());
        let result = process.send(MessageRef::ProcReturn(ProcCallRef {
            name,
            params: owned.as_list(),
        }));
        if let Err(err) = result {
            tracing::error!(
                plugin = %plugin,
                procedure = name,
                error = %err,
                "failed to deliver return values"
            );
            self.terminate(plugin);
            return Err(err);
        }
        Ok(())
    }

    fn resolve_reply(&mut self, plugin: PluginId, reply: Awaiting, values: ReturnValues) {
        let wait = self
            .waits
            .iter()
            .filter(|(_, wait)| wait.plugin == plugin && wait.awaiting.accepts(reply))
            .map(|(id, _)| *id)
            .max();
        match wait {
            Some(wait) => self.resolve(wait, values),
            None => tracing::warn!(plugin = %plugin, reply = ?reply, "reply with no pending call"),
        }
    }

    fn resolve(&mut self, id: WaitId, values: ReturnValues) {
        self.stack.remove(id);
        let Some(wait) = self.waits.remove(&id) else {
            return;
        };
        if let Some(process) = self.plugins.get_mut(&wait.plugin) {
            process.flags.synchronous = false;
        }
        let values = conformed(&wait.proc_name, &wait.returns, values);
        tracing::debug!(
            wait = %id,
            plugin = %wait.plugin,
            status = ?values.status(),
            "wait resolved"
        );
        match wait.resume {
            Resume::Caller => {
                self.finished.insert(id, values);
            }
            Resume::Forward { caller, proc_name } => {
                if let Some(process) = self.plugins.get_mut(&caller) {
                    process.flags.recursing = false;
                }
                // A failed delivery has already closed the caller.
                let _ = self.reply(caller, &proc_name, values);
            }
            Resume::Callback(callback) => callback(values),
        }
    }

    fn fail_waits_for(&mut self, plugin: PluginId) {
        let mut doomed: Vec<WaitId> = self
            .waits
            .iter()
            .filter(|(_, wait)| wait.plugin == plugin)
            .map(|(id, _)| *id)
            .collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for wait in doomed {
            self.resolve(wait, ReturnValues::status_only(PdbStatus::ExecutionError));
        }
    }

    fn handle_install(&mut self, plugin: PluginId, install: ProcInstall) {
        if let Err(err) = validate_install(&install) {
            tracing::warn!(
                plugin = %plugin,
                procedure = %install.name,
                error = %err,
                "install rejected"
            );
            return;
        }
        let Some(process) = self.plugins.get_mut(&plugin) else {
            return;
        };
        let query_mode = process.flags.query_mode;
        let dispatch = match install.kind {
            ProcKind::Temporary if query_mode => {
                tracing::warn!(
                    plugin = %plugin,
                    procedure = %install.name,
                    "temporary procedures cannot be installed during a query"
                );
                return;
            }
            ProcKind::Temporary => {
                if !process.temp_procs.contains(&install.name) {
                    process.temp_procs.push(install.name.clone());
                }
                Dispatch::Temporary(plugin)
            }
            ProcKind::Plugin | ProcKind::Extension => {
                if query_mode {
                    process.installs.retain(|known| known.name != install.name);
                    process.installs.push(install.clone());
                }
                Dispatch::Program(process.program().to_path_buf())
            }
            ProcKind::Internal => {
                tracing::warn!(
                    plugin = %plugin,
                    procedure = %install.name,
                    "plug-ins cannot install internal procedures"
                );
                return;
            }
        };

        let name = install.name.clone();
        let previous = self.pdb.register(ProcedureRecord::from_install(install, dispatch));
        let displaced = previous
            .and_then(|record| record.owner())
            .filter(|owner| *owner != plugin);
        if let Some(owner) = displaced {
            if let Some(process) = self.plugins.get_mut(&owner) {
                process.temp_procs.retain(|known| *known != name);
            }
        }
        tracing::debug!(plugin = %plugin, procedure = %name, "procedure installed");
    }

    fn handle_uninstall(&mut self, plugin: PluginId, name: &str) {
        let owner = self.pdb.get(name).and_then(ProcedureRecord::owner);
        if owner != Some(plugin) {
            tracing::warn!(
                plugin = %plugin,
                procedure = name,
                "uninstall of a procedure the plug-in does not own"
            );
            return;
        }
        self.pdb.unregister(name);
        if let Some(process) = self.plugins.get_mut(&plugin) {
            process.temp_procs.retain(|known| known != name);
        }
    }

    /// Closes a plug-in politely: `Quit`, then the grace period.
    pub fn close_plugin(&mut self, plugin: PluginId) -> Result<(), HostError> {
        if !self.plugins.contains_key(&plugin) {
            return Err(HostError::UnknownPlugin(plugin));
        }
        self.close_with(plugin, true, self.grace());
        Ok(())
    }

    fn terminate(&mut self, plugin: PluginId) {
        self.close_with(plugin, false, Duration::ZERO);
    }

    fn close_with(&mut self, plugin: PluginId, send_quit: bool, grace: Duration) {
        let Some(mut process) = self.plugins.remove(&plugin) else {
            return;
        };
        process.close(send_quit, grace);
        self.pdb.remove_owned_by(plugin);
        if process.flags.query_mode {
            let program = process.program().to_path_buf();
            let procedures = std::mem::take(&mut process.installs);
            match self.plugin_defs.iter_mut().find(|def| def.program == program) {
                Some(def) => def.procedures = procedures,
                None => self.plugin_defs.push(PluginDef { program, procedures }),
            }
        }
        tracing::info!(plugin = %plugin, "plug-in closed");
        self.fail_waits_for(plugin);
    }

    /// Closes every open plug-in.
    pub fn shutdown(&mut self) {
        let open: Vec<PluginId> = self.plugins.keys().copied().collect();
        let grace = self.grace();
        for plugin in open {
            self.close_with(plugin, true, grace);
        }
    }
}

/// Fits a callee's values to its declared returns. Malformed results never
/// reach the caller; it gets execution-error defaults instead.
fn conformed(name: &str, returns: &[ParamDef], values: ReturnValues) -> ReturnValues {
    values.conform(name, returns).unwrap_or_else(|err| {
        tracing::warn!(procedure = name, error = %err, "malformed return values replaced");
        ReturnValues::defaults(PdbStatus::ExecutionError, returns)
    })
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
