//! Plug-in processes and the launchers that start them.

use crate::error::HostError;
use pixwire_core::HostSettings;
use pixwire_wire::{
    read_message, send_message, MemoryTransport, Message, MessageRef, PipeTransport,
    ProcInstall, SharedSegment, SharedWireBuffer, Transport, TransportError, WireError,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handle for a launched plug-in, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub(crate) u64);

impl PluginId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Created,
    Opening,
    Open,
    Busy,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginFlags {
    pub open: bool,
    pub query_mode: bool,
    pub synchronous: bool,
    pub recursing: bool,
    pub busy: bool,
}

/// How a plug-in is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Query,
    Run,
}

/// The child side of a launched plug-in, for reaping.
pub trait PluginChild: Send {
    /// True once the child has exited.
    fn try_wait(&mut self) -> std::io::Result<bool>;

    fn kill(&mut self) -> std::io::Result<()>;

    fn wait(&mut self) -> std::io::Result<()>;
}

impl PluginChild for Child {
    fn try_wait(&mut self) -> std::io::Result<bool> {
        Ok(Child::try_wait(self)?.is_some())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> std::io::Result<()> {
        Child::wait(self).map(drop)
    }
}

/// A channel and child produced by a [`Launcher`].
pub struct Launched {
    pub transport: Box<dyn Transport>,
    pub child: Box<dyn PluginChild>,
    /// True when the plug-in can reach the offered shared segment.
    pub shm_attached: bool,
}

/// Starts plug-in programs.
pub trait Launcher: Send {
    /// Resolves a program name against the plug-in search path.
    fn resolve(&self, program: &Path, search_path: &[PathBuf]) -> Option<PathBuf> {
        resolve_program(program, search_path)
    }

    /// Starts `program` with `argv` (`argv[0]` is the program itself).
    fn launch(
        &mut self,
        program: &Path,
        argv: &[String],
        shm: Option<&SharedSegment>,
    ) -> Result<Launched, HostError>;
}

/// Finds a program: paths with a directory component are used as given, bare
/// names are looked up in each search directory in order.
pub fn resolve_program(program: &Path, search_path: &[PathBuf]) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    search_path
        .iter()
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Launches plug-ins as child processes talking over their stdin and stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pipe_buffer_size: usize,
}

impl ProcessLauncher {
    pub fn new(pipe_buffer_size: usize) -> Self {
        Self { pipe_buffer_size }
    }

    /// Uses the configured pipe staging size.
    pub fn from_settings(settings: &HostSettings) -> Self {
        Self::new(settings.pipe_buffer_size)
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(pixwire_wire::DEFAULT_STAGING_SIZE)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &mut self,
        program: &Path,
        argv: &[String],
        _shm: Option<&SharedSegment>,
    ) -> Result<Launched, HostError> {
        let spawn_error = |source| HostError::Spawn {
            program: program.to_path_buf(),
            source,
        };
        let mut child = Command::new(program)
            .args(argv.iter().skip(1))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Both are requested as piped above.
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(std::io::Error::other("child pipes unavailable")));
        };
        tracing::debug!(program = %program.display(), pid = child.id(), "plug-in process started");
        Ok(Launched {
            transport: Box::new(PipeTransport::with_capacity(
                stdout,
                stdin,
                self.pipe_buffer_size,
            )),
            child: Box::new(child),
            shm_attached: false,
        })
    }
}

/// Entry point of an in-process plug-in: its argv, its end of the shared
/// buffer and the shared segment it may attach to.
pub type ThreadEntry =
    Arc<dyn Fn(Vec<String>, MemoryTransport, Option<SharedSegment>) + Send + Sync>;

/// A plug-in running on a thread of the host process.
pub struct ThreadChild {
    handle: Option<JoinHandle<()>>,
}

impl PluginChild for ThreadChild {
    fn try_wait(&mut self) -> std::io::Result<bool> {
        Ok(self.handle.as_ref().map_or(true, JoinHandle::is_finished))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        // A thread cannot be stopped from outside; its channel is already
        // closed, so its next wire operation fails.
        tracing::debug!("thread plug-in still running after close; joining");
        Ok(())
    }

    fn wait(&mut self) -> std::io::Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| std::io::Error::other("plug-in thread panicked")),
            None => Ok(()),
        }
    }
}

/// Launches registered in-process plug-ins over the shared-buffer transport.
#[derive(Clone, Default)]
pub struct ThreadLauncher {
    entries: HashMap<PathBuf, ThreadEntry>,
    buffer_size: usize,
}

impl ThreadLauncher {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            buffer_size,
        }
    }

    /// Sizes each channel direction by the configured shared buffer size.
    pub fn from_settings(settings: &HostSettings) -> Self {
        Self::new(settings.shared_buffer_size)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Registers `entry` under a program name.
    pub fn register(&mut self, program: impl Into<PathBuf>, entry: ThreadEntry) {
        self.entries.insert(program.into(), entry);
    }

    pub fn with(mut self, program: impl Into<PathBuf>, entry: ThreadEntry) -> Self {
        self.register(program, entry);
        self
    }

    pub fn programs(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }
}

impl Launcher for ThreadLauncher {
    fn resolve(&self, program: &Path, _search_path: &[PathBuf]) -> Option<PathBuf> {
        self.entries
            .contains_key(program)
            .then(|| program.to_path_buf())
    }

    fn launch(
        &mut self,
        program: &Path,
        argv: &[String],
        shm: Option<&SharedSegment>,
    ) -> Result<Launched, HostError> {
        let entry = self
            .entries
            .get(program)
            .cloned()
            .ok_or_else(|| HostError::ProgramNotFound(program.to_path_buf()))?;
        let size = if self.buffer_size == 0 {
            pixwire_wire::DEFAULT_SHARED_BUFFER_SIZE
        } else {
            self.buffer_size
        };
        let (host_end, plugin_end) = SharedWireBuffer::pair(size);
        let argv = argv.to_vec();
        let segment = shm.cloned();
        let shm_attached = segment.is_some();
        let name = program.display().to_string();
        let handle = thread::Builder::new()
            .name(format!("plug-in {name}"))
            .spawn(move || entry(argv, plugin_end, segment))
            .map_err(|source| HostError::Spawn {
                program: program.to_path_buf(),
                source,
            })?;
        tracing::debug!(program = %name, "plug-in thread started");
        Ok(Launched {
            transport: Box::new(host_end),
            child: Box::new(ThreadChild {
                handle: Some(handle),
            }),
            shm_attached,
        })
    }
}

/// The host's view of one launched plug-in.
pub struct PluginProcess {
    id: PluginId,
    program: PathBuf,
    argv: Vec<String>,
    state: PluginState,
    pub(crate) flags: PluginFlags,
    transport: Option<Box<dyn Transport>>,
    child: Option<Box<dyn PluginChild>>,
    shm_attached: bool,
    healthy: bool,
    pub(crate) temp_procs: Vec<String>,
    pub(crate) installs: Vec<ProcInstall>,
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("temp_procs", &self.temp_procs)
            .finish_non_exhaustive()
    }
}

impl PluginProcess {
    pub(crate) fn new(id: PluginId, program: PathBuf, argv: Vec<String>, mode: OpenMode) -> Self {
        Self {
            id,
            program,
            argv,
            state: PluginState::Created,
            flags: PluginFlags {
                query_mode: mode == OpenMode::Query,
                ..PluginFlags::default()
            },
            transport: None,
            child: None,
            shm_attached: false,
            healthy: false,
            temp_procs: Vec::new(),
            installs: Vec::new(),
        }
    }

    /// Starts the program through `launcher`.
    pub(crate) fn open(
        &mut self,
        launcher: &mut dyn Launcher,
        shm: Option<&SharedSegment>,
    ) -> Result<(), HostError> {
        self.state = PluginState::Opening;
        match launcher.launch(&self.program, &self.argv, shm) {
            Ok(launched) => {
                self.transport = Some(launched.transport);
                self.child = Some(launched.child);
                self.shm_attached = launched.shm_attached;
                self.healthy = true;
                self.flags.open = true;
                self.state = PluginState::Open;
                Ok(())
            }
            Err(err) => {
                self.state = PluginState::Closed;
                Err(err)
            }
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn flags(&self) -> PluginFlags {
        self.flags
    }

    pub fn is_busy(&self) -> bool {
        self.flags.busy
    }

    pub fn shm_attached(&self) -> bool {
        self.shm_attached
    }

    pub fn temp_procs(&self) -> &[String] {
        &self.temp_procs
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.flags.busy = busy;
        if self.flags.open {
            self.state = if busy {
                PluginState::Busy
            } else {
                PluginState::Open
            };
        }
    }

    pub(crate) fn channel(&mut self) -> Result<&mut dyn Transport, WireError> {
        match self.transport.as_mut() {
            Some(transport) if self.healthy => Ok(transport.as_mut()),
            _ => Err(TransportError::Closed.into()),
        }
    }

    /// Writes and flushes one message. A failure marks the channel unhealthy.
    pub(crate) fn send(&mut self, message: MessageRef<'_>) -> Result<(), WireError> {
        let result = send_message(self.channel()?, message);
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    pub(crate) fn read(&mut self) -> Result<Message, WireError> {
        let result = read_message(self.channel()?);
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    /// Shuts the plug-in down: optional `Quit`, close the channel, give the
    /// child `grace` to exit, then kill it and reap it.
    pub(crate) fn close(&mut self, send_quit: bool, grace: Duration) {
        self.state = PluginState::Closing;
        if send_quit && self.healthy {
            if let Err(err) = self.send(MessageRef::Quit) {
                tracing::debug!(plugin = %self.id, error = %err, "quit not delivered");
            }
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.healthy = false;

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + grace;
            let exited = loop {
                match child.try_wait() {
                    Ok(true) => break true,
                    Ok(false) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(false) => break false,
                    Err(err) => {
                        tracing::warn!(plugin = %self.id, error = %err, "cannot poll plug-in");
                        break false;
                    }
                }
            };
            if !exited {
                tracing::debug!(plugin = %self.id, "plug-in did not exit in time, killing");
                if let Err(err) = child.kill() {
                    tracing::warn!(plugin = %self.id, error = %err, "failed to kill plug-in");
                }
            }
            if let Err(err) = child.wait() {
                tracing::warn!(plugin = %self.id, error = %err, "failed to reap plug-in");
            }
        }
        self.flags.open = false;
        self.flags.busy = false;
        self.state = PluginState::Closed;
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        if self.state != PluginState::Closed && self.state != PluginState::Created {
            self.close(false, Duration::ZERO);
        }
    }
}
