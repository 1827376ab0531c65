//! Plug-in main loop and the API a plug-in uses to talk to the host.

use crate::error::PluginError;
use crate::tile_cache::{DrawableInfo, TileCache, TileKey, TileSpec, TileWire};
use pixwire_wire::{
    read_message, send_message, Config, Message, MessageRef, Param, ParamList,
    ParamType, PdbStatus, PipeTransport, ProcCall, ProcCallRef, ProcInstall, ProcKind,
    ProtocolError, SharedSegment, TileData, TileHeader, TileReq, Transport, WireError,
    PROTOCOL_VERSION,
};
use std::collections::{HashMap, HashSet};

/// Tile cache budget until the plug-in picks its own.
pub const DEFAULT_TILE_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Handler for a temporary procedure, run when the host sends `TempProcRun`.
pub type TempHandler = Box<dyn FnMut(&mut PluginContext, &[Param]) -> Vec<Param> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginMode {
    /// Install procedures and quit.
    Query,
    Run { tile_width: u32, tile_height: u32 },
}

/// Command line the host passes to a plug-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArgs {
    pub program: String,
    pub mode: PluginMode,
}

impl PluginArgs {
    pub fn parse<I>(args: I) -> Result<Self, PluginError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let program = args.first().cloned().unwrap_or_else(|| "plug-in".to_string());
        if args.len() < 4 || args[1] != "-gimp" {
            return Err(PluginError::Usage { program });
        }
        if args[2] != "0" || args[3] != "1" {
            return Err(PluginError::UnsupportedDescriptors {
                read: args[2].clone(),
                write: args[3].clone(),
            });
        }

        let mode = match args.get(4).map(String::as_str) {
            Some("-query") => PluginMode::Query,
            Some(width) => {
                let height = args.get(5).ok_or_else(|| PluginError::Usage {
                    program: program.clone(),
                })?;
                match (width.parse(), height.parse()) {
                    (Ok(tile_width), Ok(tile_height)) => PluginMode::Run {
                        tile_width,
                        tile_height,
                    },
                    _ => return Err(PluginError::Usage { program }),
                }
            }
            None => PluginMode::Run {
                tile_width: 64,
                tile_height: 64,
            },
        };
        Ok(Self { program, mode })
    }
}

/// A plug-in program.
pub trait Plugin {
    /// Procedures this plug-in provides. Installed during the query pass and
    /// used to recognize incoming calls.
    fn procedures(&self) -> Vec<ProcInstall>;

    /// Runs one of the declared procedures. The first return value should be
    /// a status; `Success` is prepended when it is missing.
    fn run(&mut self, ctx: &mut PluginContext, name: &str, params: &[Param]) -> Vec<Param>;

    /// Called when the host asks the plug-in to quit.
    fn quit(&mut self) {}
}

/// Tile transfer over the plug-in's channel.
pub struct WireTiles<'a> {
    transport: &'a mut dyn Transport,
    shm: Option<&'a SharedSegment>,
}

impl<'a> WireTiles<'a> {
    pub fn new(transport: &'a mut dyn Transport, shm: Option<&'a SharedSegment>) -> Self {
        Self { transport, shm }
    }

    fn expect_tile_data(&mut self) -> Result<TileData, WireError> {
        match read_message(&mut *self.transport)? {
            Message::TileData(tile) => Ok(tile),
            other => Err(unexpected("GP_TILE_DATA", &other)),
        }
    }

    fn expect_tile_ack(&mut self) -> Result<(), WireError> {
        match read_message(&mut *self.transport)? {
            Message::TileAck => Ok(()),
            other => Err(unexpected("GP_TILE_ACK", &other)),
        }
    }
}

fn unexpected(expected: &'static str, received: &Message) -> WireError {
    ProtocolError::UnexpectedMessage {
        expected,
        received: received.message_type(),
    }
    .into()
}

fn check_field(field: &'static str, expected: i64, actual: i64) -> Result<(), ProtocolError> {
    if expected != actual {
        return Err(ProtocolError::TileMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_header(header: &TileHeader, spec: &TileSpec) -> Result<(), ProtocolError> {
    check_field("drawable_id", spec.key.drawable_id.into(), header.drawable_id.into())?;
    check_field("tile_num", spec.key.tile_num.into(), header.tile_num.into())?;
    check_field("shadow", spec.key.shadow.into(), header.shadow.into())?;
    check_field("width", spec.width.into(), header.width.into())?;
    check_field("height", spec.height.into(), header.height.into())?;
    check_field("bpp", spec.bpp.into(), header.bpp.into())
}

impl TileWire for WireTiles<'_> {
    fn fetch(&mut self, spec: &TileSpec) -> Result<Vec<u8>, WireError> {
        let request = TileReq {
            drawable_id: spec.key.drawable_id,
            tile_num: spec.key.tile_num,
            shadow: spec.key.shadow,
        };
        send_message(&mut *self.transport, MessageRef::TileReq(request))?;

        let tile = self.expect_tile_data()?;
        check_header(&tile.header, spec)?;
        let data = if tile.header.use_shm {
            let segment = self.shm.ok_or(ProtocolError::ShmUnavailable(-1))?;
            let mut data = vec![0u8; spec.size()];
            segment.load(&mut data)?;
            data
        } else {
            tile.data
        };

        send_message(&mut *self.transport, MessageRef::TileAck)?;
        Ok(data)
    }

    fn store(&mut self, spec: &TileSpec, data: &[u8]) -> Result<(), WireError> {
        send_message(&mut *self.transport, MessageRef::TileReq(TileReq::put()))?;
        let reply = self.expect_tile_data()?;

        let segment = self.shm.filter(|_| reply.header.use_shm);
        let header = TileHeader {
            drawable_id: spec.key.drawable_id,
            tile_num: spec.key.tile_num,
            shadow: spec.key.shadow,
            bpp: spec.bpp,
            width: spec.width,
            height: spec.height,
            use_shm: segment.is_some(),
        };
        let inline = match segment {
            Some(segment) => {
                segment.store(data)?;
                &[][..]
            }
            None => data,
        };
        send_message(
            &mut *self.transport,
            MessageRef::TileData {
                header,
                data: inline,
            },
        )?;
        self.expect_tile_ack()
    }
}

/// Everything a running plug-in can reach: its channel to the host, the
/// negotiated configuration and its tile cache.
pub struct PluginContext {
    transport: Box<dyn Transport>,
    offered_shm: Option<SharedSegment>,
    shm: Option<SharedSegment>,
    config: Config,
    cache: TileCache,
    temp_procs: HashMap<String, TempHandler>,
    retired: HashSet<String>,
    extension_acked: bool,
}

impl PluginContext {
    pub fn new(transport: Box<dyn Transport>, tile_width: u32, tile_height: u32) -> Self {
        Self {
            transport,
            offered_shm: None,
            shm: None,
            config: Config::new(tile_width, tile_height),
            cache: TileCache::new(DEFAULT_TILE_CACHE_BYTES),
            temp_procs: HashMap::new(),
            retired: HashSet::new(),
            extension_acked: false,
        }
    }

    /// Segment the plug-in may attach to if the host names it in `Config`.
    pub fn offer_shm(&mut self, segment: Option<SharedSegment>) {
        self.offered_shm = segment;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tile_width(&self) -> u32 {
        self.config.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.config.tile_height
    }

    pub fn gamma(&self) -> f64 {
        self.config.gamma
    }

    pub fn uses_shm(&self) -> bool {
        self.shm.is_some()
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn extension_acked(&self) -> bool {
        self.extension_acked
    }

    fn apply_config(&mut self, config: Config) -> Result<(), PluginError> {
        if config.version < PROTOCOL_VERSION {
            return Err(PluginError::HostTooOld {
                host: config.version,
                plugin: PROTOCOL_VERSION,
            });
        }
        if config.version > PROTOCOL_VERSION {
            return Err(PluginError::PluginTooOld {
                host: config.version,
                plugin: PROTOCOL_VERSION,
            });
        }
        self.shm = if config.shm_id == -1 {
            None
        } else {
            let segment = self
                .offered_shm
                .clone()
                .filter(|segment| segment.id() == config.shm_id)
                .ok_or(ProtocolError::ShmUnavailable(config.shm_id))
                .map_err(WireError::from)?;
            Some(segment)
        };
        tracing::debug!(
            tile_width = config.tile_width,
            tile_height = config.tile_height,
            shm = config.shm_id,
            "configuration received"
        );
        self.config = config;
        Ok(())
    }

    fn send(&mut self, message: MessageRef<'_>) -> Result<(), PluginError> {
        send_message(&mut *self.transport, message)?;
        Ok(())
    }

    /// Calls a procedure in the host's database and waits for its results.
    pub fn run_procedure(
        &mut self,
        name: &str,
        params: &[Param],
    ) -> Result<Vec<Param>, PluginError> {
        self.send(MessageRef::ProcRun(ProcCallRef {
            name,
            params: ParamList::Owned(params),
        }))?;
        match read_message(&mut *self.transport)? {
            Message::ProcReturn(call) => Ok(call.params),
            other => Err(unexpected("GP_PROC_RETURN", &other).into()),
        }
    }

    pub fn install_procedure(&mut self, install: &ProcInstall) -> Result<(), PluginError> {
        tracing::debug!(procedure = %install.name, "installing procedure");
        self.send(MessageRef::ProcInstall(install))
    }

    /// Installs a temporary procedure served by `handler` while the plug-in
    /// stays running.
    pub fn install_temp_procedure(
        &mut self,
        mut install: ProcInstall,
        handler: TempHandler,
    ) -> Result<(), PluginError> {
        install.kind = ProcKind::Temporary;
        self.send(MessageRef::ProcInstall(&install))?;
        self.retired.remove(&install.name);
        self.temp_procs.insert(install.name, handler);
        Ok(())
    }

    pub fn uninstall_temp_procedure(&mut self, name: &str) -> Result<(), PluginError> {
        if self.temp_procs.remove(name).is_none() {
            self.retired.insert(name.to_string());
        }
        self.send(MessageRef::ProcUninstall(name))
    }

    /// Tells the host an extension finished starting up. The plug-in keeps
    /// serving temporary procedures and sends no `ProcReturn` for the call
    /// that started it.
    pub fn extension_ack(&mut self) -> Result<(), PluginError> {
        self.extension_acked = true;
        self.send(MessageRef::ExtensionAck)
    }

    pub fn progress_init(&mut self, message: &str) -> Result<(), PluginError> {
        self.run_procedure(
            "gimp_progress_init",
            &[Param::string(message), Param::Int32(-1)],
        )
        .map(drop)
    }

    pub fn progress_update(&mut self, percentage: f64) -> Result<(), PluginError> {
        self.run_procedure("gimp_progress_update", &[Param::Float(percentage)])
            .map(drop)
    }

    pub fn message(&mut self, message: &str) -> Result<(), PluginError> {
        self.run_procedure("gimp_message", &[Param::string(message)])
            .map(drop)
    }

    /// Asks the host for a drawable's size and depth.
    pub fn drawable_info(&mut self, drawable_id: i32) -> Result<DrawableInfo, PluginError> {
        let values = self.run_procedure("gimp_drawable_info", &[Param::Drawable(drawable_id)])?;
        drawable_info_from(drawable_id, &values)
    }

    fn tile_spec(
        &self,
        drawable: &DrawableInfo,
        tile_num: u32,
        shadow: bool,
    ) -> Result<TileSpec, PluginError> {
        drawable
            .tile_spec(tile_num, shadow, self.tile_width(), self.tile_height())
            .ok_or(PluginError::NoSuchTile {
                drawable_id: drawable.id,
                tile_num,
            })
    }

    fn split(&mut self) -> (&mut TileCache, WireTiles<'_>) {
        (
            &mut self.cache,
            WireTiles::new(&mut *self.transport, self.shm.as_ref()),
        )
    }

    pub fn ref_tile(
        &mut self,
        drawable: &DrawableInfo,
        tile_num: u32,
        shadow: bool,
    ) -> Result<TileKey, PluginError> {
        let spec = self.tile_spec(drawable, tile_num, shadow)?;
        let (cache, mut wire) = self.split();
        cache.ref_tile(spec, &mut wire)
    }

    pub fn ref_tile_zero(
        &mut self,
        drawable: &DrawableInfo,
        tile_num: u32,
        shadow: bool,
    ) -> Result<TileKey, PluginError> {
        let spec = self.tile_spec(drawable, tile_num, shadow)?;
        let (cache, mut wire) = self.split();
        cache.ref_zero(spec, &mut wire)
    }

    pub fn tile_data(&mut self, key: TileKey) -> Result<&[u8], PluginError> {
        let (cache, mut wire) = self.split();
        let data = cache.data(key, &mut wire)?;
        Ok(data)
    }

    pub fn tile_data_mut(&mut self, key: TileKey) -> Result<&mut [u8], PluginError> {
        let (cache, mut wire) = self.split();
        let data = cache.data_mut(key, &mut wire)?;
        Ok(data)
    }

    pub fn unref_tile(&mut self, key: TileKey, dirty: bool) -> Result<(), PluginError> {
        let (cache, mut wire) = self.split();
        cache.unref(key, dirty, &mut wire)
    }

    pub fn flush_tile(&mut self, key: TileKey) -> Result<(), PluginError> {
        let (cache, mut wire) = self.split();
        cache.flush(key, &mut wire)
    }

    pub fn purge_drawable(&mut self, drawable_id: i32) -> Result<(), PluginError> {
        let (cache, mut wire) = self.split();
        cache.purge(drawable_id, &mut wire)
    }

    pub fn set_tile_cache_size(&mut self, kilobytes: usize) -> Result<(), PluginError> {
        let (cache, mut wire) = self.split();
        cache.set_max_bytes(kilobytes * 1024, &mut wire)
    }

    pub fn set_tile_cache_ntiles(&mut self, ntiles: usize) -> Result<(), PluginError> {
        let bytes = TileCache::bytes_for_tiles(ntiles, self.tile_width(), self.tile_height());
        let (cache, mut wire) = self.split();
        cache.set_max_bytes(bytes, &mut wire)
    }

    fn close(&mut self) {
        self.transport.close();
    }
}

/// Reads `gimp_drawable_info` return values.
fn drawable_info_from(drawable_id: i32, values: &[Param]) -> Result<DrawableInfo, PluginError> {
    let [status, Param::Int32(width), Param::Int32(height), Param::Int32(bpp), ..] = values else {
        return Err(PluginError::UnknownDrawable(drawable_id));
    };
    if status.as_status() != Some(PdbStatus::Success) {
        return Err(PluginError::UnknownDrawable(drawable_id));
    }
    let invalid = || PluginError::InvalidGeometry {
        drawable_id,
        width: *width,
        height: *height,
        bpp: *bpp,
    };
    let width = u32::try_from(*width).map_err(|_| invalid())?;
    let height = u32::try_from(*height).map_err(|_| invalid())?;
    let bpp = u32::try_from(*bpp).map_err(|_| invalid())?;
    Ok(DrawableInfo::new(drawable_id, width, height, bpp))
}

/// Puts the status first, adding `Success` when the handler left it out.
fn with_status(mut values: Vec<Param>) -> Vec<Param> {
    if values.first().map(Param::kind) != Some(ParamType::Status) {
        values.insert(0, Param::status(PdbStatus::Success));
    }
    values
}

fn calling_error() -> Vec<Param> {
    vec![Param::status(PdbStatus::CallingError)]
}

/// Drives one plug-in over its channel until the host lets it go.
pub struct PluginRuntime<P: Plugin> {
    plugin: P,
    ctx: PluginContext,
    mode: PluginMode,
    declared: HashSet<String>,
}

impl<P: Plugin> PluginRuntime<P> {
    pub fn new(plugin: P, transport: Box<dyn Transport>, args: &PluginArgs) -> Self {
        let (tile_width, tile_height) = match args.mode {
            PluginMode::Run {
                tile_width,
                tile_height,
            } => (tile_width, tile_height),
            PluginMode::Query => (64, 64),
        };
        let declared = plugin
            .procedures()
            .into_iter()
            .map(|install| install.name)
            .collect();
        Self {
            plugin,
            ctx: PluginContext::new(transport, tile_width, tile_height),
            mode: args.mode,
            declared,
        }
    }

    /// Offers a shared memory segment for tile transfer.
    pub fn with_shm(mut self, segment: Option<SharedSegment>) -> Self {
        self.ctx.offer_shm(segment);
        self
    }

    pub fn run(mut self) -> Result<(), PluginError> {
        let result = match self.mode {
            PluginMode::Query => self.query(),
            PluginMode::Run { .. } => self.serve(),
        };
        self.ctx.close();
        result
    }

    fn query(&mut self) -> Result<(), PluginError> {
        for install in self.plugin.procedures() {
            self.ctx.install_procedure(&install)?;
        }
        self.ctx.send(MessageRef::Quit)
    }

    fn serve(&mut self) -> Result<(), PluginError> {
        loop {
            let message = match read_message(&mut *self.ctx.transport) {
                Ok(message) => message,
                Err(err) if err.is_eof() => {
                    tracing::debug!("host closed the channel");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            match message {
                Message::Quit => {
                    self.plugin.quit();
                    return Ok(());
                }
                Message::Config(config) => self.ctx.apply_config(config)?,
                Message::ProcRun(call) => self.run_declared(call)?,
                Message::TempProcRun(call) => self.run_temporary(call)?,
                other => {
                    tracing::warn!(message = %other.message_type(), "unexpected message from host");
                }
            }
        }
    }

    fn run_declared(&mut self, call: ProcCall) -> Result<(), PluginError> {
        let values = if self.declared.contains(&call.name) {
            with_status(self.plugin.run(&mut self.ctx, &call.name, &call.params))
        } else {
            tracing::warn!(
                procedure = %call.name,
                "call for procedure this plug-in does not provide"
            );
            calling_error()
        };
        if self.ctx.extension_acked {
            return Ok(());
        }
        self.ctx.send(MessageRef::ProcReturn(ProcCallRef {
            name: &call.name,
            params: ParamList::Owned(&values),
        }))
    }

    fn run_temporary(&mut self, call: ProcCall) -> Result<(), PluginError> {
        let values = match self.ctx.temp_procs.remove(&call.name) {
            Some(mut handler) => {
                let values = with_status(handler(&mut self.ctx, &call.params));
                // The handler may have uninstalled or replaced itself.
                if !self.ctx.retired.remove(&call.name) {
                    self.ctx.temp_procs.entry(call.name.clone()).or_insert(handler);
                }
                values
            }
            None => {
                tracing::warn!(procedure = %call.name, "call for unknown temporary procedure");
                calling_error()
            }
        };
        self.ctx.send(MessageRef::TempProcReturn(ProcCallRef {
            name: &call.name,
            params: ParamList::Owned(&values),
        }))
    }
}

/// Entry point for a plug-in executable: parses the command line and serves
/// the host over stdin and stdout.
pub fn plugin_main<P: Plugin>(plugin: P) -> Result<(), PluginError> {
    let args = PluginArgs::parse(std::env::args())?;
    let transport = PipeTransport::new(std::io::stdin(), std::io::stdout());
    PluginRuntime::new(plugin, Box::new(transport), &args).run()
}
