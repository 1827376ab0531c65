//! Host sessions driving real plug-in runtimes on threads.

use pixwire_core::HostSettings;
use pixwire_host::{
    ActiveImage, Argument, Dispatch, DrawableStore, HostError, HostSession, MemoryDrawables,
    OpenMode, PluginId, PluginState, ProcedureRecord, ProgressSink, ReturnValues, ThreadEntry,
    ThreadLauncher,
};
use pixwire_plugin::{Plugin, PluginArgs, PluginContext, PluginError, PluginRuntime};
use pixwire_wire::{
    encode_message, MessageRef, Param, ParamDef, ParamType, PdbStatus, ProcInstall, ProcKind,
    TileRect, Transport, TransportError, WireError,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn runtime_entry<P: Plugin + 'static>(make: fn() -> P) -> ThreadEntry {
    Arc::new(move |argv, transport, shm| {
        let args = match PluginArgs::parse(argv) {
            Ok(args) => args,
            Err(err) => panic!("bad plug-in command line: {err}"),
        };
        if let Err(err) = PluginRuntime::new(make(), Box::new(transport), &args)
            .with_shm(shm)
            .run()
        {
            eprintln!("plug-in stopped: {err}");
        }
    })
}

fn def(kind: ParamType, name: &str) -> ParamDef {
    ParamDef::new(kind, name, "")
}

fn image_args() -> Vec<ParamDef> {
    vec![
        def(ParamType::Int32, "run_mode"),
        def(ParamType::Image, "image"),
        def(ParamType::Drawable, "drawable"),
    ]
}

fn status_code(values: &[Param]) -> i32 {
    values
        .first()
        .and_then(Param::as_status)
        .unwrap_or(PdbStatus::ExecutionError)
        .as_i32()
}

/// Filters that exercise tiles, nested calls and refused calls.
struct Filters;

impl Plugin for Filters {
    fn procedures(&self) -> Vec<ProcInstall> {
        let mut invert = ProcInstall::new("invert_tile", ProcKind::Plugin);
        invert.menu_path = Some("<Image>/Filters/Colors/Invert".into());
        invert.image_types = Some("RGB*".into());
        invert.params = image_args();
        invert.returns = vec![def(ParamType::Int32, "bpp"), def(ParamType::Int32, "run_mode")];

        let mut sum = ProcInstall::new("sum_args", ProcKind::Plugin);
        sum.params = vec![def(ParamType::Int32, "a"), def(ParamType::Int32, "b")];
        sum.returns = vec![def(ParamType::Int32, "sum")];

        let mut nested = ProcInstall::new("call_nested", ProcKind::Plugin);
        nested.params = vec![def(ParamType::Int32, "value")];
        nested.returns = vec![def(ParamType::Int32, "doubled")];

        let mut missing = ProcInstall::new("call_missing", ProcKind::Plugin);
        missing.returns = vec![def(ParamType::Int32, "status")];

        let steal = ProcInstall::new("steal_uninstall", ProcKind::Plugin);

        let mut sloppy = ProcInstall::new("call_sloppy", ProcKind::Plugin);
        sloppy.params = vec![def(ParamType::String, "callee")];
        sloppy.returns = vec![
            def(ParamType::Int32, "status"),
            def(ParamType::Int32, "count"),
            def(ParamType::Int32, "marker"),
        ];

        let mut bad = ProcInstall::new("bad_image", ProcKind::Plugin);
        bad.menu_path = Some("<Image>/Filters/Broken".into());
        bad.params = vec![def(ParamType::Int32, "run_mode"), def(ParamType::Image, "image")];

        vec![invert, sum, nested, missing, steal, sloppy, bad]
    }

    fn run(&mut self, ctx: &mut PluginContext, name: &str, params: &[Param]) -> Vec<Param> {
        match name {
            "invert_tile" => {
                let run_mode = params.first().and_then(Param::as_int32).unwrap_or(-1);
                let drawable_id = params.get(2).and_then(Param::as_id).unwrap_or(-1);
                let result = (|| -> Result<u32, PluginError> {
                    ctx.progress_init("Inverting")?;
                    let drawable = ctx.drawable_info(drawable_id)?;
                    let key = ctx.ref_tile(&drawable, 0, false)?;
                    for byte in ctx.tile_data_mut(key)? {
                        *byte = 255 - *byte;
                    }
                    ctx.unref_tile(key, true)?;
                    ctx.progress_update(1.0)?;
                    Ok(drawable.bpp)
                })();
                match result {
                    Ok(bpp) => vec![
                        Param::status(PdbStatus::Success),
                        Param::Int32(bpp as i32),
                        Param::Int32(run_mode),
                    ],
                    Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
                }
            }
            "sum_args" => {
                let a = params.first().and_then(Param::as_int32).unwrap_or_default();
                let b = params.get(1).and_then(Param::as_int32).unwrap_or_default();
                vec![Param::Int32(a + b)]
            }
            "call_nested" => {
                let value = params.first().and_then(Param::as_int32).unwrap_or_default();
                match ctx.run_procedure("double_it", &[Param::Int32(value)]) {
                    Ok(values) if status_code(&values) == PdbStatus::Success.as_i32() => {
                        vec![values.get(1).cloned().unwrap_or(Param::Int32(-1))]
                    }
                    _ => vec![Param::status(PdbStatus::ExecutionError)],
                }
            }
            "call_missing" => match ctx.run_procedure("no_such_proc", &[]) {
                Ok(values) => vec![Param::Int32(status_code(&values))],
                Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
            },
            "call_sloppy" => {
                let callee = params.first().and_then(Param::as_str).unwrap_or_default();
                match ctx.run_procedure(callee, &[]) {
                    Ok(values) => vec![
                        Param::Int32(status_code(&values)),
                        Param::Int32(values.len() as i32),
                        Param::Int32(7),
                    ],
                    Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
                }
            }
            "steal_uninstall" => match ctx.uninstall_temp_procedure("ext_counter") {
                Ok(()) => Vec::new(),
                Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
            },
            _ => vec![Param::status(PdbStatus::CallingError)],
        }
    }
}

/// Serves `double_it`, checking in with the host on the way.
struct Helper;

impl Plugin for Helper {
    fn procedures(&self) -> Vec<ProcInstall> {
        let mut double = ProcInstall::new("double_it", ProcKind::Plugin);
        double.params = vec![def(ParamType::Int32, "value")];
        double.returns = vec![def(ParamType::Int32, "doubled")];
        vec![double]
    }

    fn run(&mut self, ctx: &mut PluginContext, _name: &str, params: &[Param]) -> Vec<Param> {
        let value = params.first().and_then(Param::as_int32).unwrap_or_default();
        if ctx.run_procedure("check_depth", &[]).is_err() {
            return vec![Param::status(PdbStatus::ExecutionError)];
        }
        vec![Param::Int32(value * 2)]
    }
}

/// Returns values that do not match what it declares.
struct Sloppy;

impl Plugin for Sloppy {
    fn procedures(&self) -> Vec<ProcInstall> {
        let mut short = ProcInstall::new("short_list", ProcKind::Plugin);
        short.returns = vec![def(ParamType::Int32, "count"), def(ParamType::Int8Array, "data")];

        let mut wrong = ProcInstall::new("wrong_kind", ProcKind::Plugin);
        wrong.returns = vec![def(ParamType::Int32, "width")];
        vec![short, wrong]
    }

    fn run(&mut self, _ctx: &mut PluginContext, name: &str, _params: &[Param]) -> Vec<Param> {
        match name {
            // Promises two bytes and sends none.
            "short_list" => vec![Param::Int32(2)],
            _ => vec![Param::string("garbage")],
        }
    }
}

/// An extension that stays resident serving temporary procedures.
struct Resident;

impl Plugin for Resident {
    fn procedures(&self) -> Vec<ProcInstall> {
        vec![ProcInstall::new("ext_start", ProcKind::Extension)]
    }

    fn run(&mut self, ctx: &mut PluginContext, _name: &str, _params: &[Param]) -> Vec<Param> {
        let mut counter = ProcInstall::new("ext_counter", ProcKind::Temporary);
        counter.returns = vec![def(ParamType::Int32, "count")];
        let mut calls = 0;
        let mut reenter = ProcInstall::new("ext_reenter", ProcKind::Temporary);
        reenter.returns = vec![def(ParamType::Int32, "status")];

        let started = ctx
            .install_temp_procedure(
                counter,
                Box::new(move |_ctx, _params| {
                    calls += 1;
                    vec![Param::Int32(calls)]
                }),
            )
            .and_then(|()| {
                ctx.install_temp_procedure(
                    reenter,
                    Box::new(|ctx, _params| match ctx.run_procedure("ext_counter", &[]) {
                        Ok(values) => vec![Param::Int32(status_code(&values))],
                        Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
                    }),
                )
            })
            .and_then(|()| ctx.extension_ack());
        match started {
            Ok(()) => Vec::new(),
            Err(_) => vec![Param::status(PdbStatus::ExecutionError)],
        }
    }
}

fn launcher() -> ThreadLauncher {
    ThreadLauncher::from_settings(&HostSettings::default())
        .with("filters", runtime_entry(|| Filters))
        .with("sloppy", runtime_entry(|| Sloppy))
        .with("helper", runtime_entry(|| Helper))
        .with("resident", runtime_entry(|| Resident))
}

fn settings(use_shm: bool) -> HostSettings {
    HostSettings {
        use_shm,
        ..HostSettings::default()
    }
}

fn session(use_shm: bool) -> HostSession {
    HostSession::new(settings(use_shm), launcher())
}

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl ProgressSink for Events {
    fn init(&mut self, _plugin: Option<PluginId>, message: &str, _display: i32) {
        self.0.lock().unwrap().push(format!("init {message}"));
    }

    fn update(&mut self, _plugin: Option<PluginId>, fraction: f64) {
        self.0.lock().unwrap().push(format!("update {fraction}"));
    }

    fn message(&mut self, _plugin: Option<PluginId>, text: &str) {
        self.0.lock().unwrap().push(format!("message {text}"));
    }
}

fn names(values: &ReturnValues) -> Vec<i32> {
    values.values().iter().filter_map(Argument::as_int32).collect()
}

#[test]
fn query_registers_valid_installs_only() {
    let mut session = session(false);
    let def = session.query(Path::new("filters")).unwrap();

    let installed: Vec<&str> = def.procedures.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        installed,
        vec![
            "invert_tile",
            "sum_args",
            "call_nested",
            "call_missing",
            "steal_uninstall",
            "call_sloppy"
        ]
    );
    // `<Image>` procedures need run mode, image and drawable.
    assert!(!session.pdb().contains("bad_image"));
    assert!(matches!(
        session.pdb().get("invert_tile").map(|r| &r.dispatch),
        Some(Dispatch::Program(path)) if path == Path::new("filters")
    ));
    assert_eq!(session.plugin_defs(), &[def]);
    assert_eq!(session.open_plugins().count(), 0);
    assert!(session.stack().is_empty());
}

#[test]
fn plugin_procedures_run_to_completion() {
    let mut session = session(false);
    session.query(Path::new("filters")).unwrap();

    let values = session
        .run_procedure("sum_args", &[Argument::int32(2), Argument::int32(40)])
        .unwrap();
    assert!(values.is_success());
    assert_eq!(names(&values), vec![42]);
    assert_eq!(session.open_plugins().count(), 0);
    assert_eq!(session.pending_waits(), 0);

    let err = session.run_procedure("sum_args", &[Argument::int32(2)]).unwrap_err();
    assert!(matches!(err, HostError::Procedure(_)));
}

#[test]
fn unknown_procedure_from_a_plugin_gets_calling_error() {
    let mut session = session(false);
    session.query(Path::new("filters")).unwrap();

    let values = session.run_procedure("call_missing", &[]).unwrap();
    // The plug-in kept its channel and finished normally.
    assert!(values.is_success());
    assert_eq!(names(&values), vec![PdbStatus::CallingError.as_i32()]);
}

#[test]
fn malformed_returns_become_execution_errors() {
    let mut session = session(false);
    session.query(Path::new("sloppy")).unwrap();

    let values = session.run_procedure("short_list", &[]).unwrap();
    assert_eq!(values.status(), PdbStatus::ExecutionError);
    assert_eq!(values.len(), 3);
    assert_eq!(values.values()[0].as_int32(), Some(0));

    let values = session.run_procedure("wrong_kind", &[]).unwrap();
    assert_eq!(values.status(), PdbStatus::ExecutionError);
    assert_eq!(values.values()[0].as_int32(), Some(0));
}

#[test]
fn malformed_nested_returns_leave_the_caller_running() {
    let mut session = session(false);
    session.query(Path::new("filters")).unwrap();
    session.query(Path::new("sloppy")).unwrap();

    // The caller reports the nested status and length, then its own marker.
    let values = session
        .run_procedure("call_sloppy", &[Argument::string("short_list")])
        .unwrap();
    assert!(values.is_success(), "{values:?}");
    assert_eq!(names(&values), vec![PdbStatus::ExecutionError.as_i32(), 3, 7]);

    let values = session
        .run_procedure("call_sloppy", &[Argument::string("wrong_kind")])
        .unwrap();
    assert!(values.is_success(), "{values:?}");
    assert_eq!(names(&values), vec![PdbStatus::ExecutionError.as_i32(), 2, 7]);

    assert!(session.stack().is_empty());
    assert_eq!(session.pending_waits(), 0);
    assert_eq!(session.open_plugins().count(), 0);
}

fn tile_round_trip(use_shm: bool) {
    let mut drawables = MemoryDrawables::new();
    let drawable = drawables.insert(64, 64, 3, vec![10; 64 * 64 * 3]).unwrap();
    let events = Events::default();
    let mut session = session(use_shm)
        .with_drawables(drawables)
        .with_progress(events.clone());
    session.query(Path::new("filters")).unwrap();

    let values = session
        .run_with_defaults("invert_tile", &ActiveImage::new(1, drawable))
        .unwrap();
    assert!(values.is_success(), "{values:?}");
    assert_eq!(names(&values), vec![3, 0]);

    let whole = TileRect {
        x: 0,
        y: 0,
        width: 64,
        height: 64,
    };
    let pixels = session.drawables().read_rect(drawable, false, whole).unwrap();
    assert!(pixels.iter().all(|byte| *byte == 245));
    assert_eq!(events.take(), vec!["init Inverting", "update 1"]);
}

#[test]
fn tiles_move_inline() {
    tile_round_trip(false);
}

#[test]
fn tiles_move_through_shared_memory() {
    tile_round_trip(true);
}

#[test]
fn repeat_last_reruns_with_last_values() {
    let mut drawables = MemoryDrawables::new();
    let drawable = drawables.insert(64, 64, 3, vec![10; 64 * 64 * 3]).unwrap();
    let mut session = session(false).with_drawables(drawables);
    let active = ActiveImage::new(1, drawable);
    assert!(session.repeat_last(&active).unwrap().is_none());

    session.query(Path::new("filters")).unwrap();
    session.run_with_defaults("invert_tile", &active).unwrap();
    assert_eq!(session.last_run(), Some("invert_tile"));

    let again = session.repeat_last(&active).unwrap().unwrap();
    assert_eq!(names(&again), vec![3, 2]);
    let whole = TileRect {
        x: 0,
        y: 0,
        width: 64,
        height: 64,
    };
    let pixels = session.drawables().read_rect(drawable, false, whole).unwrap();
    assert!(pixels.iter().all(|byte| *byte == 10));
}

#[test]
fn nested_calls_keep_stack_discipline() {
    let mut session = session(false);
    session.query(Path::new("filters")).unwrap();
    session.query(Path::new("helper")).unwrap();

    let depth = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&depth);
    session.pdb_mut().register(ProcedureRecord::internal(
        "check_depth",
        Vec::new(),
        Vec::new(),
        move |ctx, _args| {
            *seen.lock().unwrap() = Some((ctx.depth, ctx.caller.is_some()));
            ReturnValues::status_only(PdbStatus::Success)
        },
    ));

    let values = session.run_procedure("call_nested", &[Argument::int32(21)]).unwrap();
    assert!(values.is_success(), "{values:?}");
    assert_eq!(names(&values), vec![42]);
    // Host -> filters -> helper: two frames while helper called back in.
    assert_eq!(*depth.lock().unwrap(), Some((2, true)));
    assert!(session.stack().is_empty());
    assert_eq!(session.pending_waits(), 0);
    assert_eq!(session.open_plugins().count(), 0);
}

#[test]
fn extensions_serve_temporary_procedures() {
    let mut session = session(false);
    session.query(Path::new("resident")).unwrap();
    session.query(Path::new("filters")).unwrap();

    let acked = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&acked);
    let wait = session
        .start_extension("ext_start", &[], move |values| {
            *slot.lock().unwrap() = Some(values.status());
        })
        .unwrap()
        .unwrap();
    // Callback waits deliver to the callback, not to the caller.
    assert!(session.wait_for(wait).is_none());
    assert_eq!(*acked.lock().unwrap(), Some(PdbStatus::Success));
    assert!(session.wait_for(wait).is_none());

    let owner = session
        .pdb()
        .get("ext_counter")
        .and_then(ProcedureRecord::owner)
        .unwrap();
    assert_eq!(session.plugin_state(owner), Some(PluginState::Open));
    assert_eq!(session.plugin(owner).unwrap().temp_procs(), &["ext_counter", "ext_reenter"]);

    for expected in 1..=2 {
        let values = session.run_procedure("ext_counter", &[]).unwrap();
        assert_eq!(names(&values), vec![expected]);
    }

    // The owner is busy serving ext_reenter when it calls itself.
    let values = session.run_procedure("ext_reenter", &[]).unwrap();
    assert_eq!(names(&values), vec![PdbStatus::CallingError.as_i32()]);
    assert!(!session.plugin(owner).unwrap().is_busy());

    // Only the owner may uninstall.
    session.run_procedure("steal_uninstall", &[]).unwrap();
    assert!(session.pdb().contains("ext_counter"));

    session.close_plugin(owner).unwrap();
    assert!(!session.pdb().contains("ext_counter"));
    assert!(!session.pdb().contains("ext_reenter"));
    assert_eq!(session.plugin_state(owner), Some(PluginState::Closed));
    let gone = session.run_procedure("ext_counter", &[]);
    assert!(matches!(gone, Err(HostError::Procedure(_))));
}

#[test]
fn eof_mid_message_closes_the_plugin() {
    let entry: ThreadEntry = Arc::new(|_argv, mut transport, _shm| {
        let bytes = encode_message(&MessageRef::ProcUninstall("half_written")).unwrap();
        transport.write(&bytes[..bytes.len() / 2]).unwrap();
        transport.flush().unwrap();
    });
    let launcher = ThreadLauncher::new(4096).with("truncated", entry);
    let mut session = HostSession::new(settings(false), launcher);

    let id = session.open_plugin(Path::new("truncated"), OpenMode::Run).unwrap();
    let err = session.service(id).unwrap_err();
    assert!(matches!(
        err,
        HostError::Wire(WireError::Transport(TransportError::UnexpectedEof))
    ));
    assert_eq!(session.plugin_state(id), Some(PluginState::Closed));
    assert!(matches!(session.service(id), Err(HostError::UnknownPlugin(_))));
}

#[test]
fn pending_calls_fail_when_the_plugin_dies() {
    let mut install = ProcInstall::new("dies_early", ProcKind::Plugin);
    install.returns = vec![def(ParamType::Int32, "never")];
    // Reads its configuration and call, then exits without replying.
    let entry: ThreadEntry = Arc::new(|_argv, mut transport, _shm| {
        for _ in 0..2 {
            if pixwire_wire::read_message(&mut transport).is_err() {
                return;
            }
        }
    });
    let launcher = ThreadLauncher::new(4096).with("dies_early", entry);
    let mut session = HostSession::new(settings(false), launcher);
    session.pdb_mut().register(ProcedureRecord::from_install(
        install,
        Dispatch::Program("dies_early".into()),
    ));

    let values = session.run_procedure("dies_early", &[]).unwrap();
    assert_eq!(values.status(), PdbStatus::ExecutionError);
    assert_eq!(values.len(), 2);
    assert!(session.stack().is_empty());
}
