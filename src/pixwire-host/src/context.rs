//! Collaborators the host consults while running procedures, and the built-in
//! procedures that route to them.

use crate::drawable::DrawableStore;
use crate::install::MenuLocation;
use crate::marshal::{Argument, ReturnValues};
use crate::pdb::{ProcedureDb, ProcedureRecord};
use crate::process::PluginId;
use pixwire_wire::{ParamDef, ParamType, PdbStatus, RunMode};

/// Receives progress and messages reported by procedures.
pub trait ProgressSink: Send {
    fn init(&mut self, plugin: Option<PluginId>, message: &str, display: i32);

    /// `fraction` runs from 0.0 to 1.0.
    fn update(&mut self, plugin: Option<PluginId>, fraction: f64);

    fn message(&mut self, plugin: Option<PluginId>, text: &str);
}

/// Writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn init(&mut self, plugin: Option<PluginId>, message: &str, display: i32) {
        let display_value = display;
        tracing::info!(plugin = ?plugin.map(PluginId::get), display = display_value, "{message}");
    }

    fn update(&mut self, plugin: Option<PluginId>, fraction: f64) {
        tracing::debug!(
            plugin = ?plugin.map(PluginId::get),
            percent = fraction * 100.0,
            "progress"
        );
    }

    fn message(&mut self, plugin: Option<PluginId>, text: &str) {
        tracing::info!(plugin = ?plugin.map(PluginId::get), "{text}");
    }
}

/// What an internal procedure can reach while it runs.
pub struct CallContext<'a> {
    pub progress: &'a mut dyn ProgressSink,
    pub drawables: &'a dyn DrawableStore,
    /// The plug-in that made the call, if any.
    pub caller: Option<PluginId>,
    /// Frames on the call stack when the call started.
    pub depth: usize,
}

/// The image the user is working on, used to fill default arguments.
pub trait ActiveContext {
    fn run_mode(&self) -> RunMode {
        RunMode::Interactive
    }

    fn image(&self) -> Option<i32>;

    fn drawable(&self) -> Option<i32>;

    fn display(&self) -> Option<i32> {
        None
    }
}

/// A fixed [`ActiveContext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveImage {
    pub image: Option<i32>,
    pub drawable: Option<i32>,
    pub display: Option<i32>,
}

impl ActiveImage {
    pub fn new(image: i32, drawable: i32) -> Self {
        Self {
            image: Some(image),
            drawable: Some(drawable),
            display: None,
        }
    }
}

impl ActiveContext for ActiveImage {
    fn image(&self) -> Option<i32> {
        self.image
    }

    fn drawable(&self) -> Option<i32> {
        self.drawable
    }

    fn display(&self) -> Option<i32> {
        self.display
    }
}

/// Builds the arguments a procedure is run with from a menu.
///
/// Every declared argument starts at its zero value. The run mode goes in the
/// first slot, and procedures that work on an image also get the active image
/// and drawable in the next two.
pub fn default_args(record: &ProcedureRecord, ctx: &dyn ActiveContext) -> Vec<Argument> {
    let mut args: Vec<Argument> = record
        .args
        .iter()
        .filter_map(|def| Argument::zero(def.kind))
        .collect();
    let takes_image = matches!(
        record.menu_location(),
        Some(MenuLocation::Image | MenuLocation::Save | MenuLocation::ScriptFu)
    );

    for (index, def) in record.args.iter().enumerate().take(3) {
        let value = match (index, def.kind) {
            (0, ParamType::Int32) => Some(Argument::int32(ctx.run_mode() as i32)),
            (0, ParamType::Display) => {
                ctx.display().and_then(|id| Argument::id(ParamType::Display, id))
            }
            (1, ParamType::Image) if takes_image => {
                ctx.image().and_then(|id| Argument::id(ParamType::Image, id))
            }
            (2, ParamType::Drawable) if takes_image => {
                ctx.drawable().and_then(|id| Argument::id(ParamType::Drawable, id))
            }
            _ => None,
        };
        if let (Some(value), Some(slot)) = (value, args.get_mut(index)) {
            *slot = value;
        }
    }
    args
}

/// Registers the procedures the host itself serves.
pub fn register_builtins(pdb: &mut ProcedureDb) {
    pdb.register(
        ProcedureRecord::internal(
            "gimp_progress_init",
            vec![
                ParamDef::new(
                    ParamType::String,
                    "message",
                    "Message to use in the progress dialog",
                ),
                ParamDef::new(
                    ParamType::Int32,
                    "gdisplay",
                    "Display to update the progressbar in, or -1",
                ),
            ],
            Vec::new(),
            |ctx, args| {
                let message = args.first().and_then(Argument::as_str).unwrap_or_default();
                let display = args.get(1).and_then(Argument::as_int32).unwrap_or(-1);
                ctx.progress.init(ctx.caller, message, display);
                ReturnValues::status_only(PdbStatus::Success)
            },
        )
        .with_blurb("Initializes the progress bar for the current plug-in"),
    );

    pdb.register(
        ProcedureRecord::internal(
            "gimp_progress_update",
            vec![ParamDef::new(ParamType::Float, "percentage", "Fraction of work done")],
            Vec::new(),
            |ctx, args| {
                let fraction = args.first().and_then(Argument::as_float).unwrap_or_default();
                ctx.progress.update(ctx.caller, fraction.clamp(0.0, 1.0));
                ReturnValues::status_only(PdbStatus::Success)
            },
        )
        .with_blurb("Updates the progress bar for the current plug-in"),
    );

    pdb.register(
        ProcedureRecord::internal(
            "gimp_message",
            vec![ParamDef::new(ParamType::String, "message", "Message to display")],
            Vec::new(),
            |ctx, args| {
                let text = args.first().and_then(Argument::as_str).unwrap_or_default();
                ctx.progress.message(ctx.caller, text);
                ReturnValues::status_only(PdbStatus::Success)
            },
        )
        .with_blurb("Displays a message to the user"),
    );

    let info_returns = vec![
        ParamDef::new(ParamType::Int32, "width", "Width of the drawable"),
        ParamDef::new(ParamType::Int32, "height", "Height of the drawable"),
        ParamDef::new(ParamType::Int32, "bpp", "Bytes per pixel"),
    ];
    let failure = info_returns.clone();
    pdb.register(
        ProcedureRecord::internal(
            "gimp_drawable_info",
            vec![ParamDef::new(ParamType::Drawable, "drawable", "The drawable")],
            info_returns,
            move |ctx, args| {
                let geometry = args
                    .first()
                    .and_then(Argument::as_id)
                    .and_then(|id| ctx.drawables.geometry(id));
                match geometry {
                    Some(geometry) => ReturnValues::success(vec![
                        Argument::int32(geometry.width as i32),
                        Argument::int32(geometry.height as i32),
                        Argument::int32(geometry.bpp as i32),
                    ]),
                    None => ReturnValues::defaults(PdbStatus::ExecutionError, &failure),
                }
            },
        )
        .with_blurb("Returns the size and depth of a drawable"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawable::MemoryDrawables;
    use crate::pdb::Dispatch;
    use pixwire_wire::{ProcInstall, ProcKind};

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ProgressSink for Recorder {
        fn init(&mut self, _plugin: Option<PluginId>, message: &str, display: i32) {
            self.events.push(format!("init {message} {display}"));
        }

        fn update(&mut self, _plugin: Option<PluginId>, fraction: f64) {
            self.events.push(format!("update {fraction}"));
        }

        fn message(&mut self, _plugin: Option<PluginId>, text: &str) {
            self.events.push(format!("message {text}"));
        }
    }

    fn call(
        pdb: &ProcedureDb,
        name: &str,
        ctx: &mut CallContext<'_>,
        args: &[Argument],
    ) -> ReturnValues {
        let record = pdb.get(name).unwrap();
        record.check_args(args).unwrap();
        let Dispatch::Internal(body) = &record.dispatch else {
            panic!("{name} is not internal");
        };
        body(ctx, args)
    }

    #[test]
    fn builtins_route_to_the_progress_sink() {
        let mut pdb = ProcedureDb::new();
        register_builtins(&mut pdb);
        let drawables = MemoryDrawables::new();
        let mut sink = Recorder::default();
        let mut ctx = CallContext {
            progress: &mut sink,
            drawables: &drawables,
            caller: Some(PluginId(3)),
            depth: 1,
        };

        let values = call(
            &pdb,
            "gimp_progress_init",
            &mut ctx,
            &[Argument::string("Blurring"), Argument::int32(-1)],
        );
        assert!(values.is_success());
        call(&pdb, "gimp_progress_update", &mut ctx, &[Argument::float(1.5)]);
        call(&pdb, "gimp_message", &mut ctx, &[Argument::string("done")]);
        assert_eq!(sink.events, vec!["init Blurring -1", "update 1", "message done"]);
    }

    #[test]
    fn drawable_info_reports_geometry() {
        let mut pdb = ProcedureDb::new();
        register_builtins(&mut pdb);
        let mut drawables = MemoryDrawables::new();
        let id = drawables.create(30, 20, 4);
        let mut sink = LogProgress;
        let mut ctx = CallContext {
            progress: &mut sink,
            drawables: &drawables,
            caller: None,
            depth: 0,
        };

        let known = call(
            &pdb,
            "gimp_drawable_info",
            &mut ctx,
            &[Argument::id(ParamType::Drawable, id).unwrap()],
        );
        let dims: Vec<_> = known.values().iter().filter_map(Argument::as_int32).collect();
        assert_eq!(dims, vec![30, 20, 4]);

        let unknown = call(
            &pdb,
            "gimp_drawable_info",
            &mut ctx,
            &[Argument::id(ParamType::Drawable, 99).unwrap()],
        );
        assert_eq!(unknown.status(), PdbStatus::ExecutionError);
        assert_eq!(unknown.len(), 4);
    }

    fn menu_record(menu: &str, kinds: &[ParamType]) -> ProcedureRecord {
        let mut install = ProcInstall::new("p", ProcKind::Plugin);
        install.menu_path = Some(menu.into());
        install.params = kinds.iter().map(|kind| ParamDef::new(*kind, "a", "")).collect();
        ProcedureRecord::from_install(install, Dispatch::Program("p".into()))
    }

    #[test]
    fn image_procedures_get_the_active_image() {
        let record = menu_record(
            "<Image>/Filters/Blur",
            &[ParamType::Int32, ParamType::Image, ParamType::Drawable, ParamType::Float],
        );
        let args = default_args(&record, &ActiveImage::new(5, 9));
        assert_eq!(args.len(), 4);
        assert_eq!(args[0].as_int32(), Some(RunMode::Interactive as i32));
        assert_eq!(args[1].as_id(), Some(5));
        assert_eq!(args[2].as_id(), Some(9));
        assert_eq!(args[3].as_float(), Some(0.0));
    }

    #[test]
    fn toolbox_procedures_only_get_the_run_mode() {
        let record = menu_record("<Toolbox>/Xtns/Browser", &[ParamType::Int32, ParamType::Image]);
        let args = default_args(&record, &ActiveImage::new(5, 9));
        assert_eq!(args[0].as_int32(), Some(0));
        assert_eq!(args[1].as_id(), Some(0));
    }
}
