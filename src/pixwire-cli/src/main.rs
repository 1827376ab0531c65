use anyhow::Result;
use clap::{Parser, Subcommand};
use pixwire_core::{init_logging, AppDirs, Config};
use pixwire_host::{
    ActiveContext, ArgValue, Argument, HostSession, PluginDef, ProcessLauncher, ReturnValues,
};
use pixwire_wire::{Param, ParamType, RunMode};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "pixwire", version, about = "Query and run image editor plug-ins")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the procedures a plug-in installs
    Query(QueryCommand),
    /// Query a plug-in, then run one of its procedures
    Run(RunCommand),
    /// Print the configuration, plug-in and log locations
    Paths,
}

#[derive(Debug, Parser, Clone)]
struct QueryCommand {
    /// Plug-in program, resolved against the plug-in path unless it contains a directory
    program: PathBuf,
    /// Print the procedure definitions as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser, Clone)]
struct RunCommand {
    program: PathBuf,
    procedure: String,
    /// Argument as kind:value, e.g. int32:1, float:0.5, string:hello, drawable:3
    #[arg(long = "arg", value_name = "KIND:VALUE")]
    args: Vec<String>,
    /// Image used to fill default arguments when no --arg is given
    #[arg(long)]
    image: Option<i32>,
    /// Drawable used to fill default arguments when no --arg is given
    #[arg(long)]
    drawable: Option<i32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ArgumentSyntaxError {
    #[error("argument {0:?} must look like kind:value")]
    MissingKind(String),
    #[error("unknown argument kind {0:?}")]
    UnknownKind(String),
    #[error("arguments of kind {0} cannot be given on the command line")]
    UnsupportedKind(ParamType),
    #[error("{value:?} is not a valid {kind} value")]
    InvalidValue { kind: ParamType, value: String },
}

fn parse_argument(text: &str) -> Result<Argument, ArgumentSyntaxError> {
    let (kind, value) = text
        .split_once(':')
        .ok_or_else(|| ArgumentSyntaxError::MissingKind(text.to_string()))?;
    let kind = ParamType::from_name(kind)
        .ok_or_else(|| ArgumentSyntaxError::UnknownKind(kind.to_string()))?;
    let invalid = || ArgumentSyntaxError::InvalidValue {
        kind,
        value: value.to_string(),
    };
    let param = match kind {
        ParamType::Int32 => Param::Int32(value.parse().map_err(|_| invalid())?),
        ParamType::Int16 => Param::Int16(value.parse().map_err(|_| invalid())?),
        ParamType::Int8 => Param::Int8(value.parse().map_err(|_| invalid())?),
        ParamType::Float => Param::Float(value.parse().map_err(|_| invalid())?),
        ParamType::String => Param::string(value),
        kind if kind.is_id() => {
            let id = value.parse().map_err(|_| invalid())?;
            Param::id(kind, id).ok_or(ArgumentSyntaxError::UnsupportedKind(kind))?
        }
        other => return Err(ArgumentSyntaxError::UnsupportedKind(other)),
    };
    Ok(Argument::from(param))
}

/// The image named on the command line; runs are never interactive.
struct CommandLineImage {
    image: Option<i32>,
    drawable: Option<i32>,
}

impl ActiveContext for CommandLineImage {
    fn run_mode(&self) -> RunMode {
        RunMode::NonInteractive
    }

    fn image(&self) -> Option<i32> {
        self.image
    }

    fn drawable(&self) -> Option<i32> {
        self.drawable
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command {
        Command::Paths => print_paths(&dirs, &config),
        Command::Query(query) => {
            let mut session = new_session(&config);
            let def = session.query(&query.program)?;
            if query.json {
                println!("{}", serde_json::to_string_pretty(&def)?);
            } else {
                print_def(&def);
            }
        }
        Command::Run(run) => {
            let args = run
                .args
                .iter()
                .map(|text| parse_argument(text))
                .collect::<Result<Vec<_>, _>>()?;
            let mut session = new_session(&config);
            session.query(&run.program)?;
            tracing::info!(procedure = %run.procedure, args = args.len(), "running procedure");
            let values = if args.is_empty() {
                let ctx = CommandLineImage {
                    image: run.image,
                    drawable: run.drawable,
                };
                session.run_with_defaults(&run.procedure, &ctx)?
            } else {
                session.run_procedure(&run.procedure, &args)?
            };
            print_values(&values);
        }
    }

    Ok(())
}

fn new_session(config: &Config) -> HostSession {
    let launcher = ProcessLauncher::from_settings(&config.host);
    HostSession::new(config.host.clone(), launcher)
}

fn print_paths(dirs: &AppDirs, config: &Config) {
    println!("config file: {}", Config::config_path(dirs).display());
    println!("config dir:  {}", dirs.config_dir().display());
    println!("data dir:    {}", dirs.data_dir().display());
    println!("plug-in dir: {}", dirs.plugin_dir().display());
    println!("log dir:     {}", dirs.log_dir().display());
    println!("plug-in path:");
    for dir in &config.host.plugin_path {
        println!("  - {}", dir.display());
    }
}

fn print_def(def: &PluginDef) {
    if def.procedures.is_empty() {
        println!("{} installed no procedures.", def.program.display());
        return;
    }
    println!("{}", def.program.display());
    for procedure in &def.procedures {
        let menu = procedure
            .menu_path
            .as_deref()
            .map(|path| format!(" [{path}]"))
            .unwrap_or_default();
        println!("  {} ({:?}){menu}", procedure.name, procedure.kind);
        if !procedure.blurb.is_empty() {
            println!("      {}", procedure.blurb);
        }
        for param in &procedure.params {
            println!("      in  {:<12} {}", param.kind.name(), param.name);
        }
        for ret in &procedure.returns {
            println!("      out {:<12} {}", ret.kind.name(), ret.name);
        }
    }
}

fn describe(value: &ArgValue) -> String {
    match value {
        ArgValue::Int32(v) => v.to_string(),
        ArgValue::Int16(v) => v.to_string(),
        ArgValue::Int8(v) => v.to_string(),
        ArgValue::Float(v) => v.to_string(),
        ArgValue::String(Some(v)) => format!("{v:?}"),
        ArgValue::String(None) => "(null)".to_string(),
        ArgValue::Int32Array(v) => format!("{v:?}"),
        ArgValue::Int16Array(v) => format!("{v:?}"),
        ArgValue::Int8Array(v) => format!("{v:?}"),
        ArgValue::FloatArray(v) => format!("{v:?}"),
        ArgValue::StringArray(v) => format!("{v:?}"),
        ArgValue::Color(rgb) => format!("#{:02x}{:02x}{:02x}", rgb.r, rgb.g, rgb.b),
        ArgValue::Region => "(region)".to_string(),
        ArgValue::Id(id) => format!("#{id}"),
    }
}

fn print_values(values: &ReturnValues) {
    println!("status: {:?}", values.status());
    for (index, value) in values.values().iter().enumerate() {
        println!("  [{index}] {:<12} {}", value.kind().name(), describe(value.value()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_parse_by_kind() {
        let arg = parse_argument("int32:7").expect("int32 should parse");
        assert_eq!(arg.as_int32(), Some(7));

        let arg = parse_argument("FLOAT:0.25").expect("kinds are case-insensitive");
        assert_eq!(arg.as_float(), Some(0.25));

        let arg = parse_argument("string:a:b").expect("only the first colon splits");
        assert_eq!(arg.as_str(), Some("a:b"));

        let arg = parse_argument("drawable:3").expect("handles parse as ids");
        assert_eq!(arg.kind(), ParamType::Drawable);
        assert_eq!(arg.as_id(), Some(3));
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert_eq!(
            parse_argument("7").unwrap_err(),
            ArgumentSyntaxError::MissingKind("7".into())
        );
        assert_eq!(
            parse_argument("matrix:1").unwrap_err(),
            ArgumentSyntaxError::UnknownKind("matrix".into())
        );
        assert_eq!(
            parse_argument("int32array:1").unwrap_err(),
            ArgumentSyntaxError::UnsupportedKind(ParamType::Int32Array)
        );
        assert!(matches!(
            parse_argument("int8:300"),
            Err(ArgumentSyntaxError::InvalidValue { kind: ParamType::Int8, .. })
        ));
    }

    #[test]
    fn values_render_for_humans() {
        assert_eq!(describe(&ArgValue::String(None)), "(null)");
        assert_eq!(describe(&ArgValue::Id(4)), "#4");
        assert_eq!(
            describe(&ArgValue::Color(pixwire_wire::Rgb::new(255, 0, 16))),
            "#ff0010"
        );
    }

    #[test]
    fn command_line_runs_are_non_interactive() {
        let ctx = CommandLineImage {
            image: Some(1),
            drawable: None,
        };
        assert_eq!(ctx.run_mode(), RunMode::NonInteractive);
        assert_eq!(ctx.image(), Some(1));
        assert_eq!(ctx.display(), None);
    }
}
