use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::*;
use scion_vm::{
    ContextState, Engine, ExecutionContext, FunctionId, ModuleImage, Value, GC_DESTROY_GARBAGE,
    GC_DETECT_GARBAGE, GC_FULL_CYCLE,
};
use serde_json::json;
use serde_json::Value as Json;

#[derive(Parser)]
#[command(
    name = "scion",
    version,
    about = "Run and inspect compiled Scion module images",
    long_about = "Host runner for the Scion scripting engine. Loads a compiled module \
image (.svb), installs it into a fresh engine, and either drives one of its entry \
points or prints its contents. Hosts embedding the engine register their own types \
and functions; this runner installs images against a bare engine, so images that \
import host functions are rejected here with the same diagnostics an embedding \
host would see."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an entry point of a compiled module image
    Run {
        /// Path to the compiled module image (.svb)
        image: PathBuf,
        /// Entry point to execute
        #[arg(short, long, default_value = "main")]
        entry: String,
        /// Integer argument for the entry point; repeat in declaration order
        #[arg(short, long = "arg")]
        args: Vec<i64>,
        /// Print collector statistics after the run
        #[arg(long)]
        gc_stats: bool,
        /// Dump the callstack as JSON when the script faults
        #[arg(long)]
        stack_json: bool,
    },
    /// Print the classes, functions and entry points of an image
    Inspect {
        /// Path to the compiled module image (.svb)
        image: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match Cli::parse().command {
        Command::Run {
            image,
            entry,
            args,
            gc_stats,
            stack_json,
        } => run_image(&image, &entry, &args, gc_stats, stack_json),
        Command::Inspect { image } => inspect_image(&image),
    }
}

fn load_image(path: &Path) -> Option<ModuleImage> {
    let Some(path_str) = path.to_str() else {
        eprintln!("{} image path is not valid UTF-8", "error:".red().bold());
        return None;
    };
    match ModuleImage::read_from_file(path_str) {
        Ok(image) => Some(image),
        Err(err) => {
            eprintln!(
                "{} cannot load '{}': {}",
                "error:".red().bold(),
                path.display(),
                err
            );
            None
        }
    }
}

fn install(engine: &mut Engine, image: &ModuleImage) -> Option<u32> {
    match engine.install_module(image) {
        Ok(id) => Some(id),
        Err(err) => {
            eprintln!(
                "{} module '{}' rejected: {}",
                "error:".red().bold(),
                image.name,
                err
            );
            None
        }
    }
}

fn run_image(
    path: &Path,
    entry: &str,
    args: &[i64],
    gc_stats: bool,
    stack_json: bool,
) -> ExitCode {
    let Some(image) = load_image(path) else {
        return ExitCode::from(1);
    };
    let mut engine = Engine::new();
    engine.finalize();
    let Some(module) = install(&mut engine, &image) else {
        return ExitCode::from(1);
    };
    let Some(function) = engine.entry_point(module, entry) else {
        eprintln!(
            "{} no entry point '{}' in '{}'",
            "error:".red().bold(),
            entry,
            image.name
        );
        if let Some(installed) = engine.module(module) {
            let mut names: Vec<&str> = installed.entry_points().map(|(name, _)| name).collect();
            names.sort_unstable();
            if !names.is_empty() {
                eprintln!("{} {}", "available:".dimmed(), names.join(", "));
            }
        }
        return ExitCode::from(1);
    };

    let mut ctx = engine.create_context();
    if let Err(err) = ctx.prepare(&mut engine, function) {
        eprintln!("{} {}", "error:".red().bold(), err);
        return ExitCode::from(1);
    }
    for (slot, value) in args.iter().enumerate() {
        if let Err(err) = ctx.set_arg_int(slot, *value) {
            eprintln!("{} argument {}: {}", "error:".red().bold(), slot, err);
            return ExitCode::from(1);
        }
    }

    let abort = ctx.abort_handle();
    ctrlc::set_handler(move || {
        eprintln!("{}", "interrupt received, aborting script...".yellow());
        abort.abort();
    })
    .expect("Error setting Ctrl-C handler");

    let code = loop {
        match ctx.execute(&mut engine) {
            Ok(ContextState::Finished) => {
                println!("{}", render_value(ctx.return_value()));
                break ExitCode::SUCCESS;
            }
            Ok(ContextState::Suspended) => continue,
            Ok(ContextState::Aborted) => {
                eprintln!("{}", "aborted".yellow().bold());
                break ExitCode::from(130);
            }
            Ok(ContextState::ExceptionRaised) => {
                report_exception(&engine, &ctx, stack_json);
                break ExitCode::from(2);
            }
            Ok(state) => {
                eprintln!("{} context ended {}", "error:".red().bold(), state);
                break ExitCode::from(1);
            }
            Err(err) => {
                eprintln!("{} {}", "error:".red().bold(), err);
                break ExitCode::from(1);
            }
        }
    };

    if gc_stats {
        let _ = ctx.unprepare(&mut engine);
        let _ = engine.garbage_collect(GC_FULL_CYCLE | GC_DETECT_GARBAGE | GC_DESTROY_GARBAGE);
        print_gc_stats(&engine);
    }
    code
}

fn report_exception(engine: &Engine, ctx: &ExecutionContext, stack_json: bool) {
    let message = ctx.exception_message().unwrap_or("unknown exception");
    let location = match (
        ctx.exception_function().and_then(|f| engine.function(f)),
        ctx.exception_line(),
    ) {
        (Some(desc), Some(line)) => format!(" in '{}' at line {}", desc.name, line),
        (Some(desc), None) => format!(" in '{}'", desc.name),
        _ => String::new(),
    };
    eprintln!(
        "{} {}{}",
        "script exception:".red().bold(),
        message,
        location
    );
    if stack_json {
        match serde_json::to_string_pretty(&ctx.stack_json(engine)) {
            Ok(rendered) => eprintln!("{}", rendered),
            Err(err) => eprintln!(
                "{} cannot render callstack: {}",
                "error:".red().bold(),
                err
            ),
        }
    }
}

fn print_gc_stats(engine: &Engine) {
    let stats = engine.gc_statistics();
    println!("{}", "collector statistics".cyan().bold());
    println!("  candidates now       {}", stats.current_size);
    println!("  enrolled since pass  {}", stats.new_objects);
    println!("  detected total       {}", stats.total_detected);
    println!("  destroyed total      {}", stats.total_destroyed);
    println!("  destroyed while new  {}", stats.total_new_destroyed);
    println!("  live objects         {}", engine.live_objects());
}

fn render_value(value: Value) -> String {
    match value {
        Value::Void => "void".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Object(handle) => format!("object {}", handle),
    }
}

fn inspect_image(path: &Path) -> ExitCode {
    let Some(image) = load_image(path) else {
        return ExitCode::from(1);
    };
    let mut engine = Engine::new();
    engine.finalize();
    let Some(module) = install(&mut engine, &image) else {
        return ExitCode::from(1);
    };
    let Some(installed) = engine.module(module) else {
        return ExitCode::from(1);
    };

    let types: Vec<Json> = installed
        .types()
        .iter()
        .map(|&tid| {
            let fields: Vec<String> = engine
                .registry()
                .get(tid)
                .map(|desc| {
                    desc.fields()
                        .iter()
                        .map(|f| {
                            format!(
                                "{}{} {}",
                                engine.type_name(f.ty),
                                if f.is_handle { "@" } else { "" },
                                f.name
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({ "name": engine.type_name(tid), "fields": fields })
        })
        .collect();
    let functions: Vec<String> = installed
        .functions()
        .iter()
        .filter_map(|&fid| {
            engine
                .function(fid)
                .map(|desc| desc.declaration(|t| engine.type_name(t)))
        })
        .collect();
    let mut entries: Vec<(&str, FunctionId)> = installed.entry_points().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let entry_map: serde_json::Map<String, Json> = entries
        .into_iter()
        .map(|(name, id)| (name.to_string(), json!(id.0)))
        .collect();

    let doc = json!({
        "module": installed.name(),
        "types": types,
        "functions": functions,
        "entry_points": entry_map,
    });
    match serde_json::to_string_pretty(&doc) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::from(1)
        }
    }
}
