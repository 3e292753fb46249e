use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use qxlang::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use qxlang::vm::FRAME_SLOTS;
use qxlang::{CompiledProgram, RunOptions, SystemHost, Value, Vm, assemble};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// The compiled program as JSON
    Json,
}

/// Run a qxlang script.
#[derive(Debug, Parser)]
#[command(name = "qxlang", version, about)]
struct Cli {
    /// Script file to run
    #[arg(required_unless_present = "explain")]
    script: Option<PathBuf>,

    /// Arguments passed to the script (`getArgs`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Run the lowered opcode tier instead of the instruction list
    #[arg(long)]
    lowered: bool,

    /// Print the compiled form instead of running
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// JSON value placed in the input register
    #[arg(long, value_name = "JSON")]
    input: Option<String>,

    /// Instruction address to start at
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Report errors as JSON on stderr
    #[arg(long)]
    json: bool,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long)]
    debug: bool,

    /// Explain an error code, e.g. QX-R002
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

fn report(d: &Diagnostic, as_json: bool) {
    if as_json {
        eprintln!("{}", json::render(d));
    } else {
        let use_color = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        eprint!("{}", AnsiRenderer { use_color }.render(d));
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    // The VM turns handler panics into diagnostics; only log the raw message.
    std::panic::set_hook(Box::new(|info| {
        debug!(%info, "panic");
    }));
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if let Some(code) = &cli.explain {
        return match registry::lookup(code) {
            Some(entry) => {
                print!("{}", entry.long);
                0
            }
            None => {
                eprintln!("unknown error code: {}", code);
                1
            }
        };
    }

    let Some(path) = &cli.script else {
        eprintln!("Usage: qxlang <script> [args...]");
        return 1;
    };
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            return 1;
        }
    };

    let mut program = match assemble(&source) {
        Ok(p) => p,
        Err(e) => {
            report(&Diagnostic::from(&e).with_source(source.as_str()), cli.json);
            return 1;
        }
    };

    let input = match cli.input.as_deref().map(|s| serde_json::from_str::<serde_json::Value>(s)) {
        None => Value::Undefined,
        Some(Ok(json)) => Value::from_json(json),
        Some(Err(e)) => {
            eprintln!("Invalid --input JSON: {}", e);
            return 1;
        }
    };

    if cli.lowered {
        program.lower();
    }

    if cli.emit == Some(Emit::Json) {
        return match serde_json::to_string_pretty(&program) {
            Ok(text) => {
                println!("{}", text);
                0
            }
            Err(e) => {
                eprintln!("Serialization error: {}", e);
                1
            }
        };
    }

    let mut script_args = vec![path.display().to_string()];
    script_args.extend(cli.args.iter().cloned());
    let options = RunOptions::new().with_start(cli.start).with_input(input).with_args(script_args);

    if cli.lowered {
        run_lowered(&program, options, cli.json)
    } else {
        run_program(&program, options, cli.json)
    }
}

fn run_program(program: &CompiledProgram, options: RunOptions, as_json: bool) -> i32 {
    let mut vm = Vm::new(program, SystemHost::new(), options);
    let result = vm.run();
    debug!(stats = ?vm.stats(), "done");
    match result {
        Ok(output) => {
            if !output.is_undefined() {
                println!("{}", output);
            }
            0
        }
        Err(e) => {
            report(&Diagnostic::runtime(&e, program), as_json);
            1
        }
    }
}

/// The lowered tier has no output register; the root frame's assigned
/// slots are printed instead.
fn run_lowered(program: &CompiledProgram, options: RunOptions, as_json: bool) -> i32 {
    let mut vm = Vm::new(program, SystemHost::new(), options);
    if let Err(e) = vm.run_lowered() {
        report(&Diagnostic::from(&e), as_json);
        return 1;
    }
    for slot in 0..FRAME_SLOTS {
        if let Some(v) = vm.local(slot).filter(|v| !v.is_undefined()) {
            println!("${} = {}", slot, v);
        }
    }
    0
}
