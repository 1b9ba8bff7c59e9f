//! URCL Code Generator Driver
//!
//! Command-line interface gluing the parser, the emitter, the backend
//! targets and the native machine together.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use urcl_common::{DiagnosticSink, UrclError};
use urcl_core::{parse_source, Emitter, EmitterOptions, Program};
use urcl_targets::{
    COptions, CTarget, PythonOptions, PythonTarget, Target, UrclTarget, X86Options, X86Target,
};
use urcl_vm::Machine;

#[derive(Parser)]
#[command(name = "urclc")]
#[command(about = "URCL retargetable code generator")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetKind {
    /// Canonical URCL re-serialization
    Urcl,
    /// Interpreted virtual machine as Python source
    Py,
    /// Fixed-array simulator as C source
    C,
    /// Macro-expanded NASM assembly
    X86,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower URCL source files with a backend target
    Compile {
        /// Input URCL source files
        inputs: Vec<PathBuf>,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value = "urcl")]
        target: TargetKind,

        /// Leave the generated program for a debugger to drive instead
        /// of auto-running on load (py target)
        #[arg(long)]
        debugger: bool,

        /// Print each instruction's source text before executing it
        /// (py target)
        #[arg(long)]
        trace: bool,

        /// Main memory capacity in words (c target)
        #[arg(long, default_value_t = 4096)]
        ram_size: usize,

        /// Stack capacity in words (c target)
        #[arg(long, default_value_t = 1024)]
        stack_size: usize,

        /// Register width: 16, 32 or 64 (x86 target)
        #[arg(long, default_value_t = 32)]
        bits: u16,

        /// Inline every macro body at its use site (x86 target)
        #[arg(long)]
        expand_macros: bool,

        /// Emit section directives (x86 target)
        #[arg(long)]
        sections: bool,
    },

    /// Parse URCL source files and execute them on the native machine
    Run {
        /// Input URCL source files
        inputs: Vec<PathBuf>,
    },

    /// Serialize the parsed instruction/label stream as JSON
    Dump {
        /// Input URCL source files
        inputs: Vec<PathBuf>,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            inputs,
            output,
            target,
            debugger,
            trace,
            ram_size,
            stack_size,
            bits,
            expand_macros,
            sections,
        } => compile(
            &inputs,
            output.as_deref(),
            target,
            debugger,
            trace,
            ram_size,
            stack_size,
            bits,
            expand_macros,
            sections,
        ),
        Commands::Run { inputs } => run(&inputs),
        Commands::Dump { inputs, output } => dump(&inputs, output.as_deref()),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn load_program(inputs: &[PathBuf]) -> Result<Program, UrclError> {
    let mut emitter = Emitter::new(EmitterOptions::default());
    let mut sink = DiagnosticSink::new();
    for path in inputs {
        let source = fs::read_to_string(path)?;
        parse_source(&source, &mut emitter, &mut sink);
    }
    sink.print_diagnostics();
    Ok(emitter.finish())
}

fn write_output(text: &str, output: Option<&Path>) -> Result<(), UrclError> {
    match output {
        Some(path) => {
            fs::write(path, text)?;
            Ok(())
        }
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compile(
    inputs: &[PathBuf],
    output: Option<&Path>,
    target: TargetKind,
    debugger: bool,
    trace: bool,
    ram_size: usize,
    stack_size: usize,
    bits: u16,
    expand_macros: bool,
    sections: bool,
) -> Result<(), UrclError> {
    let program = load_program(inputs)?;

    let mut backend: Box<dyn Target> = match target {
        TargetKind::Urcl => Box::new(UrclTarget::new()),
        TargetKind::Py => Box::new(PythonTarget::new(PythonOptions {
            use_debugger: debugger,
            print_instructions: trace,
            ..PythonOptions::default()
        })),
        TargetKind::C => Box::new(CTarget::new(COptions {
            ram_size,
            stack_size,
        })),
        TargetKind::X86 => Box::new(X86Target::new(X86Options {
            bits,
            use_sections: sections,
            expand_macros,
        })),
    };

    let text = backend.emit(&program).map_err(|err| UrclError::TargetError {
        message: err.to_string(),
    })?;
    write_output(&text, output)
}

fn run(inputs: &[PathBuf]) -> Result<(), UrclError> {
    let program = load_program(inputs)?;
    let mut machine = Machine::load(&program);

    machine
        .run()
        .map_err(|err| UrclError::runtime_error(err.to_string()))?;

    println!(
        "IP = {}  HALT = {}  BREAK = {}",
        machine.ip(),
        machine.halted(),
        machine.interrupted()
    );
    for (name, value) in machine.registers() {
        println!("{} = {}", name, value);
    }
    if !machine.stack().is_empty() {
        println!("STACK = {:?}", machine.stack());
    }
    for (addr, value) in machine.ram() {
        println!("RAM[{}] = {}", addr, value);
    }
    Ok(())
}

fn dump(inputs: &[PathBuf], output: Option<&Path>) -> Result<(), UrclError> {
    let program = load_program(inputs)?;
    let json = serde_json::to_string_pretty(&program)
        .map_err(|err| UrclError::from(err.to_string()))?;
    write_output(&json, output)
}
