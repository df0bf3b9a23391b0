use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use lepus::bytecode::CompileOptions;
use lepus::vm::Context;
use lepus::{binary, compile, parser, semantic};

#[derive(Parser)]
#[command(name = "lepus", version, about = "Lepus script compiler and VM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a script file, printing the result.
    Run {
        file: PathBuf,
        #[command(flatten)]
        opts: CompileFlags,
    },
    /// Parse a script and dump the resolved AST as JSON.
    Ast {
        file: PathBuf,
        #[command(flatten)]
        opts: CompileFlags,
    },
    /// Compile a script to a binary chunk.
    Compile {
        file: PathBuf,
        /// Output path; defaults to the input with a `.lepc` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        opts: CompileFlags,
    },
    /// Run a previously compiled binary chunk.
    Exec { file: PathBuf },
}

#[derive(Args)]
struct CompileFlags {
    /// Share loop variables across iterations, as engines before the
    /// closure fix did.
    #[arg(long)]
    legacy_closures: bool,
    /// Reject undeclared assignments and const container writes.
    #[arg(long)]
    strict: bool,
    /// Engine version the output must run on.
    #[arg(long, default_value = "2.0")]
    sdk_version: String,
}

impl CompileFlags {
    fn options(&self, source_name: &str) -> CompileOptions {
        CompileOptions {
            target_sdk_version: self.sdk_version.clone(),
            closure_fix: !self.legacy_closures,
            strict: self.strict,
            source_name: source_name.to_string(),
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Run { file, opts } => {
            let (source, name) = read_source(&file)?;
            let script = compile(&source, &opts.options(&name)).map_err(|e| e.to_string())?;
            let mut ctx = Context::new();
            ctx.enable_strict_check = opts.strict;
            let result = ctx.execute(&script).map_err(|e| e.to_string())?;
            println!("{result}");
            Ok(())
        }
        Command::Ast { file, opts } => {
            let (source, name) = read_source(&file)?;
            let mut chunk = parser::parse(&source, &name).map_err(|e| e.to_string())?;
            semantic::analyze(&mut chunk, !opts.legacy_closures, opts.strict)
                .map_err(|e| e.to_string())?;
            let json = serde_json::to_string_pretty(&chunk).map_err(|e| e.to_string())?;
            println!("{json}");
            Ok(())
        }
        Command::Compile { file, output, opts } => {
            let (source, name) = read_source(&file)?;
            let script = compile(&source, &opts.options(&name)).map_err(|e| e.to_string())?;
            let bytes = binary::encode(&script).map_err(|e| e.to_string())?;
            let output = output.unwrap_or_else(|| file.with_extension("lepc"));
            std::fs::write(&output, bytes)
                .map_err(|e| format!("writing {}: {e}", output.display()))?;
            Ok(())
        }
        Command::Exec { file } => {
            let bytes = std::fs::read(&file)
                .map_err(|e| format!("reading {}: {e}", file.display()))?;
            let script = binary::decode(&bytes).map_err(|e| e.to_string())?;
            let result = Context::new().execute(&script).map_err(|e| e.to_string())?;
            println!("{result}");
            Ok(())
        }
    }
}

fn read_source(path: &PathBuf) -> Result<(String, String), String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    Ok((source, path.display().to_string()))
}
