//! Aster Compiler CLI
//!
//! Command-line interface for lowering program trees to x86 assembly and
//! linking them against the C runtime.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "asterc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Aster compiler - lower program trees to x86 assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a tree file and link it into an executable
    Build {
        /// Input tree file (.ast)
        input: PathBuf,

        /// Output executable path (defaults to the input filename without
        /// its extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the intermediate assembly file (.s)
        #[arg(long)]
        keep_asm: bool,

        /// Runtime object or archive to link (repeatable)
        #[arg(long = "runtime", value_name = "PATH")]
        runtime_objects: Vec<PathBuf>,

        /// Path to a project configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Annotate the assembly with source positions
        #[arg(short = 'g', long)]
        debug_info: bool,
    },

    /// Compile a tree file to assembly only
    Emit {
        /// Input tree file (.ast)
        input: PathBuf,

        /// Output assembly path (defaults to the input filename with .s)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Path to a project configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Annotate the assembly with source positions
        #[arg(short = 'g', long)]
        debug_info: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            keep_asm,
            runtime_objects,
            config,
            debug_info,
        } => {
            let output = output.unwrap_or_else(|| {
                let stem = input.file_stem().unwrap_or_default();
                PathBuf::from(stem)
            });
            let config = load_config(config.as_deref(), debug_info, &runtime_objects);
            run_build(&input, &output, keep_asm, &config);
        }
        Commands::Emit {
            input,
            output,
            config,
            debug_info,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension("s"));
            let config = load_config(config.as_deref(), debug_info, &[]);
            run_emit(&input, &output, &config);
        }
        Commands::Completions { shell } => {
            run_completions(shell);
        }
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "asterc", &mut io::stdout());
}

/// Fold the optional project file and CLI flags into one configuration.
fn load_config(
    path: Option<&Path>,
    debug_info: bool,
    runtime_objects: &[PathBuf],
) -> asterc::CompilerConfig {
    let mut config = match path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => match asterc::CompilerConfig::from_toml(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Error: failed to read {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => asterc::CompilerConfig::default(),
    };
    if debug_info {
        config.debug_info = true;
    }
    config
        .runtime_objects
        .extend(runtime_objects.iter().cloned());
    config
}

fn report_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
}

fn run_build(input: &Path, output: &Path, keep_asm: bool, config: &asterc::CompilerConfig) {
    match asterc::build_file(input, output, keep_asm, config) {
        Ok(warnings) => {
            report_warnings(&warnings);
            println!("Compiled {} -> {}", input.display(), output.display());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_emit(input: &Path, output: &Path, config: &asterc::CompilerConfig) {
    match asterc::compile_file(input, output, config) {
        Ok(warnings) => {
            report_warnings(&warnings);
            println!("Emitted {} -> {}", input.display(), output.display());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
