//! Glyph compiler CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glyph_codegen::{generate_all, GenerateOptions, GeneratedProgram, Target};
use glyph_error::DiagnosticRenderer;
use glyph_ir::BuildOutput;
use indexmap::IndexSet;
use rayon::prelude::*;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Code generation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// FastAPI application
    Python,
    /// Express application
    #[value(name = "typescript", alias = "ts")]
    TypeScript,
    /// axum application
    Rust,
}

impl From<Backend> for Target {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Python => Target::Python,
            Backend::TypeScript => Target::TypeScript,
            Backend::Rust => Target::Rust,
        }
    }
}

#[derive(Parser)]
#[command(name = "glyph")]
#[command(author = "Guilherme Mendes")]
#[command(version = "0.1.0")]
#[command(about = "Glyph service compiler", long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shows the IR of a program
    Ir {
        /// Program file (JSON surface tree)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print the IR as JSON
        #[arg(long)]
        json: bool,
    },

    /// Builds the IR and reports diagnostics without generating code
    Check {
        /// Program file (JSON surface tree)
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Prints one backend's output
    Emit {
        /// Program file (JSON surface tree)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Code generation backend
        #[arg(short, long, default_value = "rust")]
        target: Backend,

        /// Print the dependency manifest instead of the source
        #[arg(long)]
        manifest: bool,
    },

    /// Writes every requested target under `<OUT>/<target>/`
    Build {
        /// Program file (JSON surface tree)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        out: PathBuf,

        /// Backends to generate (default: all)
        #[arg(short, long)]
        target: Vec<Backend>,

        /// Listen address of the generated servers
        #[arg(long)]
        host: Option<String>,

        /// Listen port of the generated servers
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli.command) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Ir { input, json } => {
            let output = load(&input)?;
            let service = &output.service;
            if json {
                println!("{}", serde_json::to_string_pretty(service)?);
                return Ok(());
            }

            println!("{}", service);
            println!("Statistics:");
            println!("   Types: {}", service.types.len());
            println!("   Providers: {}", service.providers.len());
            println!("   HTTP Routes: {}", service.routes.len());
            println!("   Functions: {}", service.functions.len());
            println!("   Bindings: {}", service.binding_count());
        }

        Commands::Check { input } => {
            println!("Checking: {}\n", input.display());
            let renderer = DiagnosticRenderer::new().with_colors(std::io::stderr().is_terminal());

            let program = read_program(&input)?;
            println!("  [ok] Program: {} items", program.items.len());

            let output = match glyph_ir::build(&program) {
                Ok(output) => output,
                Err(err) => {
                    let diagnostic = err.diagnostic(input.display().to_string());
                    eprintln!("{}", renderer.render(&diagnostic));
                    std::process::exit(1);
                }
            };

            let warnings = output.diagnostics.warning_count();
            if warnings > 0 {
                println!("  [warn] IR: {} warning(s)", warnings);
                eprintln!("{}", output.diagnostics.render(&renderer));
            } else {
                println!(
                    "  [ok] IR: {} bindings, {} providers",
                    output.service.binding_count(),
                    output.service.providers.len()
                );
            }

            println!("\nNo errors found!");
        }

        Commands::Emit {
            input,
            target,
            manifest,
        } => {
            let output = load(&input)?;
            let targets = [Target::from(target)];
            let programs = generate_all(&output.service, &targets, &GenerateOptions::default());
            for program in programs {
                let file = if manifest {
                    &program.manifest
                } else {
                    &program.source
                };
                print!("{}", file.contents);
            }
        }

        Commands::Build {
            input,
            out,
            target,
            host,
            port,
        } => {
            println!("Compiling: {}", input.display());
            let output = load(&input)?;
            println!(
                "  [ok] IR: {} bindings, {} warning(s)",
                output.service.binding_count(),
                output.diagnostics.warning_count()
            );

            let targets = build_targets(target);
            let options = GenerateOptions { host, port };
            let programs = generate_all(&output.service, &targets, &options);

            let written: Vec<(Target, usize)> = programs
                .par_iter()
                .map(|program| Ok((program.target, write_program(&out, program)?)))
                .collect::<Result<_>>()?;
            for (target, count) in written {
                println!(
                    "  [ok] {}: {} files -> {}",
                    target,
                    count,
                    out.join(target.name()).display()
                );
            }

            println!("\nBuild completed!");
        }
    }

    Ok(())
}

/// Requested targets in first-mention order, or every target when none is given
fn build_targets(backends: Vec<Backend>) -> Vec<Target> {
    if backends.is_empty() {
        return Target::all().to_vec();
    }
    let targets: IndexSet<Target> = backends.into_iter().map(Target::from).collect();
    targets.into_iter().collect()
}

fn read_program(input: &Path) -> Result<glyph_ast::Program> {
    let source = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    glyph_ast::from_json(&source)
        .with_context(|| format!("{} is not a valid program", input.display()))
}

fn load(input: &Path) -> Result<BuildOutput> {
    let program = read_program(input)?;
    let output = glyph_ir::build(&program)
        .with_context(|| format!("failed to build {}", input.display()))?;
    tracing::info!(
        service = %output.service.name,
        bindings = output.service.binding_count(),
        warnings = output.diagnostics.warning_count(),
        "built service"
    );
    for diagnostic in output.diagnostics.iter() {
        tracing::debug!("{}", diagnostic.message);
    }
    Ok(output)
}

/// Writes a program under `out/<target>/`, returning the number of files
fn write_program(out: &Path, program: &GeneratedProgram) -> Result<usize> {
    let root = out.join(program.target.name());
    let mut count = 0;
    for file in program.files() {
        let path = root.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, &file.contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), bytes = file.contents.len(), "wrote file");
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use glyph_ir::ServiceIR;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_targets() {
        let cli = Cli::parse_from([
            "glyph", "build", "app.json", "--out", "dist", "-t", "ts", "-t", "rust", "--port", "9000",
        ]);
        match cli.command {
            Commands::Build {
                target, port, out, ..
            } => {
                assert_eq!(target, vec![Backend::TypeScript, Backend::Rust]);
                assert_eq!(port, Some(9000));
                assert_eq!(out, PathBuf::from("dist"));
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_targets_keep_first_mention() {
        let targets = build_targets(vec![Backend::Python, Backend::Rust, Backend::Python]);
        assert_eq!(targets, vec![Target::Python, Target::Rust]);

        let targets = build_targets(vec![Backend::Rust, Backend::TypeScript, Backend::Rust, Backend::TypeScript]);
        assert_eq!(targets, vec![Target::Rust, Target::TypeScript]);

        assert_eq!(build_targets(vec![]), Target::all().to_vec());
    }

    #[test]
    fn test_write_program() {
        let dir = tempfile::tempdir().unwrap();
        let service = ServiceIR::new("empty");
        let programs = generate_all(&service, &[Target::Rust], &GenerateOptions::default());

        let count = write_program(dir.path(), &programs[0]).unwrap();
        assert_eq!(count, 3);
        assert!(dir.path().join("rust/src/main.rs").is_file());
        assert!(dir.path().join("rust/Cargo.toml").is_file());
        assert!(dir.path().join("rust/rustfmt.toml").is_file());
    }
}
