//! glyph-codegen - Code generation for Glyph services
//!
//! Supports multiple backends:
//! - **Python Backend**: FastAPI application (`main.py`, `requirements.txt`)
//! - **TypeScript Backend**: Express application (`src/app.ts`, `package.json`)
//! - **Rust Backend**: axum application (`src/main.rs`, `Cargo.toml`)
//!
//! Backends share the lowering rules in [`lowering`] and never fail on a
//! valid [`ServiceIR`].
//!
//! # Example
//!
//! ```rust,ignore
//! use glyph_codegen::{generate_all, GenerateOptions, Target};
//!
//! let service = glyph_ir::build_service(&program)?;
//! let programs = generate_all(&service, &Target::all(), &GenerateOptions::default());
//! for program in programs {
//!     println!("{}", program.source.path);
//! }
//! ```

pub mod lowering;
pub mod python_backend;
pub mod rust_backend;
pub mod typescript_backend;
pub mod writer;

pub use python_backend::PythonBackend;
pub use rust_backend::RustBackend;
pub use typescript_backend::TypeScriptBackend;

use glyph_ir::ServiceIR;
use rayon::prelude::*;
use std::fmt;

/// Output language of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Python,
    TypeScript,
    Rust,
}

impl Target {
    pub fn all() -> [Target; 3] {
        [Target::Python, Target::TypeScript, Target::Rust]
    }

    /// Directory-friendly name
    pub fn name(&self) -> &'static str {
        match self {
            Target::Python => "python",
            Target::TypeScript => "typescript",
            Target::Rust => "rust",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Target::Python => 8000,
            Target::TypeScript => 3000,
            Target::Rust => 8080,
        }
    }

    /// Backend for this target configured with `options`
    pub fn backend(&self, options: &GenerateOptions) -> Box<dyn CodeGen> {
        let host = options.host_for(*self);
        let port = options.port_for(*self);
        match self {
            Target::Python => Box::new(PythonBackend::new(host, port)),
            Target::TypeScript => Box::new(TypeScriptBackend::new(host, port)),
            Target::Rust => Box::new(RustBackend::new(host, port)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single output file, path relative to the output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Everything one backend produces for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedProgram {
    pub target: Target,
    pub source: GeneratedFile,
    pub manifest: GeneratedFile,
    pub auxiliary: Vec<GeneratedFile>,
}

impl GeneratedProgram {
    /// Source, manifest, then auxiliary files
    pub fn files(&self) -> impl Iterator<Item = &GeneratedFile> {
        [&self.source, &self.manifest]
            .into_iter()
            .chain(self.auxiliary.iter())
    }
}

/// Trait for code generation backends
pub trait CodeGen: Send + Sync {
    fn target(&self) -> Target;

    /// Generates a runnable program from the service
    fn generate(&self, service: &ServiceIR) -> GeneratedProgram;
}

/// Generation options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Listen address; defaults to `0.0.0.0`
    pub host: Option<String>,
    /// Listen port; defaults per target
    pub port: Option<u16>,
}

impl GenerateOptions {
    pub const DEFAULT_HOST: &'static str = "0.0.0.0";

    pub fn host_for(&self, _target: Target) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_HOST.to_string())
    }

    pub fn port_for(&self, target: Target) -> u16 {
        self.port.unwrap_or_else(|| target.default_port())
    }
}

/// Renders every requested target in parallel, results in request order
pub fn generate_all(
    service: &ServiceIR,
    targets: &[Target],
    options: &GenerateOptions,
) -> Vec<GeneratedProgram> {
    targets
        .par_iter()
        .map(|target| {
            let backend = target.backend(options);
            let program = backend.generate(service);
            tracing::debug!(
                target = %target,
                source_bytes = program.source.contents.len(),
                "generated program"
            );
            program
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let options = GenerateOptions::default();
        assert_eq!(options.port_for(Target::Python), 8000);
        assert_eq!(options.port_for(Target::TypeScript), 3000);
        assert_eq!(options.port_for(Target::Rust), 8080);
        assert_eq!(options.host_for(Target::Rust), "0.0.0.0");

        let options = GenerateOptions {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
        };
        assert_eq!(options.port_for(Target::Python), 9000);
        assert_eq!(options.host_for(Target::Python), "127.0.0.1");
    }

    #[test]
    fn test_generate_all_keeps_request_order() {
        let service = ServiceIR::new("empty");
        let targets = [Target::Rust, Target::Python, Target::TypeScript];
        let programs = generate_all(&service, &targets, &GenerateOptions::default());
        let order: Vec<_> = programs.iter().map(|p| p.target).collect();
        assert_eq!(order, targets.to_vec());
    }

    #[test]
    fn test_output_paths() {
        let service = ServiceIR::new("empty");
        let programs = generate_all(&service, &Target::all(), &GenerateOptions::default());
        let paths: Vec<Vec<&str>> = programs
            .iter()
            .map(|p| p.files().map(|f| f.path.as_str()).collect())
            .collect();
        assert_eq!(paths[0], vec!["main.py", "requirements.txt"]);
        assert_eq!(paths[1], vec!["src/app.ts", "package.json", "tsconfig.json"]);
        assert_eq!(paths[2], vec!["src/main.rs", "Cargo.toml", "rustfmt.toml"]);
    }

    #[test]
    fn test_backends_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn CodeGen>();
    }
}
