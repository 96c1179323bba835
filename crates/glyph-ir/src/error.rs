//! Build errors

use glyph_error::{Diagnostic, ErrorCode};
use thiserror::Error;

use crate::module::BindingKind;

/// A signature-level failure inside one binding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("named type with an empty name")]
    EmptyTypeName,

    #[error("injection `{name}` has type `{ty}`, which is not a provider")]
    NotAProvider { name: String, ty: String },

    #[error("injection of `{ty}` has no local name")]
    MissingInjectionName { ty: String },

    #[error("`{0}` is declared more than once")]
    DuplicateDeclaration(String),

    #[error("contract method #{0} has no name")]
    UnnamedContractMethod(usize),
}

impl ConversionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConversionError::EmptyTypeName => ErrorCode::EMPTY_TYPE_NAME,
            ConversionError::NotAProvider { .. } => ErrorCode::NOT_A_PROVIDER,
            ConversionError::MissingInjectionName { .. } => ErrorCode::MISSING_INJECTION_NAME,
            ConversionError::DuplicateDeclaration(_) => ErrorCode::DUPLICATE_DECLARATION,
            ConversionError::UnnamedContractMethod(_) => ErrorCode::UNNAMED_CONTRACT_METHOD,
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            ConversionError::NotAProvider { ty, .. } => Some(format!(
                "`{}` is neither a built-in provider nor a declared provider contract",
                ty
            )),
            ConversionError::MissingInjectionName { .. } => {
                Some("an injection binds a provider to a local name".to_string())
            }
            _ => None,
        }
    }

    fn help(&self) -> &'static str {
        match self {
            ConversionError::EmptyTypeName => "give the type a name",
            ConversionError::NotAProvider { .. } => {
                "inject Database, Redis, MongoDB, LLM or a type declared with `provider`"
            }
            ConversionError::MissingInjectionName { .. } => "write the injection as `name: Provider`",
            ConversionError::DuplicateDeclaration(_) => "rename or remove one of the declarations",
            ConversionError::UnnamedContractMethod(_) => "give every contract method a name",
        }
    }
}

/// Aborts the build, naming the binding that failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("in {kind} `{name}`: {source}")]
pub struct BuildError {
    pub kind: BindingKind,
    pub name: String,
    #[source]
    pub source: ConversionError,
}

impl BuildError {
    pub fn new(kind: BindingKind, name: impl Into<String>, source: ConversionError) -> Self {
        Self {
            kind,
            name: name.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.source.code()
    }

    /// Error diagnostic located at `origin` (usually the program file), then the binding
    pub fn diagnostic(&self, origin: impl Into<String>) -> Diagnostic {
        let mut diagnostic = Diagnostic::error(self.source.to_string())
            .with_code(self.code())
            .with_location(origin)
            .with_location(format!("{} `{}`", self.kind, self.name));
        if let Some(note) = self.source.note() {
            diagnostic = diagnostic.with_note(note);
        }
        diagnostic.with_help(self.source.help())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_message() {
        let err = BuildError::new(
            BindingKind::Route,
            "GET /api/users/:id",
            ConversionError::NotAProvider {
                name: "limit".to_string(),
                ty: "int".to_string(),
            },
        );
        assert_eq!(
            err.to_string(),
            "in route `GET /api/users/:id`: injection `limit` has type `int`, which is not a provider"
        );
        assert_eq!(err.code(), ErrorCode::NOT_A_PROVIDER);
    }

    #[test]
    fn test_build_error_diagnostic() {
        let err = BuildError::new(
            BindingKind::CronJob,
            "cleanup",
            ConversionError::NotAProvider {
                name: "limit".to_string(),
                ty: "int".to_string(),
            },
        );
        let diagnostic = err.diagnostic("app.json");

        assert_eq!(diagnostic.level, glyph_error::Level::Error);
        assert_eq!(diagnostic.code, Some(ErrorCode::NOT_A_PROVIDER));
        assert_eq!(diagnostic.message, "injection `limit` has type `int`, which is not a provider");
        assert_eq!(diagnostic.locations, vec!["app.json".to_string(), "cron job `cleanup`".to_string()]);
        assert_eq!(
            diagnostic.notes,
            vec!["`int` is neither a built-in provider nor a declared provider contract".to_string()]
        );
        assert_eq!(diagnostic.help.len(), 1);

        let rendered = glyph_error::DiagnosticRenderer::new().without_colors().render(&diagnostic);
        assert!(rendered.starts_with("error[B002]: injection `limit`"));
        assert!(rendered.contains("  --> app.json > cron job `cleanup`\n"));
        assert!(rendered.contains("   = help: inject Database, Redis, MongoDB, LLM"));
    }

    #[test]
    fn test_duplicate_declaration_has_no_note() {
        let err = BuildError::new(
            BindingKind::Type,
            "User",
            ConversionError::DuplicateDeclaration("User".to_string()),
        );
        let diagnostic = err.diagnostic("app.json");
        assert!(diagnostic.notes.is_empty());
        assert_eq!(diagnostic.help, vec!["rename or remove one of the declarations".to_string()]);
    }
}
