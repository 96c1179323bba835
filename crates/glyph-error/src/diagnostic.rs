//! Diagnostic - compiler-style messages
//!
//! A diagnostic carries:
//! - A severity level and an optional code (W001, B002, ...)
//! - The locations it refers to (a binding, or a path inside one)
//! - Notes and fix hints

use std::fmt::{self, Write as _};

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Stops the build
    Error,
    /// Something was degraded but the build goes on
    Warning,
    Note,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Note => "note",
        }
    }

    /// Bold ANSI color for the level label
    pub fn color_code(&self) -> &'static str {
        match self {
            Level::Error => "\x1b[1;31m",
            Level::Warning => "\x1b[1;33m",
            Level::Note => "\x1b[1;36m",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `B` codes are build errors, `W` codes are fallback warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    pub category: char,
    pub number: u16,
}

impl ErrorCode {
    pub const fn new(category: char, number: u16) -> Self {
        Self { category, number }
    }

    pub const EMPTY_TYPE_NAME: Self = Self::new('B', 1);
    pub const NOT_A_PROVIDER: Self = Self::new('B', 2);
    pub const MISSING_INJECTION_NAME: Self = Self::new('B', 3);
    pub const DUPLICATE_DECLARATION: Self = Self::new('B', 4);
    pub const UNNAMED_CONTRACT_METHOD: Self = Self::new('B', 5);

    pub const UNSUPPORTED_STATEMENT: Self = Self::new('W', 1);
    pub const UNSUPPORTED_EXPRESSION: Self = Self::new('W', 2);
    pub const UNSUPPORTED_PATTERN: Self = Self::new('W', 3);
    pub const UNSUPPORTED_TYPE: Self = Self::new('W', 4);
    pub const UNSUPPORTED_ITEM: Self = Self::new('W', 5);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.category, self.number)
    }
}

/// One reported problem
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{level}: {message}")]
pub struct Diagnostic {
    pub level: Level,
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Where the problem was found, outermost first
    pub locations: Vec<String>,
    pub notes: Vec<String>,
    /// Suggested fixes
    pub help: Vec<String>,
}

impl Diagnostic {
    fn at_level(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            code: None,
            message: message.into(),
            locations: Vec::new(),
            notes: Vec::new(),
            help: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::at_level(Level::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::at_level(Level::Warning, message)
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::at_level(Level::Note, message)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Adds a location, e.g. `route GET /api/users/:id`
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.locations.push(location.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help.push(help.into());
        self
    }
}

/// Terminal renderer:
///
/// ```text
/// warning[W002]: unsupported expression replaced with null
///   --> cron job `cleanup` > body
///    = note: surface construct: quote
/// ```
#[derive(Debug, Clone)]
pub struct DiagnosticRenderer {
    colors: bool,
}

impl Default for DiagnosticRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticRenderer {
    pub fn new() -> Self {
        Self { colors: true }
    }

    pub fn without_colors(self) -> Self {
        self.with_colors(false)
    }

    pub fn with_colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.colors {
            code
        } else {
            ""
        }
    }

    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        let reset = self.paint("\x1b[0m");
        let bold = self.paint("\x1b[1m");
        let mut out = String::new();

        let code = diagnostic
            .code
            .map(|c| format!("[{}]", c))
            .unwrap_or_default();
        // Writing into a String cannot fail
        let _ = writeln!(
            out,
            "{}{}{}{}{}: {}{}",
            self.paint(diagnostic.level.color_code()),
            diagnostic.level,
            code,
            reset,
            bold,
            diagnostic.message,
            reset
        );

        if !diagnostic.locations.is_empty() {
            let _ = writeln!(
                out,
                "  {}-->{} {}",
                self.paint("\x1b[1;34m"),
                reset,
                diagnostic.locations.join(" > ")
            );
        }
        for note in &diagnostic.notes {
            let _ = writeln!(out, "   = {}note{}: {}", bold, reset, note);
        }
        for help in &diagnostic.help {
            let _ = writeln!(out, "   = {}help{}: {}", self.paint("\x1b[1;32m"), reset, help);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_rendering() {
        let diagnostic = Diagnostic::warning("unsupported expression replaced with null")
            .with_code(ErrorCode::UNSUPPORTED_EXPRESSION)
            .with_location("cron job `cleanup`")
            .with_location("body")
            .with_note("surface construct: quote")
            .with_help("rewrite the expression without macros");

        let output = DiagnosticRenderer::new().without_colors().render(&diagnostic);

        assert!(output.starts_with("warning[W002]: unsupported expression"));
        assert!(output.contains("\n  --> cron job `cleanup` > body\n"));
        assert!(output.contains("   = note: surface construct: quote\n"));
        assert!(output.contains("   = help: rewrite the expression"));
    }

    #[test]
    fn test_code_is_optional() {
        let output = DiagnosticRenderer::new()
            .without_colors()
            .render(&Diagnostic::note("nothing to report"));
        assert_eq!(output, "note: nothing to report\n");
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::NOT_A_PROVIDER.to_string(), "B002");
        assert_eq!(ErrorCode::UNSUPPORTED_ITEM.to_string(), "W005");
    }

    #[test]
    fn test_diagnostic_is_an_error() {
        let diagnostic = Diagnostic::error("boom");
        let err: Box<dyn std::error::Error> = Box::new(diagnostic);
        assert_eq!(err.to_string(), "error: boom");
    }

    #[test]
    fn test_colors_wrap_level() {
        let output = DiagnosticRenderer::new().render(&Diagnostic::error("x"));
        assert!(output.starts_with(Level::Error.color_code()));
    }
}
