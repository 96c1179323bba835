//! glyph-error - Diagnostics for the Glyph service compiler
//!
//! Fatal build failures are typed errors owned by the crate that raises them
//! (see `glyph_ir::BuildError`). This crate carries everything that is
//! reported *without* stopping compilation: fallback warnings, notes and
//! hints, collected into a [`Diagnostics`] list and rendered for a terminal.
//!
//! # Example
//!
//! ```rust
//! use glyph_error::{Diagnostic, DiagnosticRenderer, ErrorCode};
//!
//! let diagnostic = Diagnostic::warning("unsupported statement replaced with a no-op")
//!     .with_code(ErrorCode::UNSUPPORTED_STATEMENT)
//!     .with_location("route GET /api/users/:id");
//!
//! let rendered = DiagnosticRenderer::new().without_colors().render(&diagnostic);
//! assert!(rendered.starts_with("warning[W001]"));
//! ```

pub mod diagnostic;

pub use diagnostic::{Diagnostic, DiagnosticRenderer, ErrorCode, Level};

/// Collection of diagnostics accumulated during compilation
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.items.push(Diagnostic::error(message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.items.push(Diagnostic::warning(message));
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.level == Level::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.level == Level::Warning)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// Appends every diagnostic from `other`, keeping their order
    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    /// Renders all diagnostics
    pub fn render(&self, renderer: &DiagnosticRenderer) -> String {
        self.items
            .iter()
            .map(|d| renderer.render(d))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_counts() {
        let mut diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());

        diagnostics.warning("first");
        diagnostics.warning("second");
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics.warning_count(), 2);
        assert!(!diagnostics.has_errors());

        diagnostics.error("fatal");
        assert!(diagnostics.has_errors());
    }

    #[test]
    fn test_extend_preserves_order() {
        let mut first = Diagnostics::new();
        first.warning("a");
        let mut second = Diagnostics::new();
        second.warning("b");
        second.warning("c");

        first.extend(second);
        let messages: Vec<_> = first.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }
}
