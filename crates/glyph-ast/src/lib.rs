//! glyph-ast - Surface syntax tree for Glyph service programs
//!
//! The parser is an external collaborator: it hands the compiler a parsed
//! [`Program`], serialized as JSON. Every node is internally tagged by a
//! `"kind"` field, and every enum has an `Unsupported` catch-all so that a
//! construct this compiler does not know yet still deserializes.
//!
//! # Example
//!
//! ```rust
//! use glyph_ast::{from_json, Item};
//!
//! let program = from_json(r#"{
//!     "items": [
//!         { "kind": "module", "name": "users" },
//!         { "kind": "route", "method": "GET", "path": "/health",
//!           "body": [ { "kind": "return", "value": { "kind": "literal", "value": { "type": "string", "value": "ok" } } } ] }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(program.items.len(), 2);
//! assert!(matches!(program.items[1], Item::Route(_)));
//! ```

pub mod ast;

pub use ast::*;

/// Deserializes a program from its JSON form
pub fn from_json(source: &str) -> Result<Program, serde_json::Error> {
    serde_json::from_str(source)
}

/// Serializes a program to pretty-printed JSON
pub fn to_json(program: &Program) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(program)
}
