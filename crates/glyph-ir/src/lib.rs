//! glyph-ir - Semantic Intermediate Representation of Glyph services
//!
//! The IR is a target-neutral description of one service:
//! - Typed records and the providers the service depends on
//! - One list per binding kind (routes, jobs, resolvers, ...)
//! - Statement and expression trees as closed sum types
//!
//! # Architecture
//!
//! ```text
//! Program (glyph-ast)
//!         ↓
//!     [Builder]   pass 1: types, provider contracts
//!         ↓       pass 2: bindings, injections
//!    ServiceIR
//!    ├── Types
//!    ├── Providers (deduplicated)
//!    ├── Routes / GraphQL / gRPC / WebSocket
//!    ├── Cron / Events / Queues
//!    └── Commands / Functions / Constants
//!         ↓
//!     [Codegen]
//!         ↓
//!   Python / TypeScript / Rust (glyph-codegen)
//! ```

pub mod builder;
pub mod error;
pub mod expr;
pub mod module;
pub mod types;

pub use builder::{build, build_service, extract_path_params, BuildOutput, IrBuilder};
pub use error::{BuildError, ConversionError};
pub use expr::{
    body_awaits, BinOp, CallExpr, ExprIR, LambdaBody, LambdaExpr, LiteralValue, MatchCase, MatchExpr,
    ObjectField, ObjectPatternField, PatternIR, StmtIR, SwitchCase, UnOp,
};
pub use module::*;
pub use types::{Annotation, FieldSchema, MethodSchema, TypeRef, TypeSchema};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_serializes_as_tagged_json() {
        let stmt = StmtIR::Return(ExprIR::call("Get", vec![ExprIR::var("id")]));
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["Return"]["Call"]["name"], "Get");
        assert_eq!(json["Return"]["Call"]["args"][0]["Var"], "id");

        let ty = TypeRef::array(TypeRef::named("User"));
        assert_eq!(serde_json::to_value(&ty).unwrap()["Array"]["Named"], "User");
    }

    #[test]
    fn test_service_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceIR>();
    }
}
