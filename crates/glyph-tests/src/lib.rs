//! Integration tests for the Glyph service compiler
//!
//! This crate provides end-to-end testing of the complete compilation pipeline:
//! JSON surface tree → Builder → ServiceIR → Codegen (every backend)

use glyph_ast::Program;
use glyph_codegen::{generate_all, GenerateOptions, GeneratedProgram, Target};
use glyph_error::Diagnostics;
use glyph_ir::{BuildError, ServiceIR};

#[cfg(test)]
mod properties;
#[cfg(test)]
mod scaffolding;

/// The `users` service: a `User` record with an optional `age` and two
/// routes injecting `Database`
pub const USERS_FIXTURE: &str = include_str!("../fixtures/users.json");

/// Result of compiling a Glyph program
#[derive(Debug)]
pub struct CompileResult {
    pub service: ServiceIR,
    /// Warnings produced while building the IR
    pub diagnostics: Diagnostics,
    /// One program per target, in `Target::all()` order
    pub programs: Vec<GeneratedProgram>,
}

impl CompileResult {
    pub fn program(&self, target: Target) -> &GeneratedProgram {
        self.programs
            .iter()
            .find(|p| p.target == target)
            .unwrap_or_else(|| panic!("no {} program", target))
    }

    pub fn source(&self, target: Target) -> &str {
        &self.program(target).source.contents
    }
}

/// Compiles a parsed program for every target
pub fn compile_program(program: &Program) -> Result<CompileResult, BuildError> {
    let output = glyph_ir::build(program)?;
    let programs = generate_all(&output.service, &Target::all(), &GenerateOptions::default());
    Ok(CompileResult {
        service: output.service,
        diagnostics: output.diagnostics,
        programs,
    })
}

/// Compiles a program given as JSON
pub fn compile(source: &str) -> CompileResult {
    let program = glyph_ast::from_json(source)
        .unwrap_or_else(|err| panic!("invalid program JSON: {}", err));
    compile_program(&program).unwrap_or_else(|err| panic!("build failed: {}", err))
}

/// Asserts that the program fails to build
pub fn assert_build_fails(source: &str) -> BuildError {
    let program = glyph_ast::from_json(source)
        .unwrap_or_else(|err| panic!("invalid program JSON: {}", err));
    match glyph_ir::build(&program) {
        Ok(_) => panic!("expected the build to fail"),
        Err(err) => err,
    }
}

/// Asserts that generated source for `target` contains `expected`
pub fn assert_source_contains(result: &CompileResult, target: Target, expected: &str) {
    let source = result.source(target);
    if !source.contains(expected) {
        panic!(
            "Expected {} output to contain:\n{}\n\nGenerated:\n{}",
            target, expected, source
        );
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use glyph_ast::{Expr, Item, ModuleDecl, Route, Stmt};
    use glyph_codegen::lowering::{plan_match, Check};
    use glyph_ir::{ExprIR, LiteralValue, StmtIR};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_users_service_ir() {
        let result = compile(USERS_FIXTURE);
        let service = &result.service;

        assert_eq!(service.name, "users");
        assert_eq!(service.routes.len(), 2);
        assert_eq!(service.providers.len(), 1);
        assert_eq!(service.providers[0].provider_type, "Database");
        assert_eq!(service.routes[0].path_params, vec!["id".to_string()]);
        assert!(result.diagnostics.is_empty());

        let age = service.type_schema("User").and_then(|t| t.field("age")).unwrap();
        assert!(!age.required);
        assert!(!matches!(&age.ty, glyph_ir::TypeRef::Optional(inner) if inner.is_optional()));
    }

    #[test]
    fn test_users_service_python() {
        let result = compile(USERS_FIXTURE);
        assert_source_contains(&result, Target::Python, "class User(BaseModel):");
        assert_source_contains(&result, Target::Python, "    age: Optional[int] = None");
        assert_source_contains(
            &result,
            Target::Python,
            "async def get_api_users_id(id: str, db = Depends(get_db)):",
        );
        assert_source_contains(&result, Target::Python, "\n    user = db.users.Get(id)\n");
        assert_source_contains(
            &result,
            Target::Python,
            "\n    return JSONResponse(content=jsonable_encoder(user))\n",
        );
    }

    #[test]
    fn test_users_service_typescript() {
        let result = compile(USERS_FIXTURE);
        assert_source_contains(&result, Target::TypeScript, "  age?: number;\n");
        let expected = [
            "app.get('/api/users/:id', async (req: Request, res: Response) => {",
            "  const id = req.params.id;",
            "  const db = getDb();",
            "  const user = db.users.Get(id);",
            "  return res.json(user);",
            "});",
        ]
        .join("\n");
        assert_source_contains(&result, Target::TypeScript, &expected);
    }

    #[test]
    fn test_users_service_rust() {
        let result = compile(USERS_FIXTURE);
        assert_source_contains(&result, Target::Rust, "pub struct User {");
        assert_source_contains(&result, Target::Rust, "    pub age: Option<i64>,\n");
        let expected = [
            "async fn get_api_users_id(Path(id): Path<String>) -> Response {",
            "    let id = json!(id);",
            "    let db = get_db().await;",
            "    let user = db.users.Get(&[id.clone()]);",
            "    return Json(user.clone()).into_response();",
            "}",
        ]
        .join("\n");
        assert_source_contains(&result, Target::Rust, &expected);
        assert_source_contains(
            &result,
            Target::Rust,
            "async fn post_api_users(Json(input): Json<User>) -> Response {",
        );
        assert_source_contains(
            &result,
            Target::Rust,
            "return (StatusCode::CREATED, Json(db.users.Create(&[input.clone()]))).into_response();",
        );
    }

    #[test]
    fn test_manifests() {
        let result = compile(USERS_FIXTURE);
        let python = &result.program(Target::Python).manifest;
        assert_eq!(python.path, "requirements.txt");
        assert!(python.contents.contains("fastapi"));

        let typescript = &result.program(Target::TypeScript).manifest;
        assert_eq!(typescript.path, "package.json");
        assert!(typescript.contents.contains("\"pg\""));

        let rust = &result.program(Target::Rust).manifest;
        assert_eq!(rust.path, "Cargo.toml");
        assert!(rust.contents.contains("name = \"users\""));
        assert!(rust.contents.contains("sqlx = "));
    }

    #[test]
    fn test_nested_path_params() {
        let program = Program::new(vec![Item::Route(Route {
            path: "/api/users/:id/posts/:postId".to_string(),
            body: vec![Stmt::ret(Expr::var("postId"))],
            ..Route::default()
        })]);
        let result = compile_program(&program).unwrap();

        assert_eq!(result.service.name, glyph_ir::builder::DEFAULT_SERVICE_NAME);
        assert_eq!(
            result.service.routes[0].path_params,
            vec!["id".to_string(), "postId".to_string()]
        );
        assert_source_contains(&result, Target::Python, "@app.get(\"/api/users/{id}/posts/{postId}\")");
        assert_source_contains(&result, Target::TypeScript, "app.get('/api/users/:id/posts/:postId'");
        assert_source_contains(&result, Target::Rust, "Path((id, postId)): Path<(String, String)>");
    }

    #[test]
    fn test_return_depends_on_context() {
        let program = glyph_ast::from_json(
            r#"{
                "items": [
                    { "kind": "route", "method": "GET", "path": "/ping",
                      "body": [ { "kind": "return", "value": { "kind": "literal", "value": { "type": "string", "value": "pong" } } } ] },
                    { "kind": "function", "name": "ping",
                      "body": [ { "kind": "return", "value": { "kind": "literal", "value": { "type": "string", "value": "pong" } } } ] }
                ]
            }"#,
        )
        .unwrap();
        let result = compile_program(&program).unwrap();

        assert_source_contains(&result, Target::Python, "return JSONResponse(content=jsonable_encoder(\"pong\"))");
        assert_source_contains(&result, Target::Python, "def ping():\n    return \"pong\"");
        assert_source_contains(&result, Target::TypeScript, "return res.json('pong');");
        assert_source_contains(&result, Target::Rust, "return Json(json!(\"pong\")).into_response();");
        assert_source_contains(&result, Target::Rust, "fn ping() -> Value {\n    return json!(\"pong\");\n}");
    }

    #[test]
    fn test_match_arms_keep_source_order() {
        let program = glyph_ast::from_json(
            r#"{
                "items": [
                    { "kind": "function", "name": "label",
                      "params": [ { "name": "x" } ],
                      "body": [ { "kind": "return", "value": {
                          "kind": "match",
                          "value": { "kind": "var", "name": "x" },
                          "cases": [
                              { "pattern": { "kind": "literal", "value": { "type": "int", "value": 1 } },
                                "body": { "kind": "literal", "value": { "type": "string", "value": "a" } } },
                              { "pattern": { "kind": "literal", "value": { "type": "int", "value": 2 } },
                                "body": { "kind": "literal", "value": { "type": "string", "value": "b" } } },
                              { "pattern": { "kind": "wildcard" },
                                "body": { "kind": "literal", "value": { "type": "string", "value": "other" } } },
                              { "pattern": { "kind": "literal", "value": { "type": "int", "value": 3 } },
                                "body": { "kind": "literal", "value": { "type": "string", "value": "c" } } }
                          ] } } ] }
                ]
            }"#,
        )
        .unwrap();
        let result = compile_program(&program).unwrap();

        let StmtIR::Return(ExprIR::Match(m)) = &result.service.functions[0].body[0] else {
            panic!("expected a returned match");
        };
        let plan = plan_match(m);
        let tested: Vec<&Check> = plan.arms.iter().flat_map(|arm| &arm.checks).collect();
        assert_eq!(
            tested,
            vec![
                &Check::Equals(vec![], LiteralValue::Int(1)),
                &Check::Equals(vec![], LiteralValue::Int(2)),
                &Check::Equals(vec![], LiteralValue::Int(3)),
            ]
        );
        assert!(plan.default.is_some());

        let rust = result.source(Target::Rust);
        let positions: Vec<usize> = ["json!(\"a\")", "json!(\"b\")", "json!(\"c\")", "json!(\"other\")"]
            .iter()
            .map(|needle| rust.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", rust);
    }

    #[test]
    fn test_programs_built_from_ast_values() {
        let program = Program::new(vec![
            Item::Module(ModuleDecl {
                name: "health".to_string(),
            }),
            Item::Route(Route {
                path: "/health".to_string(),
                body: vec![Stmt::ret(Expr::string("ok"))],
                ..Route::default()
            }),
        ]);
        let result = compile_program(&program).unwrap();
        assert_eq!(result.service.name, "health");
        assert_eq!(result.programs.len(), 3);
        assert_source_contains(&result, Target::Rust, ".route(\"/health\", get(get_health))");
    }

    #[test]
    fn test_written_output_tree() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile(USERS_FIXTURE);
        for program in &result.programs {
            for file in program.files() {
                let path = dir.path().join(program.target.name()).join(&file.path);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, &file.contents).unwrap();
            }
        }

        for path in [
            "python/main.py",
            "python/requirements.txt",
            "typescript/src/app.ts",
            "typescript/package.json",
            "typescript/tsconfig.json",
            "rust/src/main.rs",
            "rust/Cargo.toml",
            "rust/rustfmt.toml",
        ] {
            assert!(dir.path().join(path).is_file(), "missing {}", path);
        }
        let written = std::fs::read_to_string(dir.path().join("rust/src/main.rs")).unwrap();
        assert_eq!(written, result.source(Target::Rust));
    }
}
