//! Rust Backend - Generates an axum application
//!
//! Handlers work on `serde_json::Value`: every expression renders to an
//! owned `Value` and the small `rt` module emitted at the top of `main.rs`
//! supplies the dynamic operators. Records become serde structs used to
//! validate request bodies. Providers are reached through `get_x().await`.

use crate::lowering::*;
use crate::python_backend::without_trailing_break;
use crate::writer::SourceBuffer;
use crate::{CodeGen, GeneratedFile, GeneratedProgram, Target};
use glyph_ir::*;
use heck::{ToKebabCase, ToLowerCamelCase, ToSnakeCase};
use std::collections::{HashMap, HashSet};

const INDENT: &str = "    ";

/// Operations every table handle supports
const TABLE_METHODS: [&str; 6] = ["Get", "Find", "Create", "Update", "Delete", "Where"];

const RUNTIME: &str = r#"/// Dynamic value helpers used by the handlers below
mod rt {
    use serde_json::{json, Value};
    use std::cmp::Ordering;

    pub fn truthy(value: &Value) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    pub fn text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn arith(
        a: &Value,
        b: &Value,
        int: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> Value {
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            if let Some(result) = int(x, y) {
                return json!(result);
            }
        }
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => json!(float(x, y)),
            _ => Value::Null,
        }
    }

    pub fn add(a: &Value, b: &Value) -> Value {
        match (a, b) {
            (Value::String(x), y) => Value::String(format!("{}{}", x, text(y))),
            (x, Value::String(y)) => Value::String(format!("{}{}", text(x), y)),
            (Value::Array(x), Value::Array(y)) => Value::Array(x.iter().chain(y).cloned().collect()),
            _ => arith(a, b, i64::checked_add, |x, y| x + y),
        }
    }

    pub fn sub(a: &Value, b: &Value) -> Value {
        arith(a, b, i64::checked_sub, |x, y| x - y)
    }

    pub fn mul(a: &Value, b: &Value) -> Value {
        arith(a, b, i64::checked_mul, |x, y| x * y)
    }

    pub fn div(a: &Value, b: &Value) -> Value {
        arith(
            a,
            b,
            |x, y| x.checked_rem(y).filter(|r| *r == 0).and_then(|_| x.checked_div(y)),
            |x, y| x / y,
        )
    }

    pub fn rem(a: &Value, b: &Value) -> Value {
        arith(a, b, i64::checked_rem, |x, y| x % y)
    }

    pub fn neg(a: &Value) -> Value {
        sub(&json!(0), a)
    }

    pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    pub fn lt(a: &Value, b: &Value) -> bool {
        compare(a, b) == Some(Ordering::Less)
    }

    pub fn le(a: &Value, b: &Value) -> bool {
        matches!(compare(a, b), Some(Ordering::Less | Ordering::Equal))
    }

    pub fn gt(a: &Value, b: &Value) -> bool {
        compare(a, b) == Some(Ordering::Greater)
    }

    pub fn ge(a: &Value, b: &Value) -> bool {
        matches!(compare(a, b), Some(Ordering::Greater | Ordering::Equal))
    }

    pub fn field(value: &Value, name: &str) -> Value {
        value.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn index(value: &Value, key: &Value) -> Value {
        match key {
            Value::String(name) => field(value, name),
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| value.get(i as usize))
                .cloned()
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn rest(value: &Value, from: usize) -> Value {
        match value.as_array() {
            Some(items) => Value::Array(items.iter().skip(from).cloned().collect()),
            None => Value::Null,
        }
    }

    pub fn iter(value: &Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.values().cloned().collect(),
            Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            _ => Vec::new(),
        }
    }

    pub fn entries(value: &Value) -> Vec<(Value, Value)> {
        match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (json!(i), v.clone()))
                .collect(),
            Value::Object(map) => map.iter().map(|(k, v)| (json!(k), v.clone())).collect(),
            _ => Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }

    pub fn len(value: &Value) -> Value {
        match value {
            Value::String(s) => json!(s.chars().count()),
            Value::Array(a) => json!(a.len()),
            Value::Object(o) => json!(o.len()),
            _ => json!(0),
        }
    }

    pub fn map(value: &Value, f: impl Fn(Value) -> Value) -> Value {
        Value::Array(iter(value).into_iter().map(f).collect())
    }

    pub fn filter(value: &Value, f: impl Fn(Value) -> Value) -> Value {
        Value::Array(
            iter(value)
                .into_iter()
                .filter(|item| truthy(&f(item.clone())))
                .collect(),
        )
    }

    pub fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Value {
        match (name, receiver) {
            ("len" | "length" | "count", _) => len(receiver),
            ("keys", Value::Object(map)) => map.keys().map(|k| json!(k)).collect(),
            ("values", Value::Object(map)) => map.values().cloned().collect(),
            ("upper" | "toUpperCase", Value::String(s)) => json!(s.to_uppercase()),
            ("lower" | "toLowerCase", Value::String(s)) => json!(s.to_lowercase()),
            ("trim", Value::String(s)) => json!(s.trim()),
            ("contains" | "includes", Value::Array(items)) => {
                json!(args.first().is_some_and(|x| items.contains(x)))
            }
            ("contains" | "includes", Value::String(s)) => {
                json!(args.first().and_then(Value::as_str).is_some_and(|x| s.contains(x)))
            }
            ("get", _) => args.first().map(|key| index(receiver, key)).unwrap_or(Value::Null),
            _ => {
                tracing::warn!(method = name, "unsupported method call");
                Value::Null
            }
        }
    }

    pub fn call(name: &str, args: &[Value]) -> Value {
        match (name, args) {
            ("len", [value]) => len(value),
            ("str" | "String", [value]) => json!(text(value)),
            ("print" | "log" | "console.log", _) => {
                let line: Vec<String> = args.iter().map(text).collect();
                tracing::info!("{}", line.join(" "));
                Value::Null
            }
            _ => {
                tracing::warn!(function = name, "unknown function");
                Value::Null
            }
        }
    }
}"#;

/// Rust code generation backend
#[derive(Debug, Clone)]
pub struct RustBackend {
    host: String,
    port: u16,
}

impl RustBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn cargo_toml(&self, service: &ServiceIR, features: &FeatureSet) -> String {
        let mut name = service.name.to_kebab_case();
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            name = format!("glyph-{}", name).trim_end_matches('-').to_string();
        }
        let mut out = vec![
            "[package]".to_string(),
            format!("name = \"{}\"", name),
            "version = \"0.1.0\"".to_string(),
            "edition = \"2021\"".to_string(),
            String::new(),
            "[dependencies]".to_string(),
        ];
        for (name, spec) in dependencies(features) {
            out.push(format!("{} = {}", name, spec));
        }
        let mut text = out.join("\n");
        text.push('\n');
        text
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new("0.0.0.0", Target::Rust.default_port())
    }
}

impl CodeGen for RustBackend {
    fn target(&self) -> Target {
        Target::Rust
    }

    fn generate(&self, service: &ServiceIR) -> GeneratedProgram {
        let features = FeatureSet::of(service);
        let source = Emitter::new(self, service, features).emit();

        let mut auxiliary = vec![GeneratedFile::new(
            "rustfmt.toml",
            "edition = \"2021\"\nmax_width = 100\n",
        )];
        if features.grpc {
            auxiliary.push(GeneratedFile::new(proto_path(service), proto_file(service)));
        }

        GeneratedProgram {
            target: Target::Rust,
            source: GeneratedFile::new("src/main.rs", source),
            manifest: GeneratedFile::new("Cargo.toml", self.cargo_toml(service, &features)),
            auxiliary,
        }
    }
}

/// `(crate, TOML value)` pairs for a feature set, each crate listed once
pub fn dependencies(features: &FeatureSet) -> Vec<(&'static str, &'static str)> {
    let mut deps: Vec<(&'static str, &'static str)> = Vec::new();
    let mut add = |name: &'static str, spec: &'static str| {
        if !deps.iter().any(|(n, _)| *n == name) {
            deps.push((name, spec));
        }
    };

    add("axum", r#"{ version = "0.7", features = ["ws", "macros"] }"#);
    add("tokio", r#"{ version = "1", features = ["full"] }"#);
    add("serde", r#"{ version = "1", features = ["derive"] }"#);
    add("serde_json", r#""1""#);
    add("tracing", r#""0.1""#);
    add("tracing-subscriber", r#""0.3""#);
    if features.database {
        add("sqlx", r#"{ version = "0.7", features = ["runtime-tokio", "postgres"] }"#);
    }
    if features.redis {
        add("redis", r#""0.25""#);
    }
    if features.mongo {
        add("mongodb", r#""2.8""#);
    }
    if features.llm {
        add("reqwest", r#"{ version = "0.12", features = ["json"] }"#);
    }
    if features.cron {
        add("tokio-cron-scheduler", r#""0.10""#);
    }
    if features.graphql {
        add("async-graphql", r#""7""#);
        add("async-graphql-axum", r#""7""#);
    }
    if features.subscriptions {
        add("futures", r#""0.3""#);
    }
    if features.grpc {
        add("tonic", r#""0.11""#);
        add("prost", r#""0.12""#);
    }
    if features.websocket {
        add("futures", r#""0.3""#);
        add("uuid", r#"{ version = "1", features = ["v4"] }"#);
    }
    deps
}

const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "dyn", "else", "enum", "extern", "false",
    "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref",
    "return", "static", "struct", "trait", "true", "type", "unsafe", "use", "where", "while",
    "abstract", "become", "box", "do", "final", "macro", "override", "priv", "try", "typeof",
    "unsized", "virtual", "yield",
];

/// A name usable as a Rust identifier
pub fn rust_ident(name: &str) -> String {
    match name {
        "self" | "Self" | "super" | "crate" | "_" => format!("{}_", name),
        n if KEYWORDS.contains(&n) => format!("r#{}", n),
        n => n.to_string(),
    }
}

/// Rust spelling of a type; anything without a static counterpart is `Value`
pub fn rust_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int => "i64".to_string(),
        TypeRef::Float => "f64".to_string(),
        TypeRef::String => "String".to_string(),
        TypeRef::Bool => "bool".to_string(),
        TypeRef::Array(inner) => format!("Vec<{}>", rust_type(inner, service)),
        TypeRef::Optional(inner) => format!("Option<{}>", rust_type(inner, service)),
        TypeRef::Future(inner) => rust_type(inner, service),
        TypeRef::Generic { name, args } => match (name.as_str(), args.as_slice()) {
            ("List" | "Array", [inner]) => format!("Vec<{}>", rust_type(inner, service)),
            ("Map" | "Dict" | "Record", [_, value]) => {
                format!("HashMap<String, {}>", rust_type(value, service))
            }
            (_, []) => name.clone(),
            _ => {
                let args: Vec<String> = args.iter().map(|a| rust_type(a, service)).collect();
                format!("{}<{}>", name, args.join(", "))
            }
        },
        TypeRef::Named(name) | TypeRef::Provider(name) => name.clone(),
        TypeRef::Any | TypeRef::Union(_) | TypeRef::Function { .. } => "Value".to_string(),
    }
}

/// `<T: Serialize, U: Serialize>`, the bound every generic needs to cross into `Value`
fn serialize_bounds(type_params: &[String]) -> String {
    if type_params.is_empty() {
        return String::new();
    }
    let bounded: Vec<String> = type_params.iter().map(|t| format!("{}: Serialize", t)).collect();
    format!("<{}>", bounded.join(", "))
}

fn json_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int(v) => format!("json!({})", v),
        LiteralValue::Float(v) if v.is_finite() => format!("json!({})", render_float(*v)),
        LiteralValue::Float(_) | LiteralValue::Null => "Value::Null".to_string(),
        LiteralValue::String(v) => format!("json!({})", quote(v, '"')),
        LiteralValue::Bool(v) => format!("json!({})", v),
    }
}

fn auth_comment(auth: &AuthRequirement) -> String {
    if auth.roles.is_empty() {
        format!("// Requires {} authentication", auth.auth_type)
    } else {
        format!(
            "// Requires {} authentication (roles: {})",
            auth.auth_type,
            auth.roles.join(", ")
        )
    }
}

/// Parses a raw request or CLI string held in `var` into a `Value`
fn parse_raw(var: &str, ty: &TypeRef) -> String {
    match ty.without_optional() {
        TypeRef::String => format!("Value::String({}.to_string())", var),
        _ => format!("rt::parse(&{})", var),
    }
}

// ========================================
// IR walks
// ========================================

fn visit_body<'e>(body: &'e [StmtIR], f: &mut impl FnMut(&'e ExprIR)) {
    for stmt in body {
        match stmt {
            StmtIR::Assign { value, .. }
            | StmtIR::Reassign { value, .. }
            | StmtIR::Return(value)
            | StmtIR::Expr(value)
            | StmtIR::Validate(value) => visit_expr(value, f),
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => {
                visit_expr(condition, f);
                visit_body(then_body, f);
                visit_body(else_body, f);
            }
            StmtIR::For { iterable, body, .. } => {
                visit_expr(iterable, f);
                visit_body(body, f);
            }
            StmtIR::While { condition, body } => {
                visit_expr(condition, f);
                visit_body(body, f);
            }
            StmtIR::Switch {
                value,
                cases,
                default,
            } => {
                visit_expr(value, f);
                for case in cases {
                    visit_expr(&case.value, f);
                    visit_body(&case.body, f);
                }
                visit_body(default, f);
            }
            StmtIR::Break | StmtIR::Continue => {}
        }
    }
}

fn visit_expr<'e>(expr: &'e ExprIR, f: &mut impl FnMut(&'e ExprIR)) {
    f(expr);
    match expr {
        ExprIR::Binary { left, right, .. } | ExprIR::Pipe { left, right } => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        ExprIR::Unary { operand, .. } => visit_expr(operand, f),
        ExprIR::FieldAccess { object, .. } => visit_expr(object, f),
        ExprIR::IndexAccess { object, index } => {
            visit_expr(object, f);
            visit_expr(index, f);
        }
        ExprIR::Call(call) => call.args.iter().for_each(|a| visit_expr(a, f)),
        ExprIR::Object(fields) => fields.iter().for_each(|field| visit_expr(&field.value, f)),
        ExprIR::Array(elements) => elements.iter().for_each(|e| visit_expr(e, f)),
        ExprIR::Lambda(lambda) => match &lambda.body {
            LambdaBody::Expr(body) => visit_expr(body, f),
            LambdaBody::Block(body) => visit_body(body, f),
        },
        ExprIR::Match(m) => {
            visit_expr(&m.value, f);
            for case in &m.cases {
                if let Some(guard) = &case.guard {
                    visit_expr(guard, f);
                }
                visit_expr(&case.body, f);
            }
        }
        ExprIR::Async(body) => visit_body(body, f),
        ExprIR::Await(inner) => visit_expr(inner, f),
        ExprIR::Int(_)
        | ExprIR::Float(_)
        | ExprIR::String(_)
        | ExprIR::Bool(_)
        | ExprIR::Null
        | ExprIR::Var(_) => {}
    }
}

fn awaits_here(expr: &ExprIR, async_fns: &HashSet<String>) -> bool {
    match expr {
        ExprIR::Await(_) | ExprIR::Async(_) => true,
        ExprIR::Call(call) => async_fns.contains(&call.name),
        ExprIR::Pipe { left, right } => match lower_pipe(left, right) {
            PipeCall::Call { name, .. } => async_fns.contains(&name),
            PipeCall::Apply { .. } => false,
        },
        _ => false,
    }
}

/// Whether a body must run in an async context given the async functions
fn needs_async(body: &[StmtIR], async_fns: &HashSet<String>) -> bool {
    let mut found = false;
    visit_body(body, &mut |expr| found |= awaits_here(expr, async_fns));
    found
}

fn expr_needs_async(expr: &ExprIR, async_fns: &HashSet<String>) -> bool {
    let mut found = false;
    visit_expr(expr, &mut |e| found |= awaits_here(e, async_fns));
    found
}

/// `db.users` → `("db", ["users"])`
fn provider_path<'e>(expr: &'e ExprIR) -> Option<(&'e str, Vec<&'e str>)> {
    match expr {
        ExprIR::Var(name) => Some((name.as_str(), Vec::new())),
        ExprIR::FieldAccess { object, field } => {
            let (root, mut fields) = provider_path(object)?;
            fields.push(field.as_str());
            Some((root, fields))
        }
        _ => None,
    }
}

/// Tables and methods the service touches on each provider
#[derive(Debug, Default)]
struct ProviderUsage {
    tables: Vec<String>,
    table_methods: Vec<String>,
    methods: HashMap<String, Vec<String>>,
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}

impl ProviderUsage {
    fn scan(service: &ServiceIR) -> Self {
        let mut usage = ProviderUsage::default();
        for method in TABLE_METHODS {
            push_unique(&mut usage.table_methods, method);
        }
        let mut bindings: Vec<(&[InjectionRef], &[StmtIR])> = Vec::new();
        bindings.extend(service.routes.iter().map(|r| (r.providers.as_slice(), r.body.as_slice())));
        bindings.extend(service.events.iter().map(|e| (e.providers.as_slice(), e.body.as_slice())));
        bindings.extend(service.cron_jobs.iter().map(|j| (j.providers.as_slice(), j.body.as_slice())));
        bindings.extend(service.queues.iter().map(|q| (q.providers.as_slice(), q.body.as_slice())));
        bindings.extend(service.graphql.iter().map(|g| (g.providers.as_slice(), g.body.as_slice())));
        for def in &service.grpc {
            bindings.extend(def.handlers.iter().map(|h| (h.providers.as_slice(), h.body.as_slice())));
        }

        for (providers, body) in bindings {
            let types: HashMap<&str, &str> = providers
                .iter()
                .map(|p| (p.name.as_str(), p.provider_type.as_str()))
                .collect();
            visit_body(body, &mut |expr| match expr {
                ExprIR::FieldAccess { object, field } => {
                    if let ExprIR::Var(root) = object.as_ref() {
                        if types.get(root.as_str()) == Some(&"Database") {
                            push_unique(&mut usage.tables, field);
                        }
                    }
                }
                ExprIR::Call(call) => {
                    if let CallShape::Method { receiver, name, .. } = classify_call(call) {
                        let Some((root, fields)) = provider_path(receiver) else {
                            return;
                        };
                        let Some(ty) = types.get(root) else {
                            return;
                        };
                        match (fields.as_slice(), *ty) {
                            ([], ty) => push_unique(usage.methods.entry(ty.to_string()).or_default(), name),
                            ([_], "Database") => push_unique(&mut usage.table_methods, name),
                            _ => {}
                        }
                    }
                }
                _ => {}
            });
        }
        usage
    }
}

#[derive(Debug, Clone)]
struct FnInfo {
    params: Vec<FieldSchema>,
    is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstKind {
    /// `pub const` of a primitive type
    Literal,
    /// `LazyLock<Value>`
    Lazy,
    /// Lambda constant rendered as a function
    Function,
}

/// Per-generation state; hoisted helpers are numbered in emission order
struct Emitter<'a> {
    backend: &'a RustBackend,
    service: &'a ServiceIR,
    features: FeatureSet,
    usage: ProviderUsage,
    functions: HashMap<String, FnInfo>,
    /// Callees whose calls render with `.await`
    async_calls: HashSet<String>,
    constants: HashMap<String, ConstKind>,
    hoisted: usize,
    mutable: HashSet<String>,
    closures: HashSet<String>,
    /// Injected provider variables of the binding being rendered
    providers: HashMap<String, String>,
    route_status: Option<u16>,
    in_method: bool,
}

impl<'a> Emitter<'a> {
    fn new(backend: &'a RustBackend, service: &'a ServiceIR, features: FeatureSet) -> Self {
        let mut constants = HashMap::new();
        let mut bodies: Vec<(String, Vec<FieldSchema>, Vec<StmtIR>)> = Vec::new();
        for constant in &service.constants {
            let kind = match &constant.value {
                ExprIR::Lambda(lambda) => {
                    let body = match &lambda.body {
                        LambdaBody::Expr(e) => vec![StmtIR::Return((**e).clone())],
                        LambdaBody::Block(b) => b.clone(),
                    };
                    bodies.push((constant.name.clone(), lambda.params.clone(), body));
                    ConstKind::Function
                }
                ExprIR::Int(_) | ExprIR::Float(_) | ExprIR::String(_) | ExprIR::Bool(_) => {
                    ConstKind::Literal
                }
                _ => ConstKind::Lazy,
            };
            constants.insert(constant.name.clone(), kind);
        }
        for function in &service.functions {
            bodies.push((function.name.clone(), function.params.clone(), function.body.clone()));
        }

        let mut async_fns: HashSet<String> = [
            ("emit", features.events),
            ("enqueue", features.queues),
            ("broadcast", features.websocket),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .map(|(name, _)| name.to_string())
        .collect();
        loop {
            let mut changed = false;
            for (name, _, body) in &bodies {
                if !async_fns.contains(name) && needs_async(body, &async_fns) {
                    async_fns.insert(name.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let functions = bodies
            .into_iter()
            .map(|(name, params, _)| {
                let is_async = async_fns.contains(&name);
                (name, FnInfo { params, is_async })
            })
            .collect();

        Self {
            backend,
            service,
            features,
            usage: ProviderUsage::scan(service),
            functions,
            async_calls: async_fns,
            constants,
            hoisted: 0,
            mutable: HashSet::new(),
            closures: HashSet::new(),
            providers: HashMap::new(),
            route_status: None,
            in_method: false,
        }
    }

    fn fresh(&mut self, prefix: &str) -> String {
        let name = format!("__{}_{}", prefix, self.hoisted);
        self.hoisted += 1;
        name
    }

    fn emit(mut self) -> String {
        let mut out = SourceBuffer::new(INDENT);
        for section in Section::ORDER {
            let mut buf = out.child();
            match section {
                Section::Header => self.emit_header(&mut buf),
                Section::Types => self.emit_types(&mut buf),
                Section::Providers => self.emit_providers(&mut buf),
                Section::Bootstrap => self.emit_bootstrap(&mut buf),
                Section::Routes => self.emit_routes(&mut buf),
                Section::GraphQl => self.emit_graphql(&mut buf),
                Section::Grpc => self.emit_grpc(&mut buf),
                Section::WebSocket => self.emit_websockets(&mut buf),
                Section::Cron => self.emit_cron(&mut buf),
                Section::Events => self.emit_events(&mut buf),
                Section::Queues => self.emit_queues(&mut buf),
                Section::Entrypoint => self.emit_entrypoint(&mut buf),
            }
            if buf.is_empty() {
                continue;
            }
            if section != Section::Header {
                out.blank();
                out.line(format!("// --- {} ---", section.title()));
                out.blank();
            }
            out.append(buf);
        }
        out.finish()
    }

    // ========================================
    // Sections
    // ========================================

    fn emit_header(&mut self, out: &mut SourceBuffer) {
        let f = self.features;
        out.line(format!("//! Generated by glyph from service `{}`", self.service.name));
        out.line("//! Do not edit manually");
        out.blank();
        out.line("#![allow(unused_variables, unused_imports, unused_mut, unused_labels, dead_code)]");
        out.line("#![allow(non_snake_case, non_upper_case_globals, unreachable_code)]");
        out.blank();
        out.line("use axum::{");
        out.indented(|b| {
            b.line("extract::{Json, Path, Query},");
            b.line("http::StatusCode,");
            b.line("response::{IntoResponse, Response},");
            b.line("routing::{delete, get, patch, post, put},");
            b.line("Router,");
        });
        out.line("};");
        out.line("use serde::{Deserialize, Serialize};");
        out.line("use serde_json::{json, Value};");
        out.line("use std::collections::HashMap;");
        out.line("use std::sync::{Arc, LazyLock, Mutex, OnceLock};");
        out.line("use tokio::sync::OnceCell;");
        if f.websocket {
            out.line("use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};");
            out.line("use futures::{SinkExt, StreamExt};");
            out.line("use uuid::Uuid;");
        }
        if f.graphql {
            out.line("use async_graphql::{EmptyMutation, EmptySubscription, Object, Schema, Subscription};");
            out.line("use async_graphql_axum::{GraphQL, GraphQLSubscription};");
        }
        if f.grpc {
            out.line("use tonic::Status;");
        }
        if f.cron {
            out.line("use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};");
        }
        if f.queues {
            out.line("use std::time::Duration;");
            out.line("use tokio::sync::mpsc::UnboundedSender;");
        }
        out.blank();
        for line in RUNTIME.lines() {
            out.line(line);
        }
    }

    fn emit_types(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        for schema in &service.types {
            out.blank();
            self.emit_record(schema, out);
        }

        for constant in &service.constants {
            out.blank();
            let name = rust_ident(&constant.name);
            let kind = self.constants.get(&constant.name).copied();
            match (&constant.value, kind) {
                (ExprIR::Lambda(lambda), Some(ConstKind::Function)) => {
                    let body = match &lambda.body {
                        LambdaBody::Expr(e) => vec![StmtIR::Return((**e).clone())],
                        LambdaBody::Block(b) => b.clone(),
                    };
                    self.emit_function(&constant.name, &[], &lambda.params, &body, out);
                }
                (ExprIR::Int(v), _) => out.line(format!("pub const {}: i64 = {};", name, v)),
                (ExprIR::Float(v), _) => {
                    out.line(format!("pub const {}: f64 = {};", name, render_float(*v)))
                }
                (ExprIR::String(v), _) => {
                    out.line(format!("pub const {}: &str = {};", name, quote(v, '"')))
                }
                (ExprIR::Bool(v), _) => out.line(format!("pub const {}: bool = {};", name, v)),
                (value, _) => {
                    let mut pre = out.child();
                    pre.indent();
                    let value = self.expr(value, &mut pre);
                    if pre.is_empty() {
                        out.line(format!(
                            "pub static {}: LazyLock<Value> = LazyLock::new(|| {});",
                            name, value
                        ));
                    } else {
                        out.line(format!("pub static {}: LazyLock<Value> = LazyLock::new(|| {{", name));
                        out.append(pre);
                        out.indented(|b| b.line(value));
                        out.line("});");
                    }
                }
            }
        }

        for function in &service.functions {
            out.blank();
            self.emit_function(
                &function.name,
                &function.type_params,
                &function.params,
                &function.body,
                out,
            );
        }

        for command in &service.commands {
            out.blank();
            if !command.description.is_empty() {
                out.line(format!("/// {}", command.description));
            }
            out.line(format!(
                "async fn {}(args: Value) -> Value {{",
                command_fn_name(&command.name)
            ));
            out.indent();
            for param in &command.params {
                out.line(format!(
                    "let {} = rt::field(&args, {});",
                    rust_ident(&param.name),
                    quote(&param.name, '"')
                ));
            }
            self.body(&command.body, BodyContext::Command, out);
            out.dedent();
            out.line("}");
        }
    }

    fn emit_function(
        &mut self,
        name: &str,
        type_params: &[String],
        params: &[FieldSchema],
        body: &[StmtIR],
        out: &mut SourceBuffer,
    ) {
        let is_async = self.functions.get(name).is_some_and(|f| f.is_async);
        // Parameters typed by a type parameter are converted to `Value` on entry
        let generic: Vec<&FieldSchema> = params
            .iter()
            .filter(|p| matches!(&p.ty, TypeRef::Named(n) if type_params.contains(n)))
            .collect();
        let rendered: Vec<String> = params
            .iter()
            .map(|p| match &p.ty {
                TypeRef::Named(n) if type_params.contains(n) => format!("{}: {}", rust_ident(&p.name), n),
                _ => format!("{}: Value", rust_ident(&p.name)),
            })
            .collect();
        let keyword = if is_async { "async fn" } else { "fn" };
        out.line(format!(
            "{} {}{}({}) -> Value {{",
            keyword,
            rust_ident(name),
            serialize_bounds(type_params),
            rendered.join(", ")
        ));
        out.indent();
        for param in generic {
            let ident = rust_ident(&param.name);
            out.line(format!("let {} = serde_json::to_value({}).unwrap_or_default();", ident, ident));
        }
        self.body(body, BodyContext::Function, out);
        out.dedent();
        out.line("}");
    }

    fn emit_record(&mut self, schema: &TypeSchema, out: &mut SourceBuffer) {
        let service = self.service;
        out.line("#[derive(Debug, Clone, Default, Serialize, Deserialize)]");
        out.line(format!(
            "pub struct {}{} {{",
            schema.name,
            angle_params(&schema.type_params)
        ));
        out.indent();
        for field in &schema.fields {
            let (ty, optional) = optional_field(field);
            let mut ty = rust_type(ty, service);
            if ty == schema.name || ty.starts_with(&format!("{}<", schema.name)) {
                ty = format!("Box<{}>", ty);
            }
            if optional {
                out.line("#[serde(default, skip_serializing_if = \"Option::is_none\")]");
                out.line(format!("pub {}: Option<{}>,", rust_ident(&field.name), ty));
            } else {
                if field.default.is_some() {
                    out.line("#[serde(default)]");
                }
                out.line(format!("pub {}: {},", rust_ident(&field.name), ty));
            }
        }
        out.dedent();
        out.line("}");

        if schema.methods.is_empty() {
            return;
        }
        out.blank();
        out.line(format!(
            "impl{} {}{} {{",
            serialize_bounds(&schema.type_params),
            schema.name,
            angle_params(&schema.type_params)
        ));
        out.indent();
        for (i, method) in schema.methods.iter().enumerate() {
            if i > 0 {
                out.blank();
            }
            let is_async = needs_async(&method.body, &self.async_calls);
            let mut params = vec!["&self".to_string()];
            params.extend(method.params.iter().map(|p| format!("{}: Value", rust_ident(&p.name))));
            out.line(format!(
                "pub {}fn {}({}) -> Value {{",
                if is_async { "async " } else { "" },
                rust_ident(&method.name),
                params.join(", ")
            ));
            out.indent();
            out.line("let this = serde_json::to_value(self).unwrap_or_default();");
            self.in_method = true;
            self.body(&method.body, BodyContext::Function, out);
            self.in_method = false;
            out.dedent();
            out.line("}");
        }
        out.dedent();
        out.line("}");
    }

    fn emit_providers(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        if service.providers.is_empty() {
            return;
        }
        if self.features.database {
            out.line("/// Table handle; every operation is a stub until wired to a real store");
            out.line("#[derive(Debug, Clone)]");
            out.line("pub struct TableProxy {");
            out.indented(|b| b.line("name: &'static str,"));
            out.line("}");
            out.blank();
            out.line("impl TableProxy {");
            out.indent();
            for method in &self.usage.table_methods {
                out.line(format!(
                    "pub fn {}(&self, args: &[Value]) -> Value {{",
                    rust_ident(method)
                ));
                out.indented(|b| b.line(format!("unimplemented!(\"{{}}.{}\", self.name)", method)));
                out.line("}");
                out.blank();
            }
            out.line("pub fn call(&self, method: &str, args: &[Value]) -> Value {");
            out.indented(|b| b.line("unimplemented!(\"{}.{}\", self.name, method)"));
            out.line("}");
            out.dedent();
            out.line("}");
        }

        for provider in &service.providers {
            out.blank();
            self.emit_provider(provider, out);
        }
    }

    fn emit_provider(&mut self, provider: &ProviderRef, out: &mut SourceBuffer) {
        let service = self.service;
        let struct_name = match provider.standard() {
            Some(StandardProvider::Database) => "DatabaseProvider".to_string(),
            _ => format!("{}Provider", provider.provider_type),
        };
        let cell = format!("{}_PROVIDER", provider.name.to_uppercase());
        let accessor = accessor_name(&provider.provider_type, false);

        out.line("#[derive(Clone)]");
        out.line(format!("pub struct {} {{", struct_name));
        out.indent();
        match provider.standard() {
            Some(StandardProvider::Database) => {
                out.line("pub pool: Option<sqlx::PgPool>,");
                for table in &self.usage.tables {
                    out.line(format!("pub {}: TableProxy,", rust_ident(table)));
                }
            }
            Some(StandardProvider::Redis) => out.line("pub client: Option<redis::Client>,"),
            Some(StandardProvider::MongoDB) => out.line("pub database: Option<mongodb::Database>,"),
            Some(StandardProvider::Llm) => {
                out.line("pub http: reqwest::Client,");
                out.line("pub api_key: Option<String>,");
            }
            None => {}
        }
        out.dedent();
        out.line("}");
        out.blank();

        out.line(format!("impl {} {{", struct_name));
        out.indent();
        let mut methods: Vec<(String, Option<String>)> = provider
            .methods
            .iter()
            .map(|m| {
                let params: Vec<String> = m
                    .params
                    .iter()
                    .map(|p| format!("{}: {}", p.name, p.effective_type()))
                    .collect();
                let sig = format!("{}({}) -> {}", m.name, params.join(", "), m.return_type);
                (m.name.clone(), Some(sig))
            })
            .collect();
        if let Some(called) = self.usage.methods.get(&provider.provider_type) {
            for name in called {
                if !methods.iter().any(|(m, _)| m == name) {
                    methods.push((name.clone(), None));
                }
            }
        }
        for (name, sig) in &methods {
            if let Some(sig) = sig {
                out.line(format!("/// `{}`", sig));
            }
            out.line(format!("pub fn {}(&self, args: &[Value]) -> Value {{", rust_ident(name)));
            out.indented(|b| {
                b.line(format!(
                    "unimplemented!({})",
                    quote(&format!("{}.{}", provider.provider_type, name), '"')
                ))
            });
            out.line("}");
            out.blank();
        }
        out.line("pub fn call(&self, method: &str, args: &[Value]) -> Value {");
        out.indented(|b| {
            b.line(format!(
                "unimplemented!(\"{}.{{}}\", method)",
                provider.provider_type
            ))
        });
        out.line("}");
        out.dedent();
        out.line("}");
        out.blank();

        out.line(format!("static {}: OnceCell<{}> = OnceCell::const_new();", cell, struct_name));
        out.blank();
        out.line(format!("async fn {}() -> {} {{", accessor, struct_name));
        out.indent();
        out.line(format!("{}.get_or_init(|| async {{", cell));
        out.indent();
        match provider.standard() {
            Some(StandardProvider::Database) => {
                out.line("let pool = std::env::var(\"DATABASE_URL\")");
                out.indented(|b| {
                    b.line(".ok()");
                    b.line(".and_then(|url| sqlx::PgPool::connect_lazy(&url).ok());");
                });
                out.line("DatabaseProvider {");
                out.indented(|b| {
                    b.line("pool,");
                    for table in &self.usage.tables {
                        b.line(format!(
                            "{}: TableProxy {{ name: {} }},",
                            rust_ident(table),
                            quote(table, '"')
                        ));
                    }
                });
                out.line("}");
            }
            Some(StandardProvider::Redis) => {
                out.line("let url = std::env::var(\"REDIS_URL\").unwrap_or_else(|_| \"redis://localhost:6379\".to_string());");
                out.line(format!("{} {{ client: redis::Client::open(url).ok() }}", struct_name));
            }
            Some(StandardProvider::MongoDB) => {
                out.line("let url = std::env::var(\"MONGODB_URL\").unwrap_or_else(|_| \"mongodb://localhost:27017\".to_string());");
                out.line("let client = mongodb::Client::with_uri_str(url).await.ok();");
                out.line(format!(
                    "let name = std::env::var(\"MONGODB_DATABASE\").unwrap_or_else(|_| {}.to_string());",
                    quote(&service.name, '"')
                ));
                out.line(format!(
                    "{} {{ database: client.map(|c| c.database(&name)) }}",
                    struct_name
                ));
            }
            Some(StandardProvider::Llm) => {
                out.line(format!("{} {{", struct_name));
                out.indented(|b| {
                    b.line("http: reqwest::Client::new(),");
                    b.line("api_key: std::env::var(\"ANTHROPIC_API_KEY\").ok(),");
                });
                out.line("}");
            }
            None => out.line(format!("{} {{}}", struct_name)),
        }
        out.dedent();
        out.line("})");
        out.line(".await");
        out.line(".clone()");
        out.dedent();
        out.line("}");
    }

    fn emit_bootstrap(&mut self, out: &mut SourceBuffer) {
        out.line("fn not_found() -> Response {");
        out.indented(|b| {
            b.line("(StatusCode::NOT_FOUND, Json(json!({ \"error\": \"Not found\" }))).into_response()")
        });
        out.line("}");
    }

    fn emit_routes(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let names = route_fn_names(&service.routes);
        for (route, name) in service.routes.iter().zip(names) {
            out.blank();
            self.emit_route(route, &name, out);
        }
    }

    fn emit_route(&mut self, route: &RouteHandler, name: &str, out: &mut SourceBuffer) {
        let service = self.service;
        if let Some(auth) = &route.auth {
            out.line(auth_comment(auth));
        }
        if let Some(limit) = &route.rate_limit {
            out.line(format!("// Rate limited: {} requests per {}", limit.requests, limit.window));
        }
        for middleware in &route.middleware {
            out.line(format!("// Middleware: {}", middleware.name));
        }

        let mut extractors = Vec::new();
        match route.path_params.as_slice() {
            [] => {}
            [single] => extractors.push(format!("Path({}): Path<String>", rust_ident(single))),
            many => {
                let names: Vec<String> = many.iter().map(|p| rust_ident(p)).collect();
                let types = vec!["String"; many.len()];
                extractors.push(format!(
                    "Path(({})): Path<({})>",
                    names.join(", "),
                    types.join(", ")
                ));
            }
        }
        if !route.query_params.is_empty() {
            extractors.push("Query(query): Query<HashMap<String, String>>".to_string());
        }
        let typed_input = match &route.input_type {
            Some(TypeRef::Named(n))
                if service.type_schema(n).is_some_and(|t| t.type_params.is_empty()) =>
            {
                Some(n.clone())
            }
            _ => None,
        };
        if route.input_type.is_some() {
            extractors.push(format!(
                "Json(input): Json<{}>",
                typed_input.as_deref().unwrap_or("Value")
            ));
        }

        out.line(format!("async fn {}({}) -> Response {{", name, extractors.join(", ")));
        out.indent();
        for param in &route.path_params {
            let ident = rust_ident(param);
            out.line(format!("let {0} = json!({0});", ident));
        }
        for query in &route.query_params {
            let ident = rust_ident(&query.name);
            let lookup = format!(
                "query.get({}).map(|v| {})",
                quote(&query.name, '"'),
                parse_raw("v", &query.ty)
            );
            match &query.default {
                Some(default) => {
                    let mut pre = out.child();
                    let default = self.expr(default, &mut pre);
                    out.append(pre);
                    out.line(format!("let {} = {}.unwrap_or_else(|| {});", ident, lookup, default));
                }
                None if query.required => {
                    out.line(format!("let Some({}) = {} else {{", ident, lookup));
                    out.indented(|b| {
                        b.line(format!(
                            "return (StatusCode::BAD_REQUEST, Json(json!({{ \"error\": {} }}))).into_response();",
                            quote(&format!("Missing query parameter {}", query.name), '"')
                        ))
                    });
                    out.line("};");
                }
                None => out.line(format!("let {} = {}.unwrap_or(Value::Null);", ident, lookup)),
            }
        }
        if typed_input.is_some() {
            out.line("let input = serde_json::to_value(input).unwrap_or_default();");
        }
        self.inject(&route.providers, out);

        self.route_status = Some(if route.method == HttpMethod::Post { 201 } else { 200 });
        self.body(&route.body, BodyContext::Route, out);
        self.route_status = None;
        self.providers.clear();
        out.dedent();
        out.line("}");
    }

    fn emit_graphql(&mut self, out: &mut SourceBuffer) {
        if !self.features.graphql {
            return;
        }
        let service = self.service;
        let names = unique_names(
            service
                .graphql
                .iter()
                .map(|g| format!("resolve_{}", g.field_name.to_snake_case())),
        );

        for (resolver, name) in service.graphql.iter().zip(&names) {
            if let Some(auth) = &resolver.auth {
                out.line(auth_comment(auth));
            }
            let params: Vec<String> = resolver
                .params
                .iter()
                .map(|p| format!("{}: Value", rust_ident(&p.name)))
                .collect();
            out.line(format!("async fn {}({}) -> Value {{", name, params.join(", ")));
            out.indent();
            self.inject(&resolver.providers, out);
            self.body(&resolver.body, BodyContext::Resolver, out);
            self.providers.clear();
            out.dedent();
            out.line("}");
            out.blank();
        }

        for op in GraphQlOp::ALL {
            let resolvers: Vec<(&GraphQlDef, &String)> = service
                .graphql
                .iter()
                .zip(&names)
                .filter(|(g, _)| g.operation == op)
                .collect();
            if resolvers.is_empty() && op != GraphQlOp::Query {
                continue;
            }
            let root = format!("{}Root", op.root_type());
            out.line(format!("pub struct {};", root));
            out.blank();
            out.line(if op == GraphQlOp::Subscription { "#[Subscription]" } else { "#[Object]" });
            out.line(format!("impl {} {{", root));
            out.indent();
            if resolvers.is_empty() {
                out.line(format!("#[graphql(name = \"{}\")]", GRAPHQL_PLACEHOLDER_FIELD));
                out.line("async fn service_name(&self) -> &'static str {");
                out.indented(|b| b.line(quote(&service.name, '"')));
                out.line("}");
            }
            for (i, (resolver, name)) in resolvers.iter().enumerate() {
                if i > 0 {
                    out.blank();
                }
                let mut params = vec!["&self".to_string()];
                let mut args = Vec::new();
                for p in &resolver.params {
                    let ident = rust_ident(&p.name);
                    let attr = if p.name.to_snake_case() == p.name && p.name.to_lower_camel_case() != p.name {
                        format!("#[graphql(name = {})] ", quote(&p.name, '"'))
                    } else {
                        String::new()
                    };
                    params.push(format!("{}{}: async_graphql::Json<Value>", attr, ident));
                    args.push(format!("{}.0", ident));
                }
                out.line(format!("#[graphql(name = {})]", quote(&resolver.field_name, '"')));
                let method = rust_ident(&resolver.field_name.to_snake_case());
                if op == GraphQlOp::Subscription {
                    out.line(format!(
                        "async fn {}({}) -> impl futures::Stream<Item = async_graphql::Json<Value>> {{",
                        method,
                        params.join(", ")
                    ));
                    out.indented(|b| {
                        b.line(format!(
                            "futures::stream::once(async move {{ async_graphql::Json({}({}).await) }})",
                            name,
                            args.join(", ")
                        ))
                    });
                } else {
                    out.line(format!(
                        "async fn {}({}) -> async_graphql::Json<Value> {{",
                        method,
                        params.join(", ")
                    ));
                    out.indented(|b| {
                        b.line(format!("async_graphql::Json({}({}).await)", name, args.join(", ")))
                    });
                }
                out.line("}");
            }
            out.dedent();
            out.line("}");
            out.blank();
        }

        let mutation = if self.has_op(GraphQlOp::Mutation) { "MutationRoot" } else { "EmptyMutation" };
        let subscription = if self.features.subscriptions {
            "SubscriptionRoot"
        } else {
            "EmptySubscription"
        };
        out.line(format!(
            "pub type AppSchema = Schema<QueryRoot, {}, {}>;",
            mutation, subscription
        ));
        out.blank();
        out.line("fn build_schema() -> AppSchema {");
        out.indented(|b| {
            b.line(format!(
                "Schema::build(QueryRoot, {}, {}).finish()",
                mutation, subscription
            ))
        });
        out.line("}");
    }

    fn has_op(&self, op: GraphQlOp) -> bool {
        self.service.graphql_ops(op).next().is_some()
    }

    fn emit_grpc(&mut self, out: &mut SourceBuffer) {
        if !self.features.grpc {
            return;
        }
        let service = self.service;
        for (i, def) in service.grpc.iter().enumerate() {
            if i > 0 {
                out.blank();
            }
            out.line("/*");
            for line in proto_service_definition(def, service) {
                out.line(line);
            }
            out.line("*/");
            out.line("#[derive(Debug, Clone, Default)]");
            out.line(format!("pub struct {}Handlers;", def.name));
            out.blank();
            out.line(format!("impl {}Handlers {{", def.name));
            out.indent();
            for (j, plan) in grpc_method_plans(def).iter().enumerate() {
                if j > 0 {
                    out.blank();
                }
                self.emit_grpc_method(plan, out);
            }
            out.dedent();
            out.line("}");
        }
    }

    fn emit_grpc_method(&mut self, plan: &GrpcMethodPlan<'_>, out: &mut SourceBuffer) {
        let method = rust_ident(&plan.name.to_snake_case());
        match plan.stream {
            StreamKind::Unary => {}
            StreamKind::ServerStream => out.line("// server streaming"),
            StreamKind::ClientStream => out.line("// client streaming"),
            StreamKind::Bidirectional => out.line("// bidirectional streaming"),
        }
        let Some(handler) = plan.handler else {
            out.line(format!(
                "pub async fn {}(&self, request: Value) -> Result<Value, Status> {{",
                method
            ));
            out.indented(|b| b.line("Err(Status::unimplemented(\"Not implemented\"))"));
            out.line("}");
            return;
        };
        if let Some(auth) = &handler.auth {
            out.line(auth_comment(auth));
        }
        out.line(format!(
            "pub async fn {}(&self, request: Value) -> Result<Value, Status> {{",
            method
        ));
        out.indent();
        for param in &handler.params {
            out.line(format!(
                "let {} = rt::field(&request, {});",
                rust_ident(&param.name),
                quote(&param.name, '"')
            ));
        }
        self.inject(&handler.providers, out);
        self.body(&handler.body, BodyContext::Rpc, out);
        self.providers.clear();
        out.dedent();
        out.line("}");
    }

    fn emit_websockets(&mut self, out: &mut SourceBuffer) {
        if !self.features.websocket {
            return;
        }
        let service = self.service;
        out.line("type Peers = HashMap<Uuid, tokio::sync::mpsc::UnboundedSender<Message>>;");
        out.blank();
        out.line("static WS_CONNECTIONS: OnceLock<Mutex<HashMap<String, Peers>>> = OnceLock::new();");
        out.blank();
        out.line("fn ws_connections() -> &'static Mutex<HashMap<String, Peers>> {");
        out.indented(|b| b.line("WS_CONNECTIONS.get_or_init(Default::default)"));
        out.line("}");
        out.blank();
        out.line("async fn broadcast(path: Value, message: Value) -> Value {");
        out.indent();
        out.line("let path = rt::text(&path);");
        out.line("let text = message.to_string();");
        out.line("if let Ok(registry) = ws_connections().lock() {");
        out.indented(|b| {
            b.line("for sender in registry.get(&path).into_iter().flat_map(|peers| peers.values()) {");
            b.indented(|b| b.line("let _ = sender.send(Message::Text(text.clone()));"));
            b.line("}");
        });
        out.line("}");
        out.line("Value::Null");
        out.dedent();
        out.line("}");

        let names = websocket_fn_names(&service.websockets);
        for (ws, name) in service.websockets.iter().zip(names) {
            out.blank();
            self.emit_websocket(ws, &name, out);
        }
    }

    fn emit_websocket(&mut self, ws: &WebSocketDef, name: &str, out: &mut SourceBuffer) {
        let params = path_params(&ws.path);
        let path_args: Vec<String> = params.iter().map(|p| rust_ident(p)).collect();

        for (event, arg) in [
            (WsEvent::Connect, None),
            (WsEvent::Message, Some("message")),
            (WsEvent::Disconnect, None),
            (WsEvent::Error, Some("error")),
        ] {
            let Some(def) = ws.event(event) else {
                continue;
            };
            let mut fn_params: Vec<String> = arg.iter().map(|a| format!("{}: Value", a)).collect();
            fn_params.extend(path_args.iter().map(|p| format!("{}: Value", p)));
            out.line(format!(
                "async fn {}_on_{}({}) -> Value {{",
                name,
                event.as_str(),
                fn_params.join(", ")
            ));
            out.indent();
            self.body(&def.body, BodyContext::WebSocket, out);
            out.dedent();
            out.line("}");
            out.blank();
        }

        let hook_args = |first: Option<&str>| -> String {
            let mut args: Vec<String> = first.iter().map(|s| s.to_string()).collect();
            args.extend(path_args.iter().map(|p| format!("{}.clone()", p)));
            args.join(", ")
        };

        if params.is_empty() {
            out.line(format!("async fn {}(ws: WebSocketUpgrade) -> Response {{", name));
            out.indented(|b| {
                b.line(format!(
                    "ws.on_upgrade(move |socket| {}_session(socket, HashMap::new()))",
                    name
                ))
            });
        } else {
            out.line(format!(
                "async fn {}(ws: WebSocketUpgrade, Path(params): Path<HashMap<String, String>>) -> Response {{",
                name
            ));
            out.indented(|b| {
                b.line(format!("ws.on_upgrade(move |socket| {}_session(socket, params))", name))
            });
        }
        out.line("}");
        out.blank();

        let key = quote(&ws.path, '"');
        out.line(format!(
            "async fn {}_session(socket: WebSocket, params: HashMap<String, String>) {{",
            name
        ));
        out.indent();
        for (param, ident) in params.iter().zip(&path_args) {
            out.line(format!(
                "let {} = json!(params.get({}).cloned().unwrap_or_default());",
                ident,
                quote(param, '"')
            ));
        }
        out.line("let client_id = Uuid::new_v4();");
        out.line("let (mut sink, mut stream) = socket.split();");
        out.line("let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();");
        out.line("if let Ok(mut registry) = ws_connections().lock() {");
        out.indented(|b| {
            b.line(format!(
                "registry.entry({}.to_string()).or_default().insert(client_id, tx.clone());",
                key
            ))
        });
        out.line("}");
        out.line("let writer = tokio::spawn(async move {");
        out.indented(|b| {
            b.line("while let Some(message) = rx.recv().await {");
            b.indented(|b| {
                b.line("if sink.send(message).await.is_err() {");
                b.indented(|b| b.line("break;"));
                b.line("}");
            });
            b.line("}");
        });
        out.line("});");
        out.line("let reply = |value: Value| {");
        out.indented(|b| {
            b.line("if !value.is_null() {");
            b.indented(|b| b.line("let _ = tx.send(Message::Text(value.to_string()));"));
            b.line("}");
        });
        out.line("};");
        out.blank();
        if ws.event(WsEvent::Connect).is_some() {
            out.line(format!("reply({}_on_connect({}).await);", name, hook_args(None)));
        }
        out.line("while let Some(frame) = stream.next().await {");
        out.indent();
        out.line("let message = match frame {");
        out.indented(|b| {
            b.line("Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap_or(Value::String(text)),");
            b.line("Ok(Message::Close(_)) => break,");
            b.line("Ok(_) => continue,");
            b.line("Err(err) => {");
            b.indent();
            if ws.event(WsEvent::Error).is_some() {
                b.line(format!(
                    "{}_on_error({}).await;",
                    name,
                    hook_args(Some("json!(err.to_string())"))
                ));
            } else {
                b.line("tracing::warn!(error = %err, \"websocket error\");");
            }
            b.line("break;");
            b.dedent();
            b.line("}");
        });
        out.line("};");
        if ws.event(WsEvent::Message).is_some() {
            out.line(format!("reply({}_on_message({}).await);", name, hook_args(Some("message"))));
        }
        out.dedent();
        out.line("}");
        out.blank();
        out.line("if let Ok(mut registry) = ws_connections().lock() {");
        out.indented(|b| {
            b.line(format!("if let Some(peers) = registry.get_mut({}) {{", key));
            b.indented(|b| b.line("peers.remove(&client_id);"));
            b.line("}");
        });
        out.line("}");
        if ws.event(WsEvent::Disconnect).is_some() {
            out.line(format!("{}_on_disconnect({}).await;", name, hook_args(None)));
        }
        out.line("writer.abort();");
        out.dedent();
        out.line("}");
    }

    fn emit_cron(&mut self, out: &mut SourceBuffer) {
        if !self.features.cron {
            return;
        }
        let service = self.service;
        let names = cron_fn_names(&service.cron_jobs);
        for (job, name) in service.cron_jobs.iter().zip(&names) {
            out.line(format!("async fn {}() -> Value {{", name));
            out.indent();
            self.inject(&job.providers, out);
            self.body(&job.body, BodyContext::Background, out);
            self.providers.clear();
            out.dedent();
            out.line("}");
            out.blank();
        }

        out.line("async fn start_cron_jobs() -> Result<JobScheduler, JobSchedulerError> {");
        out.indent();
        out.line("let scheduler = JobScheduler::new().await?;");
        for (job, name) in service.cron_jobs.iter().zip(&names) {
            if let Some(tz) = &job.timezone {
                out.line(format!("// Timezone: {}", tz));
            }
            if job.retries > 0 {
                out.line(format!("// Retries: {}", job.retries));
            }
            // the scheduler expects a leading seconds field
            let schedule = format!("0 {}", job.schedule);
            out.line("scheduler");
            out.indented(|b| {
                b.line(format!(
                    ".add(Job::new_async({}, |_id, _scheduler| {{",
                    quote(&schedule, '"')
                ));
                b.indented(|b| {
                    b.line("Box::pin(async move {");
                    b.indented(|b| b.line(format!("{}().await;", name)));
                    b.line("})");
                });
                b.line("})?)");
                b.line(".await?;");
            });
        }
        out.line("scheduler.start().await?;");
        out.line("Ok(scheduler)");
        out.dedent();
        out.line("}");
    }

    fn emit_events(&mut self, out: &mut SourceBuffer) {
        if !self.features.events {
            return;
        }
        let service = self.service;
        let names = event_handler_names(&service.events);
        for (event, name) in service.events.iter().zip(&names) {
            out.line(format!("async fn {}(event: Value) -> Value {{", name));
            out.indent();
            self.inject(&event.providers, out);
            self.body(&event.body, BodyContext::Background, out);
            self.providers.clear();
            out.dedent();
            out.line("}");
            out.blank();
        }

        let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
        for (event, name) in service.events.iter().zip(&names) {
            match groups.iter_mut().find(|(ty, _)| *ty == event.event_type) {
                Some((_, handlers)) => handlers.push(name.as_str()),
                None => groups.push((event.event_type.as_str(), vec![name.as_str()])),
            }
        }

        out.line("async fn emit(event_type: Value, event: Value) -> Value {");
        out.indent();
        out.line("match rt::text(&event_type).as_str() {");
        out.indent();
        for (event_type, handlers) in groups {
            out.line(format!("{} => {{", quote(event_type, '"')));
            out.indented(|b| {
                for handler in handlers {
                    b.line(format!("Box::pin({}(event.clone())).await;", handler));
                }
            });
            out.line("}");
        }
        out.line("other => tracing::warn!(event_type = other, \"no handler for event\"),");
        out.dedent();
        out.line("}");
        out.line("Value::Null");
        out.dedent();
        out.line("}");
    }

    fn emit_queues(&mut self, out: &mut SourceBuffer) {
        if !self.features.queues {
            return;
        }
        let service = self.service;
        let names = queue_worker_names(&service.queues);
        for (queue, name) in service.queues.iter().zip(&names) {
            out.line(format!("async fn {}(message: Value) -> Value {{", name));
            out.indent();
            self.inject(&queue.providers, out);
            self.body(&queue.body, BodyContext::Background, out);
            self.providers.clear();
            out.dedent();
            out.line("}");
            out.blank();
        }

        out.line("static QUEUES: OnceLock<HashMap<&'static str, UnboundedSender<Value>>> = OnceLock::new();");
        out.blank();
        out.line("async fn enqueue(queue: Value, message: Value) -> Value {");
        out.indent();
        out.line("let name = rt::text(&queue);");
        out.line("match QUEUES.get().and_then(|queues| queues.get(name.as_str())) {");
        out.indented(|b| {
            b.line("Some(sender) => {");
            b.indented(|b| b.line("let _ = sender.send(message);"));
            b.line("}");
            b.line("None => tracing::warn!(queue = %name, \"unknown queue\"),");
        });
        out.line("}");
        out.line("Value::Null");
        out.dedent();
        out.line("}");
        out.blank();

        out.line("fn start_workers() {");
        out.indent();
        out.line("let mut senders = HashMap::new();");
        for (queue, name) in service.queues.iter().zip(&names) {
            out.blank();
            out.line("let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();");
            out.line(format!("senders.insert({}, tx);", quote(&queue.queue_name, '"')));
            if queue.max_retries > 0 {
                out.line(format!("// Max retries: {}", queue.max_retries));
            }
            out.line("tokio::spawn(async move {");
            out.indent();
            out.line(format!(
                "let limit = Arc::new(tokio::sync::Semaphore::new({}));",
                queue.concurrency.max(1)
            ));
            out.line("while let Some(message) = rx.recv().await {");
            out.indent();
            out.line("let Ok(permit) = limit.clone().acquire_owned().await else {");
            out.indented(|b| b.line("break;"));
            out.line("};");
            out.line("tokio::spawn(async move {");
            out.indent();
            out.line("let _permit = permit;");
            if queue.timeout_secs > 0 {
                out.line(format!(
                    "if tokio::time::timeout(Duration::from_secs({}), {}(message)).await.is_err() {{",
                    queue.timeout_secs, name
                ));
                out.indented(|b| {
                    b.line(format!(
                        "tracing::warn!(queue = {}, \"worker timed out\");",
                        quote(&queue.queue_name, '"')
                    ))
                });
                out.line("}");
            } else {
                out.line(format!("{}(message).await;", name));
            }
            out.dedent();
            out.line("});");
            out.dedent();
            out.line("}");
            out.dedent();
            out.line("});");
        }
        out.line("let _ = QUEUES.set(senders);");
        out.dedent();
        out.line("}");
    }

    fn emit_entrypoint(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let f = self.features;

        if f.commands {
            out.line("fn has_flag(args: &[String], name: &str) -> bool {");
            out.indented(|b| b.line("args.iter().any(|a| *a == format!(\"--{}\", name))"));
            out.line("}");
            out.blank();
            out.line("fn arg_value(args: &[String], name: &str) -> Option<String> {");
            out.indented(|b| {
                b.line("let flag = format!(\"--{}\", name);");
                b.line("let index = args.iter().position(|a| *a == flag)?;");
                b.line("args.get(index + 1).cloned()");
            });
            out.line("}");
            out.blank();
        }

        out.line("#[tokio::main]");
        out.line("async fn main() {");
        out.indent();
        out.line("tracing_subscriber::fmt::init();");

        if f.commands {
            out.blank();
            out.line("let args: Vec<String> = std::env::args().collect();");
            out.line("match args.get(1).map(String::as_str) {");
            out.indent();
            for command in &service.commands {
                out.line(format!("Some({}) => {{", quote(&command.name, '"')));
                out.indent();
                let mut fields = Vec::new();
                for param in &command.params {
                    let flag = quote(&param.name.to_kebab_case(), '"');
                    let ident = rust_ident(&param.name);
                    if param.is_flag {
                        fields.push(format!("{}: has_flag(&args, {})", quote(&param.name, '"'), flag));
                        continue;
                    }
                    let lookup = format!(
                        "arg_value(&args, {}).map(|v| {})",
                        flag,
                        parse_raw("v", &param.ty)
                    );
                    match &param.default {
                        Some(default) => {
                            let mut pre = out.child();
                            let default = self.expr(default, &mut pre);
                            out.append(pre);
                            out.line(format!("let {} = {}.unwrap_or_else(|| {});", ident, lookup, default));
                        }
                        None if param.required => {
                            out.line(format!("let Some({}) = {} else {{", ident, lookup));
                            out.indented(|b| {
                                b.line(format!(
                                    "eprintln!({});",
                                    quote(
                                        &format!("Missing required argument --{}", param.name.to_kebab_case()),
                                        '"'
                                    )
                                ));
                                b.line("std::process::exit(1);");
                            });
                            out.line("};");
                        }
                        None => out.line(format!("let {} = {}.unwrap_or(Value::Null);", ident, lookup)),
                    }
                    fields.push(format!("{}: {}", quote(&param.name, '"'), ident));
                }
                let args = if fields.is_empty() {
                    "json!({})".to_string()
                } else {
                    format!("json!({{ {} }})", fields.join(", "))
                };
                out.line(format!(
                    "let result = {}({}).await;",
                    command_fn_name(&command.name),
                    args
                ));
                out.line("if !result.is_null() {");
                out.indented(|b| {
                    b.line("println!(\"{}\", serde_json::to_string_pretty(&result).unwrap_or_default());")
                });
                out.line("}");
                out.line("return;");
                out.dedent();
                out.line("}");
            }
            out.line("_ => {}");
            out.dedent();
            out.line("}");
        }

        if f.queues {
            out.blank();
            out.line("start_workers();");
        }
        if f.cron {
            out.blank();
            out.line("let _scheduler = match start_cron_jobs().await {");
            out.indented(|b| {
                b.line("Ok(scheduler) => Some(scheduler),");
                b.line("Err(err) => {");
                b.indented(|b| {
                    b.line("tracing::error!(error = %err, \"failed to start cron jobs\");");
                    b.line("None");
                });
                b.line("}");
            });
            out.line("};");
        }
        if f.grpc {
            out.blank();
            out.line(format!(
                "tracing::info!(proto = {}, port = {}, \"gRPC handlers ready\");",
                quote(&proto_path(service), '"'),
                GRPC_PORT
            ));
        }

        out.blank();
        self.emit_router(out);

        let address = format!("{}:{}", self.backend.host, self.backend.port);
        out.blank();
        out.line(format!(
            "let listener = match tokio::net::TcpListener::bind({}).await {{",
            quote(&address, '"')
        ));
        out.indented(|b| {
            b.line("Ok(listener) => listener,");
            b.line("Err(err) => {");
            b.indented(|b| {
                b.line(format!(
                    "tracing::error!(error = %err, \"failed to bind {}\");",
                    address
                ));
                b.line("return;");
            });
            b.line("}");
        });
        out.line("};");
        out.line(format!("tracing::info!(\"Server running on http://{}\");", address));
        out.line("if let Err(err) = axum::serve(listener, app).await {");
        out.indented(|b| b.line("tracing::error!(error = %err, \"server error\");"));
        out.line("}");
        out.dedent();
        out.line("}");
    }

    fn emit_router(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        let mut add = |path: &str, handler: String| match groups.iter_mut().find(|(p, _)| *p == path) {
            Some((_, handlers)) => handlers.push(handler),
            None => groups.push((path.to_string(), vec![handler])),
        };
        for (route, name) in service.routes.iter().zip(route_fn_names(&service.routes)) {
            add(&route.path, format!("{}({})", http_verb(route.method), name));
        }
        for (ws, name) in service.websockets.iter().zip(websocket_fn_names(&service.websockets)) {
            add(&ws.path, format!("get({})", name));
        }

        if self.features.graphql {
            out.line("let schema = build_schema();");
        }
        out.line("let app = Router::new()");
        out.indent();
        for (path, handlers) in &groups {
            out.line(format!(".route({}, {})", quote(path, '"'), handlers.join(".")));
        }
        if self.features.graphql {
            out.line(".route_service(\"/graphql\", GraphQL::new(schema.clone()))");
            if self.features.subscriptions {
                out.line(".route_service(\"/graphql/ws\", GraphQLSubscription::new(schema))");
            }
        }
        out.line(".fallback(|| async { not_found() });");
        out.dedent();
    }

    // ========================================
    // Bodies
    // ========================================

    fn inject(&mut self, providers: &[InjectionRef], out: &mut SourceBuffer) {
        for injection in providers {
            out.line(format!(
                "let {} = {}().await;",
                rust_ident(&injection.name),
                accessor_name(&injection.provider_type, false)
            ));
            self.providers
                .insert(injection.name.clone(), injection.provider_type.clone());
        }
    }

    fn tail(&self, ctx: BodyContext) -> &'static str {
        match ctx {
            BodyContext::Route => "StatusCode::NO_CONTENT.into_response()",
            BodyContext::Rpc => "Ok(Value::Null)",
            _ => "Value::Null",
        }
    }

    /// A function body with its own mutable set, ending in a tail value
    fn body(&mut self, body: &[StmtIR], ctx: BodyContext, out: &mut SourceBuffer) {
        let saved = std::mem::replace(&mut self.mutable, reassigned_vars(body));
        let saved_closures = self.closures.clone();
        self.block(body, ctx, out);
        if falls_through(body) {
            out.line(self.tail(ctx));
        }
        self.mutable = saved;
        self.closures = saved_closures;
    }

    fn block(&mut self, body: &[StmtIR], ctx: BodyContext, out: &mut SourceBuffer) {
        for stmt in body {
            self.stmt(stmt, ctx, out);
        }
    }

    fn render_return(&self, value: &str, ctx: BodyContext, out: &mut SourceBuffer) {
        match ctx {
            BodyContext::Route => match self.route_status {
                Some(201) => out.line(format!(
                    "return (StatusCode::CREATED, Json({})).into_response();",
                    value
                )),
                _ => out.line(format!("return Json({}).into_response();", value)),
            },
            BodyContext::Rpc => out.line(format!("return Ok({});", value)),
            _ => out.line(format!("return {};", value)),
        }
    }

    fn stmt(&mut self, stmt: &StmtIR, ctx: BodyContext, out: &mut SourceBuffer) {
        let mut pre = out.child();
        match stmt {
            StmtIR::Assign {
                target,
                value: ExprIR::Lambda(lambda),
            } => {
                let closure = self.lambda(lambda, &mut pre);
                out.append(pre);
                out.line(format!("let {} = {};", rust_ident(target), closure));
                self.closures.insert(target.clone());
            }
            StmtIR::Assign { target, value } => {
                let value = self.expr(value, &mut pre);
                out.append(pre);
                let keyword = if self.mutable.contains(target) { "let mut" } else { "let" };
                out.line(format!("{} {} = {};", keyword, rust_ident(target), value));
            }
            StmtIR::Reassign { target, value } => {
                let value = self.expr(value, &mut pre);
                out.append(pre);
                out.line(format!("{} = {};", rust_ident(target), value));
            }
            StmtIR::Return(value) => {
                let value = self.expr(value, &mut pre);
                out.append(pre);
                self.render_return(&value, ctx, out);
            }
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => {
                let condition = self.cond(condition, &mut pre);
                out.append(pre);
                out.line(format!("if {} {{", condition));
                out.indent();
                self.block(then_body, ctx, out);
                out.dedent();
                if else_body.is_empty() {
                    out.line("}");
                } else {
                    out.line("} else {");
                    out.indent();
                    self.block(else_body, ctx, out);
                    out.dedent();
                    out.line("}");
                }
            }
            StmtIR::For {
                key,
                value,
                iterable,
                body,
            } => {
                let iterable = self.operand(iterable, &mut pre);
                out.append(pre);
                let binding = |name: &str, mutable: &HashSet<String>| {
                    if mutable.contains(name) {
                        format!("mut {}", rust_ident(name))
                    } else {
                        rust_ident(name)
                    }
                };
                let value = binding(value.as_str(), &self.mutable);
                match key {
                    Some(key) => out.line(format!(
                        "for ({}, {}) in rt::entries({}) {{",
                        binding(key.as_str(), &self.mutable),
                        value,
                        iterable
                    )),
                    None => out.line(format!("for {} in rt::iter({}) {{", value, iterable)),
                }
                out.indent();
                self.block(body, ctx, out);
                out.dedent();
                out.line("}");
            }
            StmtIR::While { condition, body } => {
                let condition = self.cond(condition, &mut pre);
                out.append(pre);
                out.line(format!("while {} {{", condition));
                out.indent();
                self.block(body, ctx, out);
                out.dedent();
                out.line("}");
            }
            StmtIR::Switch {
                value,
                cases,
                default,
            } => {
                let value = self.expr(value, &mut pre);
                let subject = self.fresh("switch");
                let labels: Vec<String> = cases.iter().map(|c| self.expr(&c.value, &mut pre)).collect();
                out.append(pre);
                out.line(format!("let {} = {};", subject, value));
                for (i, (case, label)) in cases.iter().zip(labels).enumerate() {
                    let keyword = if i == 0 { "if" } else { "} else if" };
                    out.line(format!("{} {} == {} {{", keyword, subject, label));
                    out.indent();
                    self.block(without_trailing_break(&case.body), ctx, out);
                    out.dedent();
                }
                if cases.is_empty() {
                    self.block(default, ctx, out);
                } else {
                    if !default.is_empty() {
                        out.line("} else {");
                        out.indent();
                        self.block(default, ctx, out);
                        out.dedent();
                    }
                    out.line("}");
                }
            }
            StmtIR::Expr(ExprIR::Null) => out.line("// no-op"),
            StmtIR::Expr(expr) => {
                let expr = self.expr(expr, &mut pre);
                out.append(pre);
                out.line(format!("{};", expr));
            }
            StmtIR::Validate(check) => {
                let check = self.cond(check, &mut pre);
                out.append(pre);
                out.line(format!("if !({}) {{", check));
                out.indented(|b| match ctx {
                    BodyContext::Route => b.line(
                        "return (StatusCode::BAD_REQUEST, Json(json!({ \"error\": \"Validation failed\" }))).into_response();",
                    ),
                    BodyContext::Rpc => {
                        b.line("return Err(Status::invalid_argument(\"Validation failed\"));")
                    }
                    _ => b.line("return json!({ \"error\": \"Validation failed\" });"),
                });
                out.line("}");
            }
            StmtIR::Break => out.line("break;"),
            StmtIR::Continue => out.line("continue;"),
        }
    }

    /// A `bool` expression
    fn cond(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Bool(v) => v.to_string(),
            ExprIR::Binary { op, left, right } => match op {
                BinOp::Eq | BinOp::Ne => {
                    let left = self.expr(left, pre);
                    let right = self.expr(right, pre);
                    format!("{} {} {}", left, op.symbol(), right)
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    let left = self.operand(left, pre);
                    let right = self.operand(right, pre);
                    let helper = match op {
                        BinOp::Lt => "lt",
                        BinOp::Le => "le",
                        BinOp::Gt => "gt",
                        _ => "ge",
                    };
                    format!("rt::{}({}, {})", helper, left, right)
                }
                BinOp::And | BinOp::Or => {
                    let left = self.cond(left, pre);
                    let right = self.cond(right, pre);
                    format!("({} {} {})", left, op.symbol(), right)
                }
                _ => format!("rt::truthy({})", self.operand(expr, pre)),
            },
            ExprIR::Unary {
                op: UnOp::Not,
                operand,
            } => format!("!{}", self.cond_atom(operand, pre)),
            other => format!("rt::truthy({})", self.operand(other, pre)),
        }
    }

    fn cond_atom(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        let rendered = self.cond(expr, pre);
        if rendered.contains(' ') && !rendered.starts_with('(') {
            format!("({})", rendered)
        } else {
            rendered
        }
    }

    /// A `&Value` argument, borrowing plain locals instead of cloning them
    fn operand(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Var(name) if self.is_plain_local(name) => format!("&{}", rust_ident(name)),
            other => format!("&{}", self.expr(other, pre)),
        }
    }

    fn is_plain_local(&self, name: &str) -> bool {
        !self.providers.contains_key(name)
            && !self.constants.contains_key(name)
            && !self.closures.contains(name)
            && !(self.in_method && (name == "self" || name == "this"))
    }

    fn expr(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Int(v) => format!("json!({})", v),
            ExprIR::Float(v) if v.is_finite() => format!("json!({})", render_float(*v)),
            ExprIR::Float(_) | ExprIR::Null => "Value::Null".to_string(),
            ExprIR::String(v) => format!("json!({})", quote(v, '"')),
            ExprIR::Bool(v) => format!("json!({})", v),
            ExprIR::Var(name) => self.var(name),
            ExprIR::Binary { op, left, right } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    let left = self.operand(left, pre);
                    let right = self.operand(right, pre);
                    let helper = match op {
                        BinOp::Add => "add",
                        BinOp::Sub => "sub",
                        BinOp::Mul => "mul",
                        BinOp::Div => "div",
                        _ => "rem",
                    };
                    format!("rt::{}({}, {})", helper, left, right)
                }
                _ => format!("json!({})", self.cond(expr, pre)),
            },
            ExprIR::Unary {
                op: UnOp::Neg,
                operand,
            } => format!("rt::neg({})", self.operand(operand, pre)),
            ExprIR::Unary { op: UnOp::Not, .. } => format!("json!({})", self.cond(expr, pre)),
            ExprIR::FieldAccess { object, field } => {
                if self.provider_rooted(expr) {
                    return "Value::Null".to_string();
                }
                let object = self.operand(object, pre);
                format!("rt::field({}, {})", object, quote(field, '"'))
            }
            ExprIR::IndexAccess { object, index } => {
                let object = self.operand(object, pre);
                let index = self.operand(index, pre);
                format!("rt::index({}, {})", object, index)
            }
            ExprIR::Call(call) => match classify_call(call) {
                CallShape::Method { receiver, name, args } => self.method_call(receiver, name, args, pre),
                CallShape::Function { name, args } => {
                    let args: Vec<&ExprIR> = args.iter().collect();
                    self.function_call(name, &args, pre)
                }
            },
            ExprIR::Object(fields) if fields.is_empty() => "json!({})".to_string(),
            ExprIR::Object(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{}: {}", quote(&f.key, '"'), self.expr(&f.value, pre)))
                    .collect();
                format!("json!({{ {} }})", fields.join(", "))
            }
            ExprIR::Array(elements) => {
                let elements: Vec<String> = elements.iter().map(|e| self.expr(e, pre)).collect();
                format!("json!([{}])", elements.join(", "))
            }
            // closures are not values; bound lambdas go through `stmt`
            ExprIR::Lambda(_) => "Value::Null".to_string(),
            ExprIR::Pipe { left, right } => match lower_pipe(left, right) {
                PipeCall::Call { name, args } => self.function_call(&name, &args, pre),
                PipeCall::Apply { callee, arg } => match callee {
                    ExprIR::Lambda(lambda) => {
                        let closure = self.lambda(lambda, pre);
                        let arg = self.expr(arg, pre);
                        format!("({})({})", closure, arg)
                    }
                    _ => {
                        let arg = self.expr(arg, pre);
                        format!("rt::call(\"|>\", &[{}])", arg)
                    }
                },
            },
            ExprIR::Match(m) => self.match_expr(m, pre),
            ExprIR::Async(body) => {
                let name = self.fresh("async");
                pre.line(format!("let {} = async {{", name));
                pre.indent();
                self.body(body, BodyContext::Closure, pre);
                pre.dedent();
                pre.line("};");
                format!("{}.await", name)
            }
            // calls to async functions carry their own `.await`
            ExprIR::Await(inner) => self.expr(inner, pre),
        }
    }

    fn var(&self, name: &str) -> String {
        if self.in_method && (name == "self" || name == "this") {
            return "this.clone()".to_string();
        }
        if self.providers.contains_key(name) || self.closures.contains(name) {
            return "Value::Null".to_string();
        }
        match self.constants.get(name) {
            Some(ConstKind::Literal) => format!("json!({})", rust_ident(name)),
            Some(ConstKind::Lazy) => format!("{}.clone()", rust_ident(name)),
            Some(ConstKind::Function) => "Value::Null".to_string(),
            None => format!("{}.clone()", rust_ident(name)),
        }
    }

    fn provider_rooted(&self, expr: &ExprIR) -> bool {
        provider_path(expr).is_some_and(|(root, _)| self.providers.contains_key(root))
    }

    fn method_call(&mut self, receiver: &ExprIR, name: &str, args: &[ExprIR], pre: &mut SourceBuffer) -> String {
        if let Some((root, fields)) = provider_path(receiver) {
            if let Some(ty) = self.providers.get(root).cloned() {
                let args: Vec<String> = args.iter().map(|a| self.expr(a, pre)).collect();
                let args = args.join(", ");
                let root = rust_ident(root);
                return match (fields.as_slice(), ty.as_str()) {
                    ([], _) => format!("{}.{}(&[{}])", root, rust_ident(name), args),
                    ([table], "Database") => {
                        format!("{}.{}.{}(&[{}])", root, rust_ident(table), rust_ident(name), args)
                    }
                    _ => format!(
                        "{}.call({}, &[{}])",
                        root,
                        quote(&format!("{}.{}", fields.join("."), name), '"'),
                        args
                    ),
                };
            }
        }

        let receiver_ref = self.operand(receiver, pre);
        match (name, args) {
            ("map" | "filter", [ExprIR::Lambda(lambda)]) => {
                let closure = self.lambda(lambda, pre);
                format!("rt::{}({}, {})", name, receiver_ref, closure)
            }
            _ => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a, pre)).collect();
                format!(
                    "rt::call_method({}, {}, &[{}])",
                    receiver_ref,
                    quote(name, '"'),
                    args.join(", ")
                )
            }
        }
    }

    fn function_call(&mut self, name: &str, args: &[&ExprIR], pre: &mut SourceBuffer) -> String {
        let mut rendered: Vec<String> = args.iter().map(|a| self.expr(a, pre)).collect();

        if self.closures.contains(name) {
            return format!("{}({})", rust_ident(name), rendered.join(", "));
        }
        if let Some(info) = self.functions.get(name).cloned() {
            for param in info.params.iter().skip(rendered.len()) {
                let value = match &param.default {
                    Some(default) => self.expr(default, pre),
                    None => "Value::Null".to_string(),
                };
                rendered.push(value);
            }
            let call = format!("{}({})", rust_ident(name), rendered.join(", "));
            return if info.is_async {
                format!("Box::pin({}).await", call)
            } else {
                call
            };
        }
        let helper = match name {
            "emit" => self.features.events,
            "enqueue" => self.features.queues,
            "broadcast" => self.features.websocket,
            _ => false,
        };
        if helper && rendered.len() == 2 {
            return format!("{}({}).await", name, rendered.join(", "));
        }
        format!("rt::call({}, &[{}])", quote(name, '"'), rendered.join(", "))
    }

    fn lambda(&mut self, lambda: &LambdaExpr, pre: &mut SourceBuffer) -> String {
        let params: Vec<String> = lambda
            .params
            .iter()
            .map(|p| format!("{}: Value", rust_ident(&p.name)))
            .collect();
        let params = params.join(", ");
        match &lambda.body {
            LambdaBody::Expr(body) => {
                let mut inner = pre.child();
                inner.indent();
                let value = self.expr(body, &mut inner);
                if inner.is_empty() {
                    return format!("|{}| -> Value {{ {} }}", params, value);
                }
                let name = self.fresh("lambda");
                pre.line(format!("let {} = |{}| -> Value {{", name, params));
                pre.append(inner);
                pre.indented(|b| b.line(value));
                pre.line("};");
                name
            }
            LambdaBody::Block(stmts) => {
                let name = self.fresh("lambda");
                pre.line(format!("let {} = |{}| -> Value {{", name, params));
                pre.indent();
                self.body(stmts, BodyContext::Closure, pre);
                pre.dedent();
                pre.line("};");
                name
            }
        }
    }

    fn match_expr(&mut self, m: &MatchExpr, pre: &mut SourceBuffer) -> String {
        let scrutinee = self.expr(&m.value, pre);
        let name = self.fresh("match");
        let plan = plan_match(m);
        let awaits = m.cases.iter().any(|c| {
            expr_needs_async(&c.body, &self.async_calls)
                || c.guard.as_ref().is_some_and(|g| expr_needs_async(g, &self.async_calls))
        });

        // arms that await cannot live in a closure, so they run in place
        let exit = if awaits {
            let label = format!("'{}", name.trim_start_matches('_'));
            pre.line(format!("let {} = {}: {{", name, label));
            pre.indent();
            pre.line(format!("let __subject: Value = {};", scrutinee));
            format!("break {}", label)
        } else {
            pre.line(format!("let {} = |__subject: Value| -> Value {{", name));
            pre.indent();
            "return".to_string()
        };

        for arm in &plan.arms {
            let conditions: Vec<String> = arm.checks.iter().map(render_check).collect();
            if conditions.is_empty() {
                pre.line("{");
            } else {
                pre.line(format!("if {} {{", conditions.join(" && ")));
            }
            pre.indent();
            self.match_arm_body(arm, &exit, pre);
            pre.dedent();
            pre.line("}");
        }
        match &plan.default {
            Some(arm) => self.match_arm_body(arm, &exit, pre),
            None => pre.line("Value::Null"),
        }
        pre.dedent();
        pre.line("};");

        if awaits {
            name
        } else {
            format!("{}({})", name, scrutinee)
        }
    }

    fn match_arm_body(&mut self, arm: &MatchArm<'_>, exit: &str, out: &mut SourceBuffer) {
        for binding in &arm.bindings {
            let (path, place) = access_path(&binding.path);
            let value = if place { format!("{}.clone()", path) } else { path };
            out.line(format!("let {} = {};", rust_ident(&binding.name), value));
        }
        match arm.guard {
            Some(guard) => {
                let guard = self.cond(guard, out);
                out.line(format!("if {} {{", guard));
                out.indent();
                let value = self.expr(arm.body, out);
                out.line(format!("{} {};", exit, value));
                out.dedent();
                out.line("}");
            }
            None => {
                let value = self.expr(arm.body, out);
                out.line(format!("{} {};", exit, value));
            }
        }
    }
}

/// Path into `__subject`, and whether it is a place that needs cloning
fn access_path(path: &[Access]) -> (String, bool) {
    let mut out = "__subject".to_string();
    let mut place = true;
    for step in path {
        match step {
            Access::Key(key) => out.push_str(&format!("[{}]", quote(key, '"'))),
            Access::Index(i) => out.push_str(&format!("[{}]", i)),
            Access::RestFrom(i) => {
                out = format!("rt::rest(&{}, {})", out, i);
                place = false;
            }
        }
    }
    (out, place)
}

fn render_check(check: &Check) -> String {
    match check {
        Check::IsObject(path) => format!("{}.is_object()", access_path(path).0),
        Check::HasKey(path, key) => {
            format!("{}.get({}).is_some()", access_path(path).0, quote(key, '"'))
        }
        Check::ArrayLen { path, len, exact } => {
            let op = if *exact { "==" } else { ">=" };
            format!(
                "{}.as_array().is_some_and(|items| items.len() {} {})",
                access_path(path).0,
                op,
                len
            )
        }
        Check::Equals(path, value) => format!("{} == {}", access_path(path).0, json_literal(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(service: &ServiceIR) -> GeneratedProgram {
        RustBackend::default().generate(service)
    }

    fn route(method: HttpMethod, path: &str, body: Vec<StmtIR>) -> RouteHandler {
        RouteHandler {
            method,
            path: path.to_string(),
            path_params: path_params(path),
            query_params: vec![],
            input_type: None,
            return_type: None,
            auth: None,
            rate_limit: None,
            middleware: vec![],
            providers: vec![],
            body,
        }
    }

    fn user_service() -> ServiceIR {
        let mut service = ServiceIR::new("users");
        service.types.push(
            TypeSchema::new("User")
                .with_field(FieldSchema::new("id", TypeRef::Int))
                .with_field(FieldSchema::new("nick", TypeRef::String.optional()).optional()),
        );
        service.providers.push(ProviderRef::new("Database"));
        let mut get = route(
            HttpMethod::Get,
            "/api/users/:id",
            vec![
                StmtIR::assign(
                    "user",
                    ExprIR::call(
                        "Get",
                        vec![ExprIR::field(ExprIR::var("db"), "users"), ExprIR::var("id")],
                    ),
                ),
                StmtIR::Return(ExprIR::var("user")),
            ],
        );
        get.providers.push(InjectionRef::new("db", "Database"));
        service.routes.push(get);
        service
    }

    #[test]
    fn test_user_route() {
        let code = generate(&user_service()).source.contents;
        let expected = [
            "async fn get_api_users_id(Path(id): Path<String>) -> Response {",
            "    let id = json!(id);",
            "    let db = get_db().await;",
            "    let user = db.users.Get(&[id.clone()]);",
            "    return Json(user.clone()).into_response();",
            "}",
        ]
        .join("\n");
        assert!(code.contains(&expected), "{}", code);
        assert!(code.contains(".route(\"/api/users/:id\", get(get_api_users_id))"));
        assert!(code.contains("    pub users: TableProxy,\n"));
        assert!(code.contains("users: TableProxy { name: \"users\" },"));
        assert!(code.contains("tokio::net::TcpListener::bind(\"0.0.0.0:8080\")"));
    }

    #[test]
    fn test_optional_is_not_double_wrapped() {
        let code = generate(&user_service()).source.contents;
        assert!(code.contains("    pub nick: Option<String>,\n"));
        assert!(!code.contains("Option<Option<"));
    }

    #[test]
    fn test_post_returns_created() {
        let mut service = ServiceIR::new("s");
        service.routes.push(route(
            HttpMethod::Post,
            "/items",
            vec![StmtIR::Return(ExprIR::Object(vec![ObjectField {
                key: "ok".to_string(),
                value: ExprIR::Bool(true),
            }]))],
        ));
        service.routes.push(route(HttpMethod::Delete, "/items", vec![]));
        let code = generate(&service).source.contents;
        assert!(code.contains("return (StatusCode::CREATED, Json(json!({ \"ok\": json!(true) }))).into_response();"));
        assert!(code.contains("async fn delete_items() -> Response {\n    StatusCode::NO_CONTENT.into_response()\n}"));
        assert!(code.contains(".route(\"/items\", post(post_items).delete(delete_items))"));
    }

    #[test]
    fn test_functions_and_conditions() {
        let mut service = ServiceIR::new("s");
        service.functions.push(FunctionDef {
            name: "clamp".to_string(),
            type_params: vec![],
            params: vec![FieldSchema::new("n", TypeRef::Int)],
            return_type: Some(TypeRef::Int),
            body: vec![
                StmtIR::If {
                    condition: ExprIR::binary(BinOp::Gt, ExprIR::var("n"), ExprIR::Int(10)),
                    then_body: vec![StmtIR::Return(ExprIR::Int(10))],
                    else_body: vec![],
                },
                StmtIR::Return(ExprIR::binary(BinOp::Add, ExprIR::var("n"), ExprIR::Int(1))),
            ],
        });
        let code = generate(&service).source.contents;
        let expected = [
            "fn clamp(n: Value) -> Value {",
            "    if rt::gt(&n, &json!(10)) {",
            "        return json!(10);",
            "    }",
            "    return rt::add(&n, &json!(1));",
            "}",
        ]
        .join("\n");
        assert!(code.contains(&expected), "{}", code);
    }

    #[test]
    fn test_match_is_hoisted() {
        let mut service = ServiceIR::new("s");
        service.functions.push(FunctionDef {
            name: "describe".to_string(),
            type_params: vec![],
            params: vec![FieldSchema::new("x", TypeRef::Any)],
            return_type: None,
            body: vec![StmtIR::Return(ExprIR::Match(MatchExpr {
                value: Box::new(ExprIR::var("x")),
                cases: vec![
                    MatchCase {
                        pattern: PatternIR::Literal(LiteralValue::Int(1)),
                        guard: None,
                        body: ExprIR::string("one"),
                    },
                    MatchCase {
                        pattern: PatternIR::Wildcard,
                        guard: None,
                        body: ExprIR::string("many"),
                    },
                ],
            }))],
        });
        let code = generate(&service).source.contents;
        assert!(code.contains("    let __match_0 = |__subject: Value| -> Value {\n"));
        assert!(code.contains("        if __subject == json!(1) {\n            return json!(\"one\");\n        }\n"));
        assert!(code.contains("        return json!(\"many\");\n    };\n    return __match_0(x.clone());\n"));
    }

    #[test]
    fn test_manifest_follows_features() {
        let plain = generate(&ServiceIR::new("plain")).manifest.contents;
        assert!(plain.starts_with("[package]\nname = \"plain\""));
        assert!(plain.contains("axum = { version = \"0.7\", features = [\"ws\", \"macros\"] }"));
        assert!(!plain.contains("tokio-cron-scheduler"));

        let mut service = ServiceIR::new("jobs");
        service.cron_jobs.push(CronBinding {
            name: "cleanup".to_string(),
            schedule: "0 * * * *".to_string(),
            timezone: None,
            retries: 0,
            providers: vec![],
            body: vec![],
        });
        let program = generate(&service);
        assert!(program.manifest.contents.contains("tokio-cron-scheduler = \"0.10\""));
        assert!(program.source.contents.contains("Job::new_async(\"0 0 * * * *\""));
    }

    #[test]
    fn test_feature_dependencies_are_unique() {
        let features = FeatureSet {
            websocket: true,
            graphql: true,
            subscriptions: true,
            ..FeatureSet::default()
        };
        let deps = dependencies(&features);
        let futures = deps.iter().filter(|(name, _)| *name == "futures").count();
        assert_eq!(futures, 1);
    }

    #[test]
    fn test_rust_ident() {
        assert_eq!(rust_ident("type"), "r#type");
        assert_eq!(rust_ident("self"), "self_");
        assert_eq!(rust_ident("user"), "user");
    }

    fn identity_service() -> ServiceIR {
        let mut service = ServiceIR::new("s");
        service.functions.push(FunctionDef {
            name: "identity".to_string(),
            type_params: vec!["T".to_string()],
            params: vec![FieldSchema::new("x", TypeRef::named("T"))],
            return_type: Some(TypeRef::named("T")),
            body: vec![StmtIR::Return(ExprIR::var("x"))],
        });
        let mut page = TypeSchema::new("Page")
            .with_field(FieldSchema::new("items", TypeRef::array(TypeRef::named("T"))));
        page.type_params.push("T".to_string());
        service.types.push(page);
        service
    }

    #[test]
    fn test_named_types_keep_their_name() {
        let service = ServiceIR::new("s");
        assert_eq!(rust_type(&TypeRef::named("Address"), &service), "Address");
        assert_eq!(rust_type(&TypeRef::Provider("Database".to_string()), &service), "Database");
        let page = TypeRef::Generic {
            name: "Page".to_string(),
            args: vec![TypeRef::named("User")],
        };
        assert_eq!(rust_type(&page, &service), "Page<User>");
        assert_eq!(rust_type(&TypeRef::Any, &service), "Value");
    }

    #[test]
    fn test_type_params_are_declared() {
        let code = generate(&identity_service()).source.contents;
        assert!(code.contains("pub struct Page<T> {\n    pub items: Vec<T>,\n}"), "{}", code);
        let expected = [
            "fn identity<T: Serialize>(x: T) -> Value {",
            "    let x = serde_json::to_value(x).unwrap_or_default();",
            "    return x.clone();",
            "}",
        ]
        .join("\n");
        assert!(code.contains(&expected), "{}", code);
    }
}
