//! Lowering rules shared by every backend
//!
//! Everything here is target-neutral: backends decide how a plan is spelled,
//! never what it means.

use glyph_ir::*;
use heck::{ToLowerCamelCase, ToSnakeCase, ToUpperCamelCase};
use std::collections::HashSet;

// ========================================
// Sections
// ========================================

/// Top-level regions of a generated program, in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Header,
    Types,
    Providers,
    Bootstrap,
    Routes,
    GraphQl,
    Grpc,
    WebSocket,
    Cron,
    Events,
    Queues,
    Entrypoint,
}

impl Section {
    pub const ORDER: [Section; 12] = [
        Section::Header,
        Section::Types,
        Section::Providers,
        Section::Bootstrap,
        Section::Routes,
        Section::GraphQl,
        Section::Grpc,
        Section::WebSocket,
        Section::Cron,
        Section::Events,
        Section::Queues,
        Section::Entrypoint,
    ];

    /// Banner text used in section comments
    pub fn title(&self) -> &'static str {
        match self {
            Section::Header => "Imports",
            Section::Types => "Types",
            Section::Providers => "Providers",
            Section::Bootstrap => "Application",
            Section::Routes => "Routes",
            Section::GraphQl => "GraphQL",
            Section::Grpc => "gRPC",
            Section::WebSocket => "WebSocket",
            Section::Cron => "Cron Jobs",
            Section::Events => "Event Handlers",
            Section::Queues => "Queue Workers",
            Section::Entrypoint => "Entrypoint",
        }
    }
}

// ========================================
// Paths
// ========================================

/// `/users/:id` → `/users/{id}`
pub fn brace_path(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => format!("{{{}}}", name),
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parameter names of a path in either `:name` or `{name}` syntax, in order
pub fn path_params(path: &str) -> Vec<String> {
    path.split('/')
        .filter_map(|segment| {
            segment.strip_prefix(':').or_else(|| {
                segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
            })
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercase verb used by routing APIs; WebSocket and SSE routes are GETs
pub fn http_verb(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Get | HttpMethod::WebSocket | HttpMethod::Sse => "get",
        HttpMethod::Post => "post",
        HttpMethod::Put => "put",
        HttpMethod::Delete => "delete",
        HttpMethod::Patch => "patch",
    }
}

// ========================================
// Calls
// ========================================

/// How a call renders: `receiver.name(args)` or `name(args)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallShape<'a> {
    Method {
        receiver: &'a ExprIR,
        name: &'a str,
        args: &'a [ExprIR],
    },
    Function {
        name: &'a str,
        args: &'a [ExprIR],
    },
}

/// A call is a method call when its name is simple and its first argument
/// is a variable or field access
pub fn classify_call(call: &CallExpr) -> CallShape<'_> {
    match call.args.split_first() {
        Some((receiver @ (ExprIR::Var(_) | ExprIR::FieldAccess { .. }), rest))
            if !call.name.contains('.') =>
        {
            CallShape::Method {
                receiver,
                name: &call.name,
                args: rest,
            }
        }
        _ => CallShape::Function {
            name: &call.name,
            args: &call.args,
        },
    }
}

/// Right-hand side of a pipe after lowering
#[derive(Debug, Clone, PartialEq)]
pub enum PipeCall<'a> {
    /// `f(left, args..)`, never a method call
    Call { name: String, args: Vec<&'a ExprIR> },
    /// `(callee)(left)` for anything that is not a name
    Apply {
        callee: &'a ExprIR,
        arg: &'a ExprIR,
    },
}

/// `a |> f` → `f(a)`, `a |> f(b)` → `f(a, b)`
pub fn lower_pipe<'a>(left: &'a ExprIR, right: &'a ExprIR) -> PipeCall<'a> {
    match right {
        ExprIR::Call(call) => PipeCall::Call {
            name: call.name.clone(),
            args: std::iter::once(left).chain(call.args.iter()).collect(),
        },
        other => match dotted_name(other) {
            Some(name) => PipeCall::Call {
                name,
                args: vec![left],
            },
            None => PipeCall::Apply {
                callee: right,
                arg: left,
            },
        },
    }
}

/// `a.b.c` for variable and field-access chains
pub fn dotted_name(expr: &ExprIR) -> Option<String> {
    match expr {
        ExprIR::Var(name) => Some(name.clone()),
        ExprIR::FieldAccess { object, field } => {
            dotted_name(object).map(|base| format!("{}.{}", base, field))
        }
        _ => None,
    }
}

// ========================================
// Body contexts
// ========================================

/// Where a statement body runs; decides what `return` means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyContext {
    Route,
    Background,
    Rpc,
    Resolver,
    WebSocket,
    Function,
    Command,
    Closure,
}

impl BodyContext {
    /// Only HTTP routes turn a returned value into a wire response
    pub fn returns_wire_response(&self) -> bool {
        matches!(self, BodyContext::Route)
    }
}

/// Whether control can reach the end of `body`
pub fn falls_through(body: &[StmtIR]) -> bool {
    !matches!(body.last(), Some(StmtIR::Return(_)))
}

/// Variables assigned again after their declaration, in this body only
pub fn reassigned_vars(body: &[StmtIR]) -> HashSet<String> {
    fn walk(body: &[StmtIR], out: &mut HashSet<String>) {
        for stmt in body {
            match stmt {
                StmtIR::Reassign { target, .. } => {
                    out.insert(target.clone());
                }
                StmtIR::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    walk(then_body, out);
                    walk(else_body, out);
                }
                StmtIR::For { body, .. } | StmtIR::While { body, .. } => walk(body, out),
                StmtIR::Switch { cases, default, .. } => {
                    for case in cases {
                        walk(&case.body, out);
                    }
                    walk(default, out);
                }
                _ => {}
            }
        }
    }

    let mut out = HashSet::new();
    walk(body, &mut out);
    out
}

// ========================================
// Match
// ========================================

/// One step from the scrutinee to a nested value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Key(String),
    Index(usize),
    /// Elements from this index to the end
    RestFrom(usize),
}

/// A test an arm needs to pass, evaluated left to right
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    IsObject(Vec<Access>),
    HasKey(Vec<Access>, String),
    /// Array with exactly `len` elements, or at least `len` when not `exact`
    ArrayLen {
        path: Vec<Access>,
        len: usize,
        exact: bool,
    },
    Equals(Vec<Access>, LiteralValue),
}

/// A variable bound to a part of the scrutinee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub path: Vec<Access>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm<'a> {
    pub checks: Vec<Check>,
    pub bindings: Vec<Binding>,
    pub guard: Option<&'a ExprIR>,
    pub body: &'a ExprIR,
}

/// Ordered arms plus the catch-all, which always runs last
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPlan<'a> {
    pub arms: Vec<MatchArm<'a>>,
    pub default: Option<MatchArm<'a>>,
}

/// Plans a match: the first unguarded wildcard becomes the default and every
/// other arm keeps its source order
pub fn plan_match(expr: &MatchExpr) -> MatchPlan<'_> {
    let mut arms = Vec::new();
    let mut default = None;

    for case in &expr.cases {
        let arm = plan_arm(case);
        if default.is_none() && case.guard.is_none() && case.pattern.is_wildcard() {
            default = Some(arm);
        } else {
            arms.push(arm);
        }
    }

    MatchPlan { arms, default }
}

fn plan_arm(case: &MatchCase) -> MatchArm<'_> {
    let mut checks = Vec::new();
    let mut bindings = Vec::new();
    plan_pattern(&case.pattern, Vec::new(), &mut checks, &mut bindings);
    MatchArm {
        checks,
        bindings,
        guard: case.guard.as_ref(),
        body: &case.body,
    }
}

fn plan_pattern(
    pattern: &PatternIR,
    path: Vec<Access>,
    checks: &mut Vec<Check>,
    bindings: &mut Vec<Binding>,
) {
    match pattern {
        PatternIR::Wildcard => {}
        PatternIR::Variable(name) if name == "_" => {}
        PatternIR::Variable(name) => bindings.push(Binding {
            name: name.clone(),
            path,
        }),
        PatternIR::Literal(value) => checks.push(Check::Equals(path, value.clone())),
        PatternIR::Object(fields) => {
            checks.push(Check::IsObject(path.clone()));
            for field in fields {
                checks.push(Check::HasKey(path.clone(), field.key.clone()));
                let mut nested = path.clone();
                nested.push(Access::Key(field.key.clone()));
                match &field.pattern {
                    Some(inner) => plan_pattern(inner, nested, checks, bindings),
                    None => bindings.push(Binding {
                        name: field.key.clone(),
                        path: nested,
                    }),
                }
            }
        }
        PatternIR::Array { elements, rest } => {
            checks.push(Check::ArrayLen {
                path: path.clone(),
                len: elements.len(),
                exact: rest.is_none(),
            });
            for (index, element) in elements.iter().enumerate() {
                let mut nested = path.clone();
                nested.push(Access::Index(index));
                plan_pattern(element, nested, checks, bindings);
            }
            if let Some(rest) = rest {
                let mut nested = path;
                nested.push(Access::RestFrom(elements.len()));
                bindings.push(Binding {
                    name: rest.clone(),
                    path: nested,
                });
            }
        }
    }
}

// ========================================
// Types and providers
// ========================================

/// Type of a record field with its single optional layer removed, and
/// whether the field is optional
pub fn optional_field(field: &FieldSchema) -> (&TypeRef, bool) {
    let optional = !field.required || field.ty.is_optional();
    (field.ty.without_optional(), optional)
}

/// `<T, U>` for a generic declaration, empty otherwise
pub fn angle_params(type_params: &[String]) -> String {
    if type_params.is_empty() {
        String::new()
    } else {
        format!("<{}>", type_params.join(", "))
    }
}

/// Every type parameter declared by a record or function, first use first
pub fn declared_type_params(service: &ServiceIR) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let declared = service
        .types
        .iter()
        .map(|t| &t.type_params)
        .chain(service.functions.iter().map(|f| &f.type_params));
    for name in declared.flatten() {
        if seen.insert(name.clone()) {
            out.push(name.clone());
        }
    }
    out
}

/// Accessor function for a provider: `get_db` or `getDb`
pub fn accessor_name(provider_type: &str, camel: bool) -> String {
    let snake = format!("get_{}", provider_instance_name(provider_type));
    if camel {
        snake.to_lower_camel_case()
    } else {
        snake
    }
}

/// Which optional capabilities a service needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub database: bool,
    pub redis: bool,
    pub mongo: bool,
    pub llm: bool,
    pub custom_providers: bool,
    pub auth: bool,
    pub graphql: bool,
    pub subscriptions: bool,
    pub grpc: bool,
    pub websocket: bool,
    pub cron: bool,
    pub events: bool,
    pub queues: bool,
    pub commands: bool,
}

impl FeatureSet {
    pub fn of(service: &ServiceIR) -> Self {
        Self {
            database: service.uses_provider(StandardProvider::Database),
            redis: service.uses_provider(StandardProvider::Redis),
            mongo: service.uses_provider(StandardProvider::MongoDB),
            llm: service.uses_provider(StandardProvider::Llm),
            custom_providers: service.providers.iter().any(|p| !p.is_standard),
            auth: service.routes.iter().any(|r| r.auth.is_some()),
            graphql: !service.graphql.is_empty(),
            subscriptions: service.graphql_ops(GraphQlOp::Subscription).next().is_some(),
            grpc: !service.grpc.is_empty(),
            websocket: !service.websockets.is_empty(),
            cron: !service.cron_jobs.is_empty(),
            events: !service.events.is_empty(),
            queues: !service.queues.is_empty(),
            commands: !service.commands.is_empty(),
        }
    }

    /// Every capability either set needs
    pub fn union(self, other: FeatureSet) -> FeatureSet {
        FeatureSet {
            database: self.database || other.database,
            redis: self.redis || other.redis,
            mongo: self.mongo || other.mongo,
            llm: self.llm || other.llm,
            custom_providers: self.custom_providers || other.custom_providers,
            auth: self.auth || other.auth,
            graphql: self.graphql || other.graphql,
            subscriptions: self.subscriptions || other.subscriptions,
            grpc: self.grpc || other.grpc,
            websocket: self.websocket || other.websocket,
            cron: self.cron || other.cron,
            events: self.events || other.events,
            queues: self.queues || other.queues,
            commands: self.commands || other.commands,
        }
    }
}

// ========================================
// GraphQL
// ========================================

fn is_declared(service: &ServiceIR, name: &str) -> bool {
    service.type_schema(name).is_some()
}

/// Nullable GraphQL type; anything without a schema counterpart is `JSON`
pub fn graphql_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int => "Int".to_string(),
        TypeRef::Float => "Float".to_string(),
        TypeRef::String => "String".to_string(),
        TypeRef::Bool => "Boolean".to_string(),
        TypeRef::Array(inner) => format!("[{}]", graphql_type(inner, service)),
        TypeRef::Optional(inner) | TypeRef::Future(inner) => graphql_type(inner, service),
        TypeRef::Named(name) if is_declared(service, name) => name.clone(),
        _ => "JSON".to_string(),
    }
}

/// GraphQL type with `!` when the value is required
pub fn graphql_field_type(ty: &TypeRef, required: bool, service: &ServiceIR) -> String {
    let base = graphql_type(ty, service);
    if required && !ty.is_optional() {
        format!("{}!", base)
    } else {
        base
    }
}

/// Placeholder field for schemas without queries
pub const GRAPHQL_PLACEHOLDER_FIELD: &str = "serviceName";

/// Schema definition language for the service's records and resolvers
pub fn graphql_sdl(service: &ServiceIR) -> String {
    let mut lines = vec!["scalar JSON".to_string()];

    for schema in &service.types {
        lines.push(String::new());
        lines.push(format!("type {} {{", schema.name));
        for field in &schema.fields {
            lines.push(format!(
                "  {}: {}",
                field.name,
                graphql_field_type(&field.ty, field.required, service)
            ));
        }
        lines.push("}".to_string());
    }

    for op in GraphQlOp::ALL {
        let resolvers: Vec<_> = service.graphql_ops(op).collect();
        if resolvers.is_empty() && op != GraphQlOp::Query {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("type {} {{", op.root_type()));
        if resolvers.is_empty() {
            lines.push(format!("  {}: String!", GRAPHQL_PLACEHOLDER_FIELD));
        }
        for resolver in resolvers {
            let args: Vec<String> = resolver
                .params
                .iter()
                .map(|p| {
                    format!(
                        "{}: {}",
                        p.name,
                        graphql_field_type(&p.ty, p.required, service)
                    )
                })
                .collect();
            let args = if args.is_empty() {
                String::new()
            } else {
                format!("({})", args.join(", "))
            };
            let ret = resolver
                .return_type
                .as_ref()
                .map(|t| graphql_type(t, service))
                .unwrap_or_else(|| "JSON".to_string());
            lines.push(format!("  {}{}: {}", resolver.field_name, args, ret));
        }
        lines.push("}".to_string());
    }

    let mut sdl = lines.join("\n");
    sdl.push('\n');
    sdl
}

// ========================================
// gRPC
// ========================================

/// One method of a gRPC service with the handler implementing it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct GrpcMethodPlan<'a> {
    pub name: &'a str,
    pub input_type: TypeRef,
    pub return_type: TypeRef,
    pub stream: StreamKind,
    pub handler: Option<&'a GrpcHandlerDef>,
}

/// Declared methods first, then methods that only have a handler; a repeated
/// method name keeps its first declaration
pub fn grpc_method_plans(service: &GrpcServiceDef) -> Vec<GrpcMethodPlan<'_>> {
    let mut plans: Vec<GrpcMethodPlan<'_>> = Vec::new();
    for m in &service.methods {
        if plans.iter().any(|p| p.name == m.name) {
            continue;
        }
        plans.push(GrpcMethodPlan {
            name: &m.name,
            input_type: m.input_type.clone(),
            return_type: m.return_type.clone(),
            stream: m.stream,
            handler: service.handler(&m.name),
        });
    }

    for handler in &service.handlers {
        if plans.iter().any(|p| p.name == handler.method_name) {
            continue;
        }
        plans.push(GrpcMethodPlan {
            name: &handler.method_name,
            input_type: TypeRef::Any,
            return_type: handler.return_type.clone().unwrap_or(TypeRef::Any),
            stream: handler.stream,
            handler: Some(handler),
        });
    }

    plans
}

/// Scalar protobuf type; declared records keep their name
pub fn proto_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int => "int64".to_string(),
        TypeRef::Float => "double".to_string(),
        TypeRef::String => "string".to_string(),
        TypeRef::Bool => "bool".to_string(),
        TypeRef::Optional(inner) => proto_type(inner, service),
        TypeRef::Named(name) if is_declared(service, name) => name.clone(),
        _ => "google.protobuf.Value".to_string(),
    }
}

fn proto_field(name: &str, ty: &TypeRef, number: usize, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Array(inner) if !matches!(**inner, TypeRef::Array(_)) => {
            format!("repeated {} {} = {};", proto_type(inner, service), name, number)
        }
        TypeRef::Optional(_) => format!("optional {} {} = {};", proto_type(ty, service), name, number),
        other => format!("{} {} = {};", proto_type(other, service), name, number),
    }
}

/// Message carrying a method's input or output: the declared record when there
/// is one, else `{Service}{Method}Request` / `{Service}{Method}Response`
fn proto_message_name(ty: &TypeRef, def: &GrpcServiceDef, method: &str, suffix: &str, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Named(name) if is_declared(service, name) => name.clone(),
        _ => generated_message_name(def, method, suffix),
    }
}

fn generated_message_name(def: &GrpcServiceDef, method: &str, suffix: &str) -> String {
    format!("{}{}{}", def.name.to_upper_camel_case(), method, suffix)
}

/// `service X { rpc ... }` lines, with stream labels
pub fn proto_service_definition(def: &GrpcServiceDef, service: &ServiceIR) -> Vec<String> {
    let mut lines = vec![format!("service {} {{", def.name)];
    for plan in grpc_method_plans(def) {
        let input = proto_message_name(&plan.input_type, def, plan.name, "Request", service);
        let output = proto_message_name(&plan.return_type, def, plan.name, "Response", service);
        let (in_stream, out_stream) = match plan.stream {
            StreamKind::Unary => ("", ""),
            StreamKind::ServerStream => ("", "stream "),
            StreamKind::ClientStream => ("stream ", ""),
            StreamKind::Bidirectional => ("stream ", "stream "),
        };
        lines.push(format!(
            "  rpc {} ({}{}) returns ({}{});",
            plan.name, in_stream, input, out_stream, output
        ));
    }
    lines.push("}".to_string());
    lines
}

/// File name of the generated protobuf definition
pub fn proto_path(service: &ServiceIR) -> String {
    format!("proto/{}.proto", service.name.to_snake_case())
}

/// Complete `.proto` file for every gRPC service
pub fn proto_file(service: &ServiceIR) -> String {
    let mut lines = vec![
        "syntax = \"proto3\";".to_string(),
        String::new(),
        "import \"google/protobuf/struct.proto\";".to_string(),
    ];

    // A message name is emitted once even when a service repeats a method or a
    // record already carries the generated name
    let mut messages: HashSet<String> = HashSet::new();
    for schema in &service.types {
        if !messages.insert(schema.name.clone()) {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("message {} {{", schema.name));
        for (i, field) in schema.fields.iter().enumerate() {
            let ty = field.effective_type();
            lines.push(format!("  {}", proto_field(&field.name, &ty, i + 1, service)));
        }
        lines.push("}".to_string());
    }

    for def in &service.grpc {
        for plan in grpc_method_plans(def) {
            let request = generated_message_name(def, plan.name, "Request");
            let declared_input = matches!(&plan.input_type, TypeRef::Named(n) if is_declared(service, n));
            if !declared_input && messages.insert(request.clone()) {
                lines.push(String::new());
                lines.push(format!("message {} {{", request));
                if let Some(handler) = plan.handler {
                    for (i, param) in handler.params.iter().enumerate() {
                        let ty = param.effective_type();
                        lines.push(format!("  {}", proto_field(&param.name, &ty, i + 1, service)));
                    }
                }
                lines.push("}".to_string());
            }
            let response = generated_message_name(def, plan.name, "Response");
            let declared_output = matches!(&plan.return_type, TypeRef::Named(n) if is_declared(service, n));
            if !declared_output && messages.insert(response.clone()) {
                lines.push(String::new());
                lines.push(format!("message {} {{", response));
                lines.push(format!("  {}", proto_field("value", &plan.return_type, 1, service)));
                lines.push("}".to_string());
            }
        }
        lines.push(String::new());
        lines.extend(proto_service_definition(def, service));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Port the generated gRPC servers listen on
pub const GRPC_PORT: u16 = 50051;

// ========================================
// Names
// ========================================

/// Lowercase identifier fragment: runs of other characters become `_`
pub fn ident_fragment(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Appends `_2`, `_3`, ... to repeated names
pub fn unique_names(bases: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for base in bases {
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        out.push(name);
    }
    out
}

/// `GET /api/users/:id` → `get_api_users_id`
pub fn route_fn_name(route: &RouteHandler) -> String {
    let verb = route.method.as_str().to_ascii_lowercase();
    let parts: Vec<String> = route
        .path
        .split('/')
        .map(|segment| {
            segment
                .trim_start_matches(':')
                .trim_start_matches('{')
                .trim_end_matches('}')
        })
        .map(ident_fragment)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        format!("{}_root", verb)
    } else {
        format!("{}_{}", verb, parts.join("_"))
    }
}

pub fn route_fn_names(routes: &[RouteHandler]) -> Vec<String> {
    unique_names(routes.iter().map(route_fn_name))
}

/// `user.created` → `handle_user_created`
pub fn event_handler_names(events: &[EventBinding]) -> Vec<String> {
    unique_names(
        events
            .iter()
            .map(|e| format!("handle_{}", ident_fragment(&e.event_type))),
    )
}

/// `emails` → `worker_emails`
pub fn queue_worker_names(queues: &[QueueBinding]) -> Vec<String> {
    unique_names(
        queues
            .iter()
            .map(|q| format!("worker_{}", ident_fragment(&q.queue_name))),
    )
}

/// `/chat` → `ws_chat`
pub fn websocket_fn_names(websockets: &[WebSocketDef]) -> Vec<String> {
    unique_names(websockets.iter().map(|ws| {
        let fragment = ident_fragment(&ws.path);
        if fragment.is_empty() {
            "ws_root".to_string()
        } else {
            format!("ws_{}", fragment)
        }
    }))
}

pub fn cron_fn_names(jobs: &[CronBinding]) -> Vec<String> {
    unique_names(jobs.iter().map(|job| ident_fragment(&job.name)))
}

/// `migrate` → `command_migrate`
pub fn command_fn_name(name: &str) -> String {
    format!("command_{}", name.to_snake_case())
}

// ========================================
// Literals
// ========================================

/// Quotes `text` with `delimiter`, escaping what would end or break the literal
pub fn quote(text: &str, delimiter: char) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(delimiter);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

/// Float literal that always reads as a float
pub fn render_float(value: f64) -> String {
    let text = format!("{:?}", value);
    if !value.is_finite() || text.contains(['.', 'e', 'E']) {
        text
    } else {
        format!("{}.0", text)
    }
}

pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call(name: &str, args: Vec<ExprIR>) -> CallExpr {
        CallExpr {
            name: name.to_string(),
            type_args: Vec::new(),
            args,
        }
    }

    #[test]
    fn test_path_conversion() {
        assert_eq!(brace_path("/api/users/:id/posts/:postId"), "/api/users/{id}/posts/{postId}");
        assert_eq!(brace_path("/health"), "/health");
        assert_eq!(
            path_params("/api/users/:id/posts/:postId"),
            vec!["id".to_string(), "postId".to_string()]
        );
        assert_eq!(
            path_params(&brace_path("/api/users/:id/posts/:postId")),
            vec!["id".to_string(), "postId".to_string()]
        );
    }

    #[test]
    fn test_classify_call() {
        let get = call(
            "Get",
            vec![ExprIR::field(ExprIR::var("db"), "users"), ExprIR::var("id")],
        );
        match classify_call(&get) {
            CallShape::Method { receiver, name, args } => {
                assert_eq!(receiver, &ExprIR::field(ExprIR::var("db"), "users"));
                assert_eq!(name, "Get");
                assert_eq!(args, &[ExprIR::var("id")]);
            }
            other => panic!("expected a method call, got {:?}", other),
        }

        // literal first argument
        let len = call("len", vec![ExprIR::string("abc")]);
        assert!(matches!(classify_call(&len), CallShape::Function { name: "len", .. }));

        // dotted names are never methods
        let parse = call("JSON.parse", vec![ExprIR::var("body")]);
        assert!(matches!(classify_call(&parse), CallShape::Function { .. }));

        let now = call("now", vec![]);
        assert!(matches!(classify_call(&now), CallShape::Function { .. }));
    }

    #[test]
    fn test_lower_pipe() {
        let data = ExprIR::var("data");
        let transform = ExprIR::var("transform");
        assert_eq!(
            lower_pipe(&data, &transform),
            PipeCall::Call {
                name: "transform".to_string(),
                args: vec![&data],
            }
        );

        let limit = ExprIR::Call(call("take", vec![ExprIR::Int(10)]));
        let PipeCall::Call { name, args } = lower_pipe(&data, &limit) else {
            panic!("expected a call");
        };
        assert_eq!(name, "take");
        assert_eq!(args, vec![&data, &ExprIR::Int(10)]);
    }

    #[test]
    fn test_only_routes_return_responses() {
        assert!(BodyContext::Route.returns_wire_response());
        for ctx in [
            BodyContext::Background,
            BodyContext::Rpc,
            BodyContext::Resolver,
            BodyContext::WebSocket,
            BodyContext::Function,
            BodyContext::Command,
            BodyContext::Closure,
        ] {
            assert!(!ctx.returns_wire_response());
        }
    }

    fn case(pattern: PatternIR, guard: Option<ExprIR>, body: i64) -> MatchCase {
        MatchCase {
            pattern,
            guard,
            body: ExprIR::Int(body),
        }
    }

    #[test]
    fn test_wildcard_moves_to_the_end() {
        let expr = MatchExpr {
            value: Box::new(ExprIR::var("x")),
            cases: vec![
                case(PatternIR::Literal(LiteralValue::Int(1)), None, 1),
                case(PatternIR::Literal(LiteralValue::Int(2)), None, 2),
                case(PatternIR::Wildcard, None, 0),
                case(PatternIR::Literal(LiteralValue::Int(3)), None, 3),
            ],
        };

        let plan = plan_match(&expr);
        let bodies: Vec<_> = plan.arms.iter().map(|a| a.body.clone()).collect();
        assert_eq!(bodies, vec![ExprIR::Int(1), ExprIR::Int(2), ExprIR::Int(3)]);
        assert_eq!(plan.default.map(|d| d.body.clone()), Some(ExprIR::Int(0)));
    }

    #[test]
    fn test_guarded_wildcard_is_a_regular_arm() {
        let expr = MatchExpr {
            value: Box::new(ExprIR::var("x")),
            cases: vec![
                case(PatternIR::Wildcard, Some(ExprIR::Bool(true)), 1),
                case(PatternIR::Variable("n".to_string()), None, 2),
            ],
        };
        let plan = plan_match(&expr);
        assert_eq!(plan.arms.len(), 2);
        assert!(plan.default.is_none());
        assert_eq!(
            plan.arms[1].bindings,
            vec![Binding {
                name: "n".to_string(),
                path: vec![],
            }]
        );
    }

    #[test]
    fn test_object_and_array_patterns() {
        let pattern = PatternIR::Object(vec![
            ObjectPatternField {
                key: "role".to_string(),
                pattern: Some(PatternIR::Literal(LiteralValue::String("admin".to_string()))),
            },
            ObjectPatternField {
                key: "name".to_string(),
                pattern: None,
            },
        ]);
        let expr = MatchExpr {
            value: Box::new(ExprIR::var("user")),
            cases: vec![case(pattern, None, 1)],
        };
        let plan = plan_match(&expr);
        let arm = &plan.arms[0];
        assert_eq!(
            arm.checks,
            vec![
                Check::IsObject(vec![]),
                Check::HasKey(vec![], "role".to_string()),
                Check::Equals(
                    vec![Access::Key("role".to_string())],
                    LiteralValue::String("admin".to_string())
                ),
                Check::HasKey(vec![], "name".to_string()),
            ]
        );
        assert_eq!(arm.bindings[0].path, vec![Access::Key("name".to_string())]);

        let pattern = PatternIR::Array {
            elements: vec![PatternIR::Variable("head".to_string())],
            rest: Some("tail".to_string()),
        };
        let expr = MatchExpr {
            value: Box::new(ExprIR::var("items")),
            cases: vec![case(pattern, None, 1)],
        };
        let plan = plan_match(&expr);
        let arm = &plan.arms[0];
        assert_eq!(
            arm.checks,
            vec![Check::ArrayLen {
                path: vec![],
                len: 1,
                exact: false,
            }]
        );
        assert_eq!(arm.bindings[1].path, vec![Access::RestFrom(1)]);
    }

    #[test]
    fn test_optional_field_unwraps_once() {
        let field = FieldSchema::new("nick", TypeRef::String.optional()).optional();
        assert_eq!(optional_field(&field), (&TypeRef::String, true));

        let field = FieldSchema::new("age", TypeRef::Int).optional();
        assert_eq!(optional_field(&field), (&TypeRef::Int, true));

        let field = FieldSchema::new("id", TypeRef::Int);
        assert_eq!(optional_field(&field), (&TypeRef::Int, false));
    }

    #[test]
    fn test_accessor_names() {
        assert_eq!(accessor_name("Database", false), "get_db");
        assert_eq!(accessor_name("Database", true), "getDb");
        assert_eq!(accessor_name("MongoDB", true), "getMongo");
        assert_eq!(accessor_name("ImageProcessor", false), "get_image_processor");
        assert_eq!(accessor_name("ImageProcessor", true), "getImageProcessor");
    }

    #[test]
    fn test_graphql_sdl() {
        let mut service = ServiceIR::new("users");
        service.types.push(
            TypeSchema::new("User")
                .with_field(FieldSchema::new("id", TypeRef::Int))
                .with_field(FieldSchema::new("age", TypeRef::Int).optional()),
        );
        service.graphql.push(GraphQlDef {
            operation: GraphQlOp::Query,
            field_name: "getUser".to_string(),
            params: vec![FieldSchema::new("id", TypeRef::Int)],
            return_type: Some(TypeRef::named("User")),
            auth: None,
            providers: vec![],
            body: vec![],
        });

        let sdl = graphql_sdl(&service);
        assert!(sdl.contains("type User {\n  id: Int!\n  age: Int\n}"));
        assert!(sdl.contains("type Query {\n  getUser(id: Int!): User\n}"));
        assert!(!sdl.contains("type Mutation"));
    }

    #[test]
    fn test_grpc_plans_declared_then_handler_only() {
        let mut def = GrpcServiceDef::new("UserService");
        def.methods.push(GrpcMethodDef {
            name: "GetUser".to_string(),
            input_type: TypeRef::Any,
            return_type: TypeRef::named("User"),
            stream: StreamKind::Unary,
        });
        def.handlers.push(GrpcHandlerDef {
            service_name: "UserService".to_string(),
            method_name: "WatchUsers".to_string(),
            params: vec![],
            return_type: None,
            stream: StreamKind::ServerStream,
            auth: None,
            providers: vec![],
            body: vec![],
        });

        let plans = grpc_method_plans(&def);
        let names: Vec<_> = plans.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["GetUser", "WatchUsers"]);
        assert!(plans[0].handler.is_none());

        let mut service = ServiceIR::new("users");
        service.types.push(TypeSchema::new("User"));
        let proto = proto_service_definition(&def, &service);
        assert_eq!(proto[1], "  rpc GetUser (UserServiceGetUserRequest) returns (User);");
        assert_eq!(
            proto[2],
            "  rpc WatchUsers (UserServiceWatchUsersRequest) returns (stream UserServiceWatchUsersResponse);"
        );
    }

    #[test]
    fn test_proto_messages_are_namespaced_by_service() {
        let mut service = ServiceIR::new("shop");
        service.types.push(TypeSchema::new("GetRequest"));
        for name in ["Users", "Orders"] {
            let mut def = GrpcServiceDef::new(name);
            def.methods.push(GrpcMethodDef {
                name: "Get".to_string(),
                input_type: TypeRef::Any,
                return_type: TypeRef::Any,
                stream: StreamKind::Unary,
            });
            service.grpc.push(def);
        }

        let proto = proto_file(&service);
        for message in [
            "message GetRequest {",
            "message UsersGetRequest {",
            "message UsersGetResponse {",
            "message OrdersGetRequest {",
            "message OrdersGetResponse {",
        ] {
            assert_eq!(proto.matches(message).count(), 1, "{}\n{}", message, proto);
        }
        assert!(proto.contains("  rpc Get (UsersGetRequest) returns (UsersGetResponse);"));
        assert!(proto.contains("  rpc Get (OrdersGetRequest) returns (OrdersGetResponse);"));
    }

    #[test]
    fn test_repeated_method_emits_one_message() {
        let mut service = ServiceIR::new("shop");
        let mut def = GrpcServiceDef::new("Users");
        for _ in 0..2 {
            def.methods.push(GrpcMethodDef {
                name: "Get".to_string(),
                input_type: TypeRef::Any,
                return_type: TypeRef::Int,
                stream: StreamKind::Unary,
            });
        }
        service.grpc.push(def);

        let proto = proto_file(&service);
        assert_eq!(proto.matches("message UsersGetRequest {").count(), 1, "{}", proto);
        assert_eq!(proto.matches("message UsersGetResponse {").count(), 1, "{}", proto);
        assert_eq!(proto.matches("  rpc Get (").count(), 1, "{}", proto);
    }

    #[test]
    fn test_names() {
        let route = RouteHandler {
            method: HttpMethod::Get,
            path: "/api/users/:id".to_string(),
            path_params: vec!["id".to_string()],
            query_params: vec![],
            input_type: None,
            return_type: None,
            auth: None,
            rate_limit: None,
            middleware: vec![],
            providers: vec![],
            body: vec![],
        };
        assert_eq!(route_fn_name(&route), "get_api_users_id");

        let root = RouteHandler {
            path: "/".to_string(),
            ..route.clone()
        };
        assert_eq!(route_fn_names(&[route, root.clone(), root]), vec![
            "get_api_users_id".to_string(),
            "get_root".to_string(),
            "get_root_2".to_string(),
        ]);
        assert_eq!(ident_fragment("user.created"), "user_created");
        assert_eq!(ident_fragment("2fa-codes"), "_2fa_codes");
    }

    #[test]
    fn test_literals() {
        assert_eq!(quote("it's", '\''), "'it\\'s'");
        assert_eq!(quote("a\"b\n", '"'), "\"a\\\"b\\n\"");
        assert_eq!(render_float(2.0), "2.0");
        assert_eq!(render_float(1.5), "1.5");
        assert!(is_identifier("userId"));
        assert!(!is_identifier("user-id"));
    }

    #[test]
    fn test_feature_union_is_monotonic() {
        let mut with_db = ServiceIR::new("a");
        with_db.providers.push(ProviderRef::new("Database"));
        let plain = ServiceIR::new("b");

        let union = FeatureSet::of(&with_db).union(FeatureSet::of(&plain));
        assert!(union.database);
        assert_eq!(union, FeatureSet::of(&plain).union(FeatureSet::of(&with_db)));
    }
}
