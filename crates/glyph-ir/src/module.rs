//! IR Service
//!
//! The root of the IR tree and every binding it can carry.

use serde::Serialize;
use std::fmt;

use crate::expr::{ExprIR, StmtIR};
use crate::types::{FieldSchema, TypeRef, TypeSchema};

/// Built-in provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StandardProvider {
    Database,
    Redis,
    MongoDB,
    #[serde(rename = "LLM")]
    Llm,
}

impl StandardProvider {
    pub const ALL: [StandardProvider; 4] = [
        StandardProvider::Database,
        StandardProvider::Redis,
        StandardProvider::MongoDB,
        StandardProvider::Llm,
    ];

    /// Canonical provider-type name
    pub fn type_name(&self) -> &'static str {
        match self {
            StandardProvider::Database => "Database",
            StandardProvider::Redis => "Redis",
            StandardProvider::MongoDB => "MongoDB",
            StandardProvider::Llm => "LLM",
        }
    }

    /// Instance name used in generated code
    pub fn instance_name(&self) -> &'static str {
        match self {
            StandardProvider::Database => "db",
            StandardProvider::Redis => "redis",
            StandardProvider::MongoDB => "mongo",
            StandardProvider::Llm => "llm",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.type_name() == name)
    }
}

impl fmt::Display for StandardProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Instance name for a provider type: `db` for `Database`, `image_processor`
/// for `ImageProcessor`
pub fn provider_instance_name(provider_type: &str) -> String {
    use heck::ToSnakeCase;

    match StandardProvider::from_type_name(provider_type) {
        Some(standard) => standard.instance_name().to_string(),
        None => provider_type.to_snake_case(),
    }
}

/// Method signature copied from a provider contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<FieldSchema>,
    pub return_type: TypeRef,
}

/// A dependency the service needs, registered once per provider type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRef {
    pub name: String,
    pub provider_type: String,
    pub is_standard: bool,
    pub methods: Vec<MethodSig>,
}

impl ProviderRef {
    pub fn new(provider_type: impl Into<String>) -> Self {
        let provider_type = provider_type.into();
        Self {
            name: provider_instance_name(&provider_type),
            is_standard: StandardProvider::from_type_name(&provider_type).is_some(),
            provider_type,
            methods: Vec::new(),
        }
    }

    pub fn standard(&self) -> Option<StandardProvider> {
        StandardProvider::from_type_name(&self.provider_type)
    }
}

/// Local reference from a binding to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InjectionRef {
    pub name: String,
    pub provider_type: String,
}

impl InjectionRef {
    pub fn new(name: impl Into<String>, provider_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type: provider_type.into(),
        }
    }
}

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    WebSocket,
    Sse,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::WebSocket => "WS",
            HttpMethod::Sse => "SSE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryParam {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default: Option<ExprIR>,
    pub is_array: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequirement {
    pub auth_type: String,
    pub required: bool,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiddlewareRef {
    pub name: String,
    pub args: Vec<ExprIR>,
}

/// HTTP route handler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteHandler {
    pub method: HttpMethod,
    /// Path in `:name` syntax
    pub path: String,
    pub path_params: Vec<String>,
    pub query_params: Vec<QueryParam>,
    pub input_type: Option<TypeRef>,
    pub return_type: Option<TypeRef>,
    pub auth: Option<AuthRequirement>,
    pub rate_limit: Option<RateLimitConfig>,
    pub middleware: Vec<MiddlewareRef>,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

impl RouteHandler {
    /// `GET /api/users/:id`
    pub fn display_name(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBinding {
    pub event_type: String,
    pub is_async: bool,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronBinding {
    pub name: String,
    /// Five-field crontab expression
    pub schedule: String,
    pub timezone: Option<String>,
    pub retries: u32,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueBinding {
    pub queue_name: String,
    pub concurrency: u32,
    pub max_retries: u32,
    pub timeout_secs: u32,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandParam {
    pub name: String,
    pub ty: TypeRef,
    pub required: bool,
    pub default: Option<ExprIR>,
    pub is_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandDef {
    pub name: String,
    pub description: String,
    pub params: Vec<CommandParam>,
    pub return_type: Option<TypeRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDef {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<FieldSchema>,
    pub return_type: Option<TypeRef>,
    pub body: Vec<StmtIR>,
}

/// gRPC streaming mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StreamKind {
    #[default]
    Unary,
    ServerStream,
    ClientStream,
    Bidirectional,
}

impl StreamKind {
    pub fn is_streaming(&self) -> bool {
        !matches!(self, StreamKind::Unary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrpcMethodDef {
    pub name: String,
    pub input_type: TypeRef,
    pub return_type: TypeRef,
    pub stream: StreamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrpcHandlerDef {
    pub service_name: String,
    pub method_name: String,
    pub params: Vec<FieldSchema>,
    pub return_type: Option<TypeRef>,
    pub stream: StreamKind,
    pub auth: Option<AuthRequirement>,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrpcServiceDef {
    pub name: String,
    pub methods: Vec<GrpcMethodDef>,
    pub handlers: Vec<GrpcHandlerDef>,
}

impl GrpcServiceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn handler(&self, method_name: &str) -> Option<&GrpcHandlerDef> {
        self.handlers.iter().find(|h| h.method_name == method_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GraphQlOp {
    Query,
    Mutation,
    Subscription,
}

impl GraphQlOp {
    pub const ALL: [GraphQlOp; 3] = [GraphQlOp::Query, GraphQlOp::Mutation, GraphQlOp::Subscription];

    /// Root type name in the schema
    pub fn root_type(&self) -> &'static str {
        match self {
            GraphQlOp::Query => "Query",
            GraphQlOp::Mutation => "Mutation",
            GraphQlOp::Subscription => "Subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlDef {
    pub operation: GraphQlOp,
    pub field_name: String,
    pub params: Vec<FieldSchema>,
    pub return_type: Option<TypeRef>,
    pub auth: Option<AuthRequirement>,
    pub providers: Vec<InjectionRef>,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WsEvent {
    Connect,
    Disconnect,
    Message,
    Error,
}

impl WsEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsEvent::Connect => "connect",
            WsEvent::Disconnect => "disconnect",
            WsEvent::Message => "message",
            WsEvent::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsEventDef {
    pub event: WsEvent,
    pub body: Vec<StmtIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketDef {
    pub path: String,
    pub events: Vec<WsEventDef>,
}

impl WebSocketDef {
    pub fn event(&self, event: WsEvent) -> Option<&WsEventDef> {
        self.events.iter().find(|e| e.event == event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstantDef {
    pub name: String,
    pub ty: Option<TypeRef>,
    pub value: ExprIR,
}

/// Kind of declaration a build error or diagnostic refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BindingKind {
    Type,
    Route,
    Function,
    CronJob,
    EventHandler,
    QueueWorker,
    Command,
    GrpcService,
    GrpcHandler,
    GraphQlResolver,
    WebSocketRoute,
    Constant,
    ProviderContract,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BindingKind::Type => "type",
            BindingKind::Route => "route",
            BindingKind::Function => "function",
            BindingKind::CronJob => "cron job",
            BindingKind::EventHandler => "event handler",
            BindingKind::QueueWorker => "queue worker",
            BindingKind::Command => "command",
            BindingKind::GrpcService => "gRPC service",
            BindingKind::GrpcHandler => "gRPC handler",
            BindingKind::GraphQlResolver => "GraphQL resolver",
            BindingKind::WebSocketRoute => "WebSocket route",
            BindingKind::Constant => "constant",
            BindingKind::ProviderContract => "provider contract",
        };
        write!(f, "{}", text)
    }
}

/// The whole service: built once, then only read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceIR {
    pub name: String,
    pub types: Vec<TypeSchema>,
    /// One entry per provider type, in first-injection order
    pub providers: Vec<ProviderRef>,
    pub routes: Vec<RouteHandler>,
    pub events: Vec<EventBinding>,
    pub cron_jobs: Vec<CronBinding>,
    pub queues: Vec<QueueBinding>,
    pub commands: Vec<CommandDef>,
    pub functions: Vec<FunctionDef>,
    pub grpc: Vec<GrpcServiceDef>,
    pub graphql: Vec<GraphQlDef>,
    pub websockets: Vec<WebSocketDef>,
    pub constants: Vec<ConstantDef>,
}

impl ServiceIR {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
            providers: Vec::new(),
            routes: Vec::new(),
            events: Vec::new(),
            cron_jobs: Vec::new(),
            queues: Vec::new(),
            commands: Vec::new(),
            functions: Vec::new(),
            grpc: Vec::new(),
            graphql: Vec::new(),
            websockets: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn type_schema(&self, name: &str) -> Option<&TypeSchema> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn provider(&self, provider_type: &str) -> Option<&ProviderRef> {
        self.providers.iter().find(|p| p.provider_type == provider_type)
    }

    pub fn uses_provider(&self, provider: StandardProvider) -> bool {
        self.provider(provider.type_name()).is_some()
    }

    pub fn graphql_ops(&self, op: GraphQlOp) -> impl Iterator<Item = &GraphQlDef> {
        self.graphql.iter().filter(move |g| g.operation == op)
    }

    /// Number of bindings across every kind
    pub fn binding_count(&self) -> usize {
        self.routes.len()
            + self.events.len()
            + self.cron_jobs.len()
            + self.queues.len()
            + self.commands.len()
            + self.functions.len()
            + self.grpc.len()
            + self.graphql.len()
            + self.websockets.len()
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[StmtIR], depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    for stmt in body {
        match stmt {
            StmtIR::Assign { target, value } => writeln!(f, "{}${} = {}", pad, target, value)?,
            StmtIR::Reassign { target, value } => writeln!(f, "{}{} = {}", pad, target, value)?,
            StmtIR::Return(value) => writeln!(f, "{}return {}", pad, value)?,
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => {
                writeln!(f, "{}if {}", pad, condition)?;
                write_body(f, then_body, depth + 1)?;
                if !else_body.is_empty() {
                    writeln!(f, "{}else", pad)?;
                    write_body(f, else_body, depth + 1)?;
                }
            }
            StmtIR::For {
                key,
                value,
                iterable,
                body,
            } => {
                match key {
                    Some(key) => writeln!(f, "{}for {}, {} in {}", pad, key, value, iterable)?,
                    None => writeln!(f, "{}for {} in {}", pad, value, iterable)?,
                }
                write_body(f, body, depth + 1)?;
            }
            StmtIR::While { condition, body } => {
                writeln!(f, "{}while {}", pad, condition)?;
                write_body(f, body, depth + 1)?;
            }
            StmtIR::Switch {
                value,
                cases,
                default,
            } => {
                writeln!(f, "{}switch {}", pad, value)?;
                for case in cases {
                    writeln!(f, "{}  case {}", pad, case.value)?;
                    write_body(f, &case.body, depth + 2)?;
                }
                if !default.is_empty() {
                    writeln!(f, "{}  default", pad)?;
                    write_body(f, default, depth + 2)?;
                }
            }
            StmtIR::Expr(ExprIR::Null) => writeln!(f, "{}noop", pad)?,
            StmtIR::Expr(expr) => writeln!(f, "{}{}", pad, expr)?,
            StmtIR::Validate(expr) => writeln!(f, "{}validate {}", pad, expr)?,
            StmtIR::Break => writeln!(f, "{}break", pad)?,
            StmtIR::Continue => writeln!(f, "{}continue", pad)?,
        }
    }
    Ok(())
}

fn write_injections(f: &mut fmt::Formatter<'_>, providers: &[InjectionRef]) -> fmt::Result {
    for injection in providers {
        writeln!(f, "  % {}: {}", injection.name, injection.provider_type)?;
    }
    Ok(())
}

impl fmt::Display for ServiceIR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; Service: {}", self.name)?;
        writeln!(f)?;

        if !self.providers.is_empty() {
            writeln!(f, "; Providers")?;
            for provider in &self.providers {
                let kind = if provider.is_standard { "standard" } else { "custom" };
                writeln!(f, ";   {} -> {} ({})", provider.name, provider.provider_type, kind)?;
                for method in &provider.methods {
                    write!(f, ";     {}(", method.name)?;
                    for (i, p) in method.params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {}", p.name, p.ty)?;
                    }
                    writeln!(f, ") -> {}", method.return_type)?;
                }
            }
            writeln!(f)?;
        }

        for schema in &self.types {
            writeln!(f, "; Type {}", schema.name)?;
            for field in &schema.fields {
                writeln!(f, "  {}: {}", field.name, field.effective_type())?;
            }
        }
        if !self.types.is_empty() {
            writeln!(f)?;
        }

        for constant in &self.constants {
            writeln!(f, "; Const {} = {}", constant.name, constant.value)?;
        }

        for function in &self.functions {
            write!(f, "; Function {}(", function.name)?;
            for (i, p) in function.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", p.name, p.ty)?;
            }
            match &function.return_type {
                Some(ret) => writeln!(f, ") -> {}", ret)?,
                None => writeln!(f, ")")?,
            }
            write_body(f, &function.body, 1)?;
        }

        for command in &self.commands {
            writeln!(f, "; Command {}", command.name)?;
            write_body(f, &command.body, 1)?;
        }

        for route in &self.routes {
            writeln!(f, "; Route {}", route.display_name())?;
            write_injections(f, &route.providers)?;
            write_body(f, &route.body, 1)?;
        }

        for resolver in &self.graphql {
            writeln!(
                f,
                "; GraphQL {}.{}",
                resolver.operation.root_type(),
                resolver.field_name
            )?;
            write_injections(f, &resolver.providers)?;
            write_body(f, &resolver.body, 1)?;
        }

        for service in &self.grpc {
            writeln!(f, "; gRPC {}", service.name)?;
            for method in &service.methods {
                writeln!(
                    f,
                    ";   rpc {}({}) -> {}",
                    method.name, method.input_type, method.return_type
                )?;
            }
            for handler in &service.handlers {
                writeln!(f, ";   handler {}", handler.method_name)?;
                write_injections(f, &handler.providers)?;
                write_body(f, &handler.body, 1)?;
            }
        }

        for ws in &self.websockets {
            writeln!(f, "; WebSocket {}", ws.path)?;
            for event in &ws.events {
                writeln!(f, ";   on {}", event.event.as_str())?;
                write_body(f, &event.body, 1)?;
            }
        }

        for job in &self.cron_jobs {
            writeln!(f, "; Cron {} \"{}\"", job.name, job.schedule)?;
            write_injections(f, &job.providers)?;
            write_body(f, &job.body, 1)?;
        }

        for event in &self.events {
            writeln!(f, "; Event \"{}\"", event.event_type)?;
            write_injections(f, &event.providers)?;
            write_body(f, &event.body, 1)?;
        }

        for queue in &self.queues {
            writeln!(f, "; Queue \"{}\"", queue.queue_name)?;
            write_injections(f, &queue.providers)?;
            write_body(f, &queue.body, 1)?;
        }

        Ok(())
    }
}
