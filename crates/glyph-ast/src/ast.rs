//! AST - Surface syntax tree for Glyph programs

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Complete program (one parsed source file)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Program {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }

    /// Name given by the `module` declaration, if any
    pub fn module_name(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            Item::Module(decl) => Some(decl.name.as_str()),
            _ => None,
        })
    }
}

/// Top-level declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
    /// `module users`
    Module(ModuleDecl),
    /// `import "./shared"`
    Import(ImportStatement),
    /// `: User { id: int! name: str! }`
    TypeDef(TypeDef),
    /// `@ GET /api/users/:id`
    Route(Route),
    /// `! fn add(a: int, b: int) -> int`
    Function(Function),
    /// `* "0 * * * *" cleanup`
    Cron(CronTask),
    /// `~ "user.created"`
    Event(EventHandler),
    /// `& "emails"`
    Queue(QueueWorker),
    /// `! migrate --dry-run`
    Command(Command),
    /// `rpc UserService { ... }`
    GrpcService(GrpcService),
    /// `@ rpc UserService.GetUser`
    GrpcHandler(GrpcHandler),
    /// `@ query getUser(id: int) -> User`
    #[serde(rename = "graphql")]
    GraphQl(GraphQlResolver),
    /// `@ ws /chat`
    #[serde(rename = "websocket")]
    WebSocket(WebSocketRoute),
    /// `const MAX_USERS = 100`
    Const(ConstDecl),
    /// `provider ImageProcessor { ... }`
    Provider(ProviderDef),
    /// `test "creates a user" { ... }`
    Test(TestBlock),
    /// `macro crud(name) { ... }`
    MacroDef(MacroDef),
    /// `trait Serializable { ... }`
    Trait(TraitDef),
    /// `static /assets "./public"`
    StaticRoute(StaticRoute),
    /// Any declaration this compiler does not recognize
    #[serde(other)]
    Unsupported,
}

impl Item {
    /// The surface keyword for this item, used in diagnostics
    pub fn keyword(&self) -> &'static str {
        match self {
            Item::Module(_) => "module",
            Item::Import(_) => "import",
            Item::TypeDef(_) => "type_def",
            Item::Route(_) => "route",
            Item::Function(_) => "function",
            Item::Cron(_) => "cron",
            Item::Event(_) => "event",
            Item::Queue(_) => "queue",
            Item::Command(_) => "command",
            Item::GrpcService(_) => "grpc_service",
            Item::GrpcHandler(_) => "grpc_handler",
            Item::GraphQl(_) => "graphql",
            Item::WebSocket(_) => "websocket",
            Item::Const(_) => "const",
            Item::Provider(_) => "provider",
            Item::Test(_) => "test",
            Item::MacroDef(_) => "macro_def",
            Item::Trait(_) => "trait",
            Item::StaticRoute(_) => "static_route",
            Item::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportStatement {
    pub path: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Record type declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

/// Record field, function parameter or lambda parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Absent when the source left the type out
    #[serde(rename = "type", default)]
    pub ty: Option<Type>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Expr>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Field {
    /// A required field of the given type
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            required: true,
            default: None,
            annotations: Vec::new(),
        }
    }

    /// Marks the field as optional (`age: int` without `!`)
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Expr) -> Self {
        self.default = Some(value);
        self
    }
}

/// Field annotation: `@minLen(2)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Literal>,
}

/// Method declared inside a record type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Field>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// HTTP methods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    #[serde(rename = "WS")]
    WebSocket,
    Sse,
}

/// HTTP route declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub input_type: Option<Type>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub middleware: Vec<MiddlewareUse>,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub query_params: Vec<QueryParamDecl>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// `+ auth(jwt, role: admin)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// `+ ratelimit(100/min)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window: String,
}

/// `+ cors("*")`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareUse {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Expr>,
}

/// Dependency injection: `% db: Database`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Type>,
}

impl Injection {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
        }
    }
}

/// `? page: int = 1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParamDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Type>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Expr>,
    #[serde(default)]
    pub is_array: bool,
}

/// Free function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<String>,
    #[serde(default)]
    pub params: Vec<Field>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// Scheduled task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronTask {
    #[serde(default)]
    pub name: String,
    pub schedule: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// Event subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventHandler {
    pub event_type: String,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// Queue consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueWorker {
    pub queue_name: String,
    #[serde(default)]
    pub concurrency: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Seconds
    #[serde(default)]
    pub timeout: u32,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// CLI command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<CommandParamDecl>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParamDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Type>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Expr>,
    #[serde(default)]
    pub is_flag: bool,
}

/// gRPC streaming mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    #[default]
    Unary,
    ServerStream,
    ClientStream,
    Bidirectional,
}

/// gRPC service declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcService {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<GrpcMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcMethod {
    pub name: String,
    #[serde(default)]
    pub input_type: Option<Type>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub stream: StreamType,
}

/// Implementation of one gRPC method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcHandler {
    pub service_name: String,
    pub method_name: String,
    #[serde(default)]
    pub params: Vec<Field>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub stream: StreamType,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// GraphQL operation kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphQlOperation {
    #[default]
    Query,
    Mutation,
    Subscription,
}

/// GraphQL resolver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResolver {
    #[serde(default)]
    pub operation: GraphQlOperation,
    pub field_name: String,
    #[serde(default)]
    pub params: Vec<Field>,
    #[serde(default)]
    pub return_type: Option<Type>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub injections: Vec<Injection>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// WebSocket lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsEventKind {
    Connect,
    Disconnect,
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEventHandler {
    pub event: WsEventKind,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// WebSocket endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketRoute {
    pub path: String,
    #[serde(default)]
    pub events: Vec<WsEventHandler>,
}

/// Module-level constant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: Option<Type>,
    #[serde(default)]
    pub value: Option<Expr>,
}

/// Provider contract: the method signatures of a custom dependency
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDef {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<ProviderMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMethod {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Field>,
    #[serde(default)]
    pub return_type: Option<Type>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestBlock {
    pub name: String,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraitDef {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<ProviderMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub path: String,
    #[serde(default)]
    pub dir: String,
}

/// Types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    /// Primitive types
    Int,
    Float,
    String,
    Bool,
    /// Array: `[T]`
    Array { element: Box<Type> },
    /// Optional: `T?`
    Optional { inner: Box<Type> },
    /// User-defined type
    Named { name: String },
    /// Built-in providers
    Database,
    Redis,
    #[serde(rename = "mongodb")]
    MongoDb,
    Llm,
    /// Union: `A | B`
    Union { types: Vec<Type> },
    /// Generic type: `List<T>`
    Generic {
        base: Box<Type>,
        #[serde(default)]
        args: Vec<Type>,
    },
    /// Function type: `(int, int) -> int`
    Function {
        #[serde(default)]
        params: Vec<Type>,
        #[serde(default)]
        ret: Option<Box<Type>>,
    },
    /// Future: `Future<T>`
    Future { result: Box<Type> },
    /// Reference to a type parameter in scope
    TypeParam { name: String },
    #[serde(other)]
    Unsupported,
}

impl Type {
    pub fn named(name: impl Into<String>) -> Self {
        Type::Named { name: name.into() }
    }

    pub fn array(element: Type) -> Self {
        Type::Array {
            element: Box::new(element),
        }
    }

    pub fn optional(inner: Type) -> Self {
        Type::Optional {
            inner: Box::new(inner),
        }
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    /// `$ x = expr`
    Assign { target: String, value: Expr },
    /// `x = expr`
    Reassign { target: String, value: Expr },
    /// `> expr`
    Return {
        #[serde(default)]
        value: Option<Expr>,
    },
    /// `if cond { ... } else { ... }`
    If {
        condition: Expr,
        #[serde(default)]
        then_block: Vec<Stmt>,
        #[serde(default)]
        else_block: Vec<Stmt>,
    },
    /// `for k, v in items { ... }`
    For {
        #[serde(default)]
        key: Option<String>,
        value: String,
        iterable: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `while cond { ... }`
    While {
        condition: Expr,
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `switch value { case 1 { ... } default { ... } }`
    Switch {
        value: Expr,
        #[serde(default)]
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Vec<Stmt>,
    },
    /// Expression as statement
    Expr { expr: Expr },
    /// `validate isEmail(input.email)`
    Validate { call: Expr },
    Break,
    Continue,
    /// Raw database query: `db.query("SELECT ...")`
    DbQuery {
        query: String,
        #[serde(default)]
        params: Vec<Expr>,
    },
    /// `ws.send(client, message)`
    WsSend { client: Expr, message: Expr },
    /// `ws.broadcast(message)`
    WsBroadcast {
        message: Expr,
        #[serde(default)]
        room: Option<Expr>,
    },
    /// `ws.close(reason)`
    WsClose {
        #[serde(default)]
        reason: Option<Expr>,
    },
    /// `crud!(User)`
    MacroInvocation {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    #[serde(other)]
    Unsupported,
}

impl Stmt {
    pub fn ret(value: Expr) -> Self {
        Stmt::Return { value: Some(value) }
    }

    pub fn assign(target: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            target: target.into(),
            value,
        }
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr { expr }
    }

    /// The surface keyword for this statement, used in diagnostics
    pub fn keyword(&self) -> &'static str {
        match self {
            Stmt::Assign { .. } => "assign",
            Stmt::Reassign { .. } => "reassign",
            Stmt::Return { .. } => "return",
            Stmt::If { .. } => "if",
            Stmt::For { .. } => "for",
            Stmt::While { .. } => "while",
            Stmt::Switch { .. } => "switch",
            Stmt::Expr { .. } => "expr",
            Stmt::Validate { .. } => "validate",
            Stmt::Break => "break",
            Stmt::Continue => "continue",
            Stmt::DbQuery { .. } => "db_query",
            Stmt::WsSend { .. } => "ws_send",
            Stmt::WsBroadcast { .. } => "ws_broadcast",
            Stmt::WsClose { .. } => "ws_close",
            Stmt::MacroInvocation { .. } => "macro_invocation",
            Stmt::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: Expr,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// `42`, `"hi"`, `true`, `null`
    Literal { value: Literal },
    /// Identifier
    Var { name: String },
    /// Binary operation
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation
    Unary { op: UnOp, operand: Box<Expr> },
    /// Field access: `user.name`
    Field { object: Box<Expr>, field: String },
    /// Index access: `items[0]`
    Index { object: Box<Expr>, index: Box<Expr> },
    /// Call. The parser folds a method receiver into the first argument, so
    /// `db.users.Get(id)` arrives as `Get(db.users, id)`.
    Call {
        name: String,
        #[serde(default)]
        type_args: Vec<Type>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Object literal: `{ name: "Ana", age: 30 }`
    Object {
        #[serde(default)]
        fields: Vec<ObjectField>,
    },
    /// Array literal: `[1, 2, 3]`
    Array {
        #[serde(default)]
        elements: Vec<Expr>,
    },
    /// Lambda: `(x) => x * 2` or `(x) => { ... }`
    Lambda {
        #[serde(default)]
        params: Vec<Field>,
        #[serde(default)]
        body: Option<Box<Expr>>,
        #[serde(default)]
        block: Vec<Stmt>,
    },
    /// Pipe: `data |> transform`
    Pipe { left: Box<Expr>, right: Box<Expr> },
    /// `match value { pattern when guard => body }`
    Match {
        value: Box<Expr>,
        #[serde(default)]
        cases: Vec<MatchCase>,
    },
    /// `async { ... }`
    Async {
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `await expr`
    Await { expr: Box<Expr> },
    /// Macro quoting: `quote { ... }`
    Quote {
        #[serde(default)]
        body: Vec<Stmt>,
    },
    /// `$name` inside a quote
    Unquote { expr: Box<Expr> },
    #[serde(other)]
    Unsupported,
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal {
            value: Literal::Int(value),
        }
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal {
            value: Literal::Float(value),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal {
            value: Literal::String(value.into()),
        }
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal {
            value: Literal::Bool(value),
        }
    }

    pub fn null() -> Self {
        Expr::Literal {
            value: Literal::Null,
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn field(object: Expr, field: impl Into<String>) -> Self {
        Expr::Field {
            object: Box::new(object),
            field: field.into(),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            type_args: Vec::new(),
            args,
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// The surface keyword for this expression, used in diagnostics
    pub fn keyword(&self) -> &'static str {
        match self {
            Expr::Literal { .. } => "literal",
            Expr::Var { .. } => "var",
            Expr::Binary { .. } => "binary",
            Expr::Unary { .. } => "unary",
            Expr::Field { .. } => "field",
            Expr::Index { .. } => "index",
            Expr::Call { .. } => "call",
            Expr::Object { .. } => "object",
            Expr::Array { .. } => "array",
            Expr::Lambda { .. } => "lambda",
            Expr::Pipe { .. } => "pipe",
            Expr::Match { .. } => "match",
            Expr::Async { .. } => "async",
            Expr::Await { .. } => "await",
            Expr::Quote { .. } => "quote",
            Expr::Unquote { .. } => "unquote",
            Expr::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectField {
    pub key: String,
    pub value: Expr,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Not,
    Neg,
}

/// Match arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: Pattern,
    #[serde(default)]
    pub guard: Option<Expr>,
    pub body: Expr,
}

/// Patterns (only used by `match`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// `200`, `"admin"`
    Literal { value: Literal },
    /// Binds the scrutinee: `n`
    Variable { name: String },
    /// `_`
    Wildcard,
    /// `{ role: "admin", name }`
    Object {
        #[serde(default)]
        fields: Vec<ObjectPatternField>,
    },
    /// `[first, second, ...rest]`
    Array {
        #[serde(default)]
        elements: Vec<Pattern>,
        #[serde(default)]
        rest: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// `key` alone binds the field to a variable of the same name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatternField {
    pub key: String,
    #[serde(default)]
    pub pattern: Option<Pattern>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_route_from_json() {
        let source = r#"{
            "kind": "route",
            "method": "POST",
            "path": "/api/users",
            "input_type": { "kind": "named", "name": "CreateUser" },
            "injections": [ { "name": "db", "type": { "kind": "database" } } ],
            "body": [
                { "kind": "assign", "target": "user",
                  "value": { "kind": "call", "name": "Create",
                             "args": [ { "kind": "field", "object": { "kind": "var", "name": "db" }, "field": "users" },
                                       { "kind": "var", "name": "input" } ] } },
                { "kind": "return", "value": { "kind": "var", "name": "user" } }
            ]
        }"#;

        let item: Item = serde_json::from_str(source).unwrap();
        let Item::Route(route) = item else {
            panic!("expected a route");
        };
        assert_eq!(route.method, HttpMethod::Post);
        assert_eq!(route.input_type, Some(Type::named("CreateUser")));
        assert_eq!(route.injections, vec![Injection::new("db", Type::Database)]);
        assert_eq!(route.body.len(), 2);
        assert_eq!(route.body[1], Stmt::ret(Expr::var("user")));
    }

    #[test]
    fn test_unknown_kinds_deserialize_as_unsupported() {
        let stmt: Stmt = serde_json::from_str(r#"{ "kind": "defer" }"#).unwrap();
        assert_eq!(stmt, Stmt::Unsupported);

        let expr: Expr = serde_json::from_str(r#"{ "kind": "spread" }"#).unwrap();
        assert_eq!(expr, Expr::Unsupported);

        let ty: Type = serde_json::from_str(r#"{ "kind": "tuple" }"#).unwrap();
        assert_eq!(ty, Type::Unsupported);

        let item: Item = serde_json::from_str(r#"{ "kind": "server" }"#).unwrap();
        assert_eq!(item, Item::Unsupported);
    }

    #[test]
    fn test_field_defaults_to_required() {
        let field: Field = serde_json::from_str(r#"{ "name": "id", "type": { "kind": "int" } }"#).unwrap();
        assert!(field.required);
        assert_eq!(field, Field::new("id", Type::Int));

        let field: Field =
            serde_json::from_str(r#"{ "name": "age", "type": { "kind": "int" }, "required": false }"#)
                .unwrap();
        assert_eq!(field, Field::new("age", Type::Int).optional());
    }

    #[test]
    fn test_literals() {
        let expr: Expr =
            serde_json::from_str(r#"{ "kind": "literal", "value": { "type": "float", "value": 1.5 } }"#)
                .unwrap();
        assert_eq!(expr, Expr::float(1.5));

        let expr: Expr =
            serde_json::from_str(r#"{ "kind": "literal", "value": { "type": "null" } }"#).unwrap();
        assert_eq!(expr, Expr::null());
    }

    #[test]
    fn test_module_name() {
        let program = Program::new(vec![
            Item::Import(ImportStatement {
                path: "./shared".to_string(),
                alias: None,
            }),
            Item::Module(ModuleDecl {
                name: "users".to_string(),
            }),
        ]);
        assert_eq!(program.module_name(), Some("users"));
        assert_eq!(Program::default().module_name(), None);
    }

    #[test]
    fn test_match_patterns_from_json() {
        let source = r#"{
            "kind": "match",
            "value": { "kind": "var", "name": "status" },
            "cases": [
                { "pattern": { "kind": "literal", "value": { "type": "int", "value": 200 } },
                  "body": { "kind": "literal", "value": { "type": "string", "value": "ok" } } },
                { "pattern": { "kind": "array", "elements": [ { "kind": "variable", "name": "head" } ], "rest": "tail" },
                  "body": { "kind": "var", "name": "head" } },
                { "pattern": { "kind": "wildcard" },
                  "body": { "kind": "literal", "value": { "type": "null" } } }
            ]
        }"#;

        let Expr::Match { cases, .. } = serde_json::from_str::<Expr>(source).unwrap() else {
            panic!("expected a match");
        };
        assert_eq!(cases.len(), 3);
        assert_eq!(
            cases[1].pattern,
            Pattern::Array {
                elements: vec![Pattern::Variable {
                    name: "head".to_string()
                }],
                rest: Some("tail".to_string()),
            }
        );
        assert_eq!(cases[2].pattern, Pattern::Wildcard);
    }
}
