//! Building AST → IR
//!
//! Converts a parsed program into a [`ServiceIR`] in two passes: declarations
//! first, then bindings in source order.

use glyph_ast as ast;
use glyph_error::{Diagnostic, Diagnostics, ErrorCode};
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, info};

use crate::error::{BuildError, ConversionError};
use crate::expr::{
    BinOp, CallExpr, ExprIR, LambdaBody, LambdaExpr, LiteralValue, MatchCase, MatchExpr,
    ObjectField, ObjectPatternField, PatternIR, StmtIR, SwitchCase, UnOp,
};
use crate::module::*;
use crate::types::{Annotation, FieldSchema, MethodSchema, TypeRef, TypeSchema};

/// Service name used when the program has no module declaration
pub const DEFAULT_SERVICE_NAME: &str = "service";

/// A built service plus the non-fatal findings collected along the way
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub service: ServiceIR,
    pub diagnostics: Diagnostics,
}

/// Builds the IR for `program`, keeping fallback warnings
pub fn build(program: &ast::Program) -> Result<BuildOutput, BuildError> {
    IrBuilder::new(program).run(program)
}

/// Builds the IR for `program`
pub fn build_service(program: &ast::Program) -> Result<ServiceIR, BuildError> {
    build(program).map(|output| output.service)
}

/// Names of the `:param` segments of a route path, in order
pub fn extract_path_params(path: &str) -> Vec<String> {
    path.split('/')
        .filter_map(|segment| segment.strip_prefix(':'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

type BuildResult<T> = Result<T, ConversionError>;

/// Builder state, local to one build
pub struct IrBuilder {
    service: ServiceIR,
    declared_types: IndexSet<String>,
    contracts: IndexMap<String, Vec<MethodSig>>,
    providers: IndexMap<String, ProviderRef>,
    diagnostics: Diagnostics,
    /// Binding currently being converted, for diagnostics
    scope: String,
    cron_counter: u32,
}

impl IrBuilder {
    pub fn new(program: &ast::Program) -> Self {
        let name = program
            .module_name()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_SERVICE_NAME);

        Self {
            service: ServiceIR::new(name),
            declared_types: IndexSet::new(),
            contracts: IndexMap::new(),
            providers: IndexMap::new(),
            diagnostics: Diagnostics::new(),
            scope: String::new(),
            cron_counter: 0,
        }
    }

    pub fn run(mut self, program: &ast::Program) -> Result<BuildOutput, BuildError> {
        // First pass: declarations
        for item in &program.items {
            self.collect_declaration(item)?;
        }

        // Second pass: bindings
        for item in &program.items {
            self.build_item(item)?;
        }

        self.service.providers = self.providers.into_values().collect();

        info!(
            service = %self.service.name,
            types = self.service.types.len(),
            providers = self.service.providers.len(),
            bindings = self.service.binding_count(),
            warnings = self.diagnostics.warning_count(),
            "built service"
        );

        Ok(BuildOutput {
            service: self.service,
            diagnostics: self.diagnostics,
        })
    }

    /// Runs `f` with the diagnostic scope set to the binding, attaching the
    /// binding to any error it returns
    fn scoped<T>(
        &mut self,
        kind: BindingKind,
        name: &str,
        f: impl FnOnce(&mut Self) -> BuildResult<T>,
    ) -> Result<T, BuildError> {
        self.scope = format!("{} {}", kind, name);
        let result = f(self);
        self.scope.clear();
        debug!(%kind, name, ok = result.is_ok(), "converted binding");
        result.map_err(|source| BuildError::new(kind, name, source))
    }

    fn warn(&mut self, code: ErrorCode, message: String) {
        let mut diagnostic = Diagnostic::warning(message).with_code(code);
        if !self.scope.is_empty() {
            diagnostic = diagnostic.with_location(self.scope.clone());
        }
        self.diagnostics.push(diagnostic);
    }

    // ========================================
    // Pass one: types and provider contracts
    // ========================================

    fn collect_declaration(&mut self, item: &ast::Item) -> Result<(), BuildError> {
        match item {
            ast::Item::TypeDef(def) => {
                let schema = self.scoped(BindingKind::Type, &def.name, |b| b.convert_type_def(def))?;
                self.service.types.push(schema);
            }
            ast::Item::Provider(contract) => {
                let methods = self.scoped(BindingKind::ProviderContract, &contract.name, |b| {
                    b.convert_contract(contract)
                })?;
                self.contracts.insert(contract.name.clone(), methods);
            }
            _ => {}
        }
        Ok(())
    }

    fn convert_type_def(&mut self, def: &ast::TypeDef) -> BuildResult<TypeSchema> {
        if def.name.is_empty() {
            return Err(ConversionError::EmptyTypeName);
        }
        if !self.declared_types.insert(def.name.clone()) {
            return Err(ConversionError::DuplicateDeclaration(def.name.clone()));
        }

        let mut schema = TypeSchema::new(&def.name);
        schema.type_params = def.type_params.clone();
        schema.traits = def.traits.clone();
        for field in &def.fields {
            let field = self.convert_field(field)?;
            schema.fields.push(field);
        }
        for method in &def.methods {
            let params = self.convert_fields(&method.params)?;
            let return_type = self.convert_opt_type(method.return_type.as_ref())?;
            let body = self.convert_block(&method.body);
            schema.methods.push(MethodSchema {
                name: method.name.clone(),
                params,
                return_type: return_type.unwrap_or(TypeRef::Any),
                body,
            });
        }
        Ok(schema)
    }

    fn convert_contract(&mut self, contract: &ast::ProviderDef) -> BuildResult<Vec<MethodSig>> {
        if contract.name.is_empty() {
            return Err(ConversionError::EmptyTypeName);
        }
        if self.contracts.contains_key(&contract.name) {
            return Err(ConversionError::DuplicateDeclaration(contract.name.clone()));
        }

        let mut methods = Vec::with_capacity(contract.methods.len());
        for (index, method) in contract.methods.iter().enumerate() {
            if method.name.is_empty() {
                return Err(ConversionError::UnnamedContractMethod(index));
            }
            methods.push(MethodSig {
                name: method.name.clone(),
                params: self.convert_fields(&method.params)?,
                return_type: self
                    .convert_opt_type(method.return_type.as_ref())?
                    .unwrap_or(TypeRef::Any),
            });
        }
        Ok(methods)
    }

    // ========================================
    // Pass two: bindings
    // ========================================

    fn build_item(&mut self, item: &ast::Item) -> Result<(), BuildError> {
        match item {
            ast::Item::Route(route) => {
                let handler = RouteHandler {
                    method: convert_http_method(route.method),
                    path: route.path.clone(),
                    path_params: extract_path_params(&route.path),
                    query_params: Vec::new(),
                    input_type: None,
                    return_type: None,
                    auth: route.auth.as_ref().map(convert_auth),
                    rate_limit: route.rate_limit.as_ref().map(|r| RateLimitConfig {
                        requests: r.requests,
                        window: r.window.clone(),
                    }),
                    middleware: Vec::new(),
                    providers: Vec::new(),
                    body: Vec::new(),
                };
                let name = handler.display_name();
                let handler = self.scoped(BindingKind::Route, &name, |b| {
                    let mut handler = handler;
                    handler.providers = b.convert_injections(&route.injections)?;
                    handler.input_type = b.convert_opt_type(route.input_type.as_ref())?;
                    handler.return_type = b.convert_opt_type(route.return_type.as_ref())?;
                    for param in &route.query_params {
                        let query = QueryParam {
                            name: param.name.clone(),
                            ty: b.convert_opt_type(param.ty.as_ref())?.unwrap_or(TypeRef::Any),
                            required: param.required,
                            default: param.default.as_ref().map(|e| b.convert_expr(e)),
                            is_array: param.is_array,
                        };
                        handler.query_params.push(query);
                    }
                    handler.middleware = route
                        .middleware
                        .iter()
                        .map(|m| MiddlewareRef {
                            name: m.name.clone(),
                            args: b.convert_exprs(&m.args),
                        })
                        .collect();
                    handler.body = b.convert_block(&route.body);
                    Ok(handler)
                })?;
                self.service.routes.push(handler);
            }

            ast::Item::Function(function) => {
                let def = self.scoped(BindingKind::Function, &function.name, |b| {
                    Ok(FunctionDef {
                        name: function.name.clone(),
                        type_params: function.type_params.clone(),
                        params: b.convert_fields(&function.params)?,
                        return_type: b.convert_opt_type(function.return_type.as_ref())?,
                        body: b.convert_block(&function.body),
                    })
                })?;
                self.service.functions.push(def);
            }

            ast::Item::Cron(task) => {
                self.cron_counter += 1;
                let name = if task.name.is_empty() {
                    format!("cron_job_{}", self.cron_counter)
                } else {
                    task.name.clone()
                };
                let job = self.scoped(BindingKind::CronJob, &name, |b| {
                    Ok(CronBinding {
                        name: name.clone(),
                        schedule: task.schedule.clone(),
                        timezone: task.timezone.clone(),
                        retries: task.retries,
                        providers: b.convert_injections(&task.injections)?,
                        body: b.convert_block(&task.body),
                    })
                })?;
                self.service.cron_jobs.push(job);
            }

            ast::Item::Event(handler) => {
                let binding = self.scoped(BindingKind::EventHandler, &handler.event_type, |b| {
                    Ok(EventBinding {
                        event_type: handler.event_type.clone(),
                        is_async: handler.is_async,
                        providers: b.convert_injections(&handler.injections)?,
                        body: b.convert_block(&handler.body),
                    })
                })?;
                self.service.events.push(binding);
            }

            ast::Item::Queue(worker) => {
                let binding = self.scoped(BindingKind::QueueWorker, &worker.queue_name, |b| {
                    Ok(QueueBinding {
                        queue_name: worker.queue_name.clone(),
                        concurrency: worker.concurrency,
                        max_retries: worker.max_retries,
                        timeout_secs: worker.timeout,
                        providers: b.convert_injections(&worker.injections)?,
                        body: b.convert_block(&worker.body),
                    })
                })?;
                self.service.queues.push(binding);
            }

            ast::Item::Command(command) => {
                let def = self.scoped(BindingKind::Command, &command.name, |b| {
                    let mut params = Vec::with_capacity(command.params.len());
                    for param in &command.params {
                        params.push(CommandParam {
                            name: param.name.clone(),
                            ty: b.convert_opt_type(param.ty.as_ref())?.unwrap_or(TypeRef::Any),
                            required: param.required,
                            default: param.default.as_ref().map(|e| b.convert_expr(e)),
                            is_flag: param.is_flag,
                        });
                    }
                    Ok(CommandDef {
                        name: command.name.clone(),
                        description: command.description.clone(),
                        params,
                        return_type: b.convert_opt_type(command.return_type.as_ref())?,
                        body: b.convert_block(&command.body),
                    })
                })?;
                self.service.commands.push(def);
            }

            ast::Item::GrpcService(decl) => {
                let methods = self.scoped(BindingKind::GrpcService, &decl.name, |b| {
                    let mut methods = Vec::with_capacity(decl.methods.len());
                    for method in &decl.methods {
                        methods.push(GrpcMethodDef {
                            name: method.name.clone(),
                            input_type: b
                                .convert_opt_type(method.input_type.as_ref())?
                                .unwrap_or(TypeRef::Any),
                            return_type: b
                                .convert_opt_type(method.return_type.as_ref())?
                                .unwrap_or(TypeRef::Any),
                            stream: convert_stream(method.stream),
                        });
                    }
                    Ok(methods)
                })?;
                self.grpc_service(&decl.name).methods.extend(methods);
            }

            ast::Item::GrpcHandler(handler) => {
                let name = format!("{}.{}", handler.service_name, handler.method_name);
                let def = self.scoped(BindingKind::GrpcHandler, &name, |b| {
                    Ok(GrpcHandlerDef {
                        service_name: handler.service_name.clone(),
                        method_name: handler.method_name.clone(),
                        params: b.convert_fields(&handler.params)?,
                        return_type: b.convert_opt_type(handler.return_type.as_ref())?,
                        stream: convert_stream(handler.stream),
                        auth: handler.auth.as_ref().map(convert_auth),
                        providers: b.convert_injections(&handler.injections)?,
                        body: b.convert_block(&handler.body),
                    })
                })?;
                self.grpc_service(&handler.service_name).handlers.push(def);
            }

            ast::Item::GraphQl(resolver) => {
                let def = self.scoped(BindingKind::GraphQlResolver, &resolver.field_name, |b| {
                    Ok(GraphQlDef {
                        operation: match resolver.operation {
                            ast::GraphQlOperation::Query => GraphQlOp::Query,
                            ast::GraphQlOperation::Mutation => GraphQlOp::Mutation,
                            ast::GraphQlOperation::Subscription => GraphQlOp::Subscription,
                        },
                        field_name: resolver.field_name.clone(),
                        params: b.convert_fields(&resolver.params)?,
                        return_type: b.convert_opt_type(resolver.return_type.as_ref())?,
                        auth: resolver.auth.as_ref().map(convert_auth),
                        providers: b.convert_injections(&resolver.injections)?,
                        body: b.convert_block(&resolver.body),
                    })
                })?;
                self.service.graphql.push(def);
            }

            ast::Item::WebSocket(route) => {
                let def = self.scoped(BindingKind::WebSocketRoute, &route.path, |b| {
                    let events = route
                        .events
                        .iter()
                        .map(|handler| WsEventDef {
                            event: match handler.event {
                                ast::WsEventKind::Connect => WsEvent::Connect,
                                ast::WsEventKind::Disconnect => WsEvent::Disconnect,
                                ast::WsEventKind::Message => WsEvent::Message,
                                ast::WsEventKind::Error => WsEvent::Error,
                            },
                            body: b.convert_block(&handler.body),
                        })
                        .collect();
                    Ok(WebSocketDef {
                        path: route.path.clone(),
                        events,
                    })
                })?;
                self.service.websockets.push(def);
            }

            ast::Item::Const(decl) => {
                let def = self.scoped(BindingKind::Constant, &decl.name, |b| {
                    Ok(ConstantDef {
                        name: decl.name.clone(),
                        ty: b.convert_opt_type(decl.ty.as_ref())?,
                        value: decl
                            .value
                            .as_ref()
                            .map(|e| b.convert_expr(e))
                            .unwrap_or(ExprIR::Null),
                    })
                })?;
                self.service.constants.push(def);
            }

            ast::Item::Unsupported => {
                self.warn(
                    ErrorCode::UNSUPPORTED_ITEM,
                    "unrecognized declaration skipped".to_string(),
                );
            }

            // Declarations without service semantics
            ast::Item::Module(_)
            | ast::Item::Import(_)
            | ast::Item::TypeDef(_)
            | ast::Item::Provider(_)
            | ast::Item::Test(_)
            | ast::Item::MacroDef(_)
            | ast::Item::Trait(_)
            | ast::Item::StaticRoute(_) => {
                debug!(kind = item.keyword(), "skipped declaration");
            }
        }
        Ok(())
    }

    fn grpc_service(&mut self, name: &str) -> &mut GrpcServiceDef {
        let index = match self.service.grpc.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.service.grpc.push(GrpcServiceDef::new(name));
                self.service.grpc.len() - 1
            }
        };
        &mut self.service.grpc[index]
    }

    // ========================================
    // Providers
    // ========================================

    fn convert_injections(&mut self, injections: &[ast::Injection]) -> BuildResult<Vec<InjectionRef>> {
        injections
            .iter()
            .map(|injection| self.convert_injection(injection))
            .collect()
    }

    fn convert_injection(&mut self, injection: &ast::Injection) -> BuildResult<InjectionRef> {
        let provider_type = match &injection.ty {
            Some(ast::Type::Database) => StandardProvider::Database.type_name().to_string(),
            Some(ast::Type::Redis) => StandardProvider::Redis.type_name().to_string(),
            Some(ast::Type::MongoDb) => StandardProvider::MongoDB.type_name().to_string(),
            Some(ast::Type::Llm) => StandardProvider::Llm.type_name().to_string(),
            Some(ast::Type::Named { name }) if name.is_empty() => {
                return Err(ConversionError::EmptyTypeName)
            }
            Some(ast::Type::Named { name }) => name.clone(),
            Some(other) => {
                let ty = self.convert_type(other)?;
                return Err(ConversionError::NotAProvider {
                    name: injection.name.clone(),
                    ty: ty.to_string(),
                });
            }
            None => {
                return Err(ConversionError::NotAProvider {
                    name: injection.name.clone(),
                    ty: TypeRef::Any.to_string(),
                })
            }
        };

        if injection.name.is_empty() {
            return Err(ConversionError::MissingInjectionName { ty: provider_type });
        }

        self.register_provider(&provider_type);
        Ok(InjectionRef::new(&injection.name, provider_type))
    }

    /// Registers a provider type once; later registrations are no-ops
    fn register_provider(&mut self, provider_type: &str) {
        if self.providers.contains_key(provider_type) {
            return;
        }
        let mut provider = ProviderRef::new(provider_type);
        if let Some(methods) = self.contracts.get(provider_type) {
            provider.methods = methods.clone();
        }
        debug!(provider = %provider.provider_type, instance = %provider.name, "registered provider");
        self.providers.insert(provider_type.to_string(), provider);
    }

    // ========================================
    // Types
    // ========================================

    fn convert_opt_type(&mut self, ty: Option<&ast::Type>) -> BuildResult<Option<TypeRef>> {
        ty.map(|ty| self.convert_type(ty)).transpose()
    }

    /// Signature-level conversion: an empty type name is an error
    fn convert_type(&mut self, ty: &ast::Type) -> BuildResult<TypeRef> {
        Ok(match ty {
            ast::Type::Int => TypeRef::Int,
            ast::Type::Float => TypeRef::Float,
            ast::Type::String => TypeRef::String,
            ast::Type::Bool => TypeRef::Bool,
            ast::Type::Array { element } => TypeRef::array(self.convert_type(element)?),
            ast::Type::Optional { inner } => self.convert_type(inner)?.optional(),
            ast::Type::Named { name } | ast::Type::TypeParam { name } => {
                if name.is_empty() {
                    return Err(ConversionError::EmptyTypeName);
                }
                TypeRef::Named(name.clone())
            }
            ast::Type::Database => TypeRef::Provider(StandardProvider::Database.type_name().into()),
            ast::Type::Redis => TypeRef::Provider(StandardProvider::Redis.type_name().into()),
            ast::Type::MongoDb => TypeRef::Provider(StandardProvider::MongoDB.type_name().into()),
            ast::Type::Llm => TypeRef::Provider(StandardProvider::Llm.type_name().into()),
            ast::Type::Union { types } => TypeRef::Union(
                types
                    .iter()
                    .map(|t| self.convert_type(t))
                    .collect::<BuildResult<_>>()?,
            ),
            ast::Type::Generic { base, args } => {
                let base = self.convert_type(base)?;
                let name = match base.name() {
                    Some(name) => name.to_string(),
                    None => base.to_string(),
                };
                let args = args
                    .iter()
                    .map(|t| self.convert_type(t))
                    .collect::<BuildResult<_>>()?;
                TypeRef::Generic { name, args }
            }
            ast::Type::Function { params, ret } => TypeRef::Function {
                params: params
                    .iter()
                    .map(|t| self.convert_type(t))
                    .collect::<BuildResult<_>>()?,
                ret: Box::new(match ret {
                    Some(ret) => self.convert_type(ret)?,
                    None => TypeRef::Any,
                }),
            },
            ast::Type::Future { result } => TypeRef::Future(Box::new(self.convert_type(result)?)),
            ast::Type::Unsupported => {
                self.warn(
                    ErrorCode::UNSUPPORTED_TYPE,
                    "unrecognized type replaced with `any`".to_string(),
                );
                TypeRef::Any
            }
        })
    }

    /// Body-level conversion: never fails
    fn convert_body_type(&mut self, ty: &ast::Type) -> TypeRef {
        match self.convert_type(ty) {
            Ok(ty) => ty,
            Err(err) => {
                self.warn(
                    ErrorCode::UNSUPPORTED_TYPE,
                    format!("{}; replaced with `any`", err),
                );
                TypeRef::Any
            }
        }
    }

    fn convert_fields(&mut self, fields: &[ast::Field]) -> BuildResult<Vec<FieldSchema>> {
        fields.iter().map(|f| self.convert_field(f)).collect()
    }

    fn convert_field(&mut self, field: &ast::Field) -> BuildResult<FieldSchema> {
        let ty = self.convert_opt_type(field.ty.as_ref())?.unwrap_or(TypeRef::Any);
        Ok(self.finish_field(field, ty))
    }

    fn finish_field(&mut self, field: &ast::Field, ty: TypeRef) -> FieldSchema {
        FieldSchema {
            name: field.name.clone(),
            ty,
            required: field.required,
            default: field.default.as_ref().map(|e| self.convert_expr(e)),
            annotations: field
                .annotations
                .iter()
                .map(|a| Annotation {
                    name: a.name.clone(),
                    params: a.params.iter().map(convert_literal).collect(),
                })
                .collect(),
        }
    }

    // ========================================
    // Statements
    // ========================================

    fn convert_block(&mut self, stmts: &[ast::Stmt]) -> Vec<StmtIR> {
        stmts.iter().map(|s| self.convert_stmt(s)).collect()
    }

    fn convert_stmt(&mut self, stmt: &ast::Stmt) -> StmtIR {
        match stmt {
            ast::Stmt::Assign { target, value } => StmtIR::Assign {
                target: target.clone(),
                value: self.convert_expr(value),
            },
            ast::Stmt::Reassign { target, value } => StmtIR::Reassign {
                target: target.clone(),
                value: self.convert_expr(value),
            },
            ast::Stmt::Return { value } => StmtIR::Return(match value {
                Some(value) => self.convert_expr(value),
                None => ExprIR::Null,
            }),
            ast::Stmt::If {
                condition,
                then_block,
                else_block,
            } => StmtIR::If {
                condition: self.convert_expr(condition),
                then_body: self.convert_block(then_block),
                else_body: self.convert_block(else_block),
            },
            ast::Stmt::For {
                key,
                value,
                iterable,
                body,
            } => StmtIR::For {
                key: key.clone(),
                value: value.clone(),
                iterable: self.convert_expr(iterable),
                body: self.convert_block(body),
            },
            ast::Stmt::While { condition, body } => StmtIR::While {
                condition: self.convert_expr(condition),
                body: self.convert_block(body),
            },
            ast::Stmt::Switch {
                value,
                cases,
                default,
            } => StmtIR::Switch {
                value: self.convert_expr(value),
                cases: cases
                    .iter()
                    .map(|case| SwitchCase {
                        value: self.convert_expr(&case.value),
                        body: self.convert_block(&case.body),
                    })
                    .collect(),
                default: self.convert_block(default),
            },
            ast::Stmt::Expr { expr } => StmtIR::Expr(self.convert_expr(expr)),
            ast::Stmt::Validate { call } => StmtIR::Validate(self.convert_expr(call)),
            ast::Stmt::Break => StmtIR::Break,
            ast::Stmt::Continue => StmtIR::Continue,
            ast::Stmt::DbQuery { .. }
            | ast::Stmt::WsSend { .. }
            | ast::Stmt::WsBroadcast { .. }
            | ast::Stmt::WsClose { .. }
            | ast::Stmt::MacroInvocation { .. }
            | ast::Stmt::Unsupported => {
                self.warn(
                    ErrorCode::UNSUPPORTED_STATEMENT,
                    format!("`{}` statement replaced with a no-op", stmt.keyword()),
                );
                StmtIR::noop()
            }
        }
    }

    // ========================================
    // Expressions
    // ========================================

    fn convert_exprs(&mut self, exprs: &[ast::Expr]) -> Vec<ExprIR> {
        exprs.iter().map(|e| self.convert_expr(e)).collect()
    }

    fn convert_boxed(&mut self, expr: &ast::Expr) -> Box<ExprIR> {
        Box::new(self.convert_expr(expr))
    }

    fn convert_expr(&mut self, expr: &ast::Expr) -> ExprIR {
        match expr {
            ast::Expr::Literal { value } => convert_literal(value).to_expr(),
            ast::Expr::Var { name } => ExprIR::Var(name.clone()),
            ast::Expr::Binary { op, left, right } => ExprIR::Binary {
                op: convert_binop(*op),
                left: self.convert_boxed(left),
                right: self.convert_boxed(right),
            },
            ast::Expr::Unary { op, operand } => ExprIR::Unary {
                op: match op {
                    ast::UnOp::Not => UnOp::Not,
                    ast::UnOp::Neg => UnOp::Neg,
                },
                operand: self.convert_boxed(operand),
            },
            ast::Expr::Field { object, field } => ExprIR::FieldAccess {
                object: self.convert_boxed(object),
                field: field.clone(),
            },
            ast::Expr::Index { object, index } => ExprIR::IndexAccess {
                object: self.convert_boxed(object),
                index: self.convert_boxed(index),
            },
            ast::Expr::Call {
                name,
                type_args,
                args,
            } => ExprIR::Call(CallExpr {
                name: name.clone(),
                type_args: type_args.iter().map(|t| self.convert_body_type(t)).collect(),
                args: self.convert_exprs(args),
            }),
            ast::Expr::Object { fields } => ExprIR::Object(
                fields
                    .iter()
                    .map(|f| ObjectField {
                        key: f.key.clone(),
                        value: self.convert_expr(&f.value),
                    })
                    .collect(),
            ),
            ast::Expr::Array { elements } => ExprIR::Array(self.convert_exprs(elements)),
            ast::Expr::Lambda {
                params,
                body,
                block,
            } => {
                let params = params
                    .iter()
                    .map(|p| {
                        let ty = p
                            .ty
                            .as_ref()
                            .map(|t| self.convert_body_type(t))
                            .unwrap_or(TypeRef::Any);
                        self.finish_field(p, ty)
                    })
                    .collect();
                let body = match body {
                    Some(body) => LambdaBody::Expr(self.convert_boxed(body)),
                    None => LambdaBody::Block(self.convert_block(block)),
                };
                ExprIR::Lambda(LambdaExpr { params, body })
            }
            ast::Expr::Pipe { left, right } => ExprIR::Pipe {
                left: self.convert_boxed(left),
                right: self.convert_boxed(right),
            },
            ast::Expr::Match { value, cases } => ExprIR::Match(MatchExpr {
                value: self.convert_boxed(value),
                cases: cases
                    .iter()
                    .map(|case| MatchCase {
                        pattern: self.convert_pattern(&case.pattern),
                        guard: case.guard.as_ref().map(|g| self.convert_expr(g)),
                        body: self.convert_expr(&case.body),
                    })
                    .collect(),
            }),
            ast::Expr::Async { body } => ExprIR::Async(self.convert_block(body)),
            ast::Expr::Await { expr } => ExprIR::Await(self.convert_boxed(expr)),
            ast::Expr::Quote { .. } | ast::Expr::Unquote { .. } | ast::Expr::Unsupported => {
                self.warn(
                    ErrorCode::UNSUPPORTED_EXPRESSION,
                    format!("`{}` expression replaced with null", expr.keyword()),
                );
                ExprIR::Null
            }
        }
    }

    fn convert_pattern(&mut self, pattern: &ast::Pattern) -> PatternIR {
        match pattern {
            ast::Pattern::Literal { value } => PatternIR::Literal(convert_literal(value)),
            ast::Pattern::Variable { name } => PatternIR::Variable(name.clone()),
            ast::Pattern::Wildcard => PatternIR::Wildcard,
            ast::Pattern::Object { fields } => PatternIR::Object(
                fields
                    .iter()
                    .map(|f| ObjectPatternField {
                        key: f.key.clone(),
                        pattern: f.pattern.as_ref().map(|p| self.convert_pattern(p)),
                    })
                    .collect(),
            ),
            ast::Pattern::Array { elements, rest } => PatternIR::Array {
                elements: elements.iter().map(|p| self.convert_pattern(p)).collect(),
                rest: rest.clone(),
            },
            ast::Pattern::Unsupported => {
                self.warn(
                    ErrorCode::UNSUPPORTED_PATTERN,
                    "unrecognized pattern replaced with `_`".to_string(),
                );
                PatternIR::Wildcard
            }
        }
    }
}

fn convert_literal(literal: &ast::Literal) -> LiteralValue {
    match literal {
        ast::Literal::Int(v) => LiteralValue::Int(*v),
        ast::Literal::Float(v) => LiteralValue::Float(*v),
        ast::Literal::String(v) => LiteralValue::String(v.clone()),
        ast::Literal::Bool(v) => LiteralValue::Bool(*v),
        ast::Literal::Null => LiteralValue::Null,
    }
}

fn convert_binop(op: ast::BinOp) -> BinOp {
    match op {
        ast::BinOp::Add => BinOp::Add,
        ast::BinOp::Sub => BinOp::Sub,
        ast::BinOp::Mul => BinOp::Mul,
        ast::BinOp::Div => BinOp::Div,
        ast::BinOp::Mod => BinOp::Mod,
        ast::BinOp::Eq => BinOp::Eq,
        ast::BinOp::Ne => BinOp::Ne,
        ast::BinOp::Lt => BinOp::Lt,
        ast::BinOp::Le => BinOp::Le,
        ast::BinOp::Gt => BinOp::Gt,
        ast::BinOp::Ge => BinOp::Ge,
        ast::BinOp::And => BinOp::And,
        ast::BinOp::Or => BinOp::Or,
    }
}

fn convert_http_method(method: ast::HttpMethod) -> HttpMethod {
    match method {
        ast::HttpMethod::Get => HttpMethod::Get,
        ast::HttpMethod::Post => HttpMethod::Post,
        ast::HttpMethod::Put => HttpMethod::Put,
        ast::HttpMethod::Delete => HttpMethod::Delete,
        ast::HttpMethod::Patch => HttpMethod::Patch,
        ast::HttpMethod::WebSocket => HttpMethod::WebSocket,
        ast::HttpMethod::Sse => HttpMethod::Sse,
    }
}

fn convert_stream(stream: ast::StreamType) -> StreamKind {
    match stream {
        ast::StreamType::Unary => StreamKind::Unary,
        ast::StreamType::ServerStream => StreamKind::ServerStream,
        ast::StreamType::ClientStream => StreamKind::ClientStream,
        ast::StreamType::Bidirectional => StreamKind::Bidirectional,
    }
}

fn convert_auth(auth: &ast::AuthConfig) -> AuthRequirement {
    AuthRequirement {
        auth_type: auth.auth_type.clone(),
        required: auth.required,
        roles: auth.roles.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::{Expr, Field, Injection, Item, Stmt, Type};
    use pretty_assertions::assert_eq;

    fn route(method: ast::HttpMethod, path: &str, injections: Vec<Injection>, body: Vec<Stmt>) -> Item {
        Item::Route(ast::Route {
            method,
            path: path.to_string(),
            injections,
            body,
            ..Default::default()
        })
    }

    fn module(name: &str) -> Item {
        Item::Module(ast::ModuleDecl {
            name: name.to_string(),
        })
    }

    #[test]
    fn test_extract_path_params() {
        assert_eq!(
            extract_path_params("/api/users/:id/posts/:postId"),
            vec!["id".to_string(), "postId".to_string()]
        );
        assert!(extract_path_params("/health").is_empty());
    }

    #[test]
    fn test_service_name_from_module() {
        let service = build_service(&ast::Program::new(vec![module("users")])).unwrap();
        assert_eq!(service.name, "users");

        let service = build_service(&ast::Program::default()).unwrap();
        assert_eq!(service.name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn test_route_conversion() {
        let program = ast::Program::new(vec![route(
            ast::HttpMethod::Get,
            "/api/users/:id",
            vec![Injection::new("db", Type::Database)],
            vec![
                Stmt::assign(
                    "user",
                    Expr::call(
                        "Get",
                        vec![Expr::field(Expr::var("db"), "users"), Expr::var("id")],
                    ),
                ),
                Stmt::ret(Expr::var("user")),
            ],
        )]);

        let service = build_service(&program).unwrap();
        let route = &service.routes[0];
        assert_eq!(route.path_params, vec!["id".to_string()]);
        assert_eq!(route.providers, vec![InjectionRef::new("db", "Database")]);
        assert_eq!(route.body[1], StmtIR::Return(ExprIR::var("user")));
        assert_eq!(service.providers, vec![ProviderRef::new("Database")]);
    }

    #[test]
    fn test_providers_deduplicated_in_first_injection_order() {
        let program = ast::Program::new(vec![
            route(
                ast::HttpMethod::Get,
                "/a",
                vec![
                    Injection::new("cache", Type::Redis),
                    Injection::new("db", Type::Database),
                ],
                vec![],
            ),
            route(
                ast::HttpMethod::Get,
                "/b",
                vec![
                    Injection::new("database", Type::Database),
                    Injection::new("r", Type::Redis),
                ],
                vec![],
            ),
        ]);

        let service = build_service(&program).unwrap();
        let types: Vec<_> = service.providers.iter().map(|p| p.provider_type.as_str()).collect();
        assert_eq!(types, vec!["Redis", "Database"]);
        assert_eq!(service.providers[0].name, "redis");
    }

    #[test]
    fn test_contract_methods_copied_regardless_of_order() {
        let contract = Item::Provider(ast::ProviderDef {
            name: "ImageProcessor".to_string(),
            methods: vec![ast::ProviderMethod {
                name: "resize".to_string(),
                params: vec![Field::new("width", Type::Int)],
                return_type: Some(Type::String),
            }],
        });
        let injecting = route(
            ast::HttpMethod::Post,
            "/images",
            vec![Injection::new("images", Type::named("ImageProcessor"))],
            vec![],
        );

        // contract declared after the binding that injects it
        let service = build_service(&ast::Program::new(vec![injecting, contract])).unwrap();
        let provider = service.provider("ImageProcessor").unwrap();
        assert!(!provider.is_standard);
        assert_eq!(provider.name, "image_processor");
        assert_eq!(provider.methods.len(), 1);
        assert_eq!(provider.methods[0].return_type, TypeRef::String);
    }

    #[test]
    fn test_uninjected_contract_registers_nothing() {
        let contract = Item::Provider(ast::ProviderDef {
            name: "Mailer".to_string(),
            methods: vec![],
        });
        let service = build_service(&ast::Program::new(vec![contract])).unwrap();
        assert!(service.providers.is_empty());
    }

    #[test]
    fn test_primitive_injection_is_an_error() {
        let program = ast::Program::new(vec![route(
            ast::HttpMethod::Get,
            "/api/users/:id",
            vec![Injection::new("limit", Type::Int)],
            vec![],
        )]);

        let err = build_service(&program).unwrap_err();
        assert_eq!(err.kind, BindingKind::Route);
        assert_eq!(err.name, "GET /api/users/:id");
        assert_eq!(
            err.source,
            ConversionError::NotAProvider {
                name: "limit".to_string(),
                ty: "int".to_string(),
            }
        );
    }

    #[test]
    fn test_injection_without_name_is_an_error() {
        let program = ast::Program::new(vec![route(
            ast::HttpMethod::Get,
            "/",
            vec![Injection::new("", Type::Database)],
            vec![],
        )]);
        let err = build_service(&program).unwrap_err();
        assert_eq!(
            err.source,
            ConversionError::MissingInjectionName {
                ty: "Database".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_type_is_an_error() {
        let user = Item::TypeDef(ast::TypeDef {
            name: "User".to_string(),
            ..Default::default()
        });
        let err = build_service(&ast::Program::new(vec![user.clone(), user])).unwrap_err();
        assert_eq!(err.kind, BindingKind::Type);
        assert_eq!(err.source, ConversionError::DuplicateDeclaration("User".to_string()));
    }

    #[test]
    fn test_empty_named_type_in_signature_is_an_error() {
        let function = Item::Function(ast::Function {
            name: "lookup".to_string(),
            params: vec![Field::new("key", Type::named(""))],
            ..Default::default()
        });
        let err = build_service(&ast::Program::new(vec![function])).unwrap_err();
        assert_eq!(err.kind, BindingKind::Function);
        assert_eq!(err.source, ConversionError::EmptyTypeName);
    }

    #[test]
    fn test_unnamed_contract_method_is_an_error() {
        let contract = Item::Provider(ast::ProviderDef {
            name: "Mailer".to_string(),
            methods: vec![ast::ProviderMethod::default()],
        });
        let err = build_service(&ast::Program::new(vec![contract])).unwrap_err();
        assert_eq!(err.kind, BindingKind::ProviderContract);
        assert_eq!(err.source, ConversionError::UnnamedContractMethod(0));
    }

    #[test]
    fn test_fallbacks_degrade_with_warnings() {
        let program = ast::Program::new(vec![route(
            ast::HttpMethod::Get,
            "/raw",
            vec![],
            vec![
                Stmt::DbQuery {
                    query: "SELECT 1".to_string(),
                    params: vec![],
                },
                Stmt::expr(Expr::Unsupported),
                Stmt::ret(Expr::Match {
                    value: Box::new(Expr::var("x")),
                    cases: vec![ast::MatchCase {
                        pattern: ast::Pattern::Unsupported,
                        guard: None,
                        body: Expr::int(1),
                    }],
                }),
            ],
        )]);

        let output = build(&program).unwrap();
        let body = &output.service.routes[0].body;
        assert!(body[0].is_noop());
        assert!(body[1].is_noop());
        let StmtIR::Return(ExprIR::Match(m)) = &body[2] else {
            panic!("expected a match return");
        };
        assert_eq!(m.cases[0].pattern, PatternIR::Wildcard);

        assert_eq!(output.diagnostics.warning_count(), 3);
        let first = output.diagnostics.iter().next().unwrap();
        assert_eq!(first.code, Some(ErrorCode::UNSUPPORTED_STATEMENT));
        assert_eq!(first.locations, vec!["route GET /raw".to_string()]);
    }

    #[test]
    fn test_grpc_handler_creates_missing_service() {
        let handler = Item::GrpcHandler(ast::GrpcHandler {
            service_name: "UserService".to_string(),
            method_name: "GetUser".to_string(),
            ..Default::default()
        });
        let decl = Item::GrpcService(ast::GrpcService {
            name: "UserService".to_string(),
            methods: vec![ast::GrpcMethod {
                name: "ListUsers".to_string(),
                stream: ast::StreamType::ServerStream,
                ..Default::default()
            }],
        });

        let service = build_service(&ast::Program::new(vec![handler, decl])).unwrap();
        assert_eq!(service.grpc.len(), 1);
        let grpc = &service.grpc[0];
        assert_eq!(grpc.handlers[0].method_name, "GetUser");
        assert_eq!(grpc.methods[0].stream, StreamKind::ServerStream);
        assert_eq!(grpc.methods[0].input_type, TypeRef::Any);
    }

    #[test]
    fn test_optional_field_not_double_wrapped() {
        let user = Item::TypeDef(ast::TypeDef {
            name: "User".to_string(),
            fields: vec![
                Field::new("id", Type::Int),
                Field::new("nick", Type::optional(Type::String)).optional(),
            ],
            ..Default::default()
        });
        let service = build_service(&ast::Program::new(vec![user])).unwrap();
        let nick = service.types[0].field("nick").unwrap();
        assert_eq!(nick.ty, TypeRef::String.optional());
        assert_eq!(nick.effective_type(), TypeRef::String.optional());
    }
}
