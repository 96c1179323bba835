//! Python Backend - Generates a FastAPI application
//!
//! Output is a single `main.py` plus `requirements.txt`. Records become
//! pydantic models, providers become module-level stubs with `get_*`
//! accessors, and routes receive providers through `Depends`.

use crate::lowering::*;
use crate::writer::SourceBuffer;
use crate::{CodeGen, GeneratedFile, GeneratedProgram, Target};
use glyph_ir::*;
use heck::{ToKebabCase, ToSnakeCase};

const INDENT: &str = "    ";

/// Python code generation backend
#[derive(Debug, Clone)]
pub struct PythonBackend {
    host: String,
    port: u16,
}

impl PythonBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for PythonBackend {
    fn default() -> Self {
        Self::new("0.0.0.0", Target::Python.default_port())
    }
}

impl CodeGen for PythonBackend {
    fn target(&self) -> Target {
        Target::Python
    }

    fn generate(&self, service: &ServiceIR) -> GeneratedProgram {
        let features = FeatureSet::of(service);
        let source = Emitter::new(self, service, features).emit();

        let mut auxiliary = Vec::new();
        if features.grpc {
            auxiliary.push(GeneratedFile::new(proto_path(service), proto_file(service)));
        }

        GeneratedProgram {
            target: Target::Python,
            source: GeneratedFile::new("main.py", source),
            manifest: GeneratedFile::new("requirements.txt", requirements(&features).join("\n") + "\n"),
            auxiliary,
        }
    }
}

/// `requirements.txt` entries for a feature set, in a fixed order
pub fn requirements(features: &FeatureSet) -> Vec<&'static str> {
    let mut deps = vec!["fastapi>=0.100.0", "uvicorn>=0.23.0", "pydantic>=2.0.0"];
    if features.database {
        deps.extend(["sqlalchemy>=2.0.0", "databases>=0.9.0"]);
    }
    if features.redis {
        deps.push("redis>=5.0.0");
    }
    if features.mongo {
        deps.extend(["motor>=3.3.0", "pymongo>=4.6.0"]);
    }
    if features.llm {
        deps.push("anthropic>=0.40.0");
    }
    if features.cron {
        deps.push("apscheduler>=3.10.0");
    }
    if features.queues {
        deps.push("celery>=5.3.0");
    }
    if features.graphql {
        deps.push("strawberry-graphql>=0.220.0");
    }
    if features.grpc {
        deps.extend(["grpcio>=1.60.0", "grpcio-tools>=1.60.0"]);
    }
    if features.websocket {
        deps.push("websockets>=12.0");
    }
    deps
}

/// Python spelling of a type
pub fn python_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int => "int".to_string(),
        TypeRef::Float => "float".to_string(),
        TypeRef::String => "str".to_string(),
        TypeRef::Bool => "bool".to_string(),
        TypeRef::Any => "Any".to_string(),
        TypeRef::Array(inner) => format!("List[{}]", python_type(inner, service)),
        TypeRef::Optional(inner) => format!("Optional[{}]", python_type(inner, service)),
        TypeRef::Future(inner) => python_type(inner, service),
        TypeRef::Union(elements) if elements.is_empty() => "Any".to_string(),
        TypeRef::Union(elements) => {
            let parts: Vec<_> = elements.iter().map(|e| python_type(e, service)).collect();
            format!("Union[{}]", parts.join(", "))
        }
        TypeRef::Generic { name, args } => match (name.as_str(), args.as_slice()) {
            ("List" | "Array", [inner]) => format!("List[{}]", python_type(inner, service)),
            ("Map" | "Dict", [key, value]) => format!(
                "Dict[{}, {}]",
                python_type(key, service),
                python_type(value, service)
            ),
            (_, []) => name.clone(),
            _ => {
                let args: Vec<_> = args.iter().map(|a| python_type(a, service)).collect();
                format!("{}[{}]", name, args.join(", "))
            }
        },
        TypeRef::Named(name) | TypeRef::Provider(name) => name.clone(),
        TypeRef::Function { params, ret } => {
            let params: Vec<_> = params.iter().map(|p| python_type(p, service)).collect();
            format!("Callable[[{}], {}]", params.join(", "), python_type(ret, service))
        }
    }
}

fn python_float(value: f64) -> String {
    if value.is_nan() {
        "float(\"nan\")".to_string()
    } else if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("float(\"{}inf\")", sign)
    } else {
        render_float(value)
    }
}

fn python_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int(v) => v.to_string(),
        LiteralValue::Float(v) => python_float(*v),
        LiteralValue::String(v) => quote(v, '"'),
        LiteralValue::Bool(true) => "True".to_string(),
        LiteralValue::Bool(false) => "False".to_string(),
        LiteralValue::Null => "None".to_string(),
    }
}

fn binop(op: BinOp) -> &'static str {
    match op {
        BinOp::And => "and",
        BinOp::Or => "or",
        other => other.symbol(),
    }
}

fn access_path(root: &str, path: &[Access]) -> String {
    let mut out = root.to_string();
    for step in path {
        match step {
            Access::Key(key) => out.push_str(&format!("[{}]", quote(key, '"'))),
            Access::Index(i) => out.push_str(&format!("[{}]", i)),
            Access::RestFrom(i) => out.push_str(&format!("[{}:]", i)),
        }
    }
    out
}

fn render_check(check: &Check) -> String {
    match check {
        Check::IsObject(path) => format!("isinstance({}, dict)", access_path("__subject", path)),
        Check::HasKey(path, key) => format!("{} in {}", quote(key, '"'), access_path("__subject", path)),
        Check::ArrayLen { path, len, exact } => {
            let target = access_path("__subject", path);
            let op = if *exact { "==" } else { ">=" };
            format!("isinstance({0}, list) and len({0}) {1} {2}", target, op, len)
        }
        Check::Equals(path, value) => {
            format!("{} == {}", access_path("__subject", path), python_literal(value))
        }
    }
}

fn auth_comment(auth: &AuthRequirement) -> String {
    if auth.roles.is_empty() {
        format!("# Requires {} authentication", auth.auth_type)
    } else {
        format!(
            "# Requires {} authentication (roles: {})",
            auth.auth_type,
            auth.roles.join(", ")
        )
    }
}

/// Per-generation state; hoisted helpers are numbered in emission order
struct Emitter<'a> {
    backend: &'a PythonBackend,
    service: &'a ServiceIR,
    features: FeatureSet,
    hoisted: usize,
    /// Status code for route responses, set while a route body is rendered
    route_status: Option<u16>,
}

impl<'a> Emitter<'a> {
    fn new(backend: &'a PythonBackend, service: &'a ServiceIR, features: FeatureSet) -> Self {
        Self {
            backend,
            service,
            features,
            hoisted: 0,
            route_status: None,
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
                out.line("");
                out.line(format!("# --- {} ---", section.title()));
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
        out.line(format!("# Generated by glyph from service `{}`", self.service.name));
        out.line("# Do not edit manually");
        out.blank();
        out.line("import asyncio");
        out.line("import json");
        out.line("import os");
        out.line("import uuid");
        if f.commands {
            out.line("import argparse");
        }
        out.line("from typing import Any, AsyncGenerator, Callable, Dict, Generic, List, Optional, TypeVar, Union");
        out.blank();
        let mut fastapi = vec!["Depends", "FastAPI", "HTTPException", "Query", "Request"];
        if f.websocket {
            fastapi.extend(["WebSocket", "WebSocketDisconnect"]);
        }
        out.line(format!("from fastapi import {}", fastapi.join(", ")));
        out.line("from fastapi.encoders import jsonable_encoder");
        out.line("from fastapi.responses import JSONResponse");
        out.line("from pydantic import BaseModel");
        out.line("import uvicorn");
        if f.redis {
            out.line("import redis");
        }
        if f.mongo {
            out.line("from motor.motor_asyncio import AsyncIOMotorClient");
        }
        if f.llm {
            out.line("import anthropic");
        }
        if f.cron {
            out.line("from apscheduler.schedulers.asyncio import AsyncIOScheduler");
            out.line("from apscheduler.triggers.cron import CronTrigger");
        }
        if f.queues {
            out.line("from celery import Celery");
        }
        if f.graphql {
            out.line("import strawberry");
            out.line("from strawberry.fastapi import GraphQLRouter");
            out.line("from strawberry.scalars import JSON");
        }
        if f.grpc {
            out.line("import grpc");
        }
    }

    fn emit_types(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let type_vars = declared_type_params(service);
        if !type_vars.is_empty() {
            out.blank();
            for name in &type_vars {
                out.line(format!("{0} = TypeVar({1})", name, quote(name, '"')));
            }
        }
        for schema in &service.types {
            out.blank();
            self.emit_record(schema, out);
        }

        if !service.constants.is_empty() {
            out.blank();
        }
        for constant in &service.constants {
            let mut pre = out.child();
            let value = self.top_expr(&constant.value, &mut pre);
            out.append(pre);
            match &constant.ty {
                Some(ty) => out.line(format!(
                    "{}: {} = {}",
                    constant.name,
                    python_type(ty, service),
                    value
                )),
                None => out.line(format!("{} = {}", constant.name, value)),
            }
        }

        for function in &service.functions {
            out.blank();
            out.line("");
            let params = self.params(&function.params, out);
            let keyword = if body_awaits(&function.body) { "async def" } else { "def" };
            let ret = function
                .return_type
                .as_ref()
                .map(|t| format!(" -> {}", python_type(t, service)))
                .unwrap_or_default();
            out.line(format!("{} {}({}){}:", keyword, function.name, params, ret));
            out.indent();
            self.block(&function.body, BodyContext::Function, out);
            out.dedent();
        }

        for command in &service.commands {
            out.blank();
            out.line("");
            out.line(format!("async def {}(args):", command_fn_name(&command.name)));
            out.indent();
            if !command.description.is_empty() {
                out.line(format!("\"\"\"{}\"\"\"", command.description.replace("\"\"\"", "'''")));
            }
            for param in &command.params {
                out.line(format!("{0} = args.{0}", param.name));
            }
            self.block(&command.body, BodyContext::Command, out);
            out.dedent();
        }
    }

    fn emit_record(&mut self, schema: &TypeSchema, out: &mut SourceBuffer) {
        let service = self.service;
        out.line("");
        if schema.type_params.is_empty() {
            out.line(format!("class {}(BaseModel):", schema.name));
        } else {
            out.line(format!(
                "class {}(BaseModel, Generic[{}]):",
                schema.name,
                schema.type_params.join(", ")
            ));
        }
        out.indent();
        if schema.fields.is_empty() && schema.methods.is_empty() {
            out.line("pass");
        }
        for field in &schema.fields {
            let (ty, optional) = optional_field(field);
            let mut ty = python_type(ty, service);
            if optional {
                ty = format!("Optional[{}]", ty);
            }
            let mut pre = out.child();
            let default = match &field.default {
                Some(value) => Some(self.expr(value, &mut pre)),
                None if optional => Some("None".to_string()),
                None => None,
            };
            out.append(pre);
            let mut line = match default {
                Some(default) => format!("{}: {} = {}", field.name, ty, default),
                None => format!("{}: {}", field.name, ty),
            };
            if !field.annotations.is_empty() {
                let names: Vec<_> = field.annotations.iter().map(|a| format!("@{}", a.name)).collect();
                line.push_str(&format!("  # {}", names.join(" ")));
            }
            out.line(line);
        }
        for method in &schema.methods {
            out.blank();
            let params = self.params(&method.params, out);
            let params = if params.is_empty() {
                "self".to_string()
            } else {
                format!("self, {}", params)
            };
            let keyword = if body_awaits(&method.body) { "async def" } else { "def" };
            out.line(format!(
                "{} {}({}) -> {}:",
                keyword,
                method.name,
                params,
                python_type(&method.return_type, service)
            ));
            out.indent();
            self.block(&method.body, BodyContext::Function, out);
            out.dedent();
        }
        out.dedent();
    }

    fn emit_providers(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        for provider in &service.providers {
            out.blank();
            match provider.standard() {
                Some(StandardProvider::Database) => {
                    out.line("# Database provider stub - replace with a real implementation");
                    out.line("class TableProxy:");
                    out.indented(|b| {
                        b.line("def __init__(self, name: str):");
                        b.indented(|b| b.line("self.name = name"));
                        for (method, params) in [
                            ("Get", "id"),
                            ("Find", "filter=None"),
                            ("Create", "data"),
                            ("Update", "id, data"),
                            ("Delete", "id"),
                            ("Where", "filter"),
                        ] {
                            b.blank();
                            b.line(format!("def {}(self, {}):", method, params));
                            b.indented(|b| {
                                b.line(format!("raise NotImplementedError(f\"{{self.name}}.{}\")", method))
                            });
                        }
                    });
                    out.blank();
                    out.line("");
                    out.line("class DatabaseProvider:");
                    out.indented(|b| {
                        b.line("def __init__(self):");
                        b.indented(|b| b.line("self._tables: Dict[str, TableProxy] = {}"));
                        b.blank();
                        b.line("def __getattr__(self, name: str) -> TableProxy:");
                        b.indented(|b| {
                            b.line("if name not in self._tables:");
                            b.indented(|b| b.line("self._tables[name] = TableProxy(name)"));
                            b.line("return self._tables[name]");
                        });
                    });
                    out.blank();
                    out.line("");
                    out.line("db_provider = DatabaseProvider()");
                    out.blank();
                    out.line("");
                    out.line("def get_db() -> DatabaseProvider:");
                    out.indented(|b| b.line("return db_provider"));
                }
                Some(StandardProvider::Redis) => {
                    out.line("redis_client = redis.Redis.from_url(");
                    out.indented(|b| {
                        b.line("os.getenv(\"REDIS_URL\", \"redis://localhost:6379\"), decode_responses=True")
                    });
                    out.line(")");
                    out.blank();
                    out.line("");
                    out.line("def get_redis() -> redis.Redis:");
                    out.indented(|b| b.line("return redis_client"));
                }
                Some(StandardProvider::MongoDB) => {
                    out.line("mongo_client = AsyncIOMotorClient(os.getenv(\"MONGODB_URL\", \"mongodb://localhost:27017\"))");
                    out.line(format!(
                        "mongo_database = mongo_client[os.getenv(\"MONGODB_DATABASE\", {})]",
                        quote(&service.name, '"')
                    ));
                    out.blank();
                    out.line("");
                    out.line("def get_mongo():");
                    out.indented(|b| b.line("return mongo_database"));
                }
                Some(StandardProvider::Llm) => {
                    out.line("llm_client = anthropic.AsyncAnthropic()");
                    out.blank();
                    out.line("");
                    out.line("def get_llm() -> anthropic.AsyncAnthropic:");
                    out.indented(|b| b.line("return llm_client"));
                }
                None => self.emit_custom_provider(provider, out),
            }
        }
    }

    fn emit_custom_provider(&mut self, provider: &ProviderRef, out: &mut SourceBuffer) {
        let service = self.service;
        let class = format!("{}Provider", provider.provider_type);
        out.line(format!("class {}:", class));
        out.indented(|b| {
            b.line(format!("\"\"\"Custom provider {}\"\"\"", provider.provider_type));
            for method in &provider.methods {
                let mut params = vec!["self".to_string()];
                params.extend(
                    method
                        .params
                        .iter()
                        .map(|p| format!("{}: {}", p.name, python_type(&p.effective_type(), service))),
                );
                b.blank();
                b.line(format!(
                    "def {}({}) -> {}:",
                    method.name,
                    params.join(", "),
                    python_type(&method.return_type, service)
                ));
                b.indented(|b| {
                    b.line(format!(
                        "raise NotImplementedError({})",
                        quote(&format!("{}.{}", provider.provider_type, method.name), '"')
                    ))
                });
            }
        });
        let instance = format!("{}_provider", provider.name);
        out.blank();
        out.line("");
        out.line(format!("{} = {}()", instance, class));
        out.blank();
        out.line("");
        out.line(format!("def {}() -> {}:", accessor_name(&provider.provider_type, false), class));
        out.indented(|b| b.line(format!("return {}", instance)));
    }

    fn emit_bootstrap(&mut self, out: &mut SourceBuffer) {
        out.line(format!("app = FastAPI(title={})", quote(&self.service.name, '"')));
    }

    fn emit_routes(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let names = route_fn_names(&service.routes);
        for (route, name) in service.routes.iter().zip(names) {
            out.blank();
            out.line("");
            self.emit_route(route, &name, out);
        }
    }

    fn emit_route(&mut self, route: &RouteHandler, name: &str, out: &mut SourceBuffer) {
        let service = self.service;
        let mut pre = out.child();
        let mut required = Vec::new();
        let mut defaulted = Vec::new();

        for param in &route.path_params {
            required.push(format!("{}: str", param));
        }
        if let Some(input) = &route.input_type {
            let ty = match input {
                TypeRef::Named(n) if service.type_schema(n).is_some() => n.clone(),
                _ => "Dict[str, Any]".to_string(),
            };
            required.push(format!("input: {}", ty));
        }
        for query in &route.query_params {
            let base = python_type(query.ty.without_optional(), service);
            let ty = if query.is_array { format!("List[{}]", base) } else { base };
            let default = query.default.as_ref().map(|d| self.expr(d, &mut pre));
            match (default, query.required, query.is_array) {
                (Some(default), _, true) => defaulted.push(format!("{}: {} = Query({})", query.name, ty, default)),
                (Some(default), _, false) => defaulted.push(format!("{}: {} = {}", query.name, ty, default)),
                (None, true, true) => required.push(format!("{}: {} = Query(...)", query.name, ty)),
                (None, true, false) => required.push(format!("{}: {}", query.name, ty)),
                (None, false, true) => {
                    defaulted.push(format!("{}: Optional[{}] = Query(None)", query.name, ty))
                }
                (None, false, false) => defaulted.push(format!("{}: Optional[{}] = None", query.name, ty)),
            }
        }
        for injection in &route.providers {
            defaulted.push(format!(
                "{} = Depends({})",
                injection.name,
                accessor_name(&injection.provider_type, false)
            ));
        }
        required.extend(defaulted);
        out.append(pre);

        let verb = http_verb(route.method);
        let status = if route.method == HttpMethod::Post { ", status_code=201" } else { "" };
        out.line(format!("@app.{}({}{})", verb, quote(&brace_path(&route.path), '"'), status));
        out.line(format!("async def {}({}):", name, required.join(", ")));
        out.indent();
        if let Some(auth) = &route.auth {
            out.line(auth_comment(auth));
        }
        if let Some(limit) = &route.rate_limit {
            out.line(format!("# Rate limited: {} requests per {}", limit.requests, limit.window));
        }
        for middleware in &route.middleware {
            out.line(format!("# Middleware: {}", middleware.name));
        }
        self.route_status = Some(if route.method == HttpMethod::Post { 201 } else { 200 });
        self.block(&route.body, BodyContext::Route, out);
        self.route_status = None;
        out.dedent();
    }

    fn emit_graphql(&mut self, out: &mut SourceBuffer) {
        if !self.features.graphql {
            return;
        }
        let service = self.service;
        let mut roots = Vec::new();
        for op in GraphQlOp::ALL {
            let resolvers: Vec<&GraphQlDef> = service.graphql_ops(op).collect();
            if resolvers.is_empty() && op != GraphQlOp::Query {
                continue;
            }
            roots.push(op);
            out.blank();
            out.line("");
            out.line("@strawberry.type");
            out.line(format!("class {}:", op.root_type()));
            out.indent();
            if resolvers.is_empty() {
                out.line("@strawberry.field");
                out.line(format!("def {}(self) -> str:", GRAPHQL_PLACEHOLDER_FIELD));
                out.indented(|b| b.line(format!("return {}", quote(&service.name, '"'))));
            }
            for (i, resolver) in resolvers.into_iter().enumerate() {
                if i > 0 {
                    out.blank();
                }
                self.emit_resolver(resolver, out);
            }
            out.dedent();
        }

        let args: Vec<String> = roots
            .iter()
            .map(|op| format!("{}={}", op.root_type().to_snake_case(), op.root_type()))
            .collect();
        out.blank();
        out.line("");
        out.line(format!("schema = strawberry.Schema({})", args.join(", ")));
        out.line("graphql_app = GraphQLRouter(schema)");
        out.line("app.include_router(graphql_app, prefix=\"/graphql\")");
    }

    fn emit_resolver(&mut self, resolver: &GraphQlDef, out: &mut SourceBuffer) {
        let service = self.service;
        let mut params = vec!["self".to_string()];
        for p in &resolver.params {
            params.push(format!("{}: {}", p.name, graphql_python_type(&p.effective_type(), service)));
        }
        let subscription = resolver.operation == GraphQlOp::Subscription;
        if subscription {
            out.line("@strawberry.subscription");
            out.line(format!(
                "async def {}({}) -> AsyncGenerator[JSON, None]:",
                resolver.field_name,
                params.join(", ")
            ));
        } else {
            out.line("@strawberry.field");
            out.line(format!("async def {}({}) -> JSON:", resolver.field_name, params.join(", ")));
        }
        out.indent();
        if let Some(auth) = &resolver.auth {
            out.line(auth_comment(auth));
        }
        self.inject(&resolver.providers, out);
        if subscription {
            out.line("async def resolve():");
            out.indent();
            self.block(&resolver.body, BodyContext::Resolver, out);
            out.dedent();
            out.line("yield await resolve()");
        } else {
            self.block(&resolver.body, BodyContext::Resolver, out);
        }
        out.dedent();
    }

    fn emit_grpc(&mut self, out: &mut SourceBuffer) {
        if !self.features.grpc {
            return;
        }
        let service = self.service;
        out.line("def _json_deserialize(data: bytes) -> Any:");
        out.indented(|b| b.line("return json.loads(data.decode(\"utf-8\")) if data else {}"));
        out.blank();
        out.line("");
        out.line("def _json_serialize(value: Any) -> bytes:");
        out.indented(|b| b.line("return json.dumps(jsonable_encoder(value)).encode(\"utf-8\")"));

        for def in &service.grpc {
            let plans = grpc_method_plans(def);
            out.blank();
            out.line("");
            out.line(format!("class {}Servicer:", def.name));
            out.indent();
            out.line("\"\"\"");
            for line in proto_service_definition(def, service) {
                out.line(line);
            }
            out.line("\"\"\"");
            for plan in &plans {
                out.blank();
                self.emit_grpc_method(plan, out);
            }
            out.dedent();

            out.blank();
            out.line("");
            out.line(format!("def add_{}_to_server(servicer, server):", def.name.to_snake_case()));
            out.indent();
            out.line("handlers = {");
            out.indent();
            for plan in &plans {
                let factory = match plan.stream {
                    StreamKind::Unary => "unary_unary",
                    StreamKind::ServerStream => "unary_stream",
                    StreamKind::ClientStream => "stream_unary",
                    StreamKind::Bidirectional => "stream_stream",
                };
                out.line(format!("{}: grpc.{}_rpc_method_handler(", quote(plan.name, '"'), factory));
                out.indented(|b| {
                    b.line(format!("servicer.{},", plan.name));
                    b.line("request_deserializer=_json_deserialize,");
                    b.line("response_serializer=_json_serialize,");
                });
                out.line("),");
            }
            out.dedent();
            out.line("}");
            out.line(format!(
                "server.add_generic_rpc_handlers((grpc.method_handlers_generic_handler({}, handlers),))",
                quote(&def.name, '"')
            ));
            out.dedent();
        }

        out.blank();
        out.line("");
        out.line("async def serve_grpc():");
        out.indent();
        out.line("server = grpc.aio.server()");
        for def in &service.grpc {
            out.line(format!(
                "add_{}_to_server({}Servicer(), server)",
                def.name.to_snake_case(),
                def.name
            ));
        }
        out.line(format!("server.add_insecure_port(\"[::]:{}\")", GRPC_PORT));
        out.line("await server.start()");
        out.line("await server.wait_for_termination()");
        out.dedent();
        out.blank();
        out.line("");
        out.line("@app.on_event(\"startup\")");
        out.line("async def start_grpc():");
        out.indented(|b| b.line("asyncio.ensure_future(serve_grpc())"));
    }

    fn emit_grpc_method(&mut self, plan: &GrpcMethodPlan<'_>, out: &mut SourceBuffer) {
        out.line(format!("async def {}(self, request, context):", plan.name));
        out.indent();
        match plan.handler {
            None => {
                out.line("await context.abort(grpc.StatusCode.UNIMPLEMENTED, \"Not implemented\")");
            }
            Some(handler) => {
                if let Some(auth) = &handler.auth {
                    out.line(auth_comment(auth));
                }
                if matches!(plan.stream, StreamKind::Unary | StreamKind::ServerStream) {
                    for param in &handler.params {
                        out.line(format!("{} = request.get({})", param.name, quote(&param.name, '"')));
                    }
                }
                self.inject(&handler.providers, out);
                if matches!(plan.stream, StreamKind::ServerStream | StreamKind::Bidirectional) {
                    out.line("async def resolve():");
                    out.indent();
                    self.block(&handler.body, BodyContext::Rpc, out);
                    out.dedent();
                    out.line("yield await resolve()");
                } else {
                    self.block(&handler.body, BodyContext::Rpc, out);
                }
            }
        }
        out.dedent();
    }

    fn emit_websockets(&mut self, out: &mut SourceBuffer) {
        if !self.features.websocket {
            return;
        }
        let service = self.service;
        out.line("ws_connections: Dict[str, Dict[str, WebSocket]] = {}");
        out.blank();
        out.line("");
        out.line("async def broadcast(path: str, message: Any) -> None:");
        out.indented(|b| {
            b.line("for connection in list(ws_connections.get(path, {}).values()):");
            b.indented(|b| b.line("await connection.send_json(jsonable_encoder(message))"));
        });

        let names = websocket_fn_names(&service.websockets);
        for (ws, name) in service.websockets.iter().zip(names) {
            out.blank();
            out.line("");
            self.emit_websocket(ws, &name, out);
        }
    }

    fn emit_websocket(&mut self, ws: &WebSocketDef, name: &str, out: &mut SourceBuffer) {
        let mut params = vec!["websocket: WebSocket".to_string()];
        params.extend(path_params(&ws.path).into_iter().map(|p| format!("{}: str", p)));
        let key = quote(&ws.path, '"');

        out.line(format!("@app.websocket({})", quote(&brace_path(&ws.path), '"')));
        out.line(format!("async def {}({}):", name, params.join(", ")));
        out.indent();
        out.line("client_id = str(uuid.uuid4())");

        for (event, signature) in [
            (WsEvent::Connect, "on_connect()"),
            (WsEvent::Message, "on_message(message)"),
            (WsEvent::Disconnect, "on_disconnect()"),
            (WsEvent::Error, "on_error(error)"),
        ] {
            if let Some(def) = ws.event(event) {
                out.blank();
                out.line(format!("async def {}:", signature));
                out.indent();
                self.block(&def.body, BodyContext::WebSocket, out);
                out.dedent();
            }
        }

        let reply = |b: &mut SourceBuffer, call: &str| {
            b.line(format!("reply = await {}", call));
            b.line("if reply is not None:");
            b.indented(|b| b.line("await websocket.send_json(jsonable_encoder(reply))"));
        };

        out.blank();
        out.line("await websocket.accept()");
        out.line(format!("ws_connections.setdefault({}, {{}})[client_id] = websocket", key));
        out.line("try:");
        out.indent();
        if ws.event(WsEvent::Connect).is_some() {
            reply(out, "on_connect()");
        }
        out.line("while True:");
        out.indented(|b| {
            b.line("message = await websocket.receive_json()");
            if ws.event(WsEvent::Message).is_some() {
                reply(b, "on_message(message)");
            }
        });
        out.dedent();
        out.line("except WebSocketDisconnect:");
        out.indented(|b| b.line("pass"));
        out.line("except Exception as error:");
        out.indented(|b| {
            if ws.event(WsEvent::Error).is_some() {
                b.line("await on_error(error)");
            } else {
                b.line("pass");
            }
        });
        out.line("finally:");
        out.indented(|b| {
            b.line(format!("ws_connections.get({}, {{}}).pop(client_id, None)", key));
            if ws.event(WsEvent::Disconnect).is_some() {
                b.line("await on_disconnect()");
            }
        });
        out.dedent();
    }

    fn emit_cron(&mut self, out: &mut SourceBuffer) {
        if !self.features.cron {
            return;
        }
        let service = self.service;
        out.line("scheduler = AsyncIOScheduler()");
        let names = cron_fn_names(&service.cron_jobs);
        for (job, name) in service.cron_jobs.iter().zip(names) {
            out.blank();
            out.line("");
            let timezone = job
                .timezone
                .as_ref()
                .map(|tz| format!(", timezone={}", quote(tz, '"')))
                .unwrap_or_default();
            out.line(format!(
                "@scheduler.scheduled_job(CronTrigger.from_crontab({}{}))",
                quote(&job.schedule, '"'),
                timezone
            ));
            out.line(format!("async def {}():", name));
            out.indent();
            if job.retries > 0 {
                out.line(format!("# Retries: {}", job.retries));
            }
            self.inject(&job.providers, out);
            self.block(&job.body, BodyContext::Background, out);
            out.dedent();
        }
        out.blank();
        out.line("");
        out.line("@app.on_event(\"startup\")");
        out.line("async def start_scheduler():");
        out.indented(|b| b.line("scheduler.start()"));
    }

    fn emit_events(&mut self, out: &mut SourceBuffer) {
        if !self.features.events {
            return;
        }
        let service = self.service;
        out.line("event_handlers: Dict[str, List[Any]] = {}");
        out.blank();
        out.line("");
        out.line("def on_event(event_type: str, background: bool = False):");
        out.indented(|b| {
            b.line("def register(handler):");
            b.indented(|b| {
                b.line("event_handlers.setdefault(event_type, []).append((handler, background))");
                b.line("return handler");
            });
            b.line("return register");
        });
        out.blank();
        out.line("");
        out.line("async def emit(event_type: str, event: Any) -> None:");
        out.indented(|b| {
            b.line("for handler, background in event_handlers.get(event_type, []):");
            b.indented(|b| {
                b.line("if background:");
                b.indented(|b| b.line("asyncio.ensure_future(handler(event))"));
                b.line("else:");
                b.indented(|b| b.line("await handler(event)"));
            });
        });

        let names = event_handler_names(&service.events);
        for (event, name) in service.events.iter().zip(names) {
            out.blank();
            out.line("");
            let background = if event.is_async { ", background=True" } else { "" };
            out.line(format!("@on_event({}{})", quote(&event.event_type, '"'), background));
            out.line(format!("async def {}(event):", name));
            out.indent();
            self.inject(&event.providers, out);
            self.block(&event.body, BodyContext::Background, out);
            out.dedent();
        }
    }

    fn emit_queues(&mut self, out: &mut SourceBuffer) {
        if !self.features.queues {
            return;
        }
        let service = self.service;
        out.line(format!(
            "celery_app = Celery({}, broker=os.getenv(\"CELERY_BROKER_URL\", \"redis://localhost:6379/0\"))",
            quote(&service.name, '"')
        ));
        let names = queue_worker_names(&service.queues);
        for (queue, name) in service.queues.iter().zip(names) {
            out.blank();
            out.line("");
            out.line(format!("async def {}(message):", name));
            out.indent();
            if queue.concurrency > 0 {
                out.line(format!("# Concurrency: {}", queue.concurrency));
            }
            self.inject(&queue.providers, out);
            self.block(&queue.body, BodyContext::Background, out);
            out.dedent();

            let mut options = vec![format!("name={}", quote(&queue.queue_name, '"'))];
            if queue.max_retries > 0 {
                options.push(format!("max_retries={}", queue.max_retries));
            }
            if queue.timeout_secs > 0 {
                options.push(format!("time_limit={}", queue.timeout_secs));
            }
            out.blank();
            out.line("");
            out.line(format!("@celery_app.task({})", options.join(", ")));
            out.line(format!("def {}_task(message):", name));
            out.indented(|b| b.line(format!("return asyncio.run({}(message))", name)));
        }
    }

    fn emit_entrypoint(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let serve = format!(
            "uvicorn.run(app, host={}, port={})",
            quote(&self.backend.host, '"'),
            self.backend.port
        );

        if service.commands.is_empty() {
            out.line("if __name__ == \"__main__\":");
            out.indented(|b| b.line(serve));
            return;
        }

        out.line("def main() -> None:");
        out.indent();
        out.line(format!("parser = argparse.ArgumentParser(prog={})", quote(&service.name, '"')));
        out.line("subcommands = parser.add_subparsers(dest=\"command\")");
        out.line("subcommands.add_parser(\"serve\", help=\"Run the HTTP server\")");
        for command in &service.commands {
            let var = format!("{}_parser", command.name.to_snake_case());
            let help = if command.description.is_empty() {
                String::new()
            } else {
                format!(", help={}", quote(&command.description, '"'))
            };
            out.line(format!(
                "{} = subcommands.add_parser({}{})",
                var,
                quote(&command.name, '"'),
                help
            ));
            for param in &command.params {
                let mut args = vec![
                    quote(&format!("--{}", param.name.to_kebab_case()), '"'),
                    format!("dest={}", quote(&param.name, '"')),
                ];
                if param.is_flag {
                    args.push("action=\"store_true\"".to_string());
                } else {
                    match param.ty.without_optional() {
                        TypeRef::Int => args.push("type=int".to_string()),
                        TypeRef::Float => args.push("type=float".to_string()),
                        TypeRef::String => args.push("type=str".to_string()),
                        _ => args.push("type=json.loads".to_string()),
                    }
                    match &param.default {
                        Some(default) => {
                            let mut pre = out.child();
                            let value = self.expr(default, &mut pre);
                            out.append(pre);
                            args.push(format!("default={}", value));
                        }
                        None if param.required => args.push("required=True".to_string()),
                        None => {}
                    }
                }
                out.line(format!("{}.add_argument({})", var, args.join(", ")));
            }
        }
        out.line("args = parser.parse_args()");
        out.blank();
        for command in &service.commands {
            out.line(format!("if args.command == {}:", quote(&command.name, '"')));
            out.indented(|b| {
                b.line(format!("result = asyncio.run({}(args))", command_fn_name(&command.name)));
                b.line("if result is not None:");
                b.indented(|b| b.line("print(json.dumps(jsonable_encoder(result), indent=2))"));
                b.line("return");
            });
        }
        out.line(serve);
        out.dedent();
        out.blank();
        out.line("");
        out.line("if __name__ == \"__main__\":");
        out.indented(|b| b.line("main()"));
    }

    // ========================================
    // Bodies
    // ========================================

    fn params(&mut self, params: &[FieldSchema], out: &mut SourceBuffer) -> String {
        let service = self.service;
        let mut rendered = Vec::new();
        for p in params {
            let ty = python_type(&p.effective_type(), service);
            match &p.default {
                Some(default) => {
                    let mut pre = out.child();
                    let value = self.expr(default, &mut pre);
                    out.append(pre);
                    rendered.push(format!("{}: {} = {}", p.name, ty, value));
                }
                None if !p.required => rendered.push(format!("{}: {} = None", p.name, ty)),
                None => rendered.push(format!("{}: {}", p.name, ty)),
            }
        }
        rendered.join(", ")
    }

    fn inject(&mut self, providers: &[InjectionRef], out: &mut SourceBuffer) {
        for injection in providers {
            out.line(format!(
                "{} = {}()",
                injection.name,
                accessor_name(&injection.provider_type, false)
            ));
        }
    }

    fn block(&mut self, body: &[StmtIR], ctx: BodyContext, out: &mut SourceBuffer) {
        if body.is_empty() {
            out.line("pass");
            return;
        }
        for stmt in body {
            self.stmt(stmt, ctx, out);
        }
    }

    fn stmt(&mut self, stmt: &StmtIR, ctx: BodyContext, out: &mut SourceBuffer) {
        let mut pre = out.child();
        match stmt {
            StmtIR::Assign { target, value } | StmtIR::Reassign { target, value } => {
                let value = self.top_expr(value, &mut pre);
                out.append(pre);
                out.line(format!("{} = {}", target, value));
            }
            StmtIR::Return(value) => {
                let value = self.top_expr(value, &mut pre);
                out.append(pre);
                match self.route_status.filter(|_| ctx.returns_wire_response()) {
                    Some(201) => out.line(format!(
                        "return JSONResponse(status_code=201, content=jsonable_encoder({}))",
                        value
                    )),
                    Some(_) => out.line(format!("return JSONResponse(content=jsonable_encoder({}))", value)),
                    None => out.line(format!("return {}", value)),
                }
            }
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => {
                let condition = self.top_expr(condition, &mut pre);
                out.append(pre);
                out.line(format!("if {}:", condition));
                out.indent();
                self.block(then_body, ctx, out);
                out.dedent();
                if !else_body.is_empty() {
                    out.line("else:");
                    out.indent();
                    self.block(else_body, ctx, out);
                    out.dedent();
                }
            }
            StmtIR::For {
                key,
                value,
                iterable,
                body,
            } => {
                let iterable = self.expr(iterable, &mut pre);
                out.append(pre);
                match key {
                    Some(key) => out.line(format!("for {}, {} in enumerate({}):", key, value, iterable)),
                    None => out.line(format!("for {} in {}:", value, iterable)),
                }
                out.indent();
                self.block(body, ctx, out);
                out.dedent();
            }
            StmtIR::While { condition, body } => {
                let condition = self.top_expr(condition, &mut pre);
                out.append(pre);
                out.line(format!("while {}:", condition));
                out.indent();
                self.block(body, ctx, out);
                out.dedent();
            }
            StmtIR::Switch {
                value,
                cases,
                default,
            } => {
                let subject = self.fresh("switch");
                let value = self.top_expr(value, &mut pre);
                let labels: Vec<String> = cases.iter().map(|c| self.expr(&c.value, &mut pre)).collect();
                out.append(pre);
                out.line(format!("{} = {}", subject, value));
                for (i, (case, label)) in cases.iter().zip(labels).enumerate() {
                    let keyword = if i == 0 { "if" } else { "elif" };
                    out.line(format!("{} {} == {}:", keyword, subject, label));
                    out.indent();
                    self.block(without_trailing_break(&case.body), ctx, out);
                    out.dedent();
                }
                let default = without_trailing_break(default);
                if !default.is_empty() {
                    if cases.is_empty() {
                        self.block(default, ctx, out);
                    } else {
                        out.line("else:");
                        out.indent();
                        self.block(default, ctx, out);
                        out.dedent();
                    }
                }
            }
            StmtIR::Expr(ExprIR::Null) => out.line("pass"),
            StmtIR::Expr(expr) => {
                let expr = self.top_expr(expr, &mut pre);
                out.append(pre);
                out.line(expr);
            }
            StmtIR::Validate(check) => {
                let check = self.expr(check, &mut pre);
                out.append(pre);
                out.line(format!("if not {}:", check));
                if ctx.returns_wire_response() {
                    out.indented(|b| {
                        b.line("raise HTTPException(status_code=400, detail=\"Validation failed\")")
                    });
                } else {
                    out.indented(|b| b.line("raise ValueError(\"Validation failed\")"));
                }
            }
            StmtIR::Break => out.line("break"),
            StmtIR::Continue => out.line("continue"),
        }
    }

    /// Statement-level expression: a bare `await` needs no parentheses
    fn top_expr(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Await(inner) => format!("await {}", self.expr(inner, pre)),
            other => self.expr(other, pre),
        }
    }

    fn expr(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Int(v) => v.to_string(),
            ExprIR::Float(v) => python_float(*v),
            ExprIR::String(v) => quote(v, '"'),
            ExprIR::Bool(true) => "True".to_string(),
            ExprIR::Bool(false) => "False".to_string(),
            ExprIR::Null => "None".to_string(),
            ExprIR::Var(name) => name.clone(),
            ExprIR::Binary { op, left, right } => {
                let left = self.expr(left, pre);
                let right = self.expr(right, pre);
                format!("({} {} {})", left, binop(*op), right)
            }
            ExprIR::Unary { op: UnOp::Not, operand } => format!("(not {})", self.expr(operand, pre)),
            ExprIR::Unary { op: UnOp::Neg, operand } => format!("-{}", self.expr(operand, pre)),
            ExprIR::FieldAccess { object, field } => format!("{}.{}", self.expr(object, pre), field),
            ExprIR::IndexAccess { object, index } => {
                let object = self.expr(object, pre);
                let index = self.expr(index, pre);
                format!("{}[{}]", object, index)
            }
            ExprIR::Call(call) => match classify_call(call) {
                CallShape::Method { receiver, name, args } => {
                    let receiver = self.expr(receiver, pre);
                    let args = self.args(args, pre);
                    format!("{}.{}({})", receiver, name, args)
                }
                CallShape::Function { name, args } => format!("{}({})", name, self.args(args, pre)),
            },
            ExprIR::Object(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{}: {}", quote(&f.key, '"'), self.expr(&f.value, pre)))
                    .collect();
                format!("{{{}}}", fields.join(", "))
            }
            ExprIR::Array(elements) => format!("[{}]", self.args(elements, pre)),
            ExprIR::Lambda(lambda) => self.lambda(lambda, pre),
            ExprIR::Pipe { left, right } => match lower_pipe(left, right) {
                PipeCall::Call { name, args } => {
                    let args: Vec<String> = args.into_iter().map(|a| self.expr(a, pre)).collect();
                    format!("{}({})", name, args.join(", "))
                }
                PipeCall::Apply { callee, arg } => {
                    let callee = self.expr(callee, pre);
                    let arg = self.expr(arg, pre);
                    format!("({})({})", callee, arg)
                }
            },
            ExprIR::Match(m) => self.match_expr(m, pre),
            ExprIR::Async(body) => {
                let name = self.fresh("async");
                pre.line(format!("async def {}():", name));
                pre.indent();
                self.block(body, BodyContext::Closure, pre);
                pre.dedent();
                format!("asyncio.ensure_future({}())", name)
            }
            ExprIR::Await(inner) => format!("(await {})", self.expr(inner, pre)),
        }
    }

    fn args(&mut self, args: &[ExprIR], pre: &mut SourceBuffer) -> String {
        let args: Vec<String> = args.iter().map(|a| self.expr(a, pre)).collect();
        args.join(", ")
    }

    fn lambda(&mut self, lambda: &LambdaExpr, pre: &mut SourceBuffer) -> String {
        let params: Vec<&str> = lambda.params.iter().map(|p| p.name.as_str()).collect();
        let params = params.join(", ");
        match &lambda.body {
            LambdaBody::Expr(body) => {
                let mut inner = pre.child();
                inner.indent();
                let value = self.expr(body, &mut inner);
                if inner.is_empty() && !body.contains_await() {
                    return if params.is_empty() {
                        format!("(lambda: {})", value)
                    } else {
                        format!("(lambda {}: {})", params, value)
                    };
                }
                let name = self.fresh("lambda");
                let keyword = if body.contains_await() { "async def" } else { "def" };
                pre.line(format!("{} {}({}):", keyword, name, params));
                pre.append(inner);
                pre.indented(|b| b.line(format!("return {}", value)));
                name
            }
            LambdaBody::Block(stmts) => {
                let name = self.fresh("lambda");
                let keyword = if body_awaits(stmts) { "async def" } else { "def" };
                pre.line(format!("{} {}({}):", keyword, name, params));
                pre.indent();
                self.block(stmts, BodyContext::Closure, pre);
                pre.dedent();
                name
            }
        }
    }

    fn match_expr(&mut self, m: &MatchExpr, pre: &mut SourceBuffer) -> String {
        let scrutinee = self.expr(&m.value, pre);
        let name = self.fresh("match");
        let plan = plan_match(m);
        let awaits = m
            .cases
            .iter()
            .any(|c| c.body.contains_await() || c.guard.as_ref().is_some_and(ExprIR::contains_await));

        let keyword = if awaits { "async def" } else { "def" };
        pre.line(format!("{} {}(__subject):", keyword, name));
        pre.indent();
        for arm in &plan.arms {
            let conditions: Vec<String> = arm.checks.iter().map(render_check).collect();
            if conditions.is_empty() {
                self.match_arm_body(arm, pre);
            } else {
                pre.line(format!("if {}:", conditions.join(" and ")));
                pre.indent();
                self.match_arm_body(arm, pre);
                pre.dedent();
            }
        }
        match &plan.default {
            Some(arm) => self.match_arm_body(arm, pre),
            None => pre.line("return None"),
        }
        pre.dedent();

        if awaits {
            format!("(await {}({}))", name, scrutinee)
        } else {
            format!("{}({})", name, scrutinee)
        }
    }

    fn match_arm_body(&mut self, arm: &MatchArm<'_>, out: &mut SourceBuffer) {
        for binding in &arm.bindings {
            out.line(format!("{} = {}", binding.name, access_path("__subject", &binding.path)));
        }
        match arm.guard {
            Some(guard) => {
                let guard = self.expr(guard, out);
                out.line(format!("if {}:", guard));
                out.indent();
                let value = self.top_expr(arm.body, out);
                out.line(format!("return {}", value));
                out.dedent();
            }
            None => {
                let value = self.top_expr(arm.body, out);
                out.line(format!("return {}", value));
            }
        }
    }
}

/// Case bodies of an if-chain switch drop their terminating `break`
pub(crate) fn without_trailing_break(body: &[StmtIR]) -> &[StmtIR] {
    match body.split_last() {
        Some((StmtIR::Break, rest)) => rest,
        _ => body,
    }
}

fn graphql_python_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int => "int".to_string(),
        TypeRef::Float => "float".to_string(),
        TypeRef::String => "str".to_string(),
        TypeRef::Bool => "bool".to_string(),
        TypeRef::Optional(inner) => format!("Optional[{}]", graphql_python_type(inner, service)),
        TypeRef::Array(inner) => format!("List[{}]", graphql_python_type(inner, service)),
        _ => "JSON".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(service: &ServiceIR) -> String {
        PythonBackend::default().generate(service).source.contents
    }

    fn user_service() -> ServiceIR {
        let mut service = ServiceIR::new("users");
        service.types.push(
            TypeSchema::new("User")
                .with_field(FieldSchema::new("id", TypeRef::Int))
                .with_field(FieldSchema::new("name", TypeRef::String))
                .with_field(FieldSchema::new("age", TypeRef::Int).optional()),
        );
        service.providers.push(ProviderRef::new("Database"));
        service.routes.push(RouteHandler {
            method: HttpMethod::Get,
            path: "/api/users/:id".to_string(),
            path_params: vec!["id".to_string()],
            query_params: vec![],
            input_type: None,
            return_type: Some(TypeRef::named("User")),
            auth: None,
            rate_limit: None,
            middleware: vec![],
            providers: vec![InjectionRef::new("db", "Database")],
            body: vec![
                StmtIR::assign(
                    "user",
                    ExprIR::call(
                        "Get",
                        vec![ExprIR::field(ExprIR::var("db"), "users"), ExprIR::var("id")],
                    ),
                ),
                StmtIR::Return(ExprIR::var("user")),
            ],
        });
        service
    }

    #[test]
    fn test_user_route() {
        let code = generate(&user_service());
        assert!(code.contains("class User(BaseModel):"));
        assert!(code.contains("    age: Optional[int] = None"));
        assert!(code.contains("@app.get(\"/api/users/{id}\")"));
        assert!(code.contains("async def get_api_users_id(id: str, db = Depends(get_db)):"));
        assert!(code.contains("\n    user = db.users.Get(id)\n"));
        assert!(code.contains("\n    return JSONResponse(content=jsonable_encoder(user))\n"));
        assert!(code.contains("def get_db() -> DatabaseProvider:"));
        assert!(code.contains("uvicorn.run(app, host=\"0.0.0.0\", port=8000)"));
    }

    #[test]
    fn test_optional_is_not_double_wrapped() {
        let mut service = ServiceIR::new("s");
        service.types.push(
            TypeSchema::new("Profile")
                .with_field(FieldSchema::new("nick", TypeRef::String.optional()).optional()),
        );
        let code = generate(&service);
        assert!(code.contains("nick: Optional[str] = None"));
        assert!(!code.contains("Optional[Optional"));
    }

    #[test]
    fn test_post_returns_created() {
        let mut service = ServiceIR::new("s");
        service.routes.push(RouteHandler {
            method: HttpMethod::Post,
            path: "/items".to_string(),
            path_params: vec![],
            query_params: vec![],
            input_type: Some(TypeRef::named("Item")),
            return_type: None,
            auth: None,
            rate_limit: None,
            middleware: vec![],
            providers: vec![],
            body: vec![StmtIR::Return(ExprIR::var("input"))],
        });
        let code = generate(&service);
        assert!(code.contains("@app.post(\"/items\", status_code=201)"));
        assert!(code.contains("async def post_items(input: Dict[str, Any]):"));
        assert!(code.contains("return JSONResponse(status_code=201, content=jsonable_encoder(input))"));
    }

    #[test]
    fn test_return_depends_on_context() {
        let mut service = user_service();
        service.functions.push(FunctionDef {
            name: "double".to_string(),
            type_params: vec![],
            params: vec![FieldSchema::new("n", TypeRef::Int)],
            return_type: Some(TypeRef::Int),
            body: vec![StmtIR::Return(ExprIR::binary(
                BinOp::Mul,
                ExprIR::var("n"),
                ExprIR::Int(2),
            ))],
        });
        let code = generate(&service);
        assert!(code.contains("def double(n: int) -> int:\n    return (n * 2)\n"));
    }

    #[test]
    fn test_match_is_hoisted() {
        let mut service = ServiceIR::new("s");
        service.functions.push(FunctionDef {
            name: "label".to_string(),
            type_params: vec![],
            params: vec![FieldSchema::new("code", TypeRef::Int)],
            return_type: Some(TypeRef::String),
            body: vec![StmtIR::Return(ExprIR::Match(MatchExpr {
                value: Box::new(ExprIR::var("code")),
                cases: vec![
                    MatchCase {
                        pattern: PatternIR::Wildcard,
                        guard: None,
                        body: ExprIR::string("other"),
                    },
                    MatchCase {
                        pattern: PatternIR::Literal(LiteralValue::Int(200)),
                        guard: None,
                        body: ExprIR::string("ok"),
                    },
                ],
            }))],
        });
        let code = generate(&service);
        let expected = [
            "def label(code: int) -> str:",
            "    def __match_0(__subject):",
            "        if __subject == 200:",
            "            return \"ok\"",
            "        return \"other\"",
            "    return __match_0(code)",
        ]
        .join("\n");
        assert!(code.contains(&expected), "{}", code);
    }

    #[test]
    fn test_background_jobs_use_accessors() {
        let mut service = ServiceIR::new("s");
        service.providers.push(ProviderRef::new("Database"));
        service.cron_jobs.push(CronBinding {
            name: "cleanup".to_string(),
            schedule: "0 * * * *".to_string(),
            timezone: None,
            retries: 0,
            providers: vec![InjectionRef::new("db", "Database")],
            body: vec![StmtIR::Return(ExprIR::Null)],
        });
        service.events.push(EventBinding {
            event_type: "user.created".to_string(),
            is_async: false,
            providers: vec![],
            body: vec![],
        });
        let code = generate(&service);
        assert!(code.contains("@scheduler.scheduled_job(CronTrigger.from_crontab(\"0 * * * *\"))"));
        assert!(code.contains("async def cleanup():\n    db = get_db()\n    return None\n"));
        assert!(code.contains("@on_event(\"user.created\")\nasync def handle_user_created(event):\n    pass\n"));
    }

    #[test]
    fn test_requirements_follow_features() {
        let program = PythonBackend::default().generate(&user_service());
        assert_eq!(
            program.manifest.contents,
            "fastapi>=0.100.0\nuvicorn>=0.23.0\npydantic>=2.0.0\nsqlalchemy>=2.0.0\ndatabases>=0.9.0\n"
        );
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
        assert_eq!(python_type(&TypeRef::named("Address"), &service), "Address");
        assert_eq!(python_type(&TypeRef::Provider("Database".to_string()), &service), "Database");
        assert_eq!(python_type(&TypeRef::Any, &service), "Any");
        let page = TypeRef::Generic {
            name: "Page".to_string(),
            args: vec![TypeRef::named("User")],
        };
        assert_eq!(python_type(&page, &service), "Page[User]");
    }

    #[test]
    fn test_type_params_become_type_vars() {
        let code = generate(&identity_service());
        assert_eq!(code.matches("T = TypeVar(\"T\")").count(), 1, "{}", code);
        assert!(code.contains("class Page(BaseModel, Generic[T]):\n    items: List[T]\n"), "{}", code);
        assert!(code.contains("def identity(x: T) -> T:\n    return x\n"), "{}", code);
    }
}
