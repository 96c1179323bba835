//! TypeScript Backend - Generates an Express application
//!
//! Output is `src/app.ts` with `package.json` and `tsconfig.json`. Providers
//! are reached through `getX()` accessors and every binding kind becomes a
//! top-level function wired up before the server starts.

use crate::lowering::*;
use crate::python_backend::without_trailing_break;
use crate::writer::SourceBuffer;
use crate::{CodeGen, GeneratedFile, GeneratedProgram, Target};
use glyph_ir::*;
use heck::{ToKebabCase, ToLowerCamelCase};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

const INDENT: &str = "  ";

/// TypeScript code generation backend
#[derive(Debug, Clone)]
pub struct TypeScriptBackend {
    host: String,
    port: u16,
}

impl TypeScriptBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn package_json(&self, service: &ServiceIR, features: &FeatureSet) -> String {
        let deps: Map<String, Value> = dependencies(features)
            .into_iter()
            .map(|(name, version)| (name.to_string(), json!(version)))
            .collect();
        let dev_deps: Map<String, Value> = dev_dependencies(features)
            .into_iter()
            .map(|(name, version)| (name.to_string(), json!(version)))
            .collect();

        let package = json!({
            "name": service.name.to_kebab_case(),
            "version": "1.0.0",
            "description": format!("Generated by glyph from service `{}`", service.name),
            "main": "dist/app.js",
            "scripts": {
                "dev": "ts-node src/app.ts",
                "build": "tsc",
                "start": "node dist/app.js",
            },
            "dependencies": deps,
            "devDependencies": dev_deps,
        });
        format!("{:#}\n", package)
    }
}

impl Default for TypeScriptBackend {
    fn default() -> Self {
        Self::new("0.0.0.0", Target::TypeScript.default_port())
    }
}

impl CodeGen for TypeScriptBackend {
    fn target(&self) -> Target {
        Target::TypeScript
    }

    fn generate(&self, service: &ServiceIR) -> GeneratedProgram {
        let features = FeatureSet::of(service);
        let source = Emitter::new(self, service, features).emit();

        let mut auxiliary = vec![GeneratedFile::new("tsconfig.json", tsconfig())];
        if features.grpc {
            auxiliary.push(GeneratedFile::new(proto_path(service), proto_file(service)));
        }

        GeneratedProgram {
            target: Target::TypeScript,
            source: GeneratedFile::new("src/app.ts", source),
            manifest: GeneratedFile::new("package.json", self.package_json(service, &features)),
            auxiliary,
        }
    }
}

/// Runtime dependencies for a feature set
pub fn dependencies(features: &FeatureSet) -> Vec<(&'static str, &'static str)> {
    let mut deps = vec![("express", "^4.18.0")];
    if features.database {
        deps.push(("pg", "^8.11.0"));
    }
    if features.redis {
        deps.push(("redis", "^4.6.0"));
    }
    if features.mongo {
        deps.push(("mongodb", "^6.3.0"));
    }
    if features.llm {
        deps.push(("@anthropic-ai/sdk", "^0.30.0"));
    }
    if features.cron {
        deps.push(("node-cron", "^3.0.0"));
    }
    if features.queues {
        deps.push(("bullmq", "^5.1.0"));
    }
    if features.graphql {
        deps.extend([("@apollo/server", "^4.10.0"), ("graphql", "^16.8.0")]);
    }
    if features.grpc {
        deps.extend([("@grpc/grpc-js", "^1.10.0"), ("@grpc/proto-loader", "^0.7.10")]);
    }
    if features.websocket {
        deps.push(("ws", "^8.16.0"));
    }
    deps
}

pub fn dev_dependencies(features: &FeatureSet) -> Vec<(&'static str, &'static str)> {
    let mut deps = vec![
        ("typescript", "^5.0.0"),
        ("ts-node", "^10.0.0"),
        ("@types/node", "^20.0.0"),
        ("@types/express", "^4.17.0"),
    ];
    if features.cron {
        deps.push(("@types/node-cron", "^3.0.0"));
    }
    if features.websocket {
        deps.push(("@types/ws", "^8.5.0"));
    }
    deps
}

fn tsconfig() -> String {
    let config = json!({
        "compilerOptions": {
            "target": "ES2020",
            "module": "commonjs",
            "lib": ["ES2020"],
            "outDir": "./dist",
            "rootDir": "./src",
            "strict": true,
            "esModuleInterop": true,
            "skipLibCheck": true,
            "forceConsistentCasingInFileNames": true,
            "resolveJsonModule": true,
            "declaration": true,
            "declarationMap": true,
            "sourceMap": true,
        },
        "include": ["src/**/*"],
        "exclude": ["node_modules", "dist"],
    });
    format!("{:#}\n", config)
}

/// TypeScript spelling of a type
pub fn typescript_type(ty: &TypeRef, service: &ServiceIR) -> String {
    match ty {
        TypeRef::Int | TypeRef::Float => "number".to_string(),
        TypeRef::String => "string".to_string(),
        TypeRef::Bool => "boolean".to_string(),
        TypeRef::Any => "any".to_string(),
        TypeRef::Array(inner) => array_of(typescript_type(inner, service), inner),
        TypeRef::Optional(inner) => format!("{} | null", typescript_type(inner, service)),
        TypeRef::Future(inner) => format!("Promise<{}>", typescript_type(inner, service)),
        TypeRef::Union(elements) if elements.is_empty() => "never".to_string(),
        TypeRef::Union(elements) => {
            let parts: Vec<_> = elements.iter().map(|e| typescript_type(e, service)).collect();
            parts.join(" | ")
        }
        TypeRef::Generic { name, args } => match (name.as_str(), args.as_slice()) {
            ("List" | "Array", [inner]) => array_of(typescript_type(inner, service), inner),
            ("Map" | "Dict" | "Record", [key, value]) => format!(
                "Record<{}, {}>",
                typescript_type(key, service),
                typescript_type(value, service)
            ),
            (_, []) => name.clone(),
            _ => {
                let args: Vec<_> = args.iter().map(|a| typescript_type(a, service)).collect();
                format!("{}<{}>", name, args.join(", "))
            }
        },
        TypeRef::Named(name) | TypeRef::Provider(name) => name.clone(),
        TypeRef::Function { params, ret } => {
            let params: Vec<_> = params
                .iter()
                .enumerate()
                .map(|(i, p)| format!("arg{}: {}", i, typescript_type(p, service)))
                .collect();
            format!("({}) => {}", params.join(", "), typescript_type(ret, service))
        }
    }
}

fn array_of(element: String, inner: &TypeRef) -> String {
    if matches!(inner, TypeRef::Union(_) | TypeRef::Optional(_) | TypeRef::Function { .. }) {
        format!("({})[]", element)
    } else {
        format!("{}[]", element)
    }
}

fn ts_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value < 0.0 { "-Infinity" } else { "Infinity" }.to_string()
    } else {
        render_float(value)
    }
}

fn ts_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Int(v) => v.to_string(),
        LiteralValue::Float(v) => ts_float(*v),
        LiteralValue::String(v) => quote(v, '\''),
        LiteralValue::Bool(v) => v.to_string(),
        LiteralValue::Null => "null".to_string(),
    }
}

fn binop(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "===",
        BinOp::Ne => "!==",
        other => other.symbol(),
    }
}

fn object_key(key: &str) -> String {
    if is_identifier(key) {
        key.to_string()
    } else {
        quote(key, '\'')
    }
}

fn access_path(root: &str, path: &[Access]) -> String {
    let mut out = root.to_string();
    for step in path {
        match step {
            Access::Key(key) => out.push_str(&format!("[{}]", quote(key, '\''))),
            Access::Index(i) => out.push_str(&format!("[{}]", i)),
            Access::RestFrom(i) => out.push_str(&format!(".slice({})", i)),
        }
    }
    out
}

fn render_check(check: &Check) -> String {
    match check {
        Check::IsObject(path) => {
            let target = access_path("__subject", path);
            format!(
                "(typeof {0} === 'object' && {0} !== null && !Array.isArray({0}))",
                target
            )
        }
        Check::HasKey(path, key) => format!("{} in {}", quote(key, '\''), access_path("__subject", path)),
        Check::ArrayLen { path, len, exact } => {
            let target = access_path("__subject", path);
            let op = if *exact { "===" } else { ">=" };
            format!("Array.isArray({0}) && {0}.length {1} {2}", target, op, len)
        }
        Check::Equals(path, value) => {
            format!("{} === {}", access_path("__subject", path), ts_literal(value))
        }
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

/// Conversion of a raw string (query or CLI argument) to a value of `ty`
fn convert_raw(raw: &str, ty: &TypeRef) -> String {
    match ty.without_optional() {
        TypeRef::Int | TypeRef::Float => format!("Number({})", raw),
        TypeRef::Bool => format!("{} === 'true'", raw),
        TypeRef::String => format!("String({})", raw),
        _ => format!("JSON.parse(String({}))", raw),
    }
}

fn camel(name: &str) -> String {
    let camel = name.to_lower_camel_case();
    if camel.is_empty() {
        "handler".to_string()
    } else {
        camel
    }
}

/// Per-generation state; hoisted helpers are numbered in emission order
struct Emitter<'a> {
    backend: &'a TypeScriptBackend,
    service: &'a ServiceIR,
    features: FeatureSet,
    hoisted: usize,
    /// Variables assigned more than once in the function being rendered
    mutable: HashSet<String>,
    route_status: Option<u16>,
    rpc_stream: Option<StreamKind>,
}

impl<'a> Emitter<'a> {
    fn new(backend: &'a TypeScriptBackend, service: &'a ServiceIR, features: FeatureSet) -> Self {
        Self {
            backend,
            service,
            features,
            hoisted: 0,
            mutable: HashSet::new(),
            route_status: None,
            rpc_stream: None,
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
        out.line(format!("// Generated by glyph from service `{}`", self.service.name));
        out.line("// Do not edit manually");
        out.blank();
        out.line("import express, { Request, Response } from 'express';");
        if f.websocket {
            out.line("import { createServer } from 'http';");
            out.line("import { randomUUID } from 'crypto';");
            out.line("import { WebSocket, WebSocketServer } from 'ws';");
        }
        if f.redis {
            out.line("import { createClient } from 'redis';");
        }
        if f.mongo {
            out.line("import { Db, MongoClient } from 'mongodb';");
        }
        if f.llm {
            out.line("import Anthropic from '@anthropic-ai/sdk';");
        }
        if f.cron {
            out.line("import cron from 'node-cron';");
        }
        if f.events {
            out.line("import { EventEmitter } from 'events';");
        }
        if f.queues {
            out.line("import { Job, Queue, Worker } from 'bullmq';");
        }
        if f.graphql {
            out.line("import { ApolloServer } from '@apollo/server';");
            out.line("import { expressMiddleware } from '@apollo/server/express4';");
        }
        if f.grpc {
            out.line("import path from 'path';");
            out.line("import * as grpc from '@grpc/grpc-js';");
            out.line("import * as protoLoader from '@grpc/proto-loader';");
        }
    }

    fn emit_types(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
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
                    "const {}: {} = {};",
                    constant.name,
                    typescript_type(ty, service),
                    value
                )),
                None => out.line(format!("const {} = {};", constant.name, value)),
            }
        }

        for function in &service.functions {
            out.blank();
            let params = self.params(&function.params, out);
            let ret = function
                .return_type
                .as_ref()
                .map(|t| typescript_type(t, service))
                .unwrap_or_else(|| "any".to_string());
            let generics = angle_params(&function.type_params);
            if body_awaits(&function.body) {
                out.line(format!(
                    "async function {}{}({}): Promise<{}> {{",
                    function.name, generics, params, ret
                ));
            } else {
                out.line(format!("function {}{}({}): {} {{", function.name, generics, params, ret));
            }
            out.indent();
            self.body(&function.body, BodyContext::Function, out);
            out.dedent();
            out.line("}");
        }

        for command in &service.commands {
            out.blank();
            if !command.description.is_empty() {
                out.line(format!("/** {} */", command.description.replace("*/", "* /")));
            }
            out.line(format!(
                "async function {}(args: Record<string, any>): Promise<any> {{",
                camel(&command_fn_name(&command.name))
            ));
            out.indent();
            for param in &command.params {
                out.line(format!("const {0} = args.{0};", param.name));
            }
            self.body(&command.body, BodyContext::Command, out);
            out.dedent();
            out.line("}");
        }
    }

    fn emit_record(&mut self, schema: &TypeSchema, out: &mut SourceBuffer) {
        let service = self.service;
        let class = !schema.methods.is_empty();
        let generics = angle_params(&schema.type_params);
        if class {
            out.line(format!("class {}{} {{", schema.name, generics));
        } else {
            out.line(format!("interface {}{} {{", schema.name, generics));
        }
        out.indent();
        for field in &schema.fields {
            let (ty, optional) = optional_field(field);
            let ty = typescript_type(ty, service);
            match (optional, class) {
                (true, _) => out.line(format!("{}?: {};", field.name, ty)),
                (false, true) => out.line(format!("{}!: {};", field.name, ty)),
                (false, false) => out.line(format!("{}: {};", field.name, ty)),
            }
        }
        for method in &schema.methods {
            out.blank();
            let params = self.params(&method.params, out);
            let ret = typescript_type(&method.return_type, service);
            if body_awaits(&method.body) {
                out.line(format!("async {}({}): Promise<{}> {{", method.name, params, ret));
            } else {
                out.line(format!("{}({}): {} {{", method.name, params, ret));
            }
            out.indent();
            self.body(&method.body, BodyContext::Function, out);
            out.dedent();
            out.line("}");
        }
        out.dedent();
        out.line("}");
    }

    fn emit_providers(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        for provider in &service.providers {
            out.blank();
            match provider.standard() {
                Some(StandardProvider::Database) => {
                    out.line("// Database provider stub - replace with a real implementation");
                    out.line("class TableProxy {");
                    out.indented(|b| {
                        b.line("constructor(private name: string) {}");
                        for (method, params, ret) in [
                            ("Get", "id: any", "any"),
                            ("Find", "filter?: any", "any[]"),
                            ("Create", "data: any", "any"),
                            ("Update", "id: any, data: any", "any"),
                            ("Delete", "id: any", "void"),
                            ("Where", "filter: any", "any[]"),
                        ] {
                            b.line(format!(
                                "async {}({}): Promise<{}> {{ throw new Error(`${{this.name}}.{}: Not implemented`); }}",
                                method, params, ret, method
                            ));
                        }
                    });
                    out.line("}");
                    out.blank();
                    out.line("class DatabaseProvider {");
                    out.indented(|b| {
                        b.line("private tables: Record<string, TableProxy> = {};");
                        b.line("[key: string]: any;");
                        b.blank();
                        b.line("constructor() {");
                        b.indented(|b| {
                            b.line("return new Proxy(this, {");
                            b.indented(|b| {
                                b.line("get: (target, prop: string) => {");
                                b.indented(|b| {
                                    b.line("if (prop in target) return (target as any)[prop];");
                                    b.line("if (!target.tables[prop]) target.tables[prop] = new TableProxy(prop);");
                                    b.line("return target.tables[prop];");
                                });
                                b.line("},");
                            });
                            b.line("});");
                        });
                        b.line("}");
                    });
                    out.line("}");
                    out.blank();
                    out.line("const dbProvider = new DatabaseProvider();");
                    out.line("function getDb(): DatabaseProvider {");
                    out.indented(|b| b.line("return dbProvider;"));
                    out.line("}");
                }
                Some(StandardProvider::Redis) => {
                    out.line("const redisClient = createClient({ url: process.env.REDIS_URL ?? 'redis://localhost:6379' });");
                    out.line("function getRedis() {");
                    out.indented(|b| b.line("return redisClient;"));
                    out.line("}");
                }
                Some(StandardProvider::MongoDB) => {
                    out.line("const mongoClient = new MongoClient(process.env.MONGODB_URL ?? 'mongodb://localhost:27017');");
                    out.line("function getMongo(): Db {");
                    out.indented(|b| {
                        b.line(format!(
                            "return mongoClient.db(process.env.MONGODB_DATABASE ?? {});",
                            quote(&service.name, '\'')
                        ))
                    });
                    out.line("}");
                }
                Some(StandardProvider::Llm) => {
                    out.line("const llmClient = new Anthropic();");
                    out.line("function getLlm(): Anthropic {");
                    out.indented(|b| b.line("return llmClient;"));
                    out.line("}");
                }
                None => self.emit_custom_provider(provider, out),
            }
        }
    }

    fn emit_custom_provider(&mut self, provider: &ProviderRef, out: &mut SourceBuffer) {
        let service = self.service;
        let class = format!("{}Provider", provider.provider_type);
        out.line(format!("// Custom provider stub: {}", provider.provider_type));
        out.line(format!("class {} {{", class));
        out.indented(|b| {
            for method in &provider.methods {
                let params: Vec<String> = method
                    .params
                    .iter()
                    .map(|p| format!("{}: {}", p.name, typescript_type(&p.effective_type(), service)))
                    .collect();
                b.line(format!(
                    "{}({}): {} {{",
                    method.name,
                    params.join(", "),
                    typescript_type(&method.return_type, service)
                ));
                b.indented(|b| b.line("throw new Error('Not implemented');"));
                b.line("}");
            }
        });
        out.line("}");
        out.blank();
        let instance = format!("{}Provider", provider.name.to_lower_camel_case());
        out.line(format!("const {} = new {}();", instance, class));
        out.line(format!(
            "function {}(): {} {{",
            accessor_name(&provider.provider_type, true),
            class
        ));
        out.indented(|b| b.line(format!("return {};", instance)));
        out.line("}");
    }

    fn emit_bootstrap(&mut self, out: &mut SourceBuffer) {
        out.line("const app = express();");
        out.line("app.use(express.json());");
        if self.features.websocket {
            out.line("const server = createServer(app);");
        }
    }

    fn emit_routes(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        for route in &service.routes {
            out.blank();
            self.emit_route(route, out);
        }
    }

    fn emit_route(&mut self, route: &RouteHandler, out: &mut SourceBuffer) {
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
        out.line(format!(
            "app.{}({}, async (req: Request, res: Response) => {{",
            http_verb(route.method),
            quote(&route.path, '\'')
        ));
        out.indent();
        for param in &route.path_params {
            out.line(format!("const {0} = req.params.{0};", param));
        }
        for query in &route.query_params {
            let raw = format!("req.query.{}", query.name);
            let converted = if query.is_array {
                format!("([] as any[]).concat({} ?? [])", raw)
            } else {
                convert_raw(&raw, &query.ty)
            };
            match &query.default {
                Some(default) => {
                    let mut pre = out.child();
                    let default = self.expr(default, &mut pre);
                    out.append(pre);
                    out.line(format!(
                        "const {} = {} !== undefined ? {} : {};",
                        query.name, raw, converted, default
                    ));
                }
                None if query.required => {
                    out.line(format!("if ({} === undefined) {{", raw));
                    out.indented(|b| {
                        b.line(format!(
                            "return res.status(400).json({{ error: {} }});",
                            quote(&format!("Missing query parameter {}", query.name), '\'')
                        ))
                    });
                    out.line("}");
                    out.line(format!("const {} = {};", query.name, converted));
                }
                None => out.line(format!(
                    "const {} = {} !== undefined ? {} : undefined;",
                    query.name, raw, converted
                )),
            }
        }
        if let Some(input) = &route.input_type {
            let ty = match input {
                TypeRef::Named(n) if service.type_schema(n).is_some() => n.clone(),
                _ => "any".to_string(),
            };
            out.line(format!("const input: {} = req.body;", ty));
        }
        self.inject(&route.providers, out);

        self.route_status = Some(if route.method == HttpMethod::Post { 201 } else { 200 });
        self.body(&route.body, BodyContext::Route, out);
        self.route_status = None;
        if falls_through(&route.body) {
            out.line("if (!res.headersSent) res.status(204).end();");
        }
        out.dedent();
        out.line("});");
    }

    fn emit_graphql(&mut self, out: &mut SourceBuffer) {
        if !self.features.graphql {
            return;
        }
        let service = self.service;
        out.line("const typeDefs = `#graphql");
        for line in graphql_sdl(service).lines() {
            // template literal lines keep their own indentation
            out.line(line.replace('`', "\\`"));
        }
        out.line("`;");
        out.blank();
        out.line("const resolvers = {");
        out.indent();
        for op in GraphQlOp::ALL {
            let resolvers: Vec<&GraphQlDef> = service.graphql_ops(op).collect();
            if resolvers.is_empty() && op != GraphQlOp::Query {
                continue;
            }
            out.line(format!("{}: {{", op.root_type()));
            out.indent();
            if resolvers.is_empty() {
                out.line(format!(
                    "{}: () => {},",
                    GRAPHQL_PLACEHOLDER_FIELD,
                    quote(&service.name, '\'')
                ));
            }
            for resolver in resolvers {
                self.emit_resolver(resolver, out);
            }
            out.dedent();
            out.line("},");
        }
        out.dedent();
        out.line("};");
        out.blank();
        out.line("const apolloServer = new ApolloServer({ typeDefs, resolvers });");
    }

    fn emit_resolver(&mut self, resolver: &GraphQlDef, out: &mut SourceBuffer) {
        let subscription = resolver.operation == GraphQlOp::Subscription;
        if subscription {
            out.line(format!("{}: {{", resolver.field_name));
            out.indent();
            out.line("subscribe: async function* (_parent: any, args: any) {");
        } else {
            out.line(format!("{}: async (_parent: any, args: any) => {{", resolver.field_name));
        }
        out.indent();
        if let Some(auth) = &resolver.auth {
            out.line(auth_comment(auth));
        }
        for param in &resolver.params {
            out.line(format!("const {0} = args.{0};", param.name));
        }
        self.inject(&resolver.providers, out);
        if subscription {
            out.line("const resolve = async (): Promise<any> => {");
            out.indent();
            self.body(&resolver.body, BodyContext::Resolver, out);
            out.dedent();
            out.line("};");
            out.line(format!("yield {{ {}: await resolve() }};", resolver.field_name));
            out.dedent();
            out.line("},");
            out.dedent();
            out.line("},");
        } else {
            self.body(&resolver.body, BodyContext::Resolver, out);
            out.dedent();
            out.line("},");
        }
    }

    fn emit_grpc(&mut self, out: &mut SourceBuffer) {
        if !self.features.grpc {
            return;
        }
        let service = self.service;
        let proto = proto_path(service);
        let segments: Vec<String> = proto.split('/').map(|s| quote(s, '\'')).collect();
        out.line(format!(
            "const PROTO_PATH = path.join(__dirname, '..', {});",
            segments.join(", ")
        ));
        out.line("const packageDefinition = protoLoader.loadSync(PROTO_PATH, {");
        out.indented(|b| {
            b.line("keepCase: true,");
            b.line("longs: String,");
            b.line("enums: String,");
            b.line("defaults: true,");
            b.line("oneofs: true,");
        });
        out.line("});");
        out.line("const grpcPackage = grpc.loadPackageDefinition(packageDefinition) as any;");

        for def in &service.grpc {
            out.blank();
            out.line("/*");
            for line in proto_service_definition(def, service) {
                out.line(line);
            }
            out.line("*/");
            out.line(format!("const {}Handlers = {{", def.name.to_lower_camel_case()));
            out.indent();
            for plan in grpc_method_plans(def) {
                self.emit_grpc_method(&plan, out);
            }
            out.dedent();
            out.line("};");
        }

        out.blank();
        out.line("function startGrpcServer(): void {");
        out.indent();
        out.line("const grpcServer = new grpc.Server();");
        for def in &service.grpc {
            out.line(format!(
                "grpcServer.addService(grpcPackage.{}.service, {}Handlers);",
                def.name,
                def.name.to_lower_camel_case()
            ));
        }
        let address = format!("0.0.0.0:{}", GRPC_PORT);
        out.line(format!(
            "grpcServer.bindAsync({}, grpc.ServerCredentials.createInsecure(), (err: Error | null) => {{",
            quote(&address, '\'')
        ));
        out.indented(|b| {
            b.line("if (err) {");
            b.indented(|b| {
                b.line("console.error(err);");
                b.line("return;");
            });
            b.line("}");
            b.line(format!("console.log({});", quote(&format!("gRPC server listening on {}", address), '\'')));
        });
        out.line("});");
        out.dedent();
        out.line("}");
    }

    fn emit_grpc_method(&mut self, plan: &GrpcMethodPlan<'_>, out: &mut SourceBuffer) {
        let key = plan.name.to_lower_camel_case();
        let streaming_out = matches!(plan.stream, StreamKind::ServerStream | StreamKind::Bidirectional);
        let signature = if streaming_out { "(call: any)" } else { "(call: any, callback: any)" };

        let Some(handler) = plan.handler else {
            out.line(format!("{}: {} => {{", key, signature));
            out.indented(|b| {
                if streaming_out {
                    b.line("call.emit('error', { code: grpc.status.UNIMPLEMENTED, message: 'Not implemented' });");
                } else {
                    b.line("callback({ code: grpc.status.UNIMPLEMENTED, message: 'Not implemented' });");
                }
            });
            out.line("},");
            return;
        };

        out.line(format!("{}: async {} => {{", key, signature));
        out.indent();
        if let Some(auth) = &handler.auth {
            out.line(auth_comment(auth));
        }
        if matches!(plan.stream, StreamKind::Unary | StreamKind::ServerStream) {
            for param in &handler.params {
                out.line(format!("const {0} = call.request.{0};", param.name));
            }
        }
        self.inject(&handler.providers, out);
        self.rpc_stream = Some(plan.stream);
        self.body(&handler.body, BodyContext::Rpc, out);
        self.rpc_stream = None;
        if falls_through(&handler.body) {
            if streaming_out {
                out.line("call.end();");
            } else {
                out.line("callback(null, {});");
            }
        }
        out.dedent();
        out.line("},");
    }

    fn emit_websockets(&mut self, out: &mut SourceBuffer) {
        if !self.features.websocket {
            return;
        }
        let service = self.service;
        out.line("const wsConnections = new Map<string, Map<string, WebSocket>>();");
        out.blank();
        out.line("function broadcast(path: string, message: any): void {");
        out.indented(|b| {
            b.line("for (const connection of wsConnections.get(path)?.values() ?? []) {");
            b.indented(|b| b.line("connection.send(JSON.stringify(message));"));
            b.line("}");
        });
        out.line("}");
        out.blank();
        out.line("function matchPath(pattern: string, pathname: string): Record<string, string> | null {");
        out.indented(|b| {
            b.line("const expected = pattern.split('/');");
            b.line("const actual = pathname.split('/');");
            b.line("if (expected.length !== actual.length) return null;");
            b.line("const params: Record<string, string> = {};");
            b.line("for (let i = 0; i < expected.length; i++) {");
            b.indented(|b| {
                b.line("if (expected[i].startsWith(':')) params[expected[i].slice(1)] = decodeURIComponent(actual[i]);");
                b.line("else if (expected[i] !== actual[i]) return null;");
            });
            b.line("}");
            b.line("return params;");
        });
        out.line("}");

        let names = websocket_fn_names(&service.websockets);
        let mut servers = Vec::new();
        for (ws, name) in service.websockets.iter().zip(names) {
            let server_name = camel(&name);
            out.blank();
            self.emit_websocket(ws, &server_name, out);
            servers.push((ws.path.as_str(), server_name));
        }

        out.blank();
        out.line("server.on('upgrade', (request, netSocket, head) => {");
        out.indent();
        out.line("const pathname = new URL(request.url ?? '/', 'http://localhost').pathname;");
        for (path, server_name) in &servers {
            out.line(format!("const {}Params = matchPath({}, pathname);", server_name, quote(path, '\'')));
            out.line(format!("if ({}Params) {{", server_name));
            out.indented(|b| {
                b.line(format!(
                    "{0}.handleUpgrade(request, netSocket, head, (socket) => {0}.emit('connection', socket, {0}Params));",
                    server_name
                ));
                b.line("return;");
            });
            out.line("}");
        }
        out.line("netSocket.destroy();");
        out.dedent();
        out.line("});");
    }

    fn emit_websocket(&mut self, ws: &WebSocketDef, server_name: &str, out: &mut SourceBuffer) {
        let key = quote(&ws.path, '\'');
        out.line(format!("const {} = new WebSocketServer({{ noServer: true }});", server_name));
        out.line(format!(
            "{}.on('connection', async (socket: WebSocket, params: Record<string, string>) => {{",
            server_name
        ));
        out.indent();
        out.line("const clientId = randomUUID();");
        for param in path_params(&ws.path) {
            out.line(format!("const {0} = params.{0};", param));
        }

        for (event, signature) in [
            (WsEvent::Connect, "onConnect = async (): Promise<any>"),
            (WsEvent::Message, "onMessage = async (message: any): Promise<any>"),
            (WsEvent::Disconnect, "onDisconnect = async (): Promise<any>"),
            (WsEvent::Error, "onError = async (error: Error): Promise<any>"),
        ] {
            if let Some(def) = ws.event(event) {
                out.line(format!("const {} => {{", signature));
                out.indent();
                self.body(&def.body, BodyContext::WebSocket, out);
                out.dedent();
                out.line("};");
            }
        }
        out.line("const reply = (value: any) => {");
        out.indented(|b| {
            b.line("if (value !== undefined && value !== null) socket.send(JSON.stringify(value));");
        });
        out.line("};");
        out.blank();
        out.line(format!("if (!wsConnections.has({0})) wsConnections.set({0}, new Map());", key));
        out.line(format!("wsConnections.get({})?.set(clientId, socket);", key));
        if ws.event(WsEvent::Connect).is_some() {
            out.line("reply(await onConnect());");
        }
        out.line("socket.on('message', async (raw) => {");
        out.indented(|b| {
            b.line("let message: any;");
            b.line("try {");
            b.indented(|b| b.line("message = JSON.parse(raw.toString());"));
            b.line("} catch {");
            b.indented(|b| b.line("message = raw.toString();"));
            b.line("}");
            if ws.event(WsEvent::Message).is_some() {
                b.line("reply(await onMessage(message));");
            }
        });
        out.line("});");
        out.line("socket.on('close', async () => {");
        out.indented(|b| {
            b.line(format!("wsConnections.get({})?.delete(clientId);", key));
            if ws.event(WsEvent::Disconnect).is_some() {
                b.line("await onDisconnect();");
            }
        });
        out.line("});");
        out.line("socket.on('error', async (error: Error) => {");
        out.indented(|b| {
            if ws.event(WsEvent::Error).is_some() {
                b.line("await onError(error);");
            } else {
                b.line("console.error(error);");
            }
        });
        out.line("});");
        out.dedent();
        out.line("});");
    }

    fn emit_cron(&mut self, out: &mut SourceBuffer) {
        if !self.features.cron {
            return;
        }
        let service = self.service;
        let names = cron_fn_names(&service.cron_jobs);
        for (job, name) in service.cron_jobs.iter().zip(names) {
            let name = camel(&name);
            out.blank();
            out.line(format!("async function {}(): Promise<any> {{", name));
            out.indent();
            if job.retries > 0 {
                out.line(format!("// Retries: {}", job.retries));
            }
            self.inject(&job.providers, out);
            self.body(&job.body, BodyContext::Background, out);
            out.dedent();
            out.line("}");
            let options = job
                .timezone
                .as_ref()
                .map(|tz| format!(", {{ timezone: {} }}", quote(tz, '\'')))
                .unwrap_or_default();
            out.line(format!(
                "cron.schedule({}, () => {{ void {}(); }}{});",
                quote(&job.schedule, '\''),
                name,
                options
            ));
        }
    }

    fn emit_events(&mut self, out: &mut SourceBuffer) {
        if !self.features.events {
            return;
        }
        let service = self.service;
        out.line("const eventBus = new EventEmitter();");
        out.blank();
        out.line("function emit(eventType: string, event: any): void {");
        out.indented(|b| b.line("eventBus.emit(eventType, event);"));
        out.line("}");

        let names = event_handler_names(&service.events);
        for (event, name) in service.events.iter().zip(names) {
            let name = camel(&name);
            out.blank();
            out.line(format!("async function {}(event: any): Promise<any> {{", name));
            out.indent();
            self.inject(&event.providers, out);
            self.body(&event.body, BodyContext::Background, out);
            out.dedent();
            out.line("}");
            out.line(format!(
                "eventBus.on({}, (event: any) => {{ void {}(event); }});",
                quote(&event.event_type, '\''),
                name
            ));
        }
    }

    fn emit_queues(&mut self, out: &mut SourceBuffer) {
        if !self.features.queues {
            return;
        }
        let service = self.service;
        out.line("const queueConnection = {");
        out.indented(|b| {
            b.line("host: process.env.REDIS_HOST ?? 'localhost',");
            b.line("port: Number(process.env.REDIS_PORT ?? 6379),");
        });
        out.line("};");
        out.line("const queueAttempts: Record<string, number> = {");
        out.indented(|b| {
            for queue in &service.queues {
                b.line(format!("{}: {},", quote(&queue.queue_name, '\''), queue.max_retries + 1));
            }
        });
        out.line("};");
        out.line("const queues: Record<string, Queue> = {};");
        out.blank();
        out.line("async function enqueue(queueName: string, message: any): Promise<void> {");
        out.indented(|b| {
            b.line("queues[queueName] ??= new Queue(queueName, { connection: queueConnection });");
            b.line("await queues[queueName].add(queueName, message, { attempts: queueAttempts[queueName] ?? 1 });");
        });
        out.line("}");

        let names: Vec<String> = queue_worker_names(&service.queues).iter().map(|n| camel(n)).collect();
        for (queue, name) in service.queues.iter().zip(&names) {
            out.blank();
            out.line(format!("async function {}(message: any): Promise<any> {{", name));
            out.indent();
            if queue.timeout_secs > 0 {
                out.line(format!("// Timeout: {}s", queue.timeout_secs));
            }
            self.inject(&queue.providers, out);
            self.body(&queue.body, BodyContext::Background, out);
            out.dedent();
            out.line("}");
        }

        out.blank();
        out.line("function startWorkers(): void {");
        out.indented(|b| {
            for (queue, name) in service.queues.iter().zip(&names) {
                b.line(format!(
                    "new Worker({}, async (job: Job) => {}(job.data), {{ connection: queueConnection, concurrency: {} }});",
                    quote(&queue.queue_name, '\''),
                    name,
                    queue.concurrency.max(1)
                ));
            }
        });
        out.line("}");
    }

    fn emit_entrypoint(&mut self, out: &mut SourceBuffer) {
        let service = self.service;
        let f = self.features;

        if f.commands {
            out.line("function hasFlag(name: string): boolean {");
            out.indented(|b| b.line("return process.argv.includes(`--${name}`);"));
            out.line("}");
            out.blank();
            out.line("function argValue(name: string): string | undefined {");
            out.indented(|b| {
                b.line("const index = process.argv.indexOf(`--${name}`);");
                b.line("return index >= 0 ? process.argv[index + 1] : undefined;");
            });
            out.line("}");
            out.blank();
        }

        out.line("async function main(): Promise<void> {");
        out.indent();
        if f.commands {
            out.line("switch (process.argv[2]) {");
            out.indent();
            for command in &service.commands {
                out.line(format!("case {}: {{", quote(&command.name, '\'')));
                out.indent();
                let mut fields = Vec::new();
                for param in &command.params {
                    let flag = quote(&param.name.to_kebab_case(), '\'');
                    let raw = format!("argValue({})", flag);
                    let value = if param.is_flag {
                        format!("hasFlag({})", flag)
                    } else {
                        match &param.default {
                            Some(default) => {
                                let mut pre = out.child();
                                let default = self.expr(default, &mut pre);
                                out.append(pre);
                                format!(
                                    "{} !== undefined ? {} : {}",
                                    raw,
                                    convert_raw(&raw, &param.ty),
                                    default
                                )
                            }
                            None if param.required => {
                                out.line(format!("if ({} === undefined) {{", raw));
                                out.indented(|b| {
                                    b.line(format!(
                                        "console.error({});",
                                        quote(
                                            &format!("Missing required argument --{}", param.name.to_kebab_case()),
                                            '\''
                                        )
                                    ));
                                    b.line("process.exit(1);");
                                });
                                out.line("}");
                                convert_raw(&raw, &param.ty)
                            }
                            None => format!(
                                "{} !== undefined ? {} : undefined",
                                raw,
                                convert_raw(&raw, &param.ty)
                            ),
                        }
                    };
                    fields.push(format!("{}: {}", object_key(&param.name), value));
                }
                let args = if fields.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", fields.join(", "))
                };
                out.line(format!(
                    "const result = await {}({});",
                    camel(&command_fn_name(&command.name)),
                    args
                ));
                out.line("if (result !== undefined) console.log(JSON.stringify(result, null, 2));");
                out.line("return;");
                out.dedent();
                out.line("}");
            }
            out.dedent();
            out.line("}");
            out.blank();
        }
        if f.graphql {
            out.line("await apolloServer.start();");
            out.line("app.use('/graphql', expressMiddleware(apolloServer));");
        }
        if f.grpc {
            out.line("startGrpcServer();");
        }
        if f.queues {
            out.line("startWorkers();");
        }
        let listener = if f.websocket { "server" } else { "app" };
        let host = &self.backend.host;
        let port = self.backend.port;
        out.line(format!("{}.listen({}, {}, () => {{", listener, port, quote(host, '\'')));
        out.indented(|b| {
            b.line(format!("console.log(`Server running on http://{}:{}`);", host, port))
        });
        out.line("});");
        out.dedent();
        out.line("}");
        out.blank();
        out.line("main().catch((err) => {");
        out.indented(|b| {
            b.line("console.error(err);");
            b.line("process.exit(1);");
        });
        out.line("});");
    }

    // ========================================
    // Bodies
    // ========================================

    fn params(&mut self, params: &[FieldSchema], out: &mut SourceBuffer) -> String {
        let service = self.service;
        let mut rendered = Vec::new();
        for p in params {
            let (ty, optional) = optional_field(p);
            let ty = typescript_type(ty, service);
            match &p.default {
                Some(default) => {
                    let mut pre = out.child();
                    let value = self.expr(default, &mut pre);
                    out.append(pre);
                    rendered.push(format!("{}: {} = {}", p.name, ty, value));
                }
                None if optional => rendered.push(format!("{}?: {}", p.name, ty)),
                None => rendered.push(format!("{}: {}", p.name, ty)),
            }
        }
        rendered.join(", ")
    }

    fn inject(&mut self, providers: &[InjectionRef], out: &mut SourceBuffer) {
        for injection in providers {
            out.line(format!(
                "const {} = {}();",
                injection.name,
                accessor_name(&injection.provider_type, true)
            ));
        }
    }

    /// A function body: its own set of reassigned variables
    fn body(&mut self, body: &[StmtIR], ctx: BodyContext, out: &mut SourceBuffer) {
        let saved = std::mem::replace(&mut self.mutable, reassigned_vars(body));
        self.block(body, ctx, out);
        self.mutable = saved;
    }

    fn block(&mut self, body: &[StmtIR], ctx: BodyContext, out: &mut SourceBuffer) {
        if body.is_empty() {
            out.line("// no-op");
            return;
        }
        for stmt in body {
            self.stmt(stmt, ctx, out);
        }
    }

    fn render_return(&self, value: &str, ctx: BodyContext, out: &mut SourceBuffer) {
        match ctx {
            BodyContext::Route => match self.route_status {
                Some(201) => out.line(format!("return res.status(201).json({});", value)),
                _ => out.line(format!("return res.json({});", value)),
            },
            BodyContext::Rpc => match self.rpc_stream {
                Some(StreamKind::ServerStream | StreamKind::Bidirectional) => {
                    out.line(format!("call.write({});", value));
                    out.line("return call.end();");
                }
                _ => out.line(format!("return callback(null, {});", value)),
            },
            _ => out.line(format!("return {};", value)),
        }
    }

    fn stmt(&mut self, stmt: &StmtIR, ctx: BodyContext, out: &mut SourceBuffer) {
        let mut pre = out.child();
        match stmt {
            StmtIR::Assign { target, value } => {
                let value = self.top_expr(value, &mut pre);
                out.append(pre);
                let keyword = if self.mutable.contains(target) { "let" } else { "const" };
                out.line(format!("{} {} = {};", keyword, target, value));
            }
            StmtIR::Reassign { target, value } => {
                let value = self.top_expr(value, &mut pre);
                out.append(pre);
                out.line(format!("{} = {};", target, value));
            }
            StmtIR::Return(value) => {
                let value = self.top_expr(value, &mut pre);
                out.append(pre);
                self.render_return(&value, ctx, out);
            }
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => {
                let condition = self.top_expr(condition, &mut pre);
                out.append(pre);
                out.line(format!("if ({}) {{", condition));
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
                let iterable = self.expr(iterable, &mut pre);
                out.append(pre);
                let keyword = if self.mutable.contains(value) { "let" } else { "const" };
                match key {
                    Some(key) => out.line(format!(
                        "for ({} [{}, {}] of ({}).entries()) {{",
                        keyword, key, value, iterable
                    )),
                    None => out.line(format!("for ({} {} of {}) {{", keyword, value, iterable)),
                }
                out.indent();
                self.block(body, ctx, out);
                out.dedent();
                out.line("}");
            }
            StmtIR::While { condition, body } => {
                let condition = self.top_expr(condition, &mut pre);
                out.append(pre);
                out.line(format!("while ({}) {{", condition));
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
                let value = self.top_expr(value, &mut pre);
                let labels: Vec<String> = cases.iter().map(|c| self.expr(&c.value, &mut pre)).collect();
                out.append(pre);
                out.line(format!("switch ({}) {{", value));
                out.indent();
                for (case, label) in cases.iter().zip(labels) {
                    out.line(format!("case {}: {{", label));
                    out.indent();
                    let body = without_trailing_break(&case.body);
                    self.block(body, ctx, out);
                    if !body.last().is_some_and(StmtIR::is_terminal) {
                        out.line("break;");
                    }
                    out.dedent();
                    out.line("}");
                }
                if !default.is_empty() {
                    out.line("default: {");
                    out.indent();
                    self.block(default, ctx, out);
                    out.dedent();
                    out.line("}");
                }
                out.dedent();
                out.line("}");
            }
            StmtIR::Expr(ExprIR::Null) => out.line("// no-op"),
            StmtIR::Expr(expr) => {
                let expr = self.top_expr(expr, &mut pre);
                out.append(pre);
                out.line(format!("{};", expr));
            }
            StmtIR::Validate(check) => {
                let check = self.expr(check, &mut pre);
                out.append(pre);
                out.line(format!("if (!({})) {{", check));
                if ctx.returns_wire_response() {
                    out.indented(|b| b.line("return res.status(400).json({ error: 'Validation failed' });"));
                } else {
                    out.indented(|b| b.line("throw new Error('Validation failed');"));
                }
                out.line("}");
            }
            StmtIR::Break => out.line("break;"),
            StmtIR::Continue => out.line("continue;"),
        }
    }

    fn top_expr(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Await(inner) => format!("await {}", self.expr(inner, pre)),
            other => self.expr(other, pre),
        }
    }

    fn expr(&mut self, expr: &ExprIR, pre: &mut SourceBuffer) -> String {
        match expr {
            ExprIR::Int(v) => v.to_string(),
            ExprIR::Float(v) => ts_float(*v),
            ExprIR::String(v) => quote(v, '\''),
            ExprIR::Bool(v) => v.to_string(),
            ExprIR::Null => "null".to_string(),
            ExprIR::Var(name) => name.clone(),
            ExprIR::Binary { op, left, right } => {
                let left = self.expr(left, pre);
                let right = self.expr(right, pre);
                format!("({} {} {})", left, binop(*op), right)
            }
            ExprIR::Unary { op, operand } => {
                let operand = self.expr(operand, pre);
                if operand.starts_with('-') {
                    format!("{}({})", op.symbol(), operand)
                } else {
                    format!("{}{}", op.symbol(), operand)
                }
            }
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
            ExprIR::Object(fields) if fields.is_empty() => "{}".to_string(),
            ExprIR::Object(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{}: {}", object_key(&f.key), self.expr(&f.value, pre)))
                    .collect();
                format!("{{ {} }}", fields.join(", "))
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
                pre.line(format!("const {} = async (): Promise<any> => {{", name));
                pre.indent();
                self.body(body, BodyContext::Closure, pre);
                pre.dedent();
                pre.line("};");
                format!("{}()", name)
            }
            ExprIR::Await(inner) => format!("(await {})", self.expr(inner, pre)),
        }
    }

    fn args(&mut self, args: &[ExprIR], pre: &mut SourceBuffer) -> String {
        let args: Vec<String> = args.iter().map(|a| self.expr(a, pre)).collect();
        args.join(", ")
    }

    fn lambda(&mut self, lambda: &LambdaExpr, pre: &mut SourceBuffer) -> String {
        let service = self.service;
        let params: Vec<String> = lambda
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, typescript_type(&p.ty, service)))
            .collect();
        let params = params.join(", ");
        match &lambda.body {
            LambdaBody::Expr(body) => {
                let mut inner = pre.child();
                inner.indent();
                let value = self.expr(body, &mut inner);
                let prefix = if body.contains_await() { "async " } else { "" };
                if inner.is_empty() {
                    return format!("({}({}) => {})", prefix, params, value);
                }
                let name = self.fresh("lambda");
                pre.line(format!("const {} = {}({}) => {{", name, prefix, params));
                pre.append(inner);
                pre.indented(|b| b.line(format!("return {};", value)));
                pre.line("};");
                name
            }
            LambdaBody::Block(stmts) => {
                let name = self.fresh("lambda");
                let prefix = if body_awaits(stmts) { "async " } else { "" };
                pre.line(format!("const {} = {}({}) => {{", name, prefix, params));
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
        let awaits = m
            .cases
            .iter()
            .any(|c| c.body.contains_await() || c.guard.as_ref().is_some_and(ExprIR::contains_await));

        let prefix = if awaits { "async " } else { "" };
        pre.line(format!("const {} = {}(__subject: any): any => {{", name, prefix));
        pre.indent();
        for arm in &plan.arms {
            let conditions: Vec<String> = arm.checks.iter().map(render_check).collect();
            if conditions.is_empty() {
                pre.line("{");
            } else {
                pre.line(format!("if ({}) {{", conditions.join(" && ")));
            }
            pre.indent();
            self.match_arm_body(arm, pre);
            pre.dedent();
            pre.line("}");
        }
        match &plan.default {
            Some(arm) => self.match_arm_body(arm, pre),
            None => pre.line("return null;"),
        }
        pre.dedent();
        pre.line("};");

        if awaits {
            format!("(await {}({}))", name, scrutinee)
        } else {
            format!("{}({})", name, scrutinee)
        }
    }

    fn match_arm_body(&mut self, arm: &MatchArm<'_>, out: &mut SourceBuffer) {
        for binding in &arm.bindings {
            out.line(format!(
                "const {} = {};",
                binding.name,
                access_path("__subject", &binding.path)
            ));
        }
        match arm.guard {
            Some(guard) => {
                let guard = self.expr(guard, out);
                out.line(format!("if ({}) {{", guard));
                out.indent();
                let value = self.top_expr(arm.body, out);
                out.line(format!("return {};", value));
                out.dedent();
                out.line("}");
            }
            None => {
                let value = self.top_expr(arm.body, out);
                out.line(format!("return {};", value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(service: &ServiceIR) -> GeneratedProgram {
        TypeScriptBackend::default().generate(service)
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
                .with_field(FieldSchema::new("age", TypeRef::Int).optional()),
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
        assert!(code.contains("interface User {\n  id: number;\n  age?: number;\n}"));
        let expected = [
            "app.get('/api/users/:id', async (req: Request, res: Response) => {",
            "  const id = req.params.id;",
            "  const db = getDb();",
            "  const user = db.users.Get(id);",
            "  return res.json(user);",
            "});",
        ]
        .join("\n");
        assert!(code.contains(&expected), "{}", code);
        assert!(code.contains("function getDb(): DatabaseProvider {"));
        assert!(code.contains("app.listen(3000, '0.0.0.0', () => {"));
    }

    #[test]
    fn test_reassigned_variables_use_let() {
        let mut service = ServiceIR::new("s");
        service.routes.push(route(
            HttpMethod::Post,
            "/count",
            vec![
                StmtIR::assign("total", ExprIR::Int(0)),
                StmtIR::assign("limit", ExprIR::Int(10)),
                StmtIR::While {
                    condition: ExprIR::binary(BinOp::Lt, ExprIR::var("total"), ExprIR::var("limit")),
                    body: vec![StmtIR::Reassign {
                        target: "total".to_string(),
                        value: ExprIR::binary(BinOp::Add, ExprIR::var("total"), ExprIR::Int(1)),
                    }],
                },
                StmtIR::Return(ExprIR::var("total")),
            ],
        ));
        let code = generate(&service).source.contents;
        assert!(code.contains("  let total = 0;\n"));
        assert!(code.contains("  const limit = 10;\n"));
        assert!(code.contains("  while ((total < limit)) {\n    total = (total + 1);\n  }\n"));
        assert!(code.contains("  return res.status(201).json(total);\n"));
    }

    #[test]
    fn test_background_returns_are_plain() {
        let mut service = ServiceIR::new("s");
        service.queues.push(QueueBinding {
            queue_name: "emails".to_string(),
            concurrency: 2,
            max_retries: 3,
            timeout_secs: 0,
            providers: vec![],
            body: vec![StmtIR::Return(ExprIR::Bool(true))],
        });
        let code = generate(&service).source.contents;
        assert!(code.contains("async function workerEmails(message: any): Promise<any> {\n  return true;\n}"));
        assert!(code.contains("new Worker('emails', async (job: Job) => workerEmails(job.data), { connection: queueConnection, concurrency: 2 });"));
        assert!(code.contains("'emails': 4,"));
    }

    #[test]
    fn test_route_without_return_ends_response() {
        let mut service = ServiceIR::new("s");
        service.routes.push(route(HttpMethod::Delete, "/cache", vec![]));
        let code = generate(&service).source.contents;
        assert!(code.contains("  // no-op\n  if (!res.headersSent) res.status(204).end();\n});"));
    }

    #[test]
    fn test_package_json() {
        let program = generate(&user_service());
        let package: Value = serde_json::from_str(&program.manifest.contents).unwrap();
        assert_eq!(package["name"], "users");
        assert_eq!(package["scripts"]["dev"], "ts-node src/app.ts");
        assert_eq!(package["dependencies"]["express"], "^4.18.0");
        assert_eq!(package["dependencies"]["pg"], "^8.11.0");
        assert!(package["dependencies"].get("node-cron").is_none());
        assert_eq!(program.auxiliary[0].path, "tsconfig.json");
    }

    #[test]
    fn test_lambda_and_pipe() {
        let mut service = ServiceIR::new("s");
        service.constants.push(ConstantDef {
            name: "double".to_string(),
            ty: None,
            value: ExprIR::Lambda(LambdaExpr {
                params: vec![FieldSchema::new("x", TypeRef::Int)],
                body: LambdaBody::Expr(Box::new(ExprIR::binary(
                    BinOp::Mul,
                    ExprIR::var("x"),
                    ExprIR::Int(2),
                ))),
            }),
        });
        service.constants.push(ConstantDef {
            name: "answer".to_string(),
            ty: Some(TypeRef::Int),
            value: ExprIR::Pipe {
                left: Box::new(ExprIR::Int(21)),
                right: Box::new(ExprIR::var("double")),
            },
        });
        let code = generate(&service).source.contents;
        assert!(code.contains("const double = ((x: number) => (x * 2));"));
        assert!(code.contains("const answer: number = double(21);"));
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
        assert_eq!(typescript_type(&TypeRef::named("Address"), &service), "Address");
        assert_eq!(typescript_type(&TypeRef::Provider("Redis".to_string()), &service), "Redis");
        assert_eq!(typescript_type(&TypeRef::Any, &service), "any");
    }

    #[test]
    fn test_type_params_are_declared() {
        let code = generate(&identity_service()).source.contents;
        assert!(code.contains("interface Page<T> {\n  items: T[];\n}"), "{}", code);
        assert!(code.contains("function identity<T>(x: T): T {\n  return x;\n}"), "{}", code);
    }
}
