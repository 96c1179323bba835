//! Generated scaffolding for GraphQL, gRPC, WebSocket and cron bindings

use glyph_codegen::lowering::{graphql_sdl, proto_file};
use glyph_codegen::{generate_all, GenerateOptions, Target};
use glyph_ir::*;

fn resolver(operation: GraphQlOp, field_name: &str, params: Vec<FieldSchema>, body: Vec<StmtIR>) -> GraphQlDef {
    GraphQlDef {
        operation,
        field_name: field_name.to_string(),
        params,
        return_type: None,
        auth: None,
        providers: vec![],
        body,
    }
}

fn shop_service() -> ServiceIR {
    let mut service = ServiceIR::new("shop");

    service.graphql.push(resolver(
        GraphQlOp::Query,
        "getUser",
        vec![FieldSchema::new("id", TypeRef::Int)],
        vec![StmtIR::Return(ExprIR::var("id"))],
    ));
    service.graphql.push(resolver(
        GraphQlOp::Mutation,
        "createUser",
        vec![FieldSchema::new("name", TypeRef::String)],
        vec![StmtIR::Return(ExprIR::string("ok"))],
    ));
    service.graphql.push(resolver(
        GraphQlOp::Subscription,
        "userCreated",
        vec![],
        vec![StmtIR::Return(ExprIR::string("created"))],
    ));

    let mut users = GrpcServiceDef::new("Users");
    users.methods.push(GrpcMethodDef {
        name: "Get".to_string(),
        input_type: TypeRef::Any,
        return_type: TypeRef::Any,
        stream: StreamKind::Unary,
    });
    users.handlers.push(GrpcHandlerDef {
        service_name: "Users".to_string(),
        method_name: "Watch".to_string(),
        params: vec![],
        return_type: None,
        stream: StreamKind::ServerStream,
        auth: None,
        providers: vec![],
        body: vec![StmtIR::Return(ExprIR::string("tick"))],
    });
    service.grpc.push(users);

    service.websockets.push(WebSocketDef {
        path: "/chat".to_string(),
        events: [WsEvent::Connect, WsEvent::Message, WsEvent::Disconnect, WsEvent::Error]
            .into_iter()
            .map(|event| WsEventDef { event, body: vec![] })
            .collect(),
    });

    service.cron_jobs.push(CronBinding {
        name: "cleanup".to_string(),
        schedule: "0 * * * *".to_string(),
        timezone: None,
        retries: 0,
        providers: vec![],
        body: vec![StmtIR::Return(ExprIR::string("done"))],
    });
    service
}

fn source(service: &ServiceIR, target: Target) -> String {
    generate_all(service, &[target], &GenerateOptions::default())
        .into_iter()
        .next()
        .map(|program| program.source.contents)
        .unwrap_or_default()
}

/// Asserts the needles occur in `code` in the given order
fn assert_in_order(code: &str, needles: &[&str]) {
    let mut from = 0;
    for needle in needles {
        match code[from..].find(needle) {
            Some(offset) => from += offset + needle.len(),
            None => panic!("expected {:?} after byte {}:\n{}", needle, from, code),
        }
    }
}

#[test]
fn test_graphql_schema_groups_resolvers() {
    let sdl = graphql_sdl(&shop_service());
    assert!(sdl.starts_with("scalar JSON\n"));
    assert!(sdl.contains("type Query {\n  getUser(id: Int!): JSON\n}"), "{}", sdl);
    assert!(sdl.contains("type Mutation {\n  createUser(name: String!): JSON\n}"), "{}", sdl);
    assert!(sdl.contains("type Subscription {\n  userCreated: JSON\n}"), "{}", sdl);
}

#[test]
fn test_graphql_roots_per_target() {
    let service = shop_service();

    let rust = source(&service, Target::Rust);
    assert_in_order(
        &rust,
        &[
            "pub struct QueryRoot;",
            "async fn get_user(",
            "pub struct MutationRoot;",
            "async fn create_user(",
            "pub struct SubscriptionRoot;",
            "#[Subscription]",
            "async fn user_created(&self) -> impl futures::Stream<Item = async_graphql::Json<Value>> {",
        ],
    );
    assert!(rust.contains("async fn resolve_get_user(id: Value) -> Value {\n    return id.clone();\n}"));
    assert!(rust.contains("pub type AppSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;"));
    assert!(rust.contains(".route_service(\"/graphql/ws\", GraphQLSubscription::new(schema))"));

    let python = source(&service, Target::Python);
    assert_in_order(
        &python,
        &[
            "@strawberry.type\nclass Query:",
            "    async def getUser(self, id: int) -> JSON:",
            "@strawberry.type\nclass Mutation:",
            "    async def createUser(self, name: str) -> JSON:",
            "@strawberry.type\nclass Subscription:",
            "    @strawberry.subscription\n    async def userCreated(self) -> AsyncGenerator[JSON, None]:",
        ],
    );
    assert!(python.contains("schema = strawberry.Schema(query=Query, mutation=Mutation, subscription=Subscription)"));

    let typescript = source(&service, Target::TypeScript);
    assert!(typescript.contains("const typeDefs = `#graphql\nscalar JSON\n"));
    assert_in_order(
        &typescript,
        &[
            "const resolvers = {",
            "  Query: {",
            "    getUser: async (_parent: any, args: any) => {",
            "  Mutation: {",
            "    createUser: async (_parent: any, args: any) => {",
            "  Subscription: {",
            "    userCreated: {",
            "      subscribe: async function* (_parent: any, args: any) {",
        ],
    );
}

#[test]
fn test_grpc_stubs_and_streams() {
    let service = shop_service();

    let proto = proto_file(&service);
    assert!(proto.contains("  rpc Get (UsersGetRequest) returns (UsersGetResponse);"));
    assert!(proto.contains("  rpc Watch (UsersWatchRequest) returns (stream UsersWatchResponse);"));

    let rust = source(&service, Target::Rust);
    let unimplemented = [
        "    pub async fn get(&self, request: Value) -> Result<Value, Status> {",
        "        Err(Status::unimplemented(\"Not implemented\"))",
        "    }",
    ]
    .join("\n");
    assert!(rust.contains(&unimplemented), "{}", rust);
    assert!(rust.contains(
        "    // server streaming\n    pub async fn watch(&self, request: Value) -> Result<Value, Status> {"
    ));
    assert!(rust.contains("        return Ok(json!(\"tick\"));\n"));

    let python = source(&service, Target::Python);
    assert!(python.contains(
        "    async def Get(self, request, context):\n        await context.abort(grpc.StatusCode.UNIMPLEMENTED, \"Not implemented\")"
    ));
    assert!(python.contains("\"Watch\": grpc.unary_stream_rpc_method_handler("));
    assert!(python.contains("\"Get\": grpc.unary_unary_rpc_method_handler("));

    let typescript = source(&service, Target::TypeScript);
    assert!(typescript.contains(
        "  get: (call: any, callback: any) => {\n    callback({ code: grpc.status.UNIMPLEMENTED, message: 'Not implemented' });\n  },"
    ));
    assert!(typescript.contains("  watch: async (call: any) => {"));
    assert!(typescript.contains("grpcServer.addService(grpcPackage.Users.service, usersHandlers);"));
}

#[test]
fn test_websocket_hooks_share_one_registry() {
    let service = shop_service();

    let rust = source(&service, Target::Rust);
    assert_eq!(rust.matches("static WS_CONNECTIONS:").count(), 1);
    for hook in [
        "async fn ws_chat_on_connect() -> Value {",
        "async fn ws_chat_on_message(message: Value) -> Value {",
        "async fn ws_chat_on_disconnect() -> Value {",
        "async fn ws_chat_on_error(error: Value) -> Value {",
    ] {
        assert!(rust.contains(hook), "missing {}", hook);
    }
    assert_in_order(
        &rust,
        &[
            "registry.entry(\"/chat\".to_string()).or_default().insert(client_id, tx.clone());",
            "reply(ws_chat_on_connect().await);",
            "ws_chat_on_error(json!(err.to_string())).await;",
            "reply(ws_chat_on_message(message).await);",
            "peers.remove(&client_id);",
            "ws_chat_on_disconnect().await;",
        ],
    );
    assert!(rust.contains(".route(\"/chat\", get(ws_chat))"));

    let python = source(&service, Target::Python);
    assert_eq!(python.matches("ws_connections: Dict[str, Dict[str, WebSocket]] = {}").count(), 1);
    assert_in_order(
        &python,
        &[
            "@app.websocket(\"/chat\")",
            "    async def on_connect():",
            "    async def on_message(message):",
            "    async def on_disconnect():",
            "    async def on_error(error):",
            "ws_connections.setdefault(\"/chat\", {})[client_id] = websocket",
            "ws_connections.get(\"/chat\", {}).pop(client_id, None)",
        ],
    );

    let typescript = source(&service, Target::TypeScript);
    assert_eq!(typescript.matches("const wsConnections = new Map").count(), 1);
    assert_in_order(
        &typescript,
        &[
            "const wsChat = new WebSocketServer({ noServer: true });",
            "  const onConnect = async (): Promise<any> => {",
            "  const onMessage = async (message: any): Promise<any> => {",
            "  const onDisconnect = async (): Promise<any> => {",
            "  const onError = async (error: Error): Promise<any> => {",
            "wsConnections.get('/chat')?.set(clientId, socket);",
            "wsConnections.get('/chat')?.delete(clientId);",
        ],
    );
}

#[test]
fn test_cron_return_is_plain() {
    let service = shop_service();

    let rust = source(&service, Target::Rust);
    assert!(rust.contains("async fn cleanup() -> Value {\n    return json!(\"done\");\n}"), "{}", rust);
    assert!(!rust.contains("Json(json!(\"done\"))"));

    let python = source(&service, Target::Python);
    assert!(python.contains("async def cleanup():\n    return \"done\"\n"));

    let typescript = source(&service, Target::TypeScript);
    assert!(typescript.contains("async function cleanup(): Promise<any> {\n  return 'done';\n}"));
    assert!(!typescript.contains("res.json('done')"));
}
