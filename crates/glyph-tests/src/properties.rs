//! Property-based tests over generated programs

use crate::{compile_program, USERS_FIXTURE};
use glyph_ast::{Expr, Injection, Item, ModuleDecl, Program, Route, Stmt, Type};
use glyph_codegen::lowering::{brace_path, path_params, FeatureSet};
use glyph_codegen::{
    generate_all, python_backend, rust_backend, typescript_backend, CodeGen, GenerateOptions, Target,
};
use proptest::prelude::*;

const PROVIDERS: [(&str, &str); 4] = [
    ("db", "Database"),
    ("redis", "Redis"),
    ("mongo", "MongoDB"),
    ("llm", "LLM"),
];

fn provider_type(index: usize) -> Type {
    match index {
        0 => Type::Database,
        1 => Type::Redis,
        2 => Type::MongoDb,
        _ => Type::Llm,
    }
}

// `(segment, is_param)` pairs
fn segment_strategy() -> impl Strategy<Value = (String, bool)> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|s| (s, false)),
        "[a-z][a-z0-9]{0,6}".prop_map(|s| (s, true)),
    ]
}

fn path_strategy() -> impl Strategy<Value = Vec<(String, bool)>> {
    prop::collection::vec(segment_strategy(), 1..6)
}

fn render_path(segments: &[(String, bool)]) -> String {
    segments
        .iter()
        .map(|(name, is_param)| {
            if *is_param {
                format!("/:{}", name)
            } else {
                format!("/{}", name)
            }
        })
        .collect()
}

/// Provider indexes injected by each route, without repeats inside one route
fn injections_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(
        prop::sample::subsequence(vec![0usize, 1, 2, 3], 0..=4).prop_shuffle(),
        0..6,
    )
}

fn feature_strategy() -> impl Strategy<Value = FeatureSet> {
    prop::collection::vec(any::<bool>(), 14).prop_map(|b| FeatureSet {
        database: b[0],
        redis: b[1],
        mongo: b[2],
        llm: b[3],
        custom_providers: b[4],
        auth: b[5],
        graphql: b[6],
        subscriptions: b[7],
        grpc: b[8],
        websocket: b[9],
        cron: b[10],
        events: b[11],
        queues: b[12],
        commands: b[13],
    })
}

fn program_with_routes(routes: Vec<Route>) -> Program {
    let mut items = vec![Item::Module(ModuleDecl {
        name: "props".to_string(),
    })];
    items.extend(routes.into_iter().map(Item::Route));
    Program::new(items)
}

fn injecting_routes(injections: &[Vec<usize>]) -> Vec<Route> {
    injections
        .iter()
        .enumerate()
        .map(|(i, indexes)| Route {
            path: format!("/r{}", i),
            injections: indexes
                .iter()
                .map(|&p| Injection::new(PROVIDERS[p].0, provider_type(p)))
                .collect(),
            body: vec![Stmt::ret(Expr::int(i as i64))],
            ..Route::default()
        })
        .collect()
}

fn is_subset<T: PartialEq>(small: &[T], large: &[T]) -> bool {
    small.iter().all(|item| large.contains(item))
}

proptest! {
    #[test]
    fn test_path_params_keep_order(segments in path_strategy()) {
        let path = render_path(&segments);
        let expected: Vec<String> = segments
            .iter()
            .filter(|(_, is_param)| *is_param)
            .map(|(name, _)| name.clone())
            .collect();

        let program = program_with_routes(vec![Route {
            path: path.clone(),
            body: vec![Stmt::ret(Expr::string("ok"))],
            ..Route::default()
        }]);
        let result = compile_program(&program).unwrap();

        prop_assert_eq!(&result.service.routes[0].path_params, &expected);
        prop_assert_eq!(&glyph_ir::extract_path_params(&path), &expected);
        prop_assert_eq!(&path_params(&brace_path(&path)), &expected);
        prop_assert_eq!(&path_params(&path), &expected);
    }

    #[test]
    fn test_providers_are_deduplicated(injections in injections_strategy()) {
        let program = program_with_routes(injecting_routes(&injections));
        let result = compile_program(&program).unwrap();

        let mut expected: Vec<&str> = Vec::new();
        for index in injections.iter().flatten() {
            let name = PROVIDERS[*index].1;
            if !expected.contains(&name) {
                expected.push(name);
            }
        }
        let actual: Vec<&str> = result
            .service
            .providers
            .iter()
            .map(|p| p.provider_type.as_str())
            .collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn test_generation_is_deterministic(
        injections in injections_strategy(),
        segments in path_strategy(),
    ) {
        let mut routes = injecting_routes(&injections);
        routes.push(Route {
            path: render_path(&segments),
            body: vec![Stmt::ret(Expr::string("ok"))],
            ..Route::default()
        });
        let program = program_with_routes(routes);

        let first = compile_program(&program).unwrap();
        let second = compile_program(&program).unwrap();
        prop_assert_eq!(&first.service, &second.service);
        prop_assert_eq!(&first.programs, &second.programs);
    }

    #[test]
    fn test_parallel_matches_sequential(injections in injections_strategy()) {
        let program = program_with_routes(injecting_routes(&injections));
        let service = glyph_ir::build_service(&program).unwrap();
        let options = GenerateOptions::default();

        let parallel = generate_all(&service, &Target::all(), &options);
        let sequential: Vec<_> = Target::all()
            .iter()
            .map(|target| target.backend(&options).generate(&service))
            .collect();
        prop_assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_manifests_grow_with_features(a in feature_strategy(), b in feature_strategy()) {
        let both = a.union(b);

        prop_assert!(is_subset(&python_backend::requirements(&a), &python_backend::requirements(&both)));
        prop_assert!(is_subset(
            &typescript_backend::dependencies(&a),
            &typescript_backend::dependencies(&both)
        ));
        prop_assert!(is_subset(
            &typescript_backend::dev_dependencies(&a),
            &typescript_backend::dev_dependencies(&both)
        ));
        prop_assert!(is_subset(&rust_backend::dependencies(&a), &rust_backend::dependencies(&both)));
    }

    #[test]
    fn test_port_override_reaches_every_target(port in 1024u16..65535) {
        let program = glyph_ast::from_json(USERS_FIXTURE).unwrap();
        let service = glyph_ir::build_service(&program).unwrap();
        let options = GenerateOptions { host: None, port: Some(port) };

        for program in generate_all(&service, &Target::all(), &options) {
            prop_assert!(
                program.source.contents.contains(&port.to_string()),
                "{} output does not use port {}",
                program.target,
                port
            );
        }
    }
}
