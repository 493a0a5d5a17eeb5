use aaa_proto::{AssignOp, ConfigSection};
use aaa_server::{
    Config, Context, ModuleConfig, Request, SectionRegistry, ServerConfig, VirtualServers,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;

fn context() -> Arc<Context> {
    Arc::new(Context::builder().with_builtins().build().unwrap())
}

fn radius_config(users: usize) -> Config {
    let users: Vec<serde_json::Value> = (0..users)
        .map(|i| serde_json::json!({ "username": format!("user{}", i), "password": "secret" }))
        .collect();

    Config {
        modules: vec![ModuleConfig {
            name: "users".to_string(),
            module: "users".to_string(),
            settings: serde_json::json!({ "users": users }),
        }],
        servers: vec![ServerConfig {
            name: "default".to_string(),
            namespace: "radius".to_string(),
            settings: serde_json::Value::Null,
            listen: vec![],
            sections: vec![
                ConfigSection::new("recv", Some("Access-Request"))
                    .with_section(
                        ConfigSection::new("if", Some("&User-Name =~ /^user[0-9]+$/"))
                            .with_word("users"),
                    )
                    .with_section(ConfigSection::new("else", None).with_word("reject")),
                ConfigSection::new("authenticate", Some("users")).with_word("users"),
                ConfigSection::new("send", Some("Access-Accept")).with_pair(
                    "&reply.Reply-Message",
                    AssignOp::Set,
                    "Welcome",
                ),
            ],
        }],
        ..Config::default()
    }
}

fn aka_config() -> Config {
    Config {
        servers: vec![ServerConfig {
            name: "aka".to_string(),
            namespace: "eap-aka".to_string(),
            settings: serde_json::Value::Null,
            listen: vec![],
            sections: vec![ConfigSection::new("recv", Some("Identity-Response")).with_word("ok")],
        }],
        ..Config::default()
    }
}

fn ready(config: &Config) -> VirtualServers {
    let mut image = VirtualServers::bootstrap(context(), config).unwrap();
    image.instantiate().unwrap();
    image.thread_instantiate().unwrap();
    image
}

// Registry benchmarks
fn bench_section_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("section_lookup");
    let context = context();
    let registry: &SectionRegistry = context.protocol("eap-aka").unwrap().registry();
    let radius: &SectionRegistry = context.protocol("radius").unwrap().registry();

    group.bench_function("exact", |b| {
        b.iter(|| registry.lookup(black_box("recv"), black_box(Some("Challenge-Response"))))
    });
    group.bench_function("wildcard", |b| {
        b.iter(|| radius.lookup(black_box("authenticate"), black_box(Some("users"))))
    });
    group.bench_function("miss", |b| {
        b.iter(|| registry.lookup(black_box("recv"), black_box(Some("Access-Request"))))
    });

    group.finish();
}

// Compile benchmarks
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let context = context();

    for users in [1, 100].iter() {
        let config = radius_config(*users);
        group.bench_with_input(BenchmarkId::from_parameter(users), &config, |b, config| {
            b.iter(|| {
                let mut image = VirtualServers::bootstrap(context.clone(), config).unwrap();
                image.instantiate().unwrap();
                image.free();
            });
        });
    }

    group.finish();
}

// Dispatch benchmarks
fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("process");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let radius = ready(&radius_config(100));
    group.bench_function("radius_accept", |b| {
        b.iter(|| {
            let mut request = Request::new(1, "default");
            request.request.add("User-Name", "user42");
            request.request.add("User-Password", "secret");
            runtime.block_on(radius.process(black_box(&mut request))).unwrap()
        });
    });
    group.bench_function("radius_reject", |b| {
        b.iter(|| {
            let mut request = Request::new(2, "default");
            request.request.add("User-Name", "mallory");
            runtime.block_on(radius.process(black_box(&mut request))).unwrap()
        });
    });

    let aka = ready(&aka_config());
    group.bench_function("aka_client_error_default", |b| {
        b.iter(|| {
            let mut request = Request::new(3, "aka");
            request.request.add("Subtype", "Client-Error");
            runtime.block_on(aka.process(black_box(&mut request))).unwrap()
        });
    });

    group.finish();
    radius.thread_detach();
    aka.thread_detach();
}

criterion_group!(benches, bench_section_lookup, bench_compile, bench_process);
criterion_main!(benches);
