//! Benchmarks for the script sandbox.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use script_sandbox_rs::prelude::*;

const BACKENDS: [BackendKind; 2] = [BackendKind::Interpreted, BackendKind::Restricted];

fn config(backend: BackendKind) -> SandboxConfig {
    SandboxConfig::builder()
        .backend(backend)
        .timeout(Duration::from_secs(30))
        .build()
}

/// Benchmark session creation (fresh namespace and backend).
fn bench_session_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_creation");

    for backend in BACKENDS {
        group.bench_function(backend.as_str(), |b| {
            b.iter(|| black_box(Session::start(config(backend))));
        });
    }

    group.bench_function("reset", |b| {
        let mut session = Session::start(config(BackendKind::Interpreted));
        b.iter(|| black_box(session.reset()));
    });

    group.finish();
}

/// Benchmark code execution on a warm session.
fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");

    let programs = [
        ("simple_print", "print(1 + 1)"),
        ("loop_100", "total = 0\nfor i in range(100):\n    total += i\nprint(total)"),
        ("string_ops", "s = 'hello' * 100\nprint(len(s.upper()))"),
        (
            "function_calls",
            "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\nprint(fib(12))",
        ),
    ];

    for backend in BACKENDS {
        let mut session = Session::start(config(backend));
        for (name, code) in programs {
            group.bench_with_input(BenchmarkId::new(name, backend), &code, |b, code| {
                b.iter(|| black_box(session.run(code).unwrap()));
            });
        }
    }

    group.finish();
}

/// Benchmark front-end cost: parse, check and compile without much work.
fn bench_front_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("front_end");

    let source: String = (0..200)
        .map(|i| format!("v{i} = [x * {i} for x in range(3) if x]\n"))
        .collect();
    group.throughput(Throughput::Bytes(source.len() as u64));

    for backend in BACKENDS {
        let mut session = Session::start(config(backend));
        group.bench_function(backend.as_str(), |b| {
            b.iter(|| black_box(session.run(&source).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark concurrent sessions through the manager.
fn bench_concurrent_sessions(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let manager = Arc::new(SessionManager::new(config(BackendKind::Interpreted)));

    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    for concurrency in [1, 2, 4, 8].iter() {
        let ids: Vec<String> = (0..*concurrency)
            .map(|_| manager.create_default_session().unwrap())
            .collect();

        group.throughput(Throughput::Elements(*concurrency as u64));
        group.bench_with_input(BenchmarkId::new("submissions", concurrency), &ids, |b, ids| {
            b.iter(|| {
                rt.block_on(async {
                    let mut handles = Vec::new();

                    for id in ids {
                        let manager = Arc::clone(&manager);
                        let id = id.clone();
                        handles.push(tokio::spawn(async move {
                            manager.submit(&id, "print(sum(range(1000)))", false).await.unwrap()
                        }));
                    }

                    for handle in handles {
                        let result = handle.await.unwrap();
                        black_box(result);
                    }
                });
            });
        });
    }

    group.finish();
}

/// Benchmark fuel accounting against a wall-clock-only budget.
fn bench_limiting_mechanisms(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiting");
    let code = "for i in range(1000):\n    pass\n";

    group.bench_function("deadline_only", |b| {
        let mut session = Session::start(config(BackendKind::Restricted));
        b.iter(|| black_box(session.run(code).unwrap()));
    });

    group.bench_function("deadline_and_fuel", |b| {
        let config = SandboxConfig::builder()
            .backend(BackendKind::Restricted)
            .max_fuel(1_000_000)
            .build();
        let mut session = Session::start(config);
        b.iter(|| black_box(session.run(code).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_session_creation,
    bench_execution,
    bench_front_end,
    bench_concurrent_sessions,
    bench_limiting_mechanisms,
);
criterion_main!(benches);
