//! Security tests to verify sandbox isolation.
//!
//! These tests attempt various escape techniques against both backends and
//! check that each is refused without taking the session down.

use std::time::Duration;

use script_sandbox_rs::prelude::*;
use script_sandbox_rs::sandbox::io::TRUNCATION_MARKER;

const BACKENDS: [BackendKind; 2] = [BackendKind::Interpreted, BackendKind::Restricted];

/// Helper to create a test sandbox config.
fn test_config(backend: BackendKind) -> SandboxConfig {
    SandboxConfig::builder()
        .backend(backend)
        .timeout(Duration::from_secs(5))
        .build()
}

fn run_on(backend: BackendKind, code: &str) -> Observation {
    let mut session = Session::start(test_config(backend));
    session.run(code).expect("session is ready")
}

/// Runs `code` on every backend and checks the session still answers
/// afterwards.
fn run_everywhere(code: &str) -> Vec<(BackendKind, Observation)> {
    BACKENDS
        .iter()
        .map(|&backend| {
            let mut session = Session::start(test_config(backend));
            let observation = session.run(code).expect("session is ready");
            let after = session.run("print('alive')").expect("session is ready");
            assert_eq!(after.stdout, "alive\n", "{backend}: session unusable after escape attempt");
            (backend, observation)
        })
        .collect()
}

/// Test that infinite loops are properly terminated.
#[test]
fn test_infinite_loop_timeout() {
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .timeout(Duration::from_millis(300))
            .build();
        let mut session = Session::start(config);

        let observation = session.run("while True:\n    pass\n").unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(
            observation.stderr.contains("TimeoutError"),
            "{backend}: infinite loop should time out, got {}",
            observation.stderr
        );
    }
}

/// A timeout cannot be swallowed by a broad `except`.
#[test]
fn test_timeout_not_catchable() {
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .max_fuel(5_000)
            .build();
        let mut session = Session::start(config);
        let code = "\
try:
    while True:
        pass
except Exception:
    print('SECURITY_BREACH: timeout swallowed')
";
        let observation = session.run(code).unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(!observation.stdout.contains("SECURITY_BREACH"), "{backend}");
    }
}

/// Test that filesystem access is blocked.
#[test]
fn test_filesystem_access_blocked() {
    let code = r#"
try:
    with open('/etc/passwd', 'r') as f:
        print(f.read())
    print('SECURITY_BREACH: file read succeeded')
except Exception:
    print('BLOCKED')
"#;
    for (backend, observation) in run_everywhere(code) {
        assert!(
            !observation.stdout.contains("SECURITY_BREACH"),
            "{backend}: filesystem access should be blocked"
        );
    }
}

/// Test that host modules cannot be imported.
#[test]
fn test_host_modules_blocked() {
    for module in ["os", "subprocess", "socket", "ctypes", "pickle", "shutil", "importlib"] {
        for (backend, observation) in run_everywhere(&format!("import {module}\n")) {
            assert_eq!(observation.exit_code, 1, "{backend}: import {module}");
            assert_eq!(observation.error, Some(ErrorKind::PolicyViolation), "{backend}: import {module}");
            assert!(
                observation.stderr.contains(&format!("'{module}'")),
                "{backend}: stderr should name {module}: {}",
                observation.stderr
            );
        }
    }
}

/// `from x import y` and dotted imports go through the same policy.
#[test]
fn test_import_forms_blocked() {
    for code in ["from os import path\n", "import os.path\n", "import json, subprocess\n"] {
        for (backend, observation) in run_everywhere(code) {
            assert_eq!(observation.exit_code, 1, "{backend}: {code}");
            assert_eq!(observation.error, Some(ErrorKind::PolicyViolation), "{backend}: {code}");
        }
    }
}

/// Test that runaway allocations are refused.
#[test]
fn test_memory_exhaustion_protection() {
    let code = r#"
try:
    data = 'x' * (10 ** 11)
    print('SECURITY_BREACH: allocation succeeded')
except MemoryError:
    print('BLOCKED')
"#;
    for (backend, observation) in run_everywhere(code) {
        assert_eq!(observation.stdout, "BLOCKED\n", "{backend}: {}", observation.stderr);
    }
}

/// Output beyond the cap is dropped, not buffered.
#[test]
fn test_output_flood_truncated() {
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .max_output_bytes(64)
            .build();
        let mut session = Session::start(config);
        let observation = session.run("for i in range(1000):\n    print('line', i)\n").unwrap();
        assert!(observation.is_success(), "{backend}");
        assert!(observation.stdout.ends_with(TRUNCATION_MARKER), "{backend}");
        assert!(observation.stdout.len() <= 64 + TRUNCATION_MARKER.len(), "{backend}");
    }
}

/// Test that dynamic code evaluation is unavailable.
#[test]
fn test_eval_exec_unavailable() {
    for code in [
        "eval('1 + 1')\n",
        "exec('x = 1')\n",
        "compile('1', '<s>', 'eval')\n",
        "__import__('os')\n",
    ] {
        for (backend, observation) in run_everywhere(code) {
            assert_eq!(observation.exit_code, 1, "{backend}: {code}");
        }
    }
}

/// Test that the builtins table cannot be reached or replaced.
#[test]
fn test_builtins_manipulation() {
    for code in [
        "__builtins__['print'] = None\n",
        "print(__builtins__)\n",
        "import builtins\n",
    ] {
        for (backend, observation) in run_everywhere(code) {
            assert_eq!(observation.exit_code, 1, "{backend}: {code}");
        }
    }
}

/// Test that object-graph introspection cannot walk to host objects.
#[test]
fn test_introspection_escape_blocked() {
    for code in [
        "().__class__.__bases__[0].__subclasses__()\n",
        "print.__self__\n",
        "f = lambda: 0\nf.__globals__\n",
        "getattr([], '__class__')\n",
        "getattr(getattr, '__dict__')\n",
    ] {
        for (backend, observation) in run_everywhere(code) {
            assert_eq!(observation.exit_code, 1, "{backend}: {code}");
            assert!(
                observation.stderr.contains("__"),
                "{backend}: refusal should name the dunder: {}",
                observation.stderr
            );
        }
    }
}

/// Dunder names are rejected by the restricted compiler before anything runs.
#[test]
fn test_restricted_rejects_dunders_before_running() {
    let code = "print('SECURITY_BREACH: ran')\nx = [].__class__\n";
    let observation = run_on(BackendKind::Restricted, code);
    assert_eq!(observation.exit_code, 1);
    assert_eq!(observation.error, Some(ErrorKind::CompileFailure));
    assert!(observation.stdout.is_empty());
}

/// The interpreted backend refuses constructs outside its whitelist before
/// anything runs.
#[test]
fn test_interpreted_whitelist_checked_up_front() {
    let code = "print('SECURITY_BREACH: ran')\ndef f():\n    global x\n";
    let observation = run_on(BackendKind::Interpreted, code);
    assert_eq!(observation.exit_code, 1);
    assert_eq!(observation.error, Some(ErrorKind::PolicyViolation));
    assert!(observation.stdout.is_empty());
}

/// Deep recursion fails with `RecursionError` and the worker survives.
#[tokio::test]
async fn test_deep_recursion_contained() {
    let manager = SessionManager::new(SandboxConfig::default());
    for backend in BACKENDS {
        let id = manager.create_session(Vec::<String>::new(), backend).unwrap();
        let observation = manager
            .submit(&id, "def f(n):\n    return f(n + 1)\nf(0)\n", false)
            .await
            .unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(observation.stderr.contains("RecursionError"), "{backend}: {}", observation.stderr);

        let observation = manager.submit(&id, "print('alive')", false).await.unwrap();
        assert_eq!(observation.stdout, "alive\n", "{backend}");
        manager.close_session(&id).await.unwrap();
    }
}
