//! End-to-end behavior of sessions on both backends.

use std::sync::Arc;
use std::time::Duration;

use script_sandbox_rs::prelude::*;

const BACKENDS: [BackendKind; 2] = [BackendKind::Interpreted, BackendKind::Restricted];

/// Routes the crate's spans to the test output; `RUST_LOG=debug` shows
/// per-run step counts.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start(backend: BackendKind) -> Session {
    init_tracing();
    Session::start(SandboxConfig::builder().backend(backend).build())
}

#[test]
fn test_variables_persist_across_submissions() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let first = session.run("x = 10").unwrap();
        assert!(first.is_success(), "{backend}");
        let second = session.run("print(x)").unwrap();
        assert_eq!(second.stdout, "10\n", "{backend}");
    }
}

#[test]
fn test_functions_persist_across_submissions() {
    for backend in BACKENDS {
        let mut session = start(backend);
        session.run("def square(n):\n    return n * n\n").unwrap();
        let observation = session.run("print(square(7))").unwrap();
        assert_eq!(observation.stdout, "49\n", "{backend}");
    }
}

#[test]
fn test_stdlib_import_needs_no_whitelist() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session
            .run("import math\nimport json\nprint(math.floor(2.7), json.dumps({'a': 1}))")
            .unwrap();
        assert_eq!(observation.stdout, "2 {\"a\": 1}\n", "{backend}: {}", observation.stderr);
    }
}

#[test]
fn test_unlisted_import_is_rejected() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run("import requests").unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(observation.stderr.contains("requests"), "{backend}");
        assert_eq!(session.state().last_exit_code, 1);
    }
}

#[test]
fn test_whitelisted_third_party_module() {
    let registry = Arc::new(ModuleRegistry::new());
    registry.register_source("plotkit", "VERSION = '1.2'\n");
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .additional_imports(["plotkit"])
            .build();
        let mut session = Session::with_registry(config, Arc::clone(&registry));
        session.create();
        let observation = session.run("import plotkit\nprint(plotkit.VERSION)").unwrap();
        assert_eq!(observation.stdout, "1.2\n", "{backend}: {}", observation.stderr);
    }
}

#[test]
fn test_whitelisted_but_missing_module() {
    let config = SandboxConfig::builder().additional_imports(["numpy"]).build();
    let mut session = Session::with_registry(config, Arc::new(ModuleRegistry::new()));
    session.create();
    let observation = session.run("import numpy").unwrap();
    assert_eq!(observation.exit_code, 1);
    assert!(observation.stderr.contains("ModuleNotFoundError"));
    assert_eq!(observation.error, Some(ErrorKind::RuntimeFailure));
}

#[test]
fn test_reset_forgets_variables() {
    for backend in BACKENDS {
        let mut session = start(backend);
        session.run("token = 'abc'").unwrap();
        session.reset();
        let observation = session.run("print(token)").unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(observation.stderr.contains("NameError"), "{backend}");
    }
}

#[test]
fn test_syntax_error_leaves_namespace_untouched() {
    for backend in BACKENDS {
        let mut session = start(backend);
        session.run("a = 1\nb = [a, 2]").unwrap();
        let before = session.namespace().unwrap().snapshot();

        let observation = session.run("a = 2\nif a >\n    b = 3\n").unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert_eq!(observation.error, Some(ErrorKind::CompileFailure), "{backend}");
        assert!(observation.stderr.contains("SyntaxError"), "{backend}");
        assert_eq!(session.namespace().unwrap().snapshot(), before, "{backend}");
    }
}

#[test]
fn test_runtime_error_keeps_earlier_bindings() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run("kept = 5\nx = 1/0\n").unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(observation.stderr.contains("ZeroDivisionError"), "{backend}");
        let observation = session.run("print(kept)").unwrap();
        assert_eq!(observation.stdout, "5\n", "{backend}");
    }
}

#[test]
fn test_hello_world() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run("print('Hello')").unwrap();
        assert_eq!(observation.stdout, "Hello\n", "{backend}");
        assert_eq!(observation.stderr, "", "{backend}");
        assert_eq!(observation.exit_code, 0, "{backend}");
        assert!(observation.frame.is_none(), "{backend}");
    }
}

#[test]
fn test_each_print_appears_once() {
    let code = "\
def leaf(n):
    print('leaf', n)

def branch():
    print('branch')
    for i in range(2):
        leaf(i)

branch()
";
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run(code).unwrap();
        assert_eq!(observation.stdout, "branch\nleaf 0\nleaf 1\n", "{backend}");
    }
}

#[test]
fn test_capture_without_tool_reports_only_user_result() {
    let capture = CaptureConfig {
        program: "no-such-frame-grabber".into(),
        grace_period: Duration::ZERO,
        ..CaptureConfig::default()
    };
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .capture(capture.clone())
            .build();
        let mut session = Session::start(config);

        let observation = session.submit(Submission::new("print('ok')").with_capture()).unwrap();
        assert_eq!(observation.exit_code, 0, "{backend}");
        assert!(observation.frame.is_none(), "{backend}");
        assert!(observation.stdout.starts_with("ok\n"), "{backend}");

        let observation = session.submit(Submission::new("1/0").with_capture()).unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert!(observation.frame.is_none(), "{backend}");
    }
}

#[test]
fn test_traceback_parses_into_script_exception() {
    let mut session = start(BackendKind::Restricted);
    let observation = session.run("def f():\n    raise ValueError('bad input')\nf()\n").unwrap();
    let exc = SandboxError::from_script_stderr(&observation.stderr).unwrap();
    assert_eq!(exc.exception_type, "ValueError");
    assert_eq!(exc.message, "bad input");
    assert!(exc.traceback.unwrap().contains("in f"));
}

#[test]
fn test_integers_do_not_overflow() {
    let code = "\
print(2**62*4)
print(int('99999999999999999999') + 1)
print(-9223372036854775808)
print(-(-9223372036854775808) // 3)
";
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run(code).unwrap();
        assert_eq!(
            observation.stdout,
            "18446744073709551616\n100000000000000000000\n-9223372036854775808\n3074457345618258602\n",
            "{backend}: {}",
            observation.stderr
        );
    }
}

#[test]
fn test_oversized_padding_is_memory_error() {
    for backend in BACKENDS {
        let mut session = start(backend);
        for code in [
            "v = 'x'.ljust(10**12)",
            "v = '7'.zfill(10**12)",
            "v = f'{1:>1000000000000}'",
            "import json\nv = json.dumps([1], indent=10**12)",
        ] {
            let observation = session.run(code).unwrap();
            assert_eq!(observation.exit_code, 1, "{backend}: {code}");
            assert!(observation.stderr.contains("MemoryError"), "{backend}: {code}: {}", observation.stderr);
        }
        assert!(!session.namespace().unwrap().contains("v"), "{backend}");
    }
}

#[test]
fn test_deep_nesting_is_syntax_error() {
    let code = format!("x = {}1{}", "(".repeat(20000), ")".repeat(20000));
    for backend in BACKENDS {
        let mut session = start(backend);
        let observation = session.run(&code).unwrap();
        assert_eq!(observation.exit_code, 1, "{backend}");
        assert_eq!(observation.error, Some(ErrorKind::CompileFailure), "{backend}");
        assert!(
            observation.stderr.contains("SyntaxError: too many nested parentheses"),
            "{backend}: {}",
            observation.stderr
        );
    }
}

#[cfg(unix)]
#[test]
fn test_requested_frame_reaches_observation() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let tool = dir.path().join("grab.sh");
    std::fs::write(&tool, "#!/bin/sh\nfor out; do :; done\nprintf 'PNGDATA' > \"$out\"\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    let capture = CaptureConfig {
        program: tool.display().to_string(),
        grace_period: Duration::ZERO,
        ..CaptureConfig::default()
    };
    for backend in BACKENDS {
        let config = SandboxConfig::builder()
            .backend(backend)
            .capture(capture.clone())
            .build();
        let mut session = Session::start(config);
        let observation = session
            .submit_json(r#"{"code": "print('drawn')", "capture_screenshot": true}"#)
            .unwrap();
        assert_eq!(observation.frame.as_deref(), Some("UE5HREFUQQ=="), "{backend}");
        assert!(observation.stdout.starts_with("drawn\n"), "{backend}");
    }
}

#[test]
fn test_injected_helpers() {
    for backend in BACKENDS {
        let mut session = start(backend);
        let code = "\
try:
    {}['missing']
except KeyError:
    text = format_exc()
print('KeyError' in text)
print(safe_json_dumps({'n': 1, 'f': print}) != '')
";
        let observation = session.run(code).unwrap();
        assert_eq!(observation.stdout, "True\nTrue\n", "{backend}: {}", observation.stderr);
    }
}

#[tokio::test]
async fn test_manager_runs_sessions_in_parallel() {
    init_tracing();
    let manager = Arc::new(SessionManager::new(SandboxConfig::default()));
    let mut handles = Vec::new();
    for (i, backend) in BACKENDS.iter().copied().cycle().take(4).enumerate() {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let id = manager.create_session(Vec::<String>::new(), backend)?;
            manager.submit(&id, format!("n = {i}"), false).await?;
            let observation = manager.submit(&id, "print(n * 2)", false).await?;
            manager.close_session(&id).await?;
            Ok::<_, SandboxError>((i, observation))
        }));
    }
    for handle in handles {
        let (i, observation) = handle.await.unwrap().unwrap();
        assert_eq!(observation.stdout, format!("{}\n", i * 2));
    }
    assert!(manager.is_empty());
}

#[test]
fn test_manager_from_blocking_context() {
    let manager = SessionManager::new(SandboxConfig::default());
    let id = manager
        .create_session(Vec::<String>::new(), BackendKind::Interpreted)
        .unwrap();
    let observation = tokio_test::block_on(manager.submit(&id, "print(3 * 3)", false)).unwrap();
    assert_eq!(observation.stdout, "9\n");
    let state = tokio_test::block_on(manager.get_state(&id)).unwrap();
    assert_eq!(state.step_count, 1);
}
