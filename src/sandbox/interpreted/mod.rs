//! Interpreted backend: checks every node of the parsed submission against
//! a whitelist, then walks the tree.
//!
//! Dunder attribute access is refused at run time, and decorators,
//! `global`/`nonlocal`, `with`, generators and `match` are refused before
//! anything runs.

mod walker;
pub mod whitelist;

use std::time::Duration;

use rustpython_vm::VirtualMachine;
use tracing::debug;

use crate::sandbox::config::BackendKind;
use crate::sandbox::context::RunSettings;
use crate::sandbox::executor::{self, ExecResult, ExecutorBackend, RunFailure};
use crate::sandbox::namespace::Namespace;
use crate::sandbox::runtime::VmHost;
use crate::sandbox::syntax::Prepared;

#[derive(Debug)]
pub struct InterpretedBackend {
    settings: RunSettings,
    last_frame: Option<String>,
}

impl InterpretedBackend {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            last_frame: None,
        }
    }
}

fn execute(host: &VmHost, vm: &VirtualMachine, prepared: &Prepared) -> Result<(), RunFailure> {
    whitelist::validate(prepared).map_err(|violation| {
        debug!(line = violation.line, message = %violation.message, "construct rejected");
        RunFailure::Policy {
            message: violation.message,
            line: violation.line,
        }
    })?;
    walker::run_module(host, vm, prepared)?;
    Ok(())
}

impl ExecutorBackend for InterpretedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreted
    }

    fn run(
        &mut self,
        namespace: &Namespace,
        source: &str,
        capture_frame: bool,
        grace_period: Duration,
    ) -> ExecResult {
        let result = executor::drive(
            BackendKind::Interpreted,
            &self.settings,
            namespace,
            source,
            capture_frame,
            grace_period,
            execute,
        );
        self.last_frame = result.frame.clone();
        result
    }

    fn captured_frame(&self) -> Option<&str> {
        self.last_frame.as_deref()
    }

    fn clear_captured_frame(&mut self) {
        self.last_frame = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sandbox::config::{CaptureConfig, SandboxConfig};
    use crate::sandbox::executor::ErrorKind;
    use crate::sandbox::registry::ModuleRegistry;

    fn backend_with(config: SandboxConfig) -> InterpretedBackend {
        InterpretedBackend::new(RunSettings::new(config, Arc::new(ModuleRegistry::new())))
    }

    fn backend() -> InterpretedBackend {
        backend_with(SandboxConfig::default())
    }

    fn run(backend: &mut InterpretedBackend, ns: &Namespace, source: &str) -> ExecResult {
        backend.run(ns, source, false, Duration::ZERO)
    }

    #[test]
    fn test_print_and_echo() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "print('Hello')\n{'a': [1, 2]}\n");
        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "Hello\n{\"a\": [1, 2]}\n");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn test_nested_prints_appear_once() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "\
def inner():
    print('inner')
def outer():
    print('outer')
    inner()
outer()
";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.stdout, "outer\ninner\n");
    }

    #[test]
    fn test_state_persists_between_runs() {
        let mut b = backend();
        let ns = Namespace::new();
        assert!(run(&mut b, &ns, "x = 41\ndef inc(v):\n    return v + 1\n").is_success());
        let result = run(&mut b, &ns, "print(inc(x))");
        assert_eq!(result.stdout, "42\n");
    }

    #[test]
    fn test_big_integers() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "print(2**62*4)\nprint(int('99999999999999999999') + 1)\nprint(-9223372036854775808)\n";
        let result = run(&mut b, &ns, src);
        assert_eq!(
            result.stdout,
            "18446744073709551616\n100000000000000000000\n-9223372036854775808\n",
            "stderr: {}",
            result.stderr
        );
    }

    #[test]
    fn test_division_by_zero_traceback() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "x = 1\ny = x / 0\n");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeFailure));
        assert_eq!(
            result.stderr,
            "Traceback (most recent call last):\n  File \"<user_code>\", line 2, in <module>\n    y = x / 0\nZeroDivisionError: division by zero\n"
        );
        assert_eq!(ns.get("x").as_deref(), Some("1"));
    }

    #[test]
    fn test_traceback_lists_function_frames() {
        let mut b = backend();
        let ns = Namespace::new();
        assert!(run(&mut b, &ns, "def fail(v):\n    return v['missing']\n").is_success());
        let result = run(&mut b, &ns, "x = 1\nfail({})\n");
        assert_eq!(
            result.stderr,
            "Traceback (most recent call last):\n  File \"<user_code>\", line 2, in <module>\n    fail({})\n  File \"<user_code>\", line 2, in fail\n    return v['missing']\nKeyError: 'missing'\n"
        );
    }

    #[test]
    fn test_format_exc_has_traceback() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "import traceback\ntry:\n    int('x')\nexcept ValueError:\n    print(traceback.format_exc())\n";
        let result = run(&mut b, &ns, src);
        assert_eq!(
            result.stdout,
            "Traceback (most recent call last):\n  File \"<user_code>\", line 3, in <module>\n    int('x')\nValueError: invalid literal for int() with base 10: 'x'\n\n",
            "stderr: {}",
            result.stderr
        );
    }

    #[test]
    fn test_dunder_attribute_refused() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "x = [].__class__\n");
        assert_eq!(result.exit_code, 1);
        assert!(result
            .stderr
            .contains("AttributeError: Forbidden access to dunder attribute: __class__"));
        let result = run(&mut b, &ns, "getattr([], '__class__')\n");
        assert!(result.stderr.contains("Forbidden access to dunder attribute: __class__"));
        let result = run(&mut b, &ns, "b = __builtins__\n");
        assert!(result.stderr.contains("NameError: Forbidden access to dunder name: __builtins__"));
    }

    #[test]
    fn test_hidden_builtins_are_not_defined() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "eval('1 + 1')\n");
        assert!(result.stderr.contains("NameError: name 'eval' is not defined"));
    }

    #[test]
    fn test_decorator_rejected_before_running() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "print('side effect')\n@property\ndef f():\n    pass\n");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
        assert_eq!(result.stdout, "");
        assert!(result.stderr.contains("line 2"));
        assert!(result.stderr.contains("Decorators are not supported."));
    }

    #[test]
    fn test_rejected_import_is_policy_violation() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "import subprocess\n");
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
        assert!(result.stderr.contains("ImportError"));
        assert!(result.stderr.contains("subprocess"));
    }

    #[test]
    fn test_rejected_import_binds_nothing() {
        let mut b = backend();
        let ns = Namespace::new();
        let before = ns.snapshot();
        let result = run(&mut b, &ns, "x = 5\nimport os\n");
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
        assert_eq!(ns.snapshot(), before);
    }

    #[test]
    fn test_import_forms() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "import math\nfrom json import dumps as d\nfrom string import *\n\
                   print(math.floor(2.5), d([1]), ascii_lowercase[:3])\n";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.stdout, "2 [1] abc\n", "stderr: {}", result.stderr);

        let result = run(&mut b, &ns, "from math import nothing_here\n");
        assert!(result
            .stderr
            .contains("ImportError: cannot import name 'nothing_here' from 'math'"));
    }

    #[test]
    fn test_try_except_finally() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "\
log = []
try:
    {}['k']
except KeyError as e:
    log.append('caught')
else:
    log.append('else')
finally:
    log.append('finally')
print(log)
";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.stdout, "['caught', 'finally']\n", "stderr: {}", result.stderr);
        assert!(!ns.contains("e"));
    }

    #[test]
    fn test_classes_and_comprehensions() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "\
class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y
    def norm2(self):
        return self.x * self.x + self.y * self.y
pts = [Point(i, i + 1) for i in range(3)]
print([p.norm2() for p in pts if p.x], {p.x: p.y for p in pts}, sorted(pts, key=lambda p: -p.x)[0].x)
";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.stdout, "[5, 13] {0: 1, 1: 2, 2: 3} 2\n", "stderr: {}", result.stderr);
    }

    #[test]
    fn test_zero_argument_super() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "\
class Base:
    def describe(self):
        return 'base'
class Child(Base):
    def describe(self):
        return 'child of ' + super().describe()
print(Child().describe())
";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.stdout, "child of base\n", "stderr: {}", result.stderr);
    }

    #[test]
    fn test_arguments_bind_like_calls() {
        let mut b = backend();
        let ns = Namespace::new();
        let src = "\
def f(a, b=2, *rest, key=None, **extra):
    return (a, b, rest, key, extra)
print(f(1), f(1, 3, 4, key='k', z=0))
first, *middle, last = range(5)
print(first, middle, last)
";
        let result = run(&mut b, &ns, src);
        assert_eq!(
            result.stdout,
            "(1, 2, (), None, {}) (1, 3, (4,), 'k', {'z': 0})\n0 [1, 2, 3] 4\n",
            "stderr: {}",
            result.stderr
        );
        let result = run(&mut b, &ns, "f()\n");
        assert!(result
            .stderr
            .contains("TypeError: f() missing 1 required positional argument: 'a'"));
    }

    #[test]
    fn test_huge_allocations_raise_memory_error() {
        let mut b = backend();
        let ns = Namespace::new();
        for expr in [
            "'x'.ljust(10**12)",
            "'7'.zfill(10**12)",
            "f'{1:>1000000000000}'",
            "'ab' * 10**12",
            "bytes(10**12)",
        ] {
            let result = run(&mut b, &ns, &format!("v = {expr}\n"));
            assert!(result.stderr.contains("MemoryError: allocation of"), "{expr}: {}", result.stderr);
        }
        let result = run(&mut b, &ns, "import json\njson.dumps([1], indent=10**12)\n");
        assert!(result.stderr.contains("MemoryError"), "{}", result.stderr);
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let mut b = backend();
        let ns = Namespace::new();
        let source = format!("x = {}1{}\n", "(".repeat(20_000), ")".repeat(20_000));
        let result = run(&mut b, &ns, &source);
        assert_eq!(result.error_kind(), Some(ErrorKind::CompileFailure));
        assert!(result.stderr.ends_with("SyntaxError: too many nested parentheses\n"));
        assert!(!ns.contains("x"));
    }

    #[test]
    fn test_infinite_loop_hits_budget() {
        let config = SandboxConfig::builder().max_fuel(10_000).build();
        let mut b = backend_with(config);
        let ns = Namespace::new();
        let src = "try:\n    while True:\n        pass\nexcept BaseException:\n    print('swallowed')\n";
        let result = run(&mut b, &ns, src);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeFailure));
        assert!(!result.stdout.contains("swallowed"));
    }

    #[test]
    fn test_runaway_recursion_is_contained() {
        let mut b = backend();
        let ns = Namespace::new();
        let result = run(&mut b, &ns, "def f(n):\n    return f(n + 1)\nf(0)\n");
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("RecursionError"));
        let result = run(&mut b, &ns, "print('still alive')");
        assert_eq!(result.stdout, "still alive\n");
    }

    #[test]
    fn test_capture_failure_keeps_exit_code() {
        let capture = CaptureConfig {
            program: "definitely-missing-tool".into(),
            ..CaptureConfig::default()
        };
        let mut b = backend_with(SandboxConfig::builder().capture(capture).build());
        let ns = Namespace::new();
        let result = b.run(&ns, "print('drawn')", true, Duration::ZERO);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.starts_with("drawn\n"));
        assert!(result.stdout.contains("[Frame capture failed]"));
        assert_eq!(result.frame, None);
        assert_eq!(b.captured_frame(), None);
    }
}
