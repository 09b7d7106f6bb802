//! Core execution interface shared by both backends.
//!
//! A backend turns source text into an [`ExecResult`] against a session's
//! [`Namespace`]. Nothing a script does makes [`ExecutorBackend::run`]
//! fail: syntax errors, policy violations, exceptions, exhausted budgets and
//! even interpreter panics all come back as a result with `exit_code = 1`
//! and a description in stderr. Runs execute on the namespace's own
//! interpreter thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, warn};

use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::{AsObject, VirtualMachine};

use crate::sandbox::config::BackendKind;
use crate::sandbox::context::RunSettings;
use crate::sandbox::interpreted::InterpretedBackend;
use crate::sandbox::io::Channel;
use crate::sandbox::limits::LimitExceeded;
use crate::sandbox::namespace::Namespace;
use crate::sandbox::restricted::RestrictedBackend;
use crate::sandbox::runtime::{VmHost, USER_FILE};
use crate::sandbox::syntax::{self, Prepared};

/// Result of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Captured stdout output.
    pub stdout: String,
    /// Captured stderr output.
    pub stderr: String,
    /// Exit code (0 for success).
    pub exit_code: i32,
    /// Base64 frame grabbed by the capture step, if any.
    pub frame: Option<String>,
    /// Why the run failed. Not part of the wire encoding.
    #[serde(skip)]
    pub error: Option<ErrorKind>,
}

impl ExecResult {
    pub fn success(stdout: String, stderr: String, frame: Option<String>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: 0,
            frame,
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: 1,
            frame: None,
            error: Some(kind),
        }
    }

    /// Check if the execution was successful (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// Failure categories of a run. None of them ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A rejected import or a construct outside the backend's whitelist.
    PolicyViolation,
    /// Source that does not parse or compile.
    CompileFailure,
    /// An exception raised by user code, including exhausted budgets.
    RuntimeFailure,
    /// The frame grab failed. Reported in stdout, never as a failed run.
    CaptureFailure,
    /// The interpreter itself broke.
    HostFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PolicyViolation => "policy violation",
            ErrorKind::CompileFailure => "compile failure",
            ErrorKind::RuntimeFailure => "runtime failure",
            ErrorKind::CaptureFailure => "capture failure",
            ErrorKind::HostFailure => "host failure",
        };
        f.write_str(name)
    }
}

/// The interface the session controller drives.
pub trait ExecutorBackend {
    fn kind(&self) -> BackendKind;

    /// Executes `source` against `namespace`, then grabs a frame after
    /// `grace_period` when `capture_frame` is set and the code succeeded.
    fn run(
        &mut self,
        namespace: &Namespace,
        source: &str,
        capture_frame: bool,
        grace_period: Duration,
    ) -> ExecResult;

    /// Frame grabbed by the most recent run.
    fn captured_frame(&self) -> Option<&str>;

    fn clear_captured_frame(&mut self);
}

/// The closed set of backends.
pub enum Backend {
    Interpreted(InterpretedBackend),
    Restricted(RestrictedBackend),
}

impl Backend {
    /// Builds the backend named by `settings.config.backend`.
    pub fn new(settings: RunSettings) -> Self {
        match settings.config.backend {
            BackendKind::Interpreted => Backend::Interpreted(InterpretedBackend::new(settings)),
            BackendKind::Restricted => Backend::Restricted(RestrictedBackend::new(settings)),
        }
    }

    fn inner(&self) -> &dyn ExecutorBackend {
        match self {
            Backend::Interpreted(b) => b,
            Backend::Restricted(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ExecutorBackend {
        match self {
            Backend::Interpreted(b) => b,
            Backend::Restricted(b) => b,
        }
    }
}

impl ExecutorBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn run(
        &mut self,
        namespace: &Namespace,
        source: &str,
        capture_frame: bool,
        grace_period: Duration,
    ) -> ExecResult {
        self.inner_mut()
            .run(namespace, source, capture_frame, grace_period)
    }

    fn captured_frame(&self) -> Option<&str> {
        self.inner().captured_frame()
    }

    fn clear_captured_frame(&mut self) {
        self.inner_mut().clear_captured_frame()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

/// Why a backend stopped before finishing user code.
pub(crate) enum RunFailure {
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },
    /// A construct the backend refuses to run, with its line.
    Policy { message: String, line: usize },
    /// An import outside the whitelist, found before anything ran.
    Import { module: String, line: usize },
    /// Errors found while compiling restricted code.
    Compile(Vec<String>),
    Runtime(PyBaseExceptionRef),
    /// Time or fuel ran out even though the script swallowed the exception.
    Limit(LimitExceeded),
    Host(anyhow::Error),
}

impl From<PyBaseExceptionRef> for RunFailure {
    fn from(exc: PyBaseExceptionRef) -> Self {
        RunFailure::Runtime(exc)
    }
}

impl RunFailure {
    fn kind(&self, host: &VmHost, vm: &VirtualMachine) -> ErrorKind {
        match self {
            RunFailure::Syntax { .. } | RunFailure::Compile(_) => ErrorKind::CompileFailure,
            RunFailure::Policy { .. } | RunFailure::Import { .. } => ErrorKind::PolicyViolation,
            RunFailure::Runtime(exc)
                if host.state.rejected_import().is_some()
                    && exc.as_object().fast_isinstance(vm.ctx.exceptions.import_error)
                    && !exc.as_object().fast_isinstance(vm.ctx.exceptions.module_not_found_error) =>
            {
                ErrorKind::PolicyViolation
            }
            RunFailure::Runtime(_) | RunFailure::Limit(_) => ErrorKind::RuntimeFailure,
            RunFailure::Host(_) => ErrorKind::HostFailure,
        }
    }

    fn render(&self, host: &VmHost, vm: &VirtualMachine, source: &str) -> String {
        match self {
            RunFailure::Syntax { line, col, message } => render_syntax_error(source, *line, *col, message),
            RunFailure::Policy { message, line } => render_syntax_error(source, *line, 0, message),
            RunFailure::Import { module, line } => {
                let mut out = format!("Traceback (most recent call last):\n  File \"{USER_FILE}\", line {line}, in <module>\n");
                if let Some(text) = source.lines().nth(line.saturating_sub(1)).map(str::trim) {
                    out.push_str(&format!("    {text}\n"));
                }
                out.push_str(&format!("ImportError: {}\n", host.state.violation_message(module)));
                out
            }
            RunFailure::Compile(errors) => format!("SyntaxError: {}\n", errors.join("\n")),
            RunFailure::Runtime(exc) => host.render(vm, exc),
            RunFailure::Limit(limit) => format!("{}: {limit}\n", limit.exception_name()),
            RunFailure::Host(err) => format!("{err:#}\n"),
        }
    }
}

/// Renders a syntax error the way tracebacks show them. A `col` of 0 puts
/// the caret under the first non-blank character.
pub fn render_syntax_error(source: &str, line: usize, col: usize, message: &str) -> String {
    let mut out = format!("  File \"{USER_FILE}\", line {line}\n");
    if let Some(text) = source.lines().nth(line.saturating_sub(1)) {
        let indent = text.chars().take_while(|c| c.is_whitespace()).count();
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            let offset = col.saturating_sub(1).saturating_sub(indent);
            let offset = offset.min(trimmed.chars().count());
            out.push_str(&format!("    {trimmed}\n"));
            out.push_str(&format!("    {}^\n", " ".repeat(offset)));
        }
    }
    out.push_str(&format!("SyntaxError: {message}\n"));
    out
}

pub(crate) fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The backend-specific part of a run: executes prepared user code.
pub(crate) type Execute = fn(&VmHost, &VirtualMachine, &Prepared) -> Result<(), RunFailure>;

/// Shared run driver. On the namespace's interpreter thread it runs the
/// pre-pass, then `execute`, then appends the capture step and normalizes
/// the outcome.
pub(crate) fn drive(
    backend: BackendKind,
    settings: &RunSettings,
    namespace: &Namespace,
    source: &str,
    capture_frame: bool,
    grace_period: Duration,
    execute: Execute,
) -> ExecResult {
    let settings = settings.clone();
    let source = source.to_string();
    let outcome = namespace.execute(move |host| {
        run_on_host(host, backend, settings, &source, capture_frame, grace_period, execute)
    });
    outcome.unwrap_or_else(|err| {
        warn!(error = %err, "namespace runtime unavailable");
        ExecResult::failure(ErrorKind::HostFailure, String::new(), format!("{err}\n"))
    })
}

fn run_on_host(
    host: &VmHost,
    backend: BackendKind,
    settings: RunSettings,
    source: &str,
    capture_frame: bool,
    grace_period: Duration,
    execute: Execute,
) -> ExecResult {
    let span = debug_span!("run", backend = %backend, bytes = source.len());
    let _guard = span.enter();
    let started = Instant::now();
    let policy = settings.policy.clone();
    host.state.begin_run(settings, source);

    let failure = host.enter(|vm| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let prepared = syntax::prepare(source, &policy)?;
            execute(host, vm, &prepared)?;
            match host.state.exhausted() {
                Some(limit) => Err(RunFailure::Limit(limit)),
                None => Ok(()),
            }
        }))
        .unwrap_or_else(|payload| {
            let err = anyhow::anyhow!("interpreter failure: {}", panic_text(payload));
            Err(RunFailure::Host(err.context("the script runtime stopped unexpectedly")))
        });
        outcome.err().map(|failure| {
            if let RunFailure::Host(err) = &failure {
                warn!(error = %format!("{err:#}"), "host failure during run");
            }
            (failure.kind(host, vm), failure.render(host, vm, source))
        })
    });
    host.state.end_run();

    let result = match failure {
        None => {
            if capture_frame {
                let capture = host.state.capture_after_grace(grace_period);
                if !capture.is_success() {
                    warn!(error = %ErrorKind::CaptureFailure, "frame requested but not captured");
                }
            }
            let (stdout, stderr) = host.state.output();
            ExecResult::success(stdout, stderr, host.state.take_frame())
        }
        Some((kind, text)) => {
            host.state.write(Channel::Stderr, &text);
            host.state.take_frame();
            let (stdout, stderr) = host.state.output();
            ExecResult::failure(kind, stdout, stderr)
        }
    };

    let (steps, peak_depth) = host.state.usage();
    debug!(
        exit_code = result.exit_code,
        steps,
        peak_depth,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    result
}
