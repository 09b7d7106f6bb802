//! The script runtime behind a namespace: one RustPython interpreter, the
//! private support scope compiled from `support.py`, and the host natives
//! that connect the two to [`HostState`].
//!
//! Natives capture an `Rc<HostState>` and read it per call, so the same
//! interpreter serves every run of a session.

use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use rustpython_vm::builtins::{PyBaseException, PyBaseExceptionRef, PyDictRef, PyTypeRef};
use rustpython_vm::compiler::Mode;
use rustpython_vm::function::{FuncArgs, IntoFuncArgs};
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, Settings, TryFromObject, VirtualMachine};
use tracing::debug;

use crate::sandbox::context::HostState;
use crate::sandbox::guards::{guarded_builtins, GuardMode, Guards};
use crate::sandbox::io::Channel;
use crate::sandbox::limits::LimitExceeded;

/// File name user code is compiled under, as tracebacks show it.
pub const USER_FILE: &str = "<user_code>";

const SUPPORT_SOURCE: &str = include_str!("support.py");
const SUPPORT_FILE: &str = "<sandbox-support>";

/// Builtins refused in every frame while a run is active.
const HOST_ONLY_BUILTINS: &[&str] = &["open", "input", "breakpoint", "exit", "quit", "help"];

/// Builtins refused when compiled user code calls them directly. Library
/// code, `dataclasses` for one, still uses them.
const USER_REFUSED_BUILTINS: &[&str] = &["compile", "eval", "exec", "globals", "locals", "vars"];

const CAUSE_SEPARATOR: &str =
    "\nThe above exception was the direct cause of the following exception:\n\n";
const CONTEXT_SEPARATOR: &str =
    "\nDuring handling of the above exception, another exception occurred:\n\n";

/// Handle to the helper scope compiled from `support.py`.
#[derive(Clone)]
pub struct Support {
    scope: PyDictRef,
}

impl Support {
    pub fn get(&self, vm: &VirtualMachine, name: &str) -> PyResult<PyObjectRef> {
        self.scope
            .get_item_opt(name, vm)?
            .ok_or_else(|| vm.new_name_error(format!("support helper '{name}' is missing"), vm.ctx.new_str(name)))
    }

    pub fn set(&self, vm: &VirtualMachine, name: &str, value: impl Into<PyObjectRef>) -> PyResult<()> {
        self.scope.set_item(name, value.into(), vm)
    }

    pub fn call(&self, vm: &VirtualMachine, name: &str, args: impl IntoFuncArgs) -> PyResult<PyObjectRef> {
        self.get(vm, name)?.call(args, vm)
    }

    /// Calls a helper that answers with JSON text.
    pub fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        vm: &VirtualMachine,
        name: &str,
        args: impl IntoFuncArgs,
    ) -> PyResult<T> {
        let text = String::try_from_object(vm, self.call(vm, name, args)?)?;
        serde_json::from_str(&text).map_err(|err| vm.new_value_error(format!("{name}: {err}")))
    }
}

/// One interpreter with everything the backends need installed.
pub struct VmHost {
    pub state: Rc<HostState>,
    pub support: Support,
    /// The session globals user code runs in.
    pub globals: PyDictRef,
    /// Raised when time or fuel runs out; derives from `BaseException` only.
    pub timeout_type: PyTypeRef,
    frame_types: Vec<usize>,
    generator_types: Vec<usize>,
    interpreter: Interpreter,
}

struct Parts {
    support: Support,
    globals: PyDictRef,
    timeout_type: PyTypeRef,
    frame_types: Vec<usize>,
    generator_types: Vec<usize>,
}

impl VmHost {
    pub fn new() -> anyhow::Result<Self> {
        let interpreter = Interpreter::with_init(Settings::default(), |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
            vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
        });
        let state = Rc::new(HostState::new());
        let parts = interpreter.enter(|vm| {
            build(vm, &state).map_err(|exc| {
                let mut text = String::new();
                let _ = vm.write_exception(&mut text, &exc);
                anyhow!("script runtime failed to start: {}", text.trim_end())
            })
        })?;
        debug!("script runtime ready");
        Ok(Self {
            state,
            support: parts.support,
            globals: parts.globals,
            timeout_type: parts.timeout_type,
            frame_types: parts.frame_types,
            generator_types: parts.generator_types,
            interpreter,
        })
    }

    pub fn enter<R>(&self, f: impl FnOnce(&VirtualMachine) -> R) -> R {
        self.interpreter.enter(f)
    }

    /// The scope user code runs in.
    pub fn scope(&self, vm: &VirtualMachine) -> Scope {
        Scope::with_builtins(None, self.globals.clone(), vm)
    }

    pub fn guards(&self, mode: GuardMode) -> Guards {
        Guards::new(
            mode,
            self.frame_types.clone(),
            self.generator_types.clone(),
            Rc::clone(&self.state),
        )
    }

    pub fn is_timeout(&self, exc: &PyBaseExceptionRef) -> bool {
        exc.as_object().class().as_object().get_id() == self.timeout_type.as_object().get_id()
    }

    pub fn limit_exception(&self, vm: &VirtualMachine, limit: LimitExceeded) -> PyBaseExceptionRef {
        limit_exception(vm, &self.timeout_type, limit)
    }

    pub fn render(&self, vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
        render_exception(&self.state, &self.support, vm, exc)
    }
}

impl Drop for VmHost {
    fn drop(&mut self) {
        self.state.clear();
        self.interpreter.enter(|_vm| {
            self.globals.clear();
        });
    }
}

fn build(vm: &VirtualMachine, state: &Rc<HostState>) -> PyResult<Parts> {
    let support_scope = vm.new_scope_with_builtins();
    let code = vm
        .compile(SUPPORT_SOURCE, Mode::Exec, SUPPORT_FILE.to_owned())
        .map_err(|err| vm.new_exception_msg(vm.ctx.exceptions.syntax_error.to_owned(), err.to_string()))?;
    vm.run_code_obj(code, support_scope.clone())?;
    let support = Support {
        scope: support_scope.globals.clone(),
    };

    let timeout_type = vm.ctx.new_exception_type(
        "builtins",
        "TimeoutError",
        Some(vec![vm.ctx.exceptions.base_exception_type.to_owned()]),
    );
    let type_ids = |name: &str| -> PyResult<Vec<usize>> {
        let types = Vec::<PyObjectRef>::try_from_object(vm, support.get(vm, name)?)?;
        Ok(types.iter().map(|t| t.get_id()).collect())
    };
    let frame_types = type_ids("FRAME_TYPES")?;
    let generator_types = type_ids("GENERATOR_TYPES")?;
    let guards = Rc::new(Guards::new(
        GuardMode::Restricted,
        frame_types.clone(),
        generator_types.clone(),
        Rc::clone(state),
    ));

    install_support_natives(vm, state, &support, &timeout_type, &guards)?;
    support.call(vm, "install", FuncArgs::default())?;
    apply_type_patches(vm, &support)?;
    install_builtins(vm, state, &support, &guards)?;
    register_view_replacements(vm, state, &support, &timeout_type);

    let globals = vm.ctx.new_dict();
    globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
    // `time` is bound without an import; the capture step needs it.
    let time = state.resolve_import(vm, &support, "time")?;
    globals.set_item("time", time.top, vm)?;

    Ok(Parts {
        support,
        globals,
        timeout_type,
        frame_types,
        generator_types,
    })
}

pub(crate) fn limit_exception(vm: &VirtualMachine, timeout_type: &PyTypeRef, limit: LimitExceeded) -> PyBaseExceptionRef {
    match limit {
        LimitExceeded::Depth(_) => {
            vm.new_exception_msg(vm.ctx.exceptions.recursion_error.to_owned(), limit.to_string())
        }
        _ => vm.new_exception_msg(timeout_type.clone(), limit.to_string()),
    }
}

/// The per-step charge used by loop guards and the call profiler.
pub(crate) fn tick_native(vm: &VirtualMachine, state: &Rc<HostState>, timeout_type: &PyTypeRef) -> PyObjectRef {
    let state = Rc::clone(state);
    let timeout_type = timeout_type.clone();
    vm.new_function("_tick_", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<bool> {
        state
            .tick()
            .map_err(|limit| limit_exception(vm, &timeout_type, limit))?;
        Ok(true)
    })
    .into()
}

fn first_arg(args: &FuncArgs, vm: &VirtualMachine, name: &str) -> PyResult<PyObjectRef> {
    args.args
        .first()
        .cloned()
        .ok_or_else(|| vm.new_type_error(format!("{name}() missing required argument")))
}

fn install_support_natives(
    vm: &VirtualMachine,
    state: &Rc<HostState>,
    support: &Support,
    timeout_type: &PyTypeRef,
    guards: &Rc<Guards>,
) -> PyResult<()> {
    let limit_state = Rc::clone(state);
    support.set(
        vm,
        "_allocation_limit_",
        vm.new_function("_allocation_limit_", move |_args: FuncArgs, vm: &VirtualMachine| {
            vm.ctx.new_int(limit_state.config(|c| c.max_allocation_bytes))
        }),
    )?;
    support.set(vm, "_tick_", tick_native(vm, state, timeout_type))?;

    let attr_guards = Rc::clone(guards);
    support.set(
        vm,
        "_guarded_getattr_",
        vm.new_function("_guarded_getattr_", move |args: FuncArgs, vm: &VirtualMachine| {
            let target = first_arg(&args, vm, "getattr")?;
            let name = args.args.get(1).cloned().unwrap_or_else(|| vm.ctx.none());
            let name = String::try_from_object(vm, name)?;
            attr_guards.getattr(vm, &target, &name)
        }),
    )?;
    let item_guards = Rc::clone(guards);
    support.set(
        vm,
        "_guarded_getitem_",
        vm.new_function("_guarded_getitem_", move |args: FuncArgs, vm: &VirtualMachine| {
            let target = first_arg(&args, vm, "getitem")?;
            let key = args.args.get(1).cloned().unwrap_or_else(|| vm.ctx.none());
            item_guards.getitem(vm, &target, key)
        }),
    )?;

    for (name, channel) in [("_write_stdout_", Channel::Stdout), ("_write_stderr_", Channel::Stderr)] {
        let state = Rc::clone(state);
        let writer = vm.new_function(name, move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<()> {
            let text = first_arg(&args, vm, "write")?.str(vm)?;
            state.write(channel, text.as_str());
            Ok(())
        });
        support.set(vm, name, writer)?;
    }
    Ok(())
}

fn apply_type_patches(vm: &VirtualMachine, support: &Support) -> PyResult<()> {
    let patches = Vec::<Vec<PyObjectRef>>::try_from_object(vm, support.call(vm, "type_patches", FuncArgs::default())?)?;
    for patch in patches {
        let [class, name, wrapper] = <[PyObjectRef; 3]>::try_from(patch)
            .map_err(|_| vm.new_type_error("malformed type patch".to_string()))?;
        let class = PyTypeRef::try_from_object(vm, class)?;
        let name = String::try_from_object(vm, name)?;
        class.set_attr(vm.ctx.intern_str(name), wrapper);
    }
    Ok(())
}

/// The traceback text of `traceback.format_exc()` at this point of a run.
pub(crate) fn format_exc(state: &HostState, support: &Support, vm: &VirtualMachine) -> String {
    let current = state.handled_exception().or_else(|| {
        support
            .call(vm, "current_exception", FuncArgs::default())
            .ok()
            .and_then(|exc| exc.downcast::<PyBaseException>().ok())
    });
    match current {
        Some(exc) => render_exception(state, support, vm, &exc),
        None => "NoneType: None\n".to_string(),
    }
}

/// Whether the innermost running frame belongs to compiled user code.
pub(crate) fn called_from_user_code(vm: &VirtualMachine) -> bool {
    vm.current_frame()
        .map_or(false, |frame| frame.code.source_path.as_str() == USER_FILE)
}

fn install_builtins(vm: &VirtualMachine, state: &Rc<HostState>, support: &Support, guards: &Rc<Guards>) -> PyResult<()> {
    let builtins = vm.builtins.as_object();

    let (exc_state, exc_support) = (Rc::clone(state), support.clone());
    builtins.set_attr(
        "format_exc",
        vm.new_function("format_exc", move |_args: FuncArgs, vm: &VirtualMachine| {
            format_exc(&exc_state, &exc_support, vm)
        }),
        vm,
    )?;

    let json_support = support.clone();
    builtins.set_attr(
        "safe_json_dumps",
        vm.new_function("safe_json_dumps", move |args: FuncArgs, vm: &VirtualMachine| {
            let value = first_arg(&args, vm, "safe_json_dumps")?;
            json_support.call(vm, "safe_json_dumps", (value,))
        }),
        vm,
    )?;

    let capture_state = Rc::clone(state);
    builtins.set_attr(
        "capture_frame",
        vm.new_function("capture_frame", move |_args: FuncArgs, vm: &VirtualMachine| -> PyObjectRef {
            match capture_state.capture_now() {
                Some(payload) => vm.ctx.new_str(payload).into(),
                None => vm.ctx.none(),
            }
        }),
        vm,
    )?;

    for name in HOST_ONLY_BUILTINS {
        let Ok(original) = builtins.get_attr(*name, vm) else {
            continue;
        };
        let state = Rc::clone(state);
        let name: &'static str = name;
        let wrapper = vm.new_function(name, move |args: FuncArgs, vm: &VirtualMachine| {
            if state.is_running() {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.permission_error.to_owned(),
                    format!("{name}() is not available in the sandbox"),
                ));
            }
            original.call(args, vm)
        });
        builtins.set_attr(name, wrapper, vm)?;
    }

    for name in USER_REFUSED_BUILTINS {
        let Ok(original) = builtins.get_attr(*name, vm) else {
            continue;
        };
        let name: &'static str = name;
        let wrapper = vm.new_function(name, move |args: FuncArgs, vm: &VirtualMachine| {
            if called_from_user_code(vm) {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.permission_error.to_owned(),
                    format!("{name}() is not available in the sandbox"),
                ));
            }
            original.call(args, vm)
        });
        builtins.set_attr(name, wrapper, vm)?;
    }

    // Compiled user code reaches attributes by name through the guards.
    for (name, guarded) in guarded_builtins(vm, guards, support)? {
        let original = builtins.get_attr(name, vm)?;
        let wrapper = vm.new_function(name, move |args: FuncArgs, vm: &VirtualMachine| {
            if called_from_user_code(vm) {
                guarded.call(args, vm)
            } else {
                original.call(args, vm)
            }
        });
        builtins.set_attr(name, wrapper, vm)?;
    }
    Ok(())
}

fn register_view_replacements(
    vm: &VirtualMachine,
    state: &Rc<HostState>,
    support: &Support,
    timeout_type: &PyTypeRef,
) {
    let (exc_state, exc_support) = (Rc::clone(state), support.clone());
    state.replace_in_views(
        "traceback",
        "format_exc",
        vm.new_function("format_exc", move |_args: FuncArgs, vm: &VirtualMachine| {
            format_exc(&exc_state, &exc_support, vm)
        })
        .into(),
    );

    let (print_state, print_support) = (Rc::clone(state), support.clone());
    state.replace_in_views(
        "traceback",
        "print_exc",
        vm.new_function("print_exc", move |_args: FuncArgs, vm: &VirtualMachine| {
            let text = format_exc(&print_state, &print_support, vm);
            print_state.write(Channel::Stderr, &text);
        })
        .into(),
    );

    let (sleep_state, timeout_type) = (Rc::clone(state), timeout_type.clone());
    state.replace_in_views(
        "time",
        "sleep",
        vm.new_function("sleep", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<()> {
            let seconds = first_arg(&args, vm, "sleep")?.try_float(vm)?.to_f64();
            if seconds.is_nan() || seconds < 0.0 {
                return Err(vm.new_value_error("sleep length must be non-negative".to_string()));
            }
            let wanted = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
            match sleep_state.admit_sleep(wanted) {
                Ok(duration) => {
                    std::thread::sleep(duration);
                    Ok(())
                }
                Err(remaining) => {
                    std::thread::sleep(remaining);
                    let limit = sleep_state
                        .exhausted()
                        .unwrap_or(LimitExceeded::Time(remaining));
                    Err(limit_exception(vm, &timeout_type, limit))
                }
            }
        })
        .into(),
    );
}

/// `Type: message`, with the module prefix for non-builtin classes.
pub(crate) fn exception_only(support: &Support, vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    support
        .call(vm, "format_exception_only", (exc.clone(),))
        .and_then(|line| String::try_from_object(vm, line))
        .unwrap_or_else(|_| exc.as_object().class().name().to_string())
}

#[cfg(test)]
pub(crate) fn exception_line(host: &VmHost, vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    exception_only(&host.support, vm, exc)
}

/// Renders `exc` with its cause and context chain, the way the standard
/// traceback printer lays it out.
pub(crate) fn render_exception(
    state: &HostState,
    support: &Support,
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> String {
    match render_chain(state, support, vm, exc) {
        Ok(text) => text,
        Err(_) => {
            let mut text = String::new();
            let _ = vm.write_exception(&mut text, exc);
            text
        }
    }
}

fn render_chain(
    state: &HostState,
    support: &Support,
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> PyResult<String> {
    let chain = Vec::<Vec<PyObjectRef>>::try_from_object(vm, support.call(vm, "exception_chain", (exc.clone(),))?)?;
    let mut out = String::new();
    for (index, entry) in chain.into_iter().enumerate() {
        let [member, link] = <[PyObjectRef; 2]>::try_from(entry)
            .map_err(|_| vm.new_type_error("malformed exception chain".to_string()))?;
        let member = member
            .downcast::<PyBaseException>()
            .map_err(|_| vm.new_type_error("exception chain holds a non-exception".to_string()))?;
        if index > 0 {
            let link = Option::<String>::try_from_object(vm, link)?;
            out.push_str(match link.as_deref() {
                Some("cause") => CAUSE_SEPARATOR,
                _ => CONTEXT_SEPARATOR,
            });
        }
        out.push_str(&render_block(state, support, vm, &member)?);
    }
    Ok(out)
}

fn render_block(
    state: &HostState,
    support: &Support,
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> PyResult<String> {
    let mut frames: Vec<(usize, String, Option<String>)> = state
        .trace_for(exc)
        .into_iter()
        .map(|entry| (entry.line, entry.name, entry.text))
        .collect();
    let compiled: Vec<(usize, String)> = support.call_json(vm, "user_frames", (exc.clone(),))?;
    frames.extend(compiled.into_iter().map(|(line, name)| (line, name, None)));

    let mut out = String::new();
    if !frames.is_empty() {
        out.push_str("Traceback (most recent call last):\n");
        for (line, name, text) in frames {
            out.push_str(&format!("  File \"{USER_FILE}\", line {line}, in {name}\n"));
            if let Some(text) = text.or_else(|| state.source_line(line)) {
                let text = text.trim();
                if !text.is_empty() {
                    out.push_str(&format!("    {text}\n"));
                }
            }
        }
    }
    out.push_str(&exception_only(support, vm, exc));
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::context::RunSettings;

    fn run(host: &VmHost, vm: &VirtualMachine, source: &str) -> PyResult<PyObjectRef> {
        let code = vm
            .compile(source, Mode::Exec, USER_FILE.to_owned())
            .map_err(|err| vm.new_exception_msg(vm.ctx.exceptions.syntax_error.to_owned(), err.to_string()))?;
        vm.run_code_obj(code, host.scope(vm))
    }

    #[test]
    fn test_support_scope_is_private() {
        let host = VmHost::new().unwrap();
        host.enter(|vm| {
            assert!(host.globals.get_item_opt("binop", vm).unwrap().is_none());
            assert!(host.support.get(vm, "binop").is_ok());
        });
    }

    #[test]
    fn test_print_goes_to_host_sinks() {
        let host = VmHost::new().unwrap();
        host.state.begin_run(RunSettings::default(), "");
        host.enter(|vm| run(&host, vm, "import sys\nprint('out')\nprint('err', file=sys.stderr)\n").unwrap());
        host.state.end_run();
        assert_eq!(host.state.output(), ("out\n".to_string(), "err\n".to_string()));
    }

    #[test]
    fn test_width_patches_raise_memory_error() {
        let host = VmHost::new().unwrap();
        host.state.begin_run(RunSettings::default(), "");
        let lines: Vec<String> = host.enter(|vm| {
            ["'x'.ljust(10**12)", "'7'.zfill(10**12)", "f'{1:>1000000000000}'", "b'ab'.center(10**12)"]
                .iter()
                .map(|expr| {
                    let exc = run(&host, vm, &format!("_ = {expr}\n")).unwrap_err();
                    exception_only(&host.support, vm, &exc)
                })
                .collect()
        });
        for line in lines {
            assert!(line.starts_with("MemoryError: allocation of"), "{line}");
        }
    }

    #[test]
    fn test_chained_exception_rendering() {
        let host = VmHost::new().unwrap();
        let source = "try:\n    1 / 0\nexcept ZeroDivisionError as e:\n    raise ValueError('bad') from e\n";
        host.state.begin_run(RunSettings::default(), source);
        let text = host.enter(|vm| {
            let exc = run(&host, vm, source).unwrap_err();
            host.render(vm, &exc)
        });
        assert_eq!(
            text,
            format!(
                "Traceback (most recent call last):\n  File \"<user_code>\", line 2, in <module>\n    1 / 0\nZeroDivisionError: division by zero\n{CAUSE_SEPARATOR}Traceback (most recent call last):\n  File \"<user_code>\", line 4, in <module>\n    raise ValueError('bad') from e\nValueError: bad\n"
            )
        );
    }

    #[test]
    fn test_host_only_builtins_refused_during_run() {
        let host = VmHost::new().unwrap();
        host.state.begin_run(RunSettings::default(), "");
        let line = host.enter(|vm| {
            let exc = run(&host, vm, "open('/etc/passwd')\n").unwrap_err();
            exception_only(&host.support, vm, &exc)
        });
        assert_eq!(line, "PermissionError: open() is not available in the sandbox");
    }

    #[test]
    fn test_user_frames_get_guarded_builtins() {
        let host = VmHost::new().unwrap();
        host.state.begin_run(RunSettings::default(), "");
        let lines: Vec<String> = host.enter(|vm| {
            ["eval('1')", "getattr([], '__class__')", "hasattr(print, '__self__')"]
                .iter()
                .map(|expr| {
                    let exc = run(&host, vm, &format!("_ = {expr}\n")).unwrap_err();
                    exception_only(&host.support, vm, &exc)
                })
                .collect()
        });
        assert_eq!(lines[0], "PermissionError: eval() is not available in the sandbox");
        assert!(lines[1].contains("\"__class__\" is an invalid attribute name"), "{}", lines[1]);
        assert!(lines[2].contains("__self__"), "{}", lines[2]);
    }

    #[test]
    fn test_time_is_prebound() {
        let host = VmHost::new().unwrap();
        assert_eq!(host.state.loaded_modules(), vec!["time"]);
        host.enter(|vm| assert!(host.globals.get_item_opt("time", vm).unwrap().is_some()));
    }
}
