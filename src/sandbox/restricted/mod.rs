//! Restricted backend: rewrite, compile, execute.
//!
//! The submission goes through the restricting rewrite, which routes reads
//! through guards and rejects `__` names. What is left is compiled by the
//! interpreter and runs with the full language: decorators, generators,
//! `with` and `match` included.

pub mod transform;

use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use rustpython_vm::builtins::{PyBaseExceptionRef, PyCode};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyRef, PyResult, TryFromObject, VirtualMachine};
use tracing::debug;

use crate::sandbox::config::BackendKind;
use crate::sandbox::context::RunSettings;
use crate::sandbox::executor::{self, ExecResult, ExecutorBackend, RunFailure};
use crate::sandbox::namespace::Namespace;
use crate::sandbox::runtime::{tick_native, VmHost};
use crate::sandbox::syntax::Prepared;

/// Rewrite helpers served from the support scope, by builtin name.
const SUPPORT_HELPERS: &[(&str, &str)] = &[
    ("_getattr_", "AttrGuard"),
    ("_getitem_", "ItemGuard"),
    ("_inplace_", "AugTarget"),
    ("_operand_", "Operand"),
    ("_augcheck_", "augcheck"),
    ("_getiter_", "TickIter"),
    ("_factory_", "guard_factory"),
];

/// Interpreter frames a run may use on top of the script's own calls.
const SUPPORT_FRAMES: usize = 64;

#[derive(Debug)]
pub struct RestrictedBackend {
    settings: RunSettings,
    last_frame: Option<String>,
}

impl RestrictedBackend {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            last_frame: None,
        }
    }
}

fn string_arg(args: &FuncArgs, index: usize, vm: &VirtualMachine) -> PyResult<String> {
    let value = args
        .args
        .get(index)
        .cloned()
        .ok_or_else(|| vm.new_type_error("missing module name".to_string()))?;
    String::try_from_object(vm, value)
}

/// Installs the builtins the rewritten source calls.
fn install_helpers(host: &VmHost, vm: &VirtualMachine) -> PyResult<()> {
    let builtins = vm.builtins.as_object();
    for (name, helper) in SUPPORT_HELPERS {
        builtins.set_attr(*name, host.support.get(vm, helper)?, vm)?;
    }
    builtins.set_attr("_tick_", tick_native(vm, &host.state, &host.timeout_type), vm)?;

    let (state, support) = (Rc::clone(&host.state), host.support.clone());
    let import = vm.new_function("_import_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let name = string_arg(&args, 0, vm)?;
        let leaf = args.args.get(1).map_or(Ok(false), |v| v.clone().try_to_bool(vm))?;
        let resolved = state.resolve_import(vm, &support, &name)?;
        Ok(if leaf { resolved.leaf } else { resolved.top })
    });
    builtins.set_attr("_import_", import, vm)?;

    let (state, support) = (Rc::clone(&host.state), host.support.clone());
    let import_from = vm.new_function("_import_from_", move |args: FuncArgs, vm: &VirtualMachine| {
        let module = string_arg(&args, 0, vm)?;
        let names = args.args.get(1).cloned().unwrap_or_else(|| vm.ctx.none());
        let names = Vec::<String>::try_from_object(vm, names)?;
        let values = state.import_names(vm, &support, &module, &names)?;
        Ok::<PyObjectRef, PyBaseExceptionRef>(vm.ctx.new_tuple(values).into())
    });
    builtins.set_attr("_import_from_", import_from, vm)?;

    let (state, support, globals) = (Rc::clone(&host.state), host.support.clone(), host.globals.clone());
    let import_star = vm.new_function("_import_star_", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<()> {
        let module = string_arg(&args, 0, vm)?;
        for (name, value) in state.import_star(vm, &support, &module)? {
            globals.set_item(name.as_str(), value, vm)?;
        }
        Ok(())
    });
    builtins.set_attr("_import_star_", import_star, vm)?;
    Ok(())
}

/// Compiles the rewritten source. Errors only the compiler finds, such as
/// `return` outside a function, are reported against the original text.
fn compile(
    host: &VmHost,
    vm: &VirtualMachine,
    prepared: &Prepared,
    rewritten: &str,
) -> Result<PyRef<PyCode>, RunFailure> {
    match host.support.call(vm, "compile_user", (vm.ctx.new_str(rewritten),)) {
        Ok(code) => code
            .downcast::<PyCode>()
            .map_err(|_| RunFailure::Host(anyhow!("compiling user code did not produce a code object"))),
        Err(exc) if exc.as_object().fast_isinstance(vm.ctx.exceptions.syntax_error) => {
            let (line, offset, message): (usize, usize, String) =
                host.support.call_json(vm, "syntax_error_json", (exc,))?;
            let index = line.saturating_sub(1);
            let unchanged = prepared.source.lines().nth(index) == rewritten.lines().nth(index);
            Err(RunFailure::Syntax {
                line,
                col: if unchanged { offset } else { 0 },
                message,
            })
        }
        Err(exc) => Err(exc.into()),
    }
}

fn execute(host: &VmHost, vm: &VirtualMachine, prepared: &Prepared) -> Result<(), RunFailure> {
    let rewritten = transform::restrict(prepared).map_err(|errors| {
        debug!(errors = errors.len(), "restricted rewrite refused the submission");
        RunFailure::Compile(errors)
    })?;
    install_helpers(host, vm)?;
    let code = compile(host, vm, prepared, &rewritten)?;
    debug!(bytes = rewritten.len(), "restricted code compiled");

    let depth = host.state.config(|c| c.recursion_limit) + SUPPORT_FRAMES;
    host.support.call(vm, "set_recursion_limit", (vm.ctx.new_int(depth),))?;
    host.support
        .call(vm, "set_profile", (tick_native(vm, &host.state, &host.timeout_type),))?;
    let outcome = vm.run_code_obj(code, host.scope(vm));
    host.support.call(vm, "set_profile", (vm.ctx.none(),))?;
    outcome?;
    Ok(())
}

impl ExecutorBackend for RestrictedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Restricted
    }

    fn run(
        &mut self,
        namespace: &Namespace,
        source: &str,
        capture_frame: bool,
        grace_period: Duration,
    ) -> ExecResult {
        self.clear_captured_frame();
        let result = executor::drive(
            BackendKind::Restricted,
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
