//! Attribute and item access checks shared by both backends.
//!
//! The walker calls these for every attribute and subscript it evaluates;
//! restricted code reaches them through the proxies its rewrite inserts
//! and through the builtins that take attribute names.
//! Three kinds of access are refused: dunder names, anything on frame,
//! code and traceback objects, and the frame-bearing attributes of
//! generators. A module reached through an attribute is handed out only
//! when the import machinery produced it.

use std::rc::Rc;

use rustpython_vm::builtins::{PyModule, PyStr};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};

use crate::sandbox::context::HostState;
use crate::sandbox::runtime::Support;

/// Dunder attributes restricted code may still read.
pub const SAFE_DUNDERS: &[&str] = &["__doc__", "__init__", "__module__", "__name__", "__qualname__"];

const GENERATOR_FRAME_PREFIXES: &[&str] = &["gi_", "cr_", "ag_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Message style of compile-time name checks; [`SAFE_DUNDERS`] allowed.
    Restricted,
    /// Every dunder refused.
    Interpreted,
}

/// Why a dunder attribute name is refused, `None` when it is allowed.
pub fn attribute_refusal(mode: GuardMode, name: &str) -> Option<String> {
    if !name.starts_with("__") {
        return None;
    }
    match mode {
        GuardMode::Restricted if SAFE_DUNDERS.contains(&name) => None,
        GuardMode::Restricted => Some(format!(
            "\"{name}\" is an invalid attribute name because it starts with \"__\"."
        )),
        GuardMode::Interpreted => Some(format!("Forbidden access to dunder attribute: {name}")),
    }
}

pub struct Guards {
    mode: GuardMode,
    frame_types: Vec<usize>,
    generator_types: Vec<usize>,
    state: Rc<HostState>,
}

impl Guards {
    pub fn new(mode: GuardMode, frame_types: Vec<usize>, generator_types: Vec<usize>, state: Rc<HostState>) -> Self {
        Self {
            mode,
            frame_types,
            generator_types,
            state,
        }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// `obj.name`, or the `AttributeError` explaining the refusal.
    pub fn getattr(&self, vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
        if let Some(message) = attribute_refusal(self.mode, name) {
            return Err(vm.new_attribute_error(message));
        }
        let class = obj.class();
        let class_id = class.as_object().get_id();
        let refused = self.frame_types.contains(&class_id)
            || (self.generator_types.contains(&class_id)
                && GENERATOR_FRAME_PREFIXES.iter().any(|p| name.starts_with(p)));
        if refused {
            let type_name = class.name().to_string();
            return Err(vm.new_attribute_error(format!(
                "Forbidden access to attribute '{name}' of {type_name} objects"
            )));
        }
        let value = obj.get_attr(&vm.ctx.new_str(name), vm)?;
        self.check_module(vm, value, name)
    }

    /// `obj[key]`; dunder string keys are refused.
    pub fn getitem(&self, vm: &VirtualMachine, obj: &PyObjectRef, key: PyObjectRef) -> PyResult<PyObjectRef> {
        if let Some(text) = key.payload::<PyStr>() {
            if text.as_str().starts_with("__") {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.key_error.to_owned(),
                    format!("Forbidden access to dunder key: {}", text.as_str()),
                ));
            }
        }
        let value = obj.get_item(&*key, vm)?;
        self.check_module(vm, value, "item")
    }

    fn check_module(&self, vm: &VirtualMachine, value: PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
        if value.payload::<PyModule>().is_some() && !self.state.is_allowed_module(value.get_id()) {
            return Err(vm.new_attribute_error(format!(
                "Forbidden access to module through attribute '{name}'"
            )));
        }
        Ok(value)
    }
}

/// Replacements for the builtins that reach attributes by name: they go
/// through `guards`, and two-argument `pow` through the size checks.
pub fn guarded_builtins(
    vm: &VirtualMachine,
    guards: &Rc<Guards>,
    support: &Support,
) -> PyResult<Vec<(&'static str, PyObjectRef)>> {
    let mode = guards.mode();
    let mut overrides: Vec<(&'static str, PyObjectRef)> = Vec::with_capacity(5);
    let name_arg = |args: &FuncArgs, index: usize, vm: &VirtualMachine| -> PyResult<String> {
        let value = args
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| vm.new_type_error("missing attribute name".to_string()))?;
        String::try_from_object(vm, value)
    };
    let refuse = move |name: &str, vm: &VirtualMachine| -> PyResult<()> {
        match attribute_refusal(mode, name) {
            Some(message) => Err(vm.new_attribute_error(message)),
            None => Ok(()),
        }
    };

    let getattr_guards = Rc::clone(guards);
    let getattr = vm.new_function("getattr", move |args: FuncArgs, vm: &VirtualMachine| {
        let target = args.args.first().cloned().unwrap_or_else(|| vm.ctx.none());
        let name = name_arg(&args, 1, vm)?;
        match (getattr_guards.getattr(vm, &target, &name), args.args.get(2)) {
            (Err(exc), Some(default))
                if attribute_refusal(mode, &name).is_none()
                    && exc.as_object().fast_isinstance(vm.ctx.exceptions.attribute_error) =>
            {
                Ok(default.clone())
            }
            (result, _) => result,
        }
    });
    overrides.push(("getattr", getattr.into()));

    let hasattr_guards = Rc::clone(guards);
    let hasattr = vm.new_function("hasattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<bool> {
        let target = args.args.first().cloned().unwrap_or_else(|| vm.ctx.none());
        let name = name_arg(&args, 1, vm)?;
        refuse(&name, vm)?;
        match hasattr_guards.getattr(vm, &target, &name) {
            Ok(_) => Ok(true),
            Err(exc) if exc.as_object().fast_isinstance(vm.ctx.exceptions.attribute_error) => Ok(false),
            Err(exc) => Err(exc),
        }
    });
    overrides.push(("hasattr", hasattr.into()));

    let setattr = vm.new_function("setattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<()> {
        let target = args.args.first().cloned().unwrap_or_else(|| vm.ctx.none());
        let name = name_arg(&args, 1, vm)?;
        refuse(&name, vm)?;
        let value = args.args.get(2).cloned().unwrap_or_else(|| vm.ctx.none());
        target.set_attr(&vm.ctx.new_str(name.as_str()), value, vm)
    });
    overrides.push(("setattr", setattr.into()));

    let delattr = vm.new_function("delattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<()> {
        let target = args.args.first().cloned().unwrap_or_else(|| vm.ctx.none());
        let name = name_arg(&args, 1, vm)?;
        refuse(&name, vm)?;
        target.del_attr(&vm.ctx.new_str(name.as_str()), vm)
    });
    overrides.push(("delattr", delattr.into()));

    let pow_support = support.clone();
    let builtin_pow = vm.builtins.as_object().get_attr("pow", vm)?;
    let pow = vm.new_function("pow", move |args: FuncArgs, vm: &VirtualMachine| {
        if args.args.len() == 2 && args.kwargs.is_empty() {
            let (base, exp) = (args.args[0].clone(), args.args[1].clone());
            return pow_support.call(vm, "binop", (vm.ctx.new_str("pow"), base, exp));
        }
        builtin_pow.call(args, vm)
    });
    overrides.push(("pow", pow.into()));
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_allows_safe_dunders() {
        assert_eq!(attribute_refusal(GuardMode::Restricted, "__name__"), None);
        assert_eq!(attribute_refusal(GuardMode::Restricted, "upper"), None);
        assert_eq!(
            attribute_refusal(GuardMode::Restricted, "__class__").as_deref(),
            Some("\"__class__\" is an invalid attribute name because it starts with \"__\".")
        );
    }

    #[test]
    fn test_interpreted_refuses_every_dunder() {
        assert_eq!(
            attribute_refusal(GuardMode::Interpreted, "__name__").as_deref(),
            Some("Forbidden access to dunder attribute: __name__")
        );
        assert_eq!(attribute_refusal(GuardMode::Interpreted, "_private"), None);
    }
}
