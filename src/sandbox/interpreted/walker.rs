//! Tree-walking evaluator of the interpreted backend.
//!
//! Statements and control flow are evaluated here, node by node; values,
//! operators and calls are delegated to the interpreter. Functions and
//! classes defined by a submission are real objects: a function wraps a
//! native closure that walks its body, so it can be called from later
//! submissions, passed to `sorted` or used as a method.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustpython_parser::ast::{self, Ranged};
use rustpython_vm::builtins::{PyBaseException, PyBaseExceptionRef, PyDictRef, PyType, PyTypeRef};
use rustpython_vm::function::{FuncArgs, KwArgs};
use rustpython_vm::protocol::PyIterReturn;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};

use crate::sandbox::context::{HostState, TraceEntry};
use crate::sandbox::guards::{attribute_refusal, guarded_builtins, GuardMode, Guards};
use crate::sandbox::io::Channel;
use crate::sandbox::policy::top_level;
use crate::sandbox::runtime::{limit_exception, Support, VmHost};
use crate::sandbox::syntax::{LineIndex, Prepared};

/// Builtins scripts never see from this backend.
const HIDDEN_BUILTINS: &[&str] = &[
    "breakpoint", "compile", "eval", "exec", "exit", "globals", "help", "input", "locals", "open",
    "quit", "vars",
];

/// Dunder names a script may still read and bind.
const PLAIN_DUNDER_NAMES: &[&str] = &["__doc__", "__name__"];

static NEXT_FRAME: AtomicUsize = AtomicUsize::new(1);

fn next_frame_id() -> usize {
    NEXT_FRAME.fetch_add(1, Ordering::Relaxed)
}

/// Source text the nodes of a frame point into.
struct Code {
    text: String,
    lines: LineIndex,
}

impl Code {
    fn line(&self, node: &impl Ranged) -> usize {
        self.lines.line(node.start().to_usize())
    }

    fn text_of(&self, line: usize) -> Option<String> {
        self.text.lines().nth(line.checked_sub(1)?).map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    Class,
    Comprehension,
}

struct Scope {
    kind: ScopeKind,
    vars: PyDictRef,
    parent: Option<Rc<Scope>>,
}

type ClassCell = RefCell<Option<PyObjectRef>>;

#[derive(Clone)]
struct Frame {
    id: usize,
    name: Rc<str>,
    qualname: String,
    scope: Rc<Scope>,
    code: Rc<Code>,
    /// The class whose body defined the running function, for `super()`.
    class_cell: Option<Rc<ClassCell>>,
    first_arg: Option<PyObjectRef>,
}

impl Frame {
    fn with_scope(&self, kind: ScopeKind, vars: PyDictRef) -> Frame {
        Frame {
            scope: Rc::new(Scope {
                kind,
                vars,
                parent: Some(Rc::clone(&self.scope)),
            }),
            ..self.clone()
        }
    }

    fn qualify(&self, name: &str) -> String {
        match self.scope.kind {
            ScopeKind::Module => name.to_string(),
            ScopeKind::Class => format!("{}.{name}", self.qualname),
            ScopeKind::Function | ScopeKind::Comprehension => {
                format!("{}.<locals>.{name}", self.qualname)
            }
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(PyObjectRef),
}

enum Body {
    Block(Vec<ast::Stmt>),
    Expr(ast::Expr),
}

struct FunctionPlan {
    name: Rc<str>,
    qualname: String,
    params: ast::Arguments,
    body: Body,
    positional_defaults: Vec<Option<PyObjectRef>>,
    keyword_defaults: Vec<Option<PyObjectRef>>,
    closure: Rc<Scope>,
    code: Rc<Code>,
    class_cell: Option<Rc<ClassCell>>,
}

fn operator_name(op: ast::Operator) -> &'static str {
    use ast::Operator::*;
    match op {
        Add => "add",
        Sub => "sub",
        Mult => "mul",
        MatMult => "matmul",
        Div => "truediv",
        FloorDiv => "floordiv",
        Mod => "mod",
        Pow => "pow",
        LShift => "lshift",
        RShift => "rshift",
        BitOr => "or",
        BitXor => "xor",
        BitAnd => "and",
    }
}

fn comparison_name(op: ast::CmpOp) -> &'static str {
    use ast::CmpOp::*;
    match op {
        Eq => "eq",
        NotEq => "ne",
        Lt => "lt",
        LtE => "le",
        Gt => "gt",
        GtE => "ge",
        Is => "is",
        IsNot => "is_not",
        In => "in",
        NotIn => "not_in",
    }
}

fn missing_list(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    match quoted.as_slice() {
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
        [] => String::new(),
    }
}

/// Runs a whole submission in the session globals. A trailing expression
/// statement is echoed to stdout unless it evaluates to `None`.
pub(super) fn run_module(host: &VmHost, vm: &VirtualMachine, prepared: &Prepared) -> PyResult<()> {
    let walker = Walker::new(host, vm)?;
    let frame = Frame {
        id: next_frame_id(),
        name: Rc::from("<module>"),
        qualname: String::new(),
        scope: Rc::new(Scope {
            kind: ScopeKind::Module,
            vars: host.globals.clone(),
            parent: None,
        }),
        code: Rc::new(Code {
            text: prepared.source.clone(),
            lines: prepared.lines.clone(),
        }),
        class_cell: None,
        first_arg: None,
    };

    let Some((last, init)) = prepared.suite.split_last() else {
        return Ok(());
    };
    let ast::Stmt::Expr(ast::StmtExpr { value, .. }) = last else {
        walker.exec_block(vm, &frame, &prepared.suite)?;
        return Ok(());
    };
    if let Flow::Normal = walker.exec_block(vm, &frame, init)? {
        let echoed = walker.tick(vm).and_then(|()| walker.eval(vm, &frame, value));
        let value = echoed.map_err(|exc| walker.record(&frame, last, exc))?;
        if !vm.is_none(&value) {
            let text = walker.support.call(vm, "echo_text", (value,))?;
            let text = String::try_from_object(vm, text)?;
            walker.state.write(Channel::Stdout, &format!("{text}\n"));
        }
    }
    Ok(())
}

struct Walker {
    state: Rc<HostState>,
    support: Support,
    guards: Rc<Guards>,
    timeout_type: PyTypeRef,
    factories: Vec<usize>,
    overrides: PyDictRef,
    super_id: usize,
}

impl Walker {
    fn new(host: &VmHost, vm: &VirtualMachine) -> PyResult<Rc<Self>> {
        let guards = Rc::new(host.guards(GuardMode::Interpreted));
        let factories = Vec::<PyObjectRef>::try_from_object(vm, host.support.get(vm, "_FACTORIES")?)?
            .iter()
            .map(|f| f.get_id())
            .collect();
        let super_id = vm.builtins.as_object().get_attr("super", vm)?.get_id();
        let overrides = vm.ctx.new_dict();
        for (name, replacement) in guarded_builtins(vm, &guards, &host.support)? {
            overrides.set_item(name, replacement, vm)?;
        }
        Ok(Rc::new(Self {
            state: Rc::clone(&host.state),
            support: host.support.clone(),
            guards,
            timeout_type: host.timeout_type.clone(),
            factories,
            overrides,
            super_id,
        }))
    }

    fn tick(&self, vm: &VirtualMachine) -> PyResult<()> {
        self.state
            .tick()
            .map_err(|limit| limit_exception(vm, &self.timeout_type, limit))
    }

    fn is_timeout(&self, exc: &PyBaseExceptionRef) -> bool {
        exc.as_object().class().as_object().get_id() == self.timeout_type.as_object().get_id()
    }

    fn record(&self, frame: &Frame, node: &impl Ranged, exc: PyBaseExceptionRef) -> PyBaseExceptionRef {
        let line = frame.code.line(node);
        self.state.record_frame(
            &exc,
            TraceEntry {
                frame_id: frame.id,
                name: frame.name.to_string(),
                line,
                text: frame.code.text_of(line),
            },
        );
        exc
    }

    fn truthy(&self, vm: &VirtualMachine, value: PyObjectRef) -> PyResult<bool> {
        value.try_to_bool(vm)
    }

    fn iterate(&self, vm: &VirtualMachine, value: PyObjectRef) -> PyResult<Vec<PyObjectRef>> {
        Vec::<PyObjectRef>::try_from_object(vm, value)
    }

    fn set_context(&self, vm: &VirtualMachine, exc: &PyBaseExceptionRef, context: &PyBaseExceptionRef) {
        let _ = self
            .support
            .call(vm, "set_context", (exc.clone(), context.clone()));
    }

    // Names

    fn check_name(&self, vm: &VirtualMachine, name: &str) -> PyResult<()> {
        if name.starts_with("__") && !PLAIN_DUNDER_NAMES.contains(&name) {
            return Err(vm.new_name_error(
                format!("Forbidden access to dunder name: {name}"),
                vm.ctx.new_str(name),
            ));
        }
        Ok(())
    }

    fn load_name(&self, vm: &VirtualMachine, frame: &Frame, name: &str) -> PyResult<PyObjectRef> {
        let mut scope = Some(&frame.scope);
        let mut innermost = true;
        while let Some(current) = scope {
            if innermost || current.kind != ScopeKind::Class {
                if let Some(value) = current.vars.get_item_opt(name, vm)? {
                    return Ok(value);
                }
            }
            innermost = false;
            scope = current.parent.as_ref();
        }
        if let Some(value) = self.overrides.get_item_opt(name, vm)? {
            return Ok(value);
        }
        if !name.starts_with('_') && !HIDDEN_BUILTINS.contains(&name) {
            if let Ok(value) = vm.builtins.as_object().get_attr(&vm.ctx.new_str(name), vm) {
                return Ok(value);
            }
        }
        Err(vm.new_name_error(format!("name '{name}' is not defined"), vm.ctx.new_str(name)))
    }

    fn store_name(&self, vm: &VirtualMachine, frame: &Frame, name: &str, value: PyObjectRef) -> PyResult<()> {
        frame.scope.vars.set_item(name, value, vm)
    }

    /// `:=` binds in the nearest scope that is not a comprehension.
    fn store_walrus(&self, vm: &VirtualMachine, frame: &Frame, name: &str, value: PyObjectRef) -> PyResult<()> {
        let mut scope = &frame.scope;
        while scope.kind == ScopeKind::Comprehension {
            match &scope.parent {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        scope.vars.set_item(name, value, vm)
    }

    // Statements

    fn exec_block(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, stmts: &[ast::Stmt]) -> PyResult<Flow> {
        for stmt in stmts {
            let flow = self
                .exec(vm, frame, stmt)
                .map_err(|exc| self.record(frame, stmt, exc))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, stmt: &ast::Stmt) -> PyResult<Flow> {
        use ast::Stmt;
        self.tick(vm)?;
        match stmt {
            Stmt::Expr(ast::StmtExpr { value, .. }) => {
                self.eval(vm, frame, value)?;
            }
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                let value = self.eval(vm, frame, value)?;
                for target in targets {
                    self.assign(vm, frame, target, value.clone())?;
                }
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, op, value, .. }) => {
                self.aug_assign(vm, frame, target, *op, value)?
            }
            Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => {
                if let Some(value) = value {
                    let value = self.eval(vm, frame, value)?;
                    self.assign(vm, frame, target, value)?;
                }
            }
            Stmt::Pass(_) => {}
            Stmt::Break(_) => return Ok(Flow::Break),
            Stmt::Continue(_) => return Ok(Flow::Continue),
            Stmt::Return(ast::StmtReturn { value, .. }) => {
                let value = match value {
                    Some(value) => self.eval(vm, frame, value)?,
                    None => vm.ctx.none(),
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                for target in targets {
                    self.delete(vm, frame, target)?;
                }
            }
            Stmt::If(ast::StmtIf { test, body, orelse, .. }) => {
                let test = self.eval(vm, frame, test)?;
                let branch = if self.truthy(vm, test)? { body } else { orelse };
                return self.exec_block(vm, frame, branch);
            }
            Stmt::While(node) => return self.exec_while(vm, frame, node),
            Stmt::For(node) => return self.exec_for(vm, frame, node),
            Stmt::FunctionDef(def) => {
                let plan = self.plan(vm, frame, def.name.as_str(), &def.args, Body::Block(def.body.clone()))?;
                let function = self.make_function(vm, plan)?;
                self.store_name(vm, frame, def.name.as_str(), function)?;
            }
            Stmt::ClassDef(def) => self.define_class(vm, frame, def)?,
            Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    let name = alias.name.as_str();
                    let resolved = self.state.resolve_import(vm, &self.support, name)?;
                    match &alias.asname {
                        Some(asname) => self.store_name(vm, frame, asname.as_str(), resolved.leaf)?,
                        None => self.store_name(vm, frame, top_level(name), resolved.top)?,
                    }
                }
            }
            Stmt::ImportFrom(node) => self.import_from(vm, frame, node)?,
            Stmt::Try(node) => return self.exec_try(vm, frame, node),
            Stmt::Raise(node) => return Err(self.raise(vm, frame, node)?),
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                let test = self.eval(vm, frame, test)?;
                if !self.truthy(vm, test)? {
                    let args = match msg {
                        Some(msg) => vec![self.eval(vm, frame, msg)?],
                        None => Vec::new(),
                    };
                    return Err(vm.new_exception(vm.ctx.exceptions.assertion_error.to_owned(), args));
                }
            }
            _ => {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.syntax_error.to_owned(),
                    "statement is not supported".to_string(),
                ))
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_while(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, node: &ast::StmtWhile) -> PyResult<Flow> {
        loop {
            let test = self.eval(vm, frame, &node.test)?;
            if !self.truthy(vm, test)? {
                return self.exec_block(vm, frame, &node.orelse);
            }
            match self.exec_block(vm, frame, &node.body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
            self.tick(vm)?;
        }
    }

    fn exec_for(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, node: &ast::StmtFor) -> PyResult<Flow> {
        let iterator = self.eval(vm, frame, &node.iter)?.get_iter(vm)?;
        loop {
            self.tick(vm)?;
            let item = match iterator.next(vm)? {
                PyIterReturn::Return(item) => item,
                PyIterReturn::StopIteration(_) => return self.exec_block(vm, frame, &node.orelse),
            };
            self.assign(vm, frame, &node.target, item)?;
            match self.exec_block(vm, frame, &node.body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
    }

    fn exec_try(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, node: &ast::StmtTry) -> PyResult<Flow> {
        let outcome = match self.exec_block(vm, frame, &node.body) {
            Ok(Flow::Normal) => self.exec_block(vm, frame, &node.orelse),
            Ok(flow) => Ok(flow),
            Err(exc) => self.handle(vm, frame, &node.handlers, exc),
        };
        if node.finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(vm, frame, &node.finalbody)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    /// Runs the first matching handler. The time and fuel exception is
    /// never matched.
    fn handle(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        frame: &Frame,
        handlers: &[ast::ExceptHandler],
        exc: PyBaseExceptionRef,
    ) -> PyResult<Flow> {
        if self.is_timeout(&exc) {
            return Err(exc);
        }
        for handler in handlers {
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            let matched = match &handler.type_ {
                None => true,
                Some(kind) => {
                    let kind = self.eval(vm, frame, kind)?;
                    exc.as_object().is_instance(&kind, vm)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                self.store_name(vm, frame, name.as_str(), exc.clone().into())?;
            }
            self.state.push_handled(exc.clone());
            let result = self.exec_block(vm, frame, &handler.body);
            self.state.pop_handled();
            if let Some(name) = &handler.name {
                let _ = frame.scope.vars.del_item(name.as_str(), vm);
            }
            return result.map_err(|raised| {
                self.set_context(vm, &raised, &exc);
                raised
            });
        }
        Err(exc)
    }

    fn to_exception(&self, vm: &VirtualMachine, value: PyObjectRef) -> PyResult<PyBaseExceptionRef> {
        let value = if value.payload::<PyType>().is_some() {
            value.call(FuncArgs::default(), vm)?
        } else {
            value
        };
        value
            .downcast::<PyBaseException>()
            .map_err(|_| vm.new_type_error("exceptions must derive from BaseException".to_string()))
    }

    fn raise(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, node: &ast::StmtRaise) -> PyResult<PyBaseExceptionRef> {
        let Some(exc) = &node.exc else {
            return Ok(self
                .state
                .handled_exception()
                .unwrap_or_else(|| vm.new_runtime_error("No active exception to reraise".to_string())));
        };
        let exc = self.eval(vm, frame, exc)?;
        let exc = self.to_exception(vm, exc)?;
        match &node.cause {
            Some(cause) => {
                let cause = self.eval(vm, frame, cause)?;
                let cause: PyObjectRef = if vm.is_none(&cause) {
                    cause
                } else {
                    self.to_exception(vm, cause)?.into()
                };
                self.support.call(vm, "set_cause", (exc.clone(), cause))?;
            }
            None => {
                if let Some(handled) = self.state.handled_exception() {
                    self.set_context(vm, &exc, &handled);
                }
            }
        }
        Ok(exc)
    }

    fn import_from(&self, vm: &VirtualMachine, frame: &Frame, node: &ast::StmtImportFrom) -> PyResult<()> {
        let level = node.level.map_or(0, |l| l.to_u32());
        let module = match (&node.module, level) {
            (Some(module), 0) => module.as_str(),
            _ => {
                return Err(vm.new_import_error(
                    "attempted relative import with no known parent package".to_string(),
                    vm.ctx.new_str(""),
                ))
            }
        };
        if let [alias] = node.names.as_slice() {
            if alias.name.as_str() == "*" {
                for (name, value) in self.state.import_star(vm, &self.support, module)? {
                    self.store_name(vm, frame, &name, value)?;
                }
                return Ok(());
            }
        }
        let wanted: Vec<String> = node.names.iter().map(|a| a.name.to_string()).collect();
        if let Some(dunder) = wanted.iter().find(|n| n.starts_with("__")) {
            return Err(vm.new_import_error(
                format!("cannot import name '{dunder}' from '{module}'"),
                vm.ctx.new_str(module),
            ));
        }
        let values = self.state.import_names(vm, &self.support, module, &wanted)?;
        for (alias, value) in node.names.iter().zip(values) {
            let bound = alias.asname.as_ref().unwrap_or(&alias.name);
            self.store_name(vm, frame, bound.as_str(), value)?;
        }
        Ok(())
    }

    // Definitions

    fn plan(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        frame: &Frame,
        name: &str,
        params: &ast::Arguments,
        body: Body,
    ) -> PyResult<FunctionPlan> {
        let mut defaults = |list: &[ast::ArgWithDefault]| -> PyResult<Vec<Option<PyObjectRef>>> {
            list.iter()
                .map(|p| p.default.as_deref().map(|d| self.eval(vm, frame, d)).transpose())
                .collect()
        };
        let positional: Vec<ast::ArgWithDefault> = params
            .posonlyargs
            .iter()
            .chain(&params.args)
            .cloned()
            .collect();
        let positional_defaults = defaults(&positional)?;
        let keyword_defaults = defaults(&params.kwonlyargs)?;
        Ok(FunctionPlan {
            name: Rc::from(name),
            qualname: frame.qualify(name),
            params: params.clone(),
            body,
            positional_defaults,
            keyword_defaults,
            closure: Rc::clone(&frame.scope),
            code: Rc::clone(&frame.code),
            class_cell: frame.class_cell.clone(),
        })
    }

    fn make_function(self: &Rc<Self>, vm: &VirtualMachine, plan: FunctionPlan) -> PyResult<PyObjectRef> {
        let name = vm.ctx.new_str(&*plan.name);
        let qualname = vm.ctx.new_str(plan.qualname.as_str());
        let plan = Rc::new(plan);
        let walker = Rc::clone(self);
        let implementation = vm.new_function("function", move |args: FuncArgs, vm: &VirtualMachine| {
            walker.call(vm, &plan, args)
        });
        self.support.call(vm, "as_function", (implementation, name, qualname))
    }

    fn call(self: &Rc<Self>, vm: &VirtualMachine, plan: &FunctionPlan, args: FuncArgs) -> PyResult<PyObjectRef> {
        self.state
            .enter_call()
            .map_err(|limit| limit_exception(vm, &self.timeout_type, limit))?;
        let result = self.invoke(vm, plan, args);
        self.state.exit_call();
        result
    }

    fn invoke(self: &Rc<Self>, vm: &VirtualMachine, plan: &FunctionPlan, args: FuncArgs) -> PyResult<PyObjectRef> {
        let vars = vm.ctx.new_dict();
        let first_arg = args.args.first().cloned();
        self.bind_arguments(vm, plan, args, &vars)?;
        let frame = Frame {
            id: next_frame_id(),
            name: Rc::clone(&plan.name),
            qualname: plan.qualname.clone(),
            scope: Rc::new(Scope {
                kind: ScopeKind::Function,
                vars,
                parent: Some(Rc::clone(&plan.closure)),
            }),
            code: Rc::clone(&plan.code),
            class_cell: plan.class_cell.clone(),
            first_arg,
        };
        match &plan.body {
            Body::Expr(expr) => self
                .eval(vm, &frame, expr)
                .map_err(|exc| self.record(&frame, expr, exc)),
            Body::Block(stmts) => match self.exec_block(vm, &frame, stmts)? {
                Flow::Return(value) => Ok(value),
                _ => Ok(vm.ctx.none()),
            },
        }
    }

    fn bind_arguments(&self, vm: &VirtualMachine, plan: &FunctionPlan, args: FuncArgs, vars: &PyDictRef) -> PyResult<()> {
        let spec = &plan.params;
        let name = &plan.name;
        let positional: Vec<&ast::ArgWithDefault> = spec.posonlyargs.iter().chain(&spec.args).collect();
        let FuncArgs { args: values, kwargs } = args;

        let mut bound: Vec<Option<PyObjectRef>> = vec![None; positional.len()];
        let given = values.len();
        let mut values = values.into_iter();
        for slot in bound.iter_mut() {
            match values.next() {
                Some(value) => *slot = Some(value),
                None => break,
            }
        }
        let extra: Vec<PyObjectRef> = values.collect();
        match &spec.vararg {
            Some(vararg) => vars.set_item(vararg.arg.as_str(), vm.ctx.new_tuple(extra).into(), vm)?,
            None if !extra.is_empty() => {
                let expected = positional.len();
                let plural = if expected == 1 { "" } else { "s" };
                return Err(vm.new_type_error(format!(
                    "{name}() takes {expected} positional argument{plural} but {given} were given"
                )));
            }
            None => {}
        }

        let extra_keywords = vm.ctx.new_dict();
        let mut keyword_only: Vec<Option<PyObjectRef>> = vec![None; spec.kwonlyargs.len()];
        for (key, value) in kwargs {
            let position = positional.iter().position(|p| p.def.arg.as_str() == key);
            if let Some(index) = position.filter(|i| *i >= spec.posonlyargs.len()) {
                if bound[index].is_some() {
                    return Err(vm.new_type_error(format!(
                        "{name}() got multiple values for argument '{key}'"
                    )));
                }
                bound[index] = Some(value);
            } else if let Some(index) = spec.kwonlyargs.iter().position(|p| p.def.arg.as_str() == key) {
                keyword_only[index] = Some(value);
            } else if spec.kwarg.is_some() {
                extra_keywords.set_item(key.as_str(), value, vm)?;
            } else {
                return Err(vm.new_type_error(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )));
            }
        }

        let mut missing = Vec::new();
        for (index, (slot, param)) in bound.into_iter().zip(&positional).enumerate() {
            match slot.or_else(|| plan.positional_defaults[index].clone()) {
                Some(value) => vars.set_item(param.def.arg.as_str(), value, vm)?,
                None => missing.push(param.def.arg.as_str()),
            }
        }
        if !missing.is_empty() {
            let plural = if missing.len() == 1 { "" } else { "s" };
            return Err(vm.new_type_error(format!(
                "{name}() missing {} required positional argument{plural}: {}",
                missing.len(),
                missing_list(&missing)
            )));
        }
        for (index, (slot, param)) in keyword_only.into_iter().zip(&spec.kwonlyargs).enumerate() {
            match slot.or_else(|| plan.keyword_defaults[index].clone()) {
                Some(value) => vars.set_item(param.def.arg.as_str(), value, vm)?,
                None => missing.push(param.def.arg.as_str()),
            }
        }
        if !missing.is_empty() {
            let plural = if missing.len() == 1 { "" } else { "s" };
            return Err(vm.new_type_error(format!(
                "{name}() missing {} required keyword-only argument{plural}: {}",
                missing.len(),
                missing_list(&missing)
            )));
        }
        if let Some(kwarg) = &spec.kwarg {
            vars.set_item(kwarg.arg.as_str(), extra_keywords.into(), vm)?;
        }
        Ok(())
    }

    fn define_class(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, def: &ast::StmtClassDef) -> PyResult<()> {
        let name = def.name.as_str();
        let bases = self.eval_items(vm, frame, &def.bases)?;
        let keywords = vm.ctx.new_dict();
        for keyword in &def.keywords {
            let value = self.eval(vm, frame, &keyword.value)?;
            match &keyword.arg {
                Some(arg) => keywords.set_item(arg.as_str(), value, vm)?,
                None => {
                    vm.call_method(keywords.as_object(), "update", (value,))?;
                }
            }
        }

        let namespace = vm.ctx.new_dict();
        let cell: Rc<ClassCell> = Rc::new(RefCell::new(None));
        let qualname = frame.qualify(name);
        let body_frame = Frame {
            id: next_frame_id(),
            name: Rc::from(name),
            qualname: qualname.clone(),
            class_cell: Some(Rc::clone(&cell)),
            first_arg: None,
            ..frame.with_scope(ScopeKind::Class, namespace.clone())
        };
        self.exec_block(vm, &body_frame, &def.body)?;

        let class = self.support.call(
            vm,
            "make_class",
            (
                vm.ctx.new_str(name),
                vm.ctx.new_str(qualname),
                vm.ctx.new_list(bases),
                namespace,
                keywords,
            ),
        )?;
        *cell.borrow_mut() = Some(class.clone());
        self.store_name(vm, frame, name, class)
    }

    // Assignment targets

    fn assign(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, target: &ast::Expr, value: PyObjectRef) -> PyResult<()> {
        use ast::Expr;
        match target {
            Expr::Name(ast::ExprName { id, .. }) => {
                self.check_name(vm, id.as_str())?;
                self.store_name(vm, frame, id.as_str(), value)
            }
            Expr::Attribute(ast::ExprAttribute { value: object, attr, .. }) => {
                if let Some(message) = attribute_refusal(GuardMode::Interpreted, attr.as_str()) {
                    return Err(vm.new_attribute_error(message));
                }
                let object = self.eval(vm, frame, object)?;
                object.set_attr(&vm.ctx.new_str(attr.as_str()), value, vm)
            }
            Expr::Subscript(ast::ExprSubscript { value: object, slice, .. }) => {
                let object = self.eval(vm, frame, object)?;
                let key = self.eval(vm, frame, slice)?;
                object.set_item(&*key, value, vm)
            }
            Expr::Tuple(ast::ExprTuple { elts, .. }) | Expr::List(ast::ExprList { elts, .. }) => {
                self.unpack(vm, frame, elts, value)
            }
            _ => Err(vm.new_exception_msg(
                vm.ctx.exceptions.syntax_error.to_owned(),
                "cannot assign to expression".to_string(),
            )),
        }
    }

    fn unpack(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, targets: &[ast::Expr], value: PyObjectRef) -> PyResult<()> {
        let mut items = self.iterate(vm, value)?;
        let star = targets.iter().position(|t| matches!(t, ast::Expr::Starred(_)));
        let Some(star) = star else {
            if items.len() != targets.len() {
                let message = if items.len() < targets.len() {
                    format!("not enough values to unpack (expected {}, got {})", targets.len(), items.len())
                } else {
                    format!("too many values to unpack (expected {})", targets.len())
                };
                return Err(vm.new_value_error(message));
            }
            for (target, item) in targets.iter().zip(items) {
                self.assign(vm, frame, target, item)?;
            }
            return Ok(());
        };

        let required = targets.len() - 1;
        if items.len() < required {
            return Err(vm.new_value_error(format!(
                "not enough values to unpack (expected at least {required}, got {})",
                items.len()
            )));
        }
        let tail = items.split_off(items.len() - (targets.len() - star - 1));
        let middle = items.split_off(star);
        for (target, item) in targets[..star].iter().zip(items) {
            self.assign(vm, frame, target, item)?;
        }
        if let ast::Expr::Starred(ast::ExprStarred { value: inner, .. }) = &targets[star] {
            self.assign(vm, frame, inner, vm.ctx.new_list(middle).into())?;
        }
        for (target, item) in targets[star + 1..].iter().zip(tail) {
            self.assign(vm, frame, target, item)?;
        }
        Ok(())
    }

    fn aug_assign(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        frame: &Frame,
        target: &ast::Expr,
        op: ast::Operator,
        value: &ast::Expr,
    ) -> PyResult<()> {
        use ast::Expr;
        let op = vm.ctx.new_str(operator_name(op));
        match target {
            Expr::Name(ast::ExprName { id, .. }) => {
                self.check_name(vm, id.as_str())?;
                let current = self.load_name(vm, frame, id.as_str())?;
                let value = self.eval(vm, frame, value)?;
                let result = self.support.call(vm, "inplace", (op, current, value))?;
                self.store_name(vm, frame, id.as_str(), result)
            }
            Expr::Attribute(ast::ExprAttribute { value: object, attr, .. }) => {
                let object = self.eval(vm, frame, object)?;
                let current = self.guards.getattr(vm, &object, attr.as_str())?;
                let value = self.eval(vm, frame, value)?;
                let result = self.support.call(vm, "inplace", (op, current, value))?;
                object.set_attr(&vm.ctx.new_str(attr.as_str()), result, vm)
            }
            Expr::Subscript(ast::ExprSubscript { value: object, slice, .. }) => {
                let object = self.eval(vm, frame, object)?;
                let key = self.eval(vm, frame, slice)?;
                let current = self.guards.getitem(vm, &object, key.clone())?;
                let value = self.eval(vm, frame, value)?;
                let result = self.support.call(vm, "inplace", (op, current, value))?;
                object.set_item(&*key, result, vm)
            }
            _ => Err(vm.new_exception_msg(
                vm.ctx.exceptions.syntax_error.to_owned(),
                "illegal expression for augmented assignment".to_string(),
            )),
        }
    }

    fn delete(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, target: &ast::Expr) -> PyResult<()> {
        use ast::Expr;
        match target {
            Expr::Name(ast::ExprName { id, .. }) => {
                self.check_name(vm, id.as_str())?;
                if frame.scope.vars.get_item_opt(id.as_str(), vm)?.is_none() {
                    return Err(vm.new_name_error(
                        format!("name '{}' is not defined", id.as_str()),
                        vm.ctx.new_str(id.as_str()),
                    ));
                }
                frame.scope.vars.del_item(id.as_str(), vm)
            }
            Expr::Attribute(ast::ExprAttribute { value: object, attr, .. }) => {
                if let Some(message) = attribute_refusal(GuardMode::Interpreted, attr.as_str()) {
                    return Err(vm.new_attribute_error(message));
                }
                self.eval(vm, frame, object)?.del_attr(&vm.ctx.new_str(attr.as_str()), vm)
            }
            Expr::Subscript(ast::ExprSubscript { value: object, slice, .. }) => {
                let object = self.eval(vm, frame, object)?;
                let key = self.eval(vm, frame, slice)?;
                object.del_item(&*key, vm)
            }
            Expr::Tuple(ast::ExprTuple { elts, .. }) | Expr::List(ast::ExprList { elts, .. }) => {
                elts.iter().try_for_each(|t| self.delete(vm, frame, t))
            }
            _ => Err(vm.new_exception_msg(
                vm.ctx.exceptions.syntax_error.to_owned(),
                "cannot delete expression".to_string(),
            )),
        }
    }

    // Expressions

    fn eval_items(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, exprs: &[ast::Expr]) -> PyResult<Vec<PyObjectRef>> {
        let mut items = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                ast::Expr::Starred(ast::ExprStarred { value, .. }) => {
                    let value = self.eval(vm, frame, value)?;
                    items.extend(self.iterate(vm, value)?);
                }
                _ => items.push(self.eval(vm, frame, expr)?),
            }
        }
        Ok(items)
    }

    fn constant(&self, vm: &VirtualMachine, value: &ast::Constant) -> PyResult<PyObjectRef> {
        use ast::Constant;
        Ok(match value {
            Constant::None => vm.ctx.none(),
            Constant::Bool(b) => vm.ctx.new_bool(*b).into(),
            Constant::Str(s) => vm.ctx.new_str(s.as_str()).into(),
            Constant::Bytes(b) => vm.ctx.new_bytes(b.clone()).into(),
            Constant::Int(i) => {
                let digits = i.to_string();
                match digits.parse::<i64>() {
                    Ok(small) => vm.ctx.new_int(small).into(),
                    Err(_) => vm
                        .ctx
                        .types
                        .int_type
                        .as_object()
                        .call((vm.ctx.new_str(digits),), vm)?,
                }
            }
            Constant::Float(f) => vm.ctx.new_float(*f).into(),
            Constant::Complex { real, imag } => vm
                .ctx
                .types
                .complex_type
                .as_object()
                .call((vm.ctx.new_float(*real), vm.ctx.new_float(*imag)), vm)?,
            Constant::Ellipsis => vm.ctx.ellipsis.clone().into(),
            Constant::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.constant(vm, item))
                    .collect::<PyResult<Vec<_>>>()?;
                vm.ctx.new_tuple(items).into()
            }
        })
    }

    fn eval(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, expr: &ast::Expr) -> PyResult<PyObjectRef> {
        use ast::Expr;
        match expr {
            Expr::Constant(ast::ExprConstant { value, .. }) => self.constant(vm, value),
            Expr::Name(ast::ExprName { id, .. }) => {
                self.check_name(vm, id.as_str())?;
                self.load_name(vm, frame, id.as_str())
            }
            Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                let mut text = String::new();
                for part in values {
                    match part {
                        Expr::Constant(ast::ExprConstant {
                            value: ast::Constant::Str(s),
                            ..
                        }) => text.push_str(s),
                        Expr::FormattedValue(value) => text.push_str(&self.format_value(vm, frame, value)?),
                        other => {
                            let value = self.eval(vm, frame, other)?;
                            text.push_str(value.str(vm)?.as_str());
                        }
                    }
                }
                Ok(vm.ctx.new_str(text).into())
            }
            Expr::FormattedValue(value) => Ok(vm.ctx.new_str(self.format_value(vm, frame, value)?).into()),
            Expr::List(ast::ExprList { elts, .. }) => Ok(vm.ctx.new_list(self.eval_items(vm, frame, elts)?).into()),
            Expr::Tuple(ast::ExprTuple { elts, .. }) => Ok(vm.ctx.new_tuple(self.eval_items(vm, frame, elts)?).into()),
            Expr::Set(ast::ExprSet { elts, .. }) => {
                let items = vm.ctx.new_list(self.eval_items(vm, frame, elts)?);
                vm.ctx.types.set_type.as_object().call((items,), vm)
            }
            Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                let dict = vm.ctx.new_dict();
                for (key, value) in keys.iter().zip(values) {
                    let value = self.eval(vm, frame, value)?;
                    match key {
                        Some(key) => {
                            let key = self.eval(vm, frame, key)?;
                            dict.set_item(&*key, value, vm)?;
                        }
                        None => {
                            vm.call_method(dict.as_object(), "update", (value,))?;
                        }
                    }
                }
                Ok(dict.into())
            }
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                let value = self.eval(vm, frame, value)?;
                self.guards.getattr(vm, &value, attr.as_str())
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                let value = self.eval(vm, frame, value)?;
                let key = self.eval(vm, frame, slice)?;
                self.guards.getitem(vm, &value, key)
            }
            Expr::Slice(ast::ExprSlice { lower, upper, step, .. }) => {
                let mut part = |bound: &Option<Box<ast::Expr>>| match bound {
                    Some(bound) => self.eval(vm, frame, bound),
                    None => Ok(vm.ctx.none()),
                };
                let (lower, upper, step) = (part(lower)?, part(upper)?, part(step)?);
                vm.ctx.types.slice_type.as_object().call((lower, upper, step), vm)
            }
            Expr::Call(call) => self.eval_call(vm, frame, call),
            Expr::BinOp(ast::ExprBinOp { left, op, right, .. }) => {
                let left = self.eval(vm, frame, left)?;
                let right = self.eval(vm, frame, right)?;
                self.support
                    .call(vm, "binop", (vm.ctx.new_str(operator_name(*op)), left, right))
            }
            Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                let operand = self.eval(vm, frame, operand)?;
                let name = match op {
                    ast::UnaryOp::Not => return Ok(vm.ctx.new_bool(!self.truthy(vm, operand)?).into()),
                    ast::UnaryOp::USub => "neg",
                    ast::UnaryOp::UAdd => "pos",
                    ast::UnaryOp::Invert => "invert",
                };
                self.support.call(vm, "unary", (vm.ctx.new_str(name), operand))
            }
            Expr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let mut result = vm.ctx.none();
                for value in values {
                    result = self.eval(vm, frame, value)?;
                    let truthy = self.truthy(vm, result.clone())?;
                    match op {
                        ast::BoolOp::And if !truthy => return Ok(result),
                        ast::BoolOp::Or if truthy => return Ok(result),
                        _ => {}
                    }
                }
                Ok(result)
            }
            Expr::Compare(ast::ExprCompare { left, ops, comparators, .. }) => {
                let mut left = self.eval(vm, frame, left)?;
                let mut result = vm.ctx.new_bool(true).into();
                for (op, right) in ops.iter().zip(comparators) {
                    let right = self.eval(vm, frame, right)?;
                    result = self.support.call(
                        vm,
                        "compare",
                        (vm.ctx.new_str(comparison_name(*op)), left, right.clone()),
                    )?;
                    if !self.truthy(vm, result.clone())? {
                        return Ok(result);
                    }
                    left = right;
                }
                Ok(result)
            }
            Expr::IfExp(ast::ExprIfExp { test, body, orelse, .. }) => {
                let test = self.eval(vm, frame, test)?;
                if self.truthy(vm, test)? {
                    self.eval(vm, frame, body)
                } else {
                    self.eval(vm, frame, orelse)
                }
            }
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                let value = self.eval(vm, frame, value)?;
                if let Expr::Name(ast::ExprName { id, .. }) = target.as_ref() {
                    self.check_name(vm, id.as_str())?;
                    self.store_walrus(vm, frame, id.as_str(), value.clone())?;
                }
                Ok(value)
            }
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                let plan = self.plan(vm, frame, "<lambda>", args, Body::Expr((**body).clone()))?;
                self.make_function(vm, plan)
            }
            Expr::ListComp(ast::ExprListComp { elt, generators, .. }) => {
                let items = self.collect(vm, frame, generators, elt)?;
                Ok(vm.ctx.new_list(items).into())
            }
            Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
                let items = self.collect(vm, frame, generators, elt)?;
                self.support.call(vm, "generator", (vm.ctx.new_list(items),))
            }
            Expr::SetComp(ast::ExprSetComp { elt, generators, .. }) => {
                let items = vm.ctx.new_list(self.collect(vm, frame, generators, elt)?);
                vm.ctx.types.set_type.as_object().call((items,), vm)
            }
            Expr::DictComp(ast::ExprDictComp { key, value, generators, .. }) => {
                let dict = vm.ctx.new_dict();
                let comp = frame.with_scope(ScopeKind::Comprehension, vm.ctx.new_dict());
                self.generate(vm, &comp, generators, &mut |frame| {
                    let key = self.eval(vm, frame, key)?;
                    let value = self.eval(vm, frame, value)?;
                    dict.set_item(&*key, value, vm)
                })?;
                Ok(dict.into())
            }
            Expr::Starred(_) => Err(vm.new_exception_msg(
                vm.ctx.exceptions.syntax_error.to_owned(),
                "can't use starred expression here".to_string(),
            )),
            _ => Err(vm.new_exception_msg(
                vm.ctx.exceptions.syntax_error.to_owned(),
                "expression is not supported".to_string(),
            )),
        }
    }

    fn format_value(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, node: &ast::ExprFormattedValue) -> PyResult<String> {
        let value = self.eval(vm, frame, &node.value)?;
        let conversion = match node.conversion {
            ast::ConversionFlag::Str => "s",
            ast::ConversionFlag::Repr => "r",
            ast::ConversionFlag::Ascii => "a",
            _ => "",
        };
        let spec = match &node.format_spec {
            Some(spec) => self.eval(vm, frame, spec)?,
            None => vm.ctx.new_str("").into(),
        };
        let text = self
            .support
            .call(vm, "format_value", (value, vm.ctx.new_str(conversion), spec))?;
        String::try_from_object(vm, text)
    }

    fn collect(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        frame: &Frame,
        generators: &[ast::Comprehension],
        elt: &ast::Expr,
    ) -> PyResult<Vec<PyObjectRef>> {
        let mut items = Vec::new();
        let comp = frame.with_scope(ScopeKind::Comprehension, vm.ctx.new_dict());
        self.generate(vm, &comp, generators, &mut |frame| {
            items.push(self.eval(vm, frame, elt)?);
            Ok(())
        })?;
        Ok(items)
    }

    fn generate(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        frame: &Frame,
        generators: &[ast::Comprehension],
        emit: &mut dyn FnMut(&Frame) -> PyResult<()>,
    ) -> PyResult<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(frame);
        };
        let iterator = self.eval(vm, frame, &first.iter)?.get_iter(vm)?;
        loop {
            self.tick(vm)?;
            let item = match iterator.next(vm)? {
                PyIterReturn::Return(item) => item,
                PyIterReturn::StopIteration(_) => return Ok(()),
            };
            self.assign(vm, frame, &first.target, item)?;
            let mut keep = true;
            for condition in &first.ifs {
                let condition = self.eval(vm, frame, condition)?;
                if !self.truthy(vm, condition)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.generate(vm, frame, rest, emit)?;
            }
        }
    }

    fn eval_call(self: &Rc<Self>, vm: &VirtualMachine, frame: &Frame, call: &ast::ExprCall) -> PyResult<PyObjectRef> {
        let callee = self.eval(vm, frame, &call.func)?;
        if call.args.is_empty() && call.keywords.is_empty() && callee.get_id() == self.super_id {
            return self.zero_arg_super(vm, frame, callee);
        }
        let positional = self.eval_items(vm, frame, &call.args)?;
        let mut named = Vec::new();
        let mut splats = Vec::new();
        for keyword in &call.keywords {
            let value = self.eval(vm, frame, &keyword.value)?;
            match &keyword.arg {
                Some(arg) => named.push((arg.to_string(), value)),
                None => splats.push(value),
            }
        }

        let is_factory = self.factories.contains(&callee.get_id());
        if splats.is_empty() && !is_factory {
            let kwargs: KwArgs = named.into_iter().collect();
            return callee.call(FuncArgs::new(positional, kwargs), vm);
        }
        let kwargs = vm.ctx.new_dict();
        for (name, value) in named {
            kwargs.set_item(name.as_str(), value, vm)?;
        }
        for splat in splats {
            vm.call_method(kwargs.as_object(), "update", (splat,))?;
        }
        let helper = if is_factory { "checked_call" } else { "call" };
        self.support
            .call(vm, helper, (callee, vm.ctx.new_list(positional), kwargs))
    }

    fn zero_arg_super(&self, vm: &VirtualMachine, frame: &Frame, callee: PyObjectRef) -> PyResult<PyObjectRef> {
        let class = frame
            .class_cell
            .as_ref()
            .and_then(|cell| cell.borrow().clone())
            .ok_or_else(|| vm.new_runtime_error("super(): __class__ cell not found".to_string()))?;
        let first = frame
            .first_arg
            .clone()
            .ok_or_else(|| vm.new_runtime_error("super(): no arguments".to_string()))?;
        callee.call((class, first), vm)
    }
}
