//! Host-side state of one namespace, shared by both backends.
//!
//! A [`HostState`] lives as long as its namespace's interpreter. Between
//! runs it keeps the module views imported so far; during a run it also
//! holds what the run may touch: the settings, the output sinks, the budget
//! and the exceptions being handled. Natives reach it through an `Rc`, so
//! no borrow is ever held across a call back into the interpreter.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rustpython_vm::builtins::{PyBaseExceptionRef, PyModule};
use rustpython_vm::{AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine};
use tracing::{debug, info};

use crate::sandbox::capture::{self, CaptureOutcome};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::io::{Channel, SandboxIo};
use crate::sandbox::limits::{ExecutionBudget, LimitExceeded};
use crate::sandbox::policy::{top_level, ImportClass, ImportPolicy};
use crate::sandbox::registry::ModuleRegistry;
use crate::sandbox::runtime::Support;

/// Everything a backend is configured with, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub config: SandboxConfig,
    pub policy: ImportPolicy,
    pub registry: Arc<ModuleRegistry>,
}

impl RunSettings {
    pub fn new(config: SandboxConfig, registry: Arc<ModuleRegistry>) -> Self {
        let policy = config.import_policy();
        Self {
            config,
            policy,
            registry,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::new(SandboxConfig::default(), Arc::new(ModuleRegistry::new()))
    }
}

/// Result of resolving an `import` statement.
pub struct ResolvedImport {
    /// The top-level package, bound by `import a.b`.
    pub top: PyObjectRef,
    /// The named module itself, bound by `import a.b as c`.
    pub leaf: PyObjectRef,
}

/// One frame of a tree-walker traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub frame_id: usize,
    pub name: String,
    pub line: usize,
    /// Source line as written, when the frame knows its own source.
    pub text: Option<String>,
}

/// How a standard-library module is narrowed before scripts see it.
struct ViewRule {
    module: &'static str,
    /// Only these names, when set.
    keep: Option<&'static [&'static str]>,
    drop: &'static [&'static str],
}

const VIEW_RULES: &[ViewRule] = &[
    ViewRule {
        module: "sys",
        keep: Some(&[
            "byteorder",
            "float_info",
            "getrecursionlimit",
            "int_info",
            "maxsize",
            "platform",
            "stderr",
            "stdout",
            "version",
            "version_info",
        ]),
        drop: &[],
    },
    ViewRule {
        module: "hashlib",
        keep: Some(&[
            "algorithms_available",
            "algorithms_guaranteed",
            "blake2b",
            "blake2s",
            "md5",
            "sha1",
            "sha224",
            "sha256",
            "sha384",
            "sha3_224",
            "sha3_256",
            "sha3_384",
            "sha3_512",
            "sha512",
        ]),
        drop: &[],
    },
    ViewRule {
        module: "string",
        keep: None,
        drop: &["Formatter"],
    },
    ViewRule {
        module: "functools",
        keep: None,
        drop: &["singledispatch", "singledispatchmethod"],
    },
    ViewRule {
        module: "traceback",
        keep: None,
        drop: &["clear_frames", "walk_stack", "walk_tb"],
    },
    ViewRule {
        module: "dataclasses",
        keep: None,
        drop: &["make_dataclass"],
    },
];

fn view_rule(module: &str) -> Option<&'static ViewRule> {
    VIEW_RULES.iter().find(|rule| rule.module == module)
}

pub struct HostState {
    settings: RefCell<RunSettings>,
    io: RefCell<SandboxIo>,
    budget: RefCell<ExecutionBudget>,
    frame: RefCell<Option<String>>,
    source: RefCell<String>,
    rejected_import: RefCell<Option<String>>,
    running: Cell<bool>,
    handled: RefCell<Vec<PyBaseExceptionRef>>,
    traces: RefCell<Vec<(PyBaseExceptionRef, Vec<TraceEntry>)>>,
    views: RefCell<HashMap<String, PyObjectRef>>,
    replacements: RefCell<HashMap<(String, String), PyObjectRef>>,
    allowed_modules: RefCell<HashSet<usize>>,
    loaded: RefCell<BTreeSet<String>>,
}

impl HostState {
    pub fn new() -> Self {
        let settings = RunSettings::default();
        Self {
            io: RefCell::new(SandboxIo::new(settings.config.max_output_bytes)),
            budget: RefCell::new(ExecutionBudget::from_config(&settings.config)),
            settings: RefCell::new(settings),
            frame: RefCell::new(None),
            source: RefCell::new(String::new()),
            rejected_import: RefCell::new(None),
            running: Cell::new(false),
            handled: RefCell::new(Vec::new()),
            traces: RefCell::new(Vec::new()),
            views: RefCell::new(HashMap::new()),
            replacements: RefCell::new(HashMap::new()),
            allowed_modules: RefCell::new(HashSet::new()),
            loaded: RefCell::new(BTreeSet::new()),
        }
    }

    /// Resets the per-run state and starts the budget clock.
    pub fn begin_run(&self, settings: RunSettings, source: &str) {
        *self.io.borrow_mut() = SandboxIo::new(settings.config.max_output_bytes);
        *self.budget.borrow_mut() = ExecutionBudget::from_config(&settings.config);
        *self.settings.borrow_mut() = settings;
        *self.frame.borrow_mut() = None;
        *self.source.borrow_mut() = source.to_string();
        *self.rejected_import.borrow_mut() = None;
        self.handled.borrow_mut().clear();
        self.traces.borrow_mut().clear();
        self.running.set(true);
    }

    pub fn end_run(&self) {
        self.running.set(false);
        self.handled.borrow_mut().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn config<T>(&self, read: impl FnOnce(&SandboxConfig) -> T) -> T {
        read(&self.settings.borrow().config)
    }

    pub fn write(&self, channel: Channel, text: &str) {
        self.io.borrow_mut().write(channel, text);
    }

    /// Captured stdout and stderr of the current run.
    pub fn output(&self) -> (String, String) {
        let io = self.io.borrow();
        (io.stdout_str(), io.stderr_str())
    }

    pub fn take_frame(&self) -> Option<String> {
        self.frame.borrow_mut().take()
    }

    pub fn tick(&self) -> Result<(), LimitExceeded> {
        self.budget.borrow_mut().tick()
    }

    pub fn enter_call(&self) -> Result<(), LimitExceeded> {
        self.budget.borrow_mut().enter_call()
    }

    pub fn exit_call(&self) {
        self.budget.borrow_mut().exit_call()
    }

    pub fn admit_sleep(&self, duration: Duration) -> Result<Duration, Duration> {
        self.budget.borrow_mut().admit_sleep(duration)
    }

    pub fn exhausted(&self) -> Option<LimitExceeded> {
        self.budget.borrow().exhausted()
    }

    /// Steps charged and deepest nesting of the current run.
    pub fn usage(&self) -> (u64, usize) {
        let budget = self.budget.borrow();
        (budget.consumed(), budget.peak_depth())
    }

    /// Marks `exc` as the exception being handled by an `except` body.
    pub fn push_handled(&self, exc: PyBaseExceptionRef) {
        self.handled.borrow_mut().push(exc);
    }

    pub fn pop_handled(&self) {
        self.handled.borrow_mut().pop();
    }

    pub fn handled_exception(&self) -> Option<PyBaseExceptionRef> {
        self.handled.borrow().last().cloned()
    }

    /// Adds a walker frame to the traceback of `exc`, once per frame.
    pub fn record_frame(&self, exc: &PyBaseExceptionRef, entry: TraceEntry) {
        let id = exc.as_object().get_id();
        let mut traces = self.traces.borrow_mut();
        match traces.iter_mut().find(|(e, _)| e.as_object().get_id() == id) {
            Some((_, entries)) => {
                if !entries.iter().any(|e| e.frame_id == entry.frame_id) {
                    entries.push(entry);
                }
            }
            None => traces.push((exc.clone(), vec![entry])),
        }
    }

    /// Walker frames of `exc`, outermost first.
    pub fn trace_for(&self, exc: &PyBaseExceptionRef) -> Vec<TraceEntry> {
        let id = exc.as_object().get_id();
        self.traces
            .borrow()
            .iter()
            .find(|(e, _)| e.as_object().get_id() == id)
            .map(|(_, entries)| entries.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// A line of the current run's source, as written.
    pub fn source_line(&self, line: usize) -> Option<String> {
        self.source
            .borrow()
            .lines()
            .nth(line.checked_sub(1)?)
            .map(str::to_string)
    }

    pub fn violation_message(&self, module: &str) -> String {
        self.settings.borrow().policy.violation_message(module)
    }

    /// The module name rejected by the import policy, if any import was.
    pub fn rejected_import(&self) -> Option<String> {
        self.rejected_import.borrow().clone()
    }

    /// Registers a host replacement for `module.attr` in module views.
    pub fn replace_in_views(&self, module: &str, attr: &str, value: PyObjectRef) {
        self.replacements
            .borrow_mut()
            .insert((module.to_string(), attr.to_string()), value);
    }

    /// Whether a module object was handed out by the import machinery.
    pub fn is_allowed_module(&self, id: usize) -> bool {
        self.allowed_modules.borrow().contains(&id)
    }

    /// Top-level modules imported so far, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        self.loaded.borrow().iter().cloned().collect()
    }

    /// Resolves `import name`: policy first, then the view cache, then the
    /// standard library or the registry.
    pub fn resolve_import(&self, vm: &VirtualMachine, support: &Support, name: &str) -> PyResult<ResolvedImport> {
        let (class, message) = {
            let settings = self.settings.borrow();
            let class = settings.policy.classify(name);
            (class, settings.policy.violation_message(name))
        };
        if class == ImportClass::Disallowed {
            info!(module = name, "import rejected by policy");
            *self.rejected_import.borrow_mut() = Some(name.to_string());
            return Err(vm.new_import_error(message, vm.ctx.new_str(name)));
        }

        let top_name = top_level(name);
        let top = self.load(vm, support, class, top_name)?;
        let mut leaf = top.clone();
        let mut prefix = top_name.to_string();
        for part in name.split('.').skip(1) {
            prefix = format!("{prefix}.{part}");
            let next = match self.load(vm, support, class, &prefix) {
                Ok(module) => module,
                Err(err) => match leaf.get_attr(&vm.ctx.new_str(part), vm) {
                    Ok(sub) if sub.payload::<PyModule>().is_some() && self.is_allowed_module(sub.get_id()) => sub,
                    _ => return Err(err),
                },
            };
            leaf.set_attr(&vm.ctx.new_str(part), next.clone(), vm)?;
            leaf = next;
        }
        if self.loaded.borrow_mut().insert(top_name.to_string()) {
            debug!(module = top_name, "module loaded");
        }
        Ok(ResolvedImport { top, leaf })
    }

    /// `from module import names`: attributes first, submodules second.
    pub fn import_names(
        &self,
        vm: &VirtualMachine,
        support: &Support,
        module: &str,
        names: &[String],
    ) -> PyResult<Vec<PyObjectRef>> {
        let resolved = self.resolve_import(vm, support, module)?;
        names
            .iter()
            .map(|name| match resolved.leaf.get_attr(&vm.ctx.new_str(name.as_str()), vm) {
                Ok(value) => Ok(value),
                Err(_) => self
                    .resolve_import(vm, support, &format!("{module}.{name}"))
                    .map(|sub| sub.leaf)
                    .map_err(|_| {
                        vm.new_import_error(
                            format!("cannot import name '{name}' from '{module}'"),
                            vm.ctx.new_str(module),
                        )
                    }),
            })
            .collect()
    }

    /// `from module import *`: the public names of the module.
    pub fn import_star(
        &self,
        vm: &VirtualMachine,
        support: &Support,
        module: &str,
    ) -> PyResult<Vec<(String, PyObjectRef)>> {
        let resolved = self.resolve_import(vm, support, module)?;
        let names = match support.call(vm, "module_all", (resolved.leaf.clone(),))? {
            all if vm.is_none(&all) => Vec::<String>::try_from_object(vm, support.call(vm, "public_names", (resolved.leaf.clone(),))?)?,
            all => Vec::<String>::try_from_object(vm, all)?,
        };
        let mut bindings = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(value) = resolved.leaf.get_attr(&vm.ctx.new_str(name.as_str()), vm) {
                bindings.push((name, value));
            }
        }
        Ok(bindings)
    }

    fn not_found(vm: &VirtualMachine, name: &str) -> PyBaseExceptionRef {
        vm.new_exception_msg(
            vm.ctx.exceptions.module_not_found_error.to_owned(),
            format!("No module named '{name}'"),
        )
    }

    fn cached(&self, name: &str) -> Option<PyObjectRef> {
        self.views.borrow().get(name).cloned()
    }

    fn remember(&self, name: &str, module: &PyObjectRef) {
        self.views.borrow_mut().insert(name.to_string(), module.clone());
        self.allowed_modules.borrow_mut().insert(module.get_id());
    }

    fn load(&self, vm: &VirtualMachine, support: &Support, class: ImportClass, name: &str) -> PyResult<PyObjectRef> {
        if let Some(module) = self.cached(name) {
            return Ok(module);
        }
        match class {
            ImportClass::StandardLibrary => self.view(vm, support, name),
            _ => {
                let registry = Arc::clone(&self.settings.borrow().registry);
                let module = registry
                    .instantiate(vm, name)
                    .ok_or_else(|| Self::not_found(vm, name))??;
                self.remember(name, &module);
                Ok(module)
            }
        }
    }

    /// Builds the view scripts get of a standard-library module: its public
    /// names, with modules replaced by their own views or dropped.
    fn view(&self, vm: &VirtualMachine, support: &Support, name: &str) -> PyResult<PyObjectRef> {
        if let Some(view) = self.cached(name) {
            return Ok(view);
        }
        let real = support
            .call(vm, "load_real", (vm.ctx.new_str(name),))
            .map_err(|_| Self::not_found(vm, name))?;
        let view = support.call(vm, "new_module", (vm.ctx.new_str(name),))?;
        // Cached before it is filled, so import cycles meet the same view.
        self.remember(name, &view);

        let rule = view_rule(name);
        let names = match rule.and_then(|r| r.keep) {
            Some(keep) => keep.iter().map(|n| n.to_string()).collect(),
            None => Vec::<String>::try_from_object(vm, support.call(vm, "public_names", (real.clone(),))?)?,
        };
        let dropped = rule.map_or(&[][..], |r| r.drop);
        for attr in names.iter().filter(|n| !dropped.contains(&n.as_str())) {
            let replacement = self
                .replacements
                .borrow()
                .get(&(name.to_string(), attr.clone()))
                .cloned();
            let value = match replacement {
                Some(value) => value,
                None => match real.get_attr(&vm.ctx.new_str(attr.as_str()), vm) {
                    Ok(value) => value,
                    Err(_) => continue,
                },
            };
            let value = if value.payload::<PyModule>().is_some() {
                let sub = String::try_from_object(vm, support.call(vm, "module_name", (value,))?)?;
                if !ImportPolicy::is_standard_library(&sub) {
                    continue;
                }
                self.view(vm, support, &sub)?
            } else {
                value
            };
            view.set_attr(&vm.ctx.new_str(attr.as_str()), value, vm)?;
        }

        if let Ok(all) = support.call(vm, "module_all", (real,)) {
            if !vm.is_none(&all) {
                let all: Vec<String> = Vec::try_from_object(vm, all)?;
                let present: Vec<PyObjectRef> = all
                    .into_iter()
                    .filter(|n| view.get_attr(&vm.ctx.new_str(n.as_str()), vm).is_ok())
                    .map(|n| vm.ctx.new_str(n).into())
                    .collect();
                view.set_attr("__all__", vm.ctx.new_list(present), vm)?;
            }
        }
        debug!(module = name, "module view built");
        Ok(view)
    }

    /// `capture_frame()` called from script code: grabs a frame right away,
    /// without the grace period.
    pub fn capture_now(&self) -> Option<String> {
        let config = self.config(|c| c.capture.clone());
        let outcome = capture::attempt_capture(&config);
        self.io.borrow_mut().stdout.push_str(&outcome.log_text());
        if let Some(payload) = &outcome.payload {
            *self.frame.borrow_mut() = Some(payload.clone());
        }
        outcome.payload
    }

    /// The deferred capture step appended after user code.
    pub fn capture_after_grace(&self, grace_period: Duration) -> CaptureOutcome {
        let config = self.config(|c| c.capture.clone());
        let outcome = capture::capture_after_grace(&config, grace_period);
        self.io.borrow_mut().stdout.push_str(&outcome.log_text());
        if let Some(payload) = &outcome.payload {
            *self.frame.borrow_mut() = Some(payload.clone());
        }
        outcome
    }

    /// Drops every interpreter object the state holds, breaking the cycles
    /// between natives and the modules they were installed in.
    pub fn clear(&self) {
        self.handled.borrow_mut().clear();
        self.traces.borrow_mut().clear();
        self.views.borrow_mut().clear();
        self.replacements.borrow_mut().clear();
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::namespace::Namespace;

    fn settings(additional: &[&str]) -> RunSettings {
        let config = SandboxConfig::builder()
            .additional_imports(additional.iter().copied())
            .build();
        RunSettings::new(config, Arc::new(ModuleRegistry::new()))
    }

    #[test]
    fn test_stdlib_import_is_cached() {
        let ns = Namespace::new();
        let same = ns
            .execute(|host| {
                host.state.begin_run(settings(&[]), "");
                host.enter(|vm| {
                    let first = host.state.resolve_import(vm, &host.support, "math").ok()?;
                    let second = host.state.resolve_import(vm, &host.support, "math").ok()?;
                    Some(first.top.get_id() == second.top.get_id())
                })
            })
            .unwrap();
        assert_eq!(same, Some(true));
        assert!(ns.loaded_modules().contains(&"math".to_string()));
    }

    #[test]
    fn test_rejected_import_names_module() {
        let ns = Namespace::new();
        let (message, rejected) = ns
            .execute(|host| {
                host.state.begin_run(settings(&[]), "");
                host.enter(|vm| {
                    let err = host.state.resolve_import(vm, &host.support, "os").err();
                    let message = err.map(|e| crate::sandbox::runtime::exception_line(host, vm, &e));
                    (message, host.state.rejected_import())
                })
            })
            .unwrap();
        let message = message.unwrap();
        assert!(message.starts_with("ImportError: "));
        assert!(message.contains("'os'"));
        assert_eq!(rejected.as_deref(), Some("os"));
    }

    #[test]
    fn test_whitelisted_but_unprovisioned_module() {
        let ns = Namespace::new();
        let (message, rejected) = ns
            .execute(|host| {
                host.state.begin_run(settings(&["numpy"]), "");
                host.enter(|vm| {
                    let err = host.state.resolve_import(vm, &host.support, "numpy").err();
                    let message = err.map(|e| crate::sandbox::runtime::exception_line(host, vm, &e));
                    (message, host.state.rejected_import())
                })
            })
            .unwrap();
        assert_eq!(message.as_deref(), Some("ModuleNotFoundError: No module named 'numpy'"));
        assert!(rejected.is_none());
    }

    #[test]
    fn test_registered_module_resolves_submodule() {
        let settings = settings(&["geometry"]);
        settings.registry.register_source("geometry", "ORIGIN = (0, 0)\n");
        settings.registry.register_source("geometry.shapes", "SIDES = {'square': 4}\n");
        let ns = Namespace::new();
        let names = ns
            .execute(move |host| {
                host.state.begin_run(settings, "");
                host.enter(|vm| {
                    let resolved = host.state.resolve_import(vm, &host.support, "geometry.shapes").ok()?;
                    let leaf = resolved.leaf.get_attr("__name__", vm).ok()?.str(vm).ok()?.as_str().to_string();
                    let top = resolved.top.get_attr("__name__", vm).ok()?.str(vm).ok()?.as_str().to_string();
                    let missing = host.state.resolve_import(vm, &host.support, "geometry.solids").is_err();
                    Some((top, leaf, missing))
                })
            })
            .unwrap();
        assert_eq!(
            names,
            Some(("geometry".to_string(), "geometry.shapes".to_string(), true))
        );
    }

    #[test]
    fn test_view_hides_host_modules() {
        let ns = Namespace::new();
        let hidden = ns
            .execute(|host| {
                host.state.begin_run(settings(&[]), "");
                host.enter(|vm| {
                    let json = host.state.resolve_import(vm, &host.support, "json").ok()?;
                    let sys = host.state.resolve_import(vm, &host.support, "sys").ok()?;
                    Some((
                        json.top.get_attr("codecs", vm).is_err(),
                        sys.top.get_attr("modules", vm).is_err(),
                        sys.top.get_attr("maxsize", vm).is_ok(),
                    ))
                })
            })
            .unwrap();
        assert_eq!(hidden, Some((true, true, true)));
    }
}
