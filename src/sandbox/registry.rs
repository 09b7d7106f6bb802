//! Registry of importable third-party modules.
//!
//! The curated standard library is always available. Third-party modules
//! are registered by the provisioning layer before sessions start, as
//! factories that build a fresh module inside each namespace that imports
//! them. Registering a module does not make it importable: the session's
//! [`ImportPolicy`](crate::sandbox::policy::ImportPolicy) still decides.
//!
//! # Example
//!
//! ```rust
//! use script_sandbox_rs::sandbox::registry::ModuleRegistry;
//!
//! let registry = ModuleRegistry::new();
//! registry.register_source("geometry", "ORIGIN = (0, 0)\n");
//! assert!(registry.contains("geometry"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

use rustpython_vm::compiler::Mode;
use rustpython_vm::scope::Scope;
use rustpython_vm::{PyObjectRef, PyResult, VirtualMachine};

/// Builds a fresh instance of a module inside the given interpreter.
pub type ModuleFactory = Arc<dyn Fn(&VirtualMachine) -> PyResult<PyObjectRef> + Send + Sync>;

/// A thread-safe map from module name to factory.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, ModuleFactory>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    /// Create a new registry with no third-party modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a third-party module. Dotted names register
    /// submodules.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&VirtualMachine) -> PyResult<PyObjectRef> + Send + Sync + 'static,
    {
        let mut map = self.modules.write().unwrap_or_else(|e| e.into_inner());
        map.insert(name.into(), Arc::new(factory));
    }

    /// Registers a module whose body is script source, run with the full
    /// builtins each time a namespace imports it.
    pub fn register_source(&self, name: impl Into<String>, source: impl Into<String>) {
        let name = name.into();
        let source = source.into();
        let module_name = name.clone();
        self.register(name, move |vm| {
            let dict = vm.ctx.new_dict();
            let module = vm.new_module(&module_name, dict.clone(), None);
            let code = vm
                .compile(&source, Mode::Exec, format!("<module {module_name}>"))
                .map_err(|err| {
                    vm.new_exception_msg(vm.ctx.exceptions.syntax_error.to_owned(), err.to_string())
                })?;
            vm.run_code_obj(code, Scope::with_builtins(None, dict, vm))?;
            Ok(module.into())
        });
    }

    /// Check if a third-party module is registered.
    pub fn contains(&self, name: &str) -> bool {
        let map = self.modules.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(name)
    }

    /// Remove a module from the registry.
    ///
    /// Returns `true` if the module was present and removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut map = self.modules.write().unwrap_or_else(|e| e.into_inner());
        map.remove(name).is_some()
    }

    /// Clear all registered modules. The standard library is unaffected.
    pub fn clear(&self) {
        let mut map = self.modules.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
    }

    /// Get the number of registered third-party modules.
    pub fn len(&self) -> usize {
        let map = self.modules.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered third-party names, sorted.
    pub fn names(&self) -> Vec<String> {
        let map = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds a registered module inside `vm`, `None` when nothing is
    /// registered under `name`.
    pub fn instantiate(&self, vm: &VirtualMachine, name: &str) -> Option<PyResult<PyObjectRef>> {
        // Clone the factory so the lock is not held while it runs.
        let factory = {
            let map = self.modules.read().unwrap_or_else(|e| e.into_inner());
            map.get(name).cloned()
        }?;
        Some(factory(vm))
    }
}

static GLOBAL_REGISTRY: LazyLock<Arc<ModuleRegistry>> =
    LazyLock::new(|| Arc::new(ModuleRegistry::new()));

/// Get the process-wide registry used by sessions that were not given
/// their own.
pub fn global_registry() -> &'static Arc<ModuleRegistry> {
    &GLOBAL_REGISTRY
}
