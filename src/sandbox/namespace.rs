//! The execution namespace of a session.
//!
//! A namespace owns one script interpreter, running on a dedicated thread
//! with a large stack: the session globals, the module views imported so
//! far and the helpers the backends install all live there. Everything
//! else talks to it by sending jobs, so a `Namespace` handle is `Send` and
//! sessions can move between threads. It survives across submissions and
//! is replaced wholesale on reset.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use rustpython_vm::{AsObject, PyResult, TryFromObject, VirtualMachine};
use tracing::{debug, error};

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::executor::panic_text;
use crate::sandbox::runtime::VmHost;

type Job = Box<dyn FnOnce(&VmHost) + Send>;

/// Helpers available as builtins in every namespace.
pub const HELPERS: &[&str] = &["format_exc", "safe_json_dumps", "capture_frame"];

pub struct Namespace {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::with_stack_size(SandboxConfig::default().worker_stack_size)
    }

    /// Starts the interpreter thread with `stack_size` bytes of stack.
    pub fn with_stack_size(stack_size: usize) -> Self {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("namespace-vm".to_string())
            .stack_size(stack_size)
            .spawn(move || {
                let host = match VmHost::new() {
                    Ok(host) => host,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "script runtime failed to start");
                        return;
                    }
                };
                while let Ok(job) = inbox.recv() {
                    job(&host);
                }
                debug!("namespace runtime stopped");
            });
        match spawned {
            Ok(worker) => Self {
                jobs: Some(jobs),
                worker: Some(worker),
            },
            Err(err) => {
                error!(error = %err, "could not spawn namespace thread");
                Self {
                    jobs: None,
                    worker: None,
                }
            }
        }
    }

    /// Runs `job` on the interpreter thread and waits for its answer. A
    /// panic inside the job is reported as [`SandboxError::Runtime`].
    pub(crate) fn execute<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&VmHost) -> R + Send + 'static,
    {
        let gone = || SandboxError::WorkerGone("namespace runtime".to_string());
        let jobs = self.jobs.as_ref().ok_or_else(gone)?;
        let (reply, answer) = mpsc::sync_channel(1);
        jobs.send(Box::new(move |host: &VmHost| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(host)));
            let _ = reply.send(outcome.map_err(panic_text));
        }))
        .map_err(|_| gone())?;
        match answer.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SandboxError::Runtime(message)),
            Err(_) => Err(gone()),
        }
    }

    fn query<R, F>(&self, default: R, read: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&VmHost, &VirtualMachine) -> PyResult<R> + Send + 'static,
    {
        self.execute(move |host| host.enter(|vm| read(host, vm).ok()))
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    /// `repr` of a global.
    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_string();
        self.query(None, move |host, vm| {
            host.globals
                .get_item_opt(name.as_str(), vm)?
                .map(|value| value.repr(vm).map(|r| r.as_str().to_string()))
                .transpose()
        })
    }

    /// Binds a global to the value decoded from `json`.
    pub fn set_json(&self, name: &str, json: &serde_json::Value) -> Result<()> {
        let (name, text) = (name.to_string(), json.to_string());
        self.execute(move |host| {
            host.enter(|vm| -> PyResult<()> {
                let value = host.support.call(vm, "from_json", (vm.ctx.new_str(text),))?;
                host.globals.set_item(name.as_str(), value, vm)
            })
            .map_err(|_| SandboxError::InvalidSubmission(format!("cannot bind '{name}'")))
        })?
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = name.to_string();
        self.query(false, move |host, vm| {
            Ok(host.globals.get_item_opt(name.as_str(), vm)?.is_some())
        })
    }

    /// Removes a global; `true` when it was bound.
    pub fn remove(&self, name: &str) -> bool {
        let name = name.to_string();
        self.query(false, move |host, vm| {
            if host.globals.get_item_opt(name.as_str(), vm)?.is_none() {
                return Ok(false);
            }
            host.globals.del_item(name.as_str(), vm)?;
            Ok(true)
        })
    }

    /// Number of global bindings, including `__name__` and `__builtins__`.
    pub fn len(&self) -> usize {
        self.query(0, |host, _vm| Ok(host.globals.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Globals defined by user code, sorted.
    pub fn user_names(&self) -> Vec<String> {
        self.query(Vec::new(), |host, vm| {
            let names = host
                .support
                .call(vm, "user_names", (host.globals.clone(),))?;
            Vec::<String>::try_from_object(vm, names)
        })
    }

    /// Name to `repr` of every global. Two snapshots are equal exactly when
    /// a run left the namespace untouched.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.query(BTreeMap::new(), |host, vm| {
            host.support
                .call_json(vm, "snapshot_json", (host.globals.clone(),))
        })
    }

    /// Top-level modules imported so far, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        self.query(Vec::new(), |host, _vm| Ok(host.state.loaded_modules()))
    }

    /// Whether a builtin name resolves in this namespace.
    pub fn has_builtin(&self, name: &str) -> bool {
        let name = name.to_string();
        self.query(false, move |_host, vm| {
            Ok(vm.builtins.as_object().get_attr(&vm.ctx.new_str(name.as_str()), vm).is_ok())
        })
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("globals", &self.user_names())
            .field("modules", &self.loaded_modules())
            .finish()
    }
}
