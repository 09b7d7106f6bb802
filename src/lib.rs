//! # Script Sandbox
//!
//! Policy-constrained execution sessions for untrusted scripts.
//!
//! A caller opens a session, submits source text, and gets back stdout,
//! stderr, an exit code and optionally a frame grabbed from a virtual
//! display. Variables and functions persist across submissions until the
//! session is reset. Scripts are Python, run by an embedded RustPython
//! interpreter with a curated standard library, through one of two
//! backends:
//!
//! - **Interpreted**: walks the syntax tree, refusing any node outside a
//!   whitelist (no decorators, `global`, `nonlocal` or `match`), and echoes
//!   the value of a trailing expression.
//! - **Restricted**: rewrites the source so attribute, item and iteration
//!   reads go through guard calls, rejects `__` names before compiling,
//!   then runs the result with the full language.
//!
//! Both enforce the session's import whitelist: the bundled standard
//! library is always importable, third-party modules only when named in
//! the whitelist and present in the [`ModuleRegistry`](sandbox::registry::ModuleRegistry).
//!
//! ## Example
//!
//! ```rust
//! use script_sandbox_rs::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = SandboxConfig::builder()
//!         .backend(BackendKind::Restricted)
//!         .build();
//!
//!     let mut session = Session::start(config);
//!     session.run("x = 20 + 1")?;
//!     let observation = session.run("print(x * 2)")?;
//!
//!     assert_eq!(observation.stdout, "42\n");
//!     assert!(observation.is_success());
//!     assert_eq!(session.state().step_count, 2);
//!
//!     Ok(())
//! }
//! ```
//!
//! Async callers use [`SessionManager`](sandbox::manager::SessionManager),
//! which runs each session on its own worker thread:
//!
//! ```rust,ignore
//! let manager = SessionManager::new(SandboxConfig::from_env()?);
//! let id = manager.create_session(["numpy"], BackendKind::Interpreted)?;
//! let observation = manager.submit(&id, "print('Hello')", false).await?;
//! ```
//!
//! ## Failure model
//!
//! Nothing a script does fails a session. Syntax errors, policy
//! violations, exceptions and exhausted budgets come back as an
//! observation with `exit_code = 1` and a traceback in stderr; the
//! namespace keeps whatever the script bound before failing.
//! [`SandboxError`] is reserved for host-level problems such as an
//! unknown session id or a malformed JSON submission.

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{Result, SandboxError};
pub use sandbox::config::{BackendKind, CaptureConfig, SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::{Backend, ErrorKind, ExecResult, ExecutorBackend};
pub use sandbox::manager::SessionManager;
pub use sandbox::namespace::Namespace;
pub use sandbox::policy::ImportPolicy;
pub use sandbox::registry::{global_registry, ModuleRegistry};
pub use sandbox::session::{Observation, Session, SessionState, Submission};
