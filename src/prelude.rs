//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    config::{BackendKind, CaptureConfig, SandboxConfig},
    executor::{ErrorKind, ExecResult},
    manager::SessionManager,
    registry::ModuleRegistry,
    session::{Observation, Session, SessionState, Submission},
};
