//! Sandbox module containing the session runtime: policy, namespace,
//! backends, capture, and the controllers that drive them.

pub mod capture;
pub mod config;
pub mod context;
pub mod executor;
pub mod guards;
pub mod interpreted;
pub mod io;
pub mod limits;
pub mod manager;
pub mod namespace;
pub mod policy;
pub mod registry;
pub mod restricted;
pub mod runtime;
pub mod session;
pub mod syntax;
