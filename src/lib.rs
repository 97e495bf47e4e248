//! Warden - a logical filesystem sandbox with tiered command execution.
//!
//! All operations are confined to a sandbox root by lexical path
//! validation; commands pass a four-level permission model and append-only
//! blacklists before anything spawns. Long-running commands execute as
//! cancellable background tasks, and every execution lands in a bounded
//! audit history.
//!
//! Confinement is logical, not OS-level: paths are validated as strings
//! and symlinks are never resolved, so a symlink planted inside the
//! sandbox that points outside it will not be caught.

pub mod error;
pub mod exec;
pub mod fsops;
pub mod history;
pub mod paths;
pub mod permissions;
pub mod service;
pub mod tasks;
pub mod types;

pub use error::{Result, SandboxError};
pub use service::SandboxService;
