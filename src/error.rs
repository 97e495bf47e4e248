//! Error types for sandbox operations.

use std::path::PathBuf;

use crate::types::TaskStatus;

/// Errors produced by the sandbox service.
///
/// Validation and security variants are surfaced before any process spawns
/// and before any history entry is written. Each security condition gets its
/// own variant so callers can tell a blacklist hit from a missing file.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Empty or whitespace-only path.
    #[error("path cannot be empty")]
    InvalidPath,

    /// Requested path exceeds the accepted length.
    #[error("path exceeds maximum allowed length of {max} bytes")]
    PathTooLong { max: usize },

    /// Empty or whitespace-only command.
    #[error("command cannot be empty")]
    InvalidCommand,

    /// Timeout outside the accepted range.
    #[error("invalid timeout: {reason}")]
    InvalidTimeout { reason: String },

    /// Malformed request shape (missing or out-of-range fields).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The path resolves outside the sandbox root.
    #[error("sandbox violation: path '{path}' is outside sandbox directory")]
    SandboxViolation { path: String },

    /// The command name is on the blacklist.
    #[error("command '{command}' is blacklisted")]
    CommandBlacklisted { command: String },

    /// The directory is on the blacklist.
    #[error("directory '{}' is blacklisted", path.display())]
    DirectoryBlacklisted { path: PathBuf },

    /// The current or requested permission level does not allow the command.
    #[error("{0}")]
    PermissionDenied(String),

    /// The path does not exist.
    #[error("path not found: {path}")]
    NotFound { path: String },

    /// A directory was required but the path is a file.
    #[error("path '{path}' is not a directory")]
    NotADirectory { path: String },

    /// Unknown task identifier.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// The task already reached a terminal status.
    #[error("task cannot be cancelled, current status: {status}")]
    TaskNotCancellable { status: TaskStatus },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
