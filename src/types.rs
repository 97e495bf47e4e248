//! Shared record types: permission levels, task lifecycle, audit entries,
//! and the flat request/response shapes the service exposes.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordinal permission tier gating which commands may execute.
///
/// The ordering is significant: `ReadOnly < Standard < Elevated < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Only allowlisted query commands may run.
    ReadOnly,
    /// Most commands may run; system-mutating commands are prohibited.
    Standard,
    /// Everything except the blacklist.
    Elevated,
    /// Everything except the blacklist, plus blacklist administration.
    Admin,
}

impl Default for PermissionLevel {
    fn default() -> Self {
        PermissionLevel::Standard
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionLevel::ReadOnly => "readonly",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Elevated => "elevated",
            PermissionLevel::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Lifecycle of an asynchronously executed command.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed | Failed |
/// Cancelled}`, and a terminal status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One asynchronously executing command and everything observed about it.
///
/// Tasks accumulate in the task table for the lifetime of the process; they
/// are never purged.
#[derive(Debug, Clone, Serialize)]
pub struct CommandTask {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: String,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub user: String,
    /// Level explicitly requested at submission; `None` means the service's
    /// current level applies at execution time.
    pub permission_level: Option<PermissionLevel>,
    pub environment: HashMap<String, String>,
}

/// Immutable audit record of one completed command execution.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub success: bool,
    pub user: String,
    pub permission_level: PermissionLevel,
    pub environment: HashMap<String, String>,
}

/// Request for a synchronous command execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the sandbox root; empty means the
    /// service's current working directory.
    #[serde(default)]
    pub work_dir: String,
    /// Timeout in seconds; 0 applies the default.
    #[serde(default)]
    pub timeout: u64,
}

/// Result of a synchronous command execution. A non-zero exit code is data,
/// not an error: the call itself succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteCommandResponse {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub message: String,
}

/// Request for an asynchronous command submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteCommandAsyncRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub timeout: u64,
    /// When non-empty, replaces the child's environment entirely.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub permission_level: Option<PermissionLevel>,
    #[serde(default)]
    pub user: String,
}

/// Pagination and filter parameters for history queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    /// Page size; 0 or anything above the maximum falls back to the maximum.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    /// When non-empty, only entries for this user are returned.
    #[serde(default)]
    pub user: String,
}

/// The effective blacklists: user-managed entries plus the built-in system
/// directories for this OS.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistSnapshot {
    pub commands: Vec<String>,
    pub directories: Vec<String>,
    pub system_directories: Vec<String>,
}

/// Outcome of an operation that can partially succeed (batch delete).
#[derive(Debug, Clone, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
}

/// Metadata for one filesystem entry, with its path expressed relative to
/// the sandbox root.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::ReadOnly < PermissionLevel::Standard);
        assert!(PermissionLevel::Standard < PermissionLevel::Elevated);
        assert!(PermissionLevel::Elevated < PermissionLevel::Admin);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn permission_level_serializes_lowercase() {
        let json = serde_json::to_string(&PermissionLevel::ReadOnly).unwrap();
        assert_eq!(json, "\"readonly\"");
        let level: PermissionLevel = serde_json::from_str("\"elevated\"").unwrap();
        assert_eq!(level, PermissionLevel::Elevated);
    }
}
