//! The sandbox service aggregate and its locking discipline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::exec;
use crate::history::HistoryLog;
use crate::paths::PathResolver;
use crate::permissions::{self, PermissionGuard};
use crate::tasks::TaskSlot;
use crate::types::{
    BlacklistSnapshot, ExecuteCommandRequest, ExecuteCommandResponse, HistoryEntry, HistoryQuery,
    PermissionLevel,
};

/// State guarded by the primary lock: working directory, permission state,
/// and history. Reads and writes here are fast; the task table gets its own
/// lock so task polling stays responsive while a slow command runs.
pub(crate) struct CoreState {
    pub work_dir: String,
    pub guard: PermissionGuard,
    pub history: HistoryLog,
}

/// Aggregate owning all sandbox state. Cheap to clone; clones share state.
///
/// Neither lock is ever held across a process spawn or wait: security
/// checks read a snapshot under the lock, the lock is released, and only
/// then does execution begin.
#[derive(Clone)]
pub struct SandboxService {
    pub(crate) resolver: Arc<PathResolver>,
    pub(crate) state: Arc<RwLock<CoreState>>,
    pub(crate) tasks: Arc<RwLock<HashMap<String, TaskSlot>>>,
}

impl SandboxService {
    /// Create a service rooted at `root`. The directory is created if
    /// missing and canonicalized; it is immutable afterwards.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        if root.as_os_str().is_empty() {
            return Err(SandboxError::InvalidPath);
        }
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        info!(root = %root.display(), "sandbox service initialized");

        Ok(Self {
            resolver: Arc::new(PathResolver::new(root)),
            state: Arc::new(RwLock::new(CoreState {
                work_dir: ".".to_string(),
                guard: PermissionGuard::new(),
                history: HistoryLog::new(),
            })),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The sandbox root all operations are confined to.
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Execute a command synchronously inside the sandbox, blocking the
    /// caller for up to the clamped timeout.
    ///
    /// A non-zero exit code or a timeout is reported as `success=false` in
    /// the response; permission, blacklist, and path violations abort with
    /// an error before any process spawns and before any history is
    /// written.
    pub async fn execute_command(
        &self,
        req: &ExecuteCommandRequest,
    ) -> Result<ExecuteCommandResponse> {
        let start = Utc::now();
        validate_execute_shape(&req.command, req.timeout)?;

        // Snapshot the security checks under the read lock, then release it
        // before spawning. The checks are a snapshot, not a transaction.
        let (work_dir_abs, work_dir_rel, level) = {
            let state = self.state.read().await;
            state.guard.check_permission(&req.command, None)?;
            if state.guard.is_command_blacklisted(&req.command) {
                warn!(command = %req.command, "blocked blacklisted command");
                return Err(SandboxError::CommandBlacklisted {
                    command: req.command.clone(),
                });
            }

            let requested = if req.work_dir.is_empty() {
                state.work_dir.clone()
            } else {
                req.work_dir.clone()
            };
            let abs = self.resolver.resolve(&requested)?;
            if state.guard.is_directory_blacklisted(self.root(), &abs) {
                warn!(directory = %abs.display(), "blocked blacklisted working directory");
                return Err(SandboxError::DirectoryBlacklisted { path: abs });
            }
            state
                .guard
                .validate_command_args(self.root(), &req.command, &req.args, &abs)?;
            (abs, requested, state.guard.level())
        };

        let timeout = exec::clamp_timeout(req.timeout);
        info!(
            command = %req.command,
            args = ?req.args,
            work_dir = %work_dir_abs.display(),
            "executing command"
        );

        let cancel = CancellationToken::new();
        let outcome = exec::run(
            &req.command,
            &req.args,
            &work_dir_abs,
            &HashMap::new(),
            timeout,
            &cancel,
        )
        .await;
        let end = Utc::now();

        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            command: req.command.clone(),
            args: req.args.clone(),
            work_dir: work_dir_rel,
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds(),
            exit_code: outcome.exit_code,
            success: outcome.success,
            user: String::new(),
            permission_level: level,
            environment: HashMap::new(),
        };
        self.state.write().await.history.append(entry);

        let message = if outcome.success {
            "command executed successfully".to_string()
        } else {
            match &outcome.error {
                Some(e) => e.clone(),
                None => format!("command completed with exit code {}", outcome.exit_code),
            }
        };
        Ok(ExecuteCommandResponse {
            success: outcome.success,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            message,
        })
    }

    /// Snapshot of the command and directory blacklists, plus the built-in
    /// system directories.
    pub async fn get_command_blacklist(&self) -> BlacklistSnapshot {
        let state = self.state.read().await;
        BlacklistSnapshot {
            commands: state.guard.blacklist_commands().to_vec(),
            directories: state.guard.blacklist_directories().to_vec(),
            system_directories: permissions::system_directories()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Append entries to the blacklists. Append-only: there is no removal.
    pub async fn update_command_blacklist(
        &self,
        commands: &[String],
        directories: &[String],
    ) -> Result<()> {
        if commands.is_empty() && directories.is_empty() {
            return Err(SandboxError::InvalidRequest {
                reason: "at least one command or directory must be provided".to_string(),
            });
        }
        self.state
            .write()
            .await
            .guard
            .update_blacklist(commands, directories);
        Ok(())
    }

    /// The current working directory, relative to the sandbox root.
    pub async fn working_directory(&self) -> String {
        self.state.read().await.work_dir.clone()
    }

    /// Change the working directory. The target must resolve inside the
    /// sandbox, exist, be a directory, and not be blacklisted.
    pub async fn change_directory(&self, path: &str) -> Result<()> {
        let abs = self.resolver.resolve(path)?;
        let meta = std::fs::metadata(&abs).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::NotFound {
                    path: path.to_string(),
                }
            } else {
                SandboxError::Io(e)
            }
        })?;
        if !meta.is_dir() {
            return Err(SandboxError::NotADirectory {
                path: path.to_string(),
            });
        }

        let mut state = self.state.write().await;
        if state.guard.is_directory_blacklisted(self.root(), &abs) {
            warn!(directory = %abs.display(), "blocked blacklisted directory");
            return Err(SandboxError::DirectoryBlacklisted { path: abs });
        }
        state.work_dir = self.resolver.relative(&abs).to_string_lossy().into_owned();
        info!(work_dir = %state.work_dir, "working directory changed");
        Ok(())
    }

    /// The service-wide permission level.
    pub async fn permission_level(&self) -> PermissionLevel {
        self.state.read().await.guard.level()
    }

    /// Set the service-wide permission level.
    pub async fn set_permission_level(&self, level: PermissionLevel) {
        let mut state = self.state.write().await;
        let old = state.guard.level();
        state.guard.set_level(level);
        info!(old_level = %old, new_level = %level, "permission level changed");
    }

    /// Page through the execution history, optionally filtered by user.
    /// Returns the page and the post-filter total.
    pub async fn get_command_history(&self, query: &HistoryQuery) -> (Vec<HistoryEntry>, usize) {
        self.state
            .read()
            .await
            .history
            .query(query.limit, query.offset, &query.user)
    }

    /// Drop the entire history, returning how many entries were removed.
    pub async fn clear_command_history(&self) -> usize {
        self.state.write().await.history.clear()
    }
}

/// Shape validation shared by the sync and async execution paths: the
/// command must be non-empty and the timeout within range. (Timeouts are
/// unsigned, so "negative" is unrepresentable.)
pub(crate) fn validate_execute_shape(command: &str, timeout: u64) -> Result<()> {
    if command.trim().is_empty() {
        return Err(SandboxError::InvalidCommand);
    }
    if timeout > exec::MAX_COMMAND_TIMEOUT {
        return Err(SandboxError::InvalidTimeout {
            reason: format!(
                "timeout exceeds maximum allowed timeout of {} seconds",
                exec::MAX_COMMAND_TIMEOUT
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn service() -> (TempDir, SandboxService) {
        let dir = TempDir::new().expect("tempdir");
        let service = SandboxService::new(dir.path()).expect("service");
        (dir, service)
    }

    #[tokio::test]
    async fn echo_hello_succeeds_with_default_timeout() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "echo".to_string(),
            args: vec!["hello".to_string()],
            work_dir: ".".to_string(),
            timeout: 0,
        };
        let res = service.execute_command(&req).await.unwrap();
        assert!(res.success);
        assert_eq!(res.exit_code, 0);
        assert!(res.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn blacklisted_command_is_rejected_before_running() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "shutdown".to_string(),
            ..Default::default()
        };
        let err = service.execute_command(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::CommandBlacklisted { .. }));
        // Nothing ran, so nothing was audited.
        let (_, total) = service.get_command_history(&HistoryQuery::default()).await;
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn rm_with_escaping_argument_is_rejected() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "rm".to_string(),
            args: vec!["../../etc/passwd".to_string()],
            ..Default::default()
        };
        let err = service.execute_command(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::SandboxViolation { .. }));
        assert!(err.to_string().contains("outside sandbox"));
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest::default();
        assert!(matches!(
            service.execute_command(&req).await,
            Err(SandboxError::InvalidCommand)
        ));
    }

    #[tokio::test]
    async fn oversized_timeout_is_invalid() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "echo".to_string(),
            timeout: 4000,
            ..Default::default()
        };
        assert!(matches!(
            service.execute_command(&req).await,
            Err(SandboxError::InvalidTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn read_only_level_rejects_mutating_commands() {
        let (_dir, service) = service().await;
        service.set_permission_level(PermissionLevel::ReadOnly).await;
        let req = ExecuteCommandRequest {
            command: "rm".to_string(),
            args: vec!["x".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            service.execute_command(&req).await,
            Err(SandboxError::PermissionDenied(_))
        ));

        // Allowlisted commands still pass.
        let req = ExecuteCommandRequest {
            command: "echo".to_string(),
            args: vec!["ok".to_string()],
            ..Default::default()
        };
        assert!(service.execute_command(&req).await.unwrap().success);
    }

    #[tokio::test]
    async fn executions_are_audited() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "echo".to_string(),
            args: vec!["audited".to_string()],
            ..Default::default()
        };
        service.execute_command(&req).await.unwrap();

        let (entries, total) = service.get_command_history(&HistoryQuery::default()).await;
        assert_eq!(total, 1);
        assert_eq!(entries[0].command, "echo");
        assert!(entries[0].success);
        assert_eq!(entries[0].exit_code, 0);

        assert_eq!(service.clear_command_history().await, 1);
        let (_, total) = service.get_command_history(&HistoryQuery::default()).await;
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn failed_executions_are_audited_too() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 7".to_string()],
            ..Default::default()
        };
        let res = service.execute_command(&req).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.exit_code, 7);

        let (entries, _) = service.get_command_history(&HistoryQuery::default()).await;
        assert!(!entries[0].success);
        assert_eq!(entries[0].exit_code, 7);
    }

    #[tokio::test]
    async fn change_directory_tracks_relative_path() {
        let (dir, service) = service().await;
        std::fs::create_dir_all(dir.path().join("work/sub")).unwrap();

        assert_eq!(service.working_directory().await, ".");
        service.change_directory("work/sub").await.unwrap();
        assert_eq!(service.working_directory().await, "work/sub");

        // Executions pick up the new working directory.
        let req = ExecuteCommandRequest {
            command: "pwd".to_string(),
            ..Default::default()
        };
        let res = service.execute_command(&req).await.unwrap();
        assert!(res.stdout.trim().ends_with("work/sub"));
    }

    #[tokio::test]
    async fn change_directory_rejects_escapes_and_missing_dirs() {
        let (dir, service) = service().await;
        assert!(matches!(
            service.change_directory("../outside").await,
            Err(SandboxError::SandboxViolation { .. })
        ));
        assert!(matches!(
            service.change_directory("no-such-dir").await,
            Err(SandboxError::NotFound { .. })
        ));

        std::fs::write(dir.path().join("plain.txt"), "x").unwrap();
        assert!(matches!(
            service.change_directory("plain.txt").await,
            Err(SandboxError::NotADirectory { .. })
        ));
    }

    #[tokio::test]
    async fn blacklist_update_is_idempotent_and_effective() {
        let (_dir, service) = service().await;
        let before = service.get_command_blacklist().await.commands.len();

        let additions = vec!["curl".to_string()];
        service
            .update_command_blacklist(&additions, &[])
            .await
            .unwrap();
        service
            .update_command_blacklist(&additions, &[])
            .await
            .unwrap();

        let snapshot = service.get_command_blacklist().await;
        assert_eq!(snapshot.commands.len(), before + 1);

        let req = ExecuteCommandRequest {
            command: "curl".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            service.execute_command(&req).await,
            Err(SandboxError::CommandBlacklisted { .. })
        ));
    }

    #[tokio::test]
    async fn empty_blacklist_update_is_rejected() {
        let (_dir, service) = service().await;
        assert!(matches!(
            service.update_command_blacklist(&[], &[]).await,
            Err(SandboxError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn permission_level_round_trips() {
        let (_dir, service) = service().await;
        assert_eq!(service.permission_level().await, PermissionLevel::Standard);
        service.set_permission_level(PermissionLevel::Elevated).await;
        assert_eq!(service.permission_level().await, PermissionLevel::Elevated);
    }
}
