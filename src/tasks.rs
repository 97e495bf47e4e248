//! Asynchronous command tasks: submission, the background worker, polling,
//! and cancellation.

use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::exec;
use crate::service::{validate_execute_shape, SandboxService};
use crate::types::{
    CommandTask, ExecuteCommandAsyncRequest, HistoryEntry, PermissionLevel, TaskStatus,
};

/// A task table slot: the task record plus the handle that terminates its
/// process on cancellation.
pub(crate) struct TaskSlot {
    pub task: CommandTask,
    pub cancel: CancellationToken,
}

impl SandboxService {
    /// Submit a command for background execution and return its task ID
    /// immediately.
    ///
    /// Only the request shape and permission are checked here; the workdir
    /// and argument paths are re-validated by the worker at execution time,
    /// which is the actual enforcement point.
    pub async fn execute_command_async(&self, req: ExecuteCommandAsyncRequest) -> Result<String> {
        validate_execute_shape(&req.command, req.timeout)?;
        {
            let state = self.state.read().await;
            state
                .guard
                .check_permission(&req.command, req.permission_level)?;
        }

        let task_id = Uuid::new_v4().to_string();
        let task = CommandTask {
            id: task_id.clone(),
            command: req.command.clone(),
            args: req.args.clone(),
            work_dir: req.work_dir.clone(),
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            user: req.user.clone(),
            permission_level: req.permission_level,
            environment: req.environment.clone(),
        };
        let cancel = CancellationToken::new();

        self.tasks.write().await.insert(
            task_id.clone(),
            TaskSlot {
                task,
                cancel: cancel.clone(),
            },
        );

        // The worker runs on its own spawned task; a panic inside it is
        // caught here and recorded as a failure instead of taking down the
        // process.
        let service = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn({
                let service = service.clone();
                let id = id.clone();
                async move { service.run_task(&id, req, cancel).await }
            });
            if let Err(e) = worker.await {
                error!(task_id = %id, error = %e, "task worker aborted");
                service
                    .fail_task(&id, format!("task worker aborted: {e}"))
                    .await;
            }
        });

        info!(task_id = %task_id, "async command task created");
        Ok(task_id)
    }

    /// Snapshot of a task by ID.
    pub async fn get_command_task(&self, task_id: &str) -> Result<CommandTask> {
        if task_id.is_empty() {
            return Err(SandboxError::InvalidRequest {
                reason: "task_id is required".to_string(),
            });
        }
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|slot| slot.task.clone())
            .ok_or_else(|| SandboxError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Cancel a pending or running task. The task's cancellation token
    /// terminates the underlying process; tasks that already reached a
    /// terminal status cannot be cancelled.
    pub async fn cancel_command_task(&self, task_id: &str) -> Result<()> {
        if task_id.is_empty() {
            return Err(SandboxError::InvalidRequest {
                reason: "task_id is required".to_string(),
            });
        }
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(task_id)
            .ok_or_else(|| SandboxError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        match slot.task.status {
            TaskStatus::Pending | TaskStatus::Running => {
                slot.task.status = TaskStatus::Cancelled;
                slot.task.end_time = Some(Utc::now());
                slot.cancel.cancel();
                info!(task_id, "command task cancelled");
                Ok(())
            }
            status => Err(SandboxError::TaskNotCancellable { status }),
        }
    }

    /// The background unit of work for one submitted command.
    async fn run_task(&self, task_id: &str, req: ExecuteCommandAsyncRequest, cancel: CancellationToken) {
        let start = Utc::now();
        if !self.begin_task(task_id, start).await {
            // Cancelled before it ever started; nothing ran, nothing to audit.
            return;
        }

        // Execution-time enforcement: submit only pre-checked permission,
        // and the blacklists or workdir may have changed since.
        let validated: Result<(PathBuf, String, PermissionLevel)> = {
            let state = self.state.read().await;
            let requested = if req.work_dir.is_empty() {
                state.work_dir.clone()
            } else {
                req.work_dir.clone()
            };
            match self.resolver.resolve(&requested) {
                Ok(abs) => {
                    if state.guard.is_command_blacklisted(&req.command) {
                        Err(SandboxError::CommandBlacklisted {
                            command: req.command.clone(),
                        })
                    } else if state.guard.is_directory_blacklisted(self.root(), &abs) {
                        Err(SandboxError::DirectoryBlacklisted { path: abs })
                    } else if let Err(e) = state.guard.validate_command_args(
                        self.root(),
                        &req.command,
                        &req.args,
                        &abs,
                    ) {
                        Err(e)
                    } else {
                        Ok((abs, requested, state.guard.level()))
                    }
                }
                Err(e) => Err(e),
            }
        };

        let (work_dir_abs, work_dir_rel, current_level) = match validated {
            Ok(v) => v,
            Err(e) => {
                self.fail_task(task_id, e.to_string()).await;
                return;
            }
        };

        let timeout = exec::clamp_timeout(req.timeout);
        let outcome = exec::run(
            &req.command,
            &req.args,
            &work_dir_abs,
            &req.environment,
            timeout,
            &cancel,
        )
        .await;
        let end = Utc::now();

        // Record the outcome. A task cancelled mid-flight keeps its
        // cancelled status but still gets the output captured before the
        // kill.
        {
            let mut tasks = self.tasks.write().await;
            if let Some(slot) = tasks.get_mut(task_id) {
                let task = &mut slot.task;
                task.stdout = outcome.stdout.clone();
                task.stderr = outcome.stderr.clone();
                task.exit_code = Some(outcome.exit_code);
                if task.end_time.is_none() {
                    task.end_time = Some(end);
                }
                if !task.status.is_terminal() {
                    task.status = if outcome.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    task.error = outcome.error.clone();
                }
            }
        }

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
            user: req.user.clone(),
            permission_level: req.permission_level.unwrap_or(current_level),
            environment: req.environment.clone(),
        };
        self.state.write().await.history.append(entry);
    }

    /// Move a pending task to `Running` with its start time. Returns false
    /// when the task already reached a terminal status.
    async fn begin_task(&self, task_id: &str, start: chrono::DateTime<Utc>) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(slot) if !slot.task.status.is_terminal() => {
                slot.task.status = TaskStatus::Running;
                slot.task.start_time = Some(start);
                true
            }
            _ => false,
        }
    }

    /// Mark a task as failed with an error message, unless it already
    /// reached a terminal status.
    pub(crate) async fn fail_task(&self, task_id: &str, message: String) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.get_mut(task_id) {
            if slot.task.status.is_terminal() {
                return;
            }
            slot.task.status = TaskStatus::Failed;
            slot.task.end_time = Some(Utc::now());
            slot.task.exit_code = Some(-1);
            slot.task.error = Some(message.clone());
        }
        error!(task_id, error = %message, "async command task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryQuery;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn service() -> (TempDir, SandboxService) {
        let dir = TempDir::new().expect("tempdir");
        let service = SandboxService::new(dir.path()).expect("service");
        (dir, service)
    }

    async fn wait_for_terminal(service: &SandboxService, task_id: &str) -> CommandTask {
        for _ in 0..500 {
            let task = service.get_command_task(task_id).await.expect("task");
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached a terminal status");
    }

    async fn wait_for_running(service: &SandboxService, task_id: &str) -> CommandTask {
        for _ in 0..500 {
            let task = service.get_command_task(task_id).await.expect("task");
            if task.status == TaskStatus::Running {
                return task;
            }
            if task.status.is_terminal() {
                panic!("task {task_id} finished before it was observed running");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never started running");
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "echo".to_string(),
            args: vec!["x".to_string()],
            timeout: 10,
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();

        // Visible as soon as submit returns.
        let task = service.get_command_task(&task_id).await.unwrap();
        assert!(!matches!(
            task.status,
            TaskStatus::Failed | TaskStatus::Cancelled
        ));

        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
        assert!(task.stdout.contains('x'));
        assert!(task.start_time.is_some());
        assert!(task.end_time.is_some());
    }

    #[tokio::test]
    async fn completed_task_lands_in_history() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "echo".to_string(),
            args: vec!["audit".to_string()],
            user: "alice".to_string(),
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();
        wait_for_terminal(&service, &task_id).await;

        let query = HistoryQuery {
            user: "alice".to_string(),
            ..Default::default()
        };
        let (entries, total) = service.get_command_history(&query).await;
        assert_eq!(total, 1);
        assert_eq!(entries[0].user, "alice");
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_dir, service) = service().await;
        assert!(matches!(
            service.get_command_task("no-such-task").await,
            Err(SandboxError::TaskNotFound { .. })
        ));
        assert!(matches!(
            service.cancel_command_task("no-such-task").await,
            Err(SandboxError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn submit_rejects_permission_violations_up_front() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "rm".to_string(),
            args: vec!["x".to_string()],
            permission_level: Some(PermissionLevel::ReadOnly),
            ..Default::default()
        };
        assert!(matches!(
            service.execute_command_async(req).await,
            Err(SandboxError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn execution_time_validation_fails_the_task() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "rm".to_string(),
            args: vec!["../../etc/passwd".to_string()],
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();
        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("outside sandbox"));

        // Validation failures never reach the audit log.
        let (_, total) = service.get_command_history(&HistoryQuery::default()).await;
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn cancel_terminates_a_running_task() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            timeout: 60,
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();
        wait_for_running(&service, &task_id).await;

        service.cancel_command_task(&task_id).await.unwrap();
        let task = service.get_command_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.end_time.is_some());

        // The worker notices the kill promptly and the status stays
        // cancelled once the process is reaped.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let task = service.get_command_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn completed_task_cannot_be_cancelled() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "echo".to_string(),
            args: vec!["done".to_string()],
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();
        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);

        let err = service.cancel_command_task(&task_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::TaskNotCancellable { .. }));
        // Terminal status is sticky.
        let task = service.get_command_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failing_command_marks_the_task_failed() {
        let (_dir, service) = service().await;
        let req = ExecuteCommandAsyncRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 9".to_string()],
            ..Default::default()
        };
        let task_id = service.execute_command_async(req).await.unwrap();
        let task = wait_for_terminal(&service, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.exit_code, Some(9));

        // Execution failures are still audited.
        let (entries, total) = service.get_command_history(&HistoryQuery::default()).await;
        assert_eq!(total, 1);
        assert!(!entries[0].success);
    }
}
