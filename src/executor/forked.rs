// src/executor/forked.rs

//! Runs the phases in a child process.
//!
//! The launcher resolves the fork environment, writes a context frame to an
//! exchange directory and re-invokes the runtime binary as
//! `<runtime> fork-child --context <file> --result <file> -- <runtime args>`.
//! The child runs the phases, writes a result frame and exits. Output is
//! streamed through the child's stdout/stderr.
//!
//! The child leads its own process group; a kill, or dropping the future,
//! SIGKILLs the whole group.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Instant;

use anyhow::Context;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fork_env::ResolvedForkEnvironment;
use super::phases::PhaseRunner;
use super::wire::{self, ForkRequest, FrameKind};
use super::{credential_access, ExecutionEnvironment, ExecutorServices, TaskExecutor};
use crate::decrypter::CredentialAccess;
use crate::logger::OutputSink;
use crate::process::{drain, exit_code, pump_output, ProcessGroupGuard};
use crate::task::{FailureKind, TaskContext, TaskFailure, TaskResult};

pub const CONTEXT_FILE: &str = "context.bin";
pub const RESULT_FILE: &str = "result.bin";

/// Where the child comes from and where exchange files go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ForkSettings {
    /// Binary providing the `fork-child` subcommand; defaults to the
    /// running executable.
    #[serde(default)]
    pub runtime: Option<PathBuf>,
    /// Parent of the per-task exchange directories; defaults to the system
    /// temporary directory.
    #[serde(default)]
    pub exchange_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ForkedTaskExecutor {
    services: ExecutorServices,
    settings: ForkSettings,
}

impl ForkedTaskExecutor {
    pub fn new(services: ExecutorServices, settings: ForkSettings) -> Self {
        Self { services, settings }
    }

    fn runtime(&self) -> Result<PathBuf, TaskFailure> {
        match &self.settings.runtime {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                spawn_failure(format!("cannot locate the runtime executable: {e}"))
            }),
        }
    }

    async fn run_child(
        &self,
        context: TaskContext,
        out: OutputSink,
        err: OutputSink,
        cancel: CancellationToken,
    ) -> Result<TaskResult, TaskFailure> {
        let task_id = context.task_id().clone();
        let credentials = credential_access(&context);
        let (context, resolved) =
            resolve_environment(context, credentials.clone(), &self.services, &out, &err, &cancel)
                .await?;

        if let Some(dir) = &resolved.working_dir {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                spawn_failure(format!(
                    "cannot create working directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let exchange = self.exchange_dir()?;
        let context_file = exchange.path().join(CONTEXT_FILE);
        let result_file = exchange.path().join(RESULT_FILE);
        let request = ForkRequest {
            context,
            credentials,
        };
        wire::write_frame_file(&context_file, FrameKind::Context, &request)
            .map_err(|e| spawn_failure(format!("cannot serialize task context: {e}")))?;

        let runtime = self.runtime()?;
        let mut command = Command::new(&runtime);
        command
            .arg("fork-child")
            .arg("--context")
            .arg(&context_file)
            .arg("--result")
            .arg(&result_file)
            .arg("--")
            .args(&resolved.runtime_args)
            .envs(&resolved.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &resolved.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        if cancel.is_cancelled() {
            return Err(TaskFailure::new(FailureKind::KillRequested, "task interrupted"));
        }

        let mut child = command.spawn().map_err(|e| {
            spawn_failure(format!("cannot start runtime {}: {e}", runtime.display()))
        })?;
        let guard = ProcessGroupGuard(child.id());
        info!(task = %task_id, pid = ?child.id(), runtime = %runtime.display(), "forked task started");

        let pumps = pump_output(&mut child, &out, &err);

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| spawn_failure(format!("waiting for forked task failed: {e}")))?;
                // Leftover background processes die with the group.
                drop(guard);
                drain(pumps).await;
                let code = exit_code(status);
                debug!(task = %task_id, code, "forked task exited");
                read_result(&result_file, code)
            }
            _ = cancel.cancelled() => {
                info!(task = %task_id, "killing forked task");
                drop(guard);
                if let Err(e) = child.kill().await {
                    debug!(task = %task_id, error = %e, "child already gone");
                }
                drain(pumps).await;
                Err(TaskFailure::new(FailureKind::KillRequested, "task interrupted"))
            }
        }
    }

    fn exchange_dir(&self) -> Result<tempfile::TempDir, TaskFailure> {
        let parent = self
            .settings
            .exchange_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix("tasklaunch-fork-")
                    .tempdir_in(&parent)
            })
            .map_err(|e| {
                spawn_failure(format!(
                    "cannot create exchange directory in {}: {e}",
                    parent.display()
                ))
            })
    }
}

impl TaskExecutor for ForkedTaskExecutor {
    fn execute(
        &self,
        context: TaskContext,
        out: OutputSink,
        err: OutputSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send + '_>> {
        Box::pin(async move {
            let started = Instant::now();
            let task_id = context.task_id().clone();
            match self.run_child(context, out, err.clone(), cancel).await {
                Ok(result) => result,
                Err(failure) => {
                    if failure.kind == FailureKind::ProcessSpawnFailure {
                        warn!(task = %task_id, error = %failure.message, "forked task failed");
                        if let Err(e) = err.write_str(&format!("{}\n", failure.message)) {
                            debug!(task = %task_id, error = %e, "cannot report spawn failure");
                        }
                    }
                    let mut result = TaskResult::failed(task_id, failure);
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    result
                }
            }
        })
    }
}

fn spawn_failure(message: String) -> TaskFailure {
    TaskFailure::new(FailureKind::ProcessSpawnFailure, message)
}

/// Runs the environment script on a blocking thread; it may be Lua.
async fn resolve_environment(
    context: TaskContext,
    credentials: CredentialAccess,
    services: &ExecutorServices,
    out: &OutputSink,
    err: &OutputSink,
    cancel: &CancellationToken,
) -> Result<(TaskContext, ResolvedForkEnvironment), TaskFailure> {
    let services = services.clone();
    let (out, err, cancel) = (out.clone(), err.clone(), cancel.clone());
    let joined = tokio::task::spawn_blocking(move || {
        let bootstrap = ExecutionEnvironment {
            credentials,
            ..ExecutionEnvironment::default()
        };
        let resolved =
            PhaseRunner::new(&context, &bootstrap, &services, out, err, cancel)
                .resolve_fork_environment();
        (context, resolved)
    })
    .await
    .context("fork environment worker")
    .map_err(|e| spawn_failure(format!("{e:#}")))?;

    let (context, resolved) = joined;
    Ok((context, resolved?))
}

fn read_result(path: &Path, code: i32) -> Result<TaskResult, TaskFailure> {
    if !path.exists() {
        return Err(spawn_failure(format!(
            "forked task exited with code {code} without producing a result"
        )));
    }
    wire::read_frame_file(path, FrameKind::Result)
        .map_err(|e| spawn_failure(format!("cannot read forked task result: {e}")))
}
