// src/executor/non_forked.rs

//! For launchers that already run in a dedicated process: the fork
//! environment is honoured (environment script, working directory,
//! environment variables, `-D` properties) but no child is spawned.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::phases::PhaseRunner;
use super::{credential_access, ExecutionEnvironment, ExecutorServices, TaskExecutor};
use crate::logger::OutputSink;
use crate::task::{FailureKind, Phase, TaskContext, TaskFailure, TaskResult};

#[derive(Debug, Clone, Default)]
pub struct NonForkedTaskExecutor {
    services: ExecutorServices,
}

impl NonForkedTaskExecutor {
    pub fn new(services: ExecutorServices) -> Self {
        Self { services }
    }
}

fn run_blocking(
    context: TaskContext,
    services: ExecutorServices,
    out: OutputSink,
    err: OutputSink,
    cancel: CancellationToken,
) -> TaskResult {
    let task_id = context.task_id().clone();
    let bootstrap = ExecutionEnvironment {
        credentials: credential_access(&context),
        ..ExecutionEnvironment::default()
    };
    let resolved = {
        let runner = PhaseRunner::new(
            &context,
            &bootstrap,
            &services,
            out.clone(),
            err.clone(),
            cancel.clone(),
        );
        match runner.resolve_fork_environment() {
            Ok(resolved) => resolved,
            Err(failure) => return TaskResult::failed(task_id, failure),
        }
    };

    if let Some(dir) = &resolved.working_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            let msg = format!("cannot create working directory {}: {e}", dir.display());
            if let Err(e) = err.write_str(&format!("{msg}\n")) {
                debug!(task = %task_id, error = %e, "cannot report working directory failure");
            }
            return TaskResult::failed(
                task_id,
                TaskFailure::new(FailureKind::ProcessSpawnFailure, msg),
            );
        }
    }
    debug!(task = %task_id, ?resolved, "fork environment resolved");

    let env = resolved.execution_environment(bootstrap.credentials);
    PhaseRunner::new(&context, &env, &services, out, err, cancel).run()
}

impl TaskExecutor for NonForkedTaskExecutor {
    fn execute(
        &self,
        context: TaskContext,
        out: OutputSink,
        err: OutputSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send + '_>> {
        Box::pin(async move {
            let task_id = context.task_id().clone();
            let services = self.services.clone();
            tokio::task::spawn_blocking(move || run_blocking(context, services, out, err, cancel))
                .await
                .unwrap_or_else(|e| {
                    error!(task = %task_id, error = %e, "task worker panicked");
                    TaskResult::failed(
                        task_id,
                        TaskFailure::script(Phase::Task, format!("task worker failed: {e}")),
                    )
                })
        })
    }
}
