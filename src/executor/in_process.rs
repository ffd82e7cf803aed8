// src/executor/in_process.rs

//! Runs the phases on a blocking worker thread of this process.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use tracing::error;

use super::phases::PhaseRunner;
use super::{credential_access, ExecutionEnvironment, ExecutorServices, TaskExecutor};
use crate::logger::OutputSink;
use crate::task::{Phase, TaskContext, TaskFailure, TaskResult};

#[derive(Debug, Clone, Default)]
pub struct InProcessTaskExecutor {
    services: ExecutorServices,
}

impl InProcessTaskExecutor {
    pub fn new(services: ExecutorServices) -> Self {
        Self { services }
    }
}

impl TaskExecutor for InProcessTaskExecutor {
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
            let joined = tokio::task::spawn_blocking(move || {
                let env = ExecutionEnvironment {
                    credentials: credential_access(&context),
                    ..ExecutionEnvironment::default()
                };
                PhaseRunner::new(&context, &env, &services, out, err, cancel).run()
            })
            .await;

            joined.unwrap_or_else(|e| {
                error!(task = %task_id, error = %e, "task worker panicked");
                TaskResult::failed(
                    task_id,
                    TaskFailure::script(Phase::Task, format!("task worker failed: {e}")),
                )
            })
        })
    }
}
