// src/executor/child.rs

//! The child side of [`super::ForkedTaskExecutor`].

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::fork_env::properties_from_runtime_args;
use super::phases::PhaseRunner;
use super::wire::{self, ForkRequest, FrameKind};
use super::{ExecutionEnvironment, ExecutorServices};
use crate::logger::OutputSink;
use crate::task::TaskResult;

/// Read the context frame, run every phase and write the result frame.
///
/// Task failures are reported inside the result; an `Err` here means the
/// exchange itself failed. The parent kills the whole process group to
/// interrupt a task, so no cancellation is wired in.
pub fn run_fork_child(
    context_file: &Path,
    result_file: &Path,
    runtime_args: &[String],
    services: &ExecutorServices,
) -> Result<TaskResult> {
    let request: ForkRequest = wire::read_frame_file(context_file, FrameKind::Context)
        .with_context(|| format!("reading task context from {}", context_file.display()))?;
    let task_id = request.context.task_id().clone();
    debug!(task = %task_id, "forked task running");

    let env = ExecutionEnvironment {
        working_dir: std::env::current_dir().ok(),
        env: Default::default(),
        properties: properties_from_runtime_args(runtime_args),
        credentials: request.credentials,
        inherit_process_group: true,
    };
    let result = PhaseRunner::new(
        &request.context,
        &env,
        services,
        OutputSink::stdout(),
        OutputSink::stderr(),
        CancellationToken::new(),
    )
    .run();

    wire::write_frame_file(result_file, FrameKind::Result, &result)
        .with_context(|| format!("writing task result to {}", result_file.display()))?;
    Ok(result)
}
