// src/task/mod.rs

//! Task-level data model: identity, definition, context and results.
//!
//! Everything in here is plain data. It is `serde`-serializable so the
//! forked executor can hand a [`TaskContext`] to a child process and read a
//! [`TaskResult`] back.

pub mod context;
pub mod result;
pub mod selector;
pub mod variables;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use context::{
    DataspaceUris, Executable, ExecutableContainer, FlowKind, FlowScript, ForkEnvironment,
    Script, TaskContext, TaskLauncherInitializer,
};
pub use result::{Branch, FailureKind, FlowAction, Phase, TaskFailure, TaskLogs, TaskResult};
pub use selector::{FileSelector, InputAccessMode, InputSelector, OutputAccessMode, OutputSelector};
pub use variables::{Substitutor, Variables};

/// Identity of one task within one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: u64,
    #[serde(default)]
    pub job_name: String,
    pub task_id: u64,
    #[serde(default)]
    pub task_name: String,
}

impl TaskId {
    pub fn new(job_id: u64, job_name: &str, task_id: u64, task_name: &str) -> Self {
        Self {
            job_id,
            job_name: job_name.to_string(),
            task_id,
            task_name: task_name.to_string(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t{}", self.job_id, self.task_id)
    }
}
