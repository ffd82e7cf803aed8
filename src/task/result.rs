// src/task/result.rs

//! Task results, failure kinds and flow actions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{TaskId, Variables};

/// Execution phase a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ForkEnvironment,
    Pre,
    Task,
    Post,
    Flow,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ForkEnvironment => "fork environment script",
            Phase::Pre => "pre-script",
            Phase::Task => "task",
            Phase::Post => "post-script",
            Phase::Flow => "flow script",
        };
        f.write_str(name)
    }
}

/// Distinguished failure kinds carried by a failed [`TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    ScriptFailure { phase: Phase },
    DataTransferFailure,
    ProcessSpawnFailure,
    WalltimeExceeded,
    KillRequested,
    DecryptionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(flatten)]
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn script(phase: Phase, message: impl Into<String>) -> Self {
        Self::new(FailureKind::ScriptFailure { phase }, message)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::ScriptFailure { phase } => write!(f, "{phase} failed: {}", self.message),
            FailureKind::DataTransferFailure => write!(f, "data transfer failed: {}", self.message),
            FailureKind::ProcessSpawnFailure => write!(f, "fork failed: {}", self.message),
            FailureKind::WalltimeExceeded => write!(f, "walltime exceeded: {}", self.message),
            FailureKind::KillRequested => write!(f, "task killed: {}", self.message),
            FailureKind::DecryptionFailure => write!(f, "credentials unavailable: {}", self.message),
        }
    }
}

/// Which side of an `If` flow action was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Then,
    Else,
}

/// Control-flow decision produced by a flow script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowAction {
    #[default]
    Continue,
    Replicate {
        runs: u32,
    },
    Loop {
        target: String,
    },
    If {
        then_branch: String,
        else_branch: String,
        continuation: Option<String>,
        selected: Branch,
    },
}

/// Captured stdout/stderr of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskLogs {
    pub stdout: String,
    pub stderr: String,
}

impl TaskLogs {
    pub fn all(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Outcome of one task attempt.
///
/// A failed result still carries whatever value the main executable
/// produced (post and flow failures keep it), the variables visible at the
/// point of failure, the duration and the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub value: Option<Value>,
    pub failure: Option<TaskFailure>,
    #[serde(default)]
    pub propagated_variables: Variables,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub flow_action: FlowAction,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: TaskLogs,
}

impl TaskResult {
    pub fn ok(task_id: TaskId, value: Value) -> Self {
        Self {
            task_id,
            value: Some(value),
            failure: None,
            propagated_variables: Variables::new(),
            metadata: BTreeMap::new(),
            flow_action: FlowAction::Continue,
            duration_ms: 0,
            logs: TaskLogs::default(),
        }
    }

    pub fn failed(task_id: TaskId, failure: TaskFailure) -> Self {
        Self {
            task_id,
            value: None,
            failure: Some(failure),
            propagated_variables: Variables::new(),
            metadata: BTreeMap::new(),
            flow_action: FlowAction::Continue,
            duration_ms: 0,
            logs: TaskLogs::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Replace any existing failure with `failure`, keeping value and logs.
    pub fn override_failure(&mut self, failure: TaskFailure) {
        self.failure = Some(failure);
    }

    /// Record `failure` only if the result has not failed already.
    pub fn fail_if_ok(&mut self, failure: TaskFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }
}
