// src/task/context.rs

//! Task definition (`TaskLauncherInitializer`, `Executable`) and the
//! per-invocation [`TaskContext`] handed to an executor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{InputSelector, OutputSelector, TaskId, TaskResult, Variables};
use crate::decrypter::Decrypter;

/// Source code in some registered script language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Script {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            args: Vec::new(),
        }
    }

    pub fn lua(code: impl Into<String>) -> Self {
        Self::new("lua", code)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// What a flow script decides and which binding it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowKind {
    /// Reads `runs`.
    Replicate,
    /// Reads `loop`.
    Loop { target: String },
    /// Reads `branch` (`"if"` or `"else"`).
    If {
        then_branch: String,
        else_branch: String,
        #[serde(default)]
        continuation: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowScript {
    pub script: Script,
    pub kind: FlowKind,
}

impl FlowScript {
    pub fn replicate(script: Script) -> Self {
        Self {
            script,
            kind: FlowKind::Replicate,
        }
    }
}

/// The main body of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Executable {
    Script(Script),
    /// Program plus arguments; placeholders are substituted per element.
    Native { command: Vec<String> },
    /// A task body compiled into this binary, looked up by name.
    Builtin {
        name: String,
        #[serde(default)]
        args: BTreeMap<String, Value>,
    },
    /// Runs each step in order; the last step's value is the task value.
    Composite { steps: Vec<Executable> },
}

/// Executable plus the node allocation it runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableContainer {
    pub executable: Executable,
    #[serde(default)]
    pub other_nodes: Vec<String>,
}

impl ExecutableContainer {
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            other_nodes: Vec::new(),
        }
    }
}

/// Settings for a task running in a separate process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForkEnvironment {
    /// May contain placeholders; created if missing.
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Runtime arguments; `-Dkey=value` entries become script properties.
    #[serde(default)]
    pub runtime_args: Vec<String>,
    /// Runs in the launcher before the spawn and may rewrite the fields
    /// above through the `forkEnvironment` binding.
    #[serde(default)]
    pub env_script: Option<Script>,
}

/// Everything the scheduler tells a node about one task, except the
/// executable itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLauncherInitializer {
    pub task_id: TaskId,
    #[serde(default)]
    pub job_owner: Option<String>,
    #[serde(default)]
    pub pre_script: Option<Script>,
    #[serde(default)]
    pub post_script: Option<Script>,
    #[serde(default)]
    pub flow_script: Option<FlowScript>,
    /// Job-level variables.
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub input_selectors: Vec<InputSelector>,
    #[serde(default)]
    pub output_selectors: Vec<OutputSelector>,
    #[serde(default)]
    pub fork_environment: Option<ForkEnvironment>,
    /// Zero disables the walltime.
    #[serde(default)]
    pub walltime_ms: u64,
    #[serde(default)]
    pub iteration_index: u32,
    #[serde(default)]
    pub replication_index: u32,
    #[serde(default)]
    pub precious_logs: bool,
}

impl TaskLauncherInitializer {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            job_owner: None,
            pre_script: None,
            post_script: None,
            flow_script: None,
            variables: Variables::new(),
            input_selectors: Vec::new(),
            output_selectors: Vec::new(),
            fork_environment: None,
            walltime_ms: 0,
            iteration_index: 0,
            replication_index: 0,
            precious_logs: false,
        }
    }
}

/// Dataspace locations visible to the task. Empty strings mean the space is
/// not configured.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataspaceUris {
    pub scratch: String,
    pub input: String,
    pub output: String,
    pub user: String,
    pub global: String,
    pub hostname: String,
}

/// Immutable bundle handed to exactly one executor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub executable: Executable,
    pub initializer: TaskLauncherInitializer,
    /// Index = declared dependency order.
    #[serde(default)]
    pub previous_results: Vec<TaskResult>,
    #[serde(default)]
    pub dataspaces: DataspaceUris,
    #[serde(default)]
    pub other_nodes: Vec<String>,
    #[serde(default)]
    pub scheduler_home: String,
    #[serde(default)]
    pub progress_file: Option<PathBuf>,
    #[serde(skip)]
    pub decrypter: Option<Arc<Decrypter>>,
}

impl TaskContext {
    pub fn new(
        container: ExecutableContainer,
        initializer: TaskLauncherInitializer,
        previous_results: Vec<TaskResult>,
    ) -> Self {
        Self {
            executable: container.executable,
            initializer,
            previous_results,
            dataspaces: DataspaceUris::default(),
            other_nodes: container.other_nodes,
            scheduler_home: String::new(),
            progress_file: None,
            decrypter: None,
        }
    }

    pub fn with_dataspaces(mut self, dataspaces: DataspaceUris) -> Self {
        self.dataspaces = dataspaces;
        self
    }

    pub fn with_scheduler_home(mut self, home: impl Into<String>) -> Self {
        self.scheduler_home = home.into();
        self
    }

    pub fn with_progress_file(mut self, path: Option<PathBuf>) -> Self {
        self.progress_file = path;
        self
    }

    pub fn with_decrypter(mut self, decrypter: Option<Arc<Decrypter>>) -> Self {
        self.decrypter = decrypter;
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.initializer.task_id
    }
}
