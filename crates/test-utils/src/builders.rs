#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tasklaunch::config::LauncherConfig;
use tasklaunch::task::{
    Executable, ExecutableContainer, FileSelector, FlowScript, ForkEnvironment, InputAccessMode,
    InputSelector, OutputAccessMode, OutputSelector, Script, TaskContext, TaskId,
    TaskLauncherInitializer, TaskResult,
};

/// Task id `1000t1` of job `job`.
pub fn task_id() -> TaskId {
    TaskId::new(1000, "job", 1, "task")
}

/// Container running a Lua chunk.
pub fn lua_task(code: &str) -> ExecutableContainer {
    ExecutableContainer::new(Executable::Script(Script::lua(code)))
}

/// Previous-task result carrying `value`.
pub fn previous_result(task: u64, value: Value) -> TaskResult {
    TaskResult::ok(TaskId::new(1000, "job", task, &format!("parent{task}")), value)
}

/// Launcher configuration with short timeouts, scratch under `scratch_root`.
pub fn test_config(scratch_root: &Path) -> LauncherConfig {
    LauncherConfig {
        hostname: "testhost".to_string(),
        scheduler_home: "/opt/scheduler".to_string(),
        scratch_root: scratch_root.to_path_buf(),
        kill_grace: Duration::from_millis(500),
        clean_timeout: Duration::from_millis(500),
        progress_poll: Duration::from_millis(20),
        ..LauncherConfig::default()
    }
}

/// Builder for `TaskLauncherInitializer`.
pub struct InitializerBuilder {
    init: TaskLauncherInitializer,
}

impl InitializerBuilder {
    pub fn new() -> Self {
        Self {
            init: TaskLauncherInitializer::new(task_id()),
        }
    }

    pub fn task_id(mut self, id: TaskId) -> Self {
        self.init.task_id = id;
        self
    }

    pub fn pre(mut self, script: Script) -> Self {
        self.init.pre_script = Some(script);
        self
    }

    pub fn post(mut self, script: Script) -> Self {
        self.init.post_script = Some(script);
        self
    }

    pub fn flow(mut self, flow: FlowScript) -> Self {
        self.init.flow_script = Some(flow);
        self
    }

    pub fn variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.init.variables.insert(name.to_string(), value.into());
        self
    }

    pub fn walltime_ms(mut self, millis: u64) -> Self {
        self.init.walltime_ms = millis;
        self
    }

    pub fn input(mut self, pattern: &str, mode: InputAccessMode) -> Self {
        self.init
            .input_selectors
            .push(InputSelector::new(FileSelector::include(pattern), mode));
        self
    }

    pub fn output(mut self, pattern: &str, mode: OutputAccessMode) -> Self {
        self.init
            .output_selectors
            .push(OutputSelector::new(FileSelector::include(pattern), mode));
        self
    }

    pub fn fork_environment(mut self, fork: ForkEnvironment) -> Self {
        self.init.fork_environment = Some(fork);
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.init.job_owner = Some(owner.to_string());
        self
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.init.iteration_index = iteration;
        self
    }

    pub fn replication(mut self, replication: u32) -> Self {
        self.init.replication_index = replication;
        self
    }

    pub fn precious_logs(mut self, val: bool) -> Self {
        self.init.precious_logs = val;
        self
    }

    pub fn build(self) -> TaskLauncherInitializer {
        self.init
    }

    /// Context for calling an executor directly.
    pub fn context(self, container: ExecutableContainer, previous: Vec<TaskResult>) -> TaskContext {
        TaskContext::new(container, self.init, previous)
    }
}

impl Default for InitializerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
