// src/executor/phases.rs

//! The phase sequence shared by every executor.
//!
//! 1. pre-script: a failure stops here and the result carries no value;
//! 2. main executable: a failure skips the post-script;
//! 3. post-script: a failure keeps the main value;
//! 4. flow script, only after a successful main executable: a failure
//!    keeps the main value, success sets the [`FlowAction`].
//!
//! All phases share one variable map, seeded by
//! [`build_task_variables`] and replaced by whatever each script phase
//! leaves behind.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fork_env::{self, ResolvedForkEnvironment, FORK_ENVIRONMENT_BINDING};
use super::{ExecutionEnvironment, ExecutorServices};
use crate::logger::OutputSink;
use crate::process::{exported_env, run_supervised, ProcessError, ProcessSpec};
use crate::script::{BuiltinCall, ScriptBindings, ScriptError, ScriptIo, ScriptOutcome};
use crate::task::variables::{build_task_variables, nodes_file_path, Substitutor, Tags};
use crate::task::{
    Branch, Executable, FailureKind, FlowAction, FlowKind, Phase, Script, TaskContext,
    TaskFailure, TaskResult, Variables,
};

const RUNS: &str = "runs";
const LOOP: &str = "loop";
const BRANCH: &str = "branch";
const RESULT: &str = "result";

/// Mutable state threaded through the phases.
#[derive(Debug, Default)]
struct PhaseState {
    variables: Variables,
    metadata: BTreeMap<String, String>,
}

pub struct PhaseRunner<'a> {
    context: &'a TaskContext,
    env: &'a ExecutionEnvironment,
    services: &'a ExecutorServices,
    out: OutputSink,
    err: OutputSink,
    cancel: CancellationToken,
    tags: Tags,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(
        context: &'a TaskContext,
        env: &'a ExecutionEnvironment,
        services: &'a ExecutorServices,
        out: OutputSink,
        err: OutputSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            env,
            services,
            out,
            err,
            cancel,
            tags: Tags::for_context(context),
        }
    }

    /// Run every phase. Never panics on task errors; they end up in the
    /// returned result.
    pub fn run(&self) -> TaskResult {
        let started = Instant::now();
        let mut state = PhaseState {
            variables: build_task_variables(self.context),
            metadata: BTreeMap::new(),
        };
        if let Err(e) = self.write_nodes_file() {
            warn!(task = %self.context.task_id(), error = %e, "cannot write nodes file");
        }

        let mut result = self.run_phases(&mut state);
        result.propagated_variables = state.variables;
        result.metadata = state.metadata;
        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            task = %self.context.task_id(),
            ok = result.is_ok(),
            duration_ms = result.duration_ms,
            "phases finished"
        );
        result
    }

    fn run_phases(&self, state: &mut PhaseState) -> TaskResult {
        let task_id = self.context.task_id().clone();
        let init = &self.context.initializer;

        if let Some(pre) = &init.pre_script {
            if let Err(e) = self.run_script(Phase::Pre, pre, state, BTreeMap::new(), Vec::new()) {
                return TaskResult::failed(task_id, self.failure(Phase::Pre, e));
            }
        }

        let value = match self.run_executable(&self.context.executable, state) {
            Ok(value) => value,
            Err(e) => return TaskResult::failed(task_id, self.failure(Phase::Task, e)),
        };
        let mut result = TaskResult::ok(task_id, value.clone());

        if let Some(post) = &init.post_script {
            let extra = BTreeMap::from([(RESULT.to_string(), value.clone())]);
            if let Err(e) = self.run_script(Phase::Post, post, state, extra, Vec::new()) {
                result.fail_if_ok(self.failure(Phase::Post, e));
            }
        }

        if let Some(flow) = &init.flow_script {
            let extra = BTreeMap::from([(RESULT.to_string(), value)]);
            let read_back = vec![flow_binding(&flow.kind)];
            // Propagation stops at the post-script; flow edits are local.
            let propagated = state.variables.clone();
            let decided = self
                .run_script(Phase::Flow, &flow.script, state, extra, read_back)
                .and_then(|outcome| flow_action(&flow.kind, &outcome.extra));
            state.variables = propagated;
            match decided {
                Ok(action) => {
                    debug!(task = %self.context.task_id(), ?action, "flow action");
                    result.flow_action = action;
                }
                Err(e) => result.fail_if_ok(self.failure(Phase::Flow, e)),
            }
        }

        result
    }

    /// Evaluate the environment script, if any, then substitute every field.
    pub fn resolve_fork_environment(&self) -> Result<ResolvedForkEnvironment, TaskFailure> {
        let base = self.context.initializer.fork_environment.clone().unwrap_or_default();
        let mut state = PhaseState {
            variables: build_task_variables(self.context),
            metadata: BTreeMap::new(),
        };

        let fork = match &base.env_script {
            Some(script) => {
                let extra = BTreeMap::from([(
                    FORK_ENVIRONMENT_BINDING.to_string(),
                    fork_env::to_binding(&base),
                )]);
                let outcome = self
                    .run_script(
                        Phase::ForkEnvironment,
                        script,
                        &mut state,
                        extra,
                        vec![FORK_ENVIRONMENT_BINDING],
                    )
                    .map_err(|e| self.failure(Phase::ForkEnvironment, e))?;
                let edited = outcome
                    .extra
                    .get(FORK_ENVIRONMENT_BINDING)
                    .cloned()
                    .unwrap_or(Value::Null);
                fork_env::from_binding(&base, &edited).map_err(|msg| {
                    self.failure(Phase::ForkEnvironment, ScriptError::Binding(msg))
                })?
            }
            None => base,
        };

        Ok(ResolvedForkEnvironment::substituted(
            &fork,
            &self.substitutor(&state.variables),
        ))
    }

    fn substitutor<'v>(&'v self, variables: &'v Variables) -> Substitutor<'v> {
        Substitutor::new(variables)
            .with_credentials(self.env.credentials.map())
            .with_tags(self.tags)
    }

    fn run_script(
        &self,
        phase: Phase,
        script: &Script,
        state: &mut PhaseState,
        extra: BTreeMap<String, Value>,
        read_back: Vec<&'static str>,
    ) -> Result<ScriptOutcome, ScriptError> {
        if self.cancel.is_cancelled() {
            return Err(ScriptError::Interrupted);
        }
        let engine = self.services.engines.get(&script.language)?;
        debug!(task = %self.context.task_id(), %phase, language = %script.language, "running script");

        let args = self.substitutor(&state.variables).substitute_all(&script.args);
        let script = Script {
            language: script.language.clone(),
            code: self.tags.apply(&script.code),
            args: args.clone(),
        };
        let bindings = ScriptBindings {
            args,
            variables: state.variables.clone(),
            results: self.previous_values(),
            metadata: state.metadata.clone(),
            dataspaces: self.context.dataspaces.clone(),
            extra,
            read_back,
        };
        let io = ScriptIo {
            out: &self.out,
            err: &self.err,
            cancel: &self.cancel,
            env: self.env,
        };

        let mut outcome = engine.evaluate(&phase.to_string(), &script, bindings, &io)?;
        state.variables = std::mem::take(&mut outcome.variables);
        state.metadata = std::mem::take(&mut outcome.metadata);
        Ok(outcome)
    }

    fn run_executable(
        &self,
        executable: &Executable,
        state: &mut PhaseState,
    ) -> Result<Value, ScriptError> {
        match executable {
            Executable::Script(script) => self
                .run_script(Phase::Task, script, state, BTreeMap::new(), Vec::new())
                .map(|outcome| outcome.value),
            Executable::Native { command } => self.run_native(command, state),
            Executable::Builtin { name, args } => {
                let body = self
                    .services
                    .builtins
                    .get(name)
                    .ok_or_else(|| ScriptError::Binding(format!("unknown builtin '{name}'")))?;
                let substitutor = self.substitutor(&state.variables);
                let args: BTreeMap<String, Value> = args
                    .iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => Value::String(substitutor.substitute(s)),
                            other => other.clone(),
                        };
                        (k.clone(), v)
                    })
                    .collect();
                body.run(BuiltinCall {
                    args: &args,
                    variables: &mut state.variables,
                    out: &self.out,
                    cancel: &self.cancel,
                })
            }
            Executable::Composite { steps } => {
                let mut last = Value::Null;
                for step in steps {
                    last = self.run_executable(step, state)?;
                }
                Ok(last)
            }
        }
    }

    fn run_native(&self, command: &[String], state: &PhaseState) -> Result<Value, ScriptError> {
        let command = self.substitutor(&state.variables).substitute_all(command);
        let Some((program, args)) = command.split_first() else {
            return Err(ScriptError::Binding("empty native command".into()));
        };
        let env = exported_env(&state.variables, &self.env.env);
        let spec = ProcessSpec {
            program,
            args,
            working_dir: self.env.working_dir.as_deref(),
            env: &env,
            own_group: !self.env.inherit_process_group,
        };
        match run_supervised(&spec, &self.out, &self.err, &self.cancel) {
            Ok(0) => Ok(Value::from(0)),
            Ok(code) => Err(ScriptError::NonZeroExit(code)),
            Err(ProcessError::Interrupted) => Err(ScriptError::Interrupted),
            Err(e) => Err(ScriptError::Runtime(e.to_string())),
        }
    }

    fn previous_values(&self) -> Vec<Value> {
        self.context
            .previous_results
            .iter()
            .map(|r| r.value.clone().unwrap_or(Value::Null))
            .collect()
    }

    /// One line per node: this host first, then the other allocated nodes.
    fn write_nodes_file(&self) -> io::Result<()> {
        let Some(path) = nodes_file_path(self.context) else {
            return Ok(());
        };
        let mut contents = String::new();
        let hostname = &self.context.dataspaces.hostname;
        for node in std::iter::once(hostname).chain(&self.context.other_nodes) {
            if !node.is_empty() {
                contents.push_str(node);
                contents.push('\n');
            }
        }
        fs::write(path, contents)
    }

    fn failure(&self, phase: Phase, error: ScriptError) -> TaskFailure {
        let failure = if self.cancel.is_cancelled() || matches!(error, ScriptError::Interrupted) {
            TaskFailure::new(FailureKind::KillRequested, "task interrupted")
        } else if let ScriptError::Credentials(msg) = &error {
            TaskFailure::new(FailureKind::DecryptionFailure, msg.clone())
        } else {
            TaskFailure::script(phase, error.to_string())
        };
        if failure.kind != FailureKind::KillRequested {
            if let Err(e) = self.err.write_str(&format!("{phase} failed: {error}\n")) {
                debug!(task = %self.context.task_id(), error = %e, "cannot report phase failure");
            }
        }
        info!(task = %self.context.task_id(), %phase, error = %error, "phase failed");
        failure
    }
}

fn flow_binding(kind: &FlowKind) -> &'static str {
    match kind {
        FlowKind::Replicate => RUNS,
        FlowKind::Loop { .. } => LOOP,
        FlowKind::If { .. } => BRANCH,
    }
}

fn flow_action(kind: &FlowKind, extra: &BTreeMap<String, Value>) -> Result<FlowAction, ScriptError> {
    let decided = extra.get(flow_binding(kind)).unwrap_or(&Value::Null);
    match kind {
        FlowKind::Replicate => {
            let runs = decided
                .as_u64()
                .or_else(|| {
                    decided
                        .as_f64()
                        .filter(|f| f.fract() == 0.0 && *f >= 1.0)
                        .map(|f| f as u64)
                })
                .filter(|n| *n >= 1)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    ScriptError::Binding(format!("{RUNS} must be a positive integer, got {decided}"))
                })?;
            Ok(FlowAction::Replicate { runs })
        }
        FlowKind::Loop { target } => match decided {
            Value::Bool(true) => Ok(FlowAction::Loop {
                target: target.clone(),
            }),
            Value::Bool(false) => Ok(FlowAction::Continue),
            other => Err(ScriptError::Binding(format!(
                "{LOOP} must be a boolean, got {other}"
            ))),
        },
        FlowKind::If {
            then_branch,
            else_branch,
            continuation,
        } => {
            let selected = match decided.as_str() {
                Some(s) if s.eq_ignore_ascii_case("if") => Branch::Then,
                Some(s) if s.eq_ignore_ascii_case("else") => Branch::Else,
                _ => {
                    return Err(ScriptError::Binding(format!(
                        "{BRANCH} must be \"if\" or \"else\", got {decided}"
                    )))
                }
            };
            Ok(FlowAction::If {
                then_branch: then_branch.clone(),
                else_branch: else_branch.clone(),
                continuation: continuation.clone(),
                selected,
            })
        }
    }
}
