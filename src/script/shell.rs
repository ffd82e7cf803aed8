// src/script/shell.rs

//! `sh`/`bash` scripts run as child processes.
//!
//! Variables are exported as environment variables; arguments are passed
//! as positional parameters (`$1`...). Shell scripts cannot change
//! variables, and their value is the exit code.

use serde_json::Value;

use super::{ScriptBindings, ScriptEngine, ScriptError, ScriptIo, ScriptOutcome};
use crate::process::{exported_env, run_supervised, ProcessError, ProcessSpec};
use crate::task::Script;

#[derive(Debug, Clone)]
pub struct ShellEngine {
    shell: String,
}

impl ShellEngine {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }
}

impl ScriptEngine for ShellEngine {
    fn language(&self) -> &str {
        &self.shell
    }

    fn evaluate(
        &self,
        name: &str,
        script: &Script,
        bindings: ScriptBindings,
        io: &ScriptIo<'_>,
    ) -> Result<ScriptOutcome, ScriptError> {
        let mut args = vec!["-c".to_string(), script.code.clone(), name.to_string()];
        args.extend(bindings.args.iter().cloned());
        let env = exported_env(&bindings.variables, &io.env.env);

        let spec = ProcessSpec {
            program: &self.shell,
            args: &args,
            working_dir: io.env.working_dir.as_deref(),
            env: &env,
            own_group: !io.env.inherit_process_group,
        };
        match run_supervised(&spec, io.out, io.err, io.cancel) {
            Ok(0) => Ok(ScriptOutcome {
                value: Value::from(0),
                variables: bindings.variables,
                metadata: bindings.metadata,
                extra: Default::default(),
            }),
            Ok(code) => Err(ScriptError::NonZeroExit(code)),
            Err(ProcessError::Interrupted) => Err(ScriptError::Interrupted),
            Err(e) => Err(ScriptError::Runtime(e.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::ExecutionEnvironment;
    use crate::logger::OutputSink;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn variables_become_environment_and_args_positional() {
        let (out, captured) = OutputSink::capture();
        let cancel = CancellationToken::new();
        let env = ExecutionEnvironment::default();
        let io = ScriptIo {
            out: &out,
            err: &out,
            cancel: &cancel,
            env: &env,
        };
        let bindings = ScriptBindings {
            variables: [("greeting".to_string(), Value::from("hi"))].into(),
            args: vec!["there".into()],
            ..Default::default()
        };
        let script = Script::new("sh", "printf '%s %s' \"$greeting\" \"$1\"");
        let outcome = ShellEngine::new("sh")
            .evaluate("t", &script, bindings, &io)
            .unwrap();
        assert_eq!(captured.contents(), "hi there");
        assert_eq!(outcome.value, Value::from(0));
        assert_eq!(outcome.variables["greeting"], Value::from("hi"));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let out = OutputSink::discard();
        let cancel = CancellationToken::new();
        let env = ExecutionEnvironment::default();
        let io = ScriptIo {
            out: &out,
            err: &out,
            cancel: &cancel,
            env: &env,
        };
        let res = ShellEngine::new("sh").evaluate(
            "t",
            &Script::new("sh", "exit 3"),
            ScriptBindings::default(),
            &io,
        );
        assert!(matches!(res, Err(ScriptError::NonZeroExit(3))));
    }
}
