// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{LauncherConfig, RawLauncherConfig, RawTaskFile, TaskFile};
use crate::errors::{LaunchError, Result};
use crate::script::{Builtins, ScriptEngines};
use crate::task::{Executable, ExecutableContainer, FlowKind, Script};

impl TryFrom<RawLauncherConfig> for LauncherConfig {
    type Error = LaunchError;

    fn try_from(raw: RawLauncherConfig) -> std::result::Result<Self, Self::Error> {
        let section = raw.launcher;
        if section.log_max_lines == 0 {
            return Err(LaunchError::ConfigError(
                "[launcher].log_max_lines must be >= 1 (got 0)".to_string(),
            ));
        }
        if section.progress_poll_ms == 0 {
            return Err(LaunchError::ConfigError(
                "[launcher].progress_poll_ms must be >= 1 (got 0)".to_string(),
            ));
        }
        let hostname = match section.hostname {
            Some(name) if name.trim().is_empty() => {
                return Err(LaunchError::ConfigError(
                    "[launcher].hostname must not be empty".to_string(),
                ))
            }
            Some(name) => name,
            None => local_hostname(),
        };

        Ok(LauncherConfig {
            hostname,
            scheduler_home: section.scheduler_home,
            scratch_root: section.scratch_root.unwrap_or_else(std::env::temp_dir),
            kill_grace: Duration::from_millis(section.kill_grace_ms),
            clean_timeout: Duration::from_millis(section.clean_timeout_ms),
            progress_poll: Duration::from_millis(section.progress_poll_ms),
            log_max_lines: section.log_max_lines,
            log_prefix: section.log_prefix,
            fork: raw.fork,
            dataspaces: raw.dataspaces,
        })
    }
}

impl TryFrom<RawTaskFile> for TaskFile {
    type Error = LaunchError;

    fn try_from(raw: RawTaskFile) -> std::result::Result<Self, Self::Error> {
        let engines = ScriptEngines::with_defaults();
        let builtins = Builtins::with_defaults();
        let init = &raw.task;

        for (what, script) in [
            ("pre_script", init.pre_script.as_ref()),
            ("post_script", init.post_script.as_ref()),
            ("flow_script", init.flow_script.as_ref().map(|f| &f.script)),
            (
                "fork_environment.env_script",
                init.fork_environment.as_ref().and_then(|f| f.env_script.as_ref()),
            ),
        ] {
            if let Some(script) = script {
                check_script(&engines, what, script)?;
            }
        }
        if let Some(flow) = &init.flow_script {
            if let FlowKind::Loop { target } = &flow.kind {
                if target.trim().is_empty() {
                    return Err(LaunchError::ConfigError(
                        "loop flow script needs a non-empty target".to_string(),
                    ));
                }
            }
        }
        check_executable(&engines, &builtins, &raw.executable)?;

        for selector in &init.input_selectors {
            check_selector(&selector.selector)?;
        }
        for selector in &init.output_selectors {
            check_selector(&selector.selector)?;
        }

        Ok(TaskFile {
            initializer: raw.task,
            container: ExecutableContainer {
                executable: raw.executable,
                other_nodes: raw.other_nodes,
            },
            executor: raw.executor,
            credentials: raw.credentials,
        })
    }
}

fn check_script(engines: &ScriptEngines, what: &str, script: &Script) -> Result<()> {
    if !engines.supports(&script.language) {
        return Err(LaunchError::ConfigError(format!(
            "{what}: unsupported script language '{}'",
            script.language
        )));
    }
    Ok(())
}

fn check_executable(
    engines: &ScriptEngines,
    builtins: &Builtins,
    executable: &Executable,
) -> Result<()> {
    match executable {
        Executable::Script(script) => check_script(engines, "executable", script),
        Executable::Native { command } if command.is_empty() => Err(LaunchError::ConfigError(
            "native executable needs a command".to_string(),
        )),
        Executable::Native { .. } => Ok(()),
        Executable::Builtin { name, .. } if builtins.get(name).is_none() => Err(
            LaunchError::ConfigError(format!("unknown builtin executable '{name}'")),
        ),
        Executable::Builtin { .. } => Ok(()),
        Executable::Composite { steps } => steps
            .iter()
            .try_for_each(|step| check_executable(engines, builtins, step)),
    }
}

fn check_selector(selector: &crate::task::FileSelector) -> Result<()> {
    selector
        .compile()
        .map(|_| ())
        .map_err(|e| LaunchError::ConfigError(format!("selector {selector}: {e:#}")))
}

/// Host name reported by the OS, or `localhost`.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: the buffer is valid for its whole length.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..len]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    "localhost".to_string()
}
