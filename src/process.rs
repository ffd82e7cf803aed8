// src/process.rs

//! Supervision of native child processes.
//!
//! Children are started in their own process group so that a kill reaches
//! everything they spawned. Output is pumped to the task sinks as it
//! arrives; exit and cancellation race in a `select!`.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::logger::OutputSink;
use crate::task::variables::value_to_string;
use crate::task::Variables;

/// How long to wait for output pipes to drain after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("cannot start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("waiting for child failed: {0}")]
    Wait(#[source] io::Error),

    #[error("cannot start a runtime for the child: {0}")]
    Runtime(#[source] io::Error),

    #[error("interrupted")]
    Interrupted,
}

pub struct ProcessSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub working_dir: Option<&'a Path>,
    pub env: &'a BTreeMap<String, String>,
    /// Start the child as leader of a new process group. Off when the
    /// caller's own group is already the unit that gets killed.
    pub own_group: bool,
}

/// Variables with shell-safe names as environment strings, then `overlay`.
pub fn exported_env(
    variables: &Variables,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = variables
        .iter()
        .filter(|(k, _)| is_env_name(k))
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// SIGKILL the whole process group led by `pid`.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %io::Error::last_os_error(), "killpg failed");
        }
    }
    #[cfg(not(unix))]
    {
        debug!(pid, "process groups unsupported, killing the child only");
    }
}

/// Kills the process group led by the child when dropped.
pub struct ProcessGroupGuard(pub Option<u32>);

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            kill_process_group(pid);
        }
    }
}

/// Exit code, with signals mapped to `128 + signal` as shells do.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Start pumping the child's piped stdout and stderr into the sinks.
pub fn pump_output(child: &mut Child, out: &OutputSink, err: &OutputSink) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, out.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, err.clone()));
    }
    pumps
}

fn pump<R>(mut reader: R, sink: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.write_bytes(&buf[..n]) {
                        debug!(error = %e, "output sink closed, dropping child output");
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "reading child output failed");
                    break;
                }
            }
        }
    })
}

/// Wait for the output pumps to reach EOF. A grandchild that escaped the
/// process group can hold a pipe open, so give up after a while.
pub async fn drain(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
            debug!("output still open after child exit; detaching pump");
            abort.abort();
        }
    }
}

/// Run a process to completion, streaming its output. Returns the exit
/// code, or [`ProcessError::Interrupted`] after killing the process group
/// when `cancel` fires.
pub async fn supervise(
    spec: &ProcessSpec<'_>,
    out: &OutputSink,
    err: &OutputSink,
    cancel: &CancellationToken,
) -> Result<i32, ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Interrupted);
    }

    let mut command = Command::new(spec.program);
    command
        .args(spec.args)
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = spec.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        if spec.own_group {
            command.process_group(0);
        }
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.to_string(),
        source,
    })?;
    let pid = child.id();
    let guard = ProcessGroupGuard(if spec.own_group { pid } else { None });
    debug!(?pid, program = spec.program, "native process started");
    let pumps = pump_output(&mut child, out, err);

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(ProcessError::Wait)?;
            // Leftover background processes die with the group.
            drop(guard);
            drain(pumps).await;
            let code = exit_code(status);
            debug!(?pid, code, "native process exited");
            Ok(code)
        }
        _ = cancel.cancelled() => {
            info!(?pid, program = spec.program, "killing native process");
            drop(guard);
            if let Err(e) = child.kill().await {
                debug!(?pid, error = %e, "native process already gone");
            }
            drain(pumps).await;
            Err(ProcessError::Interrupted)
        }
    }
}

/// Blocking form of [`supervise`] for script engines running on a worker
/// thread. Uses the runtime the worker was spawned from, or a private one
/// when there is none.
pub fn run_supervised(
    spec: &ProcessSpec<'_>,
    out: &OutputSink,
    err: &OutputSink,
    cancel: &CancellationToken,
) -> Result<i32, ProcessError> {
    match Handle::try_current() {
        Ok(handle) => handle.block_on(supervise(spec, out, err, cancel)),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ProcessError::Runtime)?
            .block_on(supervise(spec, out, err, cancel)),
    }
}
