// src/executor/mod.rs

//! Task executors.
//!
//! Every executor runs the same phase sequence (see [`phases`]): pre-script,
//! main executable, post-script, flow script. They differ in where:
//!
//! - [`InProcessTaskExecutor`] runs on a worker thread of this process.
//! - [`ForkedTaskExecutor`] re-invokes a runtime binary as a child process
//!   and exchanges context/result through [`wire`] frames.
//! - [`NonForkedTaskExecutor`] accepts a forked-style task (fork environment
//!   and all) but runs it in this process, for launchers that are already
//!   isolated.
//!
//! `execute` never fails: every problem ends up inside the returned
//! [`TaskResult`].

pub mod child;
pub mod fork_env;
pub mod forked;
pub mod in_process;
pub mod non_forked;
pub mod phases;
pub mod wire;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::decrypter::CredentialAccess;
use crate::logger::OutputSink;
use crate::script::{Builtins, ScriptEngines};
use crate::task::{TaskContext, TaskResult};

pub use forked::{ForkSettings, ForkedTaskExecutor};
pub use in_process::InProcessTaskExecutor;
pub use non_forked::NonForkedTaskExecutor;

/// Strategy interface implemented by the three executors.
///
/// Production code picks one through [`ExecutorKind`]; tests can provide
/// their own implementation.
pub trait TaskExecutor: Send + Sync {
    /// Run all phases of `context`, streaming output to the sinks. Once
    /// `cancel` fires the executor stops as soon as it can and reports
    /// [`crate::task::FailureKind::KillRequested`].
    fn execute(
        &self,
        context: TaskContext,
        out: OutputSink,
        err: OutputSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send + '_>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    #[default]
    InProcess,
    Forked,
    NonForked,
}

/// Script engines and builtins shared by every executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorServices {
    pub engines: Arc<ScriptEngines>,
    pub builtins: Arc<Builtins>,
}

/// Process-level surroundings of a phase run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEnvironment {
    /// Working directory for spawned processes.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for spawned processes and `os.getenv`.
    pub env: BTreeMap<String, String>,
    /// `-Dkey=value` runtime arguments.
    pub properties: BTreeMap<String, String>,
    pub credentials: CredentialAccess,
    /// Native children join the current process group instead of leading
    /// their own. Set inside a forked child, whose group the parent kills.
    pub inherit_process_group: bool,
}

/// Credentials as seen by this context, decrypting on first use.
pub fn credential_access(context: &TaskContext) -> CredentialAccess {
    context
        .decrypter
        .as_ref()
        .map(|d| d.third_party_credentials())
        .unwrap_or_default()
}

/// Build the executor for `kind`.
pub fn executor_for(
    kind: ExecutorKind,
    services: ExecutorServices,
    fork: forked::ForkSettings,
) -> Arc<dyn TaskExecutor> {
    match kind {
        ExecutorKind::InProcess => Arc::new(InProcessTaskExecutor::new(services)),
        ExecutorKind::Forked => Arc::new(ForkedTaskExecutor::new(services, fork)),
        ExecutorKind::NonForked => Arc::new(NonForkedTaskExecutor::new(services)),
    }
}
