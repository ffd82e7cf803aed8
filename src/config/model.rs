// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dataspaces::DataspaceRoots;
use crate::executor::{ExecutorKind, ForkSettings};
use crate::task::{Executable, ExecutableContainer, TaskLauncherInitializer};

/// Node-level configuration as read from TOML.
///
/// ```toml
/// [launcher]
/// hostname = "node-1"
/// scheduler_home = "/opt/scheduler"
/// scratch_root = "/var/tmp/tasks"
/// kill_grace_ms = 2000
///
/// [fork]
/// runtime = "/usr/local/bin/tasklaunch"
///
/// [dataspaces]
/// input = "/data/input"
/// output = "/data/output"
/// ```
///
/// Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLauncherConfig {
    #[serde(default)]
    pub launcher: LauncherSection,

    #[serde(default)]
    pub fork: ForkSettings,

    #[serde(default)]
    pub dataspaces: DataspaceRoots,
}

/// `[launcher]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherSection {
    /// Defaults to the host name reported by the OS.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Exposed to tasks as `PA_SCHEDULER_HOME`.
    #[serde(default)]
    pub scheduler_home: String,

    /// Parent of the per-task scratch folders; defaults to the system
    /// temporary directory.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,

    /// How long a killed executor gets to wind down before the launcher
    /// stops waiting for it.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Bound on post-execution cleanup transfers (precious logs).
    #[serde(default = "default_clean_timeout_ms")]
    pub clean_timeout_ms: u64,

    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_ms: u64,

    /// Lines of task output kept in memory.
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,

    /// Prefix task output lines with `[<task>@<host>;HH:MM:SS]`.
    #[serde(default = "default_log_prefix")]
    pub log_prefix: bool,
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_clean_timeout_ms() -> u64 {
    21_000
}

fn default_progress_poll_ms() -> u64 {
    500
}

fn default_log_max_lines() -> usize {
    10_000
}

fn default_log_prefix() -> bool {
    true
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            hostname: None,
            scheduler_home: String::new(),
            scratch_root: None,
            kill_grace_ms: default_kill_grace_ms(),
            clean_timeout_ms: default_clean_timeout_ms(),
            progress_poll_ms: default_progress_poll_ms(),
            log_max_lines: default_log_max_lines(),
            log_prefix: default_log_prefix(),
        }
    }
}

/// Validated launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub hostname: String,
    pub scheduler_home: String,
    pub scratch_root: PathBuf,
    pub kill_grace: Duration,
    pub clean_timeout: Duration,
    pub progress_poll: Duration,
    pub log_max_lines: usize,
    pub log_prefix: bool,
    pub fork: ForkSettings,
    pub dataspaces: DataspaceRoots,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let section = LauncherSection::default();
        Self {
            hostname: crate::config::validate::local_hostname(),
            scheduler_home: section.scheduler_home,
            scratch_root: std::env::temp_dir(),
            kill_grace: Duration::from_millis(section.kill_grace_ms),
            clean_timeout: Duration::from_millis(section.clean_timeout_ms),
            progress_poll: Duration::from_millis(section.progress_poll_ms),
            log_max_lines: section.log_max_lines,
            log_prefix: section.log_prefix,
            fork: ForkSettings::default(),
            dataspaces: DataspaceRoots::default(),
        }
    }
}

/// Paths of the private key and the encrypted credentials bundle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialsSection {
    pub private_key: PathBuf,
    pub bundle: PathBuf,
}

/// Task description file as read from TOML.
///
/// ```toml
/// executor = "forked"
///
/// [task]
/// walltime_ms = 60000
/// task_id = { job_id = 1000, job_name = "job", task_id = 1, task_name = "t1" }
///
/// [executable]
/// kind = "script"
/// language = "lua"
/// code = "return 42"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawTaskFile {
    pub task: TaskLauncherInitializer,

    pub executable: Executable,

    #[serde(default)]
    pub other_nodes: Vec<String>,

    #[serde(default)]
    pub executor: ExecutorKind,

    #[serde(default)]
    pub credentials: Option<CredentialsSection>,
}

/// Validated task description.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub initializer: TaskLauncherInitializer,
    pub container: ExecutableContainer,
    pub executor: ExecutorKind,
    pub credentials: Option<CredentialsSection>,
}
