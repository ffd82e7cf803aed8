// src/launcher/mod.rs

//! The task launcher: accepts one `do_task`, runs the pipeline and sends
//! exactly one termination notification.
//!
//! Pipeline, in order:
//! 1. scratch folder, dataspaces, progress file, task context,
//! 2. walltime timer,
//! 3. input transfer (a failure is recorded, execution still happens),
//! 4. executor,
//! 5. output transfer, then precious logs to the user space,
//! 6. walltime disarm; a kill or walltime overrides the failure kind,
//! 7. cleanup, notification, `Terminated`.
//!
//! `kill` may arrive from any thread at any time. It trips a
//! [`KillSwitch`] whose token interrupts whatever step is running; the
//! remaining steps still run so the notification always goes out.

pub mod state;
pub mod walltime;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LauncherConfig;
use crate::dataspaces::{DataspaceError, DataspacesFactory, LocalDataspacesFactory, TaskDataspaces};
use crate::decrypter::Decrypter;
use crate::errors::{LaunchError, Result};
use crate::executor::{executor_for, ExecutorKind, ExecutorServices, TaskExecutor};
use crate::logger::{log_file_name, LogAppender, TaskLogger};
use crate::progress::{ProgressFileReader, ProgressListener};
use crate::task::variables::build_task_variables;
use crate::task::{
    ExecutableContainer, FailureKind, FileSelector, OutputAccessMode, OutputSelector, Phase,
    TaskContext, TaskFailure, TaskId, TaskLauncherInitializer, TaskLogs, TaskResult,
};

pub use state::{DoTaskDecision, KillDecision, LauncherCore, LauncherState};
pub use walltime::{KillSwitch, Termination, WalltimeTimer};

/// Receiver of the final result. Called exactly once per accepted
/// `do_task`.
pub trait TerminateNotification: Send + Sync {
    fn terminate(&self, task_id: &TaskId, result: TaskResult);
}

impl TerminateNotification for mpsc::UnboundedSender<(TaskId, TaskResult)> {
    fn terminate(&self, task_id: &TaskId, result: TaskResult) {
        if self.send((task_id.clone(), result)).is_err() {
            warn!(task = %task_id, "termination notification dropped, receiver is gone");
        }
    }
}

/// Collaborators of a launcher.
#[derive(Clone)]
pub struct LauncherServices {
    pub config: Arc<LauncherConfig>,
    pub executor: Arc<dyn TaskExecutor>,
    pub dataspaces: Arc<dyn DataspacesFactory>,
    pub decrypter: Option<Arc<Decrypter>>,
}

impl LauncherServices {
    pub fn new(
        config: Arc<LauncherConfig>,
        executor: Arc<dyn TaskExecutor>,
        dataspaces: Arc<dyn DataspacesFactory>,
    ) -> Self {
        Self {
            config,
            executor,
            dataspaces,
            decrypter: None,
        }
    }

    /// Default engines, the executor for `kind` and local dataspaces.
    pub fn from_config(config: LauncherConfig, kind: ExecutorKind) -> Self {
        let executor = executor_for(kind, ExecutorServices::default(), config.fork.clone());
        let dataspaces = Arc::new(LocalDataspacesFactory::new(config.dataspaces.clone()));
        Self::new(Arc::new(config), executor, dataspaces)
    }

    pub fn with_decrypter(mut self, decrypter: Option<Arc<Decrypter>>) -> Self {
        self.decrypter = decrypter;
        self
    }
}

struct Shared {
    initializer: TaskLauncherInitializer,
    services: LauncherServices,
    core: Mutex<LauncherCore>,
    switch: Arc<KillSwitch>,
    logger: TaskLogger,
    progress: ProgressFileReader,
    terminated: watch::Sender<bool>,
}

/// Handle to one task launch. Clones share the same launcher.
#[derive(Clone)]
pub struct TaskLauncher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("task_id", self.task_id())
            .field("state", &self.state())
            .finish()
    }
}

impl TaskLauncher {
    pub fn new(initializer: TaskLauncherInitializer, services: LauncherServices) -> Self {
        let config = &services.config;
        let logger = TaskLogger::new(
            &initializer.task_id,
            &config.hostname,
            config.log_max_lines,
            config.log_prefix,
        );
        let progress = ProgressFileReader::with_interval(config.progress_poll);
        let (terminated, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                initializer,
                services,
                core: Mutex::new(LauncherCore::new()),
                switch: Arc::new(KillSwitch::new()),
                logger,
                progress,
                terminated,
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.shared.initializer.task_id
    }

    /// Start the pipeline on the current Tokio runtime. Fails if a
    /// `do_task` was already accepted or no runtime is running.
    pub fn do_task(
        &self,
        container: ExecutableContainer,
        previous_results: Vec<TaskResult>,
        target: Arc<dyn TerminateNotification>,
    ) -> Result<JoinHandle<()>> {
        let runtime = Handle::try_current().map_err(|e| LaunchError::Other(e.into()))?;
        let decision = self.shared.core().accept_do_task()?;
        let shared = Arc::clone(&self.shared);
        info!(task = %self.task_id(), ?decision, "doTask accepted");

        Ok(runtime.spawn(async move {
            let result = match decision {
                DoTaskDecision::Start => {
                    let pipeline = tokio::spawn({
                        let shared = Arc::clone(&shared);
                        async move { shared.run_pipeline(container, previous_results).await }
                    });
                    pipeline.await.unwrap_or_else(|e| {
                        let task_id = shared.initializer.task_id.clone();
                        error!(task = %task_id, error = %e, "task pipeline panicked");
                        TaskResult::failed(
                            task_id,
                            TaskFailure::script(Phase::Task, format!("pipeline aborted: {e}")),
                        )
                    })
                }
                DoTaskDecision::KilledBeforeStart => TaskResult::failed(
                    shared.initializer.task_id.clone(),
                    TaskFailure::new(FailureKind::KillRequested, "killed before start"),
                ),
            };
            shared.finalize(target.as_ref(), result);
        }))
    }

    /// Request termination. Safe to call any number of times, from any
    /// thread, in any state.
    pub fn kill(&self) {
        let decision = self.shared.core().kill();
        match decision {
            KillDecision::Interrupt | KillDecision::Recorded => {
                info!(task = %self.task_id(), ?decision, "kill requested");
                self.shared.switch.trip(Termination::Killed);
            }
            KillDecision::AlreadyKilled | KillDecision::Ignored => {
                debug!(task = %self.task_id(), ?decision, "kill ignored");
            }
        }
    }

    pub fn state(&self) -> LauncherState {
        self.shared.core().state()
    }

    /// Resolves once the launcher is `Terminated`.
    pub async fn wait_terminated(&self) {
        let mut rx = self.shared.terminated.subscribe();
        if let Err(e) = rx.wait_for(|done| *done).await {
            debug!(error = %e, "termination signal dropped");
        }
    }

    /// Last value read from the progress file, 0 before any.
    pub fn progress(&self) -> u8 {
        self.shared.progress.progress()
    }

    pub fn register_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.shared.progress.register(listener);
    }

    pub fn logs(&self) -> TaskLogs {
        self.shared.logger.logs()
    }

    /// Stream task output to `appender`, starting with what is stored.
    pub fn activate_logs(&self, appender: Arc<dyn LogAppender>) {
        self.shared.logger.activate(appender);
    }

    pub fn deactivate_logs(&self) {
        self.shared.logger.deactivate();
    }
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, LauncherCore> {
        self.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn finalize(&self, target: &dyn TerminateNotification, result: TaskResult) {
        let task_id = &self.initializer.task_id;
        if self.core().claim_notification() {
            info!(
                task = %task_id,
                ok = result.is_ok(),
                failure = ?result.failure_kind(),
                duration_ms = result.duration_ms,
                "task terminated"
            );
            target.terminate(task_id, result);
        }
        self.core().finish();
        self.terminated.send_replace(true);
    }

    async fn run_pipeline(
        self: Arc<Self>,
        container: ExecutableContainer,
        previous_results: Vec<TaskResult>,
    ) -> TaskResult {
        let started = Instant::now();
        let config = Arc::clone(&self.services.config);
        let init = &self.initializer;
        let task_id = init.task_id.clone();

        let scratch = match create_scratch(&config, &task_id) {
            Ok(dir) => dir,
            Err(e) => {
                self.logger.close();
                return self.terminal_result(
                    TaskResult::failed(
                        task_id,
                        TaskFailure::new(
                            FailureKind::DataTransferFailure,
                            format!("cannot create scratch folder: {e}"),
                        ),
                    ),
                    started,
                );
            }
        };
        debug!(task = %task_id, scratch = %scratch.path().display(), "scratch created");

        let dataspaces = match self.services.dataspaces.open(&task_id, scratch.path()) {
            Ok(spaces) => spaces,
            Err(e) => {
                self.logger.close();
                return self.terminal_result(
                    TaskResult::failed(
                        task_id,
                        TaskFailure::new(
                            FailureKind::DataTransferFailure,
                            format!("cannot open dataspaces: {e}"),
                        ),
                    ),
                    started,
                );
            }
        };

        let progress_file = match self.progress.start(scratch.path(), &task_id.to_string()) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(task = %task_id, error = %e, "progress file unavailable");
                None
            }
        };
        let log_file = scratch.path().join(log_file_name(&task_id));
        if init.precious_logs {
            if let Err(e) = self.logger.attach_file(&log_file) {
                warn!(task = %task_id, error = %e, "cannot write task log file");
            }
        }

        let context = TaskContext::new(container, init.clone(), previous_results)
            .with_dataspaces(dataspaces.uris(&config.hostname))
            .with_scheduler_home(config.scheduler_home.clone())
            .with_progress_file(progress_file)
            .with_decrypter(self.services.decrypter.clone());
        let initial_variables = build_task_variables(&context);

        let mut timer = (init.walltime_ms > 0).then(|| {
            WalltimeTimer::arm(
                Duration::from_millis(init.walltime_ms),
                Arc::clone(&self.switch),
                task_id.clone(),
            )
        });

        let inputs: Vec<_> = init
            .input_selectors
            .iter()
            .map(|s| s.resolve(&initial_variables))
            .collect();
        let input_failure = self
            .transfer("input transfer", dataspaces.copy_input_data_to_scratch(&inputs))
            .await;

        let mut result = if self.switch.is_tripped() {
            TaskResult::failed(
                task_id.clone(),
                TaskFailure::new(FailureKind::KillRequested, "task interrupted"),
            )
        } else {
            self.execute(context).await
        };
        if let Some(failure) = input_failure {
            result.override_failure(failure);
        }

        let variables = if result.propagated_variables.is_empty() {
            &initial_variables
        } else {
            &result.propagated_variables
        };
        let outputs: Vec<_> = init
            .output_selectors
            .iter()
            .map(|s| s.resolve(variables))
            .collect();
        if let Some(failure) = self
            .transfer("output transfer", dataspaces.copy_scratch_data_to_output(&outputs))
            .await
        {
            result.fail_if_ok(failure);
        }

        self.logger.close();
        if init.precious_logs && log_file.exists() {
            self.copy_precious_logs(dataspaces.as_ref(), &task_id).await;
        }

        if let Some(timer) = timer.as_mut() {
            timer.disarm();
        }
        match self.switch.reason() {
            Some(Termination::Walltime) => result.override_failure(TaskFailure::new(
                FailureKind::WalltimeExceeded,
                format!("walltime of {} ms exceeded", init.walltime_ms),
            )),
            Some(Termination::Killed) => result
                .override_failure(TaskFailure::new(FailureKind::KillRequested, "task killed")),
            None => {}
        }

        // Joining the poller waits for a running listener; keep it off the
        // async workers.
        let reader = Arc::clone(&self);
        if let Err(e) = tokio::task::spawn_blocking(move || reader.progress.stop()).await {
            warn!(task = %task_id, error = %e, "progress reader did not stop cleanly");
        }
        self.cleanup(dataspaces.as_ref(), &task_id).await;
        if let Err(e) = scratch.close() {
            warn!(task = %task_id, error = %e, "cannot remove scratch folder");
        }

        self.terminal_result(result, started)
    }

    fn terminal_result(&self, mut result: TaskResult, started: Instant) -> TaskResult {
        if result.duration_ms == 0 {
            result.duration_ms = started.elapsed().as_millis() as u64;
        }
        result.logs = self.logger.logs();
        result
    }

    /// Run the executor. After a kill it gets the grace period to return,
    /// then it is abandoned.
    async fn execute(&self, context: TaskContext) -> TaskResult {
        let task_id = context.task_id().clone();
        let token = self.switch.token();
        let grace = self.services.config.kill_grace;
        let executor = Arc::clone(&self.services.executor);

        let run = executor.execute(
            context,
            self.logger.output_sink(),
            self.logger.error_sink(),
            token.clone(),
        );
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = token.cancelled() => match tokio::time::timeout(grace, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        task = %task_id,
                        grace_ms = grace.as_millis() as u64,
                        "executor did not stop within the grace period, abandoning it"
                    );
                    TaskResult::failed(
                        task_id,
                        TaskFailure::new(FailureKind::KillRequested, "task did not stop in time"),
                    )
                }
            },
        }
    }

    /// Await a transfer. While the run is live a kill interrupts it; once
    /// the run is already killed the transfer is bounded by the clean
    /// timeout instead.
    async fn transfer<F>(&self, what: &str, transfer: F) -> Option<TaskFailure>
    where
        F: Future<Output = std::result::Result<(), DataspaceError>>,
    {
        let token = self.switch.token();
        let outcome = if token.is_cancelled() {
            tokio::time::timeout(self.services.config.clean_timeout, transfer)
                .await
                .unwrap_or(Err(DataspaceError::Interrupted))
        } else {
            tokio::select! {
                outcome = transfer => outcome,
                _ = token.cancelled() => Err(DataspaceError::Interrupted),
            }
        };

        match outcome {
            Ok(()) => None,
            Err(DataspaceError::Interrupted) => {
                info!(task = %self.initializer.task_id, what, "transfer interrupted");
                Some(TaskFailure::new(
                    FailureKind::KillRequested,
                    format!("{what} interrupted"),
                ))
            }
            Err(e) => {
                warn!(task = %self.initializer.task_id, what, error = %e, "transfer failed");
                Some(TaskFailure::new(
                    FailureKind::DataTransferFailure,
                    format!("{what} failed: {e}"),
                ))
            }
        }
    }

    async fn copy_precious_logs(&self, dataspaces: &dyn TaskDataspaces, task_id: &TaskId) {
        let selector = OutputSelector::new(
            FileSelector::include(log_file_name(task_id)),
            OutputAccessMode::ToUserSpace,
        );
        let copy = dataspaces.copy_scratch_data_to_output(std::slice::from_ref(&selector));
        match tokio::time::timeout(self.services.config.clean_timeout, copy).await {
            Ok(Ok(())) => debug!(task = %task_id, "task logs copied to user space"),
            Ok(Err(e)) => warn!(task = %task_id, error = %e, "cannot copy task logs"),
            Err(_) => warn!(task = %task_id, "copying task logs timed out"),
        }
    }

    async fn cleanup(&self, dataspaces: &dyn TaskDataspaces, task_id: &TaskId) {
        let timeout = self.services.config.clean_timeout;
        match tokio::time::timeout(timeout, dataspaces.clean_scratch_space()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %task_id, error = %e, "cannot clean scratch space"),
            Err(_) => warn!(task = %task_id, "cleaning scratch space timed out"),
        }
        match tokio::time::timeout(timeout, dataspaces.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %task_id, error = %e, "cannot close dataspaces"),
            Err(_) => warn!(task = %task_id, "closing dataspaces timed out"),
        }
    }
}

fn create_scratch(config: &LauncherConfig, task_id: &TaskId) -> std::io::Result<tempfile::TempDir> {
    std::fs::create_dir_all(&config.scratch_root)?;
    tempfile::Builder::new()
        .prefix(&format!("task-{task_id}-"))
        .tempdir_in(&config.scratch_root)
}
