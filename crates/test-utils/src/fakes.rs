#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tasklaunch::dataspaces::{DataspaceError, DataspacesFactory, TaskDataspaces};
use tasklaunch::executor::TaskExecutor;
use tasklaunch::launcher::TerminateNotification;
use tasklaunch::logger::OutputSink;
use tasklaunch::task::{
    FailureKind, InputSelector, OutputSelector, TaskContext, TaskFailure, TaskId, TaskResult,
};

/// Records every termination notification.
pub struct RecordingNotification {
    calls: Mutex<Vec<(TaskId, TaskResult)>>,
    count: watch::Sender<usize>,
}

impl RecordingNotification {
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            count,
        })
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Wait for the first notification and return its result.
    pub async fn wait_result(&self) -> TaskResult {
        let mut rx = self.count.subscribe();
        rx.wait_for(|n| *n > 0).await.unwrap();
        self.results().remove(0)
    }
}

impl TerminateNotification for RecordingNotification {
    fn terminate(&self, task_id: &TaskId, result: TaskResult) {
        self.calls.lock().unwrap().push((task_id.clone(), result));
        self.count.send_modify(|n| *n += 1);
    }
}

/// What a [`FakeExecutor`] does when asked to run.
#[derive(Debug, Clone)]
pub enum FakeBehaviour {
    /// Succeed with `value` after `delay`, unless cancelled first.
    Succeed { value: Value, delay: Duration },
    /// Run until cancelled.
    Hang,
    /// Never return, even when cancelled.
    IgnoreCancel,
}

pub struct FakeExecutor {
    behaviour: FakeBehaviour,
    calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(behaviour: FakeBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn succeeding(value: impl Into<Value>) -> Arc<Self> {
        Self::new(FakeBehaviour::Succeed {
            value: value.into(),
            delay: Duration::ZERO,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn killed(task_id: TaskId) -> TaskResult {
    TaskResult::failed(
        task_id,
        TaskFailure::new(FailureKind::KillRequested, "task interrupted"),
    )
}

impl TaskExecutor for FakeExecutor {
    fn execute(
        &self,
        context: TaskContext,
        out: OutputSink,
        _err: OutputSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let task_id = context.task_id().clone();
        let behaviour = self.behaviour.clone();
        Box::pin(async move {
            match behaviour {
                FakeBehaviour::Succeed { value, delay } => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            out.write_str("fake executor done\n").ok();
                            TaskResult::ok(task_id, value)
                        }
                        _ = cancel.cancelled() => killed(task_id),
                    }
                }
                FakeBehaviour::Hang => {
                    cancel.cancelled().await;
                    killed(task_id)
                }
                FakeBehaviour::IgnoreCancel => std::future::pending().await,
            }
        })
    }
}

/// Dataspaces whose transfers take a configurable time. No files move.
pub struct SlowDataspaces {
    scratch: PathBuf,
    input_delay: Duration,
    output_delay: Duration,
    cleaned: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskDataspaces for SlowDataspaces {
    fn scratch_folder(&self) -> &Path {
        &self.scratch
    }

    fn scratch_uri(&self) -> String {
        self.scratch.display().to_string()
    }

    fn input_uri(&self) -> Option<String> {
        None
    }

    fn output_uri(&self) -> Option<String> {
        None
    }

    fn user_uri(&self) -> Option<String> {
        None
    }

    fn global_uri(&self) -> Option<String> {
        None
    }

    async fn copy_input_data_to_scratch(
        &self,
        _selectors: &[InputSelector],
    ) -> Result<(), DataspaceError> {
        tokio::time::sleep(self.input_delay).await;
        Ok(())
    }

    async fn copy_scratch_data_to_output(
        &self,
        _selectors: &[OutputSelector],
    ) -> Result<(), DataspaceError> {
        tokio::time::sleep(self.output_delay).await;
        Ok(())
    }

    async fn clean_scratch_space(&self) -> Result<(), DataspaceError> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), DataspaceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SlowDataspacesFactory {
    pub input_delay: Duration,
    pub output_delay: Duration,
    pub cleaned: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub scratch_dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl SlowDataspacesFactory {
    pub fn new(input_delay: Duration, output_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            input_delay,
            output_delay,
            ..Self::default()
        })
    }

    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        self.scratch_dirs.lock().unwrap().clone()
    }
}

impl DataspacesFactory for SlowDataspacesFactory {
    fn open(
        &self,
        _task_id: &TaskId,
        scratch: &Path,
    ) -> Result<Arc<dyn TaskDataspaces>, DataspaceError> {
        self.scratch_dirs.lock().unwrap().push(scratch.to_path_buf());
        Ok(Arc::new(SlowDataspaces {
            scratch: scratch.to_path_buf(),
            input_delay: self.input_delay,
            output_delay: self.output_delay,
            cleaned: Arc::clone(&self.cleaned),
            closed: Arc::clone(&self.closed),
        }))
    }
}
