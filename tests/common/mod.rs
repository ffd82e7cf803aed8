#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tasklaunch::executor::{ExecutorServices, InProcessTaskExecutor, TaskExecutor};
use tasklaunch::launcher::{LauncherServices, TaskLauncher};
use tasklaunch::logger::OutputSink;
use tasklaunch::task::{TaskContext, TaskResult};
use tokio_util::sync::CancellationToken;

pub use tasklaunch_test_utils::builders;
pub use tasklaunch_test_utils::fakes;
pub use tasklaunch_test_utils::{init_tracing, within};

use tasklaunch_test_utils::builders::test_config;
use tasklaunch_test_utils::fakes::SlowDataspacesFactory;

/// Upper bound for a launcher to reach `Terminated` after a kill.
pub const KILL_BOUND: Duration = Duration::from_secs(3);

/// Run `context` on `executor`, returning the result with captured stdout
/// and stderr.
pub async fn execute_captured(
    executor: &dyn TaskExecutor,
    context: TaskContext,
) -> (TaskResult, String, String) {
    let (out, out_buf) = OutputSink::capture();
    let (err, err_buf) = OutputSink::capture();
    let result = executor
        .execute(context, out, err, CancellationToken::new())
        .await;
    (result, out_buf.contents(), err_buf.contents())
}

pub fn in_process() -> InProcessTaskExecutor {
    InProcessTaskExecutor::new(ExecutorServices::default())
}

/// Launcher with a real in-process executor and instant dataspaces.
pub fn launcher_with(
    init: tasklaunch::task::TaskLauncherInitializer,
    scratch_root: &std::path::Path,
    executor: Arc<dyn TaskExecutor>,
    dataspaces: Arc<SlowDataspacesFactory>,
) -> TaskLauncher {
    let services = LauncherServices::new(Arc::new(test_config(scratch_root)), executor, dataspaces);
    TaskLauncher::new(init, services)
}
