mod common;
use crate::common::builders::{lua_task, InitializerBuilder};
use crate::common::fakes::{RecordingNotification, SlowDataspacesFactory};
use crate::common::{in_process, init_tracing, launcher_with, within};

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use tasklaunch::launcher::LauncherState;
use tasklaunch::task::FailureKind;

type TestResult = Result<(), Box<dyn Error>>;

const WALLTIME_MS: u64 = 500;
const MARGIN: Duration = Duration::from_millis(1_500);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endless_loop_is_stopped_by_walltime() -> TestResult {
    init_tracing();

    for trial in 0..10 {
        let scratch = tempfile::tempdir()?;
        let launcher = launcher_with(
            InitializerBuilder::new().walltime_ms(WALLTIME_MS).build(),
            scratch.path(),
            Arc::new(in_process()),
            SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
        );
        let notification = RecordingNotification::new();

        let started = Instant::now();
        let handle = launcher.do_task(
            lua_task("local n = 0; while true do n = n + 1 end"),
            vec![],
            notification.clone(),
        )?;
        let result = tokio::time::timeout(
            Duration::from_millis(WALLTIME_MS) + MARGIN,
            notification.wait_result(),
        )
        .await?;
        let elapsed = started.elapsed();
        handle.await?;

        assert_eq!(
            result.failure_kind(),
            Some(FailureKind::WalltimeExceeded),
            "trial {trial}: {:?}",
            result.failure
        );
        assert!(
            elapsed >= Duration::from_millis(WALLTIME_MS),
            "trial {trial}: stopped early after {elapsed:?}"
        );
        assert_eq!(notification.count(), 1);
        assert_eq!(launcher.state(), LauncherState::Terminated);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sleeping_native_command_is_stopped_by_walltime() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let launcher = launcher_with(
        InitializerBuilder::new().walltime_ms(WALLTIME_MS).build(),
        scratch.path(),
        Arc::new(in_process()),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let notification = RecordingNotification::new();

    let container = tasklaunch::task::ExecutableContainer::new(
        tasklaunch::task::Executable::Native {
            command: vec!["sleep".into(), "30".into()],
        },
    );
    let handle = launcher.do_task(container, vec![], notification.clone())?;
    let result = tokio::time::timeout(
        Duration::from_millis(WALLTIME_MS) + MARGIN,
        notification.wait_result(),
    )
    .await?;
    handle.await?;

    assert_eq!(result.failure_kind(), Some(FailureKind::WalltimeExceeded));
    Ok(())
}

#[tokio::test]
async fn task_finishing_in_time_is_not_affected() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let launcher = launcher_with(
        InitializerBuilder::new().walltime_ms(5_000).build(),
        scratch.path(),
        Arc::new(in_process()),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let notification = RecordingNotification::new();

    launcher
        .do_task(lua_task("sleep(20); return 'ok'"), vec![], notification.clone())?
        .await?;

    let results = notification.results();
    assert!(results[0].is_ok(), "unexpected failure: {:?}", results[0].failure);
    assert_eq!(results[0].value, Some(Value::from("ok")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_kill_before_walltime_wins() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let launcher = launcher_with(
        InitializerBuilder::new().walltime_ms(2_000).build(),
        scratch.path(),
        Arc::new(in_process()),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let notification = RecordingNotification::new();

    let handle = launcher.do_task(lua_task("sleep(60000)"), vec![], notification.clone())?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    launcher.kill();
    let result = within(Duration::from_secs(3), "kill notification", notification.wait_result()).await?;
    handle.await?;

    assert_eq!(result.failure_kind(), Some(FailureKind::KillRequested));
    Ok(())
}
