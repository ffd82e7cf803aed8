mod common;
use crate::common::builders::{lua_task, task_id, InitializerBuilder};
use crate::common::fakes::{FakeBehaviour, FakeExecutor, RecordingNotification, SlowDataspacesFactory};
use crate::common::{in_process, init_tracing, launcher_with, KILL_BOUND};

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use serde_json::Value;

use tasklaunch::errors::LaunchError;
use tasklaunch::launcher::{LauncherState, TaskLauncher};
use tasklaunch::task::FailureKind;

type TestResult = Result<(), Box<dyn Error>>;

const TRIALS: usize = 10;

/// Poll `cond` until it holds or `limit` elapses.
async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Start `launcher`, kill it once `ready` holds and check it terminates
/// with exactly one KillRequested notification.
async fn kill_once_ready(
    launcher: TaskLauncher,
    code: &str,
    ready: impl FnMut() -> bool,
) -> TestResult {
    let notification = RecordingNotification::new();
    let handle = launcher.do_task(lua_task(code), vec![], notification.clone())?;

    assert!(wait_until(Duration::from_secs(5), ready).await, "task never got going");
    assert_eq!(launcher.state(), LauncherState::Running);

    let killed_at = Instant::now();
    launcher.kill();
    tokio::time::timeout(KILL_BOUND, launcher.wait_terminated()).await?;
    let elapsed = killed_at.elapsed();
    handle.await?;

    assert_eq!(launcher.state(), LauncherState::Terminated);
    assert_eq!(notification.count(), 1);
    let results = notification.results();
    let result = &results[0];
    assert_eq!(result.failure_kind(), Some(FailureKind::KillRequested));
    assert!(elapsed < KILL_BOUND, "termination took {elapsed:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_while_sleeping_in_task_script() -> TestResult {
    init_tracing();

    for _ in 0..TRIALS {
        let scratch = tempfile::tempdir()?;
        let launcher = launcher_with(
            InitializerBuilder::new().build(),
            scratch.path(),
            Arc::new(in_process()),
            SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
        );
        let watched = launcher.clone();
        kill_once_ready(launcher, "println('started'); sleep(60000)", move || {
            watched.logs().stdout.contains("started")
        })
        .await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_while_looping_in_task_script() -> TestResult {
    init_tracing();

    for _ in 0..TRIALS {
        let scratch = tempfile::tempdir()?;
        let launcher = launcher_with(
            InitializerBuilder::new().build(),
            scratch.path(),
            Arc::new(in_process()),
            SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
        );
        let watched = launcher.clone();
        kill_once_ready(
            launcher,
            "println('started'); local n = 0; while true do n = n + 1 end",
            move || watched.logs().stdout.contains("started"),
        )
        .await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_during_slow_input_copy() -> TestResult {
    init_tracing();

    for _ in 0..TRIALS {
        let scratch = tempfile::tempdir()?;
        let spaces = SlowDataspacesFactory::new(Duration::from_secs(60), Duration::ZERO);
        let executor = FakeExecutor::succeeding(1);
        let launcher = launcher_with(
            InitializerBuilder::new().build(),
            scratch.path(),
            executor.clone(),
            Arc::clone(&spaces),
        );
        let opened = Arc::clone(&spaces);
        kill_once_ready(launcher, "return 1", move || !opened.scratch_dirs().is_empty()).await?;

        assert_eq!(executor.calls(), 0, "executor must not start after a kill");
        assert_eq!(spaces.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_during_slow_output_copy_is_bounded() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let spaces = SlowDataspacesFactory::new(Duration::ZERO, Duration::from_secs(60));
    let executor = FakeExecutor::succeeding("done");
    let launcher = launcher_with(
        InitializerBuilder::new().build(),
        scratch.path(),
        executor.clone(),
        spaces,
    );
    let watched = Arc::clone(&executor);
    kill_once_ready(launcher, "return 1", move || watched.calls() == 1).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_executor_is_abandoned_after_grace() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let executor = FakeExecutor::new(FakeBehaviour::IgnoreCancel);
    let launcher = launcher_with(
        InitializerBuilder::new().build(),
        scratch.path(),
        executor.clone(),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let watched = Arc::clone(&executor);
    kill_once_ready(launcher, "return 1", move || watched.calls() == 1).await
}

#[tokio::test]
async fn kill_before_do_task_still_notifies_once() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let executor = FakeExecutor::succeeding(1);
    let launcher = launcher_with(
        InitializerBuilder::new().build(),
        scratch.path(),
        executor.clone(),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    launcher.kill();
    launcher.kill();
    assert_eq!(launcher.state(), LauncherState::Killed);

    let notification = RecordingNotification::new();
    launcher
        .do_task(lua_task("return 1"), vec![], notification.clone())?
        .await?;

    assert_eq!(notification.count(), 1);
    assert_eq!(
        notification.results()[0].failure_kind(),
        Some(FailureKind::KillRequested)
    );
    assert_eq!(executor.calls(), 0);
    assert_eq!(launcher.state(), LauncherState::Terminated);
    Ok(())
}

#[tokio::test]
async fn second_do_task_is_rejected() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let launcher = launcher_with(
        InitializerBuilder::new().build(),
        scratch.path(),
        FakeExecutor::succeeding(Value::from("v")),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let notification = RecordingNotification::new();

    let first = launcher.do_task(lua_task("return 1"), vec![], notification.clone())?;
    let second = launcher.do_task(lua_task("return 2"), vec![], notification.clone());
    assert!(matches!(second, Err(LaunchError::AlreadyStarted)));

    first.await?;
    assert_eq!(notification.count(), 1);
    let results = notification.results();
    let result = &results[0];
    assert!(result.is_ok());
    assert_eq!(result.task_id, task_id());
    assert_eq!(result.value, Some(Value::from("v")));
    Ok(())
}

#[tokio::test]
async fn kill_after_termination_is_ignored() -> TestResult {
    init_tracing();

    let scratch = tempfile::tempdir()?;
    let launcher = launcher_with(
        InitializerBuilder::new().build(),
        scratch.path(),
        FakeExecutor::succeeding(1),
        SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
    );
    let notification = RecordingNotification::new();
    launcher
        .do_task(lua_task("return 1"), vec![], notification.clone())?
        .await?;

    launcher.kill();
    assert_eq!(launcher.state(), LauncherState::Terminated);
    assert_eq!(notification.count(), 1);
    assert!(notification.results()[0].is_ok());
    Ok(())
}

/// When the kills are issued relative to `do_task`.
#[derive(Debug, Clone, Copy)]
enum KillTiming {
    Before,
    Concurrent,
    AfterMillis(u64),
}

fn timing() -> impl Strategy<Value = KillTiming> {
    prop_oneof![
        Just(KillTiming::Before),
        Just(KillTiming::Concurrent),
        (0u64..30).prop_map(KillTiming::AfterMillis),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn exactly_one_notification_for_any_kill_interleaving(
        kills in proptest::collection::vec(timing(), 0..6),
        task_millis in 0u64..40,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let count = runtime.block_on(async move {
            let scratch = tempfile::tempdir().unwrap();
            let executor = FakeExecutor::new(FakeBehaviour::Succeed {
                value: Value::from(1),
                delay: Duration::from_millis(task_millis),
            });
            let launcher = launcher_with(
                InitializerBuilder::new().build(),
                scratch.path(),
                executor,
                SlowDataspacesFactory::new(Duration::ZERO, Duration::ZERO),
            );
            let notification = RecordingNotification::new();

            for timing in &kills {
                if let KillTiming::Before = timing {
                    launcher.kill();
                }
            }

            let mut killers = Vec::new();
            for timing in &kills {
                let launcher = launcher.clone();
                match *timing {
                    KillTiming::Before => {}
                    KillTiming::Concurrent => {
                        killers.push(std::thread::spawn(move || launcher.kill()));
                    }
                    KillTiming::AfterMillis(ms) => {
                        killers.push(std::thread::spawn(move || {
                            std::thread::sleep(Duration::from_millis(ms));
                            launcher.kill();
                        }));
                    }
                }
            }

            let handle = launcher
                .do_task(lua_task("return 1"), vec![], notification.clone())
                .unwrap();
            tokio::time::timeout(KILL_BOUND, launcher.wait_terminated())
                .await
                .unwrap();
            handle.await.unwrap();
            for killer in killers {
                killer.join().unwrap();
            }
            // Late kills must not produce a second notification either.
            launcher.kill();
            notification.count()
        });

        prop_assert_eq!(count, 1);
    }
}
