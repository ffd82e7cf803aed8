mod common;
use crate::common::builders::{lua_task, InitializerBuilder};
use crate::common::{execute_captured, init_tracing};

use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tasklaunch::decrypter::{CredData, Credentials, Decrypter};
use tasklaunch::executor::{ExecutorServices, ForkSettings, ForkedTaskExecutor, TaskExecutor};
use tasklaunch::logger::OutputSink;
use tasklaunch::task::{
    Executable, ExecutableContainer, FailureKind, ForkEnvironment, Phase, Script,
};

type TestResult = Result<(), Box<dyn Error>>;

fn forked() -> ForkedTaskExecutor {
    ForkedTaskExecutor::new(
        ExecutorServices::default(),
        ForkSettings {
            runtime: Some(PathBuf::from(env!("CARGO_BIN_EXE_tasklaunch"))),
            exchange_dir: None,
        },
    )
}

fn fork_env(working_dir: Option<String>) -> ForkEnvironment {
    ForkEnvironment {
        working_dir,
        env: [("envVar".to_string(), "$aVar".to_string())].into(),
        runtime_args: vec!["-DjvmArg=$aVar".to_string()],
        env_script: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn child_sees_substituted_fork_environment() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let working_dir = format!("{}/work-$aVar", root.path().display());

    let steps = vec![
        Executable::Script(Script::lua(
            "println('jvmArg=' .. properties.jvmArg .. ' envVar=' .. os.getenv('envVar'))",
        )),
        Executable::Native {
            command: vec!["pwd".into(), "-P".into()],
        },
    ];
    let context = InitializerBuilder::new()
        .variable("aVar", "aValue")
        .fork_environment(fork_env(Some(working_dir)))
        .context(ExecutableContainer::new(Executable::Composite { steps }), vec![]);

    let (result, out, err) = execute_captured(&forked(), context).await;

    assert!(result.is_ok(), "failure: {:?}, stderr: {err}", result.failure);
    let expected_dir = std::fs::canonicalize(root.path().join("work-aValue"))?;
    let mut lines = out.lines();
    assert_eq!(lines.next(), Some("jvmArg=aValue envVar=aValue"));
    assert_eq!(lines.next().map(PathBuf::from), Some(expected_dir));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn result_and_variables_come_back_from_the_child() -> TestResult {
    init_tracing();

    let context = InitializerBuilder::new()
        .variable("counter", 1)
        .post(Script::lua("variables.counter = variables.counter + 1"))
        .context(
            lua_task("variables.counter = variables.counter + 1; resultMetadata.k = 'v'; return 42"),
            vec![],
        );

    let (result, _, err) = execute_captured(&forked(), context).await;

    assert!(result.is_ok(), "failure: {:?}, stderr: {err}", result.failure);
    assert_eq!(result.value, Some(Value::from(42)));
    assert_eq!(result.propagated_variables["counter"], Value::from(3));
    assert_eq!(result.metadata["k"], "v");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_script_edits_the_fork_environment() -> TestResult {
    init_tracing();

    let mut fork = fork_env(None);
    fork.env_script = Some(Script::lua(
        "forkEnvironment.env.fromScript = 'yes'; \
         forkEnvironment.runtimeArgs[#forkEnvironment.runtimeArgs + 1] = '-Dextra=1'",
    ));
    let context = InitializerBuilder::new()
        .variable("aVar", "aValue")
        .fork_environment(fork)
        .context(
            lua_task("println(os.getenv('fromScript') .. ' ' .. properties.extra)"),
            vec![],
        );

    let (result, out, err) = execute_captured(&forked(), context).await;

    assert!(result.is_ok(), "failure: {:?}, stderr: {err}", result.failure);
    assert_eq!(out, "yes 1\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_environment_script_fails_before_forking() -> TestResult {
    init_tracing();

    let mut fork = fork_env(None);
    fork.env_script = Some(Script::lua("error('no environment for you')"));
    let context = InitializerBuilder::new()
        .fork_environment(fork)
        .context(lua_task("println('ran')"), vec![]);

    let (result, out, _) = execute_captured(&forked(), context).await;

    assert_eq!(
        result.failure_kind(),
        Some(FailureKind::ScriptFailure {
            phase: Phase::ForkEnvironment
        })
    );
    assert!(!out.contains("ran"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credentials_cross_the_fork_boundary() -> TestResult {
    init_tracing();

    static KEY: LazyLock<RsaPrivateKey> =
        LazyLock::new(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).expect("keygen"));
    let data = CredData {
        login: "admin".into(),
        third_party: [("PASSWORD".to_string(), "p4ssw0rd".to_string())].into(),
        ..CredData::default()
    };
    let bundle = Credentials::create(&data, &RsaPublicKey::from(&*KEY))?;
    let decrypter = Arc::new(Decrypter::new(KEY.clone()).with_credentials(bundle));

    let context = InitializerBuilder::new()
        .context(
            ExecutableContainer::new(Executable::Script(
                Script::lua("println(args[0] .. ' ' .. credentials.PASSWORD)")
                    .with_args(["$credentials_PASSWORD"]),
            )),
            vec![],
        )
        .with_decrypter(Some(decrypter));

    let (result, out, err) = execute_captured(&forked(), context).await;

    assert!(result.is_ok(), "failure: {:?}, stderr: {err}", result.failure);
    assert_eq!(out, "p4ssw0rd p4ssw0rd\n");
    Ok(())
}

#[tokio::test]
async fn missing_runtime_is_a_spawn_failure() -> TestResult {
    init_tracing();
    let executor = ForkedTaskExecutor::new(
        ExecutorServices::default(),
        ForkSettings {
            runtime: Some(PathBuf::from("/nonexistent/tasklaunch-runtime")),
            exchange_dir: None,
        },
    );

    let context = InitializerBuilder::new().context(lua_task("return 1"), vec![]);
    let (result, _, err) = execute_captured(&executor, context).await;

    assert_eq!(result.failure_kind(), Some(FailureKind::ProcessSpawnFailure));
    assert!(err.contains("/nonexistent/tasklaunch-runtime"), "stderr was {err:?}");
    Ok(())
}

#[tokio::test]
async fn uncreatable_working_dir_is_a_spawn_failure() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let blocker = root.path().join("file");
    std::fs::write(&blocker, b"not a directory")?;

    let context = InitializerBuilder::new()
        .fork_environment(fork_env(Some(format!("{}/sub", blocker.display()))))
        .context(lua_task("return 1"), vec![]);
    let (result, _, _) = execute_captured(&forked(), context).await;

    assert_eq!(result.failure_kind(), Some(FailureKind::ProcessSpawnFailure));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_kills_the_whole_process_group() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let pid_file = root.path().join("grandchild.pid");

    // The shell leaves a background sleep behind; it must die with the group.
    let command = format!("sleep 60 & echo $! > {}; wait", pid_file.display());
    let context = InitializerBuilder::new().context(
        ExecutableContainer::new(Executable::Native {
            command: vec!["sh".into(), "-c".into(), command],
        }),
        vec![],
    );

    let executor = forked();
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        let pid_file = pid_file.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !pid_file.exists() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let result = executor
        .execute(context, OutputSink::discard(), OutputSink::discard(), cancel)
        .await;
    canceller.await?;

    assert_eq!(result.failure_kind(), Some(FailureKind::KillRequested));
    assert!(started.elapsed() < Duration::from_secs(15));

    let pid: i32 = std::fs::read_to_string(&pid_file)?.trim().parse()?;
    let mut gone = false;
    for _ in 0..100 {
        if !process_alive(pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "background process {pid} survived the kill");
    Ok(())
}

/// Alive and not a zombie waiting to be reaped by init.
fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}
