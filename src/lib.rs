// src/lib.rs

pub mod cli;
pub mod config;
pub mod dataspaces;
pub mod decrypter;
pub mod errors;
pub mod executor;
pub mod fs;
pub mod launcher;
pub mod logger;
pub mod logging;
pub mod process;
pub mod progress;
pub mod script;
pub mod task;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::config::{load_launcher_config, load_task_file, LauncherConfig, TaskFile};
use crate::decrypter::{load_public_key, CredData, Credentials, Decrypter};
use crate::executor::child::run_fork_child;
use crate::executor::{ExecutorKind, ExecutorServices};
use crate::launcher::{LauncherServices, TaskLauncher};
use crate::logger::ConsoleAppender;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Run {
            config,
            task,
            executor,
        } => run_task(config.as_deref(), &task, executor).await,
        Command::ForkChild {
            context,
            result,
            runtime_args,
        } => {
            tokio::task::spawn_blocking(move || {
                run_fork_child(&context, &result, &runtime_args, &ExecutorServices::default())
            })
            .await
            .context("fork child worker")??;
            Ok(())
        }
        Command::Credentials {
            public_key,
            login,
            password,
            third_party,
            output,
        } => create_credentials(&public_key, login, password, &third_party, &output),
    }
}

/// Launch one task, echo its output and print the result as JSON.
///
/// Ctrl-C kills the task; the launcher still reports a result.
async fn run_task(
    config_path: Option<&Path>,
    task_path: &Path,
    executor: Option<ExecutorKind>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => load_launcher_config(path)
            .with_context(|| format!("loading launcher config {}", path.display()))?,
        None => LauncherConfig::default(),
    };
    let file = load_task_file(task_path)
        .with_context(|| format!("loading task file {}", task_path.display()))?;
    let kind = executor.unwrap_or(file.executor);
    info!(task = %file.initializer.task_id, executor = ?kind, "launching task");

    let decrypter = load_decrypter(&file)?;
    let services = LauncherServices::from_config(config, kind).with_decrypter(decrypter);
    let launcher = TaskLauncher::new(file.initializer, services);
    launcher.activate_logs(Arc::new(ConsoleAppender));

    let (tx, mut rx) = mpsc::unbounded_channel();
    launcher.do_task(file.container, Vec::new(), Arc::new(tx))?;

    {
        let launcher = launcher.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            launcher.kill();
        });
    }

    let (_, result) = rx
        .recv()
        .await
        .context("launcher terminated without a result")?;
    launcher.wait_terminated().await;
    debug!(state = ?launcher.state(), "launcher finished");

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(failure) = &result.failure {
        bail!("task failed: {failure}");
    }
    Ok(())
}

fn load_decrypter(file: &TaskFile) -> Result<Option<Arc<Decrypter>>> {
    let Some(section) = &file.credentials else {
        return Ok(None);
    };
    let bundle = Credentials::read_from(&section.bundle)
        .with_context(|| format!("reading credentials {}", section.bundle.display()))?;
    let decrypter = Decrypter::from_pem_file(&section.private_key)
        .with_context(|| format!("reading private key {}", section.private_key.display()))?
        .with_credentials(bundle);
    Ok(Some(Arc::new(decrypter)))
}

fn create_credentials(
    public_key: &Path,
    login: String,
    password: String,
    third_party: &[String],
    output: &Path,
) -> Result<()> {
    let mut entries = BTreeMap::new();
    for entry in third_party {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("third-party credential '{entry}' is not KEY=VALUE");
        };
        entries.insert(key.to_string(), value.to_string());
    }
    let data = CredData {
        login,
        password,
        third_party: entries,
    };
    let key = load_public_key(public_key)
        .with_context(|| format!("reading public key {}", public_key.display()))?;
    let credentials = Credentials::create(&data, &key)?;
    std::fs::write(output, credentials.as_bytes())
        .with_context(|| format!("writing credentials to {}", output.display()))?;
    info!(path = %output.display(), "credentials written");
    Ok(())
}
