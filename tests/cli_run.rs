mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::path::Path;
use std::process::{Command, Output};

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

type TestResult = Result<(), Box<dyn Error>>;

fn tasklaunch(args: &[&str]) -> std::io::Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_tasklaunch"))
        .args(args)
        .env_remove("TASKLAUNCH_LOG")
        .output()
}

fn write_config(dir: &Path) -> std::io::Result<String> {
    let path = dir.join("launcher.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[launcher]
hostname = "cli-host"
scratch_root = "{}"
log_prefix = false
"#,
            dir.join("scratch").display()
        ),
    )?;
    Ok(path.display().to_string())
}

fn write_task(dir: &Path, body: &str) -> std::io::Result<String> {
    let path = dir.join("task.toml");
    std::fs::write(&path, body)?;
    Ok(path.display().to_string())
}

/// The JSON result is the last thing printed on stdout.
fn result_json(stdout: &[u8]) -> Result<Value, Box<dyn Error>> {
    let text = String::from_utf8_lossy(stdout);
    let start = text.rfind("\n{").map(|i| i + 1).unwrap_or(0);
    Ok(serde_json::from_str(&text[start..])?)
}

const TASK_HEAD: &str = r#"
[task]
task_id = { job_id = 7, job_name = "cli", task_id = 3, task_name = "t3" }
"#;

#[test]
fn run_prints_the_result_as_json() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path())?;
    let task = write_task(
        dir.path(),
        &format!(
            r#"{TASK_HEAD}
[task.variables]
greeting = "hi"

[executable]
kind = "script"
language = "lua"
code = "println(variables.greeting .. ' from ' .. variables.PA_JOB_ID); return 42"
"#
        ),
    )?;

    let output = tasklaunch(&["run", "--config", &config, "--task", &task])?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("hi from 7\n"), "stdout was {stdout:?}");

    let result = result_json(&output.stdout)?;
    assert_eq!(result["value"], Value::from(42));
    assert_eq!(result["task_id"]["job_id"], Value::from(7));
    assert_eq!(result["failure"], Value::Null);
    Ok(())
}

#[test]
fn failed_task_exits_non_zero() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path())?;
    let task = write_task(
        dir.path(),
        &format!(
            r#"executor = "non-forked"
{TASK_HEAD}
[executable]
kind = "native"
command = ["sh", "-c", "exit 5"]
"#
        ),
    )?;

    let output = tasklaunch(&["run", "--config", &config, "--task", &task])?;
    assert_eq!(output.status.code(), Some(1));
    let result = result_json(&output.stdout)?;
    assert_eq!(result["failure"]["kind"], Value::from("script_failure"));
    assert_eq!(result["failure"]["phase"], Value::from("task"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("task failed"));
    Ok(())
}

#[test]
fn invalid_task_file_is_reported() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let task = write_task(
        dir.path(),
        &format!("{TASK_HEAD}\n[executable]\nkind = \"script\"\nlanguage = \"cobol\"\ncode = \"x\"\n"),
    )?;

    let output = tasklaunch(&["run", "--task", &task])?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cobol"), "stderr was {stderr}");
    Ok(())
}

#[test]
fn forked_run_with_encrypted_credentials() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path())?;

    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024)?;
    let private_pem = dir.path().join("node.pem");
    let public_pem = dir.path().join("node.pub.pem");
    std::fs::write(&private_pem, key.to_pkcs8_pem(LineEnding::LF)?.as_bytes())?;
    std::fs::write(
        &public_pem,
        RsaPublicKey::from(&key).to_public_key_pem(LineEnding::LF)?,
    )?;
    let bundle = dir.path().join("creds.bin");

    let created = tasklaunch(&[
        "credentials",
        "--public-key",
        &public_pem.display().to_string(),
        "--login",
        "admin",
        "--third-party",
        "PASSWORD=p4ssw0rd",
        "--output",
        &bundle.display().to_string(),
    ])?;
    assert!(
        created.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&created.stderr)
    );

    let task = write_task(
        dir.path(),
        &format!(
            r#"executor = "forked"
{TASK_HEAD}
[executable]
kind = "script"
language = "lua"
code = "return args[0]"
args = ["$credentials_PASSWORD"]

[credentials]
private_key = "{}"
bundle = "{}"
"#,
            private_pem.display(),
            bundle.display()
        ),
    )?;

    let output = tasklaunch(&["run", "--config", &config, "--task", &task])?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let result = result_json(&output.stdout)?;
    assert_eq!(result["value"], Value::from("p4ssw0rd"));
    Ok(())
}
