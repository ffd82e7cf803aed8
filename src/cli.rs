// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::executor::ExecutorKind;

/// Command-line arguments for `tasklaunch`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tasklaunch",
    version,
    about = "Launch one scheduler task on this node.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKLAUNCH_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a task described by a task file and print its result as JSON.
    Run {
        /// Node configuration (TOML).
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Task description (TOML).
        #[arg(long, value_name = "PATH")]
        task: PathBuf,

        /// Overrides the executor named in the task file.
        #[arg(long, value_enum, value_name = "KIND")]
        executor: Option<ExecutorKind>,
    },

    /// Child side of the forked executor. Not meant to be run by hand.
    #[command(hide = true)]
    ForkChild {
        #[arg(long, value_name = "PATH")]
        context: PathBuf,

        #[arg(long, value_name = "PATH")]
        result: PathBuf,

        /// Runtime arguments; `-Dkey=value` entries become properties.
        #[arg(last = true, allow_hyphen_values = true)]
        runtime_args: Vec<String>,
    },

    /// Encrypt a credentials bundle for a node's public key.
    Credentials {
        /// PEM public key of the node.
        #[arg(long, value_name = "PATH")]
        public_key: PathBuf,

        #[arg(long)]
        login: String,

        #[arg(long, default_value = "")]
        password: String,

        /// Third-party credential, `KEY=VALUE`; may be repeated.
        #[arg(long = "third-party", value_name = "KEY=VALUE")]
        third_party: Vec<String>,

        /// Output file for the bundle.
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_child_keeps_hyphenated_runtime_args() {
        let args = CliArgs::try_parse_from([
            "tasklaunch",
            "fork-child",
            "--context",
            "/tmp/c.bin",
            "--result",
            "/tmp/r.bin",
            "--",
            "-DjvmArg=aValue",
            "-Xmx1g",
        ])
        .unwrap();
        match args.command {
            Command::ForkChild { runtime_args, .. } => {
                assert_eq!(runtime_args, vec!["-DjvmArg=aValue", "-Xmx1g"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_accepts_executor_override() {
        let args = CliArgs::try_parse_from([
            "tasklaunch",
            "run",
            "--task",
            "task.toml",
            "--executor",
            "non-forked",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        match args.command {
            Command::Run { executor, config, .. } => {
                assert_eq!(executor, Some(ExecutorKind::NonForked));
                assert!(config.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
