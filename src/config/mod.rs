// src/config/mod.rs

//! Configuration loading and validation.
//!
//! Two files are read:
//! - the node-level launcher configuration ([`LauncherConfig`]),
//! - a task description ([`TaskFile`]) used by the `run` subcommand.
//!
//! Each is deserialized into a `Raw*` model (`model.rs`), then validated
//! into its checked form through `TryFrom` (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_launcher_config, load_task_file};
pub use model::{
    CredentialsSection, LauncherConfig, LauncherSection, RawLauncherConfig, RawTaskFile, TaskFile,
};
