// src/config/loader.rs

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::config::model::{LauncherConfig, RawLauncherConfig, RawTaskFile, TaskFile};
use crate::errors::{LaunchError, Result};

/// Read and deserialize a TOML file without semantic validation.
pub fn load_from_path<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let raw: T = toml::from_str(&contents)?;
    Ok(raw)
}

/// Read a raw model from `path` and validate it into its checked form.
pub fn load_and_validate<Raw, T>(path: impl AsRef<Path>) -> Result<T>
where
    Raw: DeserializeOwned,
    T: TryFrom<Raw, Error = LaunchError>,
{
    let raw: Raw = load_from_path(path)?;
    T::try_from(raw)
}

pub fn load_launcher_config(path: impl AsRef<Path>) -> Result<LauncherConfig> {
    load_and_validate::<RawLauncherConfig, LauncherConfig>(path)
}

pub fn load_task_file(path: impl AsRef<Path>) -> Result<TaskFile> {
    load_and_validate::<RawTaskFile, TaskFile>(path)
}
