// src/dataspaces/mod.rs

//! Dataspace access for one task.
//!
//! The launcher only talks to [`TaskDataspaces`]; [`local::LocalDataspaces`]
//! is the node-local implementation backed by plain directories.

pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{DataspaceUris, InputSelector, OutputSelector, TaskId};

pub use local::{DataspaceRoots, LocalDataspaces, LocalDataspacesFactory};

#[derive(Error, Debug)]
pub enum DataspaceError {
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage locations of one task and the transfers between them and the
/// task's scratch folder.
#[async_trait]
pub trait TaskDataspaces: Send + Sync {
    fn scratch_folder(&self) -> &Path;
    fn scratch_uri(&self) -> String;

    /// `None` when the space is not configured on this node.
    fn input_uri(&self) -> Option<String>;
    fn output_uri(&self) -> Option<String>;
    fn user_uri(&self) -> Option<String>;
    fn global_uri(&self) -> Option<String>;

    async fn copy_input_data_to_scratch(
        &self,
        selectors: &[InputSelector],
    ) -> Result<(), DataspaceError>;

    async fn copy_scratch_data_to_output(
        &self,
        selectors: &[OutputSelector],
    ) -> Result<(), DataspaceError>;

    async fn clean_scratch_space(&self) -> Result<(), DataspaceError>;

    async fn close(&self) -> Result<(), DataspaceError>;

    /// URIs as exposed to scripts.
    fn uris(&self, hostname: &str) -> DataspaceUris {
        DataspaceUris {
            scratch: self.scratch_uri(),
            input: self.input_uri().unwrap_or_default(),
            output: self.output_uri().unwrap_or_default(),
            user: self.user_uri().unwrap_or_default(),
            global: self.global_uri().unwrap_or_default(),
            hostname: hostname.to_string(),
        }
    }
}

/// Builds the dataspaces of one task once its scratch folder exists.
pub trait DataspacesFactory: Send + Sync {
    fn open(
        &self,
        task_id: &TaskId,
        scratch: &Path,
    ) -> Result<Arc<dyn TaskDataspaces>, DataspaceError>;
}
