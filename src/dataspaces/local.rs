// src/dataspaces/local.rs

//! Directory-backed dataspaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DataspaceError, DataspacesFactory, TaskDataspaces};
use crate::fs::{copy_matching_files, FileSystem, RealFileSystem};
use crate::task::{
    FileSelector, InputAccessMode, InputSelector, OutputAccessMode, OutputSelector, TaskId,
};

/// Node-level roots of the shared spaces. Unset spaces are skipped with a
/// warning when a selector refers to them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DataspaceRoots {
    #[serde(default)]
    pub input: Option<PathBuf>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<PathBuf>,
    #[serde(default)]
    pub global: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LocalDataspaces {
    task: String,
    scratch: PathBuf,
    roots: DataspaceRoots,
    fs: Arc<dyn FileSystem>,
}

impl LocalDataspaces {
    pub fn new(task_id: &TaskId, scratch: &Path, roots: DataspaceRoots) -> Self {
        Self::with_fs(task_id, scratch, roots, Arc::new(RealFileSystem))
    }

    pub fn with_fs(
        task_id: &TaskId,
        scratch: &Path,
        roots: DataspaceRoots,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            task: task_id.to_string(),
            scratch: scratch.to_path_buf(),
            roots,
            fs,
        }
    }

    fn input_root(&self, mode: InputAccessMode) -> (Option<&PathBuf>, &'static str) {
        match mode {
            InputAccessMode::FromInputSpace => (self.roots.input.as_ref(), "input"),
            InputAccessMode::FromOutputSpace => (self.roots.output.as_ref(), "output"),
            InputAccessMode::FromUserSpace => (self.roots.user.as_ref(), "user"),
            InputAccessMode::FromGlobalSpace => (self.roots.global.as_ref(), "global"),
        }
    }

    fn output_root(&self, mode: OutputAccessMode) -> (Option<&PathBuf>, &'static str) {
        match mode {
            OutputAccessMode::ToOutputSpace => (self.roots.output.as_ref(), "output"),
            OutputAccessMode::ToUserSpace => (self.roots.user.as_ref(), "user"),
            OutputAccessMode::ToGlobalSpace => (self.roots.global.as_ref(), "global"),
        }
    }

    async fn transfer(
        &self,
        selector: &FileSelector,
        src: PathBuf,
        dst: PathBuf,
        space: &'static str,
    ) -> Result<(), DataspaceError> {
        let matcher = selector
            .compile()
            .map_err(|e| DataspaceError::Selector {
                selector: selector.to_string(),
                reason: format!("{e:#}"),
            })?;
        let fs = Arc::clone(&self.fs);
        let copied = tokio::task::spawn_blocking(move || {
            copy_matching_files(fs.as_ref(), &src, &dst, &matcher)
        })
        .await
        .map_err(|e| DataspaceError::Transfer(e.to_string()))?
        .map_err(|e| DataspaceError::Transfer(format!("{e:#}")))?;

        if copied == 0 {
            warn!(task = %self.task, space, %selector, "selector matched no file");
        } else {
            debug!(task = %self.task, space, %selector, copied, "files transferred");
        }
        Ok(())
    }
}

fn path_uri(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl TaskDataspaces for LocalDataspaces {
    fn scratch_folder(&self) -> &Path {
        &self.scratch
    }

    fn scratch_uri(&self) -> String {
        path_uri(&self.scratch)
    }

    fn input_uri(&self) -> Option<String> {
        self.roots.input.as_deref().map(path_uri)
    }

    fn output_uri(&self) -> Option<String> {
        self.roots.output.as_deref().map(path_uri)
    }

    fn user_uri(&self) -> Option<String> {
        self.roots.user.as_deref().map(path_uri)
    }

    fn global_uri(&self) -> Option<String> {
        self.roots.global.as_deref().map(path_uri)
    }

    async fn copy_input_data_to_scratch(
        &self,
        selectors: &[InputSelector],
    ) -> Result<(), DataspaceError> {
        for sel in selectors {
            let (root, space) = self.input_root(sel.mode);
            let Some(root) = root else {
                warn!(task = %self.task, space, "dataspace not configured; skipping input selector");
                continue;
            };
            self.transfer(&sel.selector, root.clone(), self.scratch.clone(), space)
                .await?;
        }
        Ok(())
    }

    async fn copy_scratch_data_to_output(
        &self,
        selectors: &[OutputSelector],
    ) -> Result<(), DataspaceError> {
        for sel in selectors {
            let (root, space) = self.output_root(sel.mode);
            let Some(root) = root else {
                warn!(task = %self.task, space, "dataspace not configured; skipping output selector");
                continue;
            };
            self.transfer(&sel.selector, self.scratch.clone(), root.clone(), space)
                .await?;
        }
        Ok(())
    }

    async fn clean_scratch_space(&self) -> Result<(), DataspaceError> {
        let fs = Arc::clone(&self.fs);
        let scratch = self.scratch.clone();
        tokio::task::spawn_blocking(move || {
            if fs.is_dir(&scratch) {
                fs.clear_dir(&scratch)
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| DataspaceError::Transfer(e.to_string()))?
        .map_err(|e| DataspaceError::Transfer(format!("{e:#}")))
    }

    async fn close(&self) -> Result<(), DataspaceError> {
        info!(task = %self.task, "dataspaces closed");
        Ok(())
    }
}

/// Opens [`LocalDataspaces`] on fixed node roots.
#[derive(Debug, Clone, Default)]
pub struct LocalDataspacesFactory {
    roots: DataspaceRoots,
}

impl LocalDataspacesFactory {
    pub fn new(roots: DataspaceRoots) -> Self {
        Self { roots }
    }
}

impl DataspacesFactory for LocalDataspacesFactory {
    fn open(
        &self,
        task_id: &TaskId,
        scratch: &Path,
    ) -> Result<Arc<dyn TaskDataspaces>, DataspaceError> {
        for root in [
            &self.roots.input,
            &self.roots.output,
            &self.roots.user,
            &self.roots.global,
        ]
        .into_iter()
        .flatten()
        {
            std::fs::create_dir_all(root)?;
        }
        Ok(Arc::new(LocalDataspaces::new(task_id, scratch, self.roots.clone())))
    }
}
