// src/task/selector.rs

//! Input/output file selectors.
//!
//! A selector is a set of include/exclude glob patterns relative to a
//! dataspace root, paired with the dataspace it reads from or writes to.
//! Patterns may carry `$VAR`/`${VAR}` placeholders; they are resolved once,
//! against the variables of the phase that uses them.

use std::fmt;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use super::{Substitutor, Variables};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileSelector {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl FileSelector {
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            includes: vec![pattern.into()],
            excludes: Vec::new(),
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Substitute placeholders in every pattern. An empty map leaves the
    /// literal patterns in place.
    pub fn resolve(&self, variables: &Variables) -> FileSelector {
        let subst = Substitutor::new(variables);
        FileSelector {
            includes: subst.substitute_all(&self.includes),
            excludes: subst.substitute_all(&self.excludes),
        }
    }

    pub fn compile(&self) -> Result<SelectorMatcher> {
        Ok(SelectorMatcher {
            include_set: build_globset(&self.includes)?,
            exclude_set: if self.excludes.is_empty() {
                None
            } else {
                Some(build_globset(&self.excludes)?)
            },
        })
    }
}

impl fmt::Display for FileSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "includes={:?} excludes={:?}", self.includes, self.excludes)
    }
}

/// Compiled form of a [`FileSelector`].
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    include_set: GlobSet,
    exclude_set: Option<GlobSet>,
}

impl SelectorMatcher {
    /// `rel_path` uses `/` separators and is relative to the dataspace root.
    pub fn matches(&self, rel_path: &str) -> bool {
        if !self.include_set.is_match(rel_path) {
            return false;
        }
        if let Some(exclude) = &self.exclude_set {
            if exclude.is_match(rel_path) {
                return false;
            }
        }
        true
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputAccessMode {
    FromInputSpace,
    FromOutputSpace,
    FromUserSpace,
    FromGlobalSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAccessMode {
    ToOutputSpace,
    ToUserSpace,
    ToGlobalSpace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSelector {
    #[serde(flatten)]
    pub selector: FileSelector,
    pub mode: InputAccessMode,
}

impl InputSelector {
    pub fn new(selector: FileSelector, mode: InputAccessMode) -> Self {
        Self { selector, mode }
    }

    pub fn resolve(&self, variables: &Variables) -> Self {
        Self::new(self.selector.resolve(variables), self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSelector {
    #[serde(flatten)]
    pub selector: FileSelector,
    pub mode: OutputAccessMode,
}

impl OutputSelector {
    pub fn new(selector: FileSelector, mode: OutputAccessMode) -> Self {
        Self { selector, mode }
    }

    pub fn resolve(&self, variables: &Variables) -> Self {
        Self::new(self.selector.resolve(variables), self.mode)
    }
}
