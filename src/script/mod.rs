// src/script/mod.rs

//! Script engines keyed by language tag.
//!
//! Engines are synchronous: executors call them from a blocking worker
//! thread and interrupt them through the cancellation token in
//! [`ScriptIo`].

pub mod builtin;
pub mod lua;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::executor::ExecutionEnvironment;
use crate::logger::OutputSink;
use crate::task::{DataspaceUris, Script, Variables};

pub use builtin::{BuiltinCall, Builtins, TaskBody};
pub use lua::LuaEngine;
pub use shell::ShellEngine;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("no script engine registered for language '{0}'")]
    UnknownLanguage(String),

    #[error("{0}")]
    Runtime(String),

    #[error("exited with code {0}")]
    NonZeroExit(i32),

    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    Credentials(String),

    #[error("invalid binding: {0}")]
    Binding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Values a script sees.
#[derive(Debug, Clone, Default)]
pub struct ScriptBindings {
    /// Already substituted.
    pub args: Vec<String>,
    pub variables: Variables,
    /// Values of previous task results, in dependency order.
    pub results: Vec<Value>,
    pub metadata: BTreeMap<String, String>,
    pub dataspaces: DataspaceUris,
    /// Phase-specific globals such as `result` or `forkEnvironment`.
    pub extra: BTreeMap<String, Value>,
    /// Globals to read back into [`ScriptOutcome::extra`].
    pub read_back: Vec<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub value: Value,
    pub variables: Variables,
    pub metadata: BTreeMap<String, String>,
    pub extra: BTreeMap<String, Value>,
}

/// Streams, cancellation and environment for one evaluation.
#[derive(Clone, Copy)]
pub struct ScriptIo<'a> {
    pub out: &'a OutputSink,
    pub err: &'a OutputSink,
    pub cancel: &'a CancellationToken,
    pub env: &'a ExecutionEnvironment,
}

pub trait ScriptEngine: Send + Sync {
    fn language(&self) -> &str;

    /// Evaluate `script`; `name` identifies the chunk in error messages.
    fn evaluate(
        &self,
        name: &str,
        script: &Script,
        bindings: ScriptBindings,
        io: &ScriptIo<'_>,
    ) -> Result<ScriptOutcome, ScriptError>;
}

/// Language tag → engine.
#[derive(Clone)]
pub struct ScriptEngines {
    engines: BTreeMap<String, Arc<dyn ScriptEngine>>,
}

impl fmt::Debug for ScriptEngines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.engines.keys()).finish()
    }
}

impl Default for ScriptEngines {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ScriptEngines {
    pub fn empty() -> Self {
        Self {
            engines: BTreeMap::new(),
        }
    }

    /// `lua`, plus `sh`/`bash` shell scripts.
    pub fn with_defaults() -> Self {
        let mut engines = Self::empty();
        engines.register("lua", Arc::new(LuaEngine));
        engines.register("sh", Arc::new(ShellEngine::new("sh")));
        engines.register("bash", Arc::new(ShellEngine::new("bash")));
        engines
    }

    /// Tags are case-insensitive.
    pub fn register(&mut self, language: &str, engine: Arc<dyn ScriptEngine>) {
        self.engines.insert(language.to_ascii_lowercase(), engine);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn ScriptEngine>, ScriptError> {
        self.engines
            .get(&language.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ScriptError::UnknownLanguage(language.to_string()))
    }

    pub fn supports(&self, language: &str) -> bool {
        self.engines.contains_key(&language.to_ascii_lowercase())
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }
}
