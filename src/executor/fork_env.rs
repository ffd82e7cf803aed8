// src/executor/fork_env.rs

//! Resolution of a task's [`ForkEnvironment`]: the optional environment
//! script, then placeholder substitution of every field.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use super::ExecutionEnvironment;
use crate::decrypter::CredentialAccess;
use crate::task::variables::{value_to_string, Substitutor};
use crate::task::ForkEnvironment;

/// Binding through which an environment script edits the fork environment.
pub const FORK_ENVIRONMENT_BINDING: &str = "forkEnvironment";

/// Fork environment with every placeholder resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedForkEnvironment {
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub runtime_args: Vec<String>,
}

impl ResolvedForkEnvironment {
    pub fn substituted(fork: &ForkEnvironment, substitutor: &Substitutor<'_>) -> Self {
        Self {
            working_dir: fork
                .working_dir
                .as_deref()
                .map(|dir| substitutor.substitute(dir))
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            env: fork
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitutor.substitute(v)))
                .collect(),
            runtime_args: substitutor.substitute_all(&fork.runtime_args),
        }
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        properties_from_runtime_args(&self.runtime_args)
    }

    pub fn execution_environment(&self, credentials: CredentialAccess) -> ExecutionEnvironment {
        ExecutionEnvironment {
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            properties: self.properties(),
            credentials,
            inherit_process_group: false,
        }
    }
}

/// `-Dkey=value` arguments as a property map. `-Dkey` alone maps to an
/// empty string; anything else is ignored.
pub fn properties_from_runtime_args(args: &[String]) -> BTreeMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.strip_prefix("-D"))
        .filter(|def| !def.is_empty())
        .map(|def| match def.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (def.to_string(), String::new()),
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// The `forkEnvironment` binding handed to an environment script.
pub fn to_binding(fork: &ForkEnvironment) -> Value {
    serde_json::json!({
        "workingDir": fork.working_dir,
        "env": fork.env,
        "runtimeArgs": fork.runtime_args,
    })
}

/// Read the binding back after the script ran. Lua cannot tell an empty
/// list from an empty map, so both are accepted for `env` and
/// `runtimeArgs`.
pub fn from_binding(base: &ForkEnvironment, value: &Value) -> Result<ForkEnvironment, String> {
    let fields = value
        .as_object()
        .ok_or_else(|| format!("{FORK_ENVIRONMENT_BINDING} must be a table"))?;

    let working_dir = match fields.get("workingDir") {
        None | Some(Value::Null) => None,
        Some(Value::String(dir)) => Some(dir.clone()),
        Some(other) => return Err(format!("workingDir must be a string, got {other}")),
    };

    let env = match fields.get("env") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        Some(Value::Array(items)) if items.is_empty() => BTreeMap::new(),
        Some(other) => return Err(format!("env must be a table of strings, got {other}")),
    };

    let runtime_args = match fields.get("runtimeArgs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(Value::Object(map)) if map.is_empty() => Vec::new(),
        Some(other) => return Err(format!("runtimeArgs must be a list, got {other}")),
    };

    Ok(ForkEnvironment {
        working_dir,
        env,
        runtime_args,
        env_script: base.env_script.clone(),
    })
}
