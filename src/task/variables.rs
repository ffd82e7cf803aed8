// src/task/variables.rs

//! Task variables: assembly order, reserved names and `$NAME` substitution.
//!
//! Variables are rebuilt for every task invocation:
//! parent results → job variables → system values, then each script phase
//! mutates the map in place. The last writer wins per key.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use super::TaskContext;

pub type Variables = BTreeMap<String, Value>;

pub const PA_JOB_ID: &str = "PA_JOB_ID";
pub const PA_JOB_NAME: &str = "PA_JOB_NAME";
pub const PA_TASK_ID: &str = "PA_TASK_ID";
pub const PA_TASK_NAME: &str = "PA_TASK_NAME";
pub const PA_TASK_ITERATION: &str = "PA_TASK_ITERATION";
pub const PA_TASK_REPLICATION: &str = "PA_TASK_REPLICATION";
pub const PA_SCHEDULER_HOME: &str = "PA_SCHEDULER_HOME";
pub const PA_NODESFILE: &str = "PA_NODESFILE";
pub const PA_USER: &str = "PA_USER";
pub const PA_TASK_PROGRESS_FILE: &str = "PA_TASK_PROGRESS_FILE";

/// Prefix reserved for system-injected variables.
pub const RESERVED_PREFIX: &str = "PA_";

const CREDENTIALS_PREFIX: &str = "credentials_";
const NODES_FILE_PREFIX: &str = ".nodesfile-";

/// `${NAME}` or `$NAME`.
const PLACEHOLDER: &str = r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)";
const TAG: &str = r"\$(IT|REP|JID)\b";

fn compiled(slot: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    slot.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "invalid substitution pattern; substitution disabled");
            None
        }
    })
    .as_ref()
}

fn placeholder_regex() -> Option<&'static Regex> {
    static SLOT: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&SLOT, PLACEHOLDER)
}

fn tag_regex() -> Option<&'static Regex> {
    static SLOT: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&SLOT, TAG)
}

/// Render a variable value the way it appears inside a substituted string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Location of the nodes file for this task, when a scratch space exists.
pub fn nodes_file_path(context: &TaskContext) -> Option<PathBuf> {
    let scratch = context.dataspaces.scratch.trim();
    if scratch.is_empty() {
        return None;
    }
    Some(PathBuf::from(scratch).join(format!("{NODES_FILE_PREFIX}{}", context.task_id())))
}

/// Values injected by the system under the reserved `PA_` prefix.
pub fn system_variables(context: &TaskContext) -> Variables {
    let init = &context.initializer;
    let id = &init.task_id;
    let mut vars = Variables::new();
    vars.insert(PA_JOB_ID.into(), Value::String(id.job_id.to_string()));
    vars.insert(PA_JOB_NAME.into(), Value::String(id.job_name.clone()));
    vars.insert(PA_TASK_ID.into(), Value::String(id.task_id.to_string()));
    vars.insert(PA_TASK_NAME.into(), Value::String(id.task_name.clone()));
    vars.insert(PA_TASK_ITERATION.into(), Value::from(init.iteration_index));
    vars.insert(PA_TASK_REPLICATION.into(), Value::from(init.replication_index));
    vars.insert(
        PA_SCHEDULER_HOME.into(),
        Value::String(context.scheduler_home.clone()),
    );
    if let Some(path) = nodes_file_path(context) {
        vars.insert(
            PA_NODESFILE.into(),
            Value::String(path.to_string_lossy().into_owned()),
        );
    }
    if let Some(owner) = &init.job_owner {
        vars.insert(PA_USER.into(), Value::String(owner.clone()));
    }
    if let Some(progress) = &context.progress_file {
        vars.insert(
            PA_TASK_PROGRESS_FILE.into(),
            Value::String(progress.to_string_lossy().into_owned()),
        );
    }
    vars
}

/// Fresh variable map for one invocation, before any script has run.
pub fn build_task_variables(context: &TaskContext) -> Variables {
    let mut vars = Variables::new();
    for parent in &context.previous_results {
        vars.extend(
            parent
                .propagated_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    vars.extend(
        context
            .initializer
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    vars.extend(system_variables(context));
    vars
}

/// Iteration/replication/job tags replaced in script code and arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tags {
    pub iteration: u32,
    pub replication: u32,
    pub job_id: u64,
}

impl Tags {
    pub fn for_context(context: &TaskContext) -> Self {
        Self {
            iteration: context.initializer.iteration_index,
            replication: context.initializer.replication_index,
            job_id: context.initializer.task_id.job_id,
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "IT" => Some(self.iteration.to_string()),
            "REP" => Some(self.replication.to_string()),
            "JID" => Some(self.job_id.to_string()),
            _ => None,
        }
    }

    /// Replace `$IT`, `$REP` and `$JID` tags, leaving everything else alone.
    pub fn apply(&self, input: &str) -> String {
        match tag_regex() {
            Some(re) => re
                .replace_all(input, |caps: &Captures<'_>| {
                    self.lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned(),
            None => input.to_string(),
        }
    }
}

/// Resolves `$NAME` / `${NAME}` placeholders.
///
/// Lookup order for a name: `credentials_<KEY>` (any case of the prefix)
/// against decrypted third-party credentials, then variables, then tags.
/// Unresolvable placeholders are left as literal text.
#[derive(Debug, Clone, Copy)]
pub struct Substitutor<'a> {
    variables: &'a Variables,
    credentials: Option<&'a BTreeMap<String, String>>,
    tags: Option<Tags>,
}

impl<'a> Substitutor<'a> {
    pub fn new(variables: &'a Variables) -> Self {
        Self {
            variables,
            credentials: None,
            tags: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<&'a BTreeMap<String, String>>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(key) = credential_key(name) {
            return self.credentials.and_then(|c| c.get(key).cloned());
        }
        if let Some(value) = self.variables.get(name) {
            return Some(value_to_string(value));
        }
        self.tags.and_then(|t| t.lookup(name))
    }

    pub fn substitute(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }
        let Some(re) = placeholder_regex() else {
            return input.to_string();
        };
        re.replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            self.resolve(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
    }

    pub fn substitute_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }
}

fn credential_key(name: &str) -> Option<&str> {
    let prefix = name.get(..CREDENTIALS_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(CREDENTIALS_PREFIX) && name.len() > CREDENTIALS_PREFIX.len() {
        Some(&name[CREDENTIALS_PREFIX.len()..])
    } else {
        None
    }
}
