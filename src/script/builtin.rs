// src/script/builtin.rs

//! Task bodies compiled into the binary, addressed by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::ScriptError;
use crate::logger::OutputSink;
use crate::task::variables::value_to_string;
use crate::task::Variables;

pub struct BuiltinCall<'a> {
    /// String arguments are already substituted.
    pub args: &'a BTreeMap<String, Value>,
    pub variables: &'a mut Variables,
    pub out: &'a OutputSink,
    pub cancel: &'a CancellationToken,
}

pub trait TaskBody: Send + Sync {
    fn run(&self, call: BuiltinCall<'_>) -> Result<Value, ScriptError>;
}

#[derive(Clone)]
pub struct Builtins {
    bodies: BTreeMap<String, Arc<dyn TaskBody>>,
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.bodies.keys()).finish()
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Builtins {
    pub fn empty() -> Self {
        Self {
            bodies: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut builtins = Self::empty();
        builtins.register("echo", Arc::new(Echo));
        builtins.register("sleep", Arc::new(Sleep));
        builtins
    }

    pub fn register(&mut self, name: &str, body: Arc<dyn TaskBody>) {
        self.bodies.insert(name.to_string(), body);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskBody>> {
        self.bodies.get(name).cloned()
    }
}

/// Prints `message` and returns it.
struct Echo;

impl TaskBody for Echo {
    fn run(&self, call: BuiltinCall<'_>) -> Result<Value, ScriptError> {
        let message = call.args.get("message").map(value_to_string).unwrap_or_default();
        call.out.write_str(&format!("{message}\n"))?;
        Ok(Value::String(message))
    }
}

/// Waits `millis` milliseconds, interruptibly.
struct Sleep;

impl TaskBody for Sleep {
    fn run(&self, call: BuiltinCall<'_>) -> Result<Value, ScriptError> {
        let millis = call.args.get("millis").and_then(Value::as_u64).unwrap_or(0);
        let deadline = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < deadline {
            if call.cancel.is_cancelled() {
                return Err(ScriptError::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(Value::Null)
    }
}
