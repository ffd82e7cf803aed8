// src/script/lua.rs

//! Embedded Lua 5.4 engine.
//!
//! Each evaluation gets a fresh interpreter. Globals exposed to scripts:
//! `variables`, `results` and `args` (zero-based), `credentials`,
//! `resultMetadata`, `properties`, the dataspace locations `localspace`,
//! `input`, `output`, `user`, `global`, plus `print` (no newline),
//! `println`, `eprintln` and an interruptible `sleep(ms)`. The task value is
//! the chunk's return value, or the global `result` when it returns nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, Lua, LuaSerdeExt, MultiValue, Table, Value as LuaValue, Variadic,
    VmState,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ScriptBindings, ScriptEngine, ScriptError, ScriptIo, ScriptOutcome};
use crate::decrypter::CredentialAccess;
use crate::logger::OutputSink;
use crate::task::variables::value_to_string;
use crate::task::{Script, Variables};

const INTERRUPTED: &str = "task interrupted";
const HOOK_INSTRUCTIONS: u32 = 1000;
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct LuaEngine;

impl ScriptEngine for LuaEngine {
    fn language(&self) -> &str {
        "lua"
    }

    fn evaluate(
        &self,
        name: &str,
        script: &Script,
        bindings: ScriptBindings,
        io: &ScriptIo<'_>,
    ) -> Result<ScriptOutcome, ScriptError> {
        let lua = Lua::new();
        let denied = Arc::new(AtomicBool::new(false));

        install_bindings(&lua, &bindings, io, &denied)
            .map_err(|e| ScriptError::Binding(e.to_string()))?;
        install_interrupt_hook(&lua, io.cancel.clone());

        let returned = lua
            .load(script.code.as_str())
            .set_name(format!("={name}"))
            .call::<LuaValue>(());

        match returned {
            Ok(value) => collect_outcome(&lua, value, &bindings),
            Err(e) => Err(classify(e, io, &denied)),
        }
    }
}

fn classify(err: mlua::Error, io: &ScriptIo<'_>, denied: &AtomicBool) -> ScriptError {
    if io.cancel.is_cancelled() {
        return ScriptError::Interrupted;
    }
    if denied.load(Ordering::SeqCst) {
        return ScriptError::Credentials(io.env.credentials.denial().unwrap_or_default());
    }
    ScriptError::Runtime(err.to_string())
}

fn install_bindings(
    lua: &Lua,
    bindings: &ScriptBindings,
    io: &ScriptIo<'_>,
    denied: &Arc<AtomicBool>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("variables", lua.to_value(&bindings.variables)?)?;
    globals.set("results", zero_based(lua, &bindings.results)?)?;
    globals.set("args", zero_based(lua, &bindings.args)?)?;
    globals.set("resultMetadata", lua.to_value(&bindings.metadata)?)?;
    globals.set("properties", lua.to_value(&io.env.properties)?)?;
    globals.set("credentials", credentials_table(lua, &io.env.credentials, denied)?)?;

    let spaces = &bindings.dataspaces;
    globals.set("localspace", spaces.scratch.as_str())?;
    globals.set("input", spaces.input.as_str())?;
    globals.set("output", spaces.output.as_str())?;
    globals.set("user", spaces.user.as_str())?;
    globals.set("global", spaces.global.as_str())?;

    for (name, value) in &bindings.extra {
        globals.set(name.as_str(), lua.to_value(value)?)?;
    }

    globals.set("print", writer_fn(lua, io.out.clone(), false)?)?;
    globals.set("println", writer_fn(lua, io.out.clone(), true)?)?;
    globals.set("eprintln", writer_fn(lua, io.err.clone(), true)?)?;
    globals.set("sleep", sleep_fn(lua, io.cancel.clone())?)?;

    guard_protected_calls(lua, io.cancel.clone())?;
    override_getenv(lua, io.env.env.clone())
}

/// `pcall`, `xpcall` and `coroutine.resume` catch errors, including the
/// interrupt raised by the hook. Once cancelled, they raise it again.
fn guard_protected_calls(lua: &Lua, cancel: CancellationToken) -> mlua::Result<()> {
    let globals = lua.globals();
    let coroutine: Option<Table> = globals.get("coroutine")?;
    let mut targets = vec![(globals.clone(), "pcall"), (globals.clone(), "xpcall")];
    if let Some(coroutine) = coroutine {
        targets.push((coroutine, "resume"));
    }

    for (table, name) in targets {
        let original: Option<Function> = table.get(name)?;
        let Some(original) = original else {
            continue;
        };
        let cancel = cancel.clone();
        table.set(
            name,
            lua.create_function(move |_, args: MultiValue| {
                let returned: MultiValue = original.call(args)?;
                if cancel.is_cancelled() {
                    return Err(mlua::Error::runtime(INTERRUPTED));
                }
                Ok(returned)
            })?,
        )?;
    }
    Ok(())
}

fn install_interrupt_hook(lua: &Lua, cancel: CancellationToken) {
    let triggers = HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS);
    lua.set_hook(triggers, move |_lua, _debug| {
        if cancel.is_cancelled() {
            Err(mlua::Error::runtime(INTERRUPTED))
        } else {
            Ok(VmState::Continue)
        }
    });
}

fn zero_based<T: Serialize>(lua: &Lua, items: &[T]) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (i, item) in items.iter().enumerate() {
        table.raw_set(i as i64, lua.to_value(item)?)?;
    }
    Ok(table)
}

/// Third-party credentials, or a table whose every lookup raises the
/// decryption error.
fn credentials_table(
    lua: &Lua,
    access: &CredentialAccess,
    denied: &Arc<AtomicBool>,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    if let CredentialAccess::Available(map) = access {
        for (key, value) in map {
            table.set(key.as_str(), value.as_str())?;
        }
        return Ok(table);
    }

    let message = access.denial().unwrap_or_default();
    let denied = Arc::clone(denied);
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(move |_, _: (LuaValue, LuaValue)| -> mlua::Result<LuaValue> {
            denied.store(true, Ordering::SeqCst);
            Err(mlua::Error::runtime(message.clone()))
        })?,
    )?;
    table.set_metatable(Some(meta));
    Ok(table)
}

fn writer_fn(lua: &Lua, sink: OutputSink, newline: bool) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: Variadic<LuaValue>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut text = String::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                text.push('\t');
            }
            text.push_str(&tostring.call::<String>(arg.clone())?);
        }
        if newline {
            text.push('\n');
        }
        sink.write_str(&text).map_err(mlua::Error::external)
    })
}

fn sleep_fn(lua: &Lua, cancel: CancellationToken) -> mlua::Result<Function> {
    lua.create_function(move |_, millis: u64| {
        let deadline = Instant::now() + Duration::from_millis(millis);
        loop {
            if cancel.is_cancelled() {
                return Err(mlua::Error::runtime(INTERRUPTED));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    })
}

/// `os.getenv` consults the execution environment overlay first.
fn override_getenv(lua: &Lua, overlay: BTreeMap<String, String>) -> mlua::Result<()> {
    let os: Option<Table> = lua.globals().get("os")?;
    if let Some(os) = os {
        os.set(
            "getenv",
            lua.create_function(move |_, name: String| {
                Ok(overlay
                    .get(&name)
                    .cloned()
                    .or_else(|| std::env::var(&name).ok()))
            })?,
        )?;
    }
    Ok(())
}

fn to_json(lua: &Lua, value: LuaValue, what: &str) -> Result<Value, ScriptError> {
    lua.from_value::<Value>(value)
        .map_err(|e| ScriptError::Binding(format!("{what}: {e}")))
}

fn read_table<T: serde::de::DeserializeOwned + Default>(
    lua: &Lua,
    name: &str,
) -> Result<T, ScriptError> {
    let value: LuaValue = lua
        .globals()
        .get(name)
        .map_err(|e| ScriptError::Binding(e.to_string()))?;
    match value {
        LuaValue::Nil => Ok(T::default()),
        LuaValue::Table(_) => lua
            .from_value::<T>(value)
            .map_err(|e| ScriptError::Binding(format!("{name}: {e}"))),
        _ => Err(ScriptError::Binding(format!("{name} must be a table"))),
    }
}

fn collect_outcome(
    lua: &Lua,
    returned: LuaValue,
    bindings: &ScriptBindings,
) -> Result<ScriptOutcome, ScriptError> {
    let globals = lua.globals();
    let value = if returned.is_nil() {
        globals
            .get::<LuaValue>("result")
            .map_err(|e| ScriptError::Binding(e.to_string()))?
    } else {
        returned
    };
    let value = to_json(lua, value, "result")?;

    let variables: Variables = read_table(lua, "variables")?;
    let metadata: BTreeMap<String, Value> = read_table(lua, "resultMetadata")?;
    let metadata = metadata
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();

    let mut extra = BTreeMap::new();
    for name in &bindings.read_back {
        let raw = globals
            .get::<LuaValue>(*name)
            .map_err(|e| ScriptError::Binding(e.to_string()))?;
        extra.insert(name.to_string(), to_json(lua, raw, name)?);
    }

    Ok(ScriptOutcome {
        value,
        variables,
        metadata,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionEnvironment;

    fn eval(
        code: &str,
        bindings: ScriptBindings,
        env: &ExecutionEnvironment,
    ) -> (Result<ScriptOutcome, ScriptError>, String) {
        let (out, captured) = OutputSink::capture();
        let err = OutputSink::discard();
        let cancel = CancellationToken::new();
        let io = ScriptIo {
            out: &out,
            err: &err,
            cancel: &cancel,
            env,
        };
        let res = LuaEngine.evaluate("test", &Script::lua(code), bindings, &io);
        (res, captured.contents())
    }

    #[test]
    fn print_has_no_trailing_newline_and_println_does() {
        let (res, out) = eval(
            "print('a', 1) println('b')",
            ScriptBindings::default(),
            &ExecutionEnvironment::default(),
        );
        res.unwrap();
        assert_eq!(out, "a\t1b\n");
    }

    #[test]
    fn value_comes_from_return_or_result_global() {
        let env = ExecutionEnvironment::default();
        let (res, _) = eval("return 'x'", ScriptBindings::default(), &env);
        assert_eq!(res.unwrap().value, Value::from("x"));
        let (res, _) = eval("result = 41 + 1", ScriptBindings::default(), &env);
        assert_eq!(res.unwrap().value, Value::from(42));
        let (res, _) = eval("local a = 1", ScriptBindings::default(), &env);
        assert_eq!(res.unwrap().value, Value::Null);
    }

    #[test]
    fn variables_and_metadata_are_read_back() {
        let bindings = ScriptBindings {
            variables: [("v".to_string(), Value::from("value"))].into(),
            ..Default::default()
        };
        let (res, out) = eval(
            "print(variables.v) variables.v = 'task' variables.n = 3 resultMetadata.k = 'meta'",
            bindings,
            &ExecutionEnvironment::default(),
        );
        let outcome = res.unwrap();
        assert_eq!(out, "value");
        assert_eq!(outcome.variables["v"], Value::from("task"));
        assert_eq!(outcome.variables["n"], Value::from(3));
        assert_eq!(outcome.metadata["k"], "meta");
    }

    #[test]
    fn results_and_args_are_zero_based() {
        let bindings = ScriptBindings {
            results: vec![Value::from("aresult")],
            args: vec!["Hello".into()],
            ..Default::default()
        };
        let (res, out) = eval(
            "print(results[0]) print(args[0])",
            bindings,
            &ExecutionEnvironment::default(),
        );
        res.unwrap();
        assert_eq!(out, "aresultHello");
    }

    #[test]
    fn credentials_access_without_bundle_fails_only_when_touched() {
        let env = ExecutionEnvironment::default();
        let (res, _) = eval("print('fine')", ScriptBindings::default(), &env);
        assert!(res.is_ok());
        let (res, _) = eval("print(credentials.PASSWORD)", ScriptBindings::default(), &env);
        assert!(matches!(res, Err(ScriptError::Credentials(_))));
    }

    #[test]
    fn errors_surface_as_runtime_failures() {
        let (res, _) = eval(
            "error('boom')",
            ScriptBindings::default(),
            &ExecutionEnvironment::default(),
        );
        match res {
            Err(ScriptError::Runtime(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn getenv_sees_overlay_and_properties_are_bound() {
        let env = ExecutionEnvironment {
            env: [("envVar".to_string(), "aValue".to_string())].into(),
            properties: [("jvmArg".to_string(), "aValue".to_string())].into(),
            ..Default::default()
        };
        let (res, out) = eval(
            "print(os.getenv('envVar') .. ' ' .. properties.jvmArg)",
            ScriptBindings::default(),
            &env,
        );
        res.unwrap();
        assert_eq!(out, "aValue aValue");
    }

    #[test]
    fn protected_calls_do_not_swallow_the_interrupt() {
        let env = ExecutionEnvironment::default();
        let sink = OutputSink::discard();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let io = ScriptIo {
            out: &sink,
            err: &sink,
            cancel: &cancel,
            env: &env,
        };
        let code = r#"
            while true do
                pcall(function() while true do end end)
                xpcall(function() sleep(10000) end, function(e) return e end)
                coroutine.resume(coroutine.create(function() sleep(10000) end))
            end
        "#;
        let started = Instant::now();
        let res = LuaEngine.evaluate("stubborn", &Script::lua(code), ScriptBindings::default(), &io);
        canceller.join().unwrap();
        assert!(matches!(res, Err(ScriptError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn protected_calls_still_catch_ordinary_errors() {
        let (res, _) = eval(
            "local ok, err = pcall(error, 'boom') return tostring(ok) .. ' ' .. tostring(err:find('boom') ~= nil)",
            ScriptBindings::default(),
            &ExecutionEnvironment::default(),
        );
        assert_eq!(res.unwrap().value, Value::from("false true"));
    }

    #[test]
    fn cancelled_token_interrupts_busy_loop() {
        let (out, _) = OutputSink::capture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let env = ExecutionEnvironment::default();
        let io = ScriptIo {
            out: &out,
            err: &out,
            cancel: &cancel,
            env: &env,
        };
        let res = LuaEngine.evaluate(
            "loop",
            &Script::lua("while true do end"),
            ScriptBindings::default(),
            &io,
        );
        assert!(matches!(res, Err(ScriptError::Interrupted)));
    }
}
