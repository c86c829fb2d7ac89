// src/core/scripting.rs

//! The embeddable scripting collaborator. The core talks to a narrow
//! [`ScriptHost`] trait; the Lua implementation underneath registers script
//! functions by callback name and invokes them on lifecycle events. Script
//! errors are logged and never fatal to a session.

use crate::core::RelayError;
use crate::core::protocol::StreamRegistration;
use dashmap::DashMap;
use mlua::{Function, Lua};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle hooks the sequencer drives. Return values of the `-> i32`
/// hooks above zero carry meaning: `player_chat` overrides the publish mode
/// and `stream_added` vetoes the registration.
pub trait ScriptHost: Send + Sync {
    fn player_added(&self, uid: u32);
    fn player_deleted(&self, uid: u32, crashed: bool);
    fn player_chat(&self, uid: u32, msg: &str) -> i32;
    fn stream_added(&self, uid: u32, reg: &StreamRegistration) -> i32;
    fn game_cmd(&self, uid: u32, cmd: &str);
    fn frame_step(&self, dt: f32);
}

/// Callback names a script may register for.
const CALLBACK_TYPES: [&str; 6] = [
    "frameStep",
    "playerChat",
    "gameCmd",
    "playerAdded",
    "playerDeleted",
    "streamAdded",
];

/// Lua-backed script host.
///
/// The VM is wrapped in a `Mutex` because `mlua::Lua` is not `Sync`; hooks
/// are short and invoked outside the sequencer's table lock.
pub struct LuaScriptHost {
    vm: Mutex<Lua>,
    /// callback type -> registered script function names, in registration
    /// order.
    callbacks: Arc<DashMap<String, Vec<String>>>,
}

impl LuaScriptHost {
    /// Loads and executes the script file, collecting the callbacks it
    /// registers through `server.register_callback(type, name)`.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let source = std::fs::read_to_string(path)?;
        let lua = Lua::new();
        let callbacks: Arc<DashMap<String, Vec<String>>> = Arc::new(DashMap::new());

        {
            let server = lua.create_table()?;
            let cbs = Arc::clone(&callbacks);
            server.set(
                "register_callback",
                lua.create_function(move |_, (cbtype, func): (String, String)| {
                    if !CALLBACK_TYPES.contains(&cbtype.as_str()) {
                        warn!("script registered unknown callback type '{cbtype}'");
                        return Ok(());
                    }
                    cbs.entry(cbtype).or_default().push(func);
                    Ok(())
                })?,
            )?;
            server.set(
                "log",
                lua.create_function(|_, msg: String| {
                    info!("script: {msg}");
                    Ok(())
                })?,
            )?;
            lua.globals().set("server", server)?;
            lua.load(&source).exec()?;
        }

        let host = Self {
            vm: Mutex::new(lua),
            callbacks,
        };
        info!(
            "script {} loaded, {} callback(s) registered",
            path.display(),
            host.callbacks.iter().map(|e| e.value().len()).sum::<usize>()
        );
        Ok(host)
    }

    /// Invokes every function registered for `cbtype`, discarding results.
    fn call_void(&self, cbtype: &str, args: impl mlua::IntoLuaMulti + Clone) {
        self.call_int(cbtype, args);
    }

    /// Invokes every function registered for `cbtype` and returns the
    /// largest positive integer any of them returned, or 0.
    fn call_int(&self, cbtype: &str, args: impl mlua::IntoLuaMulti + Clone) -> i32 {
        let Some(names) = self.callbacks.get(cbtype).map(|e| e.value().clone()) else {
            return 0;
        };
        let vm = match self.vm.lock() {
            Ok(vm) => vm,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut result = 0;
        for name in names {
            let func: Function = match vm.globals().get(&*name) {
                Ok(f) => f,
                Err(e) => {
                    warn!("script callback '{name}' is not a function: {e}");
                    continue;
                }
            };
            match func.call::<Option<i64>>(args.clone()) {
                Ok(Some(value)) if value > 0 => result = result.max(value as i32),
                Ok(_) => {}
                Err(e) => warn!("script callback '{name}' failed: {e}"),
            }
        }
        result
    }
}

impl ScriptHost for LuaScriptHost {
    fn player_added(&self, uid: u32) {
        self.call_void("playerAdded", uid);
    }

    fn player_deleted(&self, uid: u32, crashed: bool) {
        self.call_void("playerDeleted", (uid, crashed as i32));
    }

    fn player_chat(&self, uid: u32, msg: &str) -> i32 {
        self.call_int("playerChat", (uid, msg.to_string()))
    }

    fn stream_added(&self, uid: u32, reg: &StreamRegistration) -> i32 {
        self.call_int(
            "streamAdded",
            (uid, reg.name_str().to_string(), reg.kind, reg.status),
        )
    }

    fn game_cmd(&self, uid: u32, cmd: &str) {
        self.call_void("gameCmd", (uid, cmd.to_string()));
    }

    fn frame_step(&self, dt: f32) {
        self.call_void("frameStep", dt);
    }
}
