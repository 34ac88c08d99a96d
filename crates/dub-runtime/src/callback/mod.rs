//! Callback thread manager
//!
//! A native object that calls back into script code embeds a
//! `CallbackThread`. Binding it to a handle creates a script-side `self`
//! table (a composite linked to the handle) and a dedicated coroutine that
//! runs every callback under an error shim.
//!
//! Native code drives a callback by staging values and then calling:
//!
//! ```text
//! if thread.push_callback(lua, "callback")? {
//!     thread.push(lua, "msg")?;
//!     thread.call(lua, 1, 0);
//! }
//! ```
//!
//! All script state lives in an environment table reachable only from the
//! handle's side table. A weak-valued registry table maps the thread id to
//! that environment, so the native side never keeps the script object alive.

use std::cell::Cell;

use mlua::{
    AnyUserData, Function, IntoLua, Lua, MultiValue, Table, Thread, ThreadStatus, Value,
};

use crate::error::{BridgeError, BridgeResult};
use crate::handle::{self, NativeObject, Owns, ENV_KEY};
use crate::options::ErrorChannel;
use crate::registry::TypeRegistry;
use crate::resolve;

const PRELUDE_SOURCE: &str = include_str!("prelude.lua");
const PRELUDE_KEY: &str = "dub.callback.prelude";
const ENVS_KEY: &str = "dub.callback.envs";

/// Values kept at the bottom of every staging stack (`self` and the shim)
pub const BASE_DEPTH: usize = 2;

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a callback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    /// Never bound to a handle
    Uninitialized,
    /// Bound, and the script object is still reachable
    Active,
    /// The script object was collected
    TornDown,
}

/// Native-side half of a callback-capable object.
///
/// Holds no strong reference into the script runtime.
#[derive(Debug, Default)]
pub struct CallbackThread {
    id: Cell<Option<u64>>,
    running: Cell<usize>,
}

/// Native objects that can call back into scripts.
pub trait Callable: NativeObject {
    /// The embedded callback thread
    fn callback_thread(&self) -> &CallbackThread;
}

impl CallbackThread {
    /// Create an unbound thread
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to the handle `ud`, turning `base` (a table or nil) into the
    /// script-side `self`.
    ///
    /// Binding again replaces the previous environment.
    pub fn bind<'lua>(
        &self,
        lua: &'lua Lua,
        ud: &AnyUserData<'lua>,
        base: Value<'lua>,
    ) -> BridgeResult<Table<'lua>> {
        let this = resolve::make_composite(lua, base, ud)?;
        let prelude = Prelude::load(lua)?;
        let shim: Function = prelude
            .make_shim
            .call((this.clone(), prelude.report.clone()))?;
        let token = lua.create_table()?;
        let thread = spawn(lua, &prelude.dispatcher, &token, &shim)?;

        let stack = lua.create_table()?;
        stack.raw_set(1, this.clone())?;
        stack.raw_set(2, shim.clone())?;
        stack.raw_set("n", BASE_DEPTH)?;

        let env = lua.create_table()?;
        env.raw_set("self", this.clone())?;
        env.raw_set("shim", shim)?;
        env.raw_set("token", token)?;
        env.raw_set("thread", thread)?;
        env.raw_set("stack", stack)?;
        handle::side_table(lua, ud)?.raw_set(ENV_KEY, env.clone())?;

        let id = match self.id.get() {
            Some(id) => id,
            None => {
                let id = TypeRegistry::of(lua).next_thread_id();
                self.id.set(Some(id));
                id
            }
        };
        envs(lua)?.raw_set(id, env)?;
        tracing::debug!(target: "dub::callback", id, "callback thread bound");
        Ok(this)
    }

    /// Current lifecycle state
    pub fn state(&self, lua: &Lua) -> BridgeResult<CallbackState> {
        if self.id.get().is_none() {
            return Ok(CallbackState::Uninitialized);
        }
        Ok(match self.env(lua)? {
            Some(_) => CallbackState::Active,
            None => CallbackState::TornDown,
        })
    }

    /// Script-side `self`, while the thread is active
    pub fn this<'lua>(&self, lua: &'lua Lua) -> BridgeResult<Option<Table<'lua>>> {
        match self.env(lua)? {
            Some(env) => Ok(Some(env.raw_get("self")?)),
            None => Ok(None),
        }
    }

    /// Stage `self[name]` followed by `self`.
    ///
    /// Returns false, leaving the stack untouched, when the thread is not
    /// active or the method is undefined.
    pub fn push_callback(&self, lua: &Lua, name: &str) -> BridgeResult<bool> {
        let Some(env) = self.env(lua)? else {
            return Ok(false);
        };
        let this: Table = env.raw_get("self")?;
        let callback: Value = this.get(name)?;
        if callback.is_nil() {
            return Ok(false);
        }
        let stack = Stack::of(&env)?;
        stack.push(callback)?;
        stack.push(Value::Table(this))?;
        Ok(true)
    }

    /// Stage `self[name]`, even when it is nil.
    ///
    /// Returns false only when the thread is not active.
    pub fn push_value(&self, lua: &Lua, name: &str) -> BridgeResult<bool> {
        let Some(env) = self.env(lua)? else {
            return Ok(false);
        };
        let this: Table = env.raw_get("self")?;
        let value: Value = this.get(name)?;
        Stack::of(&env)?.push(value)?;
        Ok(true)
    }

    /// Stage an argument.
    pub fn push<'lua, V: IntoLua<'lua>>(&self, lua: &'lua Lua, value: V) -> BridgeResult<bool> {
        let Some(env) = self.env(lua)? else {
            return Ok(false);
        };
        Stack::of(&env)?.push(value.into_lua(lua)?)?;
        Ok(true)
    }

    /// Remove and return the top staged value.
    ///
    /// The base values are never popped; an empty stack yields nil.
    pub fn pop<'lua>(&self, lua: &'lua Lua) -> BridgeResult<Value<'lua>> {
        match self.env(lua)? {
            Some(env) => Ok(Stack::of(&env)?.pop()?),
            None => Ok(Value::Nil),
        }
    }

    /// Number of staged values, base included. Zero when not active.
    pub fn depth(&self, lua: &Lua) -> BridgeResult<usize> {
        match self.env(lua)? {
            Some(env) => Ok(Stack::of(&env)?.depth()?),
            None => Ok(0),
        }
    }

    /// Call the function staged by `push_callback` with `self` and the
    /// `nargs` arguments pushed after it.
    ///
    /// On success exactly `nresults` values are left on the stack. A script
    /// error is routed to the object's `error` method or the configured
    /// channel, and false is returned with nothing pushed. Failures of the
    /// thread machinery itself are printed to stderr.
    pub fn call(&self, lua: &Lua, nargs: usize, nresults: usize) -> bool {
        match self.try_call(lua, nargs, nresults) {
            Ok(ok) => ok,
            Err(err) => {
                eprintln!("dub: callback thread failure: {}", err);
                tracing::error!(target: "dub::callback", error = %err, "callback thread failure");
                false
            }
        }
    }

    fn try_call(&self, lua: &Lua, nargs: usize, nresults: usize) -> BridgeResult<bool> {
        let Some(env) = self.env(lua)? else {
            return Ok(false);
        };
        let stack = Stack::of(&env)?;
        // function, self, then the arguments
        let needed = nargs + 2;
        let staged = stack.depth()?.saturating_sub(BASE_DEPTH);
        if staged < needed {
            return Err(BridgeError::CallbackFailure {
                message: format!("call expects {} staged values, found {}", needed, staged),
            });
        }
        let request = stack.take(needed)?;

        match self.dispatch(lua, &env, request)? {
            Some(results) => {
                let mut results = results.into_iter();
                for _ in 0..nresults {
                    stack.push(results.next().unwrap_or(Value::Nil))?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run one request on the dedicated coroutine. `None` means the
    /// callback raised and the shim already reported it.
    fn dispatch<'lua>(
        &self,
        lua: &'lua Lua,
        env: &Table<'lua>,
        request: Vec<Value<'lua>>,
    ) -> BridgeResult<Option<Vec<Value<'lua>>>> {
        let token: Table = env.raw_get("token")?;
        // A callback that calls back into the same object needs its own
        // coroutine: the dedicated one is busy running the outer call.
        let nested = self.running.get() > 0;
        let thread = if nested {
            self.respawn(lua, env, false)?
        } else {
            let thread: Thread = env.raw_get("thread")?;
            match thread.status() {
                ThreadStatus::Resumable => thread,
                _ => self.respawn(lua, env, true)?,
            }
        };

        self.running.set(self.running.get() + 1);
        let outcome = thread.resume::<_, MultiValue>(MultiValue::from_vec(request));
        self.running.set(self.running.get() - 1);

        let reply = match outcome {
            Ok(reply) => reply.into_vec(),
            Err(err) => {
                if !nested {
                    self.respawn(lua, env, true)?;
                }
                return Err(err.into());
            }
        };

        let mut reply = reply.into_iter();
        let finished = matches!(
            reply.next(),
            Some(Value::Table(ref t)) if t.to_pointer() == token.to_pointer()
        );
        if !finished {
            if !nested {
                self.respawn(lua, env, true)?;
            }
            return Err(BridgeError::CallbackFailure {
                message: "attempt to yield from a callback".to_string(),
            });
        }
        if !matches!(reply.next(), Some(Value::Boolean(true))) {
            return Ok(None);
        }
        Ok(Some(reply.collect()))
    }

    fn respawn<'lua>(
        &self,
        lua: &'lua Lua,
        env: &Table<'lua>,
        store: bool,
    ) -> BridgeResult<Thread<'lua>> {
        let prelude = Prelude::load(lua)?;
        let token: Table = env.raw_get("token")?;
        let shim: Function = env.raw_get("shim")?;
        let thread = spawn(lua, &prelude.dispatcher, &token, &shim)?;
        if store {
            env.raw_set("thread", thread.clone())?;
            tracing::debug!(target: "dub::callback", id = ?self.id.get(), "callback coroutine replaced");
        }
        Ok(thread)
    }

    fn env<'lua>(&self, lua: &'lua Lua) -> BridgeResult<Option<Table<'lua>>> {
        let Some(id) = self.id.get() else {
            return Ok(None);
        };
        Ok(envs(lua)?.raw_get::<_, Option<Table>>(id)?)
    }
}

/// Wrap a callback-capable object and bind its thread in one step.
///
/// Returns the script-side `self`, which is what scripts should see.
pub fn wrap_callable<'lua, T: Callable>(
    lua: &'lua Lua,
    object: std::rc::Rc<T>,
    type_name: &str,
    owns: Owns<'lua>,
    base: Value<'lua>,
) -> BridgeResult<Table<'lua>> {
    let ud = handle::wrap_rc(lua, object.clone(), type_name, owns)?;
    object.callback_thread().bind(lua, &ud, base)
}

// ============================================================================
// Staging stack
// ============================================================================

/// Sequence with an explicit length under `n`, so nil values can be staged.
struct Stack<'lua>(Table<'lua>);

impl<'lua> Stack<'lua> {
    fn of(env: &Table<'lua>) -> mlua::Result<Self> {
        Ok(Stack(env.raw_get("stack")?))
    }

    fn depth(&self) -> mlua::Result<usize> {
        Ok(self.0.raw_get::<_, Option<usize>>("n")?.unwrap_or(0))
    }

    fn push(&self, value: Value<'lua>) -> mlua::Result<()> {
        let n = self.depth()? + 1;
        self.0.raw_set(n, value)?;
        self.0.raw_set("n", n)
    }

    fn pop(&self) -> mlua::Result<Value<'lua>> {
        let n = self.depth()?;
        if n <= BASE_DEPTH {
            return Ok(Value::Nil);
        }
        let value = self.0.raw_get(n)?;
        self.0.raw_set(n, Value::Nil)?;
        self.0.raw_set("n", n - 1)?;
        Ok(value)
    }

    /// Remove the top `count` values, returned in push order.
    fn take(&self, count: usize) -> mlua::Result<Vec<Value<'lua>>> {
        let n = self.depth()?;
        let start = n - count + 1;
        let mut values = Vec::with_capacity(count);
        for index in start..=n {
            values.push(self.0.raw_get(index)?);
            self.0.raw_set(index, Value::Nil)?;
        }
        self.0.raw_set("n", start - 1)?;
        Ok(values)
    }
}

// ============================================================================
// Prelude
// ============================================================================

struct Prelude<'lua> {
    dispatcher: Function<'lua>,
    make_shim: Function<'lua>,
    report: Function<'lua>,
}

impl<'lua> Prelude<'lua> {
    fn load(lua: &'lua Lua) -> mlua::Result<Self> {
        let table = match lua.named_registry_value::<Value>(PRELUDE_KEY)? {
            Value::Table(table) => table,
            _ => {
                let (dispatcher, make_shim): (Function, Function) =
                    lua.load(PRELUDE_SOURCE).set_name("=dub.callback").eval()?;
                let table = lua.create_table()?;
                table.raw_set("dispatcher", dispatcher)?;
                table.raw_set("make_shim", make_shim)?;
                table.raw_set("report", lua.create_function(|lua, err: Value| report(lua, err))?)?;
                lua.set_named_registry_value(PRELUDE_KEY, table.clone())?;
                table
            }
        };
        Ok(Prelude {
            dispatcher: table.raw_get("dispatcher")?,
            make_shim: table.raw_get("make_shim")?,
            report: table.raw_get("report")?,
        })
    }
}

/// Fallback error sink used when the object has no `error` method.
fn report<'lua>(lua: &'lua Lua, err: Value<'lua>) -> mlua::Result<()> {
    let message = describe_error(lua, &err);
    let channel = TypeRegistry::of(lua).options().error_channel.clone();
    match channel {
        ErrorChannel::Print => match lua.globals().raw_get::<_, Value>("print")? {
            Value::Function(print) => print.call::<_, ()>(message)?,
            _ => eprintln!("{}", message),
        },
        ErrorChannel::Log => {
            tracing::warn!(target: "dub::callback", error = %message, "callback raised");
        }
        ErrorChannel::Custom(sink) => sink(&message),
    }
    Ok(())
}

fn describe_error(lua: &Lua, err: &Value) -> String {
    match err {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Error(e) => e.to_string(),
        other => lua
            .globals()
            .raw_get::<_, Function>("tostring")
            .and_then(|tostring| tostring.call::<_, String>(other.clone()))
            .unwrap_or_else(|_| other.type_name().to_string()),
    }
}

fn spawn<'lua>(
    lua: &'lua Lua,
    dispatcher: &Function<'lua>,
    token: &Table<'lua>,
    shim: &Function<'lua>,
) -> mlua::Result<Thread<'lua>> {
    let thread = lua.create_thread(dispatcher.clone())?;
    thread.resume::<_, ()>((token.clone(), shim.clone()))?;
    Ok(thread)
}

fn envs(lua: &Lua) -> mlua::Result<Table<'_>> {
    if let Value::Table(envs) = lua.named_registry_value::<Value>(ENVS_KEY)? {
        return Ok(envs);
    }
    let envs = lua.create_table()?;
    let mode = lua.create_table()?;
    mode.raw_set("__mode", "v")?;
    envs.set_metatable(Some(mode));
    lua.set_named_registry_value(ENVS_KEY, envs.clone())?;
    Ok(envs)
}
