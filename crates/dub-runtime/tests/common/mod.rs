//! Shared fixtures for integration tests
//!
//! Three small native class families, bound the way generated code binds them:
//! - `inherit`: GrandParent <- Parent <- Child, each embedding its parent
//! - `memory`: Pen (deletable natively through a HandleLink) and Owner
//! - `thread`: Caller, which calls back into its script-side `self`

#![allow(dead_code)]

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use dub_runtime::marshal::{self, arg};
use dub_runtime::registry;
use dub_runtime::{
    handle, resolve, wrap_callable, BridgeOptions, Callable, CallbackThread, ClassBinding,
    HandleLink, NativeObject, NativePtr, Owns,
};
use mlua::{IntoLuaMulti, Lua, MultiValue, Value};

// ===== inherit =====

pub struct GrandParent {
    pub name: String,
}

pub struct Parent {
    pub grand: GrandParent,
    pub married: bool,
}

pub struct Child {
    pub parent: Parent,
    pub pos: (f64, f64),
}

impl NativeObject for GrandParent {}

impl NativeObject for Parent {
    fn upcast(&self, target: TypeId) -> Option<&dyn Any> {
        (target == TypeId::of::<GrandParent>()).then_some(&self.grand as &dyn Any)
    }
}

impl NativeObject for Child {
    fn upcast(&self, target: TypeId) -> Option<&dyn Any> {
        if target == TypeId::of::<Parent>() {
            return Some(&self.parent as &dyn Any);
        }
        self.parent.upcast(target)
    }
}

fn child_new<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let name = marshal::check_str(&arg(&args, 0))?.to_string();
    let x = marshal::check_number(lua, &arg(&args, 1))?;
    let y = marshal::check_number(lua, &arg(&args, 2))?;
    let child = Child {
        parent: Parent {
            grand: GrandParent { name },
            married: false,
        },
        pos: (x, y),
    };
    handle::wrap(lua, NativePtr::new(child), "inherit.Child", Owns::Host)?.into_lua_multi(lua)
}

fn child_x<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let ptr = resolve::check_object(lua, &arg(&args, 0), "inherit.Child")?;
    let child = ptr.get::<Child>().ok_or_else(|| mlua::Error::runtime("not a Child"))?;
    child.pos.0.into_lua_multi(lua)
}

fn parent_married<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let ptr = resolve::check_object(lua, &arg(&args, 0), "inherit.Parent")?;
    let parent = ptr.get::<Parent>().ok_or_else(|| mlua::Error::runtime("not a Parent"))?;
    parent.married.into_lua_multi(lua)
}

fn grand_name<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let ptr = resolve::check_object(lua, &arg(&args, 0), "inherit.GrandParent")?;
    let grand = ptr
        .get::<GrandParent>()
        .ok_or_else(|| mlua::Error::runtime("not a GrandParent"))?;
    grand.name.as_str().into_lua_multi(lua)
}

pub fn register_inherit(lua: &Lua) {
    registry::register_class(
        lua,
        &ClassBinding::new("inherit", "GrandParent").method("name", grand_name),
    )
    .unwrap();
    registry::register_class(
        lua,
        &ClassBinding::new("inherit", "Parent")
            .ancestor("inherit.GrandParent")
            .method("married", parent_married),
    )
    .unwrap();
    registry::register_class(
        lua,
        &ClassBinding::new("inherit", "Child")
            .ancestor("inherit.Parent")
            .method("new", child_new)
            .method("x", child_x),
    )
    .unwrap();
}

// ===== memory =====

thread_local! {
    static CUSTOM_RELEASES: Cell<usize> = const { Cell::new(0) };
}

/// Times the Pen destructor hook ran on this thread
pub fn custom_releases() -> usize {
    CUSTOM_RELEASES.with(Cell::get)
}

pub struct Pen {
    pub link: HandleLink,
    pub name: String,
    pub size: Cell<f64>,
    pub drops: Rc<Cell<usize>>,
}

impl Pen {
    pub fn new(name: &str, drops: Rc<Cell<usize>>) -> Self {
        Self {
            link: HandleLink::new(),
            name: name.to_string(),
            size: Cell::new(1.0),
            drops,
        }
    }
}

impl NativeObject for Pen {
    fn handle_link(&self) -> Option<&HandleLink> {
        Some(&self.link)
    }
}

impl Drop for Pen {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

/// Holds a pen natively and can delete it behind the script's back.
pub struct Owner {
    pub pen: RefCell<Option<Rc<Pen>>>,
}

impl NativeObject for Owner {}

impl Owner {
    pub fn destroy_pen(&self) {
        if let Some(pen) = self.pen.borrow_mut().take() {
            pen.link.invalidate();
        }
    }
}

fn pen_release(ptr: NativePtr) {
    CUSTOM_RELEASES.with(|count| count.set(count.get() + 1));
    drop(ptr);
}

fn pen_new<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let name = marshal::check_str(&arg(&args, 0))?.to_string();
    let drops = Rc::new(Cell::new(0));
    handle::wrap(lua, NativePtr::new(Pen::new(&name, drops)), "memory.Pen", Owns::Host)?
        .into_lua_multi(lua)
}

fn pen_name<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let resolved = resolve::resolve_as(lua, &arg(&args, 0), "memory.Pen", false)?;
    resolved.get::<Pen>()?.name.as_str().into_lua_multi(lua)
}

fn pen_size_get<'lua>(_lua: &'lua Lua, ptr: &NativePtr) -> mlua::Result<Value<'lua>> {
    let pen = ptr.get::<Pen>().ok_or_else(|| mlua::Error::runtime("not a Pen"))?;
    Ok(Value::Number(pen.size.get()))
}

fn pen_size_set<'lua>(lua: &'lua Lua, ptr: &NativePtr, value: Value<'lua>) -> mlua::Result<()> {
    let pen = ptr.get::<Pen>().ok_or_else(|| mlua::Error::runtime("not a Pen"))?;
    pen.size.set(marshal::check_number(lua, &value)?);
    Ok(())
}

fn pen_name_get<'lua>(lua: &'lua Lua, ptr: &NativePtr) -> mlua::Result<Value<'lua>> {
    let pen = ptr.get::<Pen>().ok_or_else(|| mlua::Error::runtime("not a Pen"))?;
    Ok(Value::String(lua.create_string(&pen.name)?))
}

fn owner_new<'lua>(lua: &'lua Lua, _args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let owner = Owner {
        pen: RefCell::new(None),
    };
    handle::wrap(lua, NativePtr::new(owner), "memory.Owner", Owns::Host)?.into_lua_multi(lua)
}

fn owner_own<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let owner = resolve::resolve_as(lua, &arg(&args, 0), "memory.Owner", false)?;
    let pen = resolve::resolve_as(lua, &arg(&args, 1), "memory.Pen", false)?;
    *owner.get::<Owner>()?.pen.borrow_mut() = Some(pen.rc::<Pen>()?);
    ().into_lua_multi(lua)
}

fn owner_destroy_pen<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let owner = resolve::resolve_as(lua, &arg(&args, 0), "memory.Owner", false)?;
    owner.get::<Owner>()?.destroy_pen();
    ().into_lua_multi(lua)
}

pub fn register_memory(lua: &Lua) {
    registry::register_class(
        lua,
        &ClassBinding::new("memory", "Pen")
            .method("new", pen_new)
            .method("name", pen_name)
            .destructor(pen_release)
            .attribute("size", pen_size_get, Some(pen_size_set))
            .attribute("label", pen_name_get, None),
    )
    .unwrap();
    registry::register_class(
        lua,
        &ClassBinding::new("memory", "Owner")
            .method("new", owner_new)
            .method("own", owner_own)
            .method("destroy_pen", owner_destroy_pen),
    )
    .unwrap();
}

// ===== thread =====

pub struct Caller {
    pub thread: CallbackThread,
    pub drops: Option<Rc<Cell<usize>>>,
}

impl NativeObject for Caller {}

impl Callable for Caller {
    fn callback_thread(&self) -> &CallbackThread {
        &self.thread
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.set(drops.get() + 1);
        }
    }
}

impl Caller {
    pub fn new() -> Self {
        Self {
            thread: CallbackThread::new(),
            drops: None,
        }
    }

    /// Invoke `self:callback(msg)` if the script defined it.
    pub fn call(&self, lua: &Lua, msg: &str) -> bool {
        if !self.thread.push_callback(lua, "callback").unwrap_or(false) {
            return false;
        }
        if !self.thread.push(lua, msg).unwrap_or(false) {
            return false;
        }
        self.thread.call(lua, 1, 0)
    }

    /// Read `self[key]` as a number, or 0.
    pub fn value(&self, lua: &Lua, key: &str) -> f64 {
        if !self.thread.push_value(lua, key).unwrap_or(false) {
            return 0.0;
        }
        let value = self.thread.pop(lua).unwrap_or(Value::Nil);
        marshal::check_number(lua, &value).unwrap_or(0.0)
    }
}

fn caller_new<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let caller = Rc::new(Caller::new());
    wrap_callable(lua, caller, "thread.Caller", Owns::Host, arg(&args, 0))?.into_lua_multi(lua)
}

fn caller_call<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let resolved = resolve::resolve_as(lua, &arg(&args, 0), "thread.Caller", false)?;
    let msg = marshal::check_string(lua, &arg(&args, 1))?;
    let caller = resolved.rc::<Caller>()?;
    caller.call(lua, msg.to_str()?).into_lua_multi(lua)
}

fn caller_value<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let resolved = resolve::resolve_as(lua, &arg(&args, 0), "thread.Caller", false)?;
    let key = marshal::check_str(&arg(&args, 1))?.to_string();
    let caller = resolved.rc::<Caller>()?;
    caller.value(lua, &key).into_lua_multi(lua)
}

pub fn register_thread(lua: &Lua) {
    registry::register_class(
        lua,
        &ClassBinding::new("thread", "Caller")
            .method("new", caller_new)
            .method("call", caller_call)
            .method("value", caller_value),
    )
    .unwrap();
}

/// Fresh state with every fixture family registered.
pub fn fixture_state(options: BridgeOptions) -> Lua {
    let lua = Lua::new();
    dub_runtime::install(&lua, options);
    register_inherit(&lua);
    register_memory(&lua);
    register_thread(&lua);
    lua
}
