//! Handle protocol
//!
//! A handle is the script-visible cell wrapping a native object. Every handle
//! owns a shared ownership slot:
//!
//! ```text
//! Owned(ptr)     the collector owns the object and runs its destructor
//! Borrowed(weak) native code owns the object; the handle only observes it
//! Dead           the pointer was invalidated from either side
//! ```
//!
//! The slot moves to `Dead` exactly once. The collector path (dropping the
//! userdata) and the native path (`HandleLink::invalidate`, or the native
//! object going away) both funnel through a `mem::replace` on the same slot,
//! so whichever runs second finds `Dead` and does nothing.

mod link;

pub use link::HandleLink;

use std::any::{Any, TypeId};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use mlua::{AnyUserData, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::registry::{self, Metatype};

/// Side-table key protecting the owner of a borrowed view
pub const OWNER_KEY: &str = "_";
/// Side-table key holding a callback environment
pub(crate) const ENV_KEY: &str = "env";
/// Side-table key holding fields stored on non-strict handles
const FIELDS_KEY: &str = "fields";

// ============================================================================
// Native objects
// ============================================================================

/// Implemented by every native type surfaced to scripts.
pub trait NativeObject: Any {
    /// Borrow an embedded ancestor part by type id.
    ///
    /// A class whose native layout contains its parent returns that part here,
    /// so a pointer resolved as the ancestor type still addresses this object.
    fn upcast(&self, target: TypeId) -> Option<&dyn Any> {
        let _ = target;
        None
    }

    /// Link used to invalidate handles when the object is deleted natively.
    fn handle_link(&self) -> Option<&HandleLink> {
        None
    }
}

/// Strong, type-erased pointer to a native object.
#[derive(Clone)]
pub struct NativePtr(Rc<dyn NativeObject>);

impl NativePtr {
    /// Move a native object onto the shared heap
    pub fn new<T: NativeObject>(value: T) -> Self {
        NativePtr(Rc::new(value))
    }

    /// Share an object native code already holds
    pub fn from_rc<T: NativeObject>(rc: Rc<T>) -> Self {
        NativePtr(rc)
    }

    /// Borrow the object as `T`, either exactly or through `upcast`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        let object: &dyn NativeObject = &*self.0;
        let any: &dyn Any = object;
        if let Some(exact) = any.downcast_ref::<T>() {
            return Some(exact);
        }
        object.upcast(TypeId::of::<T>())?.downcast_ref::<T>()
    }

    /// Recover the concrete `Rc<T>`.
    pub fn downcast_rc<T: NativeObject>(&self) -> Option<Rc<T>> {
        let any: Rc<dyn Any> = self.0.clone();
        any.downcast::<T>().ok()
    }

    /// True when both pointers address the same native object
    pub fn ptr_eq(&self, other: &NativePtr) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }

    /// Address of the native object, for display and identity checks
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Number of strong references
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Create a non-owning pointer
    pub fn downgrade(&self) -> WeakPtr {
        WeakPtr(Rc::downgrade(&self.0))
    }

    /// The object's handle link, if it has one
    pub fn handle_link(&self) -> Option<&HandleLink> {
        self.0.handle_link()
    }
}

impl fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:#x})", self.addr())
    }
}

/// Non-owning pointer to a native object.
#[derive(Clone)]
pub struct WeakPtr(Weak<dyn NativeObject>);

impl WeakPtr {
    /// Upgrade if the object is still alive
    pub fn upgrade(&self) -> Option<NativePtr> {
        self.0.upgrade().map(NativePtr)
    }

    /// True once the native object is gone
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dead() {
            write!(f, "WeakPtr(dead)")
        } else {
            write!(f, "WeakPtr(live)")
        }
    }
}

// ============================================================================
// Ownership
// ============================================================================

/// State of a handle's native pointer.
#[derive(Debug, Default)]
pub enum Ownership {
    /// The collector owns the object
    Owned(NativePtr),
    /// Native code owns the object
    Borrowed(WeakPtr),
    /// Invalidated
    #[default]
    Dead,
}

impl Ownership {
    /// Live pointer, if any
    pub fn ptr(&self) -> Option<NativePtr> {
        match self {
            Ownership::Owned(ptr) => Some(ptr.clone()),
            Ownership::Borrowed(weak) => weak.upgrade(),
            Ownership::Dead => None,
        }
    }

    /// True when no live object is reachable
    pub fn is_dead(&self) -> bool {
        match self {
            Ownership::Owned(_) => false,
            Ownership::Borrowed(weak) => weak.is_dead(),
            Ownership::Dead => true,
        }
    }
}

/// Shared slot between a handle and the object's `HandleLink`.
pub(crate) type Slot = Rc<RefCell<Ownership>>;

/// Who is responsible for freeing a wrapped object.
pub enum Owns<'lua> {
    /// The script collector frees the object when the handle is collected
    Host,
    /// Native code keeps ownership
    Native,
    /// Non-owning view of an object owned by another script value, which is
    /// kept reachable for as long as the view exists
    Borrowed(Value<'lua>),
}

// ============================================================================
// Handle
// ============================================================================

/// Userdata payload of every wrapped native object.
pub struct Handle {
    slot: Slot,
    metatype: Rc<Metatype>,
}

impl Handle {
    /// Metatype attached at wrap time
    pub fn metatype(&self) -> &Rc<Metatype> {
        &self.metatype
    }

    /// Registered type name
    pub fn type_name(&self) -> &str {
        self.metatype.type_name()
    }

    /// Live native pointer, if any
    pub fn ptr(&self) -> Option<NativePtr> {
        self.slot.borrow().ptr()
    }

    /// True when the native pointer has been invalidated
    pub fn is_deleted(&self) -> bool {
        self.slot.borrow().is_dead()
    }

    /// True when the collector owns the object
    pub fn is_owned(&self) -> bool {
        matches!(*self.slot.borrow(), Ownership::Owned(_))
    }

    /// Drop the pointer without running the custom destructor.
    pub fn invalidate(&self) {
        let previous = mem::take(&mut *self.slot.borrow_mut());
        drop(previous);
    }

    pub(crate) fn describe(&self) -> String {
        match self.ptr() {
            Some(ptr) => format!("<{}: {:#x}>", self.type_name(), ptr.addr()),
            None => format!("<{}: NULL>", self.type_name()),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let previous = match self.slot.try_borrow_mut() {
            Ok(mut state) => mem::take(&mut *state),
            Err(_) => return,
        };
        if let Ownership::Owned(ptr) = previous {
            match self.metatype.destructor() {
                Some(destructor) => destructor(ptr),
                None => drop(ptr),
            }
        }
    }
}

impl UserData for Handle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_function(
            MetaMethod::Index,
            |lua, (ud, key): (AnyUserData, Value)| handle_index(lua, &ud, key),
        );
        methods.add_meta_function(
            MetaMethod::NewIndex,
            |lua, (ud, key, value): (AnyUserData, Value, Value)| {
                handle_newindex(lua, &ud, key, value)
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.describe()));
        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Value, Value)| {
            Ok(same_object(&a, &b))
        });
    }
}

/// Equality never raises: anything that is not a live handle compares unequal.
fn same_object(a: &Value, b: &Value) -> bool {
    let (Value::UserData(a), Value::UserData(b)) = (a, b) else {
        return false;
    };
    let (Ok(a), Ok(b)) = (a.borrow::<Handle>(), b.borrow::<Handle>()) else {
        return false;
    };
    match (a.ptr(), b.ptr()) {
        (Some(a), Some(b)) => a.ptr_eq(&b),
        _ => false,
    }
}

fn handle_index<'lua>(
    lua: &'lua Lua,
    ud: &AnyUserData<'lua>,
    key: Value<'lua>,
) -> mlua::Result<Value<'lua>> {
    let (metatype, ptr) = {
        let handle = ud.borrow::<Handle>()?;
        (handle.metatype.clone(), handle.ptr())
    };

    if let Some(attr) = key.as_str().and_then(|name| metatype.attribute(name)) {
        let ptr = ptr.ok_or_else(|| BridgeError::use_after_free(metatype.type_name()))?;
        return (attr.get)(lua, &ptr);
    }

    let method: Value = metatype.methods(lua)?.raw_get(key.clone())?;
    if !method.is_nil() {
        return Ok(method);
    }

    match stored_fields(ud)? {
        Some(fields) => fields.raw_get(key),
        None => Ok(Value::Nil),
    }
}

fn handle_newindex<'lua>(
    lua: &'lua Lua,
    ud: &AnyUserData<'lua>,
    key: Value<'lua>,
    value: Value<'lua>,
) -> mlua::Result<()> {
    let (metatype, ptr) = {
        let handle = ud.borrow::<Handle>()?;
        (handle.metatype.clone(), handle.ptr())
    };

    let name = key.as_str().map(str::to_owned);
    if let Some(attr) = name.as_deref().and_then(|name| metatype.attribute(name)) {
        let Some(setter) = attr.set else {
            return Err(BridgeError::InvalidKey(describe_key(&key)).into());
        };
        let ptr = ptr.ok_or_else(|| BridgeError::use_after_free(metatype.type_name()))?;
        return setter(lua, &ptr, value);
    }

    if metatype.strict_keys() {
        return Err(BridgeError::InvalidKey(describe_key(&key)).into());
    }

    let side = side_table(lua, ud)?;
    let fields = match side.raw_get::<_, Value>(FIELDS_KEY)? {
        Value::Table(fields) => fields,
        _ => {
            let fields = lua.create_table()?;
            side.raw_set(FIELDS_KEY, fields.clone())?;
            fields
        }
    };
    fields.raw_set(key, value)
}

fn stored_fields<'lua>(ud: &AnyUserData<'lua>) -> mlua::Result<Option<Table<'lua>>> {
    match ud.user_value::<Value>()? {
        Value::Table(side) => match side.raw_get::<_, Value>(FIELDS_KEY)? {
            Value::Table(fields) => Ok(Some(fields)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn describe_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

/// Private per-handle table, created on first use.
pub(crate) fn side_table<'lua>(lua: &'lua Lua, ud: &AnyUserData<'lua>) -> mlua::Result<Table<'lua>> {
    match ud.user_value::<Value>()? {
        Value::Table(side) => Ok(side),
        _ => {
            let side = lua.create_table()?;
            ud.set_user_value(side.clone())?;
            Ok(side)
        }
    }
}

// ============================================================================
// Protocol operations
// ============================================================================

/// Wrap a native object in a new handle.
///
/// Unregistered type names get an opaque placeholder metatype so the value can
/// still be held and passed around.
pub fn wrap<'lua>(
    lua: &'lua Lua,
    ptr: NativePtr,
    type_name: &str,
    owns: Owns<'lua>,
) -> BridgeResult<AnyUserData<'lua>> {
    let metatype = registry::metatype_for(lua, type_name)?;
    let (state, owner) = match owns {
        Owns::Host => (Ownership::Owned(ptr.clone()), None),
        Owns::Native => (Ownership::Borrowed(ptr.downgrade()), None),
        Owns::Borrowed(owner) => (Ownership::Borrowed(ptr.downgrade()), Some(owner)),
    };
    let slot: Slot = Rc::new(RefCell::new(state));
    if let Some(link) = ptr.handle_link() {
        link.attach(&slot);
    }

    let ud = lua.create_userdata(Handle { slot, metatype })?;
    if let Some(owner) = owner {
        side_table(lua, &ud)?.raw_set(OWNER_KEY, owner)?;
    }
    Ok(ud)
}

/// Wrap an object native code already holds in an `Rc`.
pub fn wrap_rc<'lua, T: NativeObject>(
    lua: &'lua Lua,
    rc: Rc<T>,
    type_name: &str,
    owns: Owns<'lua>,
) -> BridgeResult<AnyUserData<'lua>> {
    wrap(lua, NativePtr::from_rc(rc), type_name, owns)
}

/// Null out the handle's pointer. Invalidating a dead handle is a no-op.
pub fn invalidate(ud: &AnyUserData) -> BridgeResult<()> {
    handle_ref(ud)?.invalidate();
    Ok(())
}

/// Type check, then liveness check, then return the pointer.
pub fn unwrap(lua: &Lua, ud: &AnyUserData, type_name: &str) -> BridgeResult<NativePtr> {
    crate::resolve::resolve_handle(lua, ud, type_name, false, false).map(|resolved| resolved.ptr)
}

/// Liveness query that never raises `UseAfterFree`.
pub fn is_deleted(ud: &AnyUserData) -> BridgeResult<bool> {
    Ok(handle_ref(ud)?.is_deleted())
}

/// Handle carried by a value: the value itself or its super-link.
pub fn handle_of<'lua>(value: &Value<'lua>) -> Option<AnyUserData<'lua>> {
    match value {
        Value::UserData(ud) if ud.is::<Handle>() => Some(ud.clone()),
        Value::Table(table) => match table.raw_get::<_, Value>(crate::resolve::SUPER_KEY) {
            Ok(Value::UserData(ud)) if ud.is::<Handle>() => Some(ud),
            _ => None,
        },
        _ => None,
    }
}

fn handle_ref<'a>(ud: &'a AnyUserData) -> BridgeResult<Ref<'a, Handle>> {
    ud.borrow::<Handle>()
        .map_err(|_| BridgeError::type_mismatch("handle", "userdata"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Tracked {
        drops: Rc<Cell<usize>>,
    }

    impl NativeObject for Tracked {}

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    struct Part {
        value: i32,
    }

    struct Whole {
        part: Part,
    }

    impl NativeObject for Whole {
        fn upcast(&self, target: TypeId) -> Option<&dyn Any> {
            (target == TypeId::of::<Part>()).then_some(&self.part as &dyn Any)
        }
    }

    fn tracked() -> (NativePtr, Rc<Cell<usize>>) {
        let drops = Rc::new(Cell::new(0));
        (
            NativePtr::new(Tracked {
                drops: drops.clone(),
            }),
            drops,
        )
    }

    #[test]
    fn test_native_ptr_identity() {
        let (a, _) = tracked();
        let b = a.clone();
        let (c, _) = tracked();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn test_native_ptr_upcast() {
        let whole = NativePtr::new(Whole {
            part: Part { value: 7 },
        });
        assert!(whole.get::<Whole>().is_some());
        assert_eq!(whole.get::<Part>().map(|p| p.value), Some(7));
        assert!(whole.get::<Tracked>().is_none());
        assert!(whole.downcast_rc::<Whole>().is_some());
    }

    #[test]
    fn test_weak_ptr_dies_with_object() {
        let (ptr, drops) = tracked();
        let weak = ptr.downgrade();
        assert!(!weak.is_dead());
        drop(ptr);
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let lua = Lua::new();
        let (ptr, drops) = tracked();
        let ud = wrap(&lua, ptr, "test.Tracked", Owns::Host).unwrap();

        assert!(!is_deleted(&ud).unwrap());
        invalidate(&ud).unwrap();
        invalidate(&ud).unwrap();
        assert!(is_deleted(&ud).unwrap());
        assert_eq!(drops.get(), 1);

        let err = unwrap(&lua, &ud, "test.Tracked").unwrap_err();
        assert!(err.is_use_after_free());
    }

    #[test]
    fn test_owned_handle_frees_once() {
        let lua = Lua::new();
        let (ptr, drops) = tracked();
        lua.globals()
            .set("tracked", wrap(&lua, ptr, "test.Tracked", Owns::Host).unwrap())
            .unwrap();
        lua.load("tracked = nil").exec().unwrap();
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_native_handle_observes_object() {
        let lua = Lua::new();
        let (ptr, drops) = tracked();
        let ud = wrap(&lua, ptr.clone(), "test.Tracked", Owns::Native).unwrap();
        assert!(!is_deleted(&ud).unwrap());

        drop(ptr);
        assert_eq!(drops.get(), 1);
        assert!(is_deleted(&ud).unwrap());
        drop(ud);
        lua.gc_collect().unwrap();
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_tostring_and_eq() {
        let lua = Lua::new();
        let (ptr, _drops) = tracked();
        let a = wrap(&lua, ptr.clone(), "test.Tracked", Owns::Native).unwrap();
        let b = wrap(&lua, ptr.clone(), "test.Tracked", Owns::Native).unwrap();
        lua.globals().set("a", a).unwrap();
        lua.globals().set("b", b.clone()).unwrap();

        let same: bool = lua.load("return a == b").eval().unwrap();
        assert!(same);
        let text: String = lua.load("return tostring(a)").eval().unwrap();
        assert_eq!(text, format!("<test.Tracked: {:#x}>", ptr.addr()));

        invalidate(&b).unwrap();
        let text: String = lua.load("return tostring(b)").eval().unwrap();
        assert_eq!(text, "<test.Tracked: NULL>");
    }

    #[test]
    fn test_strict_keys_reject_unknown_fields() {
        let lua = Lua::new();
        let (ptr, _drops) = tracked();
        let ud = wrap(&lua, ptr, "test.Tracked", Owns::Host).unwrap();
        lua.globals().set("p", ud).unwrap();

        let err = lua.load("p.colour = 'red'").exec().unwrap_err();
        assert!(matches!(
            crate::error::find_bridge_error(&err),
            Some(BridgeError::InvalidKey(key)) if key == "colour"
        ));
    }

    struct Foreign;
    impl UserData for Foreign {}

    #[test]
    fn test_eq_with_foreign_userdata() {
        let lua = Lua::new();
        let (ptr, _drops) = tracked();
        let handle = wrap(&lua, ptr, "test.Tracked", Owns::Native).unwrap();
        lua.globals().set("h", handle).unwrap();
        lua.globals().set("f", Foreign).unwrap();

        let (same, reversed, with_self): (bool, bool, bool) =
            lua.load("return h == f, f == h, h == h").eval().unwrap();
        assert!(!same);
        assert!(!reversed);
        assert!(with_self);
    }
}
