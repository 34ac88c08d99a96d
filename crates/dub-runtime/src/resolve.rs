//! Super-chain resolver
//!
//! Script-side subclasses are composite tables whose reserved `super` field
//! links to the next handle up the chain. `resolve_as` turns any such value
//! into a native pointer of the requested type:
//!
//! 1. direct handle: exact type or declared ancestor, else one cast-hook try
//! 2. composite: follow `super` links to a handle, then step 1, reporting
//!    mismatches as found through the super-chain. The walk takes at most
//!    `TypeRegistry::super_limit` hops, one per declared ancestry level.
//!
//! Liveness is checked only after a type match, so a dead handle of the wrong
//! type still reports `TypeMismatch`.

use std::any::Any;
use std::rc::Rc;

use mlua::{AnyUserData, Lua, Table, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::handle::{Handle, NativePtr};
use crate::registry::{Metatype, TypeRegistry};

/// Reserved field linking a composite object to its handle
pub const SUPER_KEY: &str = "super";

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Native pointer for the requested type
    pub ptr: NativePtr,
    /// Type name the pointer was resolved as
    pub type_name: String,
    /// Matched metatype, kept only when requested
    pub metatype: Option<Rc<Metatype>>,
}

impl Resolved {
    /// Borrow the native object as `T`.
    pub fn get<T: Any>(&self) -> BridgeResult<&T> {
        self.ptr
            .get::<T>()
            .ok_or_else(|| BridgeError::type_mismatch(std::any::type_name::<T>(), &self.type_name))
    }

    /// Recover the concrete `Rc<T>`.
    pub fn rc<T: crate::handle::NativeObject>(&self) -> BridgeResult<Rc<T>> {
        self.ptr
            .downcast_rc::<T>()
            .ok_or_else(|| BridgeError::type_mismatch(std::any::type_name::<T>(), &self.type_name))
    }
}

/// Resolve `value` as a native object of `type_name`.
///
/// `keep_metatype` only controls whether the matched metatype is returned for
/// reuse by the caller.
pub fn resolve_as<'lua>(
    lua: &'lua Lua,
    value: &Value<'lua>,
    type_name: &str,
    keep_metatype: bool,
) -> BridgeResult<Resolved> {
    match value {
        Value::UserData(ud) => resolve_handle(lua, ud, type_name, false, keep_metatype),
        Value::Table(table) => resolve_composite(lua, table, type_name, keep_metatype),
        other => Err(BridgeError::type_mismatch(type_name, other.type_name())),
    }
}

/// Shorthand for `resolve_as` without keeping the metatype.
pub fn check_object<'lua>(lua: &'lua Lua, value: &Value<'lua>, type_name: &str) -> BridgeResult<NativePtr> {
    resolve_as(lua, value, type_name, false).map(|resolved| resolved.ptr)
}

/// Non-failing type test. Dead handles remain type-identifiable.
pub fn is_object(lua: &Lua, value: &Value, type_name: &str) -> bool {
    let Some(ud) = crate::handle::handle_of(value) else {
        return false;
    };
    let Ok(handle) = ud.borrow::<Handle>() else {
        return false;
    };
    TypeRegistry::of(lua).is_a(handle.metatype(), type_name)
}

fn resolve_composite<'lua>(
    lua: &'lua Lua,
    table: &Table<'lua>,
    type_name: &str,
    keep_metatype: bool,
) -> BridgeResult<Resolved> {
    let mut current = table.clone();
    let limit = TypeRegistry::of(lua).super_limit();
    for depth in 0..limit {
        current = match current.raw_get::<_, Value>(SUPER_KEY)? {
            Value::UserData(ud) => return resolve_handle(lua, &ud, type_name, true, keep_metatype),
            Value::Table(next) => next,
            Value::Nil if depth == 0 => return Err(BridgeError::type_mismatch(type_name, "table")),
            other => return Err(BridgeError::super_mismatch(type_name, other.type_name())),
        };
    }
    Err(BridgeError::super_mismatch(type_name, "table"))
}

pub(crate) fn resolve_handle(
    lua: &Lua,
    ud: &AnyUserData,
    type_name: &str,
    via_super: bool,
    keep_metatype: bool,
) -> BridgeResult<Resolved> {
    let mismatch = |actual: &str| {
        if via_super {
            BridgeError::super_mismatch(type_name, actual)
        } else {
            BridgeError::type_mismatch(type_name, actual)
        }
    };

    let Ok(handle) = ud.borrow::<Handle>() else {
        return Err(mismatch("userdata"));
    };
    let metatype = handle.metatype();

    if TypeRegistry::of(lua).is_a(metatype, type_name) {
        let ptr = handle
            .ptr()
            .ok_or_else(|| BridgeError::use_after_free(metatype.type_name()))?;
        return Ok(Resolved {
            ptr,
            type_name: type_name.to_string(),
            metatype: keep_metatype.then(|| metatype.clone()),
        });
    }

    // A dead handle cannot be cast; it falls through to the mismatch below.
    if let (Some(cast), Some(ptr)) = (metatype.cast(), handle.ptr()) {
        if let Some(cast_ptr) = cast(&ptr, type_name) {
            return Ok(Resolved {
                ptr: cast_ptr,
                type_name: type_name.to_string(),
                metatype: if keep_metatype {
                    TypeRegistry::of(lua).get(type_name)
                } else {
                    None
                },
            });
        }
    }

    Err(mismatch(metatype.type_name()))
}

/// Turn `base` (a table or nil) into a composite object linked to `ud`.
///
/// Sets `base.super = ud` and gives `base` the handle's class metatable.
pub fn make_composite<'lua>(
    lua: &'lua Lua,
    base: Value<'lua>,
    ud: &AnyUserData<'lua>,
) -> BridgeResult<Table<'lua>> {
    let methods = {
        let handle = ud
            .borrow::<Handle>()
            .map_err(|_| BridgeError::type_mismatch("handle", "userdata"))?;
        handle.metatype().methods(lua)?
    };
    let this = match base {
        Value::Table(table) => table,
        Value::Nil => lua.create_table()?,
        other => return Err(BridgeError::type_mismatch("table", other.type_name())),
    };
    this.raw_set(SUPER_KEY, ud.clone())?;
    this.set_metatable(Some(methods));
    Ok(this)
}
