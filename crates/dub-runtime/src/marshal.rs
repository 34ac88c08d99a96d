//! Argument/result marshaling helpers
//!
//! Stateless conversions used by generated trampolines. Failures are
//! `TypeMismatch` with the expected script type name.

use mlua::{Lua, MultiValue, Table, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::registry;

/// Argument at position `index` (0-based), or nil when absent.
pub fn arg<'lua>(args: &MultiValue<'lua>, index: usize) -> Value<'lua> {
    args.get(index).cloned().unwrap_or(Value::Nil)
}

/// Numeric coercion. Numeric strings are accepted; `0` is a number like any other.
pub fn check_number(lua: &Lua, value: &Value) -> BridgeResult<f64> {
    lua.coerce_number(value.clone())?
        .ok_or_else(|| BridgeError::type_mismatch("number", value.type_name()))
}

/// Integer coercion. Floats without an exact integer representation fail.
pub fn check_integer(lua: &Lua, value: &Value) -> BridgeResult<i64> {
    lua.coerce_integer(value.clone())?
        .ok_or_else(|| BridgeError::type_mismatch("integer", value.type_name()))
}

/// Borrowed string view, valid for as long as `value` is.
pub fn check_str<'a>(value: &'a Value) -> BridgeResult<&'a str> {
    match value {
        Value::String(s) => Ok(s.to_str()?),
        other => Err(BridgeError::type_mismatch("string", other.type_name())),
    }
}

/// String coercion (numbers are converted the way the runtime prints them).
pub fn check_string<'lua>(lua: &'lua Lua, value: &Value<'lua>) -> BridgeResult<mlua::String<'lua>> {
    lua.coerce_string(value.clone())?
        .ok_or_else(|| BridgeError::type_mismatch("string", value.type_name()))
}

/// Script truthiness: only `nil` and `false` are false.
pub fn check_boolean(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

/// Variable-length array from a sequence.
///
/// Returns `None` for an empty sequence. Elements `1..=#t` go through `convert`.
pub fn check_array<'lua, T>(
    value: &Value<'lua>,
    mut convert: impl FnMut(&Value<'lua>) -> BridgeResult<T>,
) -> BridgeResult<Option<Vec<T>>> {
    let table = sequence(value)?;
    let len = table.raw_len();
    if len == 0 {
        return Ok(None);
    }
    let mut items = Vec::with_capacity(len);
    for index in 1..=len {
        let element: Value = table.raw_get(index)?;
        items.push(convert(&element)?);
    }
    Ok(Some(items))
}

/// Fixed-length array from a sequence; missing elements reach `convert` as nil.
pub fn check_fixed_array<'lua, T, const N: usize>(
    value: &Value<'lua>,
    mut convert: impl FnMut(&Value<'lua>) -> BridgeResult<T>,
) -> BridgeResult<[T; N]> {
    let table = sequence(value)?;
    let mut items = Vec::with_capacity(N);
    for index in 1..=N {
        let element: Value = table.raw_get(index)?;
        items.push(convert(&element)?);
    }
    items
        .try_into()
        .map_err(|_| BridgeError::type_mismatch(format!("array of {}", N), "table"))
}

fn sequence<'lua>(value: &Value<'lua>) -> BridgeResult<Table<'lua>> {
    match value {
        Value::Table(table) => Ok(table.clone()),
        other => Err(BridgeError::type_mismatch("table", other.type_name())),
    }
}

/// Install a flat name → number table. Integral values are stored as integers.
pub fn register_constants<S: AsRef<str>>(table: &Table, constants: &[(S, f64)]) -> BridgeResult<()> {
    for (name, value) in constants {
        let name = name.as_ref();
        if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            table.raw_set(name, *value as i64)?;
        } else {
            table.raw_set(name, *value)?;
        }
    }
    Ok(())
}

/// Install constants into a (possibly dotted) namespace table.
pub fn register_constants_in<S: AsRef<str>>(
    lua: &Lua,
    namespace: &str,
    constants: &[(S, f64)],
) -> BridgeResult<()> {
    let table = registry::namespace_table(lua, namespace)?;
    register_constants(&table, constants)?;
    tracing::debug!(target: "dub::marshal", namespace, count = constants.len(), "registered constants");
    Ok(())
}
