//! Type registry and metatype installer
//!
//! One `Metatype` per native class, keyed by its fully qualified type name
//! (`"ns.Class"`, or `"Class"` for classes registered under `_G`). The
//! metatype's method table is the script-visible class object: it is installed
//! at `ns.Class`, used as the metatable of composite objects, and consulted by
//! every handle of that type for method lookup.
//!
//! The registry lives in the `Lua` state's app data, so every state carries
//! its own isolated set of types.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{BridgeError, BridgeResult};
use crate::handle::{self, Handle, NativePtr};
use crate::marshal;
use crate::options::BridgeOptions;
use crate::resolve;

/// Native entry point bound as a class method
pub type Trampoline = for<'lua> fn(&'lua Lua, MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>>;

/// Reinterpret a pointer as another registered type, or decline
pub type CastHook = fn(&NativePtr, &str) -> Option<NativePtr>;

/// Custom release path for collector-owned objects
pub type Destructor = fn(NativePtr);

/// Attribute read accessor
pub type AttrGetter = for<'lua> fn(&'lua Lua, &NativePtr) -> mlua::Result<Value<'lua>>;

/// Attribute write accessor
pub type AttrSetter = for<'lua> fn(&'lua Lua, &NativePtr, Value<'lua>) -> mlua::Result<()>;

/// Keys never copied from an ancestor's method table
const NOT_INHERITED: &[&str] = &["new", "type", "__index", "__newindex", "__call"];

/// Accessor pair for a native attribute.
#[derive(Clone, Copy)]
pub struct Attribute {
    /// Read accessor
    pub get: AttrGetter,
    /// Write accessor; `None` makes the attribute read-only
    pub set: Option<AttrSetter>,
}

// ============================================================================
// Metatype
// ============================================================================

/// Per-class registration record.
pub struct Metatype {
    type_name: String,
    methods: RegistryKey,
    installed: Cell<bool>,
    ancestors: RefCell<Vec<String>>,
    cast: Cell<Option<CastHook>>,
    destructor: Cell<Option<Destructor>>,
    attributes: RefCell<FxHashMap<String, Attribute>>,
    strict_keys: Cell<bool>,
}

impl Metatype {
    fn new(lua: &Lua, type_name: &str, strict_keys: bool) -> mlua::Result<Self> {
        let methods = lua.create_table()?;
        methods.raw_set("type", type_name)?;
        Ok(Self {
            type_name: type_name.to_string(),
            methods: lua.create_registry_value(methods)?,
            installed: Cell::new(false),
            ancestors: RefCell::new(Vec::new()),
            cast: Cell::new(None),
            destructor: Cell::new(None),
            attributes: RefCell::new(FxHashMap::default()),
            strict_keys: Cell::new(strict_keys),
        })
    }

    /// Fully qualified type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The method table (the script-visible class object)
    pub fn methods<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        lua.registry_value(&self.methods)
    }

    /// True for placeholders created by `wrap` that no class registered yet
    pub fn is_opaque(&self) -> bool {
        !self.installed.get()
    }

    /// Exact match or directly declared ancestor.
    ///
    /// Use `TypeRegistry::is_a` for the transitive test.
    pub fn is_a(&self, type_name: &str) -> bool {
        self.type_name == type_name || self.ancestors.borrow().iter().any(|a| a == type_name)
    }

    /// Declared ancestors, nearest first
    pub fn ancestors(&self) -> Vec<String> {
        self.ancestors.borrow().clone()
    }

    /// Cast hook, if any
    pub fn cast(&self) -> Option<CastHook> {
        self.cast.get()
    }

    /// Custom destructor, if any
    pub fn destructor(&self) -> Option<Destructor> {
        self.destructor.get()
    }

    /// Attribute accessors by name
    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.attributes.borrow().get(name).copied()
    }

    /// Returns true if any attribute is bound
    pub fn has_attributes(&self) -> bool {
        !self.attributes.borrow().is_empty()
    }

    /// Reject unknown keys assigned on handles
    pub fn strict_keys(&self) -> bool {
        self.strict_keys.get()
    }

    /// Replace the cast hook
    pub fn set_cast(&self, hook: Option<CastHook>) {
        self.cast.set(hook);
    }

    /// Replace the custom destructor
    pub fn set_destructor(&self, destructor: Option<Destructor>) {
        self.destructor.set(destructor);
    }

    /// Declare an ancestor type name. Duplicates are ignored.
    pub(crate) fn add_ancestor(&self, type_name: &str) {
        let mut ancestors = self.ancestors.borrow_mut();
        if type_name != self.type_name && !ancestors.iter().any(|a| a == type_name) {
            ancestors.push(type_name.to_string());
        }
    }

    /// Bind an attribute
    pub fn set_attribute(&self, name: &str, attribute: Attribute) {
        self.attributes
            .borrow_mut()
            .insert(name.to_string(), attribute);
    }

    /// Override strict key checking for this type
    pub fn set_strict_keys(&self, strict: bool) {
        self.strict_keys.set(strict);
    }
}

impl fmt::Debug for Metatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metatype")
            .field("type_name", &self.type_name)
            .field("opaque", &self.is_opaque())
            .field("ancestors", &*self.ancestors.borrow())
            .field("attributes", &self.attributes.borrow().len())
            .finish()
    }
}

// ============================================================================
// TypeRegistry
// ============================================================================

/// All metatypes known to one `Lua` state.
pub struct TypeRegistry {
    types: RefCell<FxHashMap<String, Rc<Metatype>>>,
    options: BridgeOptions,
    next_thread_id: Cell<u64>,
    super_limit: Cell<Option<usize>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            types: RefCell::new(FxHashMap::default()),
            options,
            next_thread_id: Cell::new(1),
            super_limit: Cell::new(None),
        }
    }

    /// Attach a fresh registry to `lua`, replacing any previous one.
    pub fn install(lua: &Lua, options: BridgeOptions) -> Rc<TypeRegistry> {
        let registry = Rc::new(TypeRegistry::new(options));
        lua.set_app_data(registry.clone());
        registry
    }

    /// Registry attached to `lua`, installed with default options on first use.
    pub fn of(lua: &Lua) -> Rc<TypeRegistry> {
        if let Some(registry) = lua.app_data_ref::<Rc<TypeRegistry>>() {
            return registry.clone();
        }
        Self::install(lua, BridgeOptions::default())
    }

    /// Options the registry was installed with
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Look up a metatype
    pub fn get(&self, type_name: &str) -> Option<Rc<Metatype>> {
        self.types.borrow().get(type_name).cloned()
    }

    /// Check if a type name is known
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.borrow().contains_key(type_name)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of known types
    pub fn len(&self) -> usize {
        self.types.borrow().len()
    }

    /// Check if no type is known
    pub fn is_empty(&self) -> bool {
        self.types.borrow().is_empty()
    }

    /// True when `metatype` is `type_name` or descends from it through
    /// declared ancestors, following each registered ancestor's own list.
    pub fn is_a(&self, metatype: &Metatype, type_name: &str) -> bool {
        if metatype.is_a(type_name) {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut pending = metatype.ancestors();
        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(ancestor) = self.get(&name) else {
                continue;
            };
            if ancestor.is_a(type_name) {
                return true;
            }
            pending.extend(ancestor.ancestors());
        }
        false
    }

    /// Number of `super` hops a composite walk may take: the deepest
    /// registered ancestry plus the class itself.
    pub fn super_limit(&self) -> usize {
        if let Some(limit) = self.super_limit.get() {
            return limit;
        }
        let types: Vec<Rc<Metatype>> = self.types.borrow().values().cloned().collect();
        let deepest = types
            .iter()
            .map(|metatype| self.lineage(metatype))
            .max()
            .unwrap_or(0);
        let limit = deepest + 1;
        self.super_limit.set(Some(limit));
        limit
    }

    /// Count of distinct transitive ancestors
    fn lineage(&self, metatype: &Metatype) -> usize {
        let mut seen = FxHashSet::default();
        let mut pending = metatype.ancestors();
        while let Some(name) = pending.pop() {
            if seen.insert(name.clone()) {
                if let Some(ancestor) = self.get(&name) {
                    pending.extend(ancestor.ancestors());
                }
            }
        }
        seen.len()
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        let id = self.next_thread_id.get();
        self.next_thread_id.set(id + 1);
        id
    }

    fn get_or_create(&self, lua: &Lua, type_name: &str) -> mlua::Result<Rc<Metatype>> {
        if let Some(existing) = self.get(type_name) {
            return Ok(existing);
        }
        let metatype = Rc::new(Metatype::new(lua, type_name, self.options.strict_keys)?);
        self.types
            .borrow_mut()
            .insert(type_name.to_string(), metatype.clone());
        Ok(metatype)
    }
}

/// Metatype for `type_name`, creating an opaque placeholder if needed.
pub fn metatype_for(lua: &Lua, type_name: &str) -> BridgeResult<Rc<Metatype>> {
    Ok(TypeRegistry::of(lua).get_or_create(lua, type_name)?)
}

/// Fully qualified name of `class_name` inside `namespace`.
pub fn qualified_name(namespace: &str, class_name: &str) -> String {
    if is_global(namespace) {
        class_name.to_string()
    } else {
        format!("{}.{}", namespace, class_name)
    }
}

fn is_global(namespace: &str) -> bool {
    namespace.is_empty() || namespace == "_G"
}

fn conflict(path: &str) -> BridgeError {
    tracing::error!(target: "dub::registry", path, "name conflict");
    BridgeError::RegistrationConflict {
        path: path.to_string(),
    }
}

// ============================================================================
// Namespaces
// ============================================================================

/// Walk a dotted namespace without creating anything.
///
/// `Ok(None)` means some segment is still missing; a non-table segment is a
/// conflict.
fn lookup_namespace<'lua>(lua: &'lua Lua, namespace: &str) -> BridgeResult<Option<Table<'lua>>> {
    let mut current = lua.globals();
    if is_global(namespace) {
        return Ok(Some(current));
    }
    let mut path = String::new();
    for part in namespace.split('.') {
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(part);
        current = match current.raw_get::<_, Value>(part)? {
            Value::Table(next) => next,
            Value::Nil => return Ok(None),
            _ => return Err(conflict(&path)),
        };
    }
    Ok(Some(current))
}

/// Table for a dotted namespace, creating missing segments.
///
/// The whole path is validated before the first table is created.
pub(crate) fn namespace_table<'lua>(lua: &'lua Lua, namespace: &str) -> BridgeResult<Table<'lua>> {
    if let Some(existing) = lookup_namespace(lua, namespace)? {
        return Ok(existing);
    }
    let mut current = lua.globals();
    for part in namespace.split('.') {
        current = match current.raw_get::<_, Value>(part)? {
            Value::Table(next) => next,
            _ => {
                let next = lua.create_table()?;
                current.raw_set(part, next.clone())?;
                next
            }
        };
    }
    Ok(current)
}

// ============================================================================
// Installation
// ============================================================================

/// Register `class_name` under `namespace` and install its class object.
///
/// Idempotent: a second call returns the existing metatype unchanged. Fails
/// with `RegistrationConflict`, leaving the registry untouched, when the
/// namespace path or the class slot holds a foreign value.
pub fn register_type(lua: &Lua, namespace: &str, class_name: &str) -> BridgeResult<Rc<Metatype>> {
    let registry = TypeRegistry::of(lua);
    let type_name = qualified_name(namespace, class_name);
    let existing = registry.get(&type_name);

    if let Some(ns) = lookup_namespace(lua, namespace)? {
        match ns.raw_get::<_, Value>(class_name)? {
            Value::Nil => {}
            Value::Table(current) if is_class_object(lua, existing.as_deref(), &current)? => {}
            _ => return Err(conflict(&type_name)),
        }
    }

    let metatype = match existing {
        Some(metatype) if !metatype.is_opaque() => return Ok(metatype),
        Some(metatype) => metatype,
        None => registry.get_or_create(lua, &type_name)?,
    };

    let methods = metatype.methods(lua)?;
    install_builtins(lua, &methods)?;
    namespace_table(lua, namespace)?.raw_set(class_name, methods)?;
    metatype.installed.set(true);

    install_default_dispatch(lua, &metatype)?;
    if registry.options().constructor_sugar {
        install_constructor_sugar(lua, &metatype)?;
    }
    tracing::debug!(target: "dub::registry", type_name = %type_name, "registered type");
    Ok(metatype)
}

fn is_class_object(lua: &Lua, metatype: Option<&Metatype>, table: &Table) -> mlua::Result<bool> {
    match metatype {
        Some(metatype) => Ok(metatype.methods(lua)?.to_pointer() == table.to_pointer()),
        None => Ok(false),
    }
}

/// Generic members every class object carries.
fn install_builtins(lua: &Lua, methods: &Table) -> mlua::Result<()> {
    if methods.raw_get::<_, Value>("deleted")?.is_nil() {
        let deleted = lua.create_function(|_, value: Value| match handle::handle_of(&value) {
            Some(ud) => Ok(handle::is_deleted(&ud)?),
            None => Err(BridgeError::type_mismatch("handle", value.type_name()).into()),
        })?;
        methods.raw_set("deleted", deleted)?;
    }
    if methods.raw_get::<_, Value>("__tostring")?.is_nil() {
        let tostring = lua.create_function(|_, value: Value| match handle::handle_of(&value) {
            Some(ud) => Ok(ud.borrow::<Handle>()?.describe()),
            None => Ok(format!("<{}>", value.type_name())),
        })?;
        methods.raw_set("__tostring", tostring)?;
    }
    Ok(())
}

/// Wire attribute lookup to fall back to the method table.
///
/// Classes without attributes use the self-referential `__index = methods`.
/// Classes with attributes get dispatcher functions that consult accessors
/// first, resolving the native object through the super-link.
pub fn install_default_dispatch(lua: &Lua, metatype: &Metatype) -> BridgeResult<()> {
    let methods = metatype.methods(lua)?;
    let current: Value = methods.raw_get("__index")?;
    let self_index = matches!(&current, Value::Table(t) if t.to_pointer() == methods.to_pointer());

    if metatype.has_attributes() {
        if current.is_nil() || self_index {
            methods.raw_set("__index", composite_index(lua, metatype.type_name())?)?;
        }
        if methods.raw_get::<_, Value>("__newindex")?.is_nil() {
            methods.raw_set("__newindex", composite_newindex(lua, metatype.type_name())?)?;
        }
    } else if current.is_nil() {
        methods.raw_set("__index", methods.clone())?;
    }
    Ok(())
}

fn lookup(lua: &Lua, type_name: &str) -> mlua::Result<Rc<Metatype>> {
    TypeRegistry::of(lua)
        .get(type_name)
        .ok_or_else(|| mlua::Error::runtime(format!("unknown type '{}'", type_name)))
}

fn composite_index<'lua>(lua: &'lua Lua, type_name: &str) -> mlua::Result<Function<'lua>> {
    let type_name = type_name.to_string();
    lua.create_function(move |lua, (this, key): (Table, Value)| {
        let metatype = lookup(lua, &type_name)?;
        if let Some(attr) = key.as_str().and_then(|name| metatype.attribute(name)) {
            let resolved = resolve::resolve_as(lua, &Value::Table(this), &type_name, false)?;
            return (attr.get)(lua, &resolved.ptr);
        }
        metatype.methods(lua)?.raw_get::<_, Value>(key)
    })
}

fn composite_newindex<'lua>(lua: &'lua Lua, type_name: &str) -> mlua::Result<Function<'lua>> {
    let type_name = type_name.to_string();
    lua.create_function(move |lua, (this, key, value): (Table, Value, Value)| {
        let metatype = lookup(lua, &type_name)?;
        match key.as_str().and_then(|name| metatype.attribute(name)) {
            Some(Attribute {
                set: Some(setter), ..
            }) => {
                let resolved = resolve::resolve_as(lua, &Value::Table(this), &type_name, false)?;
                setter(lua, &resolved.ptr, value)
            }
            Some(_) => {
                Err(BridgeError::InvalidKey(key.as_str().unwrap_or_default().to_string()).into())
            }
            None => this.raw_set(key, value),
        }
    })
}

/// Make the class object callable: `ns.Class(...)` forwards to `ns.Class.new(...)`.
///
/// `new` is looked up at call time, so the factory may be bound after this runs.
pub fn install_constructor_sugar(lua: &Lua, metatype: &Metatype) -> BridgeResult<()> {
    let methods = metatype.methods(lua)?;
    let type_name = metatype.type_name().to_string();
    let call = lua.create_function(move |_, (class, args): (Table, MultiValue)| {
        match class.raw_get::<_, Value>("new")? {
            Value::Function(new) => new.call::<_, MultiValue>(args),
            _ => Err(mlua::Error::runtime(format!(
                "{} has no constructor",
                type_name
            ))),
        }
    })?;
    let meta = match methods.get_metatable() {
        Some(meta) => meta,
        None => lua.create_table()?,
    };
    meta.raw_set("__call", call)?;
    methods.set_metatable(Some(meta));
    Ok(())
}

// ============================================================================
// Class bindings
// ============================================================================

/// Everything a generated binding declares for one native class.
#[derive(Clone, Default)]
pub struct ClassBinding {
    namespace: String,
    class_name: String,
    methods: Vec<(String, Trampoline)>,
    ancestors: Vec<String>,
    cast: Option<CastHook>,
    destructor: Option<Destructor>,
    constants: Vec<(String, f64)>,
    attributes: Vec<(String, Attribute)>,
    strict_keys: Option<bool>,
}

impl ClassBinding {
    /// Start a binding for `namespace.class_name`
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    /// Fully qualified type name
    pub fn type_name(&self) -> String {
        qualified_name(&self.namespace, &self.class_name)
    }

    /// Bind a method (or the `new` factory)
    pub fn method(mut self, name: impl Into<String>, trampoline: Trampoline) -> Self {
        self.methods.push((name.into(), trampoline));
        self
    }

    /// Declare an ancestor type, nearest first
    pub fn ancestor(mut self, type_name: impl Into<String>) -> Self {
        self.ancestors.push(type_name.into());
        self
    }

    /// Set the cast hook
    pub fn cast(mut self, hook: CastHook) -> Self {
        self.cast = Some(hook);
        self
    }

    /// Set the custom destructor
    pub fn destructor(mut self, destructor: Destructor) -> Self {
        self.destructor = Some(destructor);
        self
    }

    /// Expose a class constant
    pub fn constant(mut self, name: impl Into<String>, value: f64) -> Self {
        self.constants.push((name.into(), value));
        self
    }

    /// Bind an attribute
    pub fn attribute(
        mut self,
        name: impl Into<String>,
        get: AttrGetter,
        set: Option<AttrSetter>,
    ) -> Self {
        self.attributes.push((name.into(), Attribute { get, set }));
        self
    }

    /// Override strict key checking for this class
    pub fn strict_keys(mut self, strict: bool) -> Self {
        self.strict_keys = Some(strict);
        self
    }
}

impl fmt::Debug for ClassBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBinding")
            .field("type_name", &self.type_name())
            .field("methods", &self.methods.len())
            .field("ancestors", &self.ancestors)
            .finish()
    }
}

/// Register a class and bind everything its binding declares.
///
/// Methods of already registered ancestors are copied into the class object
/// unless the class overrides them. Registering the same binding twice
/// rebinds the same metatype.
pub fn register_class(lua: &Lua, binding: &ClassBinding) -> BridgeResult<Rc<Metatype>> {
    let metatype = register_type(lua, &binding.namespace, &binding.class_name)?;
    let methods = metatype.methods(lua)?;

    for (name, trampoline) in &binding.methods {
        methods.raw_set(name.as_str(), lua.create_function(*trampoline)?)?;
    }

    let registry = TypeRegistry::of(lua);
    if !binding.ancestors.is_empty() {
        registry.super_limit.set(None);
    }
    for ancestor in &binding.ancestors {
        metatype.add_ancestor(ancestor);
        let Some(parent) = registry.get(ancestor) else {
            continue;
        };
        for pair in parent.methods(lua)?.pairs::<Value, Value>() {
            let (key, value) = pair?;
            if key.as_str().is_some_and(|name| NOT_INHERITED.contains(&name)) {
                continue;
            }
            if methods.raw_get::<_, Value>(key.clone())?.is_nil() {
                methods.raw_set(key, value)?;
            }
        }
    }

    if binding.cast.is_some() {
        metatype.set_cast(binding.cast);
    }
    if binding.destructor.is_some() {
        metatype.set_destructor(binding.destructor);
    }
    if let Some(strict) = binding.strict_keys {
        metatype.set_strict_keys(strict);
    }
    for (name, attribute) in &binding.attributes {
        metatype.set_attribute(name, *attribute);
    }
    marshal::register_constants(&methods, &binding.constants)?;
    install_default_dispatch(lua, &metatype)?;

    tracing::debug!(
        target: "dub::registry",
        type_name = metatype.type_name(),
        methods = binding.methods.len(),
        ancestors = binding.ancestors.len(),
        "bound class"
    );
    Ok(metatype)
}
