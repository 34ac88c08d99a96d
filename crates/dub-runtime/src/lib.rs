//! Dub runtime - glue between native objects and Lua scripts
//!
//! Generated bindings call into this crate to expose native classes to a Lua
//! state. The pieces are:
//!
//! - [`handle`]: userdata wrapping a native pointer, with ownership tracking
//!   so an object is freed exactly once from either side
//! - [`registry`]: per-class metatables published into dotted namespaces
//! - [`resolve`]: pointer resolution through script-side subclass tables
//! - [`callback`]: a coroutine per object for calling script methods
//! - [`marshal`]: argument checks and constant tables
//!
//! # Example
//!
//! ```ignore
//! use dub_runtime::{Bridge, ClassBinding};
//!
//! let bridge = Bridge::new();
//! bridge.register(&ClassBinding::new("geo", "Point").method("new", point_new))?;
//! bridge.lua().load("local p = geo.Point(1, 2)").exec()?;
//! ```

#![warn(missing_docs)]

use std::rc::Rc;

use mlua::Lua;

pub mod callback;
pub mod error;
pub mod handle;
pub mod marshal;
pub mod options;
pub mod registry;
pub mod resolve;

pub use callback::{wrap_callable, Callable, CallbackState, CallbackThread};
pub use error::{find_bridge_error, BridgeError, BridgeResult};
pub use handle::{Handle, HandleLink, NativeObject, NativePtr, Ownership, Owns, WeakPtr};
pub use options::{BridgeOptions, ErrorChannel};
pub use registry::{ClassBinding, Metatype, TypeRegistry};
pub use resolve::{check_object, is_object, make_composite, resolve_as, Resolved};

// ============================================================================
// Bridge
// ============================================================================

/// A Lua state with a type registry installed.
pub struct Bridge {
    lua: Lua,
}

impl Bridge {
    /// Create a state with default options
    pub fn new() -> Self {
        Self::with_options(BridgeOptions::default())
    }

    /// Create a state with the given options
    pub fn with_options(options: BridgeOptions) -> Self {
        let lua = Lua::new();
        install(&lua, options);
        Self { lua }
    }

    /// The underlying Lua state
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// The type registry attached to the state
    pub fn registry(&self) -> Rc<TypeRegistry> {
        TypeRegistry::of(&self.lua)
    }

    /// Register a class binding.
    pub fn register(&self, binding: &ClassBinding) -> BridgeResult<Rc<Metatype>> {
        registry::register_class(&self.lua, binding)
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach a type registry to an existing Lua state.
///
/// Must run before any type is registered; later calls replace the registry.
pub fn install(lua: &Lua, options: BridgeOptions) -> Rc<TypeRegistry> {
    tracing::debug!(target: "dub::registry", ?options, "installing type registry");
    TypeRegistry::install(lua, options)
}
