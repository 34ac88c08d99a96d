//! Error types for the native/script bridge

use std::sync::Arc;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Wrong native type, directly or through a super-link / cast
    #[error("{expected} expected, got {actual}{}", super_suffix(.via_super))]
    TypeMismatch {
        /// Requested type name
        expected: String,
        /// Type name found on the value
        actual: String,
        /// The mismatching handle was reached through a super-link
        via_super: bool,
    },

    /// The handle's native pointer has been invalidated
    #[error("{type_name} object was deleted")]
    UseAfterFree {
        /// Type name of the dead handle
        type_name: String,
    },

    /// Unknown attribute on a strict-checked object
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// Namespace collision while installing a type or constant table
    #[error("name conflict for module '{path}'")]
    RegistrationConflict {
        /// Fully qualified path that could not be installed
        path: String,
    },

    /// Contained failure inside a re-entrant script call
    #[error("callback failed: {message}")]
    CallbackFailure {
        /// Message reported by the script runtime
        message: String,
    },

    /// Error raised by the script runtime itself
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

fn super_suffix(via_super: &bool) -> &'static str {
    if *via_super {
        " (using super)"
    } else {
        ""
    }
}

impl BridgeError {
    /// Same-level type mismatch
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
            via_super: false,
        }
    }

    /// Mismatch found after following a super-link
    pub fn super_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
            via_super: true,
        }
    }

    /// Use of a dead handle
    pub fn use_after_free(type_name: impl Into<String>) -> Self {
        BridgeError::UseAfterFree {
            type_name: type_name.into(),
        }
    }

    /// Returns true for `TypeMismatch`
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, BridgeError::TypeMismatch { .. })
    }

    /// Returns true for `UseAfterFree`
    pub fn is_use_after_free(&self) -> bool {
        matches!(self, BridgeError::UseAfterFree { .. })
    }
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Lua(inner) => inner,
            other => mlua::Error::ExternalError(Arc::new(other)),
        }
    }
}

/// Recover the bridge error carried by a script error.
///
/// Errors raised inside trampolines reach the host wrapped in one or more
/// `CallbackError` layers.
pub fn find_bridge_error(err: &mlua::Error) -> Option<&BridgeError> {
    let mut current = err;
    loop {
        match current {
            mlua::Error::CallbackError { cause, .. } => current = cause.as_ref(),
            mlua::Error::ExternalError(inner) => return inner.downcast_ref::<BridgeError>(),
            _ => return None,
        }
    }
}
