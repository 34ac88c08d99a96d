//! Bridge configuration

use std::fmt;
use std::rc::Rc;

/// Destination for callback failures when the object defines no `error` method.
#[derive(Clone, Default)]
pub enum ErrorChannel {
    /// The runtime's global `print` function
    #[default]
    Print,
    /// `tracing::warn!` under the `dub::callback` target
    Log,
    /// Host-provided sink
    Custom(Rc<dyn Fn(&str)>),
}

impl ErrorChannel {
    /// Build a custom channel from a closure.
    pub fn custom(sink: impl Fn(&str) + 'static) -> Self {
        ErrorChannel::Custom(Rc::new(sink))
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorChannel::Print => write!(f, "ErrorChannel::Print"),
            ErrorChannel::Log => write!(f, "ErrorChannel::Log"),
            ErrorChannel::Custom(_) => write!(f, "ErrorChannel::Custom(..)"),
        }
    }
}

/// Options fixed when a registry is installed into a `Lua` state.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Default target of the callback error shim
    pub error_channel: ErrorChannel,
    /// Reject assignments to unknown keys on handles
    pub strict_keys: bool,
    /// Make class tables callable as constructors
    pub constructor_sugar: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            error_channel: ErrorChannel::Print,
            strict_keys: true,
            constructor_sugar: true,
        }
    }
}

impl BridgeOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default callback error channel
    pub fn with_error_channel(mut self, channel: ErrorChannel) -> Self {
        self.error_channel = channel;
        self
    }

    /// Enable or disable strict key checks on handles
    pub fn with_strict_keys(mut self, strict: bool) -> Self {
        self.strict_keys = strict;
        self
    }

    /// Enable or disable callable class tables
    pub fn with_constructor_sugar(mut self, enabled: bool) -> Self {
        self.constructor_sugar = enabled;
        self
    }
}
