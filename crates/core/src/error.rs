//! Error types for Plinth.

use miette::Diagnostic;
use thiserror::Error;

use crate::state::{CancelReason, PluginId};

/// Result type alias for Plinth operations.
pub type Result<T> = std::result::Result<T, PlinthError>;

/// Main error type for Plinth.
///
/// Errors local to one call (traps, host failures, cancellation) are
/// recorded on the instance and returned to that call only; the instance
/// stays usable afterwards.
#[derive(Debug, Error, Diagnostic)]
pub enum PlinthError {
    #[error("Failed to load module: {0}")]
    #[diagnostic(code(plinth::module_load))]
    ModuleLoad(String),

    #[error("Function '{0}' not found")]
    #[diagnostic(
        code(plinth::function_not_found),
        help("check the module exports with `function_exists` first")
    )]
    FunctionNotFound(String),

    #[error("Signature mismatch: {0}")]
    #[diagnostic(code(plinth::signature_mismatch))]
    SignatureMismatch(String),

    #[error("Guest memory exhausted: could not allocate {requested} bytes")]
    #[diagnostic(code(plinth::memory_exhausted))]
    MemoryExhausted { requested: u64 },

    #[error("Guest memory access out of bounds: offset={offset}, length={length}")]
    #[diagnostic(code(plinth::out_of_bounds))]
    OutOfBounds { offset: u64, length: u64 },

    #[error("Host function '{function}' failed: {message}")]
    #[diagnostic(code(plinth::host_function))]
    HostFunction { function: String, message: String },

    #[error("Host function '{namespace}::{name}' is already registered")]
    #[diagnostic(code(plinth::duplicate_function))]
    DuplicateFunction { namespace: String, name: String },

    #[error("Guest trapped: {0}")]
    #[diagnostic(code(plinth::trap))]
    Trap(String),

    #[error("Guest call failed: {0}")]
    #[diagnostic(code(plinth::guest))]
    Guest(String),

    #[error("Call cancelled: {0}")]
    #[diagnostic(code(plinth::cancelled))]
    Cancelled(CancelReason),

    #[error("Plugin is already running a call")]
    #[diagnostic(
        code(plinth::already_running),
        help("calls against a single plugin are serialized")
    )]
    AlreadyRunning,

    #[error("Plugin is busy")]
    #[diagnostic(code(plinth::busy))]
    Busy,

    #[error("Plugin {0} has been freed")]
    #[diagnostic(code(plinth::use_after_free))]
    UseAfterFree(PluginId),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(plinth::config))]
    Config(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(plinth::io))]
    Io(#[from] std::io::Error),
}

impl PlinthError {
    /// Returns true if the call was stopped by a cancellation request or
    /// a timeout rather than failing on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PlinthError::Cancelled(_))
    }

    /// Returns true for errors caused by the caller breaking the
    /// one-call-at-a-time or lifetime rules.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            PlinthError::AlreadyRunning
                | PlinthError::Busy
                | PlinthError::UseAfterFree(_)
                | PlinthError::FunctionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguishable() {
        assert!(PlinthError::Cancelled(CancelReason::Requested).is_cancellation());
        assert!(PlinthError::Cancelled(CancelReason::Timeout).is_cancellation());
        assert!(!PlinthError::Trap("unreachable".into()).is_cancellation());
    }

    #[test]
    fn test_messages() {
        let err = PlinthError::HostFunction {
            function: "env::fetch".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "Host function 'env::fetch' failed: denied");
        assert_eq!(
            PlinthError::UseAfterFree(PluginId::new(7)).to_string(),
            "Plugin #7 has been freed"
        );
        assert!(PlinthError::AlreadyRunning.is_usage_error());
    }
}
