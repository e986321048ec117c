//! Plinth Core - Shared types for the Plinth WebAssembly plugin runtime.

mod config;
mod error;
mod state;
mod value;

pub use config::RuntimeConfig;
pub use error::{PlinthError, Result};
pub use state::{CancelReason, ExecutionState, PluginId};
pub use value::{Val, ValType};

/// Name of the execution engine backing this runtime.
pub const ENGINE: &str = "wasmtime";

/// Returns the semantic version of the runtime's capability set.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
