//! Plinth Plugin - WASM plugin instances for Plinth.
//!
//! This crate loads modules through wasmtime, links host functions and the
//! built-in `plinth` imports, manages the host's regions in guest memory,
//! and runs calls under cooperative cancellation.

mod checkpoint;
mod error;
mod host;
mod instance;
mod kernel;
mod manifest;
mod marshal;
mod memory;
mod runtime;
mod store;

pub use checkpoint::CallOptions;
pub use host::{CurrentPlugin, HostFunction, HostFunctions, UserData};
pub use instance::PluginInstance;
pub use manifest::{Manifest, MemoryOptions, ResolvedModule, WasmSource};
pub use memory::{MemoryHandle, PAGE_SIZE};
pub use runtime::{CompiledModule, LoadedSource, Runtime, SourceKind};
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
pub(crate) mod fixtures {
    pub const COUNT_VOWELS: &str = include_str!("../../../testdata/count_vowels.wat");
    pub const SPIN: &str = include_str!("../../../testdata/spin.wat");
    pub const HOST: &str = include_str!("../../../testdata/host.wat");
    pub const ACCESSORS: &str = include_str!("../../../testdata/accessors.wat");
    pub const KERNEL: &str = include_str!("../../../testdata/kernel.wat");
}

#[cfg(test)]
pub(crate) mod test_support {
    use plinth_core::{PluginId, RuntimeConfig};

    use crate::{HostFunctions, PluginInstance, Runtime};

    pub fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    pub fn instance_in(
        runtime: &Runtime,
        wat: &str,
        functions: HostFunctions,
        with_wasi: bool,
    ) -> PluginInstance {
        let source = runtime.load(wat.as_bytes()).unwrap();
        PluginInstance::new(runtime, PluginId::new(1), source, functions, with_wasi).unwrap()
    }

    pub fn instance_with(wat: &str, functions: HostFunctions, with_wasi: bool) -> PluginInstance {
        instance_in(&runtime(), wat, functions, with_wasi)
    }

    pub fn instance_from(wat: &str) -> PluginInstance {
        instance_with(wat, HostFunctions::new(), false)
    }
}
