//! Plinth Engine - Plugin registry and invocation API.

mod context;
mod plugin;

pub use context::Context;
pub use plugin::Plugin;
pub use plinth_plugin::{CallOptions, CancellationToken};

#[cfg(test)]
pub(crate) mod fixtures {
    pub const COUNT_VOWELS: &str = include_str!("../../../testdata/count_vowels.wat");
    pub const SPIN: &str = include_str!("../../../testdata/spin.wat");
    pub const HOST: &str = include_str!("../../../testdata/host.wat");
    pub const KERNEL: &str = include_str!("../../../testdata/kernel.wat");
}
