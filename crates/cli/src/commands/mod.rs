//! CLI command implementations.

pub mod call;
pub mod exports;
pub mod validate;
pub mod version;
