//! Mapping of wasmtime failures onto Plinth errors.

use plinth_core::PlinthError;
use wasmtime::Trap;

use crate::store::StoreData;

/// Classifies an error raised while the guest was executing.
///
/// A cancellation observed at a checkpoint wins over anything else the
/// trap carries, then a failure recorded by a host callback. Everything
/// left is a plain guest trap.
pub(crate) fn from_trap(err: wasmtime::Error, data: &mut StoreData) -> PlinthError {
    if let Some(reason) = data.checkpoint.take_observed() {
        return PlinthError::Cancelled(reason);
    }
    if let Some(failure) = data.failure.take() {
        return failure;
    }
    match err.downcast_ref::<Trap>() {
        Some(trap) => PlinthError::Trap(trap.to_string()),
        None => PlinthError::Trap(format!("{err:#}")),
    }
}

/// Wraps a compile, link or instantiation failure.
pub(crate) fn module_load(context: &str, err: wasmtime::Error) -> PlinthError {
    PlinthError::ModuleLoad(format!("{context}: {err:#}"))
}

/// Converts a Plinth error into a wasmtime trap after recording it on the
/// store, so the typed error reaches the caller intact.
pub(crate) fn trap_with(data: &mut StoreData, err: PlinthError) -> wasmtime::Error {
    let message = err.to_string();
    data.record_failure(err);
    wasmtime::Error::msg(message)
}
