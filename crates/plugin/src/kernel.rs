//! Built-in imports available to every guest under the `plinth` namespace.

use plinth_core::{PlinthError, Result};
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Linker};

use crate::error::{module_load, trap_with};
use crate::memory::{self, MemoryHandle};
use crate::store::StoreData;

pub(crate) const NAMESPACE: &str = "plinth";

const BUILTINS: &[&str] = &["alloc", "free", "length", "config_get", "error_set", "log"];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn offset(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| PlinthError::OutOfBounds {
        offset: raw as u64,
        length: 0,
    })
}

fn read_range(caller: &Caller<'_, StoreData>, off: i64, len: i64) -> Result<Vec<u8>> {
    memory::read(caller, offset(off)?, offset(len)?)
}

fn alloc(caller: &mut Caller<'_, StoreData>, len: i64) -> Result<i64> {
    let handle = memory::allocate(&mut *caller, offset(len)?)?;
    Ok(handle.offset() as i64)
}

fn free(caller: &mut Caller<'_, StoreData>, off: i64) -> Result<()> {
    let off = offset(off)?;
    if off == 0 {
        return Ok(());
    }
    let length = memory::length_of(&*caller, off).ok_or(PlinthError::OutOfBounds {
        offset: off,
        length: 0,
    })?;
    memory::free(&mut *caller, MemoryHandle::new(off, length))
}

/// Returned by `config_get` for a key with no value.
const MISSING: i64 = -1;

/// Offset of a fresh region holding the value of a config key. An empty
/// value yields offset 0, an unknown key yields `MISSING`.
fn config_get(caller: &mut Caller<'_, StoreData>, off: i64, len: i64) -> Result<i64> {
    let key = read_range(caller, off, len)?;
    let key = String::from_utf8_lossy(&key);
    let Some(value) = caller.data().config.get(key.as_ref()).cloned() else {
        return Ok(MISSING);
    };
    let handle = memory::allocate(&mut *caller, value.len() as u64)?;
    memory::write(&mut *caller, handle, value.as_bytes())?;
    Ok(handle.offset() as i64)
}

fn error_set(caller: &mut Caller<'_, StoreData>, off: i64, len: i64) -> Result<()> {
    let message = read_range(caller, off, len)?;
    caller.data_mut().guest_error = Some(String::from_utf8_lossy(&message).into_owned());
    Ok(())
}

fn log(caller: &Caller<'_, StoreData>, level: i32, off: i64, len: i64) -> Result<()> {
    let message = read_range(caller, off, len)?;
    let message = String::from_utf8_lossy(&message);
    let plugin = caller.data().plugin_id;
    match level {
        0 => error!(target: "plinth::guest", %plugin, "{message}"),
        1 => warn!(target: "plinth::guest", %plugin, "{message}"),
        2 => info!(target: "plinth::guest", %plugin, "{message}"),
        3 => debug!(target: "plinth::guest", %plugin, "{message}"),
        _ => trace!(target: "plinth::guest", %plugin, "{message}"),
    }
    Ok(())
}

/// Traps with `err` after recording it for the caller.
fn fail<T>(caller: &mut Caller<'_, StoreData>, result: Result<T>) -> wasmtime::Result<T> {
    result.map_err(|err| trap_with(caller.data_mut(), err))
}

/// Links the built-in imports.
pub(crate) fn link(linker: &mut Linker<StoreData>) -> Result<()> {
    register(linker).map_err(|err| module_load("cannot link plinth imports", err))
}

fn register(linker: &mut Linker<StoreData>) -> wasmtime::Result<()> {
    linker.func_wrap(NAMESPACE, "alloc", |mut caller: Caller<'_, StoreData>, len: i64| {
        let result = alloc(&mut caller, len);
        fail(&mut caller, result)
    })?;
    linker.func_wrap(NAMESPACE, "free", |mut caller: Caller<'_, StoreData>, off: i64| {
        let result = free(&mut caller, off);
        fail(&mut caller, result)
    })?;
    linker.func_wrap(NAMESPACE, "length", |caller: Caller<'_, StoreData>, off: i64| -> i64 {
        u64::try_from(off)
            .ok()
            .and_then(|off| memory::length_of(&caller, off))
            .map_or(0, |len| len as i64)
    })?;
    linker.func_wrap(
        NAMESPACE,
        "config_get",
        |mut caller: Caller<'_, StoreData>, off: i64, len: i64| {
            let result = config_get(&mut caller, off, len);
            fail(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        NAMESPACE,
        "error_set",
        |mut caller: Caller<'_, StoreData>, off: i64, len: i64| {
            let result = error_set(&mut caller, off, len);
            fail(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        NAMESPACE,
        "log",
        |mut caller: Caller<'_, StoreData>, level: i32, off: i64, len: i64| {
            let result = log(&caller, level, off, len);
            fail(&mut caller, result)
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallOptions;
    use crate::fixtures;
    use crate::test_support::instance_from;

    #[test]
    fn test_builtin_names() {
        assert!(is_builtin("alloc"));
        assert!(is_builtin("config_get"));
        assert!(!is_builtin("transform"));
    }

    #[test]
    fn test_negative_offsets_rejected() {
        assert!(matches!(offset(-8), Err(PlinthError::OutOfBounds { .. })));
        assert_eq!(offset(16).unwrap(), 16);
    }

    #[test]
    fn test_guest_allocates_and_frees() {
        let plugin = instance_from(fixtures::KERNEL);
        let output = plugin.call("scratch", b"", &CallOptions::default()).unwrap();
        assert_eq!(output, vec![32, 0]);
    }

    #[test]
    fn test_config_get_tells_missing_from_empty() {
        let runtime = crate::test_support::runtime();
        let manifest = crate::Manifest::from_wasm(fixtures::KERNEL.as_bytes()).with_config("blank", "");
        let source = runtime.load_manifest(manifest, None).unwrap();
        let plugin = crate::PluginInstance::new(
            &runtime,
            plinth_core::PluginId::new(1),
            source,
            crate::HostFunctions::new(),
            false,
        )
        .unwrap();

        assert_eq!(plugin.call("has_config", b"blank", &CallOptions::default()).unwrap(), vec![1]);
        assert_eq!(plugin.call("has_config", b"absent", &CallOptions::default()).unwrap(), vec![0]);
    }

    #[test]
    fn test_guest_log_and_copy() {
        let plugin = instance_from(fixtures::KERNEL);
        let output = plugin.call("echo", b"logged", &CallOptions::default()).unwrap();
        assert_eq!(output, b"logged");
    }
}
