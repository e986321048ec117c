//! Conversion between Plinth values and wasmtime values.

use plinth_core::{PlinthError, Result, Val, ValType};
use wasmtime::{AsContext, AsContextMut, V128};

use crate::memory::{self, MemoryHandle};
use crate::store::StoreData;

pub(crate) fn to_wasm_type(ty: ValType) -> wasmtime::ValType {
    match ty {
        ValType::I32 => wasmtime::ValType::I32,
        ValType::I64 => wasmtime::ValType::I64,
        ValType::F32 => wasmtime::ValType::F32,
        ValType::F64 => wasmtime::ValType::F64,
        ValType::V128 => wasmtime::ValType::V128,
    }
}

pub(crate) fn to_wasm(val: &Val) -> wasmtime::Val {
    match *val {
        Val::I32(v) => wasmtime::Val::I32(v),
        Val::I64(v) => wasmtime::Val::I64(v),
        Val::F32(v) => wasmtime::Val::F32(v.to_bits()),
        Val::F64(v) => wasmtime::Val::F64(v.to_bits()),
        Val::V128(v) => wasmtime::Val::V128(V128::from(v)),
    }
}

pub(crate) fn from_wasm(val: &wasmtime::Val) -> Result<Val> {
    match *val {
        wasmtime::Val::I32(v) => Ok(Val::I32(v)),
        wasmtime::Val::I64(v) => Ok(Val::I64(v)),
        wasmtime::Val::F32(bits) => Ok(Val::F32(f32::from_bits(bits))),
        wasmtime::Val::F64(bits) => Ok(Val::F64(f64::from_bits(bits))),
        wasmtime::Val::V128(v) => Ok(Val::V128(v.as_u128())),
        _ => Err(PlinthError::SignatureMismatch(
            "reference values cannot cross the host boundary".to_string(),
        )),
    }
}

/// Decodes guest arguments against a declared parameter list.
pub(crate) fn decode_args(
    function: &str,
    params: &[ValType],
    raw: &[wasmtime::Val],
) -> Result<Vec<Val>> {
    if raw.len() != params.len() {
        return Err(PlinthError::SignatureMismatch(format!(
            "{function} expects {} arguments, got {}",
            params.len(),
            raw.len()
        )));
    }
    raw.iter()
        .zip(params)
        .enumerate()
        .map(|(position, (value, expected))| {
            let value = from_wasm(value)?;
            if value.ty() != *expected {
                return Err(PlinthError::SignatureMismatch(format!(
                    "{function} argument {position}: expected {expected}, got {}",
                    value.ty()
                )));
            }
            Ok(value)
        })
        .collect()
}

/// Encodes callback results into the slots wasmtime handed us.
pub(crate) fn encode_results(
    function: &str,
    results: &[ValType],
    values: &[Val],
    out: &mut [wasmtime::Val],
) -> Result<()> {
    if values.len() != results.len() || out.len() != results.len() {
        return Err(PlinthError::SignatureMismatch(format!(
            "{function} must return {} values, returned {}",
            results.len(),
            values.len()
        )));
    }
    for (position, (value, expected)) in values.iter().zip(results).enumerate() {
        if value.ty() != *expected {
            return Err(PlinthError::SignatureMismatch(format!(
                "{function} result {position}: expected {expected}, got {}",
                value.ty()
            )));
        }
        out[position] = to_wasm(value);
    }
    Ok(())
}

/// Copies call input into a fresh host-owned region.
pub(crate) fn pass_input(
    mut ctx: impl AsContextMut<Data = StoreData>,
    input: &[u8],
) -> Result<MemoryHandle> {
    let handle = memory::allocate(&mut ctx, input.len() as u64)?;
    if let Err(err) = memory::write(&mut ctx, handle, input) {
        memory::free(&mut ctx, handle)?;
        return Err(err);
    }
    Ok(handle)
}

/// Copies the output region the guest reported into host memory.
pub(crate) fn collect_output(
    ctx: impl AsContext<Data = StoreData>,
    offset: i64,
    length: i64,
) -> Result<Vec<u8>> {
    match (u64::try_from(offset), u64::try_from(length)) {
        (Ok(offset), Ok(length)) => memory::read(ctx, offset, length),
        _ => Err(PlinthError::OutOfBounds {
            offset: offset as u64,
            length: length as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_bits_survive() {
        let original = Val::F32(-0.5);
        assert_eq!(from_wasm(&to_wasm(&original)).unwrap(), original);

        let nan = to_wasm(&Val::F64(f64::NAN));
        assert!(from_wasm(&nan).unwrap().f64().unwrap().is_nan());

        let wide = Val::V128(u128::MAX - 1);
        assert_eq!(from_wasm(&to_wasm(&wide)).unwrap(), wide);
    }

    #[test]
    fn test_decode_args_checks_types() {
        let params = [ValType::I32, ValType::I64];
        let args = [wasmtime::Val::I32(1), wasmtime::Val::I64(2)];
        let decoded = decode_args("env::add", &params, &args).unwrap();
        assert_eq!(decoded, vec![Val::I32(1), Val::I64(2)]);

        let swapped = [wasmtime::Val::I64(2), wasmtime::Val::I32(1)];
        let err = decode_args("env::add", &params, &swapped).unwrap_err();
        assert!(err.to_string().contains("argument 0"));

        assert!(decode_args("env::add", &params, &args[..1]).is_err());
    }

    #[test]
    fn test_encode_results_checks_arity_and_types() {
        let mut out = [wasmtime::Val::I32(0)];
        encode_results("env::f", &[ValType::I32], &[Val::I32(42)], &mut out).unwrap();
        assert_eq!(out[0].i32(), Some(42));

        let err = encode_results("env::f", &[ValType::I32], &[], &mut out).unwrap_err();
        assert!(matches!(err, PlinthError::SignatureMismatch(_)));

        let err = encode_results("env::f", &[ValType::I32], &[Val::F64(1.0)], &mut out).unwrap_err();
        assert!(err.to_string().contains("expected i32, got f64"));
    }

    #[test]
    fn test_reference_values_rejected() {
        let func_ref = wasmtime::Val::FuncRef(None);
        assert!(matches!(
            from_wasm(&func_ref),
            Err(PlinthError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_negative_output_range_is_out_of_bounds() {
        let plugin = crate::test_support::instance_from(crate::fixtures::COUNT_VOWELS);
        plugin.with_store(|store| {
            assert!(matches!(
                collect_output(&*store, -1, 4),
                Err(PlinthError::OutOfBounds { .. })
            ));
            assert!(collect_output(&*store, 0, 0).unwrap().is_empty());
        });
    }
}
