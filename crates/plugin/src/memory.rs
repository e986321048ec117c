//! Guest memory management.
//!
//! The host keeps its own region allocator inside each instance's linear
//! memory. Regions are carved out of pages the host grows itself, so they
//! never overlap data the guest placed in memory, nor pages a guest
//! allocator obtains later through its own `memory.grow`.

use std::collections::BTreeMap;

use plinth_core::{PlinthError, Result};
use wasmtime::{AsContext, AsContextMut, Memory};

use crate::store::StoreData;

/// Size of a WebAssembly page.
pub const PAGE_SIZE: u64 = 64 * 1024;

/// Allocation granularity.
const ALIGN: u64 = 8;

/// Bytes kept free at offset zero so that no handle is ever null.
const NULL_GUARD: u64 = ALIGN;

/// A region allocated by the host in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle {
    offset: u64,
    length: u64,
}

impl MemoryHandle {
    pub(crate) fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// The empty handle, returned for zero-length allocations.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Start of the region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length requested for the region.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Returns true for the empty handle.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Allocator bookkeeping for one instance.
#[derive(Debug, Default)]
pub(crate) struct GuestMemory {
    memory: Option<Memory>,
    /// Live regions: offset -> requested length.
    live: BTreeMap<u64, u64>,
    /// Free regions: offset -> size.
    free: BTreeMap<u64, u64>,
    /// Offsets allocated during the current call.
    scope: Option<Vec<u64>>,
}

fn aligned(len: u64) -> u64 {
    len.div_ceil(ALIGN) * ALIGN
}

impl GuestMemory {
    /// Binds the instance's exported memory.
    pub(crate) fn bind(&mut self, memory: Option<Memory>) {
        self.memory = memory;
        self.live.clear();
        self.free.clear();
        self.scope = None;
    }

    /// Starts tracking allocations made by a call.
    pub(crate) fn begin_scope(&mut self) {
        self.scope = Some(Vec::new());
    }

    fn claim(&mut self, offset: u64, length: u64) {
        self.live.insert(offset, length);
        if let Some(scope) = &mut self.scope {
            scope.push(offset);
        }
    }

    #[cfg(test)]
    pub(crate) fn live_regions(&self) -> usize {
        self.live.len()
    }

    /// First-fit search of the free list.
    fn take_free(&mut self, size: u64) -> Option<u64> {
        let (&offset, &available) = self.free.iter().find(|(_, avail)| **avail >= size)?;
        self.free.remove(&offset);
        if available > size {
            self.free.insert(offset + size, available - size);
        }
        Some(offset)
    }

    /// Returns a region to the free list, merging with its neighbours.
    fn release(&mut self, mut offset: u64, mut size: u64) {
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }
}

fn bound_memory(data: &StoreData, offset: u64, length: u64) -> Result<Memory> {
    data.memory
        .memory
        .ok_or(PlinthError::OutOfBounds { offset, length })
}

/// Current size of the instance's memory in bytes.
pub(crate) fn extent(ctx: impl AsContext<Data = StoreData>) -> u64 {
    let ctx = ctx.as_context();
    match ctx.data().memory.memory {
        Some(memory) => memory.data_size(&ctx) as u64,
        None => 0,
    }
}

/// Reserves `length` bytes of guest memory.
pub(crate) fn allocate(
    mut ctx: impl AsContextMut<Data = StoreData>,
    length: u64,
) -> Result<MemoryHandle> {
    let mut ctx = ctx.as_context_mut();
    if length == 0 {
        return Ok(MemoryHandle::empty());
    }
    let size = aligned(length);

    if let Some(offset) = ctx.data_mut().memory.take_free(size) {
        ctx.data_mut().memory.claim(offset, length);
        return Ok(MemoryHandle::new(offset, length));
    }

    let memory = bound_memory(ctx.data(), 0, length)?;
    let current = memory.data_size(&ctx) as u64;
    let guard = if current == 0 { NULL_GUARD } else { 0 };
    let pages = (size + guard).div_ceil(PAGE_SIZE);
    let previous = memory
        .grow(&mut ctx, pages)
        .map_err(|_| PlinthError::MemoryExhausted { requested: length })?;

    let start = previous * PAGE_SIZE + guard;
    let grown = pages * PAGE_SIZE - guard;
    let data = &mut ctx.data_mut().memory;
    data.release(start, grown);
    let offset = data
        .take_free(size)
        .ok_or(PlinthError::MemoryExhausted { requested: length })?;
    data.claim(offset, length);
    Ok(MemoryHandle::new(offset, length))
}

/// Copies `bytes` into an allocated region.
pub(crate) fn write(
    mut ctx: impl AsContextMut<Data = StoreData>,
    handle: MemoryHandle,
    bytes: &[u8],
) -> Result<()> {
    let mut ctx = ctx.as_context_mut();
    if bytes.is_empty() {
        return Ok(());
    }
    let out_of_bounds = PlinthError::OutOfBounds {
        offset: handle.offset,
        length: bytes.len() as u64,
    };
    match ctx.data().memory.live.get(&handle.offset) {
        Some(&length) if bytes.len() as u64 <= length => {}
        _ => return Err(out_of_bounds),
    }
    let memory = bound_memory(ctx.data(), handle.offset, bytes.len() as u64)?;
    memory
        .write(&mut ctx, handle.offset as usize, bytes)
        .map_err(|_| out_of_bounds)
}

/// Copies `length` bytes starting at `offset` out of guest memory.
pub(crate) fn read(
    ctx: impl AsContext<Data = StoreData>,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let ctx = ctx.as_context();
    if length == 0 {
        return Ok(Vec::new());
    }
    let out_of_bounds = PlinthError::OutOfBounds { offset, length };
    let memory = bound_memory(ctx.data(), offset, length)?;
    let end = offset.checked_add(length).ok_or_else(|| PlinthError::OutOfBounds {
        offset,
        length,
    })?;
    if end > memory.data_size(&ctx) as u64 {
        return Err(out_of_bounds);
    }
    let mut buf = vec![0u8; length as usize];
    memory
        .read(&ctx, offset as usize, &mut buf)
        .map_err(|_| out_of_bounds)?;
    Ok(buf)
}

/// Releases an allocated region.
pub(crate) fn free(mut ctx: impl AsContextMut<Data = StoreData>, handle: MemoryHandle) -> Result<()> {
    let mut ctx = ctx.as_context_mut();
    if handle.is_empty() {
        return Ok(());
    }
    let data = &mut ctx.data_mut().memory;
    let length = data
        .live
        .remove(&handle.offset)
        .ok_or(PlinthError::OutOfBounds {
            offset: handle.offset,
            length: handle.length,
        })?;
    data.release(handle.offset, aligned(length));
    Ok(())
}

/// Frees the regions allocated since the call's scope began that are still
/// live, returning how many were released. Regions the guest already freed
/// are skipped.
pub(crate) fn release_scope(mut ctx: impl AsContextMut<Data = StoreData>) -> usize {
    let mut ctx = ctx.as_context_mut();
    let data = &mut ctx.data_mut().memory;
    let mut released = 0;
    for offset in data.scope.take().unwrap_or_default() {
        if let Some(length) = data.live.remove(&offset) {
            data.release(offset, aligned(length));
            released += 1;
        }
    }
    released
}

/// Length of the live region starting at `offset`.
pub(crate) fn length_of(ctx: impl AsContext<Data = StoreData>, offset: u64) -> Option<u64> {
    ctx.as_context().data().memory.live.get(&offset).copied()
}
