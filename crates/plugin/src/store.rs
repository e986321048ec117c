//! Per-instance data held inside the wasmtime store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use plinth_core::{PlinthError, PluginId};
use tokio_util::sync::CancellationToken;
use wasmtime::StoreLimits;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::checkpoint::Checkpoint;
use crate::host::HostFunction;
use crate::manifest::Manifest;
use crate::memory::GuestMemory;

/// State reachable from host callbacks through the wasmtime `Caller`.
pub(crate) struct StoreData {
    pub(crate) plugin_id: PluginId,
    pub(crate) memory: GuestMemory,
    /// Dispatch table; host callbacks are linked by index into it.
    pub(crate) functions: Arc<[HostFunction]>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) config: BTreeMap<String, String>,
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) checkpoint: Checkpoint,
    /// Typed failure recorded by a host callback before it trapped.
    pub(crate) failure: Option<PlinthError>,
    /// Message set by the guest through `plinth::error_set`.
    pub(crate) guest_error: Option<String>,
}

impl StoreData {
    pub(crate) fn new(
        plugin_id: PluginId,
        functions: Arc<[HostFunction]>,
        manifest: Arc<Manifest>,
        config: BTreeMap<String, String>,
        wasi: WasiP1Ctx,
        limits: StoreLimits,
    ) -> Self {
        Self {
            plugin_id,
            memory: GuestMemory::default(),
            functions,
            manifest,
            config,
            wasi,
            limits,
            checkpoint: Checkpoint::default(),
            failure: None,
            guest_error: None,
        }
    }

    /// Prepares the store for a new guest call.
    pub(crate) fn begin_call(&mut self, token: CancellationToken, deadline: Option<Instant>) {
        self.failure = None;
        self.guest_error = None;
        self.checkpoint.arm(token, deadline);
    }

    /// Records a host-side failure, keeping the first one of a call.
    pub(crate) fn record_failure(&mut self, err: PlinthError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}
