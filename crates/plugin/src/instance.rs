//! Plugin instances.
//!
//! An instance owns one wasmtime store and runs at most one call at a
//! time. Bookkeeping that other threads need while a call runs (state,
//! the call's token, last error) lives behind its own short-lived lock so
//! that queries and cancellation never wait for the guest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use plinth_core::{CancelReason, ExecutionState, PlinthError, PluginId, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasmtime::{Func, Instance, Linker, Store, StoreLimitsBuilder};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::checkpoint::{self, CallOptions};
use crate::error::{from_trap, module_load};
use crate::host::{self, HostFunction, HostFunctions};
use crate::kernel;
use crate::manifest::Manifest;
use crate::marshal;
use crate::memory::{self, PAGE_SIZE};
use crate::runtime::{CompiledModule, LoadedSource, Runtime};
use crate::store::StoreData;

const OUTPUT_OFFSET: &str = "get_output_offset";
const OUTPUT_LENGTH: &str = "get_output_length";

/// Everything needed to build a fresh store for the instance.
#[derive(Clone)]
struct Blueprint {
    modules: Vec<(Option<String>, Arc<CompiledModule>)>,
    manifest: Arc<Manifest>,
    config: BTreeMap<String, String>,
    functions: Arc<[HostFunction]>,
    with_wasi: bool,
}

impl Blueprint {
    fn new(source: LoadedSource, functions: HostFunctions, with_wasi: bool) -> Self {
        let config = source.manifest.config.clone();
        Self {
            modules: source.modules,
            manifest: Arc::new(source.manifest),
            config,
            functions: functions.into_table(),
            with_wasi,
        }
    }

    fn entry(&self) -> Result<&Arc<CompiledModule>> {
        self.modules
            .last()
            .map(|(_, module)| module)
            .ok_or_else(|| PlinthError::ModuleLoad("source contains no module".to_string()))
    }
}

/// How an export hands back its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convention {
    /// `(i64, i64) -> (i64, i64)`: returns offset and length.
    Direct,
    /// `(i64, i64) -> ()` or `-> i32`: output read through the accessor
    /// exports, with an optional failure status.
    Accessors { status: bool },
}

impl Convention {
    fn of(function: &str, ty: &wasmtime::FuncType) -> Result<Self> {
        let i64_pair = |types: Vec<wasmtime::ValType>| {
            types.len() == 2 && types.iter().all(|t| matches!(t, wasmtime::ValType::I64))
        };
        let results: Vec<_> = ty.results().collect();
        if !i64_pair(ty.params().collect()) {
            return Err(PlinthError::SignatureMismatch(format!(
                "{function} must take (i64 offset, i64 length)"
            )));
        }
        if i64_pair(results.clone()) {
            return Ok(Convention::Direct);
        }
        match results.as_slice() {
            [] => Ok(Convention::Accessors { status: false }),
            [wasmtime::ValType::I32] => Ok(Convention::Accessors { status: true }),
            _ => Err(PlinthError::SignatureMismatch(format!(
                "{function} must return (i64, i64), i32 or nothing"
            ))),
        }
    }
}

/// The instantiated part of a plugin.
struct Live {
    store: Store<StoreData>,
    instance: Instance,
    blueprint: Blueprint,
}

impl Live {
    fn build(runtime: &Runtime, id: PluginId, blueprint: Blueprint) -> Result<Self> {
        let engine = runtime.engine();
        let manifest = &blueprint.manifest;
        let (entry, dependencies) = blueprint
            .modules
            .split_last()
            .ok_or_else(|| PlinthError::ModuleLoad("source contains no module".to_string()))?;

        let mut wasi = WasiCtxBuilder::new();
        if blueprint.with_wasi {
            wasi.inherit_stdout().inherit_stderr();
            for (guest, host) in &manifest.allowed_paths {
                wasi.preopened_dir(host, guest, DirPerms::all(), FilePerms::all())
                    .map_err(|err| module_load(&format!("cannot preopen {}", host.display()), err))?;
            }
        }

        let mut limits = StoreLimitsBuilder::new();
        if let Some(pages) = manifest.memory.max_pages.or(runtime.config().max_memory_pages) {
            limits = limits.memory_size(pages as usize * PAGE_SIZE as usize);
        }

        let data = StoreData::new(
            id,
            blueprint.functions.clone(),
            manifest.clone(),
            blueprint.config.clone(),
            wasi.build_p1(),
            limits.build(),
        );
        let mut store = Store::new(engine, data);
        store.limiter(|data| &mut data.limits);
        checkpoint::install(&mut store);

        let mut linker = Linker::new(engine);
        if blueprint.with_wasi {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
                .map_err(|err| module_load("cannot link WASI", err))?;
        }
        kernel::link(&mut linker)?;
        host::link(&mut linker, engine, &blueprint.functions)?;

        for (name, module) in dependencies {
            let name = name.as_deref().ok_or_else(|| {
                PlinthError::ModuleLoad("every module but the entry needs a name".to_string())
            })?;
            linker
                .module(&mut store, name, module.module())
                .map_err(|err| module_load(&format!("cannot link module '{name}'"), err))?;
        }

        let instance = linker
            .instantiate(&mut store, entry.1.module())
            .map_err(|err| module_load("cannot instantiate module", err))?;
        let exported = instance.get_memory(&mut store, "memory");
        store.data_mut().memory.bind(exported);

        Ok(Self {
            store,
            instance,
            blueprint,
        })
    }

    fn entry(&self) -> Result<Arc<CompiledModule>> {
        self.blueprint.entry().cloned()
    }

    fn invoke(
        &mut self,
        function: &str,
        input: &[u8],
        token: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let func = self
            .instance
            .get_func(&mut self.store, function)
            .ok_or_else(|| PlinthError::FunctionNotFound(function.to_string()))?;
        let convention = Convention::of(function, &func.ty(&self.store))?;
        if token.is_cancelled() {
            return Err(PlinthError::Cancelled(CancelReason::Requested));
        }

        // Host regions live for one call; output is copied out before
        // the scope is released.
        self.store.data_mut().memory.begin_scope();
        let outcome = marshal::pass_input(&mut self.store, input).and_then(|input| {
            self.store.data_mut().begin_call(token, deadline);
            self.store.set_epoch_deadline(1);
            self.run(func, convention, input.offset(), input.len())
        });

        let data = self.store.data_mut();
        data.checkpoint.disarm();
        data.checkpoint.take_observed();
        data.failure = None;
        let plugin = data.plugin_id;
        let released = memory::release_scope(&mut self.store);
        debug!(%plugin, function, released, "call regions released");
        outcome
    }

    fn run(&mut self, func: Func, convention: Convention, offset: u64, length: u64) -> Result<Vec<u8>> {
        let args = [
            wasmtime::Val::I64(offset as i64),
            wasmtime::Val::I64(length as i64),
        ];
        match convention {
            Convention::Direct => {
                let mut results = [wasmtime::Val::I64(0), wasmtime::Val::I64(0)];
                func.call(&mut self.store, &args, &mut results)
                    .map_err(|err| from_trap(err, self.store.data_mut()))?;
                let offset = results[0].i64().unwrap_or(-1);
                let length = results[1].i64().unwrap_or(-1);
                marshal::collect_output(&self.store, offset, length)
            }
            Convention::Accessors { status } => {
                let mut results = if status {
                    vec![wasmtime::Val::I32(0)]
                } else {
                    Vec::new()
                };
                func.call(&mut self.store, &args, &mut results)
                    .map_err(|err| from_trap(err, self.store.data_mut()))?;
                let code = results.first().and_then(|r| r.i32()).unwrap_or(0);
                if code != 0 {
                    let message = self
                        .store
                        .data_mut()
                        .guest_error
                        .take()
                        .unwrap_or_else(|| format!("returned status {code}"));
                    return Err(PlinthError::Guest(message));
                }
                let offset = self.accessor(OUTPUT_OFFSET)?;
                let length = self.accessor(OUTPUT_LENGTH)?;
                marshal::collect_output(&self.store, offset, length)
            }
        }
    }

    fn accessor(&mut self, name: &str) -> Result<i64> {
        let func = self
            .instance
            .get_typed_func::<(), i64>(&mut self.store, name)
            .map_err(|_| {
                PlinthError::SignatureMismatch(format!(
                    "output accessor {name} is missing or is not () -> i64"
                ))
            })?;
        func.call(&mut self.store, ())
            .map_err(|err| from_trap(err, self.store.data_mut()))
    }
}

/// Bookkeeping readable while a call runs.
struct Status {
    state: ExecutionState,
    freed: bool,
    /// Set while a new store is being built.
    rebuilding: bool,
    entry: Option<Arc<CompiledModule>>,
    timeout: Option<Duration>,
    token: Option<CancellationToken>,
    last_error: Option<String>,
    output: Vec<u8>,
}

impl Status {
    fn new(entry: Arc<CompiledModule>, manifest: &Manifest) -> Self {
        Self {
            state: ExecutionState::Idle,
            freed: false,
            rebuilding: false,
            entry: Some(entry),
            timeout: manifest.timeout_ms.map(Duration::from_millis),
            token: None,
            last_error: None,
            output: Vec::new(),
        }
    }

    fn fail(&mut self, err: PlinthError) -> PlinthError {
        self.last_error = Some(err.to_string());
        err
    }
}

/// A loaded plugin: one store, one call at a time.
pub struct PluginInstance {
    id: PluginId,
    runtime: Runtime,
    status: Mutex<Status>,
    live: Mutex<Option<Live>>,
}

impl PluginInstance {
    /// Instantiates a loaded source.
    pub fn new(
        runtime: &Runtime,
        id: PluginId,
        source: LoadedSource,
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<Self> {
        let blueprint = Blueprint::new(source, functions, with_wasi);
        let live = Live::build(runtime, id, blueprint)?;
        let status = Status::new(live.entry()?, &live.blueprint.manifest);
        info!(plugin = %id, wasi = with_wasi, "plugin instantiated");

        Ok(Self {
            id,
            runtime: runtime.clone(),
            status: Mutex::new(status),
            live: Mutex::new(Some(live)),
        })
    }

    /// Identifier of the instance, stable across updates.
    pub fn id(&self) -> PluginId {
        self.id
    }

    /// Current execution state.
    pub fn state(&self) -> ExecutionState {
        self.status.lock().state
    }

    /// Message of the most recent failed operation; `None` after a success.
    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    /// Output of the most recent successful call.
    pub fn output(&self) -> Vec<u8> {
        self.status.lock().output.clone()
    }

    /// Returns true once `free` has run.
    pub fn is_freed(&self) -> bool {
        self.status.lock().freed
    }

    /// Returns true when the entry module exports `name`.
    pub fn function_exists(&self, name: &str) -> bool {
        self.status
            .lock()
            .entry
            .as_ref()
            .is_some_and(|entry| entry.has_function(name))
    }

    /// Names of the exported functions.
    pub fn functions(&self) -> Vec<String> {
        self.status
            .lock()
            .entry
            .as_ref()
            .map(|entry| entry.functions().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Calls an export with `input`, returning the bytes it produced.
    pub fn call(&self, function: &str, input: &[u8], options: &CallOptions) -> Result<Vec<u8>> {
        let token = options.token().cloned().unwrap_or_default();
        let deadline = {
            let mut status = self.status.lock();
            if status.freed {
                return Err(PlinthError::UseAfterFree(self.id));
            }
            if !status
                .entry
                .as_ref()
                .is_some_and(|entry| entry.has_function(function))
            {
                return Err(status.fail(PlinthError::FunctionNotFound(function.to_string())));
            }
            if status.rebuilding {
                return Err(PlinthError::Busy);
            }
            if status.state.is_busy() {
                return Err(PlinthError::AlreadyRunning);
            }
            if token.is_cancelled() {
                status.state = ExecutionState::Cancelled;
                return Err(status.fail(PlinthError::Cancelled(CancelReason::Requested)));
            }
            status.state = ExecutionState::Running;
            status.token = Some(token.clone());
            options
                .timeout()
                .or(status.timeout)
                .or(self.runtime.config().default_timeout())
                .map(|timeout| Instant::now() + timeout)
        };

        debug!(plugin = %self.id, function, input_len = input.len(), "call started");
        let started = Instant::now();
        let result = match self.live.lock().as_mut() {
            Some(live) => live.invoke(function, input, token, deadline),
            None => Err(PlinthError::UseAfterFree(self.id)),
        };
        self.finish(function, started, result)
    }

    fn finish(&self, function: &str, started: Instant, result: Result<Vec<u8>>) -> Result<Vec<u8>> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut status = self.status.lock();
        status.token = None;
        match result {
            Ok(output) => {
                debug!(plugin = %self.id, function, elapsed_ms, output_len = output.len(), "call completed");
                status.state = ExecutionState::Completed;
                status.last_error = None;
                status.output = output.clone();
                Ok(output)
            }
            Err(err) if err.is_cancellation() => {
                info!(plugin = %self.id, function, elapsed_ms, "call cancelled: {err}");
                status.state = ExecutionState::Cancelled;
                Err(status.fail(err))
            }
            Err(err) => {
                warn!(plugin = %self.id, function, elapsed_ms, "call failed: {err}");
                status.state = ExecutionState::Failed;
                Err(status.fail(err))
            }
        }
    }

    /// Asks the running call to stop at its next checkpoint.
    ///
    /// Returns false when no call is running.
    pub fn request_cancel(&self) -> bool {
        let mut status = self.status.lock();
        if status.state != ExecutionState::Running {
            return false;
        }
        if let Some(token) = &status.token {
            token.cancel();
        }
        status.state = ExecutionState::CancelRequested;
        debug!(plugin = %self.id, "cancellation requested");
        true
    }

    /// Replaces the module and host functions, keeping the id.
    pub fn update(&self, source: LoadedSource, functions: HostFunctions, with_wasi: bool) -> Result<()> {
        self.reinstantiate(|_| Blueprint::new(source, functions, with_wasi))?;
        info!(plugin = %self.id, "plugin updated");
        Ok(())
    }

    /// Merges a JSON object of string values into the plugin configuration.
    pub fn update_config(&self, json: &[u8]) -> Result<()> {
        let entries: BTreeMap<String, String> = serde_json::from_slice(json)
            .map_err(|err| PlinthError::Config(format!("expected an object of strings: {err}")))?;
        self.reinstantiate(|current| {
            let mut next = current.clone();
            next.config.extend(entries);
            next
        })?;
        debug!(plugin = %self.id, "plugin configuration updated");
        Ok(())
    }

    /// Builds a fresh store from a blueprint derived from the current one,
    /// swapping it in only once it is complete.
    fn reinstantiate(&self, next: impl FnOnce(&Blueprint) -> Blueprint) -> Result<()> {
        let mut live = self.live.try_lock().ok_or(PlinthError::Busy)?;
        let current = live.as_ref().ok_or(PlinthError::UseAfterFree(self.id))?;
        {
            let mut status = self.status.lock();
            if status.freed {
                return Err(PlinthError::UseAfterFree(self.id));
            }
            if status.state.is_busy() || status.rebuilding {
                return Err(PlinthError::Busy);
            }
            status.rebuilding = true;
        }
        let rebuilt = Live::build(&self.runtime, self.id, next(&current.blueprint))
            .and_then(|rebuilt| Ok((rebuilt.entry()?, rebuilt)));

        let mut status = self.status.lock();
        status.rebuilding = false;
        if status.freed {
            return Err(PlinthError::UseAfterFree(self.id));
        }
        match rebuilt {
            Ok((entry, rebuilt)) => {
                status.entry = Some(entry);
                status.timeout = rebuilt.blueprint.manifest.timeout_ms.map(Duration::from_millis);
                status.state = ExecutionState::Idle;
                status.output.clear();
                status.last_error = None;
                *live = Some(rebuilt);
                Ok(())
            }
            Err(err) => Err(status.fail(err)),
        }
    }

    /// Releases the instance. A running call is cancelled first and its
    /// store dropped once it has unwound.
    pub fn free(&self) {
        {
            let mut status = self.status.lock();
            if status.freed {
                return;
            }
            status.freed = true;
            status.entry = None;
            if let Some(token) = status.token.take() {
                token.cancel();
            }
        }
        let live = self.live.lock().take();
        drop(live);
        info!(plugin = %self.id, "plugin freed");
    }

    #[cfg(test)]
    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut Store<StoreData>) -> R) -> R {
        let mut live = self.live.lock();
        match live.as_mut() {
            Some(live) => f(&mut live.store),
            None => panic!("plugin {} has been freed", self.id),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
