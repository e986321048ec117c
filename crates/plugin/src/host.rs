//! Host functions exposed to WASM plugins.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use plinth_core::{PlinthError, PluginId, Result, Val, ValType};
use wasmtime::{Caller, Engine, FuncType, Linker};

use crate::error::{module_load, trap_with};
use crate::kernel;
use crate::marshal;
use crate::memory::{self, MemoryHandle};
use crate::store::StoreData;

/// Opaque data handed back to a host callback on every invocation.
pub type UserData = Arc<dyn Any + Send + Sync>;

type Callback =
    dyn Fn(&mut CurrentPlugin<'_>, &[Val], Option<&UserData>) -> anyhow::Result<Vec<Val>>
        + Send
        + Sync;

/// A host-implemented function importable by guests.
#[derive(Clone)]
pub struct HostFunction {
    namespace: String,
    name: String,
    params: Vec<ValType>,
    results: Vec<ValType>,
    callback: Arc<Callback>,
    user_data: Option<UserData>,
}

impl HostFunction {
    /// Creates a function importable as `namespace::name`.
    pub fn new<F>(
        namespace: impl Into<String>,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        callback: F,
    ) -> Self
    where
        F: Fn(&mut CurrentPlugin<'_>, &[Val], Option<&UserData>) -> anyhow::Result<Vec<Val>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
            callback: Arc::new(callback),
            user_data: None,
        }
    }

    /// Creates a function in the default `env` namespace.
    pub fn env<F>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        callback: F,
    ) -> Self
    where
        F: Fn(&mut CurrentPlugin<'_>, &[Val], Option<&UserData>) -> anyhow::Result<Vec<Val>>
            + Send
            + Sync
            + 'static,
    {
        Self::new("env", name, params, results, callback)
    }

    /// Attaches data handed to every invocation of the callback.
    pub fn with_user_data(mut self, data: impl Any + Send + Sync) -> Self {
        self.user_data = Some(Arc::new(data));
        self
    }

    /// Import namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Import name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter types.
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    /// Declared result types.
    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// `namespace::name`, as used in error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// The set of host functions offered to one plugin.
#[derive(Debug, Clone, Default)]
pub struct HostFunctions {
    functions: Vec<HostFunction>,
}

impl HostFunctions {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function; names are unique per namespace.
    pub fn register(&mut self, function: HostFunction) -> Result<()> {
        let taken = (function.namespace == kernel::NAMESPACE
            && kernel::is_builtin(&function.name))
            || self.get(&function.namespace, &function.name).is_some();
        if taken {
            return Err(PlinthError::DuplicateFunction {
                namespace: function.namespace,
                name: function.name,
            });
        }
        self.functions.push(function);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, function: HostFunction) -> Result<Self> {
        self.register(function)?;
        Ok(self)
    }

    /// Looks up a function by its import name.
    pub fn get(&self, namespace: &str, name: &str) -> Option<&HostFunction> {
        self.functions
            .iter()
            .find(|f| f.namespace == namespace && f.name == name)
    }

    /// Functions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.functions.iter()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Freezes the set into the dispatch table an instance links against.
    pub(crate) fn into_table(self) -> Arc<[HostFunction]> {
        self.functions.into()
    }
}

/// View of the calling plugin, valid only while a host callback runs.
pub struct CurrentPlugin<'a> {
    caller: Caller<'a, StoreData>,
}

impl CurrentPlugin<'_> {
    /// Identifier of the calling plugin.
    pub fn id(&self) -> PluginId {
        self.caller.data().plugin_id
    }

    /// Allocates a region in guest memory.
    pub fn alloc(&mut self, length: u64) -> Result<MemoryHandle> {
        memory::allocate(&mut self.caller, length)
    }

    /// Allocates a region and fills it with `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<MemoryHandle> {
        marshal::pass_input(&mut self.caller, bytes)
    }

    /// Releases a region allocated by the host.
    pub fn free(&mut self, handle: MemoryHandle) -> Result<()> {
        memory::free(&mut self.caller, handle)
    }

    /// Copies `bytes` into a live region.
    pub fn write(&mut self, handle: MemoryHandle, bytes: &[u8]) -> Result<()> {
        memory::write(&mut self.caller, handle, bytes)
    }

    /// Reads any range inside the guest's memory.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        memory::read(&self.caller, offset, length)
    }

    /// Reads the whole of a region.
    pub fn read_handle(&self, handle: MemoryHandle) -> Result<Vec<u8>> {
        self.read(handle.offset(), handle.len())
    }

    /// Looks up a host-allocated region by its offset.
    pub fn handle_at(&self, offset: u64) -> Option<MemoryHandle> {
        memory::length_of(&self.caller, offset).map(|length| MemoryHandle::new(offset, length))
    }

    /// Current size of guest memory in bytes.
    pub fn memory_len(&self) -> u64 {
        memory::extent(&self.caller)
    }

    /// Value of a plugin configuration key.
    pub fn config(&self, key: &str) -> Option<String> {
        self.caller.data().config.get(key).cloned()
    }

    /// Returns true when the manifest allows requests to `host`.
    pub fn allows_host(&self, host: &str) -> bool {
        self.caller.data().manifest.allows_host(host)
    }

    /// Sets the message reported if the current export returns a failure
    /// status.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.caller.data_mut().guest_error = Some(message.into());
    }
}

/// Links every function of the dispatch table into `linker`.
pub(crate) fn link(
    linker: &mut Linker<StoreData>,
    engine: &Engine,
    table: &[HostFunction],
) -> Result<()> {
    for (index, function) in table.iter().enumerate() {
        let ty = FuncType::new(
            engine,
            function.params.iter().map(|t| marshal::to_wasm_type(*t)),
            function.results.iter().map(|t| marshal::to_wasm_type(*t)),
        );
        linker
            .func_new(&function.namespace, &function.name, ty, move |caller, args, results| {
                dispatch(caller, index, args, results)
            })
            .map_err(|err| module_load(&format!("cannot link {}", function.qualified_name()), err))?;
    }
    Ok(())
}

fn dispatch(
    caller: Caller<'_, StoreData>,
    index: usize,
    args: &[wasmtime::Val],
    results: &mut [wasmtime::Val],
) -> wasmtime::Result<()> {
    let table = caller.data().functions.clone();
    let mut current = CurrentPlugin { caller };
    let outcome = match table.get(index) {
        Some(function) => invoke(&mut current, function, args, results),
        None => Err(PlinthError::FunctionNotFound(format!("host function #{index}"))),
    };
    outcome.map_err(|err| trap_with(current.caller.data_mut(), err))
}

fn invoke(
    current: &mut CurrentPlugin<'_>,
    function: &HostFunction,
    args: &[wasmtime::Val],
    results: &mut [wasmtime::Val],
) -> Result<()> {
    let qualified = function.qualified_name();
    let values = marshal::decode_args(&qualified, &function.params, args)?;
    let returned = (function.callback)(current, &values, function.user_data.as_ref())
        .map_err(|err| PlinthError::HostFunction {
            function: qualified.clone(),
            message: format!("{err:#}"),
        })?;
    marshal::encode_results(&qualified, &function.results, &returned, results)
}
