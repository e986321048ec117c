//! Plugin registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use plinth_core::{PlinthError, PluginId, Result, RuntimeConfig};
use plinth_plugin::{HostFunctions, LoadedSource, Manifest, PluginInstance, Runtime};
use tracing::{debug, info};

use crate::plugin::Plugin;

/// State shared between a [`Context`] and the [`Plugin`] handles it issued.
pub(crate) struct Shared {
    runtime: Runtime,
    plugins: RwLock<HashMap<PluginId, Arc<PluginInstance>>>,
    next_id: AtomicU64,
    error: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn resolve(&self, id: PluginId) -> Result<Arc<PluginInstance>> {
        self.plugins
            .read()
            .get(&id)
            .cloned()
            .ok_or(PlinthError::UseAfterFree(id))
    }

    /// Unregisters and frees an instance. The registry lock is released
    /// before waiting for a running call to unwind.
    pub(crate) fn remove(&self, id: PluginId) -> bool {
        let removed = self.plugins.write().remove(&id);
        match removed {
            Some(instance) => {
                instance.free();
                true
            }
            None => false,
        }
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => *self.error.lock() = None,
            Err(err) => *self.error.lock() = Some(err.to_string()),
        }
        result
    }
}

/// Owns every plugin created through it.
///
/// Dropping the context frees all of its plugins; handles that outlive it
/// fail with [`PlinthError::UseAfterFree`].
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    /// Creates a context with the default runtime configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a context with its own runtime built from `config`.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        Ok(Self::with_runtime(Runtime::new(config)?))
    }

    /// Creates a context on an existing runtime, sharing its compiled
    /// module cache.
    pub fn with_runtime(runtime: Runtime) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                plugins: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                error: Mutex::new(None),
            }),
        }
    }

    /// The runtime shared by every plugin of this context.
    pub fn runtime(&self) -> &Runtime {
        &self.shared.runtime
    }

    /// Creates a plugin from a binary module, WAT text or JSON manifest.
    pub fn create_plugin(
        &self,
        source: &[u8],
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<Plugin> {
        let loaded = self.shared.record(self.shared.runtime.load(source))?;
        self.instantiate(loaded, functions, with_wasi)
    }

    /// Creates a plugin from a module or manifest file.
    pub fn create_plugin_from_file(
        &self,
        path: &Path,
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<Plugin> {
        let loaded = self.shared.record(self.shared.runtime.load_file(path))?;
        self.instantiate(loaded, functions, with_wasi)
    }

    /// Creates a plugin from an in-memory manifest.
    pub fn create_plugin_from_manifest(
        &self,
        manifest: Manifest,
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<Plugin> {
        let loaded = self
            .shared
            .record(self.shared.runtime.load_manifest(manifest, None))?;
        self.instantiate(loaded, functions, with_wasi)
    }

    fn instantiate(
        &self,
        loaded: LoadedSource,
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<Plugin> {
        let id = PluginId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let instance = self.shared.record(PluginInstance::new(
            &self.shared.runtime,
            id,
            loaded,
            functions,
            with_wasi,
        ))?;
        self.shared.plugins.write().insert(id, Arc::new(instance));
        Ok(Plugin::new(id, Arc::downgrade(&self.shared)))
    }

    /// Replaces a plugin's module, keeping its id. Memory is discarded.
    pub fn update_plugin(
        &self,
        plugin: &Plugin,
        source: &[u8],
        functions: HostFunctions,
        with_wasi: bool,
    ) -> Result<()> {
        let instance = self.shared.resolve(plugin.id())?;
        let loaded = self.shared.record(self.shared.runtime.load(source))?;
        instance.update(loaded, functions, with_wasi)
    }

    /// Frees a plugin. Returns false if the id is unknown.
    pub fn remove_plugin(&self, id: PluginId) -> bool {
        let removed = self.shared.remove(id);
        if removed {
            debug!(plugin = %id, "plugin removed");
        }
        removed
    }

    /// Frees every plugin.
    pub fn reset(&self) {
        let drained: Vec<_> = self.shared.plugins.write().drain().collect();
        let count = drained.len();
        for (_, instance) in drained {
            instance.free();
        }
        if count > 0 {
            info!(count, "context reset");
        }
    }

    /// Last error of a plugin; `None` for unknown ids and after a success.
    pub fn last_error(&self, id: PluginId) -> Option<String> {
        self.shared.resolve(id).ok()?.last_error()
    }

    /// Last context-level error, such as a failed plugin creation.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Identifiers of the live plugins, in creation order.
    pub fn plugin_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<_> = self.shared.plugins.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of live plugins.
    pub fn len(&self) -> usize {
        self.shared.plugins.read().len()
    }

    /// Returns true when no plugin is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("plugins", &self.plugin_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use plinth_core::ExecutionState;

    #[test]
    fn test_create_and_call() {
        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(plugin.call("count_vowels", "Hello World").unwrap(), br#"{"count": 3}"#);
        assert_eq!(context.last_error(plugin.id()), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let context = Context::new().unwrap();
        let a = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        let b = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(context.plugin_ids(), vec![a.id(), b.id()]);
        assert_eq!(context.runtime().cached_modules(), 1);
    }

    #[test]
    fn test_invalid_module_records_context_error() {
        let context = Context::new().unwrap();
        let err = context
            .create_plugin(b"(module (func $broken (result i32)))", HostFunctions::new(), false)
            .unwrap_err();
        assert!(matches!(err, PlinthError::ModuleLoad(_)));
        assert!(context.error().unwrap().starts_with("Failed to load module"));
        assert!(context.is_empty());

        context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        assert_eq!(context.error(), None);
    }

    #[test]
    fn test_reset_invalidates_handles() {
        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        let id = plugin.id();
        context.reset();

        assert!(context.is_empty());
        assert!(matches!(
            plugin.call("count_vowels", "a"),
            Err(PlinthError::UseAfterFree(freed)) if freed == id
        ));
        assert!(!plugin.function_exists("count_vowels"));
        assert_eq!(context.last_error(id), None);
    }

    #[test]
    fn test_dropping_handle_removes_plugin() {
        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        let id = plugin.id();
        drop(plugin);
        assert!(context.is_empty());
        assert!(!context.remove_plugin(id));
    }

    #[test]
    fn test_handles_outliving_context() {
        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        drop(context);
        assert!(matches!(
            plugin.call("count_vowels", "a"),
            Err(PlinthError::UseAfterFree(_))
        ));
    }

    #[test]
    fn test_update_plugin_keeps_id() {
        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin(fixtures::COUNT_VOWELS.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        let id = plugin.id();

        context
            .update_plugin(&plugin, fixtures::KERNEL.as_bytes(), HostFunctions::new(), false)
            .unwrap();
        assert_eq!(plugin.id(), id);
        assert!(plugin.function_exists("echo"));
        assert_eq!(plugin.state().unwrap(), ExecutionState::Idle);

        let err = context
            .update_plugin(&plugin, b"(module (import \"env\" \"gone\" (func)))", HostFunctions::new(), false)
            .unwrap_err();
        assert!(matches!(err, PlinthError::ModuleLoad(_)));
        assert!(context.last_error(id).is_some());
        assert_eq!(plugin.call("echo", "kept").unwrap(), b"kept");
    }

    #[test]
    fn test_manifest_file_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel.wat"), fixtures::KERNEL).unwrap();
        let manifest = dir.path().join("plugin.json");
        std::fs::write(
            &manifest,
            r#"{"wasm": [{"path": "kernel.wat", "name": "main"}], "config": {"mode": "strict"}}"#,
        )
        .unwrap();

        let context = Context::new().unwrap();
        let plugin = context
            .create_plugin_from_file(&manifest, HostFunctions::new(), false)
            .unwrap();
        assert_eq!(plugin.call("get_config", "mode").unwrap(), b"strict");
    }

    #[test]
    fn test_manifest_value_source() {
        let context = Context::new().unwrap();
        let manifest = Manifest::from_wasm(fixtures::KERNEL.as_bytes()).with_config("level", "3");
        let plugin = context
            .create_plugin_from_manifest(manifest, HostFunctions::new(), false)
            .unwrap();
        assert_eq!(plugin.call("get_config", "level").unwrap(), b"3");
    }
}
