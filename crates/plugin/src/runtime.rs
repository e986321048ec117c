//! WASM runtime using wasmtime.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use plinth_core::{Result, RuntimeConfig};
use tracing::{debug, info};
use wasmtime::{Config, Engine, ExternType, Module};

use crate::checkpoint::EpochTicker;
use crate::error::module_load;
use crate::manifest::Manifest;

/// What kind of bytes a plugin source holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A binary module (`\0asm`).
    Binary,
    /// WebAssembly text.
    Text,
    /// A JSON manifest.
    Manifest,
}

impl SourceKind {
    /// Detects the kind of a source from its leading bytes.
    pub fn detect(source: &[u8]) -> Self {
        if source.starts_with(b"\0asm") {
            return SourceKind::Binary;
        }
        match source.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => SourceKind::Manifest,
            _ => SourceKind::Text,
        }
    }
}

/// A compiled module shared by every instance created from it.
#[derive(Debug)]
pub struct CompiledModule {
    module: Module,
    hash: blake3::Hash,
    functions: BTreeSet<String>,
}

impl CompiledModule {
    fn new(module: Module, hash: blake3::Hash) -> Self {
        let functions = module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect();
        Self {
            module,
            hash,
            functions,
        }
    }

    /// The wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// BLAKE3 hash of the module bytes, as hex.
    pub fn hash(&self) -> String {
        self.hash.to_hex().to_string()
    }

    /// Names of the exported functions.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    /// Returns true when the module exports a function named `name`.
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    /// `(namespace, name)` of every import.
    pub fn imports(&self) -> Vec<(String, String)> {
        self.module
            .imports()
            .map(|import| (import.module().to_string(), import.name().to_string()))
            .collect()
    }
}

/// Compiled modules of one plugin source; the entry module is last.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub(crate) modules: Vec<(Option<String>, Arc<CompiledModule>)>,
    pub(crate) manifest: Manifest,
}

impl LoadedSource {
    /// The module calls are made against.
    pub fn entry(&self) -> Option<&Arc<CompiledModule>> {
        self.modules.last().map(|(_, module)| module)
    }

    /// The manifest the source was described by.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

struct RuntimeInner {
    engine: Engine,
    config: RuntimeConfig,
    modules: Mutex<HashMap<blake3::Hash, Weak<CompiledModule>>>,
    _ticker: EpochTicker,
}

/// Shared engine plus compiled-module cache.
///
/// Cloning is cheap; every clone refers to the same engine and epoch
/// ticker, which stops once the last clone is dropped.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a new runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config).map_err(|err| module_load("cannot create engine", err))?;
        let ticker = EpochTicker::start(engine.clone(), config.epoch_tick())?;
        info!(tick_ms = config.epoch_tick_ms, "runtime started");

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                engine,
                config,
                modules: Mutex::new(HashMap::new()),
                _ticker: ticker,
            }),
        })
    }

    /// The wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Compiles binary or text module bytes, reusing a live compilation of
    /// identical bytes when one exists.
    pub fn compile(&self, bytes: &[u8]) -> Result<Arc<CompiledModule>> {
        let hash = blake3::hash(bytes);
        let caching = self.inner.config.cache_modules;

        if caching {
            if let Some(module) = self.inner.modules.lock().get(&hash).and_then(Weak::upgrade) {
                debug!(hash = %hash.to_hex(), "module cache hit");
                return Ok(module);
            }
        }

        let module = Module::new(&self.inner.engine, bytes)
            .map_err(|err| module_load("cannot compile module", err))?;
        let compiled = Arc::new(CompiledModule::new(module, hash));
        debug!(hash = %hash.to_hex(), "module compiled");

        if caching {
            let mut cache = self.inner.modules.lock();
            cache.retain(|_, module| module.strong_count() > 0);
            cache.insert(hash, Arc::downgrade(&compiled));
        }
        Ok(compiled)
    }

    /// Number of compiled modules currently shared through the cache.
    pub fn cached_modules(&self) -> usize {
        self.inner
            .modules
            .lock()
            .values()
            .filter(|module| module.strong_count() > 0)
            .count()
    }

    /// Loads a plugin source: a binary module, WAT text or a JSON manifest.
    pub fn load(&self, source: &[u8]) -> Result<LoadedSource> {
        match SourceKind::detect(source) {
            SourceKind::Manifest => self.load_manifest(Manifest::from_json(source)?, None),
            SourceKind::Binary | SourceKind::Text => Ok(LoadedSource {
                modules: vec![(None, self.compile(source)?)],
                manifest: Manifest::default(),
            }),
        }
    }

    /// Loads a manifest file, resolving relative module paths against it.
    pub fn load_file(&self, path: &Path) -> Result<LoadedSource> {
        let bytes = std::fs::read(path)?;
        match SourceKind::detect(&bytes) {
            SourceKind::Manifest => {
                let (manifest, base_dir) = Manifest::from_file(path)?;
                self.load_manifest(manifest, Some(&base_dir))
            }
            _ => self.load(&bytes),
        }
    }

    /// Compiles every module a manifest lists.
    pub fn load_manifest(&self, manifest: Manifest, base_dir: Option<&Path>) -> Result<LoadedSource> {
        let modules = manifest
            .resolve(base_dir)?
            .into_iter()
            .map(|resolved| Ok((resolved.name, self.compile(&resolved.bytes)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(LoadedSource { modules, manifest })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::manifest::WasmSource;
    use plinth_core::PlinthError;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_detect_source_kind() {
        assert_eq!(SourceKind::detect(b"\0asm\x01\0\0\0"), SourceKind::Binary);
        assert_eq!(SourceKind::detect(b"  \n{\"wasm\": []}"), SourceKind::Manifest);
        assert_eq!(SourceKind::detect(b"(module)"), SourceKind::Text);
        assert_eq!(SourceKind::detect(b""), SourceKind::Text);
    }

    #[test]
    fn test_compile_lists_exports() {
        let module = runtime().compile(fixtures::COUNT_VOWELS.as_bytes()).unwrap();
        assert!(module.has_function("count_vowels"));
        assert!(!module.has_function("memory"));
        assert_eq!(module.hash().len(), 64);
    }

    #[test]
    fn test_invalid_module_is_a_load_error() {
        let err = runtime().compile(b"(module (func (export \"f\") (result i32)))").unwrap_err();
        assert!(matches!(err, PlinthError::ModuleLoad(_)));
    }

    #[test]
    fn test_identical_bytes_share_one_compilation() {
        let runtime = runtime();
        let first = runtime.compile(fixtures::COUNT_VOWELS.as_bytes()).unwrap();
        let second = runtime.compile(fixtures::COUNT_VOWELS.as_bytes()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.cached_modules(), 1);

        drop(first);
        drop(second);
        assert_eq!(runtime.cached_modules(), 0);
    }

    #[test]
    fn test_cache_can_be_disabled() {
        let runtime = Runtime::new(RuntimeConfig::default().with_module_cache(false)).unwrap();
        let first = runtime.compile(fixtures::COUNT_VOWELS.as_bytes()).unwrap();
        let second = runtime.compile(fixtures::COUNT_VOWELS.as_bytes()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_load_manifest_source() {
        let manifest = Manifest {
            wasm: vec![WasmSource::data(fixtures::COUNT_VOWELS.as_bytes())],
            ..Manifest::default()
        }
        .with_config("greeting", "hi");
        let json = manifest.to_json().unwrap();

        let loaded = runtime().load(json.as_bytes()).unwrap();
        assert!(loaded.entry().unwrap().has_function("count_vowels"));
        assert_eq!(loaded.manifest().config["greeting"], "hi");
    }

    #[test]
    fn test_load_manifest_file_with_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vowels.wat"), fixtures::COUNT_VOWELS).unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            r#"{"wasm": [{"path": "vowels.wat"}]}"#,
        )
        .unwrap();

        let loaded = runtime().load_file(&dir.path().join("plugin.json")).unwrap();
        assert!(loaded.entry().unwrap().has_function("count_vowels"));
    }
}
