//! Plugin manifest: module sources plus runtime configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use plinth_core::{PlinthError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declarative description of one or more modules and their configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Modules to load. The one named `main`, or else the last, is the entry.
    pub wasm: Vec<WasmSource>,

    /// Linear memory limits.
    #[serde(default)]
    pub memory: MemoryOptions,

    /// Key-value configuration readable by the guest.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Hosts that host functions may contact on the guest's behalf.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Directories preopened for WASI, keyed by guest path.
    #[serde(default)]
    pub allowed_paths: BTreeMap<String, PathBuf>,

    /// Timeout applied to every call of this plugin.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Linear memory limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryOptions {
    /// Maximum number of 64 KiB pages.
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// Where a module's bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WasmSource {
    /// A file on disk, relative paths resolve against the manifest.
    Path {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },

    /// Inline base64 data.
    Data {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },

    /// A remote module. Listed for schema compatibility; never fetched.
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
}

/// Module bytes resolved from a [`WasmSource`].
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

impl WasmSource {
    /// Creates an inline source from raw bytes.
    pub fn data(bytes: &[u8]) -> Self {
        WasmSource::Data {
            data: BASE64.encode(bytes),
            name: None,
            hash: None,
        }
    }

    /// Creates a file source.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        WasmSource::Path {
            path: path.into(),
            name: None,
            hash: None,
        }
    }

    /// Sets the link name of the module.
    pub fn with_name(mut self, new_name: impl Into<String>) -> Self {
        match &mut self {
            WasmSource::Path { name, .. }
            | WasmSource::Data { name, .. }
            | WasmSource::Url { name, .. } => *name = Some(new_name.into()),
        }
        self
    }

    /// Sets the expected SHA-256 of the module bytes.
    pub fn with_hash(mut self, expected: impl Into<String>) -> Self {
        match &mut self {
            WasmSource::Path { hash, .. }
            | WasmSource::Data { hash, .. }
            | WasmSource::Url { hash, .. } => *hash = Some(expected.into()),
        }
        self
    }

    /// Name the module is linked under, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            WasmSource::Path { name, .. }
            | WasmSource::Data { name, .. }
            | WasmSource::Url { name, .. } => name.as_deref(),
        }
    }

    fn hash(&self) -> Option<&str> {
        match self {
            WasmSource::Path { hash, .. }
            | WasmSource::Data { hash, .. }
            | WasmSource::Url { hash, .. } => hash.as_deref(),
        }
    }

    /// Loads the bytes and checks them against the declared hash.
    pub fn resolve(&self, base_dir: Option<&Path>) -> Result<ResolvedModule> {
        let bytes = match self {
            WasmSource::Path { path, .. } => {
                let full = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                std::fs::read(&full).map_err(|e| {
                    PlinthError::ModuleLoad(format!("cannot read {}: {}", full.display(), e))
                })?
            }
            WasmSource::Data { data, .. } => BASE64
                .decode(data.trim())
                .map_err(|e| PlinthError::ModuleLoad(format!("invalid base64 data: {}", e)))?,
            WasmSource::Url { url, .. } => {
                return Err(PlinthError::ModuleLoad(format!(
                    "remote module sources are not fetched: {}",
                    url
                )));
            }
        };

        if let Some(expected) = self.hash() {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(PlinthError::ModuleLoad(format!(
                    "hash mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        Ok(ResolvedModule {
            name: self.name().map(str::to_string),
            bytes,
        })
    }
}

impl Manifest {
    /// Creates a manifest with a single inline module.
    pub fn from_wasm(bytes: &[u8]) -> Self {
        Self {
            wasm: vec![WasmSource::data(bytes)],
            ..Self::default()
        }
    }

    /// Loads a manifest from a JSON file. Relative module paths resolve
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<(Self, PathBuf)> {
        let content = std::fs::read(path)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((Self::from_json(&content)?, base))
    }

    /// Parses a manifest from JSON bytes.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json)
            .map_err(|e| PlinthError::ModuleLoad(format!("invalid manifest: {}", e)))
    }

    /// Converts the manifest to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PlinthError::ModuleLoad(format!("cannot encode manifest: {}", e)))
    }

    /// Adds a configuration value.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Allows a host pattern (`example.com`, `*.example.com` or `*`).
    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    /// Sets the memory page limit.
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.memory.max_pages = Some(pages);
        self
    }

    /// Resolves every module source, entry module last.
    pub fn resolve(&self, base_dir: Option<&Path>) -> Result<Vec<ResolvedModule>> {
        if self.wasm.is_empty() {
            return Err(PlinthError::ModuleLoad(
                "manifest lists no modules".to_string(),
            ));
        }

        let mut modules = self
            .wasm
            .iter()
            .map(|source| source.resolve(base_dir))
            .collect::<Result<Vec<_>>>()?;

        if let Some(main) = modules
            .iter()
            .position(|m| m.name.as_deref() == Some("main"))
        {
            let entry = modules.remove(main);
            modules.push(entry);
        }
        Ok(modules)
    }

    /// Returns true if `host` matches an allowed host pattern.
    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            if pattern == "*" {
                return true;
            }
            match pattern.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
                None => host == pattern,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_manifest() {
        let json = br#"{
            "wasm": [{"path": "plugin.wasm", "name": "main"}],
            "memory": {"max_pages": 4},
            "config": {"greeting": "hi"},
            "allowed_hosts": ["*.example.com"],
            "allowed_paths": {"/data": "/tmp/data"}
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.wasm.len(), 1);
        assert_eq!(manifest.wasm[0].name(), Some("main"));
        assert_eq!(manifest.memory.max_pages, Some(4));
        assert_eq!(manifest.config["greeting"], "hi");
        assert_eq!(manifest.allowed_paths["/data"], PathBuf::from("/tmp/data"));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Manifest::from_json(br#"{"wasm": [], "plugins": 1}"#).unwrap_err();
        assert!(matches!(err, PlinthError::ModuleLoad(_)));
    }

    #[test]
    fn test_resolve_data_with_hash() {
        let bytes = b"(module)";
        let hash = hex::encode(Sha256::digest(bytes));
        let manifest = Manifest {
            wasm: vec![WasmSource::data(bytes).with_hash(hash.to_uppercase())],
            ..Manifest::default()
        };

        let modules = manifest.resolve(None).unwrap();
        assert_eq!(modules[0].bytes, bytes);
    }

    #[test]
    fn test_resolve_hash_mismatch() {
        let manifest = Manifest {
            wasm: vec![WasmSource::data(b"(module)").with_hash("00")],
            ..Manifest::default()
        };
        let err = manifest.resolve(None).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.wat"), "(module)").unwrap();
        let manifest_path = dir.path().join("plugin.json");
        std::fs::write(&manifest_path, r#"{"wasm": [{"path": "a.wat"}]}"#).unwrap();

        let (manifest, base) = Manifest::from_file(&manifest_path).unwrap();
        let modules = manifest.resolve(Some(&base)).unwrap();
        assert_eq!(modules[0].bytes, b"(module)");
    }

    #[test]
    fn test_url_sources_are_rejected() {
        let manifest: Manifest =
            Manifest::from_json(br#"{"wasm": [{"url": "https://example.com/p.wasm"}]}"#).unwrap();
        assert!(manifest.resolve(None).is_err());
        assert!(Manifest::default().resolve(None).is_err());
    }

    #[test]
    fn test_main_module_is_last() {
        let manifest = Manifest {
            wasm: vec![
                WasmSource::data(b"1").with_name("main"),
                WasmSource::data(b"2").with_name("lib"),
            ],
            ..Manifest::default()
        };
        let modules = manifest.resolve(None).unwrap();
        assert_eq!(modules[1].name.as_deref(), Some("main"));
        assert_eq!(modules[0].name.as_deref(), Some("lib"));
    }

    #[test]
    fn test_allowed_hosts() {
        let manifest = Manifest::default()
            .with_allowed_host("api.example.com")
            .with_allowed_host("*.internal.net");

        assert!(manifest.allows_host("api.example.com"));
        assert!(manifest.allows_host("API.example.com"));
        assert!(!manifest.allows_host("example.com"));
        assert!(manifest.allows_host("db.internal.net"));
        assert!(!manifest.allows_host("internal.net"));
        assert!(!manifest.allows_host("evilinternal.net"));
        assert!(Manifest::default().with_allowed_host("*").allows_host("anything"));
    }

    #[test]
    fn test_serialize_manifest() {
        let manifest = Manifest::from_wasm(b"\0asm").with_config("k", "v");
        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed, manifest);
    }
}
