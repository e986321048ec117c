//! Plugin source discovery.

use std::path::{Path, PathBuf};

use miette::{Result, miette};

/// File names looked up, in order, when a directory is given.
const CANDIDATES: &[&str] = &["plugin.json", "plugin.wasm", "plugin.wat"];

/// Resolves a module argument to a file: either the file itself or the
/// first plugin file found in the given directory.
pub fn resolve(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(miette!("Plugin source not found: {}", path.display()));
    }

    CANDIDATES
        .iter()
        .map(|name| path.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            miette!(
                "No plugin found in {} (looked for {})",
                path.display(),
                CANDIDATES.join(", ")
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_file() {
        let dir = tempdir().unwrap();
        let module = dir.path().join("vowels.wat");
        fs::write(&module, "(module)").unwrap();

        assert_eq!(resolve(&module).unwrap(), module);
    }

    #[test]
    fn test_resolve_directory_prefers_manifest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("plugin.wasm"), b"\0asm").unwrap();
        fs::write(dir.path().join("plugin.json"), "{}").unwrap();

        assert_eq!(resolve(dir.path()).unwrap(), dir.path().join("plugin.json"));
    }

    #[test]
    fn test_resolve_directory_falls_back_to_text() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("plugin.wat"), "(module)").unwrap();

        assert_eq!(resolve(dir.path()).unwrap(), dir.path().join("plugin.wat"));
    }

    #[test]
    fn test_resolve_missing() {
        let dir = tempdir().unwrap();
        assert!(resolve(dir.path()).is_err());
        assert!(resolve(&dir.path().join("nope.wasm")).is_err());
    }
}
