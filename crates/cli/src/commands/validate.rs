//! Validate command implementation.

use std::path::Path;

use miette::{Result, miette};
use plinth_core::RuntimeConfig;
use plinth_plugin::Runtime;

use crate::output;

/// Namespace of the runtime's built-in imports.
const BUILTIN_NAMESPACE: &str = "plinth";

/// Namespace of WASI preview 1 imports.
const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";

/// Imports the runtime cannot satisfy without host functions.
pub fn host_imports(imports: &[(String, String)], wasi: bool) -> Vec<String> {
    imports
        .iter()
        .filter(|(namespace, _)| {
            namespace != BUILTIN_NAMESPACE && !(wasi && namespace == WASI_NAMESPACE)
        })
        .map(|(namespace, name)| format!("{}::{}", namespace, name))
        .collect()
}

/// Compiles a module and reports the imports it needs from the host.
pub fn execute(module: &Path, wasi: bool, config: RuntimeConfig) -> Result<()> {
    let path = crate::source::resolve(module)?;
    output::info(&format!("Validating {}...", path.display()));

    let runtime = Runtime::new(config)?;
    let loaded = match runtime.load_file(&path) {
        Ok(loaded) => loaded,
        Err(e) => {
            output::error(&format!("{}", e));
            return Err(miette!("Validation failed: {}", e));
        }
    };
    let entry = loaded
        .entry()
        .ok_or_else(|| miette!("Validation failed: no module"))?;

    let imports = entry.imports();
    let required = host_imports(&imports, wasi);
    for import in &required {
        output::warning(&format!("Requires host function {}", import));
    }

    output::success(&format!(
        "Module is valid ({} exports, {} imports)",
        entry.functions().count(),
        imports.len()
    ));

    Ok(())
}
