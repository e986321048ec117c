//! Exports command implementation.

use std::path::Path;

use console::style;
use miette::{Result, miette};
use plinth_core::RuntimeConfig;
use plinth_plugin::Runtime;

use crate::output;
use crate::source;

/// Lists the functions a module exports.
pub fn execute(module: &Path, detailed: bool, config: RuntimeConfig) -> Result<()> {
    let path = source::resolve(module)?;
    let runtime = Runtime::new(config)?;
    let loaded = runtime.load_file(&path)?;
    let entry = loaded
        .entry()
        .ok_or_else(|| miette!("{} contains no module", path.display()))?;

    println!("{}", style("Exported functions:").bold());
    println!();
    for name in entry.functions() {
        println!("  {}", style(name).cyan());
    }

    if detailed {
        output::section_header("Imports");
        let imports = entry.imports();
        if imports.is_empty() {
            println!("  {}", style("(none)").dim());
        }
        for (namespace, name) in imports {
            output::list_item(&format!("{}::{}", namespace, name));
        }

        output::section_header("Module");
        output::key_value("hash", &entry.hash());
        output::key_value("path", &path.display().to_string());
    }

    Ok(())
}
