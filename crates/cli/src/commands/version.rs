//! Version command implementation.

use console::style;

use crate::output;

/// Prints the runtime version and execution engine.
pub fn execute() {
    println!("{} {}", style("plinth").bold(), plinth_core::version());
    output::key_value("engine", plinth_core::ENGINE);
}
