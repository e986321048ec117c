//! Call command implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use miette::{IntoDiagnostic, Result, WrapErr};
use plinth_core::RuntimeConfig;
use plinth_engine::{CallOptions, CancellationToken, Context};
use plinth_plugin::HostFunctions;
use tracing::debug;

use crate::output;
use crate::source;

/// Arguments of `plinth call`.
pub struct CallArgs {
    pub module: PathBuf,
    pub function: String,
    pub input: Vec<u8>,
    pub wasi: bool,
    pub timeout_ms: Option<u64>,
    pub config: Vec<(String, String)>,
    pub runtime: RuntimeConfig,
}

/// Parses a `KEY=VALUE` configuration entry.
pub fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Reads call input from the inline argument or a file.
pub fn read_input(inline: Option<String>, file: Option<&Path>) -> Result<Vec<u8>> {
    match (inline, file) {
        (Some(text), _) => Ok(text.into_bytes()),
        (None, Some(path)) => std::fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Cannot read input file {}", path.display())),
        (None, None) => Ok(Vec::new()),
    }
}

/// Calls a plugin function and writes its output to stdout.
pub async fn execute(args: CallArgs) -> Result<()> {
    let path = source::resolve(&args.module)?;
    let context = Context::with_config(args.runtime)?;
    let plugin = context.create_plugin_from_file(&path, HostFunctions::new(), args.wasi)?;

    if !args.config.is_empty() {
        let entries: BTreeMap<_, _> = args.config.into_iter().collect();
        let json = serde_json::to_vec(&entries).into_diagnostic()?;
        plugin.update_config(json)?;
    }

    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received, cancelling call");
                token.cancel();
            }
        })
    };

    let mut options = CallOptions::new().with_token(token);
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let spinner = output::call_spinner(&args.function);
    let started = Instant::now();
    let result = plugin.call_async(&args.function, args.input, options).await;
    let elapsed_ms = started.elapsed().as_millis();
    interrupt.abort();

    match result {
        Ok(bytes) => {
            output::spinner_success(
                &spinner,
                &format!("{} returned {} bytes ({}ms)", args.function, bytes.len(), elapsed_ms),
            );
            output::payload(&bytes).into_diagnostic()?;
            Ok(())
        }
        Err(err) if err.is_cancellation() => {
            output::spinner_cancelled(&spinner, &format!("{} {}", args.function, err));
            Err(err.into())
        }
        Err(err) => {
            output::spinner_failure(&spinner, &format!("{} failed", args.function));
            Err(err.into())
        }
    }
}
