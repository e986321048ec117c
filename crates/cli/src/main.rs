//! Plinth CLI - Command-line interface for the Plinth plugin runtime.

mod commands;
mod logging;
mod output;
mod source;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::Result;
use plinth_core::RuntimeConfig;

#[derive(Parser)]
#[command(name = "plinth")]
#[command(author, version, about = "Load and call WebAssembly plugins")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    runtime_config: Option<PathBuf>,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Call an exported function
    Call {
        /// Module, manifest, or directory containing one
        module: PathBuf,

        /// Function to call
        function: String,

        /// Input passed to the function
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the input from a file
        #[arg(long, value_name = "PATH")]
        input_file: Option<PathBuf>,

        /// Enable WASI
        #[arg(long)]
        wasi: bool,

        /// Cancel the call after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Plugin configuration entry
        #[arg(short, long = "config", value_name = "KEY=VALUE", value_parser = commands::call::parse_key_value)]
        config: Vec<(String, String)>,
    },

    /// List the functions a module exports
    Exports {
        /// Module, manifest, or directory containing one
        module: PathBuf,

        /// Show imports as well
        #[arg(short, long)]
        detailed: bool,
    },

    /// Check that a module compiles and its imports can be satisfied
    Validate {
        /// Module, manifest, or directory containing one
        module: PathBuf,

        /// Accept WASI imports
        #[arg(long)]
        wasi: bool,
    },

    /// Show runtime version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("{:?}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.runtime_config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Call {
            module,
            function,
            input,
            input_file,
            wasi,
            timeout_ms,
            config: entries,
        } => {
            let input = commands::call::read_input(input, input_file.as_deref())?;
            commands::call::execute(commands::call::CallArgs {
                module,
                function,
                input,
                wasi,
                timeout_ms,
                config: entries,
                runtime: config,
            })
            .await
        }

        Commands::Exports { module, detailed } => {
            commands::exports::execute(&module, detailed, config)
        }

        Commands::Validate { module, wasi } => commands::validate::execute(&module, wasi, config),

        Commands::Version => {
            commands::version::execute();
            Ok(())
        }
    }
}
