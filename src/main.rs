use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use quickjs_worker::config::WorkerConfig;
use quickjs_worker::dispatch::Dispatcher;
use quickjs_worker::wire::{Emitter, ErrorCode};
use quickjs_worker::{WorkerRuntime, limits};

const ENV_HELP: &str = "\u{001b}[1;4mEnvironment:\u{001b}[0m
  WORKER_ID            id used for the ready record (default: worker-<pid>)
  BUNDLE_PATH          path to the JavaScript bundle (required)
  ALLOW_FILESYSTEM     presence grants the filesystem capability
  ALLOW_NETWORK        presence grants the network capability
  ALLOW_CHILD_PROCESS  presence grants the child-process capability
  ALLOW_EVAL           presence keeps eval/Function available to the bundle
  MAX_MEMORY           address-space soft limit in bytes (0 or unset: none)
  MAX_FDS              open-file soft limit (0 or unset: none)
  CAPABILITIES         reserved
  RUST_LOG             stderr diagnostic verbosity (default: info)

The supervisor writes invoke records to the worker's stdin as NDJSON and
reads ready, response, log and error records back from its stdout, one
JSON object per line. Operator diagnostics go to stderr.
";

/// Host a single JavaScript bundle and serve HTTP-shaped invocations as
/// NDJSON records over stdin/stdout.
///
/// Configuration is read from the environment once at startup; the
/// command line carries no options beyond the conventional flags.
#[derive(Parser)]
#[command(version, about)]
#[clap(after_help = ENV_HELP)]
struct Cli {}

fn main() -> Result<()> {
    let Cli {} = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = WorkerConfig::from_env()?;

    // Lower the rlimits before the engine exists so the caps apply to
    // everything the runtime allocates.
    limits::apply(&config.capabilities);

    let emitter = Emitter::stdout();
    let mut runtime = WorkerRuntime::new(&config.capabilities, &emitter)?;

    if let Err(err) = runtime.load_bundle(&config.bundle_path) {
        error!(
            "failed to load bundle {}: {err:#}",
            config.bundle_path.display()
        );
        emitter.error(
            "bundle-load",
            ErrorCode::BundleLoadError,
            "Failed to load bundle",
        );
        std::process::exit(1);
    }

    emitter.ready(&config.worker_id);

    Dispatcher::new(runtime, emitter).serve(std::io::stdin().lock());

    Ok(())
}
