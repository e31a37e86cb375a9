// Observability
// Structured logging setup for the broker. One initialization at startup;
// everything else logs through `tracing` macros at the call sites.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with default verbosity.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
///
/// Quiet wins over everything, including `RUST_LOG`: error-only output.
/// Verbose shows broker debug plus dependency info. The default shows
/// broker info and dependency warnings, overridable through `RUST_LOG`.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("reserva=debug,info")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reserva=info,warn"))
    } else {
        EnvFilter::new("reserva=info,warn")
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("reserva observability initialized");
            }
            Ok(())
        }
        // Already initialized, which is fine in test environments.
        Err(_) => Ok(()),
    }
}
