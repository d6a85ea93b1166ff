//! Diagnostic logging to stderr via `tracing-subscriber`.

use tracing_subscriber::EnvFilter;

/// Default filter directive for the given verbosity flags.
pub fn default_directive(verbose: bool, debug: bool) -> &'static str {
    if debug {
        "comicdl=trace,info"
    } else if verbose {
        "comicdl=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the flags when set. Safe to call twice;
/// the second call is a no-op.
pub fn init(verbose: bool, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, debug)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose || debug)
        .try_init();
}
