/// Install the global `tracing` subscriber.
///
/// Reads `RUST_LOG` (default `info`). Calling it more than once is harmless;
/// later calls leave the first subscriber in place. `verbose` raises the
/// default to `debug` when `RUST_LOG` is unset.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env))
        .with_target(false)
        .try_init();
}
