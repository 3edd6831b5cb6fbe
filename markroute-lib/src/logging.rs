use tracing_subscriber::EnvFilter;

pub const ENV_VAR_LOG_LEVEL: &str = "LOGLEVEL";

const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global subscriber. The filter comes from `LOGLEVEL`
/// (`tracing` directive syntax), defaulting to `info`. Output goes to
/// stderr so a service manager can capture it.
pub fn init() {
    let filter = EnvFilter::try_from_env(ENV_VAR_LOG_LEVEL)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
