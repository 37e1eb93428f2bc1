//! Logging setup

/// Initialize `env_logger`, using `default_filter` when `RUST_LOG` is unset
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
