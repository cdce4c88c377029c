use tracing_subscriber::EnvFilter;


static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
});

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, once per test binary.
pub fn enable_logger() {
  *LOGGER_INIT;
}
