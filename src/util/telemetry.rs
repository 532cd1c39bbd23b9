//! Tracing bootstrap helper.

/// Install an env-filter `fmt` subscriber unless the embedding application
/// has already set a dispatcher of its own.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
