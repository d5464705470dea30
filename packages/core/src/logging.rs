use tracing_subscriber::{fmt, EnvFilter};

/// Directives used when `RUST_LOG` is unset or unparsable. sqlx logs every
/// statement at info, which drowns out sweep output.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global compact subscriber. Call once from `main`.
///
/// A second call is a no-op, so embedding tests can call it freely.
pub fn init_logging() {
    let installed = fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .compact()
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Logging initialized");
    }
}
