//! Tracing setup

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, honouring `RUST_LOG` when set.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

/// Shorten a secret-bearing value for log fields
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(6).collect();
    format!("{}…", prefix)
}
