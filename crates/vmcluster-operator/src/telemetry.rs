//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter from `RUST_LOG` when set and valid, else from `log_level`.
/// An unparsable level falls back to `info`.
pub fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init(log_level: &str) {
    let _ = fmt()
        .with_env_filter(filter(log_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        init("info");
        init("debug");
    }
}
