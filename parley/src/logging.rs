//! Operator diagnostics on stderr.
//!
//! Tracing shares stderr with streamed agent text, so it stays at `warn`
//! unless asked for. The durable run record is the audit log (`io/audit`),
//! which is written whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directives, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PARLEY_LOG";

/// Directive for `-v` repeated `verbose` times when no env filter is set.
///
/// ```bash
/// parley -vv run "add a health check"          # parley=debug
/// PARLEY_LOG=parley::providers=trace parley run "..."
/// ```
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,parley=info",
        2 => "warn,parley=debug",
        _ => "warn,parley=trace",
    }
}

fn filter(verbose: u8) -> EnvFilter {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(verbose)))
}

/// Install the stderr subscriber. Call once, before the first span.
pub fn init(verbose: u8) {
    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 1)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_widens_only_parley_targets() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "warn,parley=info");
        assert_eq!(default_directive(7), "warn,parley=trace");
        for verbose in 0..4 {
            assert!(EnvFilter::try_new(default_directive(verbose)).is_ok());
        }
    }
}
