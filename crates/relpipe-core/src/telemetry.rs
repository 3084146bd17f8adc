//! Log setup for the `relpipe` binary.
//!
//! Command results go to stdout (as JSON with `--json`), so logs always go
//! to stderr. A CI job can pipe stdout into a file and still see progress.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose debug output drowns the pipeline's own.
const QUIET: &[&str] = &["hyper", "reqwest", "rustls", "h2"];

/// Filter used when `RUST_LOG` is unset: `level` for relpipe, `warn` for
/// the HTTP stack used by the GitHub publisher.
pub fn default_filter(level: Level) -> EnvFilter {
    let mut directives = level.as_str().to_ascii_lowercase();
    for name in QUIET {
        directives.push_str(&format!(",{}=warn", name));
    }
    EnvFilter::new(directives)
}

/// Install the global subscriber. `json` switches stderr to one JSON object
/// per event, which is what CI log collectors expect. Only the first call
/// in a process has an effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_http_stack() {
        let filter = default_filter(Level::DEBUG).to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("reqwest=warn"));
        assert!(filter.contains("hyper=warn"));
    }
}
