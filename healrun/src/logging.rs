//! Stderr diagnostics for whoever is debugging healrun itself.
//!
//! Nothing here reaches a project: the conversation log
//! (`.healrun/conversations/<slug>.jsonl`) and the UI snapshots
//! (`.healrun/state/<slug>.json`) are written by the engine whatever
//! `RUST_LOG` says, and tracing output is never persisted.
//!
//! ```bash
//! RUST_LOG=healrun::engine=debug,healrun::core::json_repair=debug healrun exec --project demo
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset or unparsable.
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the compact stderr subscriber. Call once, from `main`.
pub fn init() {
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
