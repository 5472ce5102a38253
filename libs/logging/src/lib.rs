//! Logging setup for the split-tunnel router.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Registers a global subscriber with stdout logging.
pub fn setup_global_subscriber(directives: &str) -> Result<()> {
    let subscriber = Registry::default().with(
        tracing_subscriber::fmt::layer().with_filter(parse_filter(directives)?),
    );

    tracing::subscriber::set_global_default(subscriber)
        .context("Could not set global default")?;

    Ok(())
}

/// Scoped subscriber for tests; logs are emitted while the guard is alive.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(directives)
        .with_test_writer()
        .set_default()
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
///
/// A catch-all directive like `debug` would otherwise drown the interesting
/// logs in smoltcp socket chatter. Restate a crate with a lower filter to
/// re-enable it, e.g. `smoltcp=trace`.
fn parse_filter(directives: &str) -> Result<EnvFilter> {
    const IRRELEVANT_CRATES: &str = "smoltcp=warn,boringtun=warn";

    let filter = if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
    }
    .context("Failed to parse filter directives")?;

    Ok(filter)
}
