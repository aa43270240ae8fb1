use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

pub fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init() -> Result<()> {
    let fmt_layer = fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .try_init()
        .context("installing tracing subscriber")
}
