//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target used for "skipped" events, which sit between debug and info.
pub const SKIP_TARGET: &str = "proxsave::skip";

/// Emit an event for an expected, non-fatal skip.
///
/// Events are INFO-level under [`SKIP_TARGET`], so `RUST_LOG=proxsave::skip=off`
/// silences them without hiding the rest of the info stream.
#[macro_export]
macro_rules! skip {
    ($($arg:tt)+) => {
        ::tracing::info!(target: "proxsave::skip", $($arg)+)
    };
}

/// Initialize logging with the specified level
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}
