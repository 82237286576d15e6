//! Tracing initialization shared by every binary.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Default directive when `RUST_LOG` is unset: our crates at debug, the
/// websocket stack quiet.
const DEFAULT_FILTER: &str = "info,voicelink=debug,tungstenite=warn,tokio_tungstenite=warn";

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Log lines go to stderr so PCM or
/// other payload output on stdout stays clean.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.should_color_stderr())
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
