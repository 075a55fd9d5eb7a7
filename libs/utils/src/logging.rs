use anyhow::Context;
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;

#[derive(
    EnumString,
    strum_macros::Display,
    Eq,
    PartialEq,
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
    Test,
}

/// Where the logging should output to.
#[derive(Clone, Copy)]
pub enum Output {
    Stdout,
    Stderr,
}

pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let rust_log_env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    use tracing_subscriber::prelude::*;
    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn std::io::Write> {
            match output {
                Output::Stdout => Box::new(std::io::stdout()),
                Output::Stderr => Box::new(std::io::stderr()),
            }
        });
    let log_layer = match log_format {
        LogFormat::Json => log_layer.json().boxed(),
        LogFormat::Plain => log_layer.boxed(),
        LogFormat::Test => log_layer.with_test_writer().boxed(),
    };
    tracing_subscriber::registry()
        .with(log_layer.with_filter(rust_log_env_filter()))
        .try_init()
        .context("Failed to install the global tracing subscriber")?;

    Ok(())
}

/// Replaces the default panic hook with one that logs the panic through `tracing`,
/// so the message lands in the same place and format as the rest of the log.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(|l| l.to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned());
        tracing::error!(
            location = location.as_deref().unwrap_or("<unknown>"),
            "panic: {}",
            payload.as_deref().unwrap_or("<non-string payload>")
        );
    }));
}
