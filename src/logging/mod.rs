//! Structured logging setup

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build filter directives from the logging config: the base level plus any
/// per-component overrides, e.g. `info,hestia::startup=debug`.
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let mut filter = config.level.clone();
    if let Some(components) = &config.component_levels {
        for (component, level) in components {
            filter.push_str(&format!(",hestia::{component}={level}"));
        }
    }
    filter
}

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the config.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let directives = build_filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }

    Ok(())
}
