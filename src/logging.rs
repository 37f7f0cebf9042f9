//! Process-wide tracing subscriber.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Filter directives to use: `RUST_LOG` wins over the configured filter.
fn directives(env: Option<String>, config: &LoggingConfig) -> String {
    env.filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.filter.clone())
}

/// Install the subscriber. Called once from `main`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let directives = directives(std::env::var("RUST_LOG").ok(), config);
    let filter = tracing_subscriber::EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter {:?}", directives))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_config() {
        let config = LoggingConfig::default();
        assert_eq!(directives(Some("debug".into()), &config), "debug");
        assert_eq!(directives(Some("  ".into()), &config), config.filter);
        assert_eq!(directives(None, &config), config.filter);
    }
}
