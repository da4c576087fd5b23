//! Subscriber setup for the host binary.

use anyhow::{Result, anyhow};
use karaconfig::Config;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Installs the global subscriber.
///
/// The level comes from `logger.min_level`. `RUST_LOG`, when set, filters
/// further by target (both filters must let an event through). The console
/// layer follows `logger.enable_console`.
pub fn init_logging(config: &Config) -> Result<()> {
    let level = parse_level(&config.get_log_min_level()).unwrap_or(Level::INFO);
    let filter = LevelFilter::from_level(level);

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|directives| !directives.trim().is_empty())
        .map(EnvFilter::new);

    let console = config.get_log_enable_console().then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
    });

    Registry::default()
        .with(filter)
        .with(env_filter)
        .with(console)
        .try_init()
        .map_err(|err| anyhow!("cannot install log subscriber: {err}"))?;

    Ok(())
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" Warning "), Some(Level::WARN));
        assert_eq!(parse_level("verbose"), None);
    }
}
