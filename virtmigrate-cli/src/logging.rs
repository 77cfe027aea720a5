//! Logging setup

use std::str::FromStr;

use anyhow::{bail, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Parse a level name (trace, debug, info, warn, error).
pub fn parse_level(level: &str) -> Result<Level> {
    match Level::from_str(level.trim()) {
        Ok(parsed) if level.trim().chars().all(|c| c.is_ascii_alphabetic()) => Ok(parsed),
        _ => bail!(
            "invalid log level '{}': expected one of trace, debug, info, warn, error",
            level
        ),
    }
}

/// Filter for an explicit level, else `RUST_LOG`, else the default level.
pub fn env_filter(level: Option<&str>) -> Result<EnvFilter> {
    if level.is_none() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    let level = parse_level(level.unwrap_or(DEFAULT_LOG_LEVEL))?;
    Ok(EnvFilter::default().add_directive(level.into()))
}

/// Install the global subscriber. Logs go to stderr so command output stays clean.
pub fn init(level: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_levels() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_level("error").unwrap(), Level::ERROR);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = parse_level("verbose").unwrap_err();
        assert!(err.to_string().contains("invalid log level 'verbose'"));
        assert!(parse_level("3").is_err());
        assert!(parse_level("").is_err());
    }

    #[test]
    fn test_explicit_level_builds_filter() {
        assert!(env_filter(Some("debug")).is_ok());
        assert!(env_filter(Some("loud")).is_err());
    }
}
