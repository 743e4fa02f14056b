//! Thin facade over `slog`/`sloggers`. Long lived components take `Into<Option<&Logger>>` in
//! their constructors and derive child loggers; a missing logger falls back to `Discard`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging configuration must be valid")
}

/// Builds a logger from an inline sloggers TOML definition.
pub fn from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Derives a child logger from an optional parent, discarding output when absent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let _ = init();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(from_toml("type = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_child_of_none_discards() {
        let log = child(None);
        info!(log, "dropped");
    }
}
