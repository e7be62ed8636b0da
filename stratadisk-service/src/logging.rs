//! Logging setup
//!
//! Configures the process-wide tracing subscriber from the global
//! configuration: verbosity level, optional log file, and the `audit`
//! target used by slow-I/O events (filtered out entirely when auditing
//! is disabled).

use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::{GlobalConfig, Result, ServiceError};

fn level_str(log_level: u32) -> &'static str {
    match log_level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}

/// Initialize logging once at startup. A second call is a no-op so
/// embedding hosts and tests can both run through init.
pub fn init_logging(config: &GlobalConfig) -> Result<()> {
    let mut directives = level_str(config.log_level).to_string();
    if !config.enable_audit {
        directives.push_str(",audit=off");
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let result = if config.log_path.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .map_err(|e| {
                ServiceError::Config(format!("cannot open log file {}: {}", config.log_path, e))
            })?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    };

    // already initialized: keep the existing subscriber
    let _ = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_str(0), "debug");
        assert_eq!(level_str(1), "info");
        assert_eq!(level_str(2), "warn");
        assert_eq!(level_str(9), "error");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = GlobalConfig {
            log_path: String::new(),
            ..Default::default()
        };
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
