//! Environment variable loading
//!
//! This module builds the configuration for the `pgllsr` binary from
//! environment variables.

use crate::config::{ConnectionConfig, ReaderCommand, StreamOptions, DEFAULT_READER_PROGRAM};
use crate::error::{CdcError, Result};
use crate::lsn::LogPos;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to run one stream from the command line
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub slot_name: String,
    pub start_position: LogPos,
    pub options: StreamOptions,
    pub checkpoint_file: Option<PathBuf>,
}

/// Load configuration from environment variables
///
/// # Environment Variables
///
/// ## Source connection
/// - `LLSR_DATABASE`: Database name (required)
/// - `LLSR_HOST`: Host name (default: "localhost")
/// - `LLSR_PORT`: Port (default: "5432")
/// - `LLSR_USER`: User name (default: "postgres")
/// - `LLSR_PASSWORD`: Password (default: empty)
///
/// ## Stream
/// - `LLSR_SLOT`: Replication slot name (default: "llsr_slot")
/// - `LLSR_START_POS`: Start position in `X/YYYYYYYY` form (default: "0/00000000")
/// - `LLSR_READER`: Reader executable (default: "pg_logical_stream")
/// - `LLSR_CHANNEL_CAPACITY`: Event queue capacity (default: "1000")
/// - `LLSR_SHUTDOWN_GRACE`: Seconds the reader may take to exit after a stop (default: "10")
/// - `LLSR_CHECKPOINT_FILE`: Path of the resume checkpoint (default: none)
///
/// # Errors
///
/// Returns `CdcError::Config` naming the offending variable.
pub fn load_config_from_env() -> Result<AppConfig> {
    tracing::info!("Loading configuration from environment variables");

    let database = std::env::var("LLSR_DATABASE")
        .map_err(|_| CdcError::config("LLSR_DATABASE environment variable is required"))?;

    let connection = ConnectionConfig::builder()
        .host(env_or("LLSR_HOST", "localhost"))
        .port(parse_env("LLSR_PORT", 5432u16)?)
        .user(env_or("LLSR_USER", "postgres"))
        .password(env_or("LLSR_PASSWORD", ""))
        .database(database)
        .build()?;

    let slot_name = env_or("LLSR_SLOT", "llsr_slot");
    let start_position = parse_env("LLSR_START_POS", LogPos::ZERO)?;

    let options = StreamOptions::default()
        .reader(ReaderCommand::new(env_or("LLSR_READER", DEFAULT_READER_PROGRAM)))
        .channel_capacity(parse_env("LLSR_CHANNEL_CAPACITY", 1000usize)?)
        .shutdown_grace(Duration::from_secs(parse_env("LLSR_SHUTDOWN_GRACE", 10u64)?));
    options.validate()?;

    let checkpoint_file = std::env::var("LLSR_CHECKPOINT_FILE")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from);

    tracing::info!(
        "Stream Config - Slot: {}, Start: {}, Reader: {}, Capacity: {}",
        slot_name,
        start_position,
        options.reader.program.display(),
        options.channel_capacity
    );

    Ok(AppConfig {
        connection,
        slot_name,
        start_position,
        options,
        checkpoint_file,
    })
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable with a default value
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|e| {
            CdcError::config(format!("Invalid value for {}: {} ({})", key, value, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Uses keys no other test touches, so it can run in parallel.
    #[test]
    fn test_parse_env_defaults_and_errors() {
        std::env::remove_var("LLSR_TEST_ONLY_PORT");
        assert_eq!(parse_env("LLSR_TEST_ONLY_PORT", 5432u16).unwrap(), 5432);

        std::env::set_var("LLSR_TEST_ONLY_POS", "a1/243c4c60");
        assert_eq!(
            parse_env("LLSR_TEST_ONLY_POS", LogPos::ZERO).unwrap(),
            LogPos(692097666144)
        );

        std::env::set_var("LLSR_TEST_ONLY_BAD", "not-a-number");
        let err = parse_env("LLSR_TEST_ONLY_BAD", 1u64).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("LLSR_TEST_ONLY_BAD"));
    }
}
