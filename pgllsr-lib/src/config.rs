use crate::error::{CdcError, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default executable used to read the replication slot
pub const DEFAULT_READER_PROGRAM: &str = "pg_logical_stream";

/// Longest slot name PostgreSQL accepts (NAMEDATALEN - 1)
pub const MAX_SLOT_NAME_LEN: usize = 63;

/// How to reach the source database
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectionConfig {
    /// Local connection to `database` as `postgres` on the default port
    pub fn new<S: Into<String>>(database: S) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: database.into(),
        }
    }

    /// Create a new config builder
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// Check connection parameters before they reach the reader process
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CdcError::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(CdcError::config("port must be greater than 0"));
        }
        if self.user.trim().is_empty() {
            return Err(CdcError::config("user must not be empty"));
        }
        if self.database.trim().is_empty() {
            return Err(CdcError::config("database name must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "***" };
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &password)
            .field("database", &self.database)
            .finish()
    }
}

/// Check a replication slot name against PostgreSQL's naming rules
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CdcError::config("replication slot name must not be empty"));
    }
    if name.len() > MAX_SLOT_NAME_LEN {
        return Err(CdcError::config(format!(
            "replication slot name '{}' is longer than {} characters",
            name, MAX_SLOT_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(CdcError::config(format!(
            "replication slot name '{}' contains invalid character '{}'; only lower case letters, numbers and underscores are allowed",
            name, c
        )));
    }
    Ok(())
}

/// Builder pattern for creating connection configuration
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::new(""),
        }
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.config.user = user.into();
        self
    }

    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.config.database = database.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// The external executable that reads the slot and emits framed records
///
/// `prefix_args` are placed before the generated connection arguments,
/// which allows running the reader through a wrapper such as `sudo -u` or
/// `docker exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<OsString>,
    pub env: HashMap<String, String>,
}

impl Default for ReaderCommand {
    fn default() -> Self {
        Self::new(DEFAULT_READER_PROGRAM)
    }
}

impl ReaderCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub(crate) fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Tuning knobs for a single stream
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Reader executable and wrapper arguments
    pub reader: ReaderCommand,

    /// Capacity of the bounded event queue between the decode loop and the consumer
    pub channel_capacity: usize,

    /// Size of each read from the reader's stdout
    pub read_buffer_size: usize,

    /// How long the reader may take to exit after a stop before it is killed
    pub shutdown_grace: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reader: ReaderCommand::default(),
            channel_capacity: 1000,
            read_buffer_size: 64 * 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl StreamOptions {
    pub fn reader(mut self, reader: ReaderCommand) -> Self {
        self.reader = reader;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(CdcError::config("channel capacity must be greater than 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(CdcError::config("read buffer size must be greater than 0"));
        }
        if self.reader.program.as_os_str().is_empty() {
            return Err(CdcError::config("reader program must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_local_defaults() {
        let config = ConnectionConfig::new("postgres");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.user, "postgres");
        assert!(config.password.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_validates() {
        let config = ConnectionConfig::builder()
            .host("db.internal")
            .port(6432)
            .user("replicator")
            .password("s3cret")
            .database("app")
            .build()
            .unwrap();
        assert_eq!(config.port, 6432);

        assert!(ConnectionConfig::builder().build().unwrap_err().is_config());
        assert!(ConnectionConfig::builder()
            .database("app")
            .port(0)
            .build()
            .unwrap_err()
            .is_config());
        assert!(ConnectionConfig::builder()
            .database("app")
            .host(" ")
            .build()
            .is_err());
    }

    #[test]
    fn test_debug_masks_password() {
        let mut config = ConnectionConfig::new("app");
        config.password = "hunter2".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_slot_name_rules() {
        assert!(validate_slot_name("llsr_test_slot").is_ok());
        assert!(validate_slot_name("slot_1").is_ok());
        assert!(validate_slot_name("").is_err());
        assert!(validate_slot_name("Upper").is_err());
        assert!(validate_slot_name("with-dash").is_err());
        assert!(validate_slot_name("semi;colon").is_err());
        assert!(validate_slot_name(&"a".repeat(MAX_SLOT_NAME_LEN)).is_ok());
        assert!(validate_slot_name(&"a".repeat(MAX_SLOT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_stream_options_validation() {
        assert!(StreamOptions::default().validate().is_ok());
        assert!(StreamOptions::default()
            .channel_capacity(0)
            .validate()
            .unwrap_err()
            .is_config());
        assert!(StreamOptions::default()
            .reader(ReaderCommand::new(""))
            .validate()
            .is_err());
    }
}
