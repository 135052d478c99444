//! Pricebatch Pipeline Configuration
//!
//! Layered configuration with validation. Sources, lowest priority first:
//! built-in defaults, an optional TOML file, `PIPELINE__SECTION__KEY`
//! environment variables and finally the `DB_*` connection variables.

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineResult;

/// Default number of records per batch
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default name of the file processed in the validation step
pub const DEFAULT_VALIDATION_FILE: &str = "validation.csv";

/// Connection variables recognised on top of the layered sources
const DB_ENV_OVERRIDES: [(&str, &str); 5] = [
    ("DB_NAME", "database.dbname"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("DB_HOST", "database.host"),
    ("DB_PORT", "database.port"),
];

/// Main configuration for the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    /// Store connection configuration
    #[garde(dive)]
    pub database: DatabaseConfig,

    /// Batch and directory configuration
    #[garde(dive)]
    pub pipeline: PipelineConfig,
}

/// PostgreSQL connection configuration
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    /// Database name
    #[garde(length(min = 1, max = 63))]
    pub dbname: String,

    /// User name
    #[garde(length(min = 1))]
    pub user: String,

    /// Password
    #[garde(skip)]
    pub password: String,

    /// Host name or address
    #[garde(length(min = 1))]
    pub host: String,

    /// Port
    #[garde(range(min = 1))]
    pub port: u16,

    /// Maximum number of pooled connections
    #[garde(range(min = 1, max = 64))]
    pub max_connections: u32,

    /// Connection timeout (seconds)
    #[garde(range(min = 1, max = 300))]
    pub connect_timeout_s: u64,
}

/// Batch ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// Directory holding the CSV inputs
    #[garde(skip)]
    pub data_dir: PathBuf,

    /// File name processed separately after the main files
    #[garde(length(min = 1))]
    pub validation_file: String,

    /// Records per batch
    #[garde(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dbname: "data_pipeline".to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            max_connections: 4,
            connect_timeout_s: 5,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            validation_file: DEFAULT_VALIDATION_FILE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_s", &self.connect_timeout_s)
            .finish()
    }
}

impl DatabaseConfig {
    /// Connection timeout as a duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be read or the result fails validation
    pub fn load(file: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PIPELINE")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in DB_ENV_OVERRIDES {
            builder = builder.set_override_option(key, std::env::var(var).ok())?;
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate_config()?;

        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any field is out of range
    pub fn validate_config(&self) -> PipelineResult<()> {
        self.validate(&())?;
        Ok(())
    }

    /// Full path of the validation file
    #[must_use]
    pub fn validation_path(&self) -> PathBuf {
        self.pipeline.data_dir.join(&self.pipeline.validation_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.dbname, "data_pipeline");
        assert_eq!(config.database.user, "postgres");
        assert_eq!(config.database.password, "password");
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.pipeline.batch_size, 5);
        assert_eq!(config.pipeline.validation_file, "validation.csv");
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate_config().is_err());

        let mut config = AppConfig::default();
        config.database.dbname = String::new();
        assert!(config.validate_config().is_err());

        let mut config = AppConfig::default();
        config.database.port = 0;
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let mut config = DatabaseConfig::default();
        config.password = "hunter2".to_string();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[pipeline]")?;
        writeln!(file, "batch_size = 7")?;
        writeln!(file, "data_dir = \"/srv/prices\"")?;

        let config = AppConfig::load(Some(file.path()))?;
        assert_eq!(config.pipeline.batch_size, 7);
        assert_eq!(config.pipeline.data_dir, PathBuf::from("/srv/prices"));
        assert_eq!(config.pipeline.validation_file, "validation.csv");
        assert_eq!(
            config.validation_path(),
            PathBuf::from("/srv/prices/validation.csv")
        );
        Ok(())
    }

    #[test]
    fn test_load_rejects_invalid_file_values() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[pipeline]")?;
        writeln!(file, "batch_size = 0")?;

        assert!(AppConfig::load(Some(file.path())).is_err());
        Ok(())
    }
}
