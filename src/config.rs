//! Service configuration.
//!
//! Loaded from a TOML file (default `zipwater.toml`, or the path in
//! `ZIPWATER_CONFIG`). A `.env` file is read first, and `DATABASE_URL`
//! always wins over the file's `database.url`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "zipwater.toml";
pub const CONFIG_PATH_ENV: &str = "ZIPWATER_CONFIG";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Server-side statement timeout. Zero disables it.
    pub statement_timeout_ms: u64,
    /// Most connections the server holds open at once. Requests beyond
    /// this wait up to `connect_timeout_secs` for a free one.
    pub pool_size: u32,
    /// Pooled connections older than this are closed and replaced.
    pub pool_max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            connect_timeout_secs: 5,
            statement_timeout_ms: 2000,
            pool_size: 10,
            pool_max_lifetime_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub default_top_n: i64,
    pub max_top_n: i64,
    pub default_candidates: i64,
    pub max_candidates: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            default_top_n: 10,
            max_top_n: 50,
            default_candidates: 5,
            max_candidates: 20,
        }
    }
}

/// What ingestion does with a value outside its valid range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangePolicy {
    /// Drop the row and report it.
    #[default]
    Reject,
    /// Pull the value back into range and count the row as clamped.
    Clamp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub out_of_range: OutOfRangePolicy,
    /// Left-pad 3 and 4 digit zips with zeros (spreadsheets drop them).
    pub pad_short_zips: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            out_of_range: OutOfRangePolicy::Reject,
            pad_short_zips: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `zipwater_service=debug`.
    /// `RUST_LOG` overrides it.
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.database.url = normalize_dsn(&config.database.url);
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or the default path if `None`. A missing default file
    /// yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Full startup path: `.env`, config file, then `DATABASE_URL`.
    pub fn from_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let config = Self::load(path.or(env_path.as_deref()))?;
        match std::env::var(DATABASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Ok(config.with_database_url(&url)),
            _ => Ok(config),
        }
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = normalize_dsn(url);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.max_top_n < 1 {
            return Err(ConfigError::Invalid("server.max_top_n must be at least 1".into()));
        }
        if !(1..=server.max_top_n).contains(&server.default_top_n) {
            return Err(ConfigError::Invalid(format!(
                "server.default_top_n must be between 1 and {}",
                server.max_top_n
            )));
        }
        if server.max_candidates < 1 {
            return Err(ConfigError::Invalid("server.max_candidates must be at least 1".into()));
        }
        if !(1..=server.max_candidates).contains(&server.default_candidates) {
            return Err(ConfigError::Invalid(format!(
                "server.default_candidates must be between 1 and {}",
                server.max_candidates
            )));
        }
        if self.database.pool_size < 1 {
            return Err(ConfigError::Invalid("database.pool_size must be at least 1".into()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url must not be empty".into()));
        }
        Ok(())
    }
}

/// Local default used when nothing else is configured.
fn default_database_url() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
    format!("postgresql://{}@127.0.0.1:5432/water", user)
}

/// Accepts async-driver DSNs (`postgresql+asyncpg://...`) shared with other
/// tooling and rewrites them to the plain scheme the blocking client expects.
pub fn normalize_dsn(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) => format!("{}://{}", base, rest),
            None => trimmed.to_string(),
        },
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.server.default_top_n, 10);
        assert_eq!(config.server.max_top_n, 50);
        assert_eq!(config.server.default_candidates, 5);
        assert_eq!(config.ingest.out_of_range, OutOfRangePolicy::Reject);
        assert!(config.ingest.pad_short_zips);
        assert_eq!(config.database.statement_timeout_ms, 2000);
        assert_eq!(config.database.pool_size, 10);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [database]
            url = "postgresql+asyncpg://water@db:5432/water"
            statement_timeout_ms = 500

            [server]
            bind = "127.0.0.1:9000"
            max_top_n = 25

            [ingest]
            out_of_range = "clamp"
            "#,
        )
        .expect("config should parse");
        assert_eq!(config.database.url, "postgresql://water@db:5432/water");
        assert_eq!(config.database.statement_timeout_ms, 500);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.max_top_n, 25);
        assert_eq!(config.ingest.out_of_range, OutOfRangePolicy::Clamp);
    }

    #[test]
    fn test_default_top_n_must_fit_under_max() {
        let result = Config::from_toml_str("[server]\ndefault_top_n = 60\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pool_size_is_configurable_and_nonzero() {
        let config = Config::from_toml_str("[database]\npool_size = 3\n").unwrap();
        assert_eq!(config.database.pool_size, 3);

        let result = Config::from_toml_str("[database]\npool_size = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_policy_is_a_parse_error() {
        let result = Config::from_toml_str("[ingest]\nout_of_range = \"ignore\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_normalize_dsn_strips_driver_suffix() {
        assert_eq!(
            normalize_dsn("postgresql+asyncpg://u@h:5432/water"),
            "postgresql://u@h:5432/water"
        );
        assert_eq!(normalize_dsn(" postgresql://u@h/water "), "postgresql://u@h/water");
        assert_eq!(normalize_dsn("host=h user=u"), "host=h user=u");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/zipwater.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_database_url_override_is_normalized() {
        let config = Config::default().with_database_url("postgresql+psycopg://a@b/c");
        assert_eq!(config.database.url, "postgresql://a@b/c");
    }
}
