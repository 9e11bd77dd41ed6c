use crate::commands::Command;
use crate::pipeline::result_validator::ValidationLevel;
use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment prefix for overrides, e.g. `NL_GATE__QUERY__MAX_LIMIT=500`.
const ENV_PREFIX: &str = "NL_GATE";

/// One configured PostgreSQL database the gateway may query.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseTarget {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password. The password itself
    /// is never part of the configuration tree.
    #[serde(default)]
    pub password_env_var: Option<String>,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
}

impl DatabaseTarget {
    pub fn password(&self) -> Option<String> {
        self.password_env_var
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env_var
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Zero disables the background refresh loop.
    pub refresh_interval_secs: u64,
    pub max_prompt_tables: usize,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            max_prompt_tables: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub max_timeout_secs: u64,
    pub enable_result_validation: bool,
    pub validation_level: ValidationLevel,
    pub max_generation_attempts: u32,
    pub block_system_catalogs: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 1000,
            max_limit: 10_000,
            max_timeout_secs: 30,
            enable_result_validation: false,
            validation_level: ValidationLevel::Auto,
            max_generation_attempts: 2,
            block_system_catalogs: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub acquire_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub idle_in_transaction_timeout_ms: u64,
    pub max_idle_secs: u64,
    pub health_check_interval_secs: u64,
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub reconnect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 10,
            statement_timeout_ms: 30_000,
            idle_in_transaction_timeout_ms: 60_000,
            max_idle_secs: 300,
            health_check_interval_secs: 60,
            failure_threshold: 5,
            reset_timeout_secs: 60,
            reconnect_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResultValidationConfig {
    pub min_expected_rows: usize,
    pub max_expected_rows: usize,
    pub semantic_threshold: f32,
    /// Fail the verdict instead of degrading to basic checks when the
    /// semantic assessment cannot be obtained.
    pub strict_semantic: bool,
}

impl Default for ResultValidationConfig {
    fn default() -> Self {
        Self {
            min_expected_rows: 1,
            max_expected_rows: 10_000,
            semantic_threshold: 0.7,
            strict_semantic: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub directory: PathBuf,
    pub retention_days: u32,
    pub max_file_size_mb: u64,
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            retention_days: 30,
            max_file_size_mb: 100,
            buffer_size: 100,
            flush_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub databases: Vec<DatabaseTarget>,
    #[serde(default)]
    pub default_database: Option<String>,
    pub llm: LlmConfig,
    #[serde(default)]
    pub schema_cache: SchemaCacheConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub result_validation: ResultValidationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database used when a command does not name one
    #[arg(long)]
    pub default_database: Option<String>,

    /// Directory for audit log files
    #[arg(long)]
    pub audit_dir: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = ["nl-gate.toml", "config/nl-gate.toml", "/etc/nl-gate/config.toml"];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder = config_builder.add_source(File::new(location, FileFormat::Toml));
                    break;
                }
            }
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(database) = &args.default_database {
            config.default_database = Some(database.clone());
        }
        if let Some(audit_dir) = &args.audit_dir {
            config.audit.directory = audit_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment or the filesystem.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases.is_empty() {
            return Err(ConfigError::Message(
                "at least one database must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.databases {
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "database '{}' is configured more than once",
                    target.name
                )));
            }
            if target.max_pool_size == 0 || target.min_pool_size > target.max_pool_size {
                return Err(ConfigError::Message(format!(
                    "database '{}': pool bounds must satisfy 0 <= min ({}) <= max ({}) and max > 0",
                    target.name, target.min_pool_size, target.max_pool_size
                )));
            }
            if !matches!(target.ssl_mode.as_str(), "disable" | "prefer") {
                return Err(ConfigError::Message(format!(
                    "database '{}': unsupported ssl_mode '{}' (expected 'disable' or 'prefer')",
                    target.name, target.ssl_mode
                )));
            }
        }

        if let Some(default) = &self.default_database {
            if !seen.contains(default.as_str()) {
                return Err(ConfigError::Message(format!(
                    "default database '{}' is not configured",
                    default
                )));
            }
        }

        let query = &self.query;
        if query.max_limit == 0 || query.default_limit == 0 || query.default_limit > query.max_limit {
            return Err(ConfigError::Message(format!(
                "query limits must satisfy 0 < default_limit ({}) <= max_limit ({})",
                query.default_limit, query.max_limit
            )));
        }
        if query.max_generation_attempts == 0 {
            return Err(ConfigError::Message(
                "query.max_generation_attempts must be at least 1".to_string(),
            ));
        }
        if self.pool.failure_threshold == 0 {
            return Err(ConfigError::Message(
                "pool.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.result_validation.semantic_threshold) {
            return Err(ConfigError::Message(
                "result_validation.semantic_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.audit.buffer_size == 0 {
            return Err(ConfigError::Message(
                "audit.buffer_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves the database a command should run against.
    pub fn resolve_database(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::to_string)
            .or_else(|| self.default_database.clone())
            .or_else(|| {
                if self.databases.len() == 1 {
                    Some(self.databases[0].name.clone())
                } else {
                    None
                }
            })
    }
}

fn default_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_min_pool_size() -> u32 {
    1
}

fn default_max_pool_size() -> u32 {
    5
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_llm_max_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        [[databases]]
        name = "sales"
        host = "localhost"
        database = "sales"
        user = "reader"

        [llm]
        backend = "remote"
        model = "gpt-4o-mini"
        api_url = "https://api.openai.com/v1/chat/completions"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.databases.len(), 1);
        let target = &config.databases[0];
        assert_eq!(target.port, 5432);
        assert_eq!(target.ssl_mode, "prefer");
        assert_eq!((target.min_pool_size, target.max_pool_size), (1, 5));

        assert_eq!(config.query.default_limit, 1000);
        assert_eq!(config.query.max_limit, 10_000);
        assert_eq!(config.query.validation_level, ValidationLevel::Auto);
        assert_eq!(config.pool.failure_threshold, 5);
        assert_eq!(config.pool.reset_timeout_secs, 60);
        assert_eq!(config.audit.buffer_size, 100);
        assert_eq!(config.audit.retention_days, 30);
        assert_eq!(config.schema_cache.refresh_interval_secs, 300);
        assert_eq!(config.llm.max_retries, 2);
    }

    #[test]
    fn single_database_is_the_implicit_default() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.resolve_database(None).as_deref(), Some("sales"));
        assert_eq!(config.resolve_database(Some("other")).as_deref(), Some("other"));
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let toml = MINIMAL.replace("user = \"reader\"", "user = \"reader\"\nmin_pool_size = 9\nmax_pool_size = 2");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("pool bounds"));
    }

    #[test]
    fn rejects_unknown_default_database() {
        let toml = format!("default_database = \"missing\"\n{MINIMAL}");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("default database 'missing'"));
    }

    #[test]
    fn rejects_default_limit_above_ceiling() {
        let toml = format!("{MINIMAL}\n[query]\ndefault_limit = 20000\nmax_limit = 100\n");
        assert!(AppConfig::from_toml_str(&toml).is_err());
    }
}
