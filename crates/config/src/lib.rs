//! Configuration loading, validation, and env substitution.
//!
//! Config files: `herald.toml`, `herald.yaml`, `herald.yml` or `herald.json`,
//! searched in `./` then `~/.config/herald/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution anywhere in the file.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        AuditBackend, AuditConfig, HeraldConfig, KafkaSourceConfig, MetricsConfig,
        MongoDatabaseConfig, MongoSourceConfig, OutboxConfig, PostgresDatabaseConfig,
        PostgresSourceConfig, RateLimitScope, RedactionConfig, SourcesConfig, TelegramConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, is_pg_identifier},
};
