use std::path::PathBuf;

use serde::Deserialize;

use registry_backend_postgres::PgRepositoryConfig;
use registry_http::RepositoryDefinition;
use registry_migrate::MigrationConfig;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub backend: RepositoryBackend,
    pub static_repositories: Option<Vec<RepositoryDefinition>>,
    pub migration: Option<MigrationSettings>,
}

/// Top-level knobs for the legacy filesystem migration path. Absent
/// entirely, the registry is fully database-authoritative and never touches
/// `legacy_root`.
#[derive(Clone, Deserialize)]
pub struct MigrationSettings {
    #[serde(flatten)]
    pub config: MigrationConfig,
    pub legacy_root: PathBuf,
}

#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RepositoryBackend {
    Postgres(PgRepositoryConfig),
}
