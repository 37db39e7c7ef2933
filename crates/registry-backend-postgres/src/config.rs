use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use registry_core::registry::RepositoryStoreManager;
use registry_core::ValidatorConfig;
use registry_objectstore::{S3Config, S3};

use super::errors::{Error, Result};
use super::metadata::{PostgresConfig, PostgresMetadataPool};
use super::repositories::PgRepository;
use super::upload_sessions::PgSessionStore;

/// Tunables for the row-lock coordination protocol between writers and the
/// GC sweep. `lock_timeout_ms` is applied via Postgres's `SET LOCAL
/// lock_timeout`, so it lives here rather than in `registry_core` alongside
/// the backend-agnostic `ValidatorConfig`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How long, in seconds, a review-queue row must sit unclaimed before
    /// GC may claim it; writers only lock rows still inside this window.
    pub review_window_secs: i64,
    /// Upper bound on how long a writer will wait to acquire a GC review
    /// row lock before giving up and returning a retryable error.
    pub lock_timeout_ms: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            review_window_secs: 86400,
            lock_timeout_ms: 5000,
        }
    }
}

impl GcConfig {
    pub fn review_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.review_window_secs)
    }
}

/// Tunables for the periodic sweep that deletes abandoned upload sessions
/// (and their chunks, via `ON DELETE CASCADE`) that never reached PUT.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UploadPurgeConfig {
    /// How old (in seconds) an upload session must be before it's purged.
    pub max_age_secs: i64,
    /// How often, in seconds, the purge sweep runs.
    pub interval_secs: u64,
    /// Upper bound, in seconds, on random jitter added to `interval_secs`
    /// between sweeps, so many registry instances don't all hit the
    /// database on the same tick.
    pub jitter_secs: u64,
}

impl Default for UploadPurgeConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 168 * 3600,
            interval_secs: 24 * 3600,
            jitter_secs: 60 * 60,
        }
    }
}

impl UploadPurgeConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs)
    }
}

#[derive(Clone, Deserialize)]
pub struct PgRepositoryConfig {
    postgres: PostgresConfig,
    s3: S3Config,
    #[serde(default)]
    gc: GcConfig,
    #[serde(default)]
    validator: ValidatorConfig,
    #[serde(default)]
    upload_purge: UploadPurgeConfig,
}

impl PgRepositoryConfig {
    pub async fn get_manager(&self) -> Result<PgRepositoryFactory> {
        Ok(PgRepositoryFactory {
            metadata: self.postgres.new_metadata().await?,
            objects: self.s3.new_objects().await?,
            gc: Arc::new(self.gc.clone()),
            validator: Arc::new(self.validator.clone()),
            upload_purge: Arc::new(self.upload_purge.clone()),
            reporter: Arc::new(registry_core::TracingErrorReporter),
        })
    }
}

#[derive(Clone)]
pub struct PgRepositoryFactory {
    metadata: PostgresMetadataPool,
    objects: S3,
    gc: Arc<GcConfig>,
    validator: Arc<ValidatorConfig>,
    upload_purge: Arc<UploadPurgeConfig>,
    reporter: Arc<dyn registry_core::ErrorReporter>,
}

impl PgRepositoryFactory {
    /// Spawns a background task that periodically deletes upload sessions
    /// older than the configured max age. Runs for the lifetime of the
    /// returned handle; dropping/aborting it stops the sweep.
    pub fn spawn_upload_purger(&self) -> tokio::task::JoinHandle<()> {
        let sessions = PgSessionStore::new(self.metadata.clone());
        super::purge::UploadPurger::new(sessions, (*self.upload_purge).clone()).spawn()
    }
}

#[async_trait]
impl RepositoryStoreManager for PgRepositoryFactory {
    type RepositoryStore = PgRepository;
    type Error = Error;

    async fn get(&self, name: &str) -> Result<Option<Self::RepositoryStore>> {
        PgRepository::get(
            name,
            self.metadata.clone(),
            self.objects.clone(),
            self.gc.clone(),
            self.validator.clone(),
            self.reporter.clone(),
        )
        .await
    }

    async fn create(&self, name: &str) -> Result<Self::RepositoryStore> {
        Ok(PgRepository::get_or_insert(
            name,
            self.metadata.clone(),
            self.objects.clone(),
            self.gc.clone(),
            self.validator.clone(),
            self.reporter.clone(),
        )
        .await?)
    }

    async fn list_repositories(&self, n: Option<i64>, last: Option<String>) -> Result<Vec<String>> {
        Ok(self
            .metadata
            .get_conn()
            .await?
            .get_repositories(n, last)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }
}
