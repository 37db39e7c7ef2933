//! Per-repository decision between the filesystem-authoritative and
//! database-authoritative code paths.

use serde::Deserialize;

use crate::compile_patterns;
use crate::fs::FilesystemProbe;
use crate::{Result, RepositoryPath};

/// Tunables for [`MigrationRouter`], loaded once at process start as part of
/// the immutable top-level configuration struct.
#[derive(Clone, Deserialize)]
pub struct MigrationConfig {
    /// Whether the database-backed code path is enabled at all. If `false`,
    /// every repository uses the legacy filesystem path regardless of the
    /// other settings here.
    #[serde(default)]
    pub database_enabled: bool,

    /// Whether per-repository migration is enabled. If `false` and
    /// `database_enabled` is `true`, every repository uses the database path
    /// unconditionally (a "big bang" cutover); if `false` and
    /// `database_enabled` is `false`, every repository stays on the
    /// filesystem path.
    #[serde(default)]
    pub migration_enabled: bool,

    /// Repository paths matching one of these patterns are eligible for
    /// migration to the database path, subject to `exclude`.
    #[serde(default)]
    pub include: Vec<String>,

    /// Repository paths matching one of these patterns are never migrated,
    /// even if they also match `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            database_enabled: true,
            migration_enabled: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// The outcome of [`MigrationRouter::decide`] for a single repository.
///
/// `use_database` selects which store authoritatively serves reads and
/// writes; `write_fs_metadata` additionally causes manifest/tag writes to be
/// mirrored into the legacy filesystem layout while a repository straddles
/// both code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    use_database: bool,
    write_fs_metadata: bool,
}

impl Decision {
    pub fn use_database(&self) -> bool {
        self.use_database
    }

    pub fn write_fs_metadata(&self) -> bool {
        self.write_fs_metadata
    }

    fn database_only() -> Self {
        Self {
            use_database: true,
            write_fs_metadata: false,
        }
    }

    fn filesystem_only() -> Self {
        Self {
            use_database: false,
            write_fs_metadata: true,
        }
    }

    fn dual_write() -> Self {
        Self {
            use_database: true,
            write_fs_metadata: true,
        }
    }
}

/// Implements the migration decision table.
pub struct MigrationRouter {
    config: MigrationConfig,
    include: Vec<regex::Regex>,
    exclude: Vec<regex::Regex>,
}

impl MigrationRouter {
    pub fn new(config: MigrationConfig) -> Result<Self> {
        let include = compile_patterns(&config.include)?;
        let exclude = compile_patterns(&config.exclude)?;
        Ok(Self {
            config,
            include,
            exclude,
        })
    }

    fn is_included(&self, repository: &RepositoryPath) -> bool {
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(repository))
    }

    fn is_excluded(&self, repository: &RepositoryPath) -> bool {
        self.exclude.iter().any(|re| re.is_match(repository))
    }

    /// Decide, for the given repository, whether reads/authoritative writes
    /// hit the database and whether writes must also be mirrored to the
    /// legacy filesystem layout.
    ///
    /// `probe` is consulted only when migration is enabled and the decision
    /// actually depends on whether the repository already has a presence on
    /// the legacy filesystem -- this keeps the common "db-only" and
    /// "fs-only" cases free of filesystem I/O.
    pub async fn decide<P: FilesystemProbe>(
        &self,
        repository: &RepositoryPath,
        probe: &P,
    ) -> Result<Decision> {
        if !self.config.database_enabled {
            return Ok(Decision::filesystem_only());
        }

        if !self.config.migration_enabled {
            return Ok(Decision::database_only());
        }

        if probe.exists(repository).await? {
            return Ok(Decision::filesystem_only());
        }

        if self.is_included(repository) && !self.is_excluded(repository) {
            return Ok(Decision::dual_write());
        }

        Ok(Decision::filesystem_only())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FilesystemProbe;
    use async_trait::async_trait;

    struct AlwaysProbe(bool);

    #[async_trait]
    impl FilesystemProbe for AlwaysProbe {
        async fn exists(&self, _repository: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn database_disabled_is_always_filesystem_only() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: false,
            migration_enabled: true,
            include: vec![".*".to_string()],
            exclude: vec![],
        })
        .unwrap();

        let d = router
            .decide(&"library/nginx".to_string(), &AlwaysProbe(false))
            .await
            .unwrap();
        assert!(!d.use_database());
        assert!(d.write_fs_metadata());
    }

    #[tokio::test]
    async fn migration_disabled_is_always_database_only() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: true,
            migration_enabled: false,
            include: vec![],
            exclude: vec![],
        })
        .unwrap();

        let d = router
            .decide(&"library/nginx".to_string(), &AlwaysProbe(true))
            .await
            .unwrap();
        assert!(d.use_database());
        assert!(!d.write_fs_metadata());
    }

    #[tokio::test]
    async fn migrating_repo_already_on_filesystem_stays_filesystem_only() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: true,
            migration_enabled: true,
            include: vec![".*".to_string()],
            exclude: vec![],
        })
        .unwrap();

        let d = router
            .decide(&"library/nginx".to_string(), &AlwaysProbe(true))
            .await
            .unwrap();
        assert!(!d.use_database());
        assert!(d.write_fs_metadata());
    }

    #[tokio::test]
    async fn new_repo_matching_include_not_excluded_dual_writes() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: true,
            migration_enabled: true,
            include: vec!["^library/".to_string()],
            exclude: vec!["^library/internal/".to_string()],
        })
        .unwrap();

        let d = router
            .decide(&"library/nginx".to_string(), &AlwaysProbe(false))
            .await
            .unwrap();
        assert!(d.use_database());
        assert!(d.write_fs_metadata());
    }

    #[tokio::test]
    async fn new_repo_excluded_stays_filesystem_only() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: true,
            migration_enabled: true,
            include: vec!["^library/".to_string()],
            exclude: vec!["^library/internal/".to_string()],
        })
        .unwrap();

        let d = router
            .decide(&"library/internal/tool".to_string(), &AlwaysProbe(false))
            .await
            .unwrap();
        assert!(!d.use_database());
        assert!(d.write_fs_metadata());
    }

    #[tokio::test]
    async fn new_repo_not_matching_include_stays_filesystem_only() {
        let router = MigrationRouter::new(MigrationConfig {
            database_enabled: true,
            migration_enabled: true,
            include: vec!["^library/".to_string()],
            exclude: vec![],
        })
        .unwrap();

        let d = router
            .decide(&"other/tool".to_string(), &AlwaysProbe(false))
            .await
            .unwrap();
        assert!(!d.use_database());
        assert!(d.write_fs_metadata());
    }
}
