//! Per-repository routing between the database-authoritative code path and the
//! legacy filesystem-authoritative one, plus the filesystem mirror used while
//! a repository is being migrated.
//!
//! Used by request-pipeline middleware in `registry_http` to decide, per
//! repository, whether reads/authoritative writes hit the database
//! ([`Decision::use_database`]) and whether manifest/tag writes must also be
//! mirrored into the legacy filesystem layout ([`Decision::write_fs_metadata`]).

use regex::Regex;

pub mod errors;
pub mod fs;
pub mod router;

pub use errors::{Error, Result};
pub use fs::{FilesystemProbe, LegacyFilesystemStore};
pub use router::{Decision, MigrationConfig, MigrationRouter};

/// A repository path as seen by the migration router, e.g. `library/nginx`.
pub type RepositoryPath = String;

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::InvalidFilterPattern(p.clone(), e)))
        .collect()
}
