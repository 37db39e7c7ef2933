//! Legacy filesystem-layout store used as the pre-migration source of truth
//! and as the dual-write mirror target while a repository is being migrated
//! for dual-write migration.
//!
//! Only the metadata *links* are mirrored here -- tag pointers and manifest
//! revision links -- not blob bytes, which already live in the shared object
//! store regardless of which metadata path is authoritative.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::RepositoryPath;

/// Queried by [`crate::MigrationRouter`] to determine whether a repository
/// already has a presence on the legacy filesystem layout.
#[async_trait]
pub trait FilesystemProbe: Send + Sync + 'static {
    async fn exists(&self, repository: &RepositoryPath) -> Result<bool>;
}

fn validate_repository_path(repository: &str) -> Result<()> {
    static RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*(/[a-z0-9]+([._-][a-z0-9]+)*)*$").unwrap()
    });
    if repository.len() > 255 || !RE.is_match(repository) {
        return Err(Error::InvalidRepositoryPath(repository.to_string()));
    }
    Ok(())
}

/// Mirrors manifest/tag writes into the `/docker/registry/v2/...` layout
/// rooted at `root`.
#[derive(Clone)]
pub struct LegacyFilesystemStore {
    root: PathBuf,
}

impl LegacyFilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repository_root(&self, repository: &str) -> PathBuf {
        self.root
            .join("docker/registry/v2/repositories")
            .join(repository)
    }

    fn manifest_revision_link_path(&self, repository: &str, digest: &str) -> Result<PathBuf> {
        let (algo, hex) = split_digest(digest)?;
        Ok(self
            .repository_root(repository)
            .join("_manifests/revisions")
            .join(algo)
            .join(hex)
            .join("link"))
    }

    fn tag_link_path(&self, repository: &str, tag: &str, digest: &str) -> Result<PathBuf> {
        let (algo, hex) = split_digest(digest)?;
        Ok(self
            .repository_root(repository)
            .join("_manifests/tags")
            .join(tag)
            .join("index")
            .join(algo)
            .join(hex)
            .join("link"))
    }

    fn tag_current_link_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.repository_root(repository)
            .join("_manifests/tags")
            .join(tag)
            .join("current/link")
    }

    async fn write_link(path: &Path, digest: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, digest.as_bytes()).await?;
        Ok(())
    }

    /// Record that `digest` exists as a revision of `repository`, and
    /// optionally point `tag` at it. Called by the HTTP write path after the
    /// database transaction for a manifest PUT has committed; failures here
    /// are logged and reported but never roll back the (authoritative)
    /// database write.
    pub async fn mirror_manifest_put(
        &self,
        repository: &str,
        digest: &str,
        tag: Option<&str>,
    ) -> Result<()> {
        validate_repository_path(repository)?;

        let revision_link = self.manifest_revision_link_path(repository, digest)?;
        Self::write_link(&revision_link, digest).await?;

        if let Some(tag) = tag {
            let tag_index_link = self.tag_link_path(repository, tag, digest)?;
            Self::write_link(&tag_index_link, digest).await?;

            let current_link = self.tag_current_link_path(repository, tag);
            Self::write_link(&current_link, digest).await?;
        }

        Ok(())
    }

    /// Mirror a blob's bytes existing under a repository's link tree. The
    /// bytes themselves are addressed globally by digest and are assumed to
    /// already be present in the shared object store; this only records the
    /// fact that `digest` is linked to `repository`.
    pub async fn mirror_blob_link(&self, repository: &str, digest: &str) -> Result<()> {
        validate_repository_path(repository)?;
        let (algo, hex) = split_digest(digest)?;
        let link = self
            .repository_root(repository)
            .join("_layers")
            .join(algo)
            .join(hex)
            .join("link");
        Self::write_link(&link, digest).await?;
        Ok(())
    }

    /// Remove a tag's current link, mirroring tag deletion.
    pub async fn mirror_tag_delete(&self, repository: &str, tag: &str) -> Result<()> {
        validate_repository_path(repository)?;
        let dir = self
            .repository_root(repository)
            .join("_manifests/tags")
            .join(tag);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a manifest's revision link, mirroring manifest deletion. Does
    /// not remove blob data (GC's responsibility, out of scope here).
    pub async fn mirror_manifest_delete(&self, repository: &str, digest: &str) -> Result<()> {
        validate_repository_path(repository)?;
        let link = self.manifest_revision_link_path(repository, digest)?;
        match tokio::fs::remove_file(&link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

}

#[async_trait]
impl FilesystemProbe for LegacyFilesystemStore {
    async fn exists(&self, repository: &RepositoryPath) -> Result<bool> {
        validate_repository_path(repository)?;
        match tokio::fs::metadata(self.repository_root(repository)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn split_digest(digest: &str) -> Result<(&str, &str)> {
    digest
        .split_once(':')
        .filter(|(_, hex)| !hex.is_empty())
        .ok_or_else(|| Error::InvalidRepositoryPath(digest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirror_manifest_put_writes_revision_and_tag_links() {
        let dir = tempfile::tempdir().unwrap();
        let store = LegacyFilesystemStore::new(dir.path());

        store
            .mirror_manifest_put(
                "library/nginx",
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                Some("latest"),
            )
            .await
            .unwrap();

        assert!(store.exists(&"library/nginx".to_string()).await.unwrap());

        let current = store.tag_current_link_path("library/nginx", "latest");
        let contents = tokio::fs::read_to_string(current).await.unwrap();
        assert_eq!(
            contents,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn mirror_tag_delete_removes_tag_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LegacyFilesystemStore::new(dir.path());
        let digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

        store
            .mirror_manifest_put("library/nginx", digest, Some("latest"))
            .await
            .unwrap();
        store
            .mirror_tag_delete("library/nginx", "latest")
            .await
            .unwrap();

        let current = store.tag_current_link_path("library/nginx", "latest");
        assert!(tokio::fs::metadata(current).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_repository_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = LegacyFilesystemStore::new(dir.path());
        let err = store
            .mirror_manifest_put("../etc/passwd", "sha256:abc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRepositoryPath(_)));
    }
}
