use registry_core::registry::ManifestRef;
use registry_core::{Error as CoreError, OciDigest, ReferenceChecker};

use super::metadata::PostgresMetadataTx;

/// Checks manifest references against the repository a manifest is being
/// written into.
pub struct PgReferenceChecker<'a, 'b> {
    tx: &'a mut PostgresMetadataTx<'b>,
    repository_id: uuid::Uuid,
}

impl<'a, 'b> PgReferenceChecker<'a, 'b> {
    pub fn new(tx: &'a mut PostgresMetadataTx<'b>, repository_id: uuid::Uuid) -> Self {
        Self { tx, repository_id }
    }
}

#[async_trait::async_trait]
impl<'a, 'b> ReferenceChecker for PgReferenceChecker<'a, 'b> {
    async fn blob_linked(&mut self, digest: &OciDigest) -> registry_core::Result<bool> {
        self.tx
            .blob_linked_to_repository(&self.repository_id, digest)
            .await
            .map_err(|e| CoreError::from(e))
    }

    async fn manifest_exists(&mut self, digest: &OciDigest) -> registry_core::Result<bool> {
        self.tx
            .get_manifest(&self.repository_id, &ManifestRef::Digest(digest.clone()))
            .await
            .map(|m| m.is_some())
            .map_err(|e| CoreError::from(e))
    }
}
