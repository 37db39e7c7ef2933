use async_trait::async_trait;
use uuid::Uuid;

use registry_core::registry::UploadSessionStore;

use super::errors::{Error, Result};
use super::metadata::PostgresMetadataPool;
use super::metadata::UploadSession;

#[derive(Clone)]
pub struct PgSessionStore {
    metadata: PostgresMetadataPool,
}

impl PgSessionStore {
    pub fn new(metadata: PostgresMetadataPool) -> Self {
        Self { metadata }
    }

    /// Deletes upload sessions started before `max_age` ago. Returns the
    /// number of sessions purged.
    pub async fn purge_stale_sessions(&self, max_age: chrono::Duration) -> Result<u64> {
        let before = (chrono::Utc::now() - max_age).date_naive();
        self.metadata
            .get_conn()
            .await?
            .delete_stale_sessions(before)
            .await
    }
}

#[async_trait]
impl UploadSessionStore for PgSessionStore {
    type Error = Error;
    type UploadSession = UploadSession;

    async fn new_upload_session(&self) -> Result<Self::UploadSession> {
        self.metadata.get_conn().await?.new_upload_session().await
    }

    async fn get_upload_session(&self, session_uuid: &Uuid) -> Result<Self::UploadSession> {
        self.metadata
            .get_conn()
            .await?
            .get_session(session_uuid)
            .await
    }

    async fn delete_session(&self, session_uuid: &Uuid) -> Result<()> {
        let mut tx = self.metadata.get_tx().await?;

        tx.delete_chunks(session_uuid).await?;
        tx.delete_session(session_uuid).await?;

        tx.commit().await?;

        Ok(())
    }
}
