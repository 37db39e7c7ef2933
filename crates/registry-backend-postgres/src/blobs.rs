use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use hyper::body::Body;
use uuid::Uuid;

use registry_core::registry::{BlobStore, BlobWriter};
use registry_core::Error as CoreError;
use registry_core::{ChunkedBody, DigestBody, Digester, OciDigest};
use registry_objectstore::{Chunk, Key, ObjectStore, S3};

use super::errors::{Error, Result};
use super::metadata::{
    Blob, Chunk as MetadataChunk, PostgresMetadataPool, PostgresMetadataTx, Repository,
    UploadSession,
};

#[derive(Clone)]
pub struct PgBlobStore {
    pub(crate) metadata: PostgresMetadataPool,
    pub(crate) objects: S3,
    pub(crate) repository: Repository,
}

impl PgBlobStore {
    pub fn new(metadata: PostgresMetadataPool, objects: S3, repository: Repository) -> Self {
        Self {
            metadata,
            objects,
            repository,
        }
    }
}

type TryBytes = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
impl BlobStore for PgBlobStore {
    type BlobWriter = PgBlobWriter;
    type Error = Error;
    type UploadSession = UploadSession;
    type Blob = Blob;
    type BlobBody = BoxStream<'static, TryBytes>;

    async fn head(&self, key: &OciDigest) -> Result<Option<Self::Blob>> {
        self.metadata
            .get_conn()
            .await?
            .get_blob_in_repository(&self.repository.id, key)
            .await
    }

    async fn get(&self, key: &OciDigest) -> Result<Option<(Self::Blob, Self::BlobBody)>> {
        if let Some(blob) = self
            .metadata
            .get_conn()
            .await?
            .get_blob_in_repository(&self.repository.id, key)
            .await?
        {
            let body = self.objects.get(&Key::from(&blob.id)).await?;
            Ok(Some((blob, body.map_err(|e| e.into()).boxed())))
        } else {
            Ok(None)
        }
    }

    async fn put(&mut self, digest: &OciDigest, content_length: u64, body: Body) -> Result<Uuid> {
        let mut tx = self.metadata.get_tx().await?;
        let uuid = match tx.get_blob(digest).await? {
            Some(b) => {
                // verify blob actually exists before returning a potentially bogus uuid
                if self.objects.exists(&Key::from(&b.id)).await? {
                    tx.link_blob_to_repository(&self.repository.id, &b.id)
                        .await?;
                    tx.commit().await?;
                    return Ok(b.id);
                }
                b.id
            }
            None => tx.insert_blob(digest, content_length as i64).await?,
        };

        // upload blob
        let digester = Arc::new(Mutex::new(digest.digester()));
        let stream_body = DigestBody::from_body(body, digester.clone());
        self.objects
            .put(&Key::from(&uuid), stream_body.into(), content_length)
            .await?;

        let digester = Arc::into_inner(digester)
            .expect("no other references should exist at this point")
            .into_inner()
            .expect("the mutex cannot be locked if there are no other Arc references");

        if digester.bytes() != content_length {
            self.objects.delete(&Key::from(&uuid)).await.ok();
            return Err(CoreError::SizeInvalid(Some(format!(
                "expected {content_length} bytes, wrote {}",
                digester.bytes()
            )))
            .into());
        }

        let computed = digester.finalize_hex();
        if !digest.matches_hex(&computed) {
            self.objects.delete(&Key::from(&uuid)).await.ok();
            return Err(CoreError::InvalidDigest(format!(
                "computed digest sha256:{computed} does not match {}",
                String::from(digest)
            ))
            .into());
        }

        tx.link_blob_to_repository(&self.repository.id, &uuid)
            .await?;
        tx.commit().await?;

        Ok(uuid)
    }

    async fn delete(&mut self, digest: &OciDigest) -> Result<()> {
        let mut tx = self.metadata.get_tx().await?;

        let blob = tx
            .get_blob_in_repository(&self.repository.id, digest)
            .await?
            .ok_or(CoreError::BlobUnknown(None))?;

        // Unlinking, not deleting: the blob's bytes may still be visible from
        // other repositories, or referenced by a manifest in this one. GC
        // reclaims the blob row and its bytes once nothing links to it.
        tx.unlink_blob_from_repository(&self.repository.id, &blob.id)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mount(&mut self, digest: &OciDigest) -> Result<bool> {
        let mut tx = self.metadata.get_tx().await?;
        match tx.get_blob(digest).await? {
            Some(blob) => {
                tx.link_blob_to_repository(&self.repository.id, &blob.id)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resume(
        &self,
        session_uuid: &Uuid,
        start_of_range: Option<u64>,
    ) -> Result<Self::BlobWriter> {
        // retrieve the session or fail if it doesn't exist
        let mut session = self
            .metadata
            .get_conn()
            .await?
            .get_session(session_uuid)
            .await
            .map_err(|_| CoreError::BlobUploadInvalid(None))?;

        if let Some(start) = start_of_range {
            if !session.validate_range(start) {
                tracing::debug!("content range start {start} is invalid");
                return Err(CoreError::BlobUploadInvalid(Some(
                    "content range start is invalid".to_string(),
                ))
                .into());
            }
        }

        if session.upload_id.is_none() {
            session.upload_id = Some(
                self.objects
                    .initiate_chunked_upload(&Key::from(&session.uuid))
                    .await?,
            );
        }

        Ok(PgBlobWriter {
            metadata: self.metadata.clone(),
            objects: self.objects.clone(),
            repository: self.repository.clone(),
            session,
        })
    }
}

/// Reads back a just-finalized chunked upload and verifies its content
/// matches `expected`. Chunked uploads span multiple HTTP requests, so
/// there is no live `Digester` to carry hash state across them; the only
/// way to check the assembled object is to hash it once more after the
/// object store has assembled it.
async fn validate_uploaded_digest(objects: &S3, key: &Key, expected: &OciDigest) -> Result<()> {
    let mut digester = expected.digester();
    let mut stream = objects.get(key).await?;
    while let Some(chunk) = stream.next().await {
        digester.update(&chunk?);
    }
    let computed = digester.finalize_hex();
    if !expected.matches_hex(&computed) {
        return Err(CoreError::InvalidDigest(format!(
            "computed digest sha256:{computed} does not match {}",
            String::from(expected)
        ))
        .into());
    }
    Ok(())
}

pub struct PgBlobWriter {
    metadata: PostgresMetadataPool,
    objects: S3,
    repository: Repository,

    session: UploadSession,
}

async fn write_chunk(
    objects: &S3,
    tx: &mut PostgresMetadataTx<'_>,
    session: &mut UploadSession,
    bytes: Bytes,
) -> Result<()> {
    let chunk = objects
        .upload_chunk(
            session
                .upload_id
                .as_ref()
                .expect("UploadSession.upload_id should always be Some here")
                .as_str(),
            &Key::from(&session.uuid),
            session.chunk_number,
            bytes.len() as u64,
            bytes.into(),
        )
        .await?;

    tx.insert_chunk(session, &MetadataChunk::from(chunk))
        .await?;
    Ok(())
}

#[async_trait]
impl BlobWriter for PgBlobWriter {
    type Error = Error;
    type UploadSession = UploadSession;

    async fn write(mut self, content_length: u64, body: Body) -> Result<Self::UploadSession> {
        tracing::debug!("before chunk upload: {:?}", self.session);
        let digester = Arc::new(Mutex::new(Digester::default()));
        let stream_body = DigestBody::from_body(body, digester.clone());
        let chunk = self
            .objects
            .upload_chunk(
                self.session
                    .upload_id
                    .as_ref()
                    .expect("UploadSession.upload_id should always be Some here")
                    .as_str(),
                &Key::from(&self.session.uuid),
                self.session.chunk_number,
                content_length,
                stream_body.into(),
            )
            .await?;

        let mut conn = self.metadata.get_conn().await?;
        conn.insert_chunk(&self.session, &MetadataChunk::from(chunk))
            .await?;

        let digester = Arc::into_inner(digester)
            .expect("no other references should exist at this point")
            .into_inner()
            .expect("the mutex cannot be locked if there are no other Arc references");

        self.session.chunk_number += 1;
        self.session.last_range_end += digester.bytes() as i64 - 1;

        conn.update_session(&self.session).await?;

        // TODO: return uploaded content length here
        Ok(self.session)
    }

    async fn write_chunked(mut self, body: Body) -> Result<Self::UploadSession> {
        let md = self.metadata.clone();
        let mut tx = md.get_tx().await?;
        let mut digester = Digester::default();

        let chunked = ChunkedBody::from_body(body);
        tokio::pin!(chunked);

        while let Some(vbytes) = chunked.next().await {
            for bytes in vbytes.into_iter() {
                digester.update(&bytes);
                write_chunk(&self.objects, &mut tx, &mut self.session, bytes).await?;
                self.session.chunk_number += 1;
            }
        }

        self.session.last_range_end += digester.bytes() as i64 - 1;
        tx.update_session(&self.session).await?;

        tx.commit().await?;
        Ok(self.session)
    }

    async fn finalize(self, digest: &OciDigest) -> Result<Self::UploadSession> {
        let session = self.session;
        let mut tx = self.metadata.get_tx().await?;
        let uuid = match tx.get_blob(digest).await? {
            Some(b) => b.id,
            None => tx.insert_blob(digest, session.last_range_end + 1).await?,
        };

        let blob_key = Key::from(&uuid);
        let session_key = Key::from(&session.uuid);

        if !self.objects.exists(&blob_key).await? {
            let chunks = tx
                .get_chunks(&session)
                .await?
                .into_iter()
                .map(Chunk::from)
                .collect();
            self.objects
                .finalize_chunked_upload(
                    session
                        .upload_id
                        .as_ref()
                        .expect("UploadSession.upload_id should always be Some here")
                        .as_str(),
                    &session_key,
                    chunks,
                    &blob_key,
                )
                .await?;

            if let Err(e) = validate_uploaded_digest(&self.objects, &blob_key, digest).await {
                self.objects.delete(&blob_key).await.ok();
                return Err(e);
            }
        } else {
            self.objects
                .abort_chunked_upload(
                    session
                        .upload_id
                        .as_ref()
                        .expect("UploadSession.upload_id should always be Some here")
                        .as_str(),
                    &session_key,
                )
                .await?;
        }

        tx.link_blob_to_repository(&self.repository.id, &uuid)
            .await?;
        tx.commit().await?;
        Ok(session)
    }
}
