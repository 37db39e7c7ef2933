use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use futures::stream::BoxStream;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use oci_spec::distribution::{TagList, TagListBuilder};
use oci_spec::image::{Descriptor, ImageIndex, MediaType};

use registry_core::registry::{BlobStore, ManifestRef, ManifestSpec, ManifestStore};
use registry_core::Error as CoreError;
use registry_core::{ErrorReporter, OciDigest, Validator, ValidatorConfig};
use registry_objectstore::Key;

use super::blobs::PgBlobStore;
use super::config::GcConfig;
use super::errors::{Error, Result};
use super::metadata::Manifest;
use super::metadata::Repository;
use super::validate::PgReferenceChecker;

pub struct PgManifestStore {
    blobstore: PgBlobStore,
    repository: Repository,
    gc: Arc<GcConfig>,
    validator: Arc<ValidatorConfig>,
    reporter: Arc<dyn ErrorReporter>,
}

impl PgManifestStore {
    pub fn new(
        blobstore: PgBlobStore,
        repository: Repository,
        gc: Arc<GcConfig>,
        validator: Arc<ValidatorConfig>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            blobstore,
            repository,
            gc,
            validator,
            reporter,
        }
    }

    /// Runs the validator against `spec` and, if it passes, inserts the
    /// manifest row, its layer/child-manifest associations, and seeds the
    /// GC-manifest-review row that future tag/delete operations lock
    /// against. Used both for a fresh digest and to recreate a manifest
    /// that a concurrent GC sweep claimed out from under a tagging attempt
    /// (see `tag_manifest` below).
    async fn insert_manifest_and_associations(
        &self,
        tx: &mut super::metadata::PostgresMetadataTx<'_>,
        spec: &ManifestSpec,
        blob_uuid: uuid::Uuid,
        calculated_digest: OciDigest,
        byte_count: i64,
    ) -> Result<Manifest> {
        let validation = {
            let mut checker = PgReferenceChecker::new(tx, self.repository.id);
            match Validator::new(&self.validator)
                .validate(spec, &mut checker)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    self.reporter.report("validator", &e);
                    return Err(e.into());
                }
            }
        };

        let manifest = Manifest::from_spec_with_params(
            spec,
            self.repository.id,
            blob_uuid,
            calculated_digest,
            byte_count,
            validation.non_conformant,
        );
        tx.insert_manifest(&manifest).await?;

        match spec {
            ManifestSpec::Image(img) => {
                let layers = img.layers();

                let digests = layers.iter().map(|desc| desc.digest().as_str()).collect();
                let blobs = tx.get_blobs(&digests).await?;

                tx.associate_image_layers(&manifest.id, blobs.iter().map(|b| &b.id).collect())
                    .await?;
            }
            ManifestSpec::Index(ind) => {
                let digests = ind
                    .manifests()
                    .iter()
                    .map(|desc| desc.digest().as_str())
                    .collect();
                let manifests = tx.get_manifests(&self.repository.id, &digests).await?;

                tx.associate_index_manifests(
                    &manifest.id,
                    manifests.iter().map(|b| &b.id).collect(),
                )
                .await?;
            }
        }

        tx.insert_gc_manifest_review_row(&manifest.id).await?;

        Ok(manifest)
    }

    /// Locks out a concurrent GC sweep before pointing `tag` at `manifest`,
    /// per spec.md §4.5. `acquire_gc_manifest_lock` returning `Ok(false)`
    /// means GC already reclaimed `manifest`'s review row (and with it the
    /// manifest itself) between the lookup and this lock attempt; per
    /// spec.md §4.5's "tagging a manifest the GC has already claimed" edge
    /// case, the manifest is recreated from `spec` and the tag attempt
    /// retried exactly once before giving up.
    async fn tag_manifest(
        &self,
        tx: &mut super::metadata::PostgresMetadataTx<'_>,
        mut manifest: Manifest,
        spec: &ManifestSpec,
        blob_uuid: uuid::Uuid,
        byte_count: i64,
        tag: &str,
    ) -> Result<()> {
        let mut recreated = false;
        loop {
            match tx
                .acquire_gc_manifest_lock(
                    &manifest.id,
                    self.gc.lock_timeout_ms,
                    self.gc.review_window(),
                )
                .await
            {
                Ok(true) => {
                    tx.upsert_tag(&self.repository.id, &manifest.id, tag).await?;
                    return Ok(());
                }
                Ok(false) if !recreated => {
                    tracing::warn!(
                        manifest_id = %manifest.id,
                        digest = %String::from(&manifest.digest),
                        "manifest reclaimed by a concurrent gc sweep while tagging; recreating",
                    );
                    manifest = self
                        .insert_manifest_and_associations(
                            tx,
                            spec,
                            blob_uuid,
                            manifest.digest.clone(),
                            byte_count,
                        )
                        .await?;
                    recreated = true;
                }
                Ok(false) => {
                    return Err(CoreError::ManifestUnknown(Some(format!(
                        "manifest {} was reclaimed by garbage collection twice while tagging",
                        String::from(&manifest.digest)
                    )))
                    .into());
                }
                Err(e) => {
                    self.reporter.report("gc_lock", &e);
                    return Err(e);
                }
            }
        }
    }
}

type TryBytes = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
impl ManifestStore for PgManifestStore {
    type Manifest = Manifest;
    type Error = Error;
    type ManifestBody = BoxStream<'static, TryBytes>;

    async fn head(&self, key: &ManifestRef) -> Result<Option<Self::Manifest>> {
        let mut conn = self.blobstore.metadata.get_conn().await?;
        if let Some(manifest) = conn.get_manifest(&self.repository.id, key).await? {
            Ok(Some(manifest))
        } else {
            Ok(None)
        }
    }

    async fn get(&self, key: &ManifestRef) -> Result<Option<(Self::Manifest, Self::ManifestBody)>> {
        let mut conn = self.blobstore.metadata.get_conn().await?;
        if let Some(manifest) = conn.get_manifest(&self.repository.id, key).await? {
            let body = self
                .blobstore
                .objects
                .get(&Key::from(&manifest.blob_id))
                .await?;
            Ok(Some((manifest, body.map_err(|e| e.into()).boxed())))
        } else {
            Ok(None)
        }
    }

    async fn put(
        &mut self,
        key: &ManifestRef,
        spec: &ManifestSpec,
        bytes: Bytes,
    ) -> Result<OciDigest> {
        let calculated_digest: OciDigest = bytes.as_ref().try_into()?;

        let byte_count = bytes.len();
        let blob_uuid = self
            .blobstore
            .put(&calculated_digest, byte_count as u64, bytes.into())
            .await?;

        let mut tx = self.blobstore.metadata.get_tx().await?;

        // spec.md step 4: a digest already present in the repo only skips
        // the insert+associate steps (5/6). A PUT of existing content under
        // a new tag must still run tag creation (step 7) below.
        let manifest = match tx
            .get_manifest(
                &self.repository.id,
                &ManifestRef::Digest(calculated_digest.clone()),
            )
            .await?
        {
            Some(m) => m,
            None => {
                self.insert_manifest_and_associations(
                    &mut tx,
                    spec,
                    blob_uuid,
                    calculated_digest.clone(),
                    byte_count as i64,
                )
                .await?
            }
        };

        if let ManifestRef::Tag(t) = key {
            // eventually we'll need to check the mutability of a tag before overwriting it
            // but for now we overwrite it by default
            self.tag_manifest(&mut tx, manifest, spec, blob_uuid, byte_count as i64, t.as_str())
                .await?;
        }

        tx.commit().await?;

        Ok(calculated_digest)
    }

    async fn delete(&mut self, key: &ManifestRef) -> Result<()> {
        let mut tx = self.blobstore.metadata.get_tx().await?;

        let manifest = tx
            .get_manifest(&self.repository.id, key)
            .await?
            .ok_or(CoreError::ManifestUnknown(None))?;

        let child_ids = tx.get_index_manifest_children(&manifest.id).await?;
        for child_id in &child_ids {
            match tx
                .acquire_gc_manifest_lock(child_id, self.gc.lock_timeout_ms, self.gc.review_window())
                .await
            {
                // lock held for the rest of this transaction, protecting the
                // child from a concurrent GC sweep while we drop this list's
                // reference to it.
                Ok(true) => {}
                // a concurrent GC sweep already reclaimed this child; nothing
                // left to protect.
                Ok(false) => {
                    tracing::debug!(
                        manifest_id = %child_id,
                        "child manifest already reclaimed by gc before parent delete",
                    );
                }
                Err(e) => {
                    self.reporter.report("gc_lock", &e);
                    return Err(e);
                }
            }
        }

        // NOTE: it's possible (but how likely?) for a manifest to include both layers and
        // manifests; we don't support creating both types of association for now, but we should
        // support deleting them here just in case
        tx.delete_image_layers(&manifest.id).await?;
        tx.delete_index_manifests(&manifest.id).await?;
        tx.delete_tags_by_manifest_id(&manifest.id).await?;
        tx.delete_manifest(&manifest.id).await?;

        // The manifest row is gone immediately, but its payload bytes (and the blob
        // row, which may still be referenced elsewhere) are only ever reclaimed by
        // GC once its review window elapses with no surviving reference.
        tx.insert_gc_blob_review_row(&manifest.blob_id).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn get_referrers(
        &self,
        subject: &OciDigest,
        artifact_type: Option<String>,
    ) -> Result<ImageIndex> {
        let mut index = ImageIndex::default();
        index.set_media_type(Some(MediaType::ImageIndex));

        let mut conn = self.blobstore.metadata.get_conn().await?;

        let manifests = conn
            .get_referrers(&self.repository.id, subject, &artifact_type)
            .await?;
        let count = manifests.len();

        let set = &mut tokio::task::JoinSet::new();
        for m in manifests.into_iter() {
            let objects = self.blobstore.objects.clone();
            if m.media_type.is_none() {
                tracing::warn!(
                    "manifest {} (digest {:?}) unexpectedly missing media type!",
                    m.id,
                    m.digest
                );
                continue;
            }
            let db_media_type = m.media_type.unwrap();
            set.spawn(async move {
                let stream = objects.get(&Key::from(&m.blob_id)).await?;
                let bs: Bytes = stream
                    .try_collect::<Vec<Bytes>>()
                    .await?
                    .into_iter()
                    .fold(BytesMut::new(), |mut acc, bs| {
                        acc.extend_from_slice(&bs);
                        acc
                    })
                    .into();
                let spec = ManifestSpec::try_from(&bs)?;
                let media_type = spec.media_type().unwrap_or(db_media_type);
                let mut d = Descriptor::new(media_type, bs.len() as i64, &m.digest);
                d.set_artifact_type(spec.artifact_type());
                d.set_annotations(spec.annotations());
                Ok(d)
            });
        }

        let mut ds: Vec<Descriptor> = Vec::with_capacity(count);
        while let Some(res) = set.join_next().await {
            let d = match res {
                Err(e @ tokio::task::JoinError { .. }) => {
                    if e.is_panic() {
                        tracing::error!(
                            "manifest deserialization task panicked while getting referrers for {:?}",
                            subject
                        );
                    }
                    return Err(e.into());
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(d)) => d,
            };
            ds.push(d);
        }

        ds.sort_unstable_by(|left, right| left.digest().cmp(right.digest()));
        index.set_manifests(ds);

        Ok(index)
    }

    async fn get_tags(&self, n: Option<i64>, last: Option<String>) -> Result<TagList> {
        let mut conn = self.blobstore.metadata.get_conn().await?;
        let taglist = TagListBuilder::default()
            .name(self.repository.name.as_str())
            .tags(
                conn.get_tags(&self.repository.id, n, last)
                    .await?
                    .into_iter()
                    .map(|t| t.name)
                    .collect::<Vec<_>>(),
            )
            .build()?;

        Ok(taglist)
    }
}
