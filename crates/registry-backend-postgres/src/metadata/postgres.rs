use sea_query::{Alias, Expr, OnConflict, Order, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::types::Uuid;
use sqlx::{PgConnection, Pool, Row, Transaction};

use registry_core::registry::ManifestRef;
use registry_core::{DigestState, OciDigest};

use super::super::errors::{Error, Result};
use super::types::{
    Blob, Blobs, Chunk, Chunks, GcBlobReviewQueue, GcManifestReviewQueue, IndexManifests, Layers,
    Manifest, Manifests, Repositories, Repository, RepositoryBlobs, Tag, Tags, UploadSession,
    UploadSessions,
};

#[derive(Clone, Deserialize)]
pub struct PostgresConfig {
    connection_string: String,
    /// Upper bound on the number of pooled connections held open at once.
    #[serde(default = "PostgresConfig::default_max_open")]
    max_open: u32,
    /// Minimum number of idle connections the pool keeps warm.
    #[serde(default)]
    max_idle: u32,
    /// Maximum lifetime, in seconds, a pooled connection may live before
    /// it's closed and replaced, regardless of how recently it was used.
    #[serde(default = "PostgresConfig::default_max_lifetime_secs")]
    max_lifetime_secs: u64,
}

impl PostgresConfig {
    fn default_max_open() -> u32 {
        10
    }

    fn default_max_lifetime_secs() -> u64 {
        30 * 60
    }

    pub async fn new_metadata(&self) -> Result<PostgresMetadataPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_open)
            .min_connections(self.max_idle)
            .max_lifetime(std::time::Duration::from_secs(self.max_lifetime_secs))
            .connect(&self.connection_string)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(PostgresMetadataPool { pool })
    }
}

#[derive(Clone)]
pub struct PostgresMetadataPool {
    pool: Pool<Postgres>,
}

impl PostgresMetadataPool {
    pub async fn get_conn(&self) -> Result<PostgresMetadataConn> {
        Ok(PostgresMetadataConn {
            conn: self.pool.acquire().await?,
        })
    }

    pub async fn get_tx(&self) -> Result<PostgresMetadataTx> {
        Ok(PostgresMetadataTx {
            tx: Some(self.pool.begin().await?),
        })
    }
}

pub struct PostgresMetadataConn {
    conn: PoolConnection<Postgres>,
}

// A collection of queries that are only require a `&mut PgConnection` and don't care whether it
// came from a transaction or a pool connection.
struct Queries {}

impl Queries {
    pub async fn insert_repository(executor: &mut PgConnection, name: &str) -> Result<Repository> {
        let (sql, values) = Query::insert()
            .into_table(Repositories::Table)
            .columns([Repositories::Name])
            .values([Value::from(name).into()])?
            .returning(Query::returning().columns([Repositories::Id, Repositories::Name]))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_one(executor)
            .await?)
    }

    pub async fn get_repository(
        executor: &mut PgConnection,
        repository: &str,
    ) -> Result<Option<Repository>> {
        let (sql, values) = Query::select()
            .from(Repositories::Table)
            .columns([
                (Repositories::Table, Repositories::Id),
                (Repositories::Table, Repositories::Name),
            ])
            .and_where(Expr::col((Repositories::Table, Repositories::Name)).eq(repository))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn get_repositories(
        executor: &mut PgConnection,
        n: Option<i64>,
        last: Option<String>,
    ) -> Result<Vec<Repository>> {
        let mut builder = Query::select();
        builder
            .from(Repositories::Table)
            .columns([Repositories::Id, Repositories::Name]);

        // A zero or absent `n` means "no limit": return the full sorted list.
        match (n, last) {
            (Some(n), Some(last)) if n > 0 => {
                builder
                    .and_where(Expr::col(Repositories::Name).gt(last))
                    .limit(n as u64);
            }
            (Some(n), None) if n > 0 => {
                builder.limit(n as u64);
            }
            (_, Some(last)) => {
                builder.and_where(Expr::col(Repositories::Name).gt(last));
            }
            (_, None) => {}
        }
        builder.order_by(Repositories::Name, Order::Asc);

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn repository_exists(executor: &mut PgConnection, name: &str) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .from(Repositories::Table)
                        .column(Repositories::Id)
                        .and_where(Expr::col(Repositories::Name).eq(name))
                        .to_owned(),
                ),
                Alias::new("exists"),
            )
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;

        Ok(row.try_get("exists")?)
    }
    pub async fn insert_blob(
        executor: &mut PgConnection,
        digest: &OciDigest,
        bytes_on_disk: i64,
    ) -> Result<Uuid> {
        let (sql, values) = Query::insert()
            .into_table(Blobs::Table)
            .columns([Blobs::Digest, Blobs::BytesOnDisk])
            .values([String::from(digest).into(), bytes_on_disk.into()])?
            .returning_col(Blobs::Id)
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_blob(executor: &mut PgConnection, digest: &OciDigest) -> Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            // TODO: impl Value for OciDigest
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn get_blobs(executor: &mut PgConnection, digests: &Vec<&str>) -> Result<Vec<Blob>> {
        let digests = digests.iter().map(Clone::clone);
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Id, Blobs::Digest, Blobs::BytesOnDisk])
            // TODO: impl Value for OciDigest
            .and_where(Expr::col(Blobs::Digest).is_in(digests))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn delete_blob(executor: &mut PgConnection, blob_id: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .cond_where(Expr::col(Blobs::Id).eq(*blob_id))
            .build_sqlx(PostgresQueryBuilder);
        match sqlx::query_with(&sql, values).execute(executor).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(dberr)) => match dberr.kind() {
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    tracing::warn!("foreign key violation error: {dberr}");
                    Err(Error::DistributionSpecError(
                        registry_core::DistributionErrorCode::ContentReferenced,
                    ))
                }
                _ => Err(sqlx::Error::Database(dberr).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn link_blob_to_repository(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        blob_id: &Uuid,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(RepositoryBlobs::Table)
            .columns([RepositoryBlobs::RepositoryId, RepositoryBlobs::BlobId])
            .values([Value::from(*repository_id).into(), Value::from(*blob_id).into()])?
            .on_conflict(
                OnConflict::columns([RepositoryBlobs::RepositoryId, RepositoryBlobs::BlobId])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_blob_in_repository(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([
                (Blobs::Table, Blobs::Id),
                (Blobs::Table, Blobs::Digest),
                (Blobs::Table, Blobs::BytesOnDisk),
            ])
            .inner_join(
                RepositoryBlobs::Table,
                Expr::col((RepositoryBlobs::Table, RepositoryBlobs::BlobId))
                    .equals((Blobs::Table, Blobs::Id)),
            )
            .and_where(
                Expr::col((RepositoryBlobs::Table, RepositoryBlobs::RepositoryId))
                    .eq(*repository_id),
            )
            .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn blob_linked_to_repository(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .from(Blobs::Table)
                        .column((Blobs::Table, Blobs::Id))
                        .inner_join(
                            RepositoryBlobs::Table,
                            Expr::col((RepositoryBlobs::Table, RepositoryBlobs::BlobId))
                                .equals((Blobs::Table, Blobs::Id)),
                        )
                        .and_where(
                            Expr::col((RepositoryBlobs::Table, RepositoryBlobs::RepositoryId))
                                .eq(*repository_id),
                        )
                        .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(String::from(digest)))
                        .to_owned(),
                ),
                Alias::new("exists"),
            )
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;

        Ok(row.try_get("exists")?)
    }

    pub async fn unlink_blob_from_repository(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        blob_id: &Uuid,
    ) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(RepositoryBlobs::Table)
            .cond_where(Expr::col(RepositoryBlobs::RepositoryId).eq(*repository_id))
            .cond_where(Expr::col(RepositoryBlobs::BlobId).eq(*blob_id))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_manifests(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        digests: &Vec<&str>,
    ) -> Result<Vec<Manifest>> {
        let digests = digests.iter().map(Clone::clone);
        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .columns([
                (Manifests::Table, Manifests::Id),
                (Manifests::Table, Manifests::RepositoryId),
                (Manifests::Table, Manifests::BlobId),
                (Manifests::Table, Manifests::MediaType),
                (Manifests::Table, Manifests::ArtifactType),
                (Manifests::Table, Manifests::Digest),
                (Manifests::Table, Manifests::Subject),
                (Manifests::Table, Manifests::NonConformant),
            ])
            .column((Blobs::Table, Blobs::BytesOnDisk))
            .left_join(
                Blobs::Table,
                Expr::col((Manifests::Table, Manifests::BlobId)).equals((Blobs::Table, Blobs::Id)),
            )
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(*repository_id))
            .and_where(Expr::col((Manifests::Table, Manifests::Digest)).is_in(digests))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn get_manifest(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        manifest_ref: &ManifestRef,
    ) -> Result<Option<Manifest>> {
        let mut builder = Query::select();
        builder
            .from(Manifests::Table)
            .columns([
                (Manifests::Table, Manifests::Id),
                (Manifests::Table, Manifests::RepositoryId),
                (Manifests::Table, Manifests::BlobId),
                (Manifests::Table, Manifests::MediaType),
                (Manifests::Table, Manifests::ArtifactType),
                (Manifests::Table, Manifests::Digest),
                (Manifests::Table, Manifests::Subject),
                (Manifests::Table, Manifests::NonConformant),
            ])
            .column((Blobs::Table, Blobs::BytesOnDisk))
            .left_join(
                Blobs::Table,
                Expr::col((Manifests::Table, Manifests::BlobId)).equals((Blobs::Table, Blobs::Id)),
            )
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(*repository_id));

        match manifest_ref {
            ManifestRef::Digest(d) => {
                builder.and_where(
                    Expr::col((Manifests::Table, Manifests::Digest)).eq(String::from(d)),
                );
            }
            ManifestRef::Tag(t) => {
                builder
                    .left_join(
                        Tags::Table,
                        Expr::col((Tags::Table, Tags::ManifestId))
                            .equals((Manifests::Table, Manifests::Id)),
                    )
                    .and_where(Expr::col((Tags::Table, Tags::Name)).eq(t));
            }
        }

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn insert_manifest(executor: &mut PgConnection, manifest: &Manifest) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Manifests::Table)
            .columns([
                Manifests::Id,
                Manifests::RepositoryId,
                Manifests::BlobId,
                Manifests::MediaType,
                Manifests::ArtifactType,
                Manifests::Digest,
                Manifests::Subject,
                Manifests::NonConformant,
            ])
            .values([
                Value::from(manifest.id).into(),
                Value::from(manifest.repository_id).into(),
                Value::from(manifest.blob_id).into(),
                Value::from(manifest.media_type.clone().map(String::from)).into(),
                Value::from(manifest.artifact_type.clone().map(String::from)).into(),
                Value::from(String::from(&manifest.digest)).into(),
                Value::from(manifest.subject.clone().map(String::from)).into(),
                Value::from(manifest.non_conformant).into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn delete_manifest(executor: &mut PgConnection, manifest_id: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Manifests::Table)
            .cond_where(Expr::col(Manifests::Id).eq(*manifest_id))
            .build_sqlx(PostgresQueryBuilder);

        match sqlx::query_with(&sql, values).execute(executor).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(dberr)) => match dberr.kind() {
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    tracing::warn!("foreign key violation error: {dberr}");
                    Err(Error::DistributionSpecError(
                        registry_core::DistributionErrorCode::ContentReferenced,
                    ))
                }
                _ => Err(sqlx::Error::Database(dberr).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn associate_image_layers(
        executor: &mut PgConnection,
        parent: &Uuid,
        children: Vec<&Uuid>,
    ) -> Result<()> {
        let mut builder = Query::insert();
        builder
            .into_table(Layers::Table)
            .columns([Layers::Manifest, Layers::Blob]);

        for child in children.iter() {
            builder.values([
                Value::from(parent.clone()).into(),
                Value::from((*child).clone()).into(),
            ])?;
        }

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;

        Ok(())
    }

    pub async fn delete_image_layers(executor: &mut PgConnection, parent: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Layers::Table)
            .cond_where(Expr::col(Layers::Manifest).eq(*parent))
            .build_sqlx(PostgresQueryBuilder);

        match sqlx::query_with(&sql, values).execute(executor).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(dberr)) => match dberr.kind() {
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    tracing::warn!("foreign key violation error: {dberr}");
                    Err(Error::DistributionSpecError(
                        registry_core::DistributionErrorCode::ContentReferenced,
                    ))
                }
                _ => Err(sqlx::Error::Database(dberr).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_index_manifest_children(
        executor: &mut PgConnection,
        parent: &Uuid,
    ) -> Result<Vec<Uuid>> {
        let (sql, values) = Query::select()
            .from(IndexManifests::Table)
            .column(IndexManifests::ChildManifest)
            .and_where(Expr::col(IndexManifests::ParentManifest).eq(*parent))
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("child_manifest").map_err(Error::from))
            .collect()
    }

    pub async fn associate_index_manifests(
        executor: &mut PgConnection,
        parent: &Uuid,
        children: Vec<&Uuid>,
    ) -> Result<()> {
        let mut builder = Query::insert();
        builder.into_table(IndexManifests::Table).columns([
            IndexManifests::ParentManifest,
            IndexManifests::ChildManifest,
        ]);

        for child in children.iter() {
            builder.values([
                Value::from(parent.clone()).into(),
                Value::from((*child).clone()).into(),
            ])?;
        }

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn delete_index_manifests(executor: &mut PgConnection, parent: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(IndexManifests::Table)
            .cond_where(Expr::col(IndexManifests::ParentManifest).eq(*parent))
            .build_sqlx(PostgresQueryBuilder);

        match sqlx::query_with(&sql, values).execute(executor).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(dberr)) => match dberr.kind() {
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    tracing::warn!("foreign key violation error: {dberr}");
                    Err(Error::DistributionSpecError(
                        registry_core::DistributionErrorCode::ContentReferenced,
                    ))
                }
                _ => Err(sqlx::Error::Database(dberr).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn upsert_tag(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        manifest_id: &Uuid,
        tag: &str,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Tags::Table)
            .columns([Tags::Name, Tags::RepositoryId, Tags::ManifestId])
            .values([
                Value::from(tag).into(),
                Value::from(*repository_id).into(),
                Value::from(*manifest_id).into(),
            ])?
            .on_conflict(
                OnConflict::columns([Tags::RepositoryId, Tags::Name])
                    .update_columns([Tags::ManifestId])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_tags(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        n: Option<i64>,
        last: Option<String>,
    ) -> Result<Vec<Tag>> {
        let mut builder = Query::select();
        builder
            .columns([Tags::ManifestId, Tags::Name])
            .column((Manifests::Table, Manifests::Digest))
            .left_join(
                Manifests::Table,
                Expr::col((Tags::Table, Tags::ManifestId))
                    .equals((Manifests::Table, Manifests::Id)),
            )
            .from(Tags::Table)
            .and_where(Expr::col((Tags::Table, Tags::RepositoryId)).eq(*repository_id));

        // A zero or absent `n` means "no limit": return the full sorted list.
        match (n, last) {
            (Some(n), Some(last)) if n > 0 => {
                builder
                    .and_where(
                        Expr::tuple([
                            Expr::col((Tags::Table, Tags::RepositoryId)).into(),
                            Expr::col(Tags::Name).into(),
                        ])
                        .gt(Expr::tuple([
                            Expr::value(*repository_id),
                            Expr::value(last),
                        ])),
                    )
                    .limit(n as u64);
            }
            (Some(n), None) if n > 0 => {
                builder.limit(n as u64);
            }
            (_, Some(last)) => {
                builder.and_where(
                    Expr::tuple([
                        Expr::col((Tags::Table, Tags::RepositoryId)).into(),
                        Expr::col(Tags::Name).into(),
                    ])
                    .gt(Expr::tuple([Expr::value(*repository_id), Expr::value(last)])),
                );
            }
            (_, None) => {}
        }
        builder.order_by_columns(vec![
            ((Tags::Table, Tags::Name), Order::Asc),
            ((Tags::Table, Tags::RepositoryId), Order::Asc),
        ]);

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn delete_tags_by_manifest_id(
        executor: &mut PgConnection,
        manifest_id: &Uuid,
    ) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Tags::Table)
            .cond_where(Expr::col(Tags::ManifestId).eq(*manifest_id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn get_chunks(
        executor: &mut PgConnection,
        session: &UploadSession,
    ) -> Result<Vec<Chunk>> {
        let (sql, values) = Query::select()
            .from(Chunks::Table)
            .columns([Chunks::ETag, Chunks::ChunkNumber])
            .and_where(Expr::col(Chunks::UploadSessionUuid).eq(session.uuid))
            .order_by(Chunks::ChunkNumber, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Chunk, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn insert_chunk(
        executor: &mut PgConnection,
        session: &UploadSession,
        chunk: &Chunk,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Chunks::Table)
            .columns([Chunks::ChunkNumber, Chunks::UploadSessionUuid, Chunks::ETag])
            .values([
                Value::from(chunk.chunk_number).into(),
                Value::from(session.uuid).into(),
                Value::from(chunk.e_tag.clone()).into(),
            ])?
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn delete_chunks(executor: &mut PgConnection, uuid: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Chunks::Table)
            .and_where(Expr::col(Chunks::UploadSessionUuid).eq(*uuid))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn new_upload_session(executor: &mut PgConnection) -> Result<UploadSession> {
        let state = DigestState::default();
        let value = serde_json::value::to_value(state)?;
        let (sql, values) = Query::insert()
            .into_table(UploadSessions::Table)
            .columns([UploadSessions::DigestState])
            .values([Expr::value(value)])?
            .returning(Query::returning().columns([
                UploadSessions::Uuid,
                UploadSessions::StartDate,
                UploadSessions::UploadId,
                UploadSessions::ChunkNumber,
                UploadSessions::LastRangeEnd,
                UploadSessions::DigestState,
            ]))
            .build_sqlx(PostgresQueryBuilder);
        let session = sqlx::query_as_with::<_, UploadSession, _>(&sql, values)
            .fetch_one(executor)
            .await?;

        Ok(session)
    }

    pub async fn get_session(executor: &mut PgConnection, uuid: &Uuid) -> Result<UploadSession> {
        let (sql, values) = Query::select()
            .from(UploadSessions::Table)
            .columns([
                UploadSessions::Uuid,
                UploadSessions::StartDate,
                UploadSessions::ChunkNumber,
                UploadSessions::LastRangeEnd,
                UploadSessions::UploadId,
                UploadSessions::DigestState,
            ])
            .and_where(Expr::col(UploadSessions::Uuid).eq(*uuid))
            .build_sqlx(PostgresQueryBuilder);
        let session = sqlx::query_as_with::<_, UploadSession, _>(&sql, values)
            .fetch_one(executor)
            .await?;

        Ok(session)
    }

    pub async fn update_session(
        executor: &mut PgConnection,
        session: &UploadSession,
    ) -> Result<()> {
        let state = serde_json::value::to_value(&session.digest_state)?;
        let (sql, values) = Query::update()
            .table(UploadSessions::Table)
            .and_where(Expr::col(UploadSessions::Uuid).eq(session.uuid))
            .value(UploadSessions::UploadId, session.upload_id.clone())
            .value(UploadSessions::ChunkNumber, session.chunk_number)
            .value(UploadSessions::LastRangeEnd, session.last_range_end)
            .value(UploadSessions::DigestState, state)
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn delete_session(executor: &mut PgConnection, uuid: &Uuid) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(UploadSessions::Table)
            .and_where(Expr::col(UploadSessions::Uuid).eq(*uuid))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    /// Deletes upload sessions (and, via `ON DELETE CASCADE`, their chunks)
    /// started before `before`, for the periodic stale-upload purge.
    pub async fn delete_stale_sessions(
        executor: &mut PgConnection,
        before: chrono::NaiveDate,
    ) -> Result<u64> {
        let (sql, values) = Query::delete()
            .from_table(UploadSessions::Table)
            .and_where(Expr::col(UploadSessions::StartDate).lt(before))
            .build_sqlx(PostgresQueryBuilder);

        Ok(sqlx::query_with(&sql, values)
            .execute(executor)
            .await?
            .rows_affected())
    }

    pub async fn get_referrers(
        executor: &mut PgConnection,
        repository_id: &Uuid,
        subject: &OciDigest,
        artifact_type: &Option<String>,
    ) -> Result<Vec<Manifest>> {
        let mut builder = Query::select();
        builder
            .from(Manifests::Table)
            .columns([
                (Manifests::Table, Manifests::Id),
                (Manifests::Table, Manifests::RepositoryId),
                (Manifests::Table, Manifests::BlobId),
                (Manifests::Table, Manifests::MediaType),
                (Manifests::Table, Manifests::ArtifactType),
                (Manifests::Table, Manifests::Digest),
                (Manifests::Table, Manifests::Subject),
                (Manifests::Table, Manifests::NonConformant),
            ])
            .column((Blobs::Table, Blobs::BytesOnDisk))
            .left_join(
                Blobs::Table,
                Expr::col((Manifests::Table, Manifests::BlobId)).equals((Blobs::Table, Blobs::Id)),
            )
            .order_by(Manifests::Digest, Order::Asc)
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(*repository_id))
            .and_where(Expr::col((Manifests::Table, Manifests::Subject)).eq(String::from(subject)));

        if let Some(artifact_type) = artifact_type {
            builder.and_where(
                Expr::col((Manifests::Table, Manifests::ArtifactType)).eq(artifact_type),
            );
        }

        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn insert_gc_manifest_review_row(
        executor: &mut PgConnection,
        manifest_id: &Uuid,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(GcManifestReviewQueue::Table)
            .columns([GcManifestReviewQueue::ManifestId])
            .values([Value::from(*manifest_id).into()])?
            .on_conflict(
                OnConflict::column(GcManifestReviewQueue::ManifestId)
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    pub async fn insert_gc_blob_review_row(executor: &mut PgConnection, blob_id: &Uuid) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(GcBlobReviewQueue::Table)
            .columns([GcBlobReviewQueue::BlobId])
            .values([Value::from(*blob_id).into()])?
            .on_conflict(
                OnConflict::column(GcBlobReviewQueue::BlobId)
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    /// Row-lock acquisition for the GC write-path coordination protocol:
    /// bounds the wait on the GC-manifest-review row for `manifest_id` with
    /// `lock_timeout_ms`,
    /// restricted to rows whose `review_after` has not been pushed out past
    /// `review_window` from now. Returns `Ok(false)` rather than an error
    /// when the row is simply gone -- the GC already claimed and deleted
    /// the manifest out from under the caller -- so callers can
    /// distinguish "go recreate the manifest" from "the lock timed out".
    pub async fn acquire_gc_manifest_lock(
        executor: &mut PgConnection,
        manifest_id: &Uuid,
        lock_timeout_ms: i64,
        review_window: chrono::Duration,
    ) -> Result<bool> {
        sqlx::query(&format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
            .execute(&mut *executor)
            .await?;

        let threshold = chrono::Utc::now() + review_window;
        let (sql, values) = Query::select()
            .from(GcManifestReviewQueue::Table)
            .column(GcManifestReviewQueue::ManifestId)
            .and_where(Expr::col(GcManifestReviewQueue::ManifestId).eq(*manifest_id))
            .and_where(Expr::col(GcManifestReviewQueue::ReviewAfter).lt(threshold))
            .lock(sea_query::LockType::Update)
            .build_sqlx(PostgresQueryBuilder);

        match sqlx::query_with(&sql, values)
            .fetch_optional(&mut *executor)
            .await
        {
            Ok(row) => Ok(row.is_some()),
            Err(sqlx::Error::Database(dberr)) if dberr.code().as_deref() == Some("55P03") => {
                Err(registry_core::Error::GcLockTimeout.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Blob-queue analogue of [`Queries::acquire_gc_manifest_lock`], used
    /// before a blob's own row is deleted so a concurrent GC sweep
    /// reviewing the same blob for reclamation can't race with the delete.
    pub async fn acquire_gc_blob_lock(
        executor: &mut PgConnection,
        blob_id: &Uuid,
        lock_timeout_ms: i64,
        review_window: chrono::Duration,
    ) -> Result<bool> {
        sqlx::query(&format!("SET LOCAL lock_timeout = '{lock_timeout_ms}ms'"))
            .execute(&mut *executor)
            .await?;

        let threshold = chrono::Utc::now() + review_window;
        let (sql, values) = Query::select()
            .from(GcBlobReviewQueue::Table)
            .column(GcBlobReviewQueue::BlobId)
            .and_where(Expr::col(GcBlobReviewQueue::BlobId).eq(*blob_id))
            .and_where(Expr::col(GcBlobReviewQueue::ReviewAfter).lt(threshold))
            .lock(sea_query::LockType::Update)
            .build_sqlx(PostgresQueryBuilder);

        match sqlx::query_with(&sql, values)
            .fetch_optional(&mut *executor)
            .await
        {
            Ok(row) => Ok(row.is_some()),
            Err(sqlx::Error::Database(dberr)) if dberr.code().as_deref() == Some("55P03") => {
                Err(registry_core::Error::GcLockTimeout.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// PoolConnection<Postgres>-based metadata queries.
impl PostgresMetadataConn {
    pub async fn insert_repository(&mut self, name: &str) -> Result<Repository> {
        Queries::insert_repository(&mut *self.conn, name).await
    }

    pub async fn get_repository(&mut self, repository: &str) -> Result<Option<Repository>> {
        Queries::get_repository(&mut *self.conn, repository).await
    }

    pub async fn repository_exists(&mut self, name: &str) -> Result<bool> {
        Queries::repository_exists(&mut *self.conn, name).await
    }

    pub async fn get_repositories(
        &mut self,
        n: Option<i64>,
        last: Option<String>,
    ) -> Result<Vec<Repository>> {
        Queries::get_repositories(&mut *self.conn, n, last).await
    }

    pub async fn insert_blob(&mut self, digest: &OciDigest, bytes_on_disk: i64) -> Result<Uuid> {
        Queries::insert_blob(&mut *self.conn, digest, bytes_on_disk).await
    }

    pub async fn get_blob(&mut self, digest: &OciDigest) -> Result<Option<Blob>> {
        Queries::get_blob(&mut *self.conn, digest).await
    }

    pub async fn get_blob_in_repository(
        &mut self,
        repository_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<Option<Blob>> {
        Queries::get_blob_in_repository(&mut *self.conn, repository_id, digest).await
    }

    pub async fn get_manifest(
        &mut self,
        repository_id: &Uuid,
        manifest_ref: &ManifestRef,
    ) -> Result<Option<Manifest>> {
        Queries::get_manifest(&mut *self.conn, repository_id, manifest_ref).await
    }

    pub async fn get_tags(
        &mut self,
        repository_id: &Uuid,
        n: Option<i64>,
        last: Option<String>,
    ) -> Result<Vec<Tag>> {
        Queries::get_tags(&mut *self.conn, repository_id, n, last).await
    }

    pub async fn new_upload_session(&mut self) -> Result<UploadSession> {
        Queries::new_upload_session(&mut *self.conn).await
    }

    pub async fn get_session(&mut self, uuid: &Uuid) -> Result<UploadSession> {
        Queries::get_session(&mut *self.conn, uuid).await
    }

    pub async fn update_session(&mut self, session: &UploadSession) -> Result<()> {
        Queries::update_session(&mut *self.conn, session).await
    }

    pub async fn delete_chunks(&mut self, uuid: &Uuid) -> Result<()> {
        Queries::delete_chunks(&mut *self.conn, uuid).await
    }

    pub async fn delete_session(&mut self, uuid: &Uuid) -> Result<()> {
        Queries::delete_session(&mut *self.conn, uuid).await
    }

    pub async fn delete_stale_sessions(&mut self, before: chrono::NaiveDate) -> Result<u64> {
        Queries::delete_stale_sessions(&mut *self.conn, before).await
    }

    pub async fn get_chunks(&mut self, session: &UploadSession) -> Result<Vec<Chunk>> {
        Queries::get_chunks(&mut *self.conn, session).await
    }

    pub async fn insert_chunk(&mut self, session: &UploadSession, chunk: &Chunk) -> Result<()> {
        Queries::insert_chunk(&mut *self.conn, session, chunk).await
    }

    pub async fn get_referrers(
        &mut self,
        repository_id: &Uuid,
        subject: &OciDigest,
        artifact_type: &Option<String>,
    ) -> Result<Vec<Manifest>> {
        Queries::get_referrers(&mut *self.conn, repository_id, subject, artifact_type).await
    }
}

// Wrapper around a Postgres transaction with the ability to commit transactions.
pub struct PostgresMetadataTx<'a> {
    tx: Option<Transaction<'a, Postgres>>,
}

impl<'a> PostgresMetadataTx<'a> {
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(t) = self.tx.take() {
            Ok(t.commit().await?)
        } else {
            Ok(())
        }
    }

    pub async fn insert_blob(&mut self, digest: &OciDigest, bytes_on_disk: i64) -> Result<Uuid> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::insert_blob(&mut **tx, digest, bytes_on_disk).await
    }

    pub async fn insert_chunk(&mut self, session: &UploadSession, chunk: &Chunk) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::insert_chunk(&mut **tx, session, chunk).await
    }

    pub async fn get_chunks(&mut self, session: &UploadSession) -> Result<Vec<Chunk>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_chunks(&mut **tx, session).await
    }

    pub async fn delete_chunks(&mut self, uuid: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_chunks(&mut **tx, uuid).await
    }

    pub async fn update_session(&mut self, session: &UploadSession) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::update_session(&mut **tx, session).await
    }

    pub async fn delete_session(&mut self, uuid: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_session(&mut **tx, uuid).await
    }

    pub async fn delete_stale_sessions(&mut self, before: chrono::NaiveDate) -> Result<u64> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_stale_sessions(&mut **tx, before).await
    }

    pub async fn get_blob(&mut self, digest: &OciDigest) -> Result<Option<Blob>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_blob(&mut **tx, digest).await
    }

    pub async fn get_blobs(&mut self, digests: &Vec<&str>) -> Result<Vec<Blob>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_blobs(&mut **tx, digests).await
    }

    pub async fn delete_blob(&mut self, blob_id: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_blob(&mut **tx, blob_id).await
    }

    pub async fn get_blob_in_repository(
        &mut self,
        repository_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<Option<Blob>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_blob_in_repository(&mut **tx, repository_id, digest).await
    }

    pub async fn blob_linked_to_repository(
        &mut self,
        repository_id: &Uuid,
        digest: &OciDigest,
    ) -> Result<bool> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::blob_linked_to_repository(&mut **tx, repository_id, digest).await
    }

    pub async fn link_blob_to_repository(
        &mut self,
        repository_id: &Uuid,
        blob_id: &Uuid,
    ) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::link_blob_to_repository(&mut **tx, repository_id, blob_id).await
    }

    pub async fn unlink_blob_from_repository(
        &mut self,
        repository_id: &Uuid,
        blob_id: &Uuid,
    ) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::unlink_blob_from_repository(&mut **tx, repository_id, blob_id).await
    }

    pub async fn get_manifests(
        &mut self,
        repository_id: &Uuid,
        digests: &Vec<&str>,
    ) -> Result<Vec<Manifest>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_manifests(&mut **tx, repository_id, digests).await
    }

    pub async fn get_manifest(
        &mut self,
        repository_id: &Uuid,
        reference: &ManifestRef,
    ) -> Result<Option<Manifest>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_manifest(&mut **tx, repository_id, reference).await
    }

    pub async fn insert_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::insert_manifest(&mut **tx, manifest).await
    }

    pub async fn delete_manifest(&mut self, manifest_id: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_manifest(&mut **tx, manifest_id).await
    }

    pub async fn associate_image_layers(
        &mut self,
        parent: &Uuid,
        children: Vec<&Uuid>,
    ) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::associate_image_layers(&mut **tx, parent, children).await
    }

    pub async fn delete_image_layers(&mut self, parent: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_image_layers(&mut **tx, parent).await
    }

    pub async fn associate_index_manifests(
        &mut self,
        parent: &Uuid,
        children: Vec<&Uuid>,
    ) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::associate_index_manifests(&mut **tx, parent, children).await
    }

    pub async fn get_index_manifest_children(&mut self, parent: &Uuid) -> Result<Vec<Uuid>> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::get_index_manifest_children(&mut **tx, parent).await
    }

    pub async fn delete_index_manifests(&mut self, parent: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_index_manifests(&mut **tx, parent).await
    }

    pub async fn upsert_tag(
        &mut self,
        repository_id: &Uuid,
        manifest_id: &Uuid,
        tag: &str,
    ) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::upsert_tag(&mut **tx, repository_id, manifest_id, tag).await
    }

    pub async fn delete_tags_by_manifest_id(&mut self, manifest_id: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::delete_tags_by_manifest_id(&mut **tx, manifest_id).await
    }

    pub async fn insert_gc_manifest_review_row(&mut self, manifest_id: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::insert_gc_manifest_review_row(&mut **tx, manifest_id).await
    }

    pub async fn insert_gc_blob_review_row(&mut self, blob_id: &Uuid) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::insert_gc_blob_review_row(&mut **tx, blob_id).await
    }

    pub async fn acquire_gc_manifest_lock(
        &mut self,
        manifest_id: &Uuid,
        lock_timeout_ms: i64,
        review_window: chrono::Duration,
    ) -> Result<bool> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::acquire_gc_manifest_lock(&mut **tx, manifest_id, lock_timeout_ms, review_window).await
    }

    pub async fn acquire_gc_blob_lock(
        &mut self,
        blob_id: &Uuid,
        lock_timeout_ms: i64,
        review_window: chrono::Duration,
    ) -> Result<bool> {
        let tx = self.tx.as_mut().ok_or(Error::PostgresMetadataTxInactive)?;
        Queries::acquire_gc_blob_lock(&mut **tx, blob_id, lock_timeout_ms, review_window).await
    }
}
