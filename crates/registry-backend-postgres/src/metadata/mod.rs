mod postgres;
pub use postgres::{PostgresConfig, PostgresMetadataConn, PostgresMetadataPool, PostgresMetadataTx};

mod types;
pub use types::{
    Blob, Blobs, Chunk, Chunks, GcBlobReviewQueue, GcManifestReviewQueue, IndexManifests, Layers,
    Manifest, Manifests, Repositories, Repository, Tag, Tags, UploadSession, UploadSessions,
};
