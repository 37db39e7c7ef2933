use http::StatusCode;
pub use oci_spec::distribution::ErrorCode as DistributionErrorCode;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Non-standard error codes, reported alongside the OCI distribution spec's
/// own error codes but not defined by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RegistryErrorCode {
    ContentReferenced = 99, // content referenced elsewhere
    /// A manifest carries more references (layers+config, or child
    /// manifests) than the configured limit allows.
    ManifestReferenceLimit = 100,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    #[error("backend error: {0}")]
    BackendError(String),

    // distribution error codes
    // https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes
    #[error("distribution spec error")]
    DistributionSpecError(DistributionErrorCode),

    #[error("registry spec error")]
    RegistrySpecError(RegistryErrorCode),

    #[error("too many requests")]
    TooManyRequests,
    #[error("operation unsupported")]
    OperationUnsupported,
    #[error("blob writer already finished")]
    BlobWriterFinished,

    #[error("repository name unknown to registry: {0:?}")]
    NameUnknown(Option<String>),
    #[error("blob unknown to registry: {0:?}")]
    BlobUnknown(Option<String>),
    #[error("blob upload invalid: {0:?}")]
    BlobUploadInvalid(Option<String>),
    #[error("manifest unknown to registry: {0:?}")]
    ManifestUnknown(Option<String>),
    #[error("manifest invalid: {0:?}")]
    ManifestInvalid(Option<String>),
    #[error("manifest references a manifest or blob unknown to registry: {0:?}")]
    ManifestBlobUnknown(Option<String>),
    #[error("provided length did not match content length: {0:?}")]
    SizeInvalid(Option<String>),

    /// Raised when a `SELECT ... FOR UPDATE` row lock used to coordinate
    /// with garbage collection cannot be acquired within the configured
    /// timeout.
    #[error("timed out waiting for garbage collection lock")]
    GcLockTimeout,
}

/// Errors surfaced by [`crate::registry::BlobStore`] and
/// [`crate::registry::BlobWriter`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("invalid digest: {0}")]
    DigestInvalid(String),
    #[error("invalid upload session id: {0}")]
    UuidError(#[from] uuid::Error),
    #[error("provided length did not match content length")]
    SizeInvalid,
    #[error("blob upload invalid")]
    BlobUploadInvalid,
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalidS(String),
    #[error("blob upload unknown to registry")]
    BlobUploadUnknown,
    #[error("blob unknown to registry")]
    BlobUnknown,
    #[error(transparent)]
    GenericSpecError(Error),
}

impl From<Error> for BlobError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidDigest(s) => BlobError::DigestInvalid(s),
            Error::UnsupportedDigestAlgorithm(s) => BlobError::DigestInvalid(s),
            Error::BlobUnknown(_) => BlobError::BlobUnknown,
            Error::BlobUploadInvalid(Some(s)) => BlobError::BlobUploadInvalidS(s),
            Error::BlobUploadInvalid(None) => BlobError::BlobUploadInvalid,
            Error::SizeInvalid(_) => BlobError::SizeInvalid,
            e => BlobError::GenericSpecError(e),
        }
    }
}

/// Errors surfaced by [`crate::registry::ManifestStore`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest invalid")]
    Invalid,
    #[error("manifest unknown to registry")]
    Unknown,
    #[error("manifest too big")]
    TooBig,
    #[error("manifest references a manifest or blob unknown to registry")]
    ManifestBlobUnknown,
    #[error("manifest invalid: {0}")]
    InvalidS(String),
    #[error("manifest unknown to registry: {0}")]
    UnknownS(String),
    #[error("layer unknown to registry: {0}")]
    LayerUnknown(String),
    #[error("referenced manifest unknown to registry: {0}")]
    ReferencedManifestUnknown(String),
    #[error(transparent)]
    GenericSpecError(Error),
}

impl From<Error> for ManifestError {
    fn from(e: Error) -> Self {
        match e {
            Error::ManifestInvalid(Some(s)) => ManifestError::InvalidS(s),
            Error::ManifestInvalid(None) => ManifestError::Invalid,
            Error::ManifestUnknown(Some(s)) => ManifestError::UnknownS(s),
            Error::ManifestUnknown(None) => ManifestError::Unknown,
            Error::ManifestBlobUnknown(_) => ManifestError::ManifestBlobUnknown,
            e => ManifestError::GenericSpecError(e),
        }
    }
}

/// Errors surfaced by [`crate::registry::RepositoryStore`] and
/// [`crate::registry::RepositoryStoreManager`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("repository name unknown to registry")]
    Unknown,
    #[error("repository name invalid")]
    Invalid,
    #[error("authentication required")]
    Unauthorized,
    #[error("access to the requested resource is denied")]
    Denied,
    #[error(transparent)]
    GenericSpecError(Error),
}

impl From<Error> for RepositoryError {
    fn from(e: Error) -> Self {
        match e {
            Error::NameUnknown(_) => RepositoryError::Unknown,
            e => RepositoryError::GenericSpecError(e),
        }
    }
}

/// Maps an OCI distribution-spec error code to the HTTP status code the
/// spec prescribes for it.
pub fn status_code(c: &DistributionErrorCode) -> StatusCode {
    match c {
        DistributionErrorCode::BlobUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::BlobUploadInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
        DistributionErrorCode::BlobUploadUnknown => StatusCode::BAD_REQUEST,
        DistributionErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
        // spec.md S5: a manifest referencing a blob the validator can't find
        // in the repository is a client-side mistake in the manifest
        // payload, not a missing-resource lookup -- distinct from
        // `BlobUnknown`'s 404.
        DistributionErrorCode::ManifestBlobUnknown => StatusCode::BAD_REQUEST,
        DistributionErrorCode::ManifestInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::ManifestUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::NameInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::NameUnknown => StatusCode::NOT_FOUND,
        DistributionErrorCode::SizeInvalid => StatusCode::BAD_REQUEST,
        DistributionErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        DistributionErrorCode::Denied => StatusCode::FORBIDDEN,
        DistributionErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
        DistributionErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
    }
}
