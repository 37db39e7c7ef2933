//#![warn(missing_docs)]
//! # Registry Core
//!
//! `registry_core` provides basic interoperability types between [`registry_http`] [an OCI
//! Distribution Spec implementation](https://github.com/opencontainers/distribution-spec) and
//! backend implementations such as [`registry_backend_postgres`].
//!
//! The primary set of interoperability types can be found in the [`crate::registry`] module.
pub mod errors;
pub use errors::{
    BlobError, DistributionErrorCode, Error, ManifestError, RegistryErrorCode, RepositoryError,
    Result, status_code,
};

mod oci_digest;
pub use oci_digest::{DigestState, Digester, OciDigest};

pub mod registry;

mod reporting;
pub use reporting::{ErrorReporter, TracingErrorReporter};

mod stream;
pub use stream::ChunkedBody;
pub use stream::DigestBody;

pub mod validate;
pub use validate::{ReferenceChecker, Validation, Validator, ValidatorConfig};
