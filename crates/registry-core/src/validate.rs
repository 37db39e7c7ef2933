//! Manifest validation: checks that a manifest's references resolve
//! within its target repository and that it satisfies operator-configured
//! reference-count and layer-URL policies.
//!
//! Backend-agnostic by design: validation needs only to ask "does this
//! digest exist/is it linked in the target repository", which is provided by
//! a small [`ReferenceChecker`] the backend implements (see
//! `registry_backend_postgres::validate::PgReferenceChecker`).

use once_cell::sync::Lazy;
use regex::Regex;

use oci_spec::image::{ImageIndex, ImageManifest, MediaType};

use crate::errors::{Error, RegistryErrorCode, Result};
use crate::oci_digest::OciDigest;
use crate::registry::ManifestSpec;

/// Operator-configured validation policy.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum number of references (layers+config, or child manifests) a
    /// manifest may carry.
    pub reference_limit: usize,
    /// If set, every layer URL (for manifests carrying foreign layers) must
    /// match this pattern.
    pub layer_url_allow: Option<String>,
    /// If set, no layer URL may match this pattern.
    pub layer_url_deny: Option<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            reference_limit: 1000,
            layer_url_allow: None,
            layer_url_deny: None,
        }
    }
}

impl ValidatorConfig {
    fn compiled_allow(&self) -> Result<Option<Regex>> {
        self.layer_url_allow
            .as_deref()
            .map(|p| Regex::new(p).map_err(|_| Error::BackendError(format!("invalid layer_url_allow pattern: {p}"))))
            .transpose()
    }

    fn compiled_deny(&self) -> Result<Option<Regex>> {
        self.layer_url_deny
            .as_deref()
            .map(|p| Regex::new(p).map_err(|_| Error::BackendError(format!("invalid layer_url_deny pattern: {p}"))))
            .transpose()
    }
}

/// Asks whether a digest is already known/linked within the repository a
/// manifest is being validated against.
#[async_trait::async_trait]
pub trait ReferenceChecker: Send + Sync {
    /// True if `digest` names a blob linked to the target repository.
    async fn blob_linked(&mut self, digest: &OciDigest) -> Result<bool>;
    /// True if `digest` names a manifest already stored in the target
    /// repository.
    async fn manifest_exists(&mut self, digest: &OciDigest) -> Result<bool>;
}

/// Recognized media types for manifest config/layer blobs.
static RECOGNIZED_BLOB_MEDIA_TYPES: Lazy<Vec<MediaType>> = Lazy::new(|| {
    vec![
        MediaType::ImageConfig,
        MediaType::ImageLayer,
        MediaType::ImageLayerGzip,
        MediaType::ImageLayerZstd,
        MediaType::ImageLayerNonDistributable,
        MediaType::ImageLayerNonDistributableGzip,
        MediaType::EmptyJSON,
        MediaType::Other("application/vnd.docker.container.image.v1+json".to_string()),
        MediaType::Other("application/vnd.docker.image.rootfs.diff.tar.gzip".to_string()),
        MediaType::Other("application/vnd.docker.image.rootfs.foreign.diff.tar.gzip".to_string()),
    ]
});

fn is_recognized_blob_media_type(mt: &MediaType) -> bool {
    RECOGNIZED_BLOB_MEDIA_TYPES.contains(mt)
}

/// Detects manifest lists that are actually BuildKit build caches whose
/// `manifests[]`
/// entries point at plain blobs rather than stored manifests. We treat a
/// list as such a cache when every descriptor's media type looks like a
/// generic/foreign blob type rather than one of the known manifest media
/// types.
pub fn looks_like_buildkit_cache_index(index: &ImageIndex) -> bool {
    let manifests = index.manifests();
    if manifests.is_empty() {
        return false;
    }
    manifests.iter().all(|d| {
        !matches!(
            d.media_type(),
            MediaType::ImageManifest | MediaType::ImageIndex
        ) && !matches!(
            d.media_type(),
            MediaType::Other(s) if s.contains("manifest.v2") || s.contains("manifest.list")
        )
    })
}

/// Outcome of validating a manifest: whether it should be stored with the
/// `non_conformant` flag set for BuildKit compatibility.
pub struct Validation {
    pub non_conformant: bool,
}

pub struct Validator<'a> {
    config: &'a ValidatorConfig,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate `spec` against the repository reachable through `checker`.
    pub async fn validate<C: ReferenceChecker>(
        &self,
        spec: &ManifestSpec,
        checker: &mut C,
    ) -> Result<Validation> {
        match spec {
            ManifestSpec::Image(img) => {
                self.validate_image(img, checker).await?;
                Ok(Validation {
                    non_conformant: false,
                })
            }
            ManifestSpec::Index(idx) => {
                if looks_like_buildkit_cache_index(idx) {
                    // Treated as an OCI image manifest whose "layers" are
                    // the index's descriptor list; callers re-run
                    // reference checks via validate_buildkit_image.
                    self.validate_buildkit_image(idx, checker).await?;
                    Ok(Validation {
                        non_conformant: true,
                    })
                } else {
                    self.validate_index(idx, checker).await?;
                    Ok(Validation {
                        non_conformant: false,
                    })
                }
            }
        }
    }

    async fn validate_image<C: ReferenceChecker>(
        &self,
        img: &ImageManifest,
        checker: &mut C,
    ) -> Result<()> {
        let mut refs: Vec<(OciDigest, MediaType, bool)> = Vec::new();
        refs.push((
            img.config().digest().as_str().try_into()?,
            img.config().media_type().clone(),
            false,
        ));
        for layer in img.layers() {
            refs.push((
                layer.digest().as_str().try_into()?,
                layer.media_type().clone(),
                layer.urls().is_some(),
            ));
        }

        if refs.len() > self.config.reference_limit {
            return Err(Error::RegistrySpecError(
                RegistryErrorCode::ManifestReferenceLimit,
            ));
        }

        self.check_media_types(&refs)?;
        self.check_layer_urls(img)?;

        let mut missing = Vec::new();
        for (digest, _, _) in &refs {
            if !checker.blob_linked(digest).await? {
                missing.push(String::from(digest));
            }
        }
        if !missing.is_empty() {
            return Err(blob_unknown_error(&missing));
        }

        Ok(())
    }

    /// Validates a BuildKit cache index as if it were an image manifest:
    /// its `manifests[]` descriptors are treated as layer-equivalent blob
    /// references that must already be linked to the repository. The
    /// original digest/payload bytes are preserved verbatim by the caller;
    /// this only checks referential integrity.
    async fn validate_buildkit_image<C: ReferenceChecker>(
        &self,
        idx: &ImageIndex,
        checker: &mut C,
    ) -> Result<()> {
        let descriptors = idx.manifests();
        if descriptors.len() > self.config.reference_limit {
            return Err(Error::RegistrySpecError(
                RegistryErrorCode::ManifestReferenceLimit,
            ));
        }

        let mut missing = Vec::new();
        for d in descriptors {
            let digest: OciDigest = d.digest().as_str().try_into()?;
            if !checker.blob_linked(&digest).await? {
                missing.push(String::from(&digest));
            }
        }
        if !missing.is_empty() {
            return Err(blob_unknown_error(&missing));
        }
        Ok(())
    }

    async fn validate_index<C: ReferenceChecker>(
        &self,
        idx: &ImageIndex,
        checker: &mut C,
    ) -> Result<()> {
        let descriptors = idx.manifests();
        if descriptors.len() > self.config.reference_limit {
            return Err(Error::RegistrySpecError(
                RegistryErrorCode::ManifestReferenceLimit,
            ));
        }

        let mut missing = Vec::new();
        for d in descriptors {
            let digest: OciDigest = d.digest().as_str().try_into()?;
            if !checker.manifest_exists(&digest).await? {
                missing.push(String::from(&digest));
            }
        }
        if !missing.is_empty() {
            return Err(Error::ManifestUnknown(Some(format!(
                "{} referenced manifest(s) not found in repository: {}",
                missing.len(),
                missing.join(", ")
            ))));
        }

        Ok(())
    }

    fn check_media_types(&self, refs: &[(OciDigest, MediaType, bool)]) -> Result<()> {
        for (digest, media_type, non_conformant_ok) in refs {
            if *non_conformant_ok {
                continue;
            }
            if !is_recognized_blob_media_type(media_type) {
                return Err(Error::ManifestInvalid(Some(format!(
                    "unrecognized media type {media_type:?} for reference {}",
                    String::from(digest)
                ))));
            }
        }
        Ok(())
    }

    fn check_layer_urls(&self, img: &ImageManifest) -> Result<()> {
        let allow = self.config.compiled_allow()?;
        let deny = self.config.compiled_deny()?;
        if allow.is_none() && deny.is_none() {
            return Ok(());
        }
        for layer in img.layers() {
            let Some(urls) = layer.urls().as_ref() else {
                continue;
            };
            for url in urls {
                if let Some(deny) = &deny {
                    if deny.is_match(url) {
                        return Err(Error::ManifestInvalid(Some(format!(
                            "layer url {url} matches deny pattern"
                        ))));
                    }
                }
                if let Some(allow) = &allow {
                    if !allow.is_match(url) {
                        return Err(Error::ManifestInvalid(Some(format!(
                            "layer url {url} does not match allow pattern"
                        ))));
                    }
                }
            }
        }
        Ok(())
    }
}

fn blob_unknown_error(missing: &[String]) -> Error {
    Error::ManifestBlobUnknown(Some(format!(
        "{} referenced blob(s) not found in repository: {}",
        missing.len(),
        missing.join(", ")
    )))
}
