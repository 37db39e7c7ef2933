use bytes::Bytes;
use derive_builder::Builder;
use hyper::body::Body;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, History, ImageConfiguration, ImageManifest,
    ImageManifestBuilder, MediaType,
    ImageIndex, ImageIndexBuilder,
};

use registry_core::registry::{
    BlobStore, ManifestRef, ManifestSpec, ManifestStore, RepositoryStore, RepositoryStoreManager,
};
use registry_core::{BlobError, ManifestError, OciDigest, RepositoryError};

mod errors;
use errors::{Error, Result};

pub struct DistributionTester<RSM: RepositoryStoreManager> {
    mgr: RSM,
}

#[derive(Builder, Clone)]
#[builder(build_fn(skip))]
pub struct Layer {
    pub data: Bytes,
    pub history: Option<History>,

    #[builder(setter(skip))]
    pub descriptor: Descriptor,
}

impl LayerBuilder {
    pub fn build(self) -> Result<Layer> {
        let data = self.data.ok_or(Error::LayerBuilderError(
            "must include data to construct Layer".to_string(),
        ))?;
        let digest = OciDigest::try_from(data.as_ref())?;
        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .digest(digest)
            .size(data.len() as i64)
            .build()
            .expect("must set all required fields for descriptor");
        Ok(Layer {
            data,
            descriptor,
            history: self.history.flatten(),
        })
    }
}

#[derive(Builder, Clone)]
#[builder(build_fn(skip))]
pub struct Image {
    pub config: ImageConfiguration,
    pub layers: Vec<Layer>,

    // artifact_type and subject are duplicated in the ImageConfiguration, but put here for the
    // sake of generating a builder method to allow users to specify them for the ImageConfiguring
    // when building an image.
    #[allow(dead_code)]
    artifact_type: Option<MediaType>,
    #[allow(dead_code)]
    subject: Option<Descriptor>,

    #[builder(setter(skip))]
    pub manifest: ImageManifest,
}

impl ImageBuilder {
    pub fn build(self) -> Result<Image> {
        let config = self.config.ok_or(Error::ImageBuilderError(
            "must include image configuration to construct image".to_string(),
        ))?;
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = OciDigest::try_from(config_bytes.as_slice())?;
        let config_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(config_digest)
            .size(config_bytes.len() as i64)
            .build()
            .expect("must set all required fields for descriptor");

        let layers = self.layers.unwrap_or_else(Vec::new);
        let layer_descriptors = layers
            .iter()
            .map(|l| l.descriptor.clone())
            .collect::<Vec<Descriptor>>();

        let artifact_type = self.artifact_type.flatten();
        let subject = self.subject.flatten();

        let mut manifest_builder = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .layers(layer_descriptors)
            .config(config_descriptor);

        if let Some(ref artifact_type) = artifact_type {
            manifest_builder = manifest_builder.artifact_type(artifact_type.clone());
        }

        if let Some(ref subject) = subject {
            manifest_builder = manifest_builder.subject(subject.clone());
        }

        let manifest = manifest_builder
            .build()
            .expect("must set all required fields for image manifest");

        Ok(Image {
            config,
            manifest,
            layers,
            artifact_type,
            subject,
        })
    }
}

#[derive(Builder)]
#[builder(build_fn(skip))]
pub struct Index {
    pub manifests: Vec<Image>,

    // artifact_type and subject are duplicated in the ImageConfiguration, but put here for the
    // sake of generating a builder method to allow users to specify them for the ImageConfiguring
    // when building an image.
    #[allow(dead_code)]
    artifact_type: Option<MediaType>,
    #[allow(dead_code)]
    subject: Option<Descriptor>,

    #[builder(setter(skip))]
    pub index_manifest: ImageIndex,
}

impl IndexBuilder {
    pub fn build(self) -> Result<Index> {
        let manifests = self.manifests.unwrap_or_else(Vec::new);
        let manifest_descriptors = manifests
            .iter()
            .map(|m| m.manifest.config().clone())
            .collect::<Vec<Descriptor>>();

        let artifact_type = self.artifact_type.flatten();
        let subject = self.subject.flatten();

        let mut manifest_builder = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(manifest_descriptors);

        if let Some(ref artifact_type) = artifact_type {
            manifest_builder = manifest_builder.artifact_type(artifact_type.clone());
        }

        if let Some(ref subject) = subject {
            manifest_builder = manifest_builder.subject(subject.clone());
        }

        let index_manifest = manifest_builder
            .build()
            .expect("must set all required fields for image manifest");

        Ok(Index {
            manifests,
            index_manifest,
            artifact_type,
            subject,
        })
    }
}

impl<RSM: RepositoryStoreManager> DistributionTester<RSM> {
    pub fn new(mgr: RSM) -> Self {
        Self { mgr }
    }

    pub async fn generate_basic_image(&self) -> Result<()> {
        self.mgr
            .create("repo_1")
            .await
            .map_err(|e| Error::RepositoryError(Into::<RepositoryError>::into(e).to_string()))?;
        Ok(())
    }

    async fn repo(&self, name: &str) -> Result<RSM::RepositoryStore> {
        if let Some(repo) = self
            .mgr
            .get(name)
            .await
            .map_err(|e| Error::RepositoryError(Into::<RepositoryError>::into(e).to_string()))?
        {
            Ok(repo)
        } else {
            Ok(self
                .mgr
                .create(name)
                .await
                .map_err(|e| Error::RepositoryError(Into::<RepositoryError>::into(e).to_string()))?)
        }
    }

    /// Pushes `image`'s layers, config, and manifest into `repo_name`,
    /// tagging it `tag` if given, and returns the computed manifest digest.
    pub async fn push_image(
        &self,
        repo_name: &str,
        image: &Image,
        tag: Option<&str>,
    ) -> Result<OciDigest> {
        let repo = self.repo(repo_name).await?;
        let mut blobs = repo.get_blob_store();
        let mut manifests = repo.get_manifest_store();

        for layer in &image.layers {
            let digest: OciDigest = layer.descriptor.digest().as_str().try_into()?;
            blobs
                .put(&digest, layer.data.len() as u64, Body::from(layer.data.clone()))
                .await
                .map_err(|e| Error::BlobStoreError(Into::<BlobError>::into(e).to_string()))?;
        }

        let config_bytes = serde_json::to_vec(&image.config)?;
        let config_digest: OciDigest = image.manifest.config().digest().as_str().try_into()?;
        blobs
            .put(
                &config_digest,
                config_bytes.len() as u64,
                Body::from(config_bytes),
            )
            .await
            .map_err(|e| Error::BlobStoreError(Into::<BlobError>::into(e).to_string()))?;

        let manifest_bytes = Bytes::from(serde_json::to_vec(&image.manifest)?);
        let key = match tag {
            Some(t) => ManifestRef::Tag(t.to_string()),
            None => ManifestRef::Digest(manifest_bytes.as_ref().try_into()?),
        };
        manifests
            .put(&key, &ManifestSpec::Image(image.manifest.clone()), manifest_bytes)
            .await
            .map_err(|e| Error::ManifestStoreError(Into::<ManifestError>::into(e).to_string()))
    }

    /// Pushes every image referenced by `index`, then the index manifest
    /// itself, tagging it `tag` if given.
    pub async fn push_index(
        &self,
        repo_name: &str,
        index: &Index,
        tag: Option<&str>,
    ) -> Result<OciDigest> {
        for image in &index.manifests {
            self.push_image(repo_name, image, None).await?;
        }

        let repo = self.repo(repo_name).await?;
        let mut manifests = repo.get_manifest_store();

        let manifest_bytes = Bytes::from(serde_json::to_vec(&index.index_manifest)?);
        let key = match tag {
            Some(t) => ManifestRef::Tag(t.to_string()),
            None => ManifestRef::Digest(manifest_bytes.as_ref().try_into()?),
        };
        manifests
            .put(&key, &ManifestSpec::Index(index.index_manifest.clone()), manifest_bytes)
            .await
            .map_err(|e| Error::ManifestStoreError(Into::<ManifestError>::into(e).to_string()))
    }

    /// Returns the stored manifest for `key`, if any -- useful for
    /// asserting a tag does or does not resolve after a push/delete.
    pub async fn head_manifest(
        &self,
        repo_name: &str,
        key: &ManifestRef,
    ) -> Result<
        Option<<<RSM::RepositoryStore as RepositoryStore>::ManifestStore as ManifestStore>::Manifest>,
    > {
        let repo = self.repo(repo_name).await?;
        let manifests = repo.get_manifest_store();
        manifests
            .head(key)
            .await
            .map_err(|e| Error::ManifestStoreError(Into::<ManifestError>::into(e).to_string()))
    }
}
