mod blobs;
mod config;
mod errors;
mod manifests;
mod metadata;
mod purge;
mod repositories;
mod upload_sessions;
mod validate;

pub use config::PgRepositoryConfig;
pub use config::PgRepositoryFactory;
pub use purge::UploadPurger;
pub use repositories::PgRepository;
