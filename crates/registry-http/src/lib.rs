//! # Portfolio HTTP
//!
//! `registry_http` provides an implementation of the [Distribution
//! Spec](https://github.com/opencontainers/distribution-spec) that is generic over traits defined
//! in [`registry_core`] and therefore compatible with any number of possible implementations.
//!
//! ## Example `main.rs`
//!
//! Below is an example taken from the [`portfolio`] crate that demonstrates how one might
//! initialize an Axum HTTP server using a suitable backend implementation -- in this case, the
//! Postgres + S3 implementation found in [`registry_backend_postgres`].
//!
//! ```rust
//! use std::fs::File;
//! use std::io::Read;
//! use std::path::PathBuf;
//!
//! use anyhow::Result;
//! use axum::middleware;
//! use clap::Parser;
//!
//! use registry_backend_postgres::{PgRepository, PgRepositoryFactory};
//! use registry_http::{add_basic_repository_extensions, Portfolio};
//!
//! mod config;
//! use crate::config::{Config, RepositoryBackend};
//!
//! #[derive(Parser)]
//! struct Cli {
//!     #[arg(short, long)]
//!     config_file: Option<PathBuf>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cli = Cli::parse();
//!
//!     // load configuration
//!     let mut dev_config = File::open(cli.config_file.unwrap_or("./dev-config.yml".into()))?;
//!     let mut s = String::new();
//!     dev_config.read_to_string(&mut s)?;
//!     let config: Config = serde_yaml::from_str(&s)?;
//!
//!     // initialize persistence layer
//!     let portfolio = match config.backend {
//!         RepositoryBackend::Postgres(cfg) => {
//!             let manager = cfg.get_manager().await?;
//!             Portfolio::<PgRepositoryFactory, PgRepository>::new(manager)
//!         }
//!     };
//!
//!     // configure static repositories
//!     if let Some(repositories) = config.static_repositories {
//!         portfolio
//!             .initialize_static_repositories(repositories)
//!             .await?;
//!     }
//!
//!     // retrieve axum router from Portfolio instance
//!     let router = match portfolio.router() {
//!         Err(e) => return Err(e.into()),
//!         Ok(r) => r,
//!     };
//!
//!     // add necessary Tower layer to inject RepositoryStore instances to all routes in the
//!     // router.
//!     let router = router.route_layer(middleware::from_fn_with_state(
//!         portfolio.clone(),
//!         add_basic_repository_extensions,
//!     ));
//!
//!     // run axum HTTP server
//!     axum::Server::bind(&"0.0.0.0:13030".parse()?)
//!         .serve(router.into_make_service())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::Response as HttpResponse;
use http_body::Body;
use serde::{de, Deserialize, Deserializer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{self, TraceLayer};

use registry_migrate::{Decision, LegacyFilesystemStore, MigrationConfig, MigrationRouter};

mod errors;
pub(crate) use errors::Error;
pub(crate) use errors::Result;

pub(crate) mod blobs;
mod catalog;
pub(crate) mod headers;
mod manifests;
mod referrers;
mod tags;

use registry_core::registry::RepositoryStore;
use registry_core::registry::RepositoryStoreManager;
use registry_core::Error as CoreError;
use registry_core::{ErrorReporter, TracingErrorReporter};

/// Configuration struct defining parameters for statically-defined repositories initialized at
/// program startup if they don't already exist.
#[derive(Clone, Deserialize)]
pub struct RepositoryDefinition {
    /// Name of repository to initialize.
    pub name: String,
}

/// Per-request outcome of the migration router's decision, plus the legacy
/// store needed to act on it. Inserted as an [`axum::Extension`] by
/// [`add_basic_repository_extensions`] alongside the resolved
/// [`RepositoryStore`], so write handlers can mirror to the legacy
/// filesystem layout without threading the migration router itself through
/// every handler signature.
#[derive(Clone)]
pub(crate) struct MigrationContext {
    pub(crate) decision: Decision,
    pub(crate) legacy: Arc<LegacyFilesystemStore>,
}

/// Adds a [`axum::Extension`] containing a [`RepositoryStore`] for use in HTTP handlers. This is
/// not included in the default [`axum::Router`] returned by [`self::Portfolio`] to enable users
/// to add their own logic to determin how repositories are created or accessed.
pub async fn add_basic_repository_extensions<M, R, B>(
    State(portfolio): State<Portfolio<M, R>>,
    Path(path_params): Path<HashMap<String, String>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    let repo_name = match path_params.get("repository") {
        Some(s) => s,
        None => return Err(Error::MissingPathParameter("repository")),
    };

    let repository = match portfolio.get_repository(repo_name).await {
        Err(e) => {
            tracing::warn!("error retrieving repository: {e:?}");
            return Err(CoreError::NameUnknown(None).into());
        }
        Ok(Some(r)) => r,
        Ok(None) => portfolio.insert_repository(repo_name).await?,
    };

    let decision = match portfolio.migration.decide(repo_name, portfolio.legacy.as_ref()).await {
        Ok(d) => d,
        Err(e) => {
            portfolio.reporter.report("migration", &e);
            return Err(Error::MigrationError(e));
        }
    };
    req.extensions_mut().insert(MigrationContext {
        decision,
        legacy: portfolio.legacy.clone(),
    });

    req.extensions_mut().insert(repository);

    Ok(next.run(req).await)
}

/// Standard caching/addressing headers added to every blob and manifest
/// fetch response (§6 "Required response headers"): `Docker-Content-Digest`,
/// a quoted `ETag`, and a one-year `Cache-Control` -- content is immutable
/// once it exists under a given digest, so it's always safe to cache.
pub(crate) fn add_content_address_headers(headers: &mut HeaderMap, digest: &str) -> Result<()> {
    headers.insert(
        HeaderName::from_lowercase(b"docker-content-digest")?,
        HeaderValue::from_str(digest)?,
    );
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&format!("\"{digest}\""))?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=31536000"),
    );
    Ok(())
}

/// True if the request's `If-None-Match` header names `digest`, whether
/// quoted (`"sha256:..."`) or bare (`sha256:...`) -- clients disagree on
/// whether to quote the value, so both are accepted.
pub(crate) fn if_none_match_hits(headers: &HeaderMap, digest: &str) -> bool {
    let Some(value) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    value
        .split(',')
        .map(|v| v.trim().trim_matches('"'))
        .any(|v| v == digest || v == "*")
}

/// Percent-encodes a pagination cursor for embedding in a `Link` header's
/// `last=` query parameter, matching the encoding a client's query-string
/// parser expects on the following request (e.g. a `/`-bearing repository
/// path in a catalog cursor).
fn encode_link_cursor(value: &str) -> std::borrow::Cow<'_, str> {
    percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC).into()
}

/// Serde deserialization decorator to map empty Strings to None,
fn empty_string_as_none<'de, D, T>(de: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => FromStr::from_str(s).map_err(de::Error::custom).map(Some),
    }
}

/// Like [`empty_string_as_none`], but also maps a value that fails to parse
/// to `None` instead of rejecting the request. Used for pagination `n`
/// parameters, where a non-integer value is treated the same as an absent
/// one -- the full, unpaginated list is returned rather than a 400.
fn empty_or_invalid_as_none<'de, D, T>(de: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => Ok(FromStr::from_str(s).ok()),
    }
}

fn maybe_get_content_length(response: &HttpResponse<impl Body>) -> Option<HeaderValue> {
    if let Some(size) = response.body().size_hint().exact() {
        Some(
            HeaderValue::from_str(&size.to_string())
                .expect("size should have valid to_string conversion"),
        )
    } else {
        None
    }
}

async fn version() -> Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str("application/json")?,
    );
    Ok((StatusCode::OK, headers, "{}").into_response())
}

/// Centralizes management of Portfolio registries and provides an [`axum::Router`] that implements
/// the [Distribution Spec](https://github.com/opencontainers/distribution-spec).
///
/// Generic over a [`RepositoryStoreManager`] implementation `M` and the
/// [`RepositoryStore`] `R` it produces, so that the router and its middleware can be
/// monomorphized down to a single concrete backend (eg
/// [`registry_backend_postgres::PgRepositoryFactory`] /
/// [`registry_backend_postgres::PgRepository`]) rather than dispatching through trait objects.
pub struct Portfolio<M, R>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    manager: Arc<M>,
    migration: Arc<MigrationRouter>,
    legacy: Arc<LegacyFilesystemStore>,
    reporter: Arc<dyn ErrorReporter>,
    _repository: PhantomData<R>,
}

impl<M, R> Clone for Portfolio<M, R>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            migration: self.migration.clone(),
            legacy: self.legacy.clone(),
            reporter: self.reporter.clone(),
            _repository: PhantomData,
        }
    }
}

impl<M, R> Portfolio<M, R>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    /// Builds a [`Portfolio`] with the database path fully authoritative for
    /// every repository and no legacy filesystem mirroring -- the same
    /// behavior as a [`MigrationConfig::default`] migration router. Use
    /// [`Portfolio::with_migration`] to enable per-repository migration.
    pub fn new(manager: M) -> Self {
        Self {
            manager: Arc::new(manager),
            migration: Arc::new(
                MigrationRouter::new(MigrationConfig::default())
                    .expect("default migration config always compiles"),
            ),
            legacy: Arc::new(LegacyFilesystemStore::new(std::env::temp_dir())),
            reporter: Arc::new(TracingErrorReporter),
            _repository: PhantomData,
        }
    }

    /// Enables per-repository migration, rooting the legacy filesystem
    /// mirror at `legacy_root`. Repositories matching `config`'s
    /// include/exclude filters dual-write to both the database and the
    /// legacy `/docker/registry/v2/...` layout until their filesystem
    /// presence is gone.
    pub fn with_migration(
        mut self,
        config: MigrationConfig,
        legacy_root: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        self.migration = Arc::new(MigrationRouter::new(config).map_err(Error::MigrationError)?);
        self.legacy = Arc::new(LegacyFilesystemStore::new(legacy_root));
        Ok(self)
    }

    pub async fn initialize_static_repositories(
        &self,
        repositories: Vec<RepositoryDefinition>,
    ) -> Result<()> {
        for repository_config in repositories {
            match self.get_repository(&repository_config.name).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    tracing::info!(
                        "static repository '{}' not found, inserting into DB",
                        repository_config.name,
                    );
                    self.insert_repository(&repository_config.name).await?
                }
                Err(e) => return Err(e),
            };
        }
        Ok(())
    }

    async fn get_repository(&self, name: &str) -> Result<Option<R>> {
        self.manager
            .get(name)
            .await
            .map_err(|e| Error::RepositoryError(e.into()))
    }

    async fn insert_repository(&self, name: &str) -> Result<R> {
        self.manager
            .create(name)
            .await
            .map_err(|e| Error::RepositoryError(e.into()))
    }

    async fn list_repositories(&self, n: Option<i64>, last: Option<String>) -> Result<Vec<String>> {
        self.manager
            .list_repositories(n, last)
            .await
            .map_err(|e| Error::RepositoryError(e.into()))
    }

    /// Return an [`axum::Router`] that implements the Distribution Specification.
    pub fn router(&self) -> Result<axum::Router> {
        let blobs = blobs::router::<R>();
        let manifests = manifests::router::<R>();
        let referrers = referrers::router::<R>();
        let tags = tags::router::<R>();

        let repository = Router::new()
            .nest("/blobs", blobs)
            .nest("/manifests", manifests)
            .nest("/referrers", referrers)
            .nest("/tags", tags);

        let catalog = catalog::router::<M, R>().with_state(self.clone());

        let app = Router::new()
            .route("/v2/", get(version))
            .nest("/v2/:repository", repository)
            .nest("/v2/_catalog", catalog)
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new().include_headers(true))
                    .on_response(trace::DefaultOnResponse::new())
                    .on_request(trace::DefaultOnRequest::new()),
            )
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("docker-distribution-api-version")?,
                HeaderValue::from_str("registry/2.0")?,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::HeaderName::from_static("x-content-type-options"),
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("content-type")?,
                HeaderValue::from_str("application/json")?,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::CONTENT_LENGTH,
                maybe_get_content_length,
            ));

        Ok(app)
    }
}
