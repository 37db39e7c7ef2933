use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use registry_core::registry::RepositoryStore;
use registry_core::registry::RepositoryStoreManager;

use super::empty_or_invalid_as_none;
use super::empty_string_as_none;
use super::encode_link_cursor;
use super::errors::Result;
use super::Portfolio;

pub fn router<M, R>() -> Router<Portfolio<M, R>>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    Router::new().route("/", get(get_catalog::<M, R>))
}

#[derive(Debug, Deserialize)]
struct GetCatalogParams {
    #[serde(default, deserialize_with = "empty_or_invalid_as_none")]
    n: Option<i64>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    last: Option<String>,
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

async fn get_catalog<M, R>(
    State(portfolio): State<Portfolio<M, R>>,
    Query(params): Query<GetCatalogParams>,
) -> Result<Response>
where
    M: RepositoryStoreManager<RepositoryStore = R>,
    R: RepositoryStore,
{
    // n=0 means "no limit" per the distribution spec; normalize it away so
    // the Link-header logic below doesn't treat it as a page size.
    let n = params.n.filter(|n| *n > 0);
    let repositories = portfolio.list_repositories(n, params.last).await?;

    let mut headers = HeaderMap::new();
    if let Some(n) = n {
        if let Some(last) = repositories.last() {
            if repositories.len() as i64 == n {
                let last = encode_link_cursor(last);
                let link = format!("</v2/_catalog?last={last}&n={n}>; rel=\"next\"");
                headers.insert(header::LINK, HeaderValue::from_str(&link)?);
            }
        }
    }

    Ok((
        StatusCode::OK,
        headers,
        Json(Catalog { repositories }),
    )
        .into_response())
}
