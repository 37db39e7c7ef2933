use axum::extract::{Extension, Query};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use serde::Deserialize;

use registry_core::registry::{ManifestStore, RepositoryStore};

use super::empty_or_invalid_as_none;
use super::empty_string_as_none;
use super::encode_link_cursor;
use super::errors::Result;

pub fn router<R: RepositoryStore>() -> Router {
    Router::new().route("/list", get(get_tags::<R>))
}

#[derive(Debug, Deserialize)]
struct GetListParams {
    #[serde(default, deserialize_with = "empty_or_invalid_as_none")]
    n: Option<i64>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    last: Option<String>,
}

async fn get_tags<R: RepositoryStore>(
    Extension(repository): Extension<R>,
    Query(params): Query<GetListParams>,
) -> Result<Response> {
    // n=0 means "no limit" per the distribution spec; normalize it away so
    // the Link-header logic below doesn't treat it as a page size.
    let n = params.n.filter(|n| *n > 0);
    let mstore = repository.get_manifest_store();
    let tags_list = mstore
        .get_tags(n, params.last)
        .await
        .map_err(|e| e.into())?;

    let mut headers = HeaderMap::new();
    if let Some(n) = n {
        if let Some(last) = tags_list.tags().last() {
            if tags_list.tags().len() as i64 == n {
                let last = encode_link_cursor(last);
                let link = format!(
                    "</v2/{}/tags/list?last={last}&n={n}>; rel=\"next\"",
                    repository.name(),
                );
                headers.insert(header::LINK, HeaderValue::from_str(&link)?);
            }
        }
    }

    Ok((StatusCode::OK, headers, Json(tags_list)).into_response())
}
