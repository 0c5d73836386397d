use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use super::{file_response, read_request, run_blocking};
use crate::api::response::{ApiError, AppQuery};
use crate::fetch::FetchError;
use crate::staging::{CommitCoordinator, FileId};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// GET requests carry exactly one of these; the first present one wins.
#[derive(Debug, Deserialize)]
pub struct GetParams {
    #[serde(default)]
    pub fetch: Option<String>,
    #[serde(default)]
    pub restore: Option<String>,
    #[serde(default)]
    pub load: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Stage the posted field and answer with the first staged id as plain text.
pub async fn process(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, ApiError> {
    let inputs = read_request(&state, req).await?;
    let ingest = state.ingest.clone();
    let results = run_blocking(move || ingest.resolve_field(inputs)).await?;

    let mut first_error = None;
    for result in results {
        match result {
            Ok(entry) => {
                tracing::debug!(file_id = %entry.id(), "Processed upload");
                return Ok((
                    [(header::CONTENT_TYPE, "text/plain")],
                    entry.id().to_string(),
                )
                    .into_response());
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Err(ApiError::bad_request(format!(
            "No files found in field '{}'",
            state.config.field_name
        ))),
    }
}

pub async fn dispatch_get(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<GetParams>,
) -> Result<Response, ApiError> {
    if let Some(url) = params.fetch {
        return fetch(&state, &url).await;
    }
    if let Some(id) = params.restore {
        return restore(&state, &id).await;
    }
    if let Some(name) = params.load {
        return load(&state, &name).await;
    }
    Err(ApiError::bad_request(
        "one of fetch, restore or load must be provided",
    ))
}

/// Remove a staged file. The body is the id; always answers 204.
pub async fn revert(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    match FileId::parse(&String::from_utf8_lossy(&body)) {
        Ok(id) => {
            let store = Arc::clone(&state.staging);
            let _ = run_blocking(move || store.delete(&id)).await;
        }
        Err(e) => tracing::debug!(error = %e, "Ignoring revert request"),
    }
    StatusCode::NO_CONTENT
}

pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

// ============================================================================
// Helpers
// ============================================================================

async fn restore(state: &AppState, id: &str) -> Result<Response, ApiError> {
    if id.is_empty() {
        return Err(ApiError::bad_request("restore id must not be empty"));
    }
    let id = FileId::parse(id)?;
    let store = Arc::clone(&state.staging);
    let blob = run_blocking(move || store.retrieve(&id))
        .await??
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    Ok(file_response(blob))
}

async fn load(state: &AppState, name: &str) -> Result<Response, ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("load name must not be empty"));
    }
    let dir = state.upload_dir();
    let name = name.to_string();
    let blob = run_blocking(move || CommitCoordinator::load(&dir, &name))
        .await??
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    Ok(file_response(blob))
}

async fn fetch(state: &AppState, url: &str) -> Result<Response, ApiError> {
    if url.is_empty() {
        return Err(ApiError::bad_request("fetch url must not be empty"));
    }

    let remote = state.fetcher.fetch(url).await.map_err(|e| match e {
        FetchError::InvalidUrl(_) => ApiError::bad_request(e.to_string()),
        FetchError::Status(code) => ApiError::upstream(code, e.to_string()),
        FetchError::Request(_) => {
            tracing::warn!(url = %url, error = %e, "Remote fetch failed");
            ApiError::internal("Failed to fetch remote file")
        }
    })?;

    let length = remote.content.len() as u64;
    let mut response = (StatusCode::OK, remote.content).into_response();
    let headers = response.headers_mut();
    if let Some(value) = remote.content_type.and_then(|ct| ct.parse().ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    Ok(response)
}
