mod health;
mod submit;
mod uploads;

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use tokio::io::AsyncWriteExt;

use crate::api::response::ApiError;
use crate::staging::{BinaryPart, FieldInput, FileBlob, ItemSource};
use crate::AppState;

pub use health::health;
pub use submit::submit;
pub use uploads::{dispatch_get, preflight, process, revert};

/// Collect the upload field from a multipart or an urlencoded form body.
async fn read_request(state: &AppState, req: Request) -> Result<Vec<FieldInput>, ApiError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| {
                ApiError::bad_request(format!("Invalid multipart data: {}", e.body_text()))
            })?;
        read_field(state, multipart).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, &())
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid form data: {}", e.body_text())))?;
        Ok(pairs
            .into_iter()
            .filter(|(name, _)| state.config.matches_field(name))
            .map(|(_, value)| FieldInput::from_text(value))
            .collect())
    } else {
        Err(ApiError::bad_request(
            "Expected a multipart/form-data or application/x-www-form-urlencoded body",
        ))
    }
}

/// Run filesystem work on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        tracing::error!(error = %e, "Blocking task failed");
        ApiError::internal("Internal server error")
    })
}

/// Collect every value posted under the configured upload field.
///
/// File parts are spooled into the staging root as they stream in, so staging
/// them later is a rename. Text values are classified as ids or inline payloads.
async fn read_field(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<Vec<FieldInput>, ApiError> {
    let mut inputs = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        if !state.config.matches_field(&field_name) {
            continue;
        }

        let file_name = field.file_name().map(|s| s.to_string());
        match file_name {
            Some(file_name) if !file_name.is_empty() => {
                let content_type = field.content_type().map(|s| s.to_string());
                let store = Arc::clone(&state.staging);
                let spool = run_blocking(move || store.incoming()).await??;
                let (spool, spool_path) = spool.into_parts();
                let mut spool = tokio::fs::File::from_std(spool);
                let mut size = 0u64;

                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?
                {
                    size += chunk.len() as u64;
                    if size > state.config.max_upload_size {
                        return Err(ApiError::payload_too_large(format!(
                            "File exceeds maximum upload size of {} bytes",
                            state.config.max_upload_size
                        )));
                    }
                    spool
                        .write_all(&chunk)
                        .await
                        .map_err(|e| ApiError::internal(format!("Failed to spool upload: {e}")))?;
                }
                spool
                    .flush()
                    .await
                    .map_err(|e| ApiError::internal(format!("Failed to spool upload: {e}")))?;
                drop(spool);

                // Prefer the part's Content-Type, else guess from the file name
                let mime_type = content_type
                    .filter(|ct| ct != "application/octet-stream")
                    .or_else(|| mime_guess::from_path(&file_name).first().map(|m| m.to_string()))
                    .unwrap_or_else(|| "application/octet-stream".to_string());

                inputs.push(FieldInput::BinaryPart(BinaryPart {
                    source: ItemSource::TempFile(spool_path),
                    name: file_name,
                    size,
                    mime_type,
                }));
            }
            Some(_) => {
                // Empty file input
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid field value: {e}")))?;
                inputs.push(FieldInput::from_text(text));
            }
        }
    }

    Ok(inputs)
}

/// Serve a file inline, exposing its name to cross-origin clients.
fn file_response(blob: FileBlob) -> Response {
    let mut response = (StatusCode::OK, blob.content).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        blob.mime_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(blob.length));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Disposition"),
    );
    if let Ok(value) = format!("inline; filename=\"{}\"", blob.name.replace('"', "")).parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    response
}
