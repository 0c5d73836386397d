use axum::extract::{Request, State};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::{read_request, run_blocking};
use crate::api::response::{ApiError, JSend};
use crate::staging::{FileId, StagedRef};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Failure,
    Success,
}

#[derive(Debug, Serialize)]
pub struct SubmittedFile {
    pub error: Option<String>,
    pub id: Option<FileId>,
    pub name: Option<String>,
    pub status: SubmitStatus,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub files: Vec<SubmittedFile>,
}

/// Finalize a form: stage anything new, then move every entry of the field
/// into permanent storage.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Json<JSend<SubmitResponse>>, ApiError> {
    let inputs = read_request(&state, req).await?;
    let ingest = state.ingest.clone();
    let results = run_blocking(move || ingest.resolve_field(inputs)).await?;
    if results.is_empty() {
        return Err(ApiError::bad_request(format!(
            "No files found in field '{}'",
            state.config.field_name
        )));
    }

    let entries: Vec<FileId> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(StagedRef::id).cloned())
        .collect();
    let commits = state.commits.clone();
    let target_dir = state.upload_dir();
    let report = run_blocking(move || commits.commit(&entries, &target_dir)).await?;
    let mut committed = report.results.into_iter();

    let files: Vec<SubmittedFile> = results
        .iter()
        .map(|result| match result {
            Ok(entry) => {
                let Some(outcome) = committed.next() else {
                    return failure(Some(entry.id().clone()), "commit result missing");
                };
                match &outcome.outcome {
                    Ok(_) => SubmittedFile {
                        error: None,
                        name: outcome.file_name(),
                        id: Some(outcome.id),
                        status: SubmitStatus::Success,
                    },
                    Err(e) => failure(Some(outcome.id.clone()), e.to_string()),
                }
            }
            Err(e) => failure(None, e.to_string()),
        })
        .collect();

    let succeeded = files
        .iter()
        .filter(|f| matches!(f.status, SubmitStatus::Success))
        .count();
    tracing::info!(total = files.len(), succeeded, "Submitted files");

    Ok(JSend::success(SubmitResponse { files }))
}

fn failure(id: Option<FileId>, error: impl Into<String>) -> SubmittedFile {
    SubmittedFile {
        error: Some(error.into()),
        id,
        name: None,
        status: SubmitStatus::Failure,
    }
}
