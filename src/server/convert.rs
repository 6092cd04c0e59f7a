//! `POST /convert`: multipart ingestion feeding the batch engine.
//!
//! Uploaded files are streamed to the upload directory under a unique
//! `<unix millis>-<random><ext>` name. The client file name is kept for display
//! only; the stored name never contains any part of it except a sanitized
//! extension. If the request is rejected, every file it already stored is
//! removed again before the error is returned.

use super::error::ApiError;
use super::AppState;
use crate::engine::BatchEngine;
use crate::models::{BatchFailurePolicy, ConversionJob, OutputFormat};
use crate::retention::delete_quietly;
use crate::Error;
use axum::extract::{Multipart, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const FILES_FIELD: &str = "images";
pub const FORMAT_FIELD: &str = "format";

pub const ALLOWED_UPLOAD_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

#[derive(Debug, Serialize)]
pub struct BatchResponse<T: Serialize> {
    pub success: bool,
    pub results: Vec<T>,
}

#[derive(Debug)]
struct StoredUpload {
    path: PathBuf,
    original_name: String,
}

#[derive(Debug, Default)]
struct ReceivedUpload {
    files: Vec<StoredUpload>,
    format: Option<String>,
}

impl ReceivedUpload {
    fn discard(self) {
        for file in self.files {
            delete_quietly(&file.path);
        }
    }
}

pub async fn convert(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload = ReceivedUpload::default();
    if let Err(e) = receive_fields(&state, multipart, &mut upload).await {
        upload.discard();
        return Err(e);
    }

    let format = match parse_format(upload.format.as_deref()) {
        Ok(format) => format,
        Err(e) => {
            upload.discard();
            return Err(e.into());
        }
    };

    info!(
        files = upload.files.len(),
        target_format = %format.unwrap_or(state.config.default_format),
        "Received conversion request"
    );

    let jobs: Vec<ConversionJob> = upload
        .files
        .into_iter()
        .map(|file| ConversionJob::new(file.path, file.original_name, format))
        .collect();

    // Runs detached so a dropped connection cannot cancel the batch halfway.
    let engine = Arc::clone(&state.engine);
    let policy = state.config.failure_policy;
    let batch = tokio::spawn(async move { run_batch(&engine, policy, jobs).await });

    let response = batch
        .await
        .map_err(|e| Error::Invariant(format!("Conversion task failed: {}", e)))??;

    Ok(response)
}

async fn run_batch(
    engine: &BatchEngine,
    policy: BatchFailurePolicy,
    jobs: Vec<ConversionJob>,
) -> crate::Result<Response> {
    let response = match policy {
        BatchFailurePolicy::PerJob => {
            let results = engine.convert_batch(jobs).await?;
            let success = results.iter().all(|result| result.is_success());
            Json(BatchResponse { success, results }).into_response()
        }
        BatchFailurePolicy::AllOrNothing => {
            let results = engine.convert_batch_strict(jobs).await?;
            Json(BatchResponse {
                success: true,
                results,
            })
            .into_response()
        }
    };

    Ok(response)
}

/// An absent or blank format field means "use the default".
fn parse_format(value: Option<&str>) -> crate::Result<Option<OutputFormat>> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => value.parse().map(Some),
        _ => Ok(None),
    }
}

async fn receive_fields(
    state: &AppState,
    mut multipart: Multipart,
    upload: &mut ReceivedUpload,
) -> Result<(), ApiError> {
    let max_files = state.config.max_files;
    let max_file_size = state.config.max_file_size;

    while let Some(mut field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field_name.as_str() {
            FORMAT_FIELD => {
                upload.format = Some(field.text().await?);
            }
            FILES_FIELD => {
                if upload.files.len() >= max_files {
                    return Err(ApiError::BadRequest(format!(
                        "Too many files: at most {} per request",
                        max_files
                    )));
                }

                let original_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if !ALLOWED_UPLOAD_TYPES.contains(&content_type.as_str()) {
                    return Err(ApiError::BadRequest(format!(
                        "Invalid file type: {}",
                        content_type
                    )));
                }

                let path = state
                    .config
                    .upload_dir
                    .join(unique_upload_name(&original_name));
                let mut file = tokio::fs::File::create(&path).await?;
                // Tracked before writing so a rejected request also removes partial files.
                upload.files.push(StoredUpload {
                    path: path.clone(),
                    original_name: original_name.clone(),
                });

                let mut written = 0usize;
                while let Some(chunk) = field.chunk().await? {
                    written += chunk.len();
                    if written > max_file_size {
                        return Err(ApiError::PayloadTooLarge(format!(
                            "File too large: {} exceeds the {} byte limit",
                            original_name, max_file_size
                        )));
                    }
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;

                debug!(
                    original_name = %original_name,
                    stored = %path.display(),
                    content_type = %content_type,
                    size_bytes = written,
                    "Stored upload"
                );
            }
            other => {
                debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    Ok(())
}

/// `<unix millis>-<random below 1e9><.ext>`, unique per upload.
pub fn unique_upload_name(original_name: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!(
        "{}-{}{}",
        Utc::now().timestamp_millis(),
        suffix,
        sanitized_extension(original_name)
    )
}

/// Extension of the client file name, if it is short and plain alphanumeric.
fn sanitized_extension(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}
