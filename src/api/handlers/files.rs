use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::api::response::{
    ApiError, AppJson, AppQuery, JSend, JSendPaginated, Owner, Pagination, RequestId,
};
use crate::orchestrator::{UploadOutcome, UploadRequest};
use crate::quota::{BandwidthState, QuotaState};
use crate::storage::models::{FileRecord, StorageTier, StorageType};
use crate::AppState;

const DEFAULT_URL_TTL_SECS: u64 = 3600;
const MAX_URL_TTL_SECS: u64 = 7 * 24 * 3600;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub created_at: String,
    pub deleted_at: Option<String>,
    pub id: String,
    pub is_deleted: bool,
    pub is_duplicate: bool,
    pub last_accessed_at: String,
    pub mime_type: String,
    pub name: String,
    pub size: u64,
    pub storage_type: StorageType,
    pub tier: StorageTier,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file: FileResponse,
    pub is_duplicate: bool,
    pub dedup_pending: bool,
}

#[derive(Debug, Serialize)]
pub struct SignedUrlResponse {
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct RenameFileRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Deserialize)]
pub struct SignedUrlParams {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_limit() -> u32 {
    20
}

/// The `file` part of a multipart body.
struct FilePart {
    file_name: Option<String>,
    content_type: Option<String>,
    data: Bytes,
    name: Option<String>,
}

async fn read_file_part(mut multipart: Multipart) -> Result<FilePart, ApiError> {
    let mut part: Option<(Option<String>, Option<String>, Bytes)> = None;
    let mut name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().map(|s| s.to_string());
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .filter(|ct| ct != "application/octet-stream");
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;
                part = Some((file_name, content_type, data));
            }
            "name" => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid name: {e}")))?,
                );
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let (file_name, content_type, data) =
        part.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    Ok(FilePart {
        file_name,
        content_type,
        data,
        name,
    })
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    multipart: Multipart,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let part = read_file_part(multipart).await?;
    let file_name = part
        .name
        .or(part.file_name)
        .ok_or_else(|| ApiError::bad_request("a file name is required"))?;

    let outcome = state
        .orchestrator
        .upload(UploadRequest {
            owner_id,
            file_name,
            mime_type: part.content_type,
            data: part.data,
            request_id,
        })
        .await?;

    Ok(JSend::success(upload_to_response(&outcome)))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let files = state.orchestrator.list_files(&owner_id).await?;
    let total = files.len() as u64;
    let items: Vec<FileResponse> = files
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(file_to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.orchestrator.get_file(&owner_id, &id).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn rename_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
    AppJson(req): AppJson<RenameFileRequest>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.orchestrator.rename(&owner_id, &id, &req.name).await?;
    tracing::debug!(file_id = %id, "Renamed file");
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn replace_content(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let part = read_file_part(multipart).await?;
    let file = state
        .orchestrator
        .update_content(
            &owner_id,
            &id,
            part.data,
            part.content_type,
            request_id.as_deref(),
        )
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}

/// Stream a file's bytes back to its owner.
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let download = state
        .orchestrator
        .download(&owner_id, &id, request_id.as_deref())
        .await?;
    let file = download.file;

    let mut response = (StatusCode::OK, Body::from_stream(download.stream)).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        file.mime_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.logical_size));

    let filename = file.name.replace('"', "");
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-store"));

    Ok(response)
}

pub async fn signed_url(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<SignedUrlParams>,
) -> Result<Json<JSend<SignedUrlResponse>>, ApiError> {
    let ttl = params.ttl_secs.unwrap_or(DEFAULT_URL_TTL_SECS);
    if ttl == 0 || ttl > MAX_URL_TTL_SECS {
        return Err(ApiError::bad_request(format!(
            "ttl_secs must be between 1 and {MAX_URL_TTL_SECS}"
        )));
    }
    let url = state
        .orchestrator
        .signed_url(&owner_id, &id, Duration::from_secs(ttl))
        .await?;
    Ok(JSend::success(SignedUrlResponse {
        url,
        expires_in: ttl,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<DeleteParams>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = if params.permanent {
        state
            .orchestrator
            .permanent_delete(&owner_id, &id, request_id.as_deref())
            .await?
    } else {
        state
            .orchestrator
            .soft_delete(&owner_id, &id, request_id.as_deref())
            .await?
    };
    tracing::debug!(file_id = %id, permanent = params.permanent, "Deleted file");
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn restore_file(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .orchestrator
        .restore(&owner_id, &id, request_id.as_deref())
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn mark_cold(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .orchestrator
        .set_cold(&owner_id, &id, true, request_id.as_deref())
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn mark_warm(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .orchestrator
        .set_cold(&owner_id, &id, false, request_id.as_deref())
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn quota_usage(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
) -> Result<Json<JSend<QuotaState>>, ApiError> {
    Ok(JSend::success(state.orchestrator.quota(&owner_id).await?))
}

pub async fn bandwidth_usage(
    State(state): State<Arc<AppState>>,
    Owner(owner_id): Owner,
) -> Result<Json<JSend<BandwidthState>>, ApiError> {
    Ok(JSend::success(state.orchestrator.bandwidth(&owner_id).await?))
}

// ============================================================================
// Helpers
// ============================================================================

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        created_at: file.created_at.to_rfc3339(),
        deleted_at: file.deleted_at.map(|at| at.to_rfc3339()),
        id: file.id.clone(),
        is_deleted: file.is_deleted,
        is_duplicate: file.is_reference(),
        last_accessed_at: file.last_accessed_at.to_rfc3339(),
        mime_type: file.mime_type.clone(),
        name: file.name.clone(),
        size: file.logical_size,
        storage_type: file.storage_type,
        tier: file.tier(),
        updated_at: file.updated_at.to_rfc3339(),
    }
}

fn upload_to_response(outcome: &UploadOutcome) -> UploadResponse {
    UploadResponse {
        file: file_to_response(&outcome.file),
        is_duplicate: outcome.is_duplicate,
        dedup_pending: outcome.dedup_pending,
    }
}
