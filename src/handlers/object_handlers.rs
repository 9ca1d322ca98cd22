//! HTTP handlers for image upload, serving, listing and deletion.
//! Bodies are streamed in both directions; nothing is buffered whole.

use crate::{
    errors::AppError,
    models::{account::Account, object::StoredObject},
    services::object_service::ListParams,
    state::AppState,
};
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::io;

/// Cache directive on served images. Payloads never change once written.
const SERVE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Client-facing view of a stored object.
#[derive(Debug, Serialize)]
pub struct FileView {
    pub id: String,
    pub url: String,
    pub size: i64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<StoredObject> for FileView {
    fn from(object: StoredObject) -> Self {
        Self {
            id: object.alias,
            url: object.url,
            size: object.size_bytes,
            content_type: object.content_type,
            uploaded_at: object.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileList {
    pub files: Vec<FileView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub sort: &'static str,
    pub next: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

/// `POST /upload` - raw image body with an exact `Content-Length`.
pub async fn upload_object(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::LENGTH_REQUIRED,
                "invalid_request",
                "missing_content_length",
                "A Content-Length header with the exact file size is required.",
            )
        })?;

    let stream = body.into_data_stream().map_err(io::Error::other).boxed();
    let object = state.uploads.upload_for(&account, stream, declared).await?;

    Ok((StatusCode::CREATED, Json(FileView::from(object))))
}

/// `GET /i/{id}.{ext}` - stream an image.
pub async fn serve_object(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let (id, extension) = file.split_once('.').unwrap_or((file.as_str(), ""));
    let (object, stream) = state.objects.open(id, extension).await?;

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes.max(0)));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(SERVE_CACHE_CONTROL));
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&object.uploaded_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    Ok(response)
}

/// `DELETE /i/{id}` - soft-delete by alias or identifier.
pub async fn delete_object(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
    Path(file): Path<String>,
) -> Result<Json<Deleted>, AppError> {
    let reference = file.split_once('.').map_or(file.as_str(), |(id, _)| id);
    let object = state.objects.delete(&account, reference).await?;
    Ok(Json(Deleted {
        id: object.alias,
        deleted: true,
    }))
}

/// `GET /files?limit=&offset=&sort=`
pub async fn list_objects(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<FileList>, AppError> {
    let Query(params) =
        query.map_err(|err| AppError::bad_request("invalid_parameter", err.body_text()))?;
    let page = state.objects.list(&account, params).await?;

    Ok(Json(FileList {
        files: page.files.into_iter().map(FileView::from).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
        sort: page.sort,
        next: page.next,
    }))
}
