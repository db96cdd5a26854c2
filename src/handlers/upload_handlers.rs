//! HTTP handlers for file uploads.
//!
//! Both upload routes take `multipart/form-data`; the first part that
//! carries a file name is the payload. Its bytes are streamed into the
//! service, which buffers them up to the configured payload limit.

use crate::{
    errors::AppError,
    models::{
        multipart::{ChunkOutcome, SessionSummary},
        upload::{Payload, UploadedObject},
    },
    services::gateway_service::GatewayService,
};
use axum::{
    Json,
    extract::{Multipart, Query, State, multipart::Field},
    http::StatusCode,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::io;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    #[serde(default)]
    pub path: String,
    pub index: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize)]
pub struct AbortQuery {
    pub key: String,
}

/// POST `/uploads?path=`: store a small file with a single put.
pub async fn upload_file(
    State(service): State<GatewayService>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadedObject>), AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_none() {
            continue;
        }
        let object = service.upload_single(&q.path, field_payload(field)).await?;
        return Ok((StatusCode::CREATED, Json(object)));
    }
    Err(missing_file_part())
}

/// POST `/uploads/chunks?path=&index=&total=`: one chunk of a large file.
pub async fn upload_chunk(
    State(service): State<GatewayService>,
    Query(q): Query<ChunkQuery>,
    mut multipart: Multipart,
) -> Result<Json<ChunkOutcome>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_none() {
            continue;
        }
        let outcome = service
            .upload_chunk(&q.path, field_payload(field), q.index, q.total)
            .await?;
        return Ok(Json(outcome));
    }
    Err(missing_file_part())
}

/// GET `/uploads`: multipart uploads in progress.
pub async fn list_uploads(State(service): State<GatewayService>) -> Json<Vec<SessionSummary>> {
    Json(service.active_uploads().await)
}

/// DELETE `/uploads?key=`: cancel a multipart upload.
pub async fn abort_upload(
    State(service): State<GatewayService>,
    Query(q): Query<AbortQuery>,
) -> Result<StatusCode, AppError> {
    service.abort_upload(&q.key).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn missing_file_part() -> AppError {
    AppError::bad_request("request contains no file part")
}

fn field_payload(
    field: Field<'_>,
) -> Payload<impl Stream<Item = io::Result<Bytes>> + Send + '_> {
    let file_name = field.file_name().unwrap_or_default().to_string();
    let content_type = field.content_type().map(str::to_string);
    Payload {
        file_name,
        content_type,
        body: field.map(|chunk| chunk.map_err(io::Error::other)),
    }
}
