//! HTTP handlers for browsing and managing stored items: listing, folder
//! creation, deletion and presigned download URLs.

use crate::{
    errors::AppError,
    models::{
        list_item::{DeleteSummary, ItemRef, ListItem},
        upload::PresignedUrl,
    },
    services::gateway_service::GatewayService,
};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ListItemsQuery {
    #[serde(default)]
    pub prefix: String,
    pub query: Option<String>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItemsResponse {
    pub items: Vec<ListItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderReq {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

/// GET `/items?prefix=&query=&continuation-token=`
pub async fn list_items(
    State(service): State<GatewayService>,
    Query(q): Query<ListItemsQuery>,
) -> Result<Json<ListItemsResponse>, AppError> {
    let token = q
        .continuation_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(decode_continuation_token)
        .transpose()?;

    let result = service.list(&q.prefix, q.query.as_deref(), token).await?;
    Ok(Json(ListItemsResponse {
        items: result.items,
        next_continuation_token: result
            .next_continuation_token
            .as_deref()
            .map(encode_continuation_token),
    }))
}

/// POST `/folders` with `{"path": "docs/reports"}`.
pub async fn create_folder(
    State(service): State<GatewayService>,
    Json(req): Json<CreateFolderReq>,
) -> Result<impl IntoResponse, AppError> {
    let key = service.create_folder(&req.path).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": key }))))
}

/// DELETE `/items` with a JSON array of item references.
pub async fn delete_items(
    State(service): State<GatewayService>,
    Json(items): Json<Vec<ItemRef>>,
) -> Result<Json<DeleteSummary>, AppError> {
    Ok(Json(service.delete_items(items).await?))
}

/// GET `/presigned-url?key=`
pub async fn presigned_url(
    State(service): State<GatewayService>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<PresignedUrl>, AppError> {
    Ok(Json(service.presigned_url(&q.key).await?))
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> Result<String, AppError> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| AppError::bad_request("malformed continuation token"))
}
