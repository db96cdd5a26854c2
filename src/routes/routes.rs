//! Defines the gateway's HTTP routes.
//!
//! ## Structure
//! - **Items**
//!   - `GET    /items`: list one folder level (`prefix`, `query`, `continuation-token`)
//!   - `DELETE /items`: delete files and folders
//!   - `POST   /folders`: create a folder marker
//!   - `GET    /presigned-url`: one-hour GET URL for a key
//!
//! - **Uploads**
//!   - `POST   /uploads`: single-part upload
//!   - `POST   /uploads/chunks`: one chunk of a multipart upload
//!   - `GET    /uploads`: multipart uploads in progress
//!   - `DELETE /uploads`: abort a multipart upload
//!
//! - **Probes**: `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        item_handlers::{create_folder, delete_items, list_items, presigned_url},
        upload_handlers::{abort_upload, list_uploads, upload_chunk, upload_file},
    },
    services::gateway_service::GatewayService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and part headers on top of the payload.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router. Upload routes accept bodies up to `max_payload_bytes`
/// plus form-data framing; other routes keep axum's default limit.
pub fn routes(max_payload_bytes: usize) -> Router<GatewayService> {
    let upload_limit = DefaultBodyLimit::max(max_payload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES));

    let uploads = Router::new()
        .route("/uploads", post(upload_file).get(list_uploads).delete(abort_upload))
        .route("/uploads/chunks", post(upload_chunk))
        .layer(upload_limit);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/items", get(list_items).delete(delete_items))
        .route("/folders", post(create_folder))
        .route("/presigned-url", get(presigned_url))
        .merge(uploads)
}
