//! src/services/gateway_service.rs
//!
//! GatewayService: the caller-facing object operations. Each method
//! validates its input, builds backend requests and forwards them through
//! `ObjectBackend`; multipart chunks are handed to `MultipartCoordinator`.

use bytes::{Bytes, BytesMut};
use chrono::{Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use sqlx::SqlitePool;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        BackendError, DELIMITER, ListPageRequest, ObjectBackend, Operation, PutObjectRequest,
        RetryPolicy,
    },
    models::{
        list_item::{DeleteSummary, ItemRef, ListItem},
        multipart::{ChunkOutcome, SessionSummary},
        upload::{Payload, PresignedUrl, UploadedObject},
    },
    services::{
        multipart_coordinator::{ChunkUpload, MultipartCoordinator, validate_chunk},
        upload_ledger::UploadLedger,
    },
};

/// Validity of presigned URLs, in milliseconds.
pub const PRESIGNED_URL_TTL_MS: i64 = 60 * 60 * 1000;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const FOLDER_CONTENT_TYPE: &str = "binary/octet-stream";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to read upload payload: {0}")]
    PayloadRead(#[source] io::Error),
    #[error("upload payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("chunk index {index} is out of range for {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("{total} chunks exceed the limit of {max}")]
    TooManyChunks { total: u32, max: u32 },
    #[error("upload of `{key}` was started with {expected} chunks, got {actual}")]
    ChunkCountMismatch {
        key: String,
        expected: u32,
        actual: u32,
    },
    #[error("no multipart upload in progress for `{0}`")]
    SessionNotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("upload ledger: {0}")]
    Ledger(#[from] sqlx::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Tunables the service reads on every call.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Entries fetched per listing page (1–1000).
    pub list_page_size: i32,
    /// Upper bound for a buffered payload (a whole file or one chunk).
    pub max_payload_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            list_page_size: 1000,
            max_payload_bytes: 100 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// One page of a folder listing.
#[derive(Debug)]
pub struct ListResult {
    pub items: Vec<ListItem>,
    pub next_continuation_token: Option<String>,
}

/// GatewayService provides the object operations a content-management host
/// needs:
/// - List a folder level (folders first, optional name filter)
/// - Create folder markers
/// - Delete files and whole folders
/// - Upload small files in one put, large files chunk by chunk
/// - Issue presigned download URLs
///
/// Cheap to clone; all clones share the backend and the session table.
#[derive(Clone)]
pub struct GatewayService {
    backend: Arc<dyn ObjectBackend>,
    uploads: Arc<MultipartCoordinator>,
    settings: GatewaySettings,
    db: Arc<SqlitePool>,
}

impl GatewayService {
    /// Create a GatewayService forwarding to `backend` and keeping its
    /// multipart ledger in `db`.
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        db: Arc<SqlitePool>,
        settings: GatewaySettings,
    ) -> Self {
        let ledger = UploadLedger::new(db.clone());
        let uploads = Arc::new(MultipartCoordinator::new(backend.clone(), ledger));
        Self {
            backend,
            uploads,
            settings,
            db,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// List one folder level below `prefix`.
    ///
    /// Deeper keys collapse into folder entries, the prefix's own marker
    /// object is skipped, and `query` keeps only entries whose name contains
    /// it (case-insensitive). Folders come before files.
    pub async fn list(
        &self,
        prefix: &str,
        query: Option<&str>,
        continuation_token: Option<String>,
    ) -> GatewayResult<ListResult> {
        ensure_prefix_safe(prefix)?;
        let request = ListPageRequest {
            prefix: prefix.to_string(),
            delimiter: Some(DELIMITER.to_string()),
            continuation_token,
            max_keys: self.settings.list_page_size,
        };
        let page = self
            .settings
            .retry
            .run(Operation::ListPage, || {
                self.backend.list_page(request.clone())
            })
            .await?;

        let needle = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let matches = |item: &ListItem| {
            needle
                .as_deref()
                .is_none_or(|needle| item.name().to_lowercase().contains(needle))
        };

        let folders = page.common_prefixes.into_iter().map(|common| {
            let url = self.backend.public_url(&common);
            ListItem::folder(common, prefix, url)
        });
        let files = page
            .objects
            .into_iter()
            .filter(|object| object.key != prefix)
            .map(|object| {
                let url = self.backend.public_url(&object.key);
                ListItem::file(object.key, prefix, object.size, object.last_modified, url)
            });
        let items: Vec<ListItem> = folders.chain(files).filter(|item| matches(item)).collect();

        debug!(
            "listed {} entries under `{}` (more: {})",
            items.len(),
            prefix,
            page.next_continuation_token.is_some()
        );
        Ok(ListResult {
            items,
            next_continuation_token: page.next_continuation_token,
        })
    }

    /// Create the zero-byte marker object `path/`. Creating it again
    /// overwrites the same marker.
    pub async fn create_folder(&self, path: &str) -> GatewayResult<String> {
        let key = format!("{}{}", path.trim_end_matches('/'), DELIMITER);
        ensure_key_safe(&key)?;
        let request = PutObjectRequest {
            key: key.clone(),
            body: Bytes::new(),
            content_type: FOLDER_CONTENT_TYPE.to_string(),
            public_read: false,
        };
        self.settings
            .retry
            .run(Operation::PutObject, || {
                self.backend.put_object(request.clone())
            })
            .await?;
        info!("created folder marker {}", key);
        Ok(key)
    }

    /// Delete files in one batch and every folder prefix by resolving and
    /// batch-deleting its keys. Per-key failures end up in the summary.
    pub async fn delete_items(&self, items: Vec<ItemRef>) -> GatewayResult<DeleteSummary> {
        let mut files = Vec::new();
        let mut folders = Vec::new();
        for item in items {
            match item {
                ItemRef::File { id } => {
                    ensure_key_safe(&id)?;
                    files.push(id);
                }
                ItemRef::Folder { id } => {
                    let prefix = format!("{}{}", id.trim_end_matches('/'), DELIMITER);
                    ensure_key_safe(&prefix)?;
                    folders.push(prefix);
                }
            }
        }

        let mut summary = DeleteSummary::default();
        if !files.is_empty() {
            let report = self
                .settings
                .retry
                .run(Operation::DeleteObjects, || self.backend.delete_objects(&files))
                .await?;
            summary.absorb(report);
        }

        for prefix in &folders {
            let keys = self
                .settings
                .retry
                .run(Operation::ListKeys, || self.backend.list_keys(prefix))
                .await?;
            if keys.is_empty() {
                debug!("folder {} has no keys left to delete", prefix);
                continue;
            }
            let report = self
                .settings
                .retry
                .run(Operation::DeleteObjects, || self.backend.delete_objects(&keys))
                .await?;
            summary.absorb(report);
        }

        if !summary.failed.is_empty() {
            warn!(
                "{} keys could not be deleted (first: {} {})",
                summary.failed.len(),
                summary.failed[0].key,
                summary.failed[0].code
            );
        }
        info!(
            "deleted {} keys ({} files, {} folders requested)",
            summary.deleted.len(),
            files.len(),
            folders.len()
        );
        Ok(summary)
    }

    /// Upload a small file with a single put. The whole payload is buffered
    /// first; a read failure ends the upload before the backend is called.
    pub async fn upload_single<S>(
        &self,
        path: &str,
        payload: Payload<S>,
    ) -> GatewayResult<UploadedObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let key = object_key(path, &payload.file_name)?;
        let content_type = resolve_content_type(payload.content_type.as_deref(), &payload.file_name);
        let body = read_payload(payload.body, self.settings.max_payload_bytes).await?;
        let size = body.len();

        let request = PutObjectRequest {
            key: key.clone(),
            body,
            content_type: content_type.clone(),
            public_read: true,
        };
        let etag = self
            .settings
            .retry
            .run(Operation::PutObject, || {
                self.backend.put_object(request.clone())
            })
            .await?;

        info!("uploaded {} ({} bytes, {})", key, size, content_type);
        Ok(UploadedObject {
            url: self.backend.public_url(&key),
            key,
            size,
            content_type,
            etag,
        })
    }

    /// Accept chunk `index` of `total` for the file `path + file name`.
    pub async fn upload_chunk<S>(
        &self,
        path: &str,
        payload: Payload<S>,
        index: u32,
        total: u32,
    ) -> GatewayResult<ChunkOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        validate_chunk(index, total)?;
        let key = object_key(path, &payload.file_name)?;
        let content_type = resolve_content_type(payload.content_type.as_deref(), &payload.file_name);
        let body = read_payload(payload.body, self.settings.max_payload_bytes).await?;
        self.uploads
            .upload_chunk(ChunkUpload {
                key,
                content_type,
                index,
                total,
                body,
            })
            .await
    }

    /// Cancel the multipart upload for `key`.
    pub async fn abort_upload(&self, key: &str) -> GatewayResult<()> {
        ensure_key_safe(key)?;
        self.uploads.abort(key).await
    }

    /// Abort sessions that saw no chunk for `max_idle`; returns their keys.
    pub async fn abort_idle_uploads(&self, max_idle: Duration) -> Vec<String> {
        self.uploads.abort_idle(max_idle).await
    }

    pub async fn active_uploads(&self) -> Vec<SessionSummary> {
        self.uploads.sessions().await
    }

    pub async fn has_active_upload(&self, key: &str) -> bool {
        self.uploads.is_active(key).await
    }

    /// Reload sessions recorded in the ledger; returns how many.
    pub async fn restore_uploads(&self) -> GatewayResult<usize> {
        self.uploads.restore().await
    }

    /// Issue a GET URL for `key` that stays valid for one hour.
    pub async fn presigned_url(&self, key: &str) -> GatewayResult<PresignedUrl> {
        ensure_key_safe(key)?;
        let issued_at = Utc::now();
        let expires_at = issued_at + ChronoDuration::milliseconds(PRESIGNED_URL_TTL_MS);
        let expires_in = Duration::from_millis(PRESIGNED_URL_TTL_MS as u64);

        let url = self
            .settings
            .retry
            .run(Operation::PresignGet, || {
                self.backend.presign_get(key, expires_in)
            })
            .await?;
        debug!("presigned GET for {} until {}", key, expires_at);
        Ok(PresignedUrl {
            key: key.to_string(),
            url,
            method: "GET",
            issued_at,
            expires_at,
        })
    }

    /// Cheapest possible backend round-trip, for readiness probes.
    pub async fn ping_backend(&self) -> GatewayResult<()> {
        self.backend
            .list_page(ListPageRequest {
                prefix: String::new(),
                delimiter: Some(DELIMITER.to_string()),
                continuation_token: None,
                max_keys: 1,
            })
            .await?;
        Ok(())
    }
}

/// Buffer a payload stream, failing on read errors or when it grows past
/// `limit` bytes.
pub async fn read_payload<S>(stream: S, limit: usize) -> GatewayResult<Bytes>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pin_mut!(stream);
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(GatewayError::PayloadRead)?;
        if buffer.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Destination key for `file_name` uploaded into `path`.
pub fn object_key(path: &str, file_name: &str) -> GatewayResult<String> {
    let file_name = file_name.trim();
    if file_name.is_empty()
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name == "."
        || file_name == ".."
    {
        return Err(GatewayError::InvalidFileName(file_name.to_string()));
    }
    let key = if path.is_empty() || path.ends_with(DELIMITER) {
        format!("{}{}", path, file_name)
    } else {
        format!("{}{}{}", path, DELIMITER, file_name)
    };
    ensure_key_safe(&key)?;
    Ok(key)
}

fn resolve_content_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != DEFAULT_CONTENT_TYPE)
        .map(str::to_string)
        .unwrap_or_else(|| {
            mime_guess::from_path(file_name)
                .first_raw()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string()
        })
}

/// Reject keys that are empty, too long, absolute, contain `..` path
/// segments, or contain control characters or backslashes.
pub fn ensure_key_safe(key: &str) -> GatewayResult<()> {
    if key.is_empty() || key == DELIMITER {
        return Err(GatewayError::InvalidKey(key.to_string()));
    }
    ensure_prefix_safe(key)
}

/// Like `ensure_key_safe`, but the empty prefix (bucket root) is allowed.
pub fn ensure_prefix_safe(prefix: &str) -> GatewayResult<()> {
    let invalid = prefix.len() > MAX_OBJECT_KEY_LEN
        || prefix.starts_with('/')
        || prefix.split('/').any(|segment| segment == "..")
        || prefix
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(GatewayError::InvalidKey(prefix.to_string()));
    }
    Ok(())
}
