//! Storage backend seam.
//!
//! `ObjectBackend` is the whole contract the gateway has with object
//! storage. `S3Backend` forwards to `aws-sdk-s3`; `MemoryBackend` keeps
//! objects in process for local runs and tests.

pub mod memory;
pub mod retry;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{fmt, time::Duration};
use thiserror::Error;

use crate::models::{list_item::DeleteSummary, multipart::PartTag};

pub use memory::MemoryBackend;
pub use retry::RetryPolicy;
pub use s3::S3Backend;

/// Separator that turns flat keys into a folder hierarchy.
pub const DELIMITER: &str = "/";

/// Backend calls, used for logging, error context and call accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    ListPage,
    ListKeys,
    PutObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    DeleteObjects,
    PresignGet,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ListPage => "ListObjectsV2",
            Operation::ListKeys => "ListObjectsV2 (recursive)",
            Operation::PutObject => "PutObject",
            Operation::CreateMultipartUpload => "CreateMultipartUpload",
            Operation::UploadPart => "UploadPart",
            Operation::CompleteMultipartUpload => "CompleteMultipartUpload",
            Operation::AbortMultipartUpload => "AbortMultipartUpload",
            Operation::DeleteObjects => "DeleteObjects",
            Operation::PresignGet => "PresignGetObject",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached or asked us to come back later.
    #[error("{operation} failed, backend unavailable: {message}")]
    Unavailable { operation: Operation, message: String },
    /// The backend refused the request; retrying it unchanged will not help.
    #[error("{operation} rejected by backend ({code}): {message}")]
    Rejected {
        operation: Operation,
        code: String,
        message: String,
    },
}

impl BackendError {
    pub fn unavailable(operation: Operation, message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            operation,
            message: message.into(),
        }
    }

    pub fn rejected(operation: Operation, code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Rejected {
            operation,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Rejected { code, .. } => Some(code),
            BackendError::Unavailable { .. } => None,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, Debug)]
pub struct ListPageRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: i32,
}

/// One page of a listing: objects at this level plus collapsed prefixes.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PutObjectRequest {
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    pub public_read: bool,
}

#[derive(Clone, Debug)]
pub struct CreateMultipartRequest {
    pub key: String,
    pub content_type: String,
    pub public_read: bool,
}

#[derive(Clone, Debug)]
pub struct UploadPartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: i32,
    pub body: Bytes,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// One page of the keys under `prefix`, grouped by `delimiter` if set.
    async fn list_page(&self, request: ListPageRequest) -> BackendResult<ListPage>;

    /// Every key under `prefix`, following continuation tokens to the end.
    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>>;

    /// Store an object, returning its ETag when the backend reports one.
    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<Option<String>>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(&self, request: CreateMultipartRequest)
    -> BackendResult<String>;

    /// Upload one part and return its ETag.
    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String>;

    /// Assemble the object from `parts`, which must be in ascending order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartTag],
    ) -> BackendResult<Option<String>>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;

    /// Batch delete. Per-key failures are reported, not raised.
    async fn delete_objects(&self, keys: &[String]) -> BackendResult<DeleteSummary>;

    /// A presigned GET URL for `key` valid for `expires_in`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> BackendResult<String>;

    /// Public (unsigned) URL of `key`.
    fn public_url(&self, key: &str) -> String;
}

/// Percent-encode each path segment of a key, keeping the separators.
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
