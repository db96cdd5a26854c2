//! In-process backend with S3 listing and multipart semantics.
//!
//! Objects live in a `BTreeMap` so listings come back in key order, like
//! ListObjectsV2. Every call is counted per `Operation`, and failures can be
//! queued per operation, which lets tests assert on the exact backend
//! traffic an operation produced.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    BackendError, BackendResult, CreateMultipartRequest, ListPage, ListPageRequest,
    ObjectBackend, ObjectSummary, Operation, PutObjectRequest, UploadPartRequest, encode_key,
};
use crate::models::{list_item::DeleteSummary, multipart::PartTag};

const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub public_read: bool,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// A multipart upload that was completed, with the part numbers it was
/// assembled from in the order they were submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedUpload {
    pub key: String,
    pub upload_id: String,
    pub part_numbers: Vec<i32>,
}

struct PendingUpload {
    key: String,
    content_type: String,
    public_read: bool,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    completions: Vec<CompletedUpload>,
}

impl MemoryState {
    /// Count the call and surface a queued failure, if any.
    fn begin(&mut self, operation: Operation) -> BackendResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn store(&mut self, key: String, body: Bytes, content_type: String, public_read: bool) -> String {
        let etag = format!("{:x}", md5::compute(&body));
        self.objects.insert(
            key,
            StoredObject {
                body,
                content_type,
                public_read,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        etag
    }
}

pub struct MemoryBackend {
    bucket: String,
    base_url: String,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            base_url: format!("memory://{}", bucket),
            bucket,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Seed an object without counting a backend call.
    pub async fn insert_object(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        let mut state = self.state.lock().await;
        state.store(
            key.into(),
            body.into(),
            "application/octet-stream".into(),
            false,
        );
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    pub async fn call_count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn completions(&self) -> Vec<CompletedUpload> {
        self.state.lock().await.completions.clone()
    }

    /// Multipart uploads started but neither completed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    /// Make the next call of `operation` fail with `err`.
    pub async fn fail_next(&self, operation: Operation, err: BackendError) {
        self.state
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn list_page(&self, request: ListPageRequest) -> BackendResult<ListPage> {
        let mut state = self.state.lock().await;
        state.begin(Operation::ListPage)?;

        let max_keys = request.max_keys.max(1) as usize;
        let token = request.continuation_token.as_deref();
        let delimiter = request.delimiter.as_deref().filter(|d| !d.is_empty());

        let mut page = ListPage::default();
        let mut entries = 0usize;
        let mut last_marker: Option<String> = None;
        let mut truncated = false;

        for (key, obj) in state.objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if let Some(token) = token {
                let inside_token_prefix =
                    delimiter.is_some_and(|d| token.ends_with(d)) && key.starts_with(token);
                if key.as_str() <= token || inside_token_prefix {
                    continue;
                }
            }

            let common = delimiter
                .and_then(|d| compute_common_prefix(key, Some(&request.prefix), d));
            if let Some(prefix) = &common {
                if page.common_prefixes.last() == Some(prefix) {
                    continue;
                }
            }

            if entries == max_keys {
                truncated = true;
                break;
            }
            entries += 1;

            match common {
                Some(prefix) => {
                    last_marker = Some(prefix.clone());
                    page.common_prefixes.push(prefix);
                }
                None => {
                    last_marker = Some(key.clone());
                    page.objects.push(ObjectSummary {
                        key: key.clone(),
                        size: obj.body.len() as i64,
                        last_modified: Some(obj.last_modified),
                        etag: Some(obj.etag.clone()),
                    });
                }
            }
        }

        if truncated {
            page.next_continuation_token = last_marker;
        }
        Ok(page)
    }

    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut state = self.state.lock().await;
        state.begin(Operation::ListKeys)?;
        Ok(state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<Option<String>> {
        let mut state = self.state.lock().await;
        state.begin(Operation::PutObject)?;
        let etag = state.store(
            request.key,
            request.body,
            request.content_type,
            request.public_read,
        );
        Ok(Some(etag))
    }

    async fn create_multipart_upload(
        &self,
        request: CreateMultipartRequest,
    ) -> BackendResult<String> {
        let mut state = self.state.lock().await;
        state.begin(Operation::CreateMultipartUpload)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: request.key,
                content_type: request.content_type,
                public_read: request.public_read,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String> {
        let mut state = self.state.lock().await;
        state.begin(Operation::UploadPart)?;
        if !(1..=MAX_PART_NUMBER).contains(&request.part_number) {
            return Err(BackendError::rejected(
                Operation::UploadPart,
                "InvalidArgument",
                format!("part number {} out of range", request.part_number),
            ));
        }
        let upload = state
            .uploads
            .get_mut(&request.upload_id)
            .filter(|upload| upload.key == request.key)
            .ok_or_else(|| no_such_upload(Operation::UploadPart, &request.upload_id))?;
        let etag = format!("{:x}", md5::compute(&request.body));
        upload
            .parts
            .insert(request.part_number, (etag.clone(), request.body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartTag],
    ) -> BackendResult<Option<String>> {
        let op = Operation::CompleteMultipartUpload;
        let mut state = self.state.lock().await;
        state.begin(op)?;

        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| no_such_upload(op, upload_id))?;
        if parts.is_empty() {
            return Err(BackendError::rejected(op, "MalformedXML", "no parts given"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::rejected(
                op,
                "InvalidPartOrder",
                "parts must be listed in ascending order",
            ));
        }

        let mut body = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => body.extend_from_slice(data),
                _ => {
                    return Err(BackendError::rejected(
                        op,
                        "InvalidPart",
                        format!("part {} missing or etag mismatch", part.part_number),
                    ));
                }
            }
        }

        let Some(upload) = state.uploads.remove(upload_id) else {
            return Err(no_such_upload(op, upload_id));
        };
        let etag = format!("{:x}-{}", md5::compute(&body), parts.len());
        state.store(
            upload.key,
            body.freeze(),
            upload.content_type,
            upload.public_read,
        );
        if let Some(stored) = state.objects.get_mut(key) {
            stored.etag = etag.clone();
        }
        state.completions.push(CompletedUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        debug!("memory backend assembled {} from {} parts", key, parts.len());
        Ok(Some(etag))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        let op = Operation::AbortMultipartUpload;
        let mut state = self.state.lock().await;
        state.begin(op)?;
        match state.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                state.uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(no_such_upload(op, upload_id)),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<DeleteSummary> {
        let mut state = self.state.lock().await;
        state.begin(Operation::DeleteObjects)?;
        let mut summary = DeleteSummary::default();
        for key in keys {
            // S3 reports absent keys as deleted too.
            state.objects.remove(key);
            summary.deleted.push(key.clone());
        }
        Ok(summary)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> BackendResult<String> {
        let mut state = self.state.lock().await;
        state.begin(Operation::PresignGet)?;
        let seconds = expires_in.as_secs();
        let signature = md5::compute(format!("{}/{}:{}", self.bucket, key, seconds));
        Ok(format!(
            "{}?X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Expires={}&X-Amz-Signature={:x}",
            self.public_url(key),
            seconds,
            signature
        ))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, encode_key(key))
    }
}

fn no_such_upload(operation: Operation, upload_id: &str) -> BackendError {
    BackendError::rejected(
        operation,
        "NoSuchUpload",
        format!("upload `{}` does not exist", upload_id),
    )
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Returns Some(prefix) if the key belongs to a grouped prefix one level
/// below `requested_prefix`, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::new();
    if let Some(prefix) = requested_prefix {
        combined.push_str(prefix);
    }
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}
