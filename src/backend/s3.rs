//! S3 backend built on `aws-sdk-s3`.
//!
//! Every method builds one SDK request and forwards it. SDK errors are
//! classified in `classify` so callers only ever see `BackendError`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::Region,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::{ByteStream, DateTime as SdkDateTime},
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl, ObjectIdentifier},
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use super::{
    BackendError, BackendResult, CreateMultipartRequest, ListPage, ListPageRequest,
    ObjectBackend, ObjectSummary, Operation, PutObjectRequest, UploadPartRequest, encode_key,
};
use crate::{
    config::S3Settings,
    models::list_item::{DeleteFailure, DeleteSummary},
    models::multipart::PartTag,
};

/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH_LIMIT: usize = 1000;

pub struct S3Backend {
    client: Client,
    bucket: String,
    url_base: String,
}

impl S3Backend {
    /// Build a client from the configured region, endpoint and credentials.
    /// Without static credentials the SDK's default provider chain applies.
    pub async fn new(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(credentials) = &settings.credentials {
            loader = loader.credentials_provider(credentials.to_sdk());
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.force_path_style)
            .build();

        Self::from_client(Client::from_conf(config), settings)
    }

    pub fn from_client(client: Client, settings: &S3Settings) -> Self {
        Self {
            client,
            bucket: settings.bucket.clone(),
            url_base: public_url_base(settings),
        }
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn list_page(&self, request: ListPageRequest) -> BackendResult<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter)
            .set_continuation_token(request.continuation_token)
            .max_keys(request.max_keys)
            .send()
            .await
            .map_err(|err| classify(Operation::ListPage, err))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: object.last_modified().and_then(to_chrono),
                    etag: object.e_tag().map(str::to_string),
                })
            })
            .collect();
        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|prefix| prefix.prefix().map(str::to_string))
            .collect();
        let next_continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_continuation_token,
        })
    }

    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(|err| classify(Operation::ListKeys, err))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            continuation_token = output.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn put_object(&self, request: PutObjectRequest) -> BackendResult<Option<String>> {
        let length = request.body.len() as i64;
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(request.content_type)
            .content_length(length)
            .set_acl(request.public_read.then_some(ObjectCannedAcl::PublicRead))
            .body(ByteStream::from(request.body))
            .send()
            .await
            .map_err(|err| classify(Operation::PutObject, err))?;
        Ok(output.e_tag().map(str::to_string))
    }

    async fn create_multipart_upload(
        &self,
        request: CreateMultipartRequest,
    ) -> BackendResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(request.content_type)
            .set_acl(request.public_read.then_some(ObjectCannedAcl::PublicRead))
            .send()
            .await
            .map_err(|err| classify(Operation::CreateMultipartUpload, err))?;
        output.upload_id().map(str::to_string).ok_or_else(|| {
            BackendError::rejected(
                Operation::CreateMultipartUpload,
                "MissingUploadId",
                "response carried no upload id",
            )
        })
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BackendResult<String> {
        let length = request.body.len() as i64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(request.part_number)
            .content_length(length)
            .body(ByteStream::from(request.body))
            .send()
            .await
            .map_err(|err| classify(Operation::UploadPart, err))?;
        output.e_tag().map(str::to_string).ok_or_else(|| {
            BackendError::rejected(
                Operation::UploadPart,
                "MissingETag",
                format!("part {} response carried no etag", request.part_number),
            )
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartTag],
    ) -> BackendResult<Option<String>> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|err| classify(Operation::CompleteMultipartUpload, err))?;
        Ok(output.e_tag().map(str::to_string))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| classify(Operation::AbortMultipartUpload, err))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<DeleteSummary> {
        let op = Operation::DeleteObjects;
        let mut summary = DeleteSummary::default();
        for batch in keys.chunks(DELETE_BATCH_LIMIT) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| BackendError::rejected(op, "InvalidRequest", err.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|err| BackendError::rejected(op, "InvalidRequest", err.to_string()))?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| classify(op, err))?;

            summary.deleted.extend(
                output
                    .deleted()
                    .iter()
                    .filter_map(|deleted| deleted.key().map(str::to_string)),
            );
            summary
                .failed
                .extend(output.errors().iter().map(|error| DeleteFailure {
                    key: error.key().unwrap_or_default().to_string(),
                    code: error.code().unwrap_or("Unknown").to_string(),
                    message: error.message().unwrap_or_default().to_string(),
                }));
        }
        debug!(
            "deleted {} of {} keys from {}",
            summary.deleted.len(),
            keys.len(),
            self.bucket
        );
        Ok(summary)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> BackendResult<String> {
        let op = Operation::PresignGet;
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|err| BackendError::rejected(op, "InvalidRequest", err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| classify(op, err))?;
        Ok(request.uri().to_string())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.url_base, encode_key(key))
    }
}

/// Base that object keys are appended to for public URLs.
///
/// An explicit public base URL wins; a custom endpoint is addressed
/// path-style; plain AWS uses the virtual-hosted bucket domain.
pub fn public_url_base(settings: &S3Settings) -> String {
    if let Some(base) = &settings.public_base_url {
        return base.trim_end_matches('/').to_string();
    }
    match &settings.endpoint {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), settings.bucket),
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            settings.bucket, settings.region
        ),
    }
}

/// Map an SDK error onto `BackendError`.
///
/// Timeouts, dispatch failures, unparseable responses, 5xx and throttling
/// are `Unavailable`; any other service error or a request that could not
/// be constructed is `Rejected`.
fn classify<E>(operation: Operation, err: SdkError<E>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            BackendError::unavailable(operation, message)
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = err.code().unwrap_or("Unknown").to_string();
            if status >= 500 || status == 429 || code == "SlowDown" {
                BackendError::unavailable(operation, message)
            } else {
                BackendError::rejected(operation, code, message)
            }
        }
        _ => BackendError::rejected(operation, "InvalidRequest", message),
    }
}

fn to_chrono(timestamp: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}
