//! Upload payloads and the objects they produce.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A file handed over by the caller: its name, declared type and byte stream.
pub struct Payload<S> {
    pub file_name: String,
    pub content_type: Option<String>,
    pub body: S,
}

/// An object written by a single-part upload.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedObject {
    pub key: String,
    pub size: usize,
    pub content_type: String,
    pub etag: Option<String>,
    pub url: String,
}

/// A time-limited GET URL for one object.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub key: String,
    pub url: String,
    pub method: &'static str,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
