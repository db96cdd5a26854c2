//! Represents multipart upload sessions and parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A multipart upload in progress, keyed by its destination object key.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadSession {
    /// Internal id, used as the ledger's primary key.
    pub id: Uuid,

    /// Destination object key (path + file name).
    pub key: String,

    /// Upload handle issued by the storage backend.
    pub upload_id: String,

    /// Number of chunks the caller announced.
    pub total_parts: u32,

    pub content_type: String,

    /// Part tags received so far, by part number.
    pub parts: BTreeMap<i32, PartTag>,

    pub initiated_at: DateTime<Utc>,

    /// Time of the last chunk; drives idle expiry.
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(key: String, upload_id: String, total_parts: u32, content_type: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            upload_id,
            total_parts,
            content_type,
            parts: BTreeMap::new(),
            initiated_at: now,
            updated_at: now,
        }
    }

    /// Store a part tag, replacing any tag previously held for its number.
    pub fn record_part(&mut self, tag: PartTag) {
        self.updated_at = tag.uploaded_at;
        self.parts.insert(tag.part_number, tag);
    }

    /// True once a tag is held for every part number in `1..=total_parts`.
    pub fn is_complete(&self) -> bool {
        self.parts.len() == self.total_parts as usize
            && self
                .parts
                .keys()
                .copied()
                .eq(1..=self.total_parts as i32)
    }

    /// Part tags in ascending part-number order.
    pub fn ordered_parts(&self) -> Vec<PartTag> {
        self.parts.values().cloned().collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            total_parts: self.total_parts,
            received_parts: self.parts.len(),
            initiated_at: self.initiated_at,
            updated_at: self.updated_at,
        }
    }
}

/// The backend's receipt for one uploaded part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartTag {
    /// Part number (1-based).
    pub part_number: i32,

    /// ETag returned for this part, echoed verbatim on completion.
    pub etag: String,

    pub size_bytes: i64,

    pub uploaded_at: DateTime<Utc>,
}

/// Caller-facing view of an open session.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    pub upload_id: String,
    pub total_parts: u32,
    pub received_parts: usize,
    pub initiated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of accepting one chunk.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChunkOutcome {
    /// The part was stored; more chunks are expected.
    #[serde(rename_all = "camelCase")]
    Stored {
        key: String,
        part_number: i32,
        received: usize,
        total: u32,
    },
    /// The last missing part arrived and the object was assembled.
    #[serde(rename_all = "camelCase")]
    Completed {
        key: String,
        etag: Option<String>,
        url: String,
        parts: usize,
    },
}

/// Ledger row for a session (`multipart_uploads`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    pub id: Uuid,
    pub object_key: String,
    pub upload_id: String,
    pub content_type: String,
    pub total_parts: i64,
    pub initiated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger row for one received part (`multipart_parts`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Reference to the parent session's `id`.
    pub upload_id: Uuid,
    pub part_number: i64,
    pub etag: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}
