//! Chunked uploads assembled with S3 multipart uploads.

use bytes::Bytes;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendError, CreateMultipartRequest, ObjectBackend, UploadPartRequest},
    models::multipart::{ChunkOutcome, PartTag, SessionSummary, UploadSession},
    services::{
        gateway_service::{GatewayError, GatewayResult},
        session_table::{SessionGuard, SessionTable},
        upload_ledger::UploadLedger,
    },
};

/// Most parts a multipart upload may have.
pub const MAX_CHUNKS: u32 = 10_000;

/// One buffered chunk of a file.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub key: String,
    pub content_type: String,
    /// Zero-based chunk index; part number is `index + 1`.
    pub index: u32,
    pub total: u32,
    pub body: Bytes,
}

/// Check chunk numbering before any payload is read.
pub fn validate_chunk(index: u32, total: u32) -> GatewayResult<()> {
    if total > MAX_CHUNKS {
        return Err(GatewayError::TooManyChunks {
            total,
            max: MAX_CHUNKS,
        });
    }
    if total == 0 || index >= total {
        return Err(GatewayError::ChunkOutOfRange { index, total });
    }
    Ok(())
}

pub struct MultipartCoordinator {
    backend: Arc<dyn ObjectBackend>,
    ledger: UploadLedger,
    sessions: SessionTable,
}

impl MultipartCoordinator {
    pub fn new(backend: Arc<dyn ObjectBackend>, ledger: UploadLedger) -> Self {
        Self {
            backend,
            ledger,
            sessions: SessionTable::new(),
        }
    }

    /// Upload one chunk, starting the session on the first chunk for the
    /// key and completing it once every part is present.
    pub async fn upload_chunk(&self, chunk: ChunkUpload) -> GatewayResult<ChunkOutcome> {
        validate_chunk(chunk.index, chunk.total)?;
        let mut guard = self.sessions.acquire(&chunk.key).await;
        let result = self.apply_chunk(&mut guard, chunk).await;
        self.sessions.release(guard).await;
        result
    }

    async fn apply_chunk(
        &self,
        guard: &mut SessionGuard,
        chunk: ChunkUpload,
    ) -> GatewayResult<ChunkOutcome> {
        if let Some(session) = guard.as_ref() {
            if session.total_parts != chunk.total {
                return Err(GatewayError::ChunkCountMismatch {
                    key: chunk.key,
                    expected: session.total_parts,
                    actual: chunk.total,
                });
            }
        } else {
            **guard = Some(self.initiate(&chunk).await?);
        }
        let part_number = chunk.index as i32 + 1;
        let size_bytes = chunk.body.len() as i64;
        let etag = match self.upload_part(guard, part_number, chunk.body.clone()).await {
            Err(GatewayError::Backend(err)) if is_missing_upload(&err) => {
                self.forget(guard).await;
                if chunk.index != 0 {
                    return Err(GatewayError::SessionNotFound(chunk.key));
                }
                warn!("upload of {} vanished from backend, starting over", chunk.key);
                **guard = Some(self.initiate(&chunk).await?);
                self.upload_part(guard, part_number, chunk.body).await?
            }
            other => other?,
        };
        let Some(session) = guard.as_mut() else {
            return Err(GatewayError::SessionNotFound(chunk.key));
        };
        let tag = PartTag {
            part_number,
            etag,
            size_bytes,
            uploaded_at: Utc::now(),
        };
        session.record_part(tag.clone());
        self.ledger.record_part(session.id, &tag).await?;
        debug!(
            "stored part {}/{} of {} ({} bytes)",
            part_number, session.total_parts, session.key, size_bytes
        );

        if !session.is_complete() {
            return Ok(ChunkOutcome::Stored {
                key: session.key.clone(),
                part_number,
                received: session.parts.len(),
                total: session.total_parts,
            });
        }

        let parts = session.ordered_parts();
        let etag = match self
            .backend
            .complete_multipart_upload(&session.key, &session.upload_id, &parts)
            .await
        {
            Ok(etag) => etag,
            Err(err) if is_missing_upload(&err) => {
                self.forget(guard).await;
                return Err(GatewayError::SessionNotFound(chunk.key));
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = self.ledger.remove(session.id).await {
            warn!("failed to drop ledger entry for {}: {}", session.key, err);
        }
        info!("completed multipart upload of {} ({} parts)", session.key, parts.len());

        let outcome = ChunkOutcome::Completed {
            url: self.backend.public_url(&session.key),
            key: session.key.clone(),
            etag,
            parts: parts.len(),
        };
        **guard = None;
        Ok(outcome)
    }

    async fn upload_part(
        &self,
        guard: &SessionGuard,
        part_number: i32,
        body: Bytes,
    ) -> GatewayResult<String> {
        let Some(session) = guard.as_ref() else {
            return Err(GatewayError::SessionNotFound(guard.key().to_string()));
        };
        let etag = self
            .backend
            .upload_part(UploadPartRequest {
                key: session.key.clone(),
                upload_id: session.upload_id.clone(),
                part_number,
                body,
            })
            .await?;
        Ok(etag)
    }

    /// Drop the slot's session and its ledger row without touching the
    /// backend.
    async fn forget(&self, guard: &mut SessionGuard) {
        let Some(session) = guard.take() else {
            return;
        };
        if let Err(err) = self.ledger.remove(session.id).await {
            warn!("failed to drop ledger entry for {}: {}", session.key, err);
        }
        info!(
            "dropped session for {}: upload {} no longer exists on backend",
            session.key, session.upload_id
        );
    }

    async fn initiate(&self, chunk: &ChunkUpload) -> GatewayResult<UploadSession> {
        let upload_id = self
            .backend
            .create_multipart_upload(CreateMultipartRequest {
                key: chunk.key.clone(),
                content_type: chunk.content_type.clone(),
                public_read: true,
            })
            .await?;
        let session = UploadSession::new(
            chunk.key.clone(),
            upload_id,
            chunk.total,
            chunk.content_type.clone(),
        );
        if let Err(err) = self.ledger.record_upload(&session).await {
            error!("could not record upload of {}: {}", session.key, err);
            if let Err(abort_err) = self
                .backend
                .abort_multipart_upload(&session.key, &session.upload_id)
                .await
            {
                warn!("abort after ledger failure also failed: {}", abort_err);
            }
            return Err(err.into());
        }
        info!(
            "started multipart upload of {} ({} chunks, upload id {})",
            session.key, session.total_parts, session.upload_id
        );
        Ok(session)
    }

    /// Cancel the session for `key`.
    pub async fn abort(&self, key: &str) -> GatewayResult<()> {
        let mut guard = self.sessions.acquire(key).await;
        let result = match guard.as_ref() {
            Some(session) => self.discard(session).await,
            None => Err(GatewayError::SessionNotFound(key.to_string())),
        };
        if result.is_ok() {
            *guard = None;
            info!("aborted multipart upload of {}", key);
        }
        self.sessions.release(guard).await;
        result
    }

    /// Abort every session without a chunk for longer than `max_idle`.
    /// Sessions busy with a chunk right now are skipped.
    pub async fn abort_idle(&self, max_idle: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return Vec::new();
        };
        let mut aborted = Vec::new();

        for mut guard in self.sessions.acquire_idle().await {
            let expired = guard
                .as_ref()
                .is_some_and(|session| session.updated_at < cutoff);
            if expired {
                if let Some(session) = guard.as_ref() {
                    match self.discard(session).await {
                        Ok(()) => {
                            aborted.push(guard.key().to_string());
                            *guard = None;
                        }
                        Err(err) => warn!("could not expire upload of {}: {}", guard.key(), err),
                    }
                }
            }
            self.sessions.release(guard).await;
        }

        if !aborted.is_empty() {
            info!("expired {} idle multipart uploads", aborted.len());
        }
        aborted
    }

    /// Abort the backend upload and forget the session. An upload the
    /// backend no longer knows counts as aborted.
    async fn discard(&self, session: &UploadSession) -> GatewayResult<()> {
        match self
            .backend
            .abort_multipart_upload(&session.key, &session.upload_id)
            .await
        {
            Ok(()) => {}
            Err(err) if is_missing_upload(&err) => {
                debug!("upload {} already gone from backend", session.upload_id);
            }
            Err(err) => return Err(err.into()),
        }
        self.ledger.remove(session.id).await?;
        Ok(())
    }

    /// Load sessions recorded in the ledger into the table.
    pub async fn restore(&self) -> GatewayResult<usize> {
        let mut restored = 0;
        for session in self.ledger.load().await? {
            let mut guard = self.sessions.acquire(&session.key).await;
            if guard.is_none() {
                debug!(
                    "restored upload of {} ({}/{} parts)",
                    session.key,
                    session.parts.len(),
                    session.total_parts
                );
                *guard = Some(session);
                restored += 1;
            }
            self.sessions.release(guard).await;
        }
        Ok(restored)
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions.summaries().await
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.sessions.contains(key).await
    }
}

fn is_missing_upload(err: &BackendError) -> bool {
    err.code() == Some("NoSuchUpload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MemoryBackend, Operation},
        db,
    };

    async fn coordinator() -> (Arc<MemoryBackend>, MultipartCoordinator) {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let backend = Arc::new(MemoryBackend::new("test"));
        let coordinator =
            MultipartCoordinator::new(backend.clone(), UploadLedger::new(Arc::new(pool)));
        (backend, coordinator)
    }

    fn chunk(index: u32, total: u32, body: &'static str) -> ChunkUpload {
        ChunkUpload {
            key: "videos/clip.mp4".into(),
            content_type: "video/mp4".into(),
            index,
            total,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn chunk_numbering_is_validated() {
        assert!(validate_chunk(0, 1).is_ok());
        assert!(validate_chunk(9_999, MAX_CHUNKS).is_ok());
        assert!(matches!(
            validate_chunk(0, 0),
            Err(GatewayError::ChunkOutOfRange { .. })
        ));
        assert!(matches!(
            validate_chunk(3, 3),
            Err(GatewayError::ChunkOutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            validate_chunk(0, MAX_CHUNKS + 1),
            Err(GatewayError::TooManyChunks { .. })
        ));
    }

    #[tokio::test]
    async fn single_chunk_upload_completes_immediately() {
        let (backend, coordinator) = coordinator().await;
        let outcome = coordinator.upload_chunk(chunk(0, 1, "whole")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { parts: 1, .. }));
        assert_eq!(
            backend.object("videos/clip.mp4").await.unwrap().body,
            Bytes::from_static(b"whole")
        );
        assert!(!coordinator.is_active("videos/clip.mp4").await);
    }

    #[tokio::test]
    async fn resent_chunk_replaces_its_part() {
        let (backend, coordinator) = coordinator().await;
        coordinator.upload_chunk(chunk(0, 2, "old-")).await.unwrap();
        coordinator.upload_chunk(chunk(0, 2, "new-")).await.unwrap();
        assert_eq!(coordinator.sessions().await[0].received_parts, 1);

        coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap();
        assert_eq!(
            backend.object("videos/clip.mp4").await.unwrap().body,
            Bytes::from_static(b"new-tail")
        );
        assert_eq!(backend.call_count(Operation::CreateMultipartUpload).await, 1);
    }

    #[tokio::test]
    async fn failed_part_keeps_session_for_resend() {
        let (backend, coordinator) = coordinator().await;
        coordinator.upload_chunk(chunk(0, 2, "head")).await.unwrap();
        backend
            .fail_next(
                Operation::UploadPart,
                BackendError::unavailable(Operation::UploadPart, "connection reset"),
            )
            .await;

        let err = coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
        assert!(coordinator.is_active("videos/clip.mp4").await);

        let outcome = coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn failed_initiation_leaves_no_session() {
        let (backend, coordinator) = coordinator().await;
        backend
            .fail_next(
                Operation::CreateMultipartUpload,
                BackendError::rejected(Operation::CreateMultipartUpload, "AccessDenied", "no"),
            )
            .await;
        assert!(coordinator.upload_chunk(chunk(0, 2, "head")).await.is_err());
        assert!(!coordinator.is_active("videos/clip.mp4").await);
        assert_eq!(backend.call_count(Operation::UploadPart).await, 0);
    }

    #[tokio::test]
    async fn abort_tolerates_upload_missing_on_backend() {
        let (backend, coordinator) = coordinator().await;
        coordinator.upload_chunk(chunk(0, 2, "head")).await.unwrap();
        backend
            .fail_next(
                Operation::AbortMultipartUpload,
                BackendError::rejected(Operation::AbortMultipartUpload, "NoSuchUpload", "gone"),
            )
            .await;
        coordinator.abort("videos/clip.mp4").await.unwrap();
        assert!(!coordinator.is_active("videos/clip.mp4").await);
        assert!(matches!(
            coordinator.abort("videos/clip.mp4").await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    async fn shared_ledger() -> UploadLedger {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        UploadLedger::new(Arc::new(pool))
    }

    /// A coordinator whose ledger remembers an upload that `backend` has
    /// never heard of, as after a restart against an expired upload.
    async fn restored_against_fresh_backend()
    -> (Arc<MemoryBackend>, UploadLedger, MultipartCoordinator) {
        let ledger = shared_ledger().await;
        let before =
            MultipartCoordinator::new(Arc::new(MemoryBackend::new("test")), ledger.clone());
        before.upload_chunk(chunk(0, 2, "head")).await.unwrap();

        let backend = Arc::new(MemoryBackend::new("test"));
        let after = MultipartCoordinator::new(backend.clone(), ledger.clone());
        assert_eq!(after.restore().await.unwrap(), 1);
        (backend, ledger, after)
    }

    #[tokio::test]
    async fn first_chunk_restarts_upload_missing_on_backend() {
        let (backend, ledger, coordinator) = restored_against_fresh_backend().await;

        let outcome = coordinator.upload_chunk(chunk(0, 2, "head")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Stored { received: 1, .. }));
        assert_eq!(backend.call_count(Operation::CreateMultipartUpload).await, 1);
        assert_eq!(ledger.count().await.unwrap(), 1);

        let outcome = coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { parts: 2, .. }));
        assert_eq!(
            backend.object("videos/clip.mp4").await.unwrap().body,
            Bytes::from_static(b"headtail")
        );
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn later_chunk_for_missing_upload_drops_session() {
        let (backend, ledger, coordinator) = restored_against_fresh_backend().await;

        let err = coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));
        assert!(!coordinator.is_active("videos/clip.mp4").await);
        assert_eq!(ledger.count().await.unwrap(), 0);
        assert_eq!(backend.call_count(Operation::CreateMultipartUpload).await, 0);

        // the caller can start over right away
        coordinator.upload_chunk(chunk(0, 2, "head")).await.unwrap();
        assert!(coordinator.is_active("videos/clip.mp4").await);
    }

    #[tokio::test]
    async fn completion_of_missing_upload_drops_session() {
        let (backend, coordinator) = coordinator().await;
        coordinator.upload_chunk(chunk(0, 2, "head")).await.unwrap();
        backend
            .fail_next(
                Operation::CompleteMultipartUpload,
                BackendError::rejected(Operation::CompleteMultipartUpload, "NoSuchUpload", "gone"),
            )
            .await;

        let err = coordinator.upload_chunk(chunk(1, 2, "tail")).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));
        assert!(!coordinator.is_active("videos/clip.mp4").await);
    }
}
