//! SQLite mirror of open multipart sessions.
//!
//! The session table lives in memory; the ledger keeps a copy of every
//! session and its part tags so they can be restored into the table after a
//! restart, where the sweeper can expire them again.

use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::models::multipart::{MultipartPart, MultipartUpload, PartTag, UploadSession};

#[derive(Clone)]
pub struct UploadLedger {
    db: Arc<SqlitePool>,
}

impl UploadLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Record a freshly initiated session, replacing any stale row for the
    /// same key.
    pub async fn record_upload(&self, session: &UploadSession) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM multipart_parts WHERE upload_id IN
                (SELECT id FROM multipart_uploads WHERE object_key = ?)",
        )
        .bind(&session.key)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE object_key = ?")
            .bind(&session.key)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO multipart_uploads
                (id, object_key, upload_id, content_type, total_parts, initiated_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.key)
        .bind(&session.upload_id)
        .bind(&session.content_type)
        .bind(i64::from(session.total_parts))
        .bind(session.initiated_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Upsert a part tag and bump the session's activity timestamp.
    pub async fn record_part(&self, session_id: Uuid, part: &PartTag) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO multipart_parts (upload_id, part_number, etag, size_bytes, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(session_id)
        .bind(i64::from(part.part_number))
        .bind(&part.etag)
        .bind(part.size_bytes)
        .bind(part.uploaded_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE multipart_uploads SET updated_at = ? WHERE id = ?")
            .bind(part.uploaded_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    pub async fn remove(&self, session_id: Uuid) -> sqlx::Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Rebuild every recorded session with its parts.
    pub async fn load(&self) -> sqlx::Result<Vec<UploadSession>> {
        let uploads = sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, object_key, upload_id, content_type, total_parts, initiated_at, updated_at
             FROM multipart_uploads ORDER BY initiated_at ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        let parts = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, etag, size_bytes, uploaded_at
             FROM multipart_parts ORDER BY upload_id, part_number ASC",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut parts_by_upload: HashMap<Uuid, Vec<MultipartPart>> = HashMap::new();
        for part in parts {
            parts_by_upload.entry(part.upload_id).or_default().push(part);
        }

        uploads
            .into_iter()
            .map(|row| {
                let total_parts =
                    u32::try_from(row.total_parts).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
                let mut session = UploadSession {
                    id: row.id,
                    key: row.object_key,
                    upload_id: row.upload_id,
                    total_parts,
                    content_type: row.content_type,
                    parts: Default::default(),
                    initiated_at: row.initiated_at,
                    updated_at: row.updated_at,
                };
                for part in parts_by_upload.remove(&row.id).unwrap_or_default() {
                    let part_number = i32::try_from(part.part_number)
                        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
                    session.parts.insert(
                        part_number,
                        PartTag {
                            part_number,
                            etag: part.etag,
                            size_bytes: part.size_bytes,
                            uploaded_at: part.uploaded_at,
                        },
                    );
                }
                Ok(session)
            })
            .collect()
    }

    pub async fn count(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM multipart_uploads")
            .fetch_one(&*self.db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Utc;

    async fn ledger() -> UploadLedger {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        UploadLedger::new(Arc::new(pool))
    }

    fn part(part_number: i32, etag: &str) -> PartTag {
        PartTag {
            part_number,
            etag: etag.into(),
            size_bytes: 4,
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sessions_round_trip_with_parts() {
        let ledger = ledger().await;
        let session = UploadSession::new("docs/big.pdf".into(), "u-1".into(), 3, "application/pdf".into());
        ledger.record_upload(&session).await.unwrap();
        ledger.record_part(session.id, &part(2, "b")).await.unwrap();
        ledger.record_part(session.id, &part(1, "a")).await.unwrap();
        ledger.record_part(session.id, &part(1, "a2")).await.unwrap();

        let loaded = ledger.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0];
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.key, "docs/big.pdf");
        assert_eq!(restored.total_parts, 3);
        assert_eq!(restored.parts.len(), 2);
        assert_eq!(restored.parts[&1].etag, "a2");
        assert_eq!(restored.parts[&2].etag, "b");
    }

    #[tokio::test]
    async fn new_session_replaces_stale_row_for_key() {
        let ledger = ledger().await;
        let stale = UploadSession::new("a.bin".into(), "old".into(), 2, "x/y".into());
        ledger.record_upload(&stale).await.unwrap();
        ledger.record_part(stale.id, &part(1, "a")).await.unwrap();

        let fresh = UploadSession::new("a.bin".into(), "new".into(), 2, "x/y".into());
        ledger.record_upload(&fresh).await.unwrap();

        let loaded = ledger.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].upload_id, "new");
        assert!(loaded[0].parts.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_session_and_parts() {
        let ledger = ledger().await;
        let session = UploadSession::new("a.bin".into(), "u".into(), 2, "x/y".into());
        ledger.record_upload(&session).await.unwrap();
        ledger.record_part(session.id, &part(1, "a")).await.unwrap();
        ledger.remove(session.id).await.unwrap();

        assert_eq!(ledger.count().await.unwrap(), 0);
        assert!(ledger.load().await.unwrap().is_empty());
    }
}
