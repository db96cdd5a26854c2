#![allow(dead_code)]

use bytes::Bytes;
use futures::{Stream, stream};
use object_gateway::{
    backend::{MemoryBackend, RetryPolicy},
    db,
    models::upload::Payload,
    services::gateway_service::{GatewayService, GatewaySettings},
};
use sqlx::SqlitePool;
use std::{io, sync::Arc, time::Duration};

pub async fn ledger_pool() -> Arc<SqlitePool> {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(pool)
}

pub fn settings() -> GatewaySettings {
    GatewaySettings {
        list_page_size: 1000,
        max_payload_bytes: 1024 * 1024,
        retry: RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
        },
    }
}

pub async fn gateway() -> (Arc<MemoryBackend>, GatewayService) {
    gateway_with(settings()).await
}

pub async fn gateway_with(settings: GatewaySettings) -> (Arc<MemoryBackend>, GatewayService) {
    let backend = Arc::new(MemoryBackend::new("assets"));
    let service = GatewayService::new(backend.clone(), ledger_pool().await, settings);
    (backend, service)
}

pub fn payload(
    file_name: &str,
    body: &'static str,
) -> Payload<impl Stream<Item = io::Result<Bytes>> + Send + 'static> {
    Payload {
        file_name: file_name.to_string(),
        content_type: None,
        body: stream::iter(vec![Ok(Bytes::from_static(body.as_bytes()))]),
    }
}

pub fn broken_payload(
    file_name: &str,
) -> Payload<impl Stream<Item = io::Result<Bytes>> + Send + 'static> {
    Payload {
        file_name: file_name.to_string(),
        content_type: None,
        body: stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client disconnected")),
        ]),
    }
}
