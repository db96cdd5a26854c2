//! Background expiry of idle multipart uploads.

use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::services::gateway_service::GatewayService;

/// Every `interval`, abort sessions idle for longer than `max_idle`.
/// The task ends when `shutdown` is cancelled.
pub fn spawn_upload_sweeper(
    service: GatewayService,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("upload sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = service.abort_idle_uploads(max_idle).await;
                    debug!("sweep finished, {} uploads expired", expired.len());
                }
            }
        }
    })
}
