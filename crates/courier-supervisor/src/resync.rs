use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_telemetry::MetricsRecorder;
use courier_transport::ConnectionManager;

/// Default period between conversation resyncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Call `resync()` every `interval` until `cancel` fires. The first call
/// happens one full interval after spawning. Failures are logged only.
pub fn spawn_resync_task(
    connection: Arc<ConnectionManager>,
    metrics: Arc<MetricsRecorder>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match connection.resync().await {
                        Ok(()) => debug!("periodic resync complete"),
                        Err(e) => {
                            warn!(error = %e, kind = e.error_kind(), "periodic resync failed");
                            metrics.counter_inc("courier.resync.errors", &[], 1);
                        }
                    }
                }
            }
        }
        debug!("resync task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_transport::MockTransport;

    async fn connection(transport: &MockTransport) -> Arc<ConnectionManager> {
        Arc::new(
            ConnectionManager::initialize(transport, &MockTransport::config())
                .await
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resyncs_every_interval() {
        let transport = MockTransport::new();
        let conn = connection(&transport).await;
        let session = transport.session();
        // initialize() already resynced once
        assert_eq!(session.resync_calls(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_resync_task(
            conn,
            Arc::new(MetricsRecorder::new()),
            Duration::from_secs(300),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(session.resync_calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.resync_calls(), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(session.resync_calls(), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_task() {
        let transport = MockTransport::new();
        let conn = connection(&transport).await;
        let session = transport.session();
        session.set_fail_resync(true);

        let metrics = Arc::new(MetricsRecorder::new());
        let cancel = CancellationToken::new();
        let handle = spawn_resync_task(
            conn,
            Arc::clone(&metrics),
            Duration::from_secs(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(metrics.counter_get("courier.resync.errors", &[]), 3);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_stops_calling() {
        let transport = MockTransport::new();
        let conn = connection(&transport).await;
        let cancel = CancellationToken::new();
        let handle = spawn_resync_task(
            conn,
            Arc::new(MetricsRecorder::new()),
            Duration::from_secs(5),
            cancel.clone(),
        );

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.session().resync_calls(), 1);
    }
}
