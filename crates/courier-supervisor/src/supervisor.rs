use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use courier_core::errors::SupervisorError;
use courier_core::ids::SupervisorId;
use courier_core::messages::RawMessage;
use courier_core::security::TransportConfig;
use courier_core::transport::{MessageStream, Transport};
use courier_settings::CourierSettings;
use courier_telemetry::MetricsRecorder;
use courier_transport::ConnectionManager;

use crate::backoff::{RestartDecision, RestartPolicy, RestartState};
use crate::dedup::{DeduplicationCache, DEFAULT_CAPACITY};
use crate::dispatcher::{MessageDispatcher, MessageHandler, SkipReason};
use crate::resync::{spawn_resync_task, DEFAULT_SYNC_INTERVAL};
use crate::shutdown::{ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::state::{transition, SupervisorEvent, SupervisorState};

/// Invoked whenever a restart cycle begins. Panics are caught.
pub type FailureCallback = Arc<dyn Fn(&SupervisorError) + Send + Sync>;

/// Default time a restarted stream must stay up to forgive one restart.
pub const DEFAULT_RECOVERY_GRACE: Duration = Duration::from_secs(30);

/// Everything a supervisor needs besides the transport and the handler.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub transport: TransportConfig,
    pub policy: RestartPolicy,
    pub recovery_grace: Duration,
    pub sync_interval: Duration,
    pub dedup_capacity: usize,
    pub shutdown_timeout: Duration,
    /// Case-insensitive substrings marking a stream error as transient.
    pub transient_patterns: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            policy: RestartPolicy::default(),
            recovery_grace: DEFAULT_RECOVERY_GRACE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            dedup_capacity: DEFAULT_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            transient_patterns: courier_core::errors::DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl SupervisorConfig {
    /// Build from loaded settings. Secrets are read from the environment.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let s = &settings.supervisor;
        Self {
            transport: TransportConfig {
                env: Some(settings.transport.env),
                storage_path: settings.transport.storage_path.clone(),
                ..TransportConfig::default()
            }
            .with_env_fallback(),
            policy: RestartPolicy::from(s),
            recovery_grace: Duration::from_secs(s.recovery_grace_secs),
            sync_interval: Duration::from_secs(s.sync_interval_secs),
            dedup_capacity: s.dedup_capacity,
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_secs),
            transient_patterns: s.transient_error_patterns.clone(),
        }
    }
}

/// Point-in-time view of a supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub state: SupervisorState,
    pub restart_count: u32,
    pub processed_count: u64,
    /// Delay chosen for the most recent restart, if any.
    pub last_restart_delay_ms: Option<u64>,
}

struct StatusInner {
    state: SupervisorState,
    restart: RestartState,
    last_delay: Option<Duration>,
}

/// State shared between the supervisor, its handle and the consume loop.
struct Shared {
    id: SupervisorId,
    status: Mutex<StatusInner>,
    processed: AtomicU64,
    coordinator: ShutdownCoordinator,
    metrics: Arc<MetricsRecorder>,
}

impl Shared {
    fn apply(&self, event: SupervisorEvent) -> SupervisorState {
        let mut status = self.status.lock();
        let from = status.state;
        let to = transition(from, event);
        if from != to {
            debug!(supervisor_id = %self.id, %from, %to, ?event, "state transition");
        }
        status.state = to;
        to
    }

    fn request_shutdown(&self) {
        let before = self.status.lock().state;
        self.apply(SupervisorEvent::Shutdown);
        self.coordinator.shutdown();
        if before.is_running() {
            info!(supervisor_id = %self.id, state = %before, "shutdown requested");
        }
    }

    fn snapshot(&self) -> SupervisorStatus {
        let status = self.status.lock();
        SupervisorStatus {
            running: status.state.is_running(),
            state: status.state,
            restart_count: status.restart.restart_count,
            processed_count: self.processed.load(Ordering::Relaxed),
            last_restart_delay_ms: status.last_delay.map(|d| d.as_millis() as u64),
        }
    }

    fn publish_restart_count(&self, count: u32) {
        self.metrics
            .gauge_set("courier.restart_count", &[], f64::from(count));
    }
}

/// Keeps one message stream alive and feeds it to a handler.
///
/// A supervisor starts at most once; after [`StreamSupervisor::shutdown`] it
/// can never be started again.
pub struct StreamSupervisor {
    shared: Arc<Shared>,
    config: SupervisorConfig,
    handler: Arc<dyn MessageHandler>,
    on_failure: Option<FailureCallback>,
}

impl StreamSupervisor {
    pub fn new(config: SupervisorConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: SupervisorId::new(),
                status: Mutex::new(StatusInner {
                    state: SupervisorState::Stopped,
                    restart: RestartState::default(),
                    last_delay: None,
                }),
                processed: AtomicU64::new(0),
                coordinator: ShutdownCoordinator::new(),
                metrics: Arc::new(MetricsRecorder::new()),
            }),
            config,
            handler,
            on_failure: None,
        }
    }

    /// Builder: callback invoked at the start of every restart cycle.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SupervisorError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Builder: use a shared metrics recorder instead of a private one.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = metrics;
        }
        self
    }

    /// Builder: seed the restart counters, e.g. from a previous run.
    pub fn with_restart_state(self, restart: RestartState) -> Self {
        self.shared.status.lock().restart = restart;
        self
    }

    pub fn id(&self) -> &SupervisorId {
        &self.shared.id
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.shared.snapshot()
    }

    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Open the session and the first stream, then spawn the consume loop.
    ///
    /// Only configuration and session errors are returned; a failing first
    /// stream puts the loop straight into the restart path.
    pub async fn start(
        &self,
        transport: &dyn Transport,
    ) -> Result<SupervisorHandle, SupervisorError> {
        self.shared.coordinator.begin()?;
        self.shared.apply(SupervisorEvent::Start);
        info!(
            supervisor_id = %self.shared.id,
            transport = transport.name(),
            "starting supervisor"
        );

        let initialized = ConnectionManager::initialize(transport, &self.config.transport).await;
        let connection = match initialized {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                error!(
                    supervisor_id = %self.shared.id,
                    error = %e,
                    kind = e.error_kind(),
                    fatal = e.is_fatal(),
                    "supervisor failed to start"
                );
                self.shared.apply(SupervisorEvent::LoopExited);
                return Err(e);
            }
        };

        let first = connection.open_stream().await;
        if first.is_ok() {
            self.shared.apply(SupervisorEvent::StreamOpened);
            info!(
                supervisor_id = %self.shared.id,
                inbox_id = %connection.identity(),
                "listening for messages"
            );
        }

        let runner = Runner {
            shared: Arc::clone(&self.shared),
            dispatcher: MessageDispatcher::new(
                Arc::clone(&connection),
                Arc::clone(&self.shared.metrics),
            ),
            connection: Arc::clone(&connection),
            cache: DeduplicationCache::new(self.config.dedup_capacity),
            handler: Arc::clone(&self.handler),
            on_failure: self.on_failure.clone(),
            config: self.config.clone(),
        };
        let span = info_span!("supervisor", supervisor_id = %self.shared.id);
        let task = tokio::spawn(runner.run(first).instrument(span));

        Ok(SupervisorHandle {
            shared: Arc::clone(&self.shared),
            connection,
            task: Mutex::new(Some(task)),
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// Start a supervisor in one call.
pub async fn start(
    transport: &dyn Transport,
    config: SupervisorConfig,
    handler: Arc<dyn MessageHandler>,
    on_failure: Option<FailureCallback>,
) -> Result<SupervisorHandle, SupervisorError> {
    let mut supervisor = StreamSupervisor::new(config, handler);
    supervisor.on_failure = on_failure;
    supervisor.start(transport).await
}

/// Control surface of a running supervisor.
pub struct SupervisorHandle {
    shared: Arc<Shared>,
    connection: Arc<ConnectionManager>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl SupervisorHandle {
    pub fn id(&self) -> &SupervisorId {
        &self.shared.id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.shared.snapshot()
    }

    /// Stop consuming and cancel every timer. Returns without waiting.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Shut down and wait for the loop, aborting it after `timeout`.
    /// Returns `true` if the loop exited on its own.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.request_shutdown();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return true;
        };
        let clean = self.shared.coordinator.shutdown_and_join(task, timeout).await;
        if !clean {
            self.connection.mark_stopped();
            self.shared.apply(SupervisorEvent::LoopExited);
        }
        clean
    }

    /// [`Self::shutdown_and_wait`] with the configured timeout.
    pub async fn stop(&self) -> bool {
        self.shutdown_and_wait(self.shutdown_timeout).await
    }
}

enum StreamEnd {
    Shutdown,
    Failed(SupervisorError),
}

/// The consume task. Owns the dedup cache, so it survives restarts.
struct Runner {
    shared: Arc<Shared>,
    connection: Arc<ConnectionManager>,
    dispatcher: MessageDispatcher,
    cache: DeduplicationCache,
    handler: Arc<dyn MessageHandler>,
    on_failure: Option<FailureCallback>,
    config: SupervisorConfig,
}

impl Runner {
    async fn run(mut self, first: Result<MessageStream, SupervisorError>) {
        let token = self.shared.coordinator.token();
        let mut opened = Some(first);

        while let Some(result) = opened.take() {
            if token.is_cancelled() {
                break;
            }
            let failure = match result {
                Ok(stream) => {
                    self.shared.apply(SupervisorEvent::StreamOpened);
                    let resync_token = self.shared.coordinator.child_token();
                    spawn_resync_task(
                        Arc::clone(&self.connection),
                        Arc::clone(&self.shared.metrics),
                        self.config.sync_interval,
                        resync_token.clone(),
                    );
                    let end = self.consume(stream, &token).await;
                    resync_token.cancel();
                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            if !self.restart_after(failure, &token).await {
                break;
            }
            opened = tokio::select! {
                () = token.cancelled() => None,
                result = self.connection.open_stream() => Some(result),
            };
        }

        self.connection.mark_stopped();
        self.shared.apply(SupervisorEvent::LoopExited);
        info!(
            processed = self.shared.processed.load(Ordering::Relaxed),
            "supervisor stopped"
        );
    }

    async fn consume(&mut self, mut stream: MessageStream, token: &CancellationToken) -> StreamEnd {
        let grace = tokio::time::sleep(self.config.recovery_grace);
        tokio::pin!(grace);
        let mut grace_pending = self.shared.status.lock().restart.restart_count > 0;

        loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => return StreamEnd::Shutdown,
                () = &mut grace, if grace_pending => {
                    grace_pending = false;
                    self.record_recovery();
                    continue;
                }
                item = stream.next() => item,
            };

            match item {
                None => return StreamEnd::Failed(SupervisorError::StreamEnded),
                Some(Err(e)) if e.matches_any(&self.config.transient_patterns) => {
                    let err = SupervisorError::Transient(e);
                    warn!(error = %err, "ignoring transient stream error");
                    self.shared
                        .metrics
                        .counter_inc("courier.stream.transient_errors", &[], 1);
                }
                Some(Err(e)) => return StreamEnd::Failed(SupervisorError::StreamFailure(e)),
                Some(Ok(raw)) => self.process(raw, token).await,
            }
        }
    }

    async fn process(&mut self, raw: RawMessage, token: &CancellationToken) {
        let metrics = Arc::clone(&self.shared.metrics);
        metrics.counter_inc("courier.messages.received", &[], 1);

        if token.is_cancelled() {
            self.skip(SkipReason::ShuttingDown);
            return;
        }
        if let Some(reason) = self.dispatcher.filter(&raw) {
            self.skip(reason);
            return;
        }

        let key = raw.key();
        if !self.cache.add(key.clone()) {
            debug!(%key, "duplicate message");
            metrics.counter_inc("courier.messages.duplicates", &[], 1);
            self.skip(SkipReason::Duplicate);
            return;
        }

        let processed = match self.dispatcher.normalize(&raw).await {
            Ok(Some(processed)) => processed,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    conversation_id = %raw.conversation_id,
                    sender = %raw.sender_inbox_id,
                    error = %e,
                    "dropping message"
                );
                self.skip(SkipReason::LookupFailed);
                return;
            }
        };

        debug!(
            conversation_id = %processed.conversation_id,
            message_id = ?processed.message_id,
            "dispatching message"
        );
        let outcome = self.dispatcher.dispatch(&processed, self.handler.as_ref()).await;
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        debug!(?outcome, "message dispatched");
    }

    fn skip(&self, reason: SkipReason) {
        self.shared
            .metrics
            .counter_inc("courier.messages.skipped", &[("reason", reason.as_str())], 1);
    }

    fn record_recovery(&self) {
        let count = {
            let mut status = self.shared.status.lock();
            status.restart.record_recovery();
            status.restart.restart_count
        };
        self.shared.publish_restart_count(count);
        info!(restart_count = count, "stream stable, restart count lowered");
    }

    /// Run one restart cycle. Returns `false` if shutdown interrupted it.
    async fn restart_after(&self, failure: SupervisorError, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            debug!(error = %failure, "stream failed during shutdown, not restarting");
            return false;
        }
        let metrics = &self.shared.metrics;
        metrics.counter_inc("courier.stream.failures", &[("kind", failure.error_kind())], 1);
        self.shared.apply(SupervisorEvent::StreamFailed);
        warn!(error = %failure, kind = failure.error_kind(), "message stream failed");
        self.notify_failure(&failure);

        let (decision, count) = {
            let mut status = self.shared.status.lock();
            let decision = self.config.policy.on_failure(&mut status.restart, Instant::now());
            status.last_delay = Some(decision.delay());
            (decision, status.restart.restart_count)
        };
        self.shared.publish_restart_count(count);
        metrics.counter_inc("courier.restarts", &[], 1);

        let delay_ms = decision.delay().as_millis() as u64;
        match decision {
            RestartDecision::Retry { attempt, .. } => {
                info!(attempt, delay_ms, "restarting message stream after backoff");
            }
            RestartDecision::CircuitOpen { attempt, .. } => {
                self.shared.apply(SupervisorEvent::CircuitTripped);
                metrics.counter_inc("courier.circuit.opened", &[], 1);
                error!(attempt, delay_ms, "too many restarts, circuit open");
            }
        }

        tokio::select! {
            () = token.cancelled() => return false,
            () = tokio::time::sleep(decision.delay()) => {}
        }

        if decision.is_circuit_open() {
            self.shared.status.lock().restart.reset_after_cooldown();
            self.shared.publish_restart_count(0);
            info!("circuit cooldown elapsed, retrying");
        }
        self.shared.apply(SupervisorEvent::BackoffElapsed);
        true
    }

    fn notify_failure(&self, err: &SupervisorError) {
        let Some(callback) = &self.on_failure else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
            warn!("failure callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use courier_core::messages::ProcessedMessage;
    use courier_transport::MockTransport;

    use crate::dispatcher::{handler_fn, HandlerResult};

    #[tokio::test(start_paused = true)]
    async fn failure_after_shutdown_is_not_counted() {
        let transport = MockTransport::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let config = SupervisorConfig {
            transport: MockTransport::config(),
            ..SupervisorConfig::default()
        };
        let handler: Arc<dyn MessageHandler> =
            Arc::new(handler_fn(|_m: ProcessedMessage| async { HandlerResult::Ok(None) }));
        let supervisor = StreamSupervisor::new(config, handler).on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = supervisor.start(&transport).await.unwrap();

        // a failure racing with shutdown reaches the restart path late
        let runner = Runner {
            shared: Arc::clone(&supervisor.shared),
            connection: Arc::clone(&handle.connection),
            dispatcher: MessageDispatcher::new(
                Arc::clone(&handle.connection),
                supervisor.metrics(),
            ),
            cache: DeduplicationCache::new(8),
            handler: Arc::clone(&supervisor.handler),
            on_failure: supervisor.on_failure.clone(),
            config: supervisor.config.clone(),
        };
        handle.shutdown();
        let token = supervisor.shared.coordinator.token();

        assert!(!runner.restart_after(SupervisorError::StreamEnded, &token).await);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        let status = supervisor.status();
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.last_restart_delay_ms, None);
        assert_eq!(supervisor.metrics().counter_get("courier.restarts", &[]), 0);
    }
}
