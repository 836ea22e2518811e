use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use courier_core::errors::SupervisorError;
use courier_core::ids::InboxId;
use courier_core::messages::{ProcessedMessage, RawMessage};
use courier_telemetry::MetricsRecorder;
use courier_transport::ConnectionManager;

/// What a handler returns: an optional reply for the originating conversation.
pub type HandlerResult = anyhow::Result<Option<String>>;

/// Business logic invoked once per accepted message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ProcessedMessage) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives its own copy of the message.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ProcessedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ProcessedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: &ProcessedMessage) -> HandlerResult {
        (self.0)(message.clone()).await
    }
}

/// Why a message never reached the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkipReason {
    SelfAuthored,
    NonText,
    EmptyContent,
    Duplicate,
    ShuttingDown,
    LookupFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfAuthored => "self_authored",
            Self::NonText => "non_text",
            Self::EmptyContent => "empty_content",
            Self::Duplicate => "duplicate",
            Self::ShuttingDown => "shutting_down",
            Self::LookupFailed => "lookup_failed",
        }
    }
}

/// Result of one [`MessageDispatcher::dispatch`] call. Never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and had nothing to say.
    NoReply,
    Replied,
    HandlerFailed,
    /// Handler produced a reply that could not be delivered.
    DeliveryFailed,
}

/// Content filters applied before anything touches the network.
pub fn filter_message(raw: &RawMessage, self_id: &InboxId) -> Option<SkipReason> {
    if raw
        .sender_inbox_id
        .as_str()
        .eq_ignore_ascii_case(self_id.as_str())
    {
        return Some(SkipReason::SelfAuthored);
    }
    if !raw.content_type.is_text() {
        return Some(SkipReason::NonText);
    }
    match raw.content.as_text() {
        Some(text) if !text.trim().is_empty() => None,
        Some(_) => Some(SkipReason::EmptyContent),
        None => Some(SkipReason::NonText),
    }
}

/// Filters, normalizes and dispatches messages for one session.
pub struct MessageDispatcher {
    connection: Arc<ConnectionManager>,
    metrics: Arc<MetricsRecorder>,
}

impl MessageDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            connection,
            metrics,
        }
    }

    pub fn filter(&self, raw: &RawMessage) -> Option<SkipReason> {
        filter_message(raw, self.connection.identity())
    }

    /// `Ok(None)` for filtered messages; otherwise resolve the sender's
    /// address and build the [`ProcessedMessage`].
    pub async fn normalize(
        &self,
        raw: &RawMessage,
    ) -> Result<Option<ProcessedMessage>, SupervisorError> {
        if let Some(reason) = self.filter(raw) {
            debug!(reason = reason.as_str(), "message filtered");
            return Ok(None);
        }
        let Some(content) = raw.content.as_text() else {
            return Ok(None);
        };

        let sender_address = self.connection.resolve_address(&raw.sender_inbox_id).await?;

        Ok(Some(ProcessedMessage {
            content: content.to_string(),
            sender_inbox_id: raw.sender_inbox_id.clone(),
            sender_address,
            conversation_id: raw.conversation_id.clone(),
            message_id: raw.id.clone(),
            sent_at: raw.sent_at,
        }))
    }

    /// Run `handler` and deliver its reply. Handler errors, handler panics
    /// and delivery failures are logged and reported in the outcome.
    pub async fn dispatch(
        &self,
        message: &ProcessedMessage,
        handler: &dyn MessageHandler,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .histogram_observe("courier.handler.duration_ms", &[], elapsed_ms);

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                let err = SupervisorError::Handler(format!("{e:#}"));
                warn!(
                    conversation_id = %message.conversation_id,
                    error = %err,
                    "handler returned an error"
                );
                self.metrics
                    .counter_inc("courier.handler.errors", &[("kind", "error")], 1);
                return DispatchOutcome::HandlerFailed;
            }
            Err(panic) => {
                error!(
                    conversation_id = %message.conversation_id,
                    panic = %panic_message(panic.as_ref()),
                    "handler panicked"
                );
                self.metrics
                    .counter_inc("courier.handler.errors", &[("kind", "panic")], 1);
                return DispatchOutcome::HandlerFailed;
            }
        };
        self.metrics.counter_inc("courier.messages.processed", &[], 1);

        let Some(reply) = reply.filter(|r| !r.trim().is_empty()) else {
            return DispatchOutcome::NoReply;
        };

        match self
            .connection
            .send_reply(&message.conversation_id, &reply)
            .await
        {
            Ok(()) => {
                debug!(conversation_id = %message.conversation_id, "reply sent");
                self.metrics.counter_inc("courier.replies.sent", &[], 1);
                DispatchOutcome::Replied
            }
            Err(e) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    error = %e,
                    "failed to deliver reply"
                );
                self.metrics.counter_inc("courier.replies.failed", &[], 1);
                DispatchOutcome::DeliveryFailed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
