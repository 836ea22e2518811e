use crate::ids::{ConversationId, InboxId};

/// Error substrings the transport is known to emit for hiccups that clear up
/// on the next message (key-store contention, decryption of a message from a
/// rotated installation, welcomes for groups not yet synced).
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "sqlkeystore",
    "storage error",
    "database is locked",
    "decryption failed",
    "failed to decrypt",
    "group with welcome id",
    "welcome not found",
];

/// Errors raised by the transport collaborator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session rejected: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("address lookup failed for {sender}: {reason}")]
    Lookup { sender: InboxId, reason: String },
    #[error("delivery to {conversation} failed: {reason}")]
    Delivery {
        conversation: ConversationId,
        reason: String,
    },
    #[error("session closed")]
    Closed,
}

impl TransportError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Unavailable(_) => "unavailable",
            Self::Stream(_) => "stream",
            Self::Lookup { .. } => "lookup",
            Self::Delivery { .. } => "delivery",
            Self::Closed => "closed",
        }
    }

    /// Case-insensitive substring match of the rendered error against `patterns`.
    pub fn matches_any<S: AsRef<str>>(&self, patterns: &[S]) -> bool {
        let rendered = self.to_string().to_lowercase();
        patterns
            .iter()
            .map(|p| p.as_ref().to_lowercase())
            .any(|p| !p.is_empty() && rendered.contains(&p))
    }
}

/// Error taxonomy of the supervisor and its collaborators.
///
/// Only `Configuration` and `Connection` ever reach the caller of `start`;
/// everything else is recovered locally and surfaces through logs and the
/// failure callback.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to open session: {0}")]
    Connection(#[source] TransportError),
    #[error("stream failure: {0}")]
    StreamFailure(#[source] TransportError),
    #[error("stream ended unexpectedly")]
    StreamEnded,
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("transient transport error: {0}")]
    Transient(#[source] TransportError),
    #[error("address lookup failed: {0}")]
    Lookup(#[source] TransportError),
    #[error("reply delivery failed: {0}")]
    Delivery(#[source] TransportError),
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("supervisor has been shut down")]
    ShutDown,
}

impl SupervisorError {
    /// Errors that must not be retried by anyone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::AlreadyStarted | Self::ShutDown
        )
    }

    /// Errors that trigger the restart path.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, Self::StreamFailure(_) | Self::StreamEnded)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::StreamFailure(_) => "stream_failure",
            Self::StreamEnded => "stream_ended",
            Self::Handler(_) => "handler",
            Self::Transient(_) => "transient",
            Self::Lookup(_) => "lookup",
            Self::Delivery(_) => "delivery",
            Self::AlreadyStarted => "already_started",
            Self::ShutDown => "shut_down",
        }
    }
}
