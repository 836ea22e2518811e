use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use courier_core::errors::{SupervisorError, TransportError};
use courier_core::ids::{ConversationId, InboxId};
use courier_core::security::TransportConfig;
use courier_core::transport::{MessageStream, Transport, TransportSession};

/// Owns the session with the transport for the lifetime of a supervisor.
///
/// The session is opened exactly once; a dead stream is replaced through
/// [`ConnectionManager::open_stream`], never by reopening the session.
pub struct ConnectionManager {
    session: Arc<dyn TransportSession>,
    transport: String,
    running: AtomicBool,
}

impl ConnectionManager {
    /// Validate `config`, open a session and run the initial resync.
    ///
    /// Missing credentials yield [`SupervisorError::Configuration`]; a session
    /// the transport refuses yields [`SupervisorError::Connection`]. A failing
    /// initial resync is only logged.
    #[instrument(skip_all, fields(transport = transport.name()))]
    pub async fn initialize(
        transport: &dyn Transport,
        config: &TransportConfig,
    ) -> Result<Self, SupervisorError> {
        let options = config.validate()?;

        let session = transport
            .open_session(&options)
            .await
            .map_err(SupervisorError::Connection)?;

        info!(
            inbox_id = %session.inbox_id(),
            address = session.address(),
            env = %options.env,
            "transport session opened"
        );

        if let Err(e) = session.resync().await {
            warn!(error = %e, kind = e.error_kind(), "initial resync failed, continuing");
        }

        Ok(Self {
            session,
            transport: transport.name().to_string(),
            running: AtomicBool::new(true),
        })
    }

    pub fn identity(&self) -> &InboxId {
        self.session.inbox_id()
    }

    pub fn address(&self) -> &str {
        self.session.address()
    }

    pub fn transport_name(&self) -> &str {
        &self.transport
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_stopped(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(inbox_id = %self.identity(), "session marked stopped");
        }
    }

    /// Open a fresh message stream.
    pub async fn open_stream(&self) -> Result<MessageStream, SupervisorError> {
        self.session
            .stream_messages()
            .await
            .map_err(SupervisorError::StreamFailure)
    }

    pub async fn resolve_address(&self, sender: &InboxId) -> Result<String, SupervisorError> {
        self.session
            .resolve_address(sender)
            .await
            .map_err(SupervisorError::Lookup)
    }

    pub async fn send_reply(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(), SupervisorError> {
        self.session
            .send_reply(conversation_id, text)
            .await
            .map_err(SupervisorError::Delivery)
    }

    /// Refresh the local conversation view. Idempotent.
    pub async fn resync(&self) -> Result<(), TransportError> {
        self.session.resync().await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.transport)
            .field("inbox_id", self.identity())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStream, MockTransport};

    #[tokio::test]
    async fn initialize_opens_session_and_resyncs() {
        let transport = MockTransport::with_identity("inbox-bot", "0xB07");
        let conn = ConnectionManager::initialize(&transport, &MockTransport::config())
            .await
            .unwrap();

        assert_eq!(conn.identity().as_str(), "inbox-bot");
        assert_eq!(conn.address(), "0xB07");
        assert_eq!(conn.transport_name(), "mock");
        assert!(conn.is_running());
        assert_eq!(transport.session().resync_calls(), 1);
    }

    #[tokio::test]
    async fn missing_credentials_are_configuration_errors() {
        let transport = MockTransport::new();
        let config = TransportConfig {
            encryption_key: None,
            ..MockTransport::config()
        };
        let err = ConnectionManager::initialize(&transport, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
        assert_eq!(transport.open_calls(), 0);
    }

    #[tokio::test]
    async fn rejected_session_is_a_connection_error() {
        let transport = MockTransport::new();
        transport.reject_sessions(TransportError::Rejected("revoked installation".into()));
        let err = ConnectionManager::initialize(&transport, &MockTransport::config())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Connection(_)));
        assert_eq!(transport.open_calls(), 1);
    }

    #[tokio::test]
    async fn failing_initial_resync_is_ignored() {
        let transport = MockTransport::new();
        transport.session().set_fail_resync(true);
        let conn = ConnectionManager::initialize(&transport, &MockTransport::config()).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn errors_are_mapped_to_supervisor_taxonomy() {
        let transport = MockTransport::new().with_streams(vec![MockStream::Fail(
            TransportError::Unavailable("node offline".into()),
        )]);
        let session = transport.session();
        session.fail_lookup_for("ghost");
        session.set_fail_replies(true);
        let conn = ConnectionManager::initialize(&transport, &MockTransport::config())
            .await
            .unwrap();

        assert!(matches!(
            conn.open_stream().await,
            Err(SupervisorError::StreamFailure(_))
        ));
        assert!(matches!(
            conn.resolve_address(&InboxId::from("ghost")).await,
            Err(SupervisorError::Lookup(_))
        ));
        assert!(matches!(
            conn.send_reply(&ConversationId::from("c"), "hi").await,
            Err(SupervisorError::Delivery(_))
        ));
    }

    #[tokio::test]
    async fn mark_stopped_is_idempotent() {
        let transport = MockTransport::new();
        let conn = ConnectionManager::initialize(&transport, &MockTransport::config())
            .await
            .unwrap();
        conn.mark_stopped();
        conn.mark_stopped();
        assert!(!conn.is_running());
    }
}
