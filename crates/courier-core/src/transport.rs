use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::TransportError;
use crate::ids::{ConversationId, InboxId};
use crate::messages::RawMessage;
use crate::security::SessionOptions;

/// Unbounded sequence of inbound messages. Once it ends it cannot be resumed;
/// open a new one with [`TransportSession::stream_messages`].
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<RawMessage, TransportError>> + Send>>;

/// Entry point of a messaging transport: turns credentials into a session.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn open_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// An open, authenticated connection to the transport.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Stable identity of this subscriber.
    fn inbox_id(&self) -> &InboxId;

    /// Human-readable address of this subscriber.
    fn address(&self) -> &str;

    async fn stream_messages(&self) -> Result<MessageStream, TransportError>;

    async fn resolve_address(&self, inbox_id: &InboxId) -> Result<String, TransportError>;

    async fn send_reply(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Refresh the local view of conversations. Safe to call repeatedly.
    async fn resync(&self) -> Result<(), TransportError>;
}
