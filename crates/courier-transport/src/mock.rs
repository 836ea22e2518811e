use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;

use courier_core::errors::TransportError;
use courier_core::ids::{ConversationId, InboxId};
use courier_core::messages::RawMessage;
use courier_core::security::{SessionOptions, TransportConfig, TransportEnv};
use courier_core::transport::{MessageStream, Transport, TransportSession};

/// One scripted step of a mock message stream.
#[derive(Clone, Debug)]
pub enum StreamStep {
    /// Yield a message.
    Message(RawMessage),
    /// Yield an error item; the stream keeps going afterwards.
    Error(TransportError),
    /// Sleep before the next step. Yields nothing.
    Delay(Duration),
}

/// Pre-programmed response to one `stream_messages()` call.
#[derive(Clone, Debug)]
pub enum MockStream {
    /// Play the steps, then end the stream.
    Finite(Vec<StreamStep>),
    /// Play the steps, then stay open without yielding.
    Open(Vec<StreamStep>),
    /// Fail the `stream_messages()` call itself.
    Fail(TransportError),
}

impl MockStream {
    /// Convenience: messages followed by stream end.
    pub fn messages(messages: Vec<RawMessage>) -> Self {
        Self::Finite(messages.into_iter().map(StreamStep::Message).collect())
    }

    /// Convenience: messages, then the stream stays open.
    pub fn messages_then_idle(messages: Vec<RawMessage>) -> Self {
        Self::Open(messages.into_iter().map(StreamStep::Message).collect())
    }

    /// Convenience: messages followed by a (non-transient) error item.
    pub fn messages_then_error(messages: Vec<RawMessage>, error: TransportError) -> Self {
        let mut steps: Vec<StreamStep> = messages.into_iter().map(StreamStep::Message).collect();
        steps.push(StreamStep::Error(error));
        Self::Finite(steps)
    }

    fn into_stream(self) -> Result<MessageStream, TransportError> {
        match self {
            Self::Fail(e) => Err(e),
            Self::Finite(steps) => Ok(Box::pin(play(steps))),
            Self::Open(steps) => Ok(Box::pin(play(steps).chain(stream::pending()))),
        }
    }
}

fn play(
    steps: Vec<StreamStep>,
) -> impl futures::Stream<Item = Result<RawMessage, TransportError>> + Send {
    stream::unfold(steps.into_iter(), |mut steps| async move {
        loop {
            match steps.next()? {
                StreamStep::Delay(d) => tokio::time::sleep(d).await,
                StreamStep::Message(m) => return Some((Ok(m), steps)),
                StreamStep::Error(e) => return Some((Err(e), steps)),
            }
        }
    })
}

/// Scripted session. Streams are handed out in order; once the script is
/// exhausted every further stream stays open and silent.
pub struct MockSession {
    inbox_id: InboxId,
    address: String,
    streams: Mutex<VecDeque<MockStream>>,
    stream_calls: AtomicUsize,
    addresses: Mutex<HashMap<InboxId, String>>,
    failing_lookups: Mutex<HashSet<InboxId>>,
    lookup_calls: AtomicUsize,
    replies: Mutex<Vec<(ConversationId, String)>>,
    fail_replies: AtomicBool,
    resync_calls: AtomicUsize,
    fail_resync: AtomicBool,
}

impl MockSession {
    fn new(inbox_id: &str, address: &str) -> Self {
        Self {
            inbox_id: InboxId::from(inbox_id),
            address: address.to_string(),
            streams: Mutex::new(VecDeque::new()),
            stream_calls: AtomicUsize::new(0),
            addresses: Mutex::new(HashMap::new()),
            failing_lookups: Mutex::new(HashSet::new()),
            lookup_calls: AtomicUsize::new(0),
            replies: Mutex::new(Vec::new()),
            fail_replies: AtomicBool::new(false),
            resync_calls: AtomicUsize::new(0),
            fail_resync: AtomicBool::new(false),
        }
    }

    pub fn push_stream(&self, stream: MockStream) {
        self.streams.lock().push_back(stream);
    }

    pub fn set_address(&self, inbox_id: &str, address: &str) {
        self.addresses
            .lock()
            .insert(InboxId::from(inbox_id), address.to_string());
    }

    /// Make `resolve_address` fail for this sender.
    pub fn fail_lookup_for(&self, inbox_id: &str) {
        self.failing_lookups.lock().insert(InboxId::from(inbox_id));
    }

    pub fn set_fail_replies(&self, fail: bool) {
        self.fail_replies.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_resync(&self, fail: bool) {
        self.fail_resync.store(fail, Ordering::Relaxed);
    }

    /// Replies delivered so far, in order.
    pub fn sent_replies(&self) -> Vec<(ConversationId, String)> {
        self.replies.lock().clone()
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::Relaxed)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::Relaxed)
    }

    pub fn resync_calls(&self) -> usize {
        self.resync_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    fn inbox_id(&self) -> &InboxId {
        &self.inbox_id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn stream_messages(&self) -> Result<MessageStream, TransportError> {
        self.stream_calls.fetch_add(1, Ordering::Relaxed);
        let next = self.streams.lock().pop_front();
        match next {
            Some(script) => script.into_stream(),
            None => Ok(Box::pin(stream::pending())),
        }
    }

    async fn resolve_address(&self, inbox_id: &InboxId) -> Result<String, TransportError> {
        self.lookup_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing_lookups.lock().contains(inbox_id) {
            return Err(TransportError::Lookup {
                sender: inbox_id.clone(),
                reason: "no address registered".into(),
            });
        }
        Ok(self
            .addresses
            .lock()
            .get(inbox_id)
            .cloned()
            .unwrap_or_else(|| format!("addr:{inbox_id}")))
    }

    async fn send_reply(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(), TransportError> {
        if self.fail_replies.load(Ordering::Relaxed) {
            return Err(TransportError::Delivery {
                conversation: conversation_id.clone(),
                reason: "mock delivery failure".into(),
            });
        }
        self.replies
            .lock()
            .push((conversation_id.clone(), text.to_string()));
        Ok(())
    }

    async fn resync(&self) -> Result<(), TransportError> {
        self.resync_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_resync.load(Ordering::Relaxed) {
            return Err(TransportError::Unavailable("mock resync failure".into()));
        }
        Ok(())
    }
}

/// Mock transport handing out a single shared [`MockSession`].
pub struct MockTransport {
    session: Arc<MockSession>,
    reject_with: Mutex<Option<TransportError>>,
    open_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_identity("inbox-self", "addr:inbox-self")
    }

    pub fn with_identity(inbox_id: &str, address: &str) -> Self {
        Self {
            session: Arc::new(MockSession::new(inbox_id, address)),
            reject_with: Mutex::new(None),
            open_calls: AtomicUsize::new(0),
        }
    }

    /// Builder: queue stream scripts in order.
    pub fn with_streams(self, streams: Vec<MockStream>) -> Self {
        for s in streams {
            self.session.push_stream(s);
        }
        self
    }

    /// Make every `open_session()` call fail with `error`.
    pub fn reject_sessions(&self, error: TransportError) {
        *self.reject_with.lock() = Some(error);
    }

    pub fn session(&self) -> Arc<MockSession> {
        Arc::clone(&self.session)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::Relaxed)
    }

    /// A transport config that passes validation.
    pub fn config() -> TransportConfig {
        TransportConfig {
            identity_key: Some(SecretString::from("mock-identity-key")),
            encryption_key: Some(SecretString::from("mock-encryption-key")),
            env: Some(TransportEnv::Local),
            storage_path: None,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_session(
        &self,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.open_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.reject_with.lock().clone() {
            return Err(e);
        }
        let session: Arc<dyn TransportSession> = self.session.clone();
        Ok(session)
    }
}
