//! Line-delimited JSON transport for local runs.
//!
//! Each input line is either a JSON object describing one inbound message or
//! bare text, which is treated as a text message from [`LOCAL_SENDER`] in
//! [`LOCAL_CONVERSATION`]. Replies are written as one JSON object per line.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use courier_core::errors::TransportError;
use courier_core::ids::{ConversationId, InboxId, MessageId};
use courier_core::messages::{ContentType, MessageContent, RawMessage};
use courier_core::security::SessionOptions;
use courier_core::transport::{MessageStream, Transport, TransportSession};

pub const LOCAL_IDENTITY: &str = "courier-local";
pub const LOCAL_SENDER: &str = "local-user";
pub const LOCAL_CONVERSATION: &str = "stdio";

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Deserialize)]
struct InboundLine {
    #[serde(default)]
    id: Option<MessageId>,
    #[serde(default = "default_sender")]
    sender_inbox_id: InboxId,
    #[serde(default = "default_conversation")]
    conversation_id: ConversationId,
    #[serde(default = "default_content_type")]
    content_type: ContentType,
    content: MessageContent,
    #[serde(default = "Utc::now")]
    sent_at: DateTime<Utc>,
}

fn default_sender() -> InboxId {
    InboxId::from(LOCAL_SENDER)
}

fn default_conversation() -> ConversationId {
    ConversationId::from(LOCAL_CONVERSATION)
}

fn default_content_type() -> ContentType {
    ContentType::Text
}

impl From<InboundLine> for RawMessage {
    fn from(line: InboundLine) -> Self {
        Self {
            id: line.id,
            sender_inbox_id: line.sender_inbox_id,
            conversation_id: line.conversation_id,
            content_type: line.content_type,
            content: line.content,
            sent_at: line.sent_at,
        }
    }
}

#[derive(Serialize)]
struct OutboundLine<'a> {
    conversation_id: &'a ConversationId,
    text: &'a str,
    sent_at: DateTime<Utc>,
}

/// Parse one input line. `Ok(None)` for blank lines.
fn parse_line(line: &str) -> Result<Option<RawMessage>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.starts_with('{') {
        return Ok(Some(RawMessage::text(
            None,
            LOCAL_SENDER,
            LOCAL_CONVERSATION,
            trimmed,
            Utc::now(),
        )));
    }
    serde_json::from_str::<InboundLine>(trimmed).map(|l| Some(l.into()))
}

/// Transport over an arbitrary reader/writer pair, stdin/stdout by default.
pub struct StdioTransport {
    session: Arc<StdioSession>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Writer = Box::new(writer);
        Self {
            session: Arc::new(StdioSession {
                inbox_id: InboxId::from(LOCAL_IDENTITY),
                lines: Arc::new(Mutex::new(Some(BufReader::new(reader).lines()))),
                writer: Mutex::new(writer),
            }),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn open_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        debug!(env = %options.env, "opening stdio session");
        let session: Arc<dyn TransportSession> = self.session.clone();
        Ok(session)
    }
}

/// Session over the shared line reader. Successive streams continue where
/// the previous one stopped; after end of input no stream can be opened.
struct StdioSession {
    inbox_id: InboxId,
    lines: Arc<Mutex<Option<LineReader>>>,
    writer: Mutex<Writer>,
}

async fn next_item(
    lines: &Mutex<Option<LineReader>>,
) -> Option<Result<RawMessage, TransportError>> {
    let mut guard = lines.lock().await;
    let reader = guard.as_mut()?;
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some(msg)) => return Some(Ok(msg)),
                Ok(None) => continue,
                Err(e) => warn!(error = %e, "skipping malformed input line"),
            },
            Ok(None) => {
                debug!("end of input");
                *guard = None;
                return None;
            }
            Err(e) => return Some(Err(TransportError::Stream(e.to_string()))),
        }
    }
}

#[async_trait]
impl TransportSession for StdioSession {
    fn inbox_id(&self) -> &InboxId {
        &self.inbox_id
    }

    fn address(&self) -> &str {
        self.inbox_id.as_str()
    }

    async fn stream_messages(&self) -> Result<MessageStream, TransportError> {
        if self.lines.lock().await.is_none() {
            return Err(TransportError::Closed);
        }
        let lines = Arc::clone(&self.lines);
        Ok(Box::pin(stream::unfold(lines, |lines| async move {
            let item = next_item(&lines).await;
            item.map(|item| (item, lines))
        })))
    }

    async fn resolve_address(&self, inbox_id: &InboxId) -> Result<String, TransportError> {
        Ok(inbox_id.to_string())
    }

    async fn send_reply(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(), TransportError> {
        let delivery_err = |e: std::io::Error| TransportError::Delivery {
            conversation: conversation_id.clone(),
            reason: e.to_string(),
        };
        let mut line = serde_json::to_string(&OutboundLine {
            conversation_id,
            text,
            sent_at: Utc::now(),
        })
        .map_err(|e| TransportError::Delivery {
            conversation: conversation_id.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.map_err(delivery_err)?;
        writer.flush().await.map_err(delivery_err)
    }

    async fn resync(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
