pub mod telegram;

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A channel or group visible to the authorized account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Channel,
    Group,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ChannelKind::Channel => "channel",
            ChannelKind::Group => "group",
        })
    }
}

/// A resolved, addressable endpoint. Resolution happens once per relay run;
/// the session manager keeps the platform handle behind the id so a ref is
/// never re-resolved mid-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: i64,
    pub title: String,
}

/// Immutable snapshot of a source message at event time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: i32,
    pub text: String,
    pub media: Option<MediaKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Document {
        mime: Option<String>,
        file_name: Option<String>,
    },
    /// Link preview attached to a text message; nothing to download.
    WebPagePreview,
}

/// Opaque token correlating a sent verification code with its later check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginChallenge(pub(crate) u64);

#[derive(Debug)]
pub enum LoginOutcome {
    /// The session was already authorized; no code was issued.
    AlreadyAuthorized,
    /// A verification code was sent; pass the challenge back to `verify_code`.
    CodeSent(LoginChallenge),
}

/// How a user-supplied channel identifier is looked up: a leading `@` forces
/// a handle lookup; otherwise a numeric id is tried first and anything that
/// fails to parse falls back to a handle lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityQuery {
    Id(i64),
    Handle(String),
}

impl EntityQuery {
    pub fn parse(identifier: &str) -> Self {
        if let Some(handle) = identifier.strip_prefix('@') {
            return EntityQuery::Handle(handle.to_string());
        }
        match identifier.parse::<i64>() {
            Ok(id) => EntityQuery::Id(id),
            Err(_) => EntityQuery::Handle(identifier.to_string()),
        }
    }
}

/// Live feed of new messages from one source channel.
///
/// Holds the receiving end of the event stream and, for real sessions, the
/// pump task feeding it. `close` (or drop) unsubscribes by aborting the pump.
pub struct Subscription {
    rx: mpsc::Receiver<InboundMessage>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx, pump: None }
    }

    pub fn with_pump(rx: mpsc::Receiver<InboundMessage>, pump: JoinHandle<()>) -> Self {
        Self {
            rx,
            pump: Some(pump),
        }
    }

    /// Next inbound message; `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// The session-manager operations the relay engine consumes.
///
/// The manager never retries network failures on its own: retry policy
/// differs between login (never silently) and forwarding (bounded, with
/// backoff), so it belongs to the caller.
#[async_trait]
pub trait MessagingSession: Send + Sync {
    /// Ensure an open transport connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Request a verification code for `phone`. Short-circuits without
    /// issuing a new challenge when the session is already authorized.
    async fn start_login(&self, phone: &str) -> Result<LoginOutcome>;

    /// Complete authentication with the code the platform sent.
    async fn verify_code(&self, code: &str, challenge: &LoginChallenge) -> Result<()>;

    /// Non-blocking authorization query; reconnects transparently and
    /// reports `false` on any failure rather than propagating.
    async fn is_authorized(&self) -> bool;

    /// All channel/group dialogs visible to the account; empty when not
    /// authorized (not an error).
    async fn list_channels(&self) -> Vec<ChannelInfo>;

    /// Resolve a numeric id, `@handle`, or bare username to a channel ref.
    async fn resolve_entity(&self, identifier: &str) -> Result<ChannelRef>;

    /// Deliver text and/or a local media file as one message.
    async fn send_message(&self, entity: &ChannelRef, text: &str, media: Option<&Path>)
        -> Result<()>;

    /// Download the media of message `message_id` in `entity` to `dest`.
    async fn download_media(&self, entity: &ChannelRef, message_id: i32, dest: &Path)
        -> Result<()>;

    /// Up to `limit` most recent messages, newest first.
    async fn recent_messages(&self, entity: &ChannelRef, limit: usize)
        -> Result<Vec<InboundMessage>>;

    /// Subscribe to new messages posted to `entity`.
    async fn subscribe(&self, entity: &ChannelRef) -> Result<Subscription>;

    /// Persist session state and drop the connection.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_prefix_forces_handle_lookup() {
        assert_eq!(
            EntityQuery::parse("@foo"),
            EntityQuery::Handle("foo".to_string())
        );
        // Even an all-numeric handle is never parsed as an id.
        assert_eq!(
            EntityQuery::parse("@123"),
            EntityQuery::Handle("123".to_string())
        );
    }

    #[test]
    fn test_numeric_identifier_parses_as_id() {
        assert_eq!(EntityQuery::parse("123"), EntityQuery::Id(123));
        assert_eq!(
            EntityQuery::parse("-1001234567890"),
            EntityQuery::Id(-1001234567890)
        );
    }

    #[test]
    fn test_non_numeric_falls_back_to_handle() {
        assert_eq!(
            EntityQuery::parse("newsroom"),
            EntityQuery::Handle("newsroom".to_string())
        );
        assert_eq!(
            EntityQuery::parse("123abc"),
            EntityQuery::Handle("123abc".to_string())
        );
    }
}
