use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use grammers_client::session::Session;
use grammers_client::types::{Chat, Media, Message};
use grammers_client::{
    Client, Config as ClientConfig, InitParams, InputMessage, SignInError, Update,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::session::{
    ChannelInfo, ChannelKind, ChannelRef, EntityQuery, InboundMessage, LoginChallenge,
    LoginOutcome, MediaKind, MessagingSession, Subscription,
};

/// Capacity of the inbound event queue. Events are consumed one at a time by
/// the relay loop; the buffer only absorbs short bursts from the source.
const EVENT_QUEUE_CAPACITY: usize = 64;

struct PendingLogin {
    challenge: u64,
    token: grammers_client::types::LoginToken,
}

/// Owns the authenticated MTProto connection: login, entity resolution, and
/// the wire operations (send, download) the relay engine needs.
///
/// The client is created lazily on first use and shared by cheap clone; the
/// session state is persisted to `session_file` so a login survives restarts.
pub struct SessionManager {
    api_id: i32,
    api_hash: String,
    session_file: PathBuf,
    client: Mutex<Option<Client>>,
    pending_login: Mutex<Option<PendingLogin>>,
    // Resolved entities, keyed by id. A ref handed out once stays addressable
    // for the rest of the process without another lookup.
    entities: StdMutex<HashMap<i64, Chat>>,
    challenge_seq: AtomicU64,
}

impl SessionManager {
    pub fn new(api_id: i32, api_hash: String, session_file: PathBuf) -> Self {
        Self {
            api_id,
            api_hash,
            session_file,
            client: Mutex::new(None),
            pending_login: Mutex::new(None),
            entities: StdMutex::new(HashMap::new()),
            challenge_seq: AtomicU64::new(0),
        }
    }

    /// Connected client handle, creating and connecting it on first use.
    async fn connected(&self) -> Result<Client> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        if let Some(dir) = self.session_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let session = Session::load_file_or_create(&self.session_file)?;
        let client = Client::connect(ClientConfig {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| RelayError::Connection(e.to_string()))?;
        info!("connected to Telegram");

        *guard = Some(client.clone());
        Ok(client)
    }

    fn remember(&self, chat: Chat) -> ChannelRef {
        let reference = ChannelRef {
            id: chat.id(),
            title: chat.name().to_string(),
        };
        self.entities.lock().unwrap().insert(chat.id(), chat);
        reference
    }

    fn cached(&self, id: i64) -> Option<ChannelRef> {
        self.entities.lock().unwrap().get(&id).map(|chat| ChannelRef {
            id: chat.id(),
            title: chat.name().to_string(),
        })
    }

    fn chat_for(&self, entity: &ChannelRef) -> Result<Chat> {
        self.entities
            .lock()
            .unwrap()
            .get(&entity.id)
            .cloned()
            .ok_or_else(|| RelayError::EntityNotFound(entity.id.to_string()))
    }

    async fn fetch_message(&self, chat: &Chat, message_id: i32) -> Result<Message> {
        let client = self.connected().await?;
        let messages = client
            .get_messages_by_id(chat, &[message_id])
            .await
            .map_err(|e| RelayError::Download {
                message_id,
                reason: e.to_string(),
            })?;
        messages
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| RelayError::Download {
                message_id,
                reason: "message no longer exists".to_string(),
            })
    }
}

#[async_trait]
impl MessagingSession for SessionManager {
    async fn connect(&self) -> Result<()> {
        self.connected().await.map(|_| ())
    }

    async fn start_login(&self, phone: &str) -> Result<LoginOutcome> {
        let client = self.connected().await?;
        if client
            .is_authorized()
            .await
            .map_err(|e| RelayError::Auth(e.to_string()))?
        {
            return Ok(LoginOutcome::AlreadyAuthorized);
        }

        match client.request_login_code(phone).await {
            Ok(token) => {
                let challenge = LoginChallenge(self.challenge_seq.fetch_add(1, Ordering::SeqCst) + 1);
                *self.pending_login.lock().await = Some(PendingLogin {
                    challenge: challenge.0,
                    token,
                });
                info!("verification code requested");
                Ok(LoginOutcome::CodeSent(challenge))
            }
            Err(e) => {
                let reason = e.to_string();
                if reason.contains("PHONE_NUMBER_INVALID") {
                    Err(RelayError::InvalidPhoneNumber)
                } else {
                    Err(RelayError::Auth(reason))
                }
            }
        }
    }

    async fn verify_code(&self, code: &str, challenge: &LoginChallenge) -> Result<()> {
        let client = self.connected().await?;
        let mut pending = self.pending_login.lock().await;
        let login = pending
            .as_ref()
            .filter(|p| p.challenge == challenge.0)
            .ok_or_else(|| RelayError::Auth("no pending login for this challenge".to_string()))?;

        match client.sign_in(&login.token, code).await {
            Ok(_) => {
                *pending = None;
                if let Err(e) = client.session().save_to_file(&self.session_file) {
                    warn!(error = %e, "failed to save session file");
                }
                info!("login successful");
                Ok(())
            }
            // Keep the challenge pending so the code can be re-entered.
            Err(SignInError::InvalidCode) => Err(RelayError::InvalidCode),
            Err(SignInError::PasswordRequired(_)) => {
                *pending = None;
                Err(RelayError::TwoFactorRequired)
            }
            Err(e) => Err(RelayError::Auth(e.to_string())),
        }
    }

    async fn is_authorized(&self) -> bool {
        match self.connected().await {
            Ok(client) => client.is_authorized().await.unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "authorization query failed");
                false
            }
        }
    }

    async fn list_channels(&self) -> Vec<ChannelInfo> {
        let client = match self.connected().await {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "cannot list channels while disconnected");
                return Vec::new();
            }
        };
        if !client.is_authorized().await.unwrap_or(false) {
            return Vec::new();
        }

        let mut channels = Vec::new();
        let mut dialogs = client.iter_dialogs();
        loop {
            match dialogs.next().await {
                Ok(Some(dialog)) => {
                    let chat = dialog.chat();
                    let kind = match chat {
                        Chat::Channel(_) => ChannelKind::Channel,
                        Chat::Group(_) => ChannelKind::Group,
                        // Direct user dialogs are not relay endpoints.
                        _ => continue,
                    };
                    channels.push(ChannelInfo {
                        id: chat.id(),
                        title: chat.name().to_string(),
                        username: chat.username().map(|u| u.to_string()),
                        kind,
                    });
                    self.remember(chat.clone());
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to enumerate dialogs");
                    break;
                }
            }
        }
        channels
    }

    async fn resolve_entity(&self, identifier: &str) -> Result<ChannelRef> {
        let client = self.connected().await?;
        match EntityQuery::parse(identifier) {
            EntityQuery::Handle(handle) => match client.resolve_username(&handle).await {
                Ok(Some(chat)) => Ok(self.remember(chat)),
                Ok(None) => Err(RelayError::EntityNotFound(identifier.to_string())),
                Err(e) => {
                    warn!(identifier, error = %e, "username lookup failed");
                    Err(RelayError::EntityNotFound(identifier.to_string()))
                }
            },
            EntityQuery::Id(id) => {
                if let Some(reference) = self.cached(id) {
                    return Ok(reference);
                }
                // No direct by-id lookup on the wire; the id must belong to a
                // dialog of this account.
                let mut dialogs = client.iter_dialogs();
                loop {
                    match dialogs.next().await {
                        Ok(Some(dialog)) => {
                            let chat = dialog.chat();
                            if chat.id() == id {
                                return Ok(self.remember(chat.clone()));
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(identifier, error = %e, "dialog scan failed");
                            break;
                        }
                    }
                }
                Err(RelayError::EntityNotFound(identifier.to_string()))
            }
        }
    }

    async fn send_message(
        &self,
        entity: &ChannelRef,
        text: &str,
        media: Option<&Path>,
    ) -> Result<()> {
        let client = self.connected().await?;
        let chat = self.chat_for(entity)?;

        let message = match media {
            Some(path) => {
                let uploaded = client
                    .upload_file(path)
                    .await
                    .map_err(|e| RelayError::Delivery(e.to_string()))?;
                if sends_as_photo(path) {
                    InputMessage::text(text).photo(uploaded)
                } else {
                    InputMessage::text(text).file(uploaded)
                }
            }
            None => InputMessage::text(text),
        };

        client
            .send_message(&chat, message)
            .await
            .map_err(|e| RelayError::Delivery(e.to_string()))?;
        Ok(())
    }

    async fn download_media(
        &self,
        entity: &ChannelRef,
        message_id: i32,
        dest: &Path,
    ) -> Result<()> {
        let client = self.connected().await?;
        let chat = self.chat_for(entity).map_err(|e| RelayError::Download {
            message_id,
            reason: e.to_string(),
        })?;
        let message = self.fetch_message(&chat, message_id).await?;
        let media = message.media().ok_or_else(|| RelayError::Download {
            message_id,
            reason: "message has no media".to_string(),
        })?;
        client
            .download_media(&media, dest)
            .await
            .map_err(|e| RelayError::Download {
                message_id,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        entity: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<InboundMessage>> {
        let client = self.connected().await?;
        let chat = self.chat_for(entity)?;
        let mut iter = client.iter_messages(&chat).limit(limit);
        let mut messages = Vec::new();
        while let Some(message) = iter
            .next()
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?
        {
            messages.push(inbound_from(&message));
        }
        // Newest first, as the platform pages them.
        Ok(messages)
    }

    async fn subscribe(&self, entity: &ChannelRef) -> Result<Subscription> {
        let client = self.connected().await?;
        let source_id = entity.id;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let pump = tokio::spawn(async move {
            loop {
                match client.next_update().await {
                    Ok(Update::NewMessage(message)) => {
                        if message.outgoing() || message.chat().id() != source_id {
                            continue;
                        }
                        debug!(message_id = message.id(), "new message on source channel");
                        if tx.send(inbound_from(&message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "update stream error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(Subscription::with_pump(rx, pump))
    }

    async fn disconnect(&self) {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            if let Err(e) = client.session().save_to_file(&self.session_file) {
                warn!(error = %e, "failed to save session file");
            }
            info!("disconnected from Telegram");
        }
    }
}

fn inbound_from(message: &Message) -> InboundMessage {
    InboundMessage {
        id: message.id(),
        text: message.text().to_string(),
        media: message.media().as_ref().and_then(map_media),
    }
}

fn map_media(media: &Media) -> Option<MediaKind> {
    match media {
        Media::Photo(_) => Some(MediaKind::Photo),
        Media::Document(document) => Some(MediaKind::Document {
            mime: document.mime_type().map(|m| m.to_string()),
            file_name: {
                let name = document.name();
                if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                }
            },
        }),
        Media::WebPage(_) => Some(MediaKind::WebPagePreview),
        // Stickers, contacts, polls and the rest carry nothing to re-upload.
        _ => None,
    }
}

/// Images go out as photos so the destination renders them inline; everything
/// else is attached as a document.
fn sends_as_photo(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jpg") | Some("jpeg") | Some("png")
    )
}
