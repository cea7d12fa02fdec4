use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::session::{ChannelRef, InboundMessage, MediaKind, MessagingSession, Subscription};

/// How often the wait loop re-checks the stop flag while idle.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Delay after each live-forwarded message, for platform rate limits.
const LIVE_PACING: Duration = Duration::from_secs(1);
/// Delay between messages during a batch replay (bulk traffic paces slower).
const BATCH_PACING: Duration = Duration::from_secs(2);
const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum EngineState {
    Idle = 0,
    Initializing = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EngineState::Initializing,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

/// The one piece of state shared between the trigger context and the worker
/// task. All transitions are compare-exchange, so a start racing a stop can
/// never leave the cell inconsistent.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(EngineState::Idle as u8))
    }

    fn load(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStatus {
    pub is_running: bool,
    pub is_authorized: bool,
}

// ---------------------------------------------------------------------------
// RelayEngine
// ---------------------------------------------------------------------------

/// The forwarding state machine: subscribes to one source channel and
/// re-posts each new message (text + media) to the destination.
///
/// Lifecycle is `Idle → Initializing → Running → Stopping → Idle`. Stop is
/// cooperative: the worker observes the flag between messages and at every
/// poll interval, and an in-flight forward always runs to completion so the
/// destination never sees a partial transfer.
pub struct RelayEngine {
    session: Arc<dyn MessagingSession>,
    state: Arc<StateCell>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new(session: Arc<dyn MessagingSession>) -> Self {
        Self {
            session,
            state: Arc::new(StateCell::new()),
            worker: StdMutex::new(None),
        }
    }

    /// Start relaying from `source` to `destination`.
    ///
    /// Fails without entering `Running` when the engine is already running,
    /// either identifier is unset, the session is not authorized, or either
    /// channel cannot be resolved.
    pub async fn start(&self, source: &str, destination: &str) -> Result<()> {
        if !self
            .state
            .transition(EngineState::Idle, EngineState::Initializing)
        {
            return Err(RelayError::AlreadyRunning);
        }

        let run = match self.initialize(source, destination).await {
            Ok(run) => run,
            Err(e) => {
                self.state.store(EngineState::Idle);
                return Err(e);
            }
        };

        self.state.store(EngineState::Running);
        let handle = tokio::spawn(run.drive(self.state.clone()));
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Ask the running relay to stop. Returns immediately; the worker exits
    /// at the next iteration boundary once any in-flight message completes.
    pub fn request_stop(&self) -> Result<()> {
        if self
            .state
            .transition(EngineState::Running, EngineState::Stopping)
        {
            info!("stop requested");
            Ok(())
        } else {
            Err(RelayError::NotRunning)
        }
    }

    /// Best-effort status read; never fails.
    pub async fn status(&self) -> RelayStatus {
        RelayStatus {
            is_running: self.state.load() != EngineState::Idle,
            is_authorized: self.session.is_authorized().await,
        }
    }

    /// Wait for the worker task to finish (after `request_stop`, or on its
    /// own if the event stream closes).
    pub async fn wait(&self) {
        let worker = self.worker.lock().unwrap().take();
        match worker {
            Some(handle) => {
                let _ = handle.await;
            }
            // Another waiter holds the handle; fall back to watching the state.
            None => {
                while self.state.load() != EngineState::Idle {
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Replay the `limit` most recent source messages, oldest first, through
    /// the same per-message path as the live relay, paced for bulk traffic.
    /// Takes the engine for the duration of the run. Returns the number of
    /// messages replayed.
    pub async fn copy_recent(&self, source: &str, destination: &str, limit: usize) -> Result<usize> {
        if !self
            .state
            .transition(EngineState::Idle, EngineState::Running)
        {
            return Err(RelayError::AlreadyRunning);
        }
        let result = self.copy_recent_inner(source, destination, limit).await;
        self.state.store(EngineState::Idle);
        result
    }

    async fn copy_recent_inner(
        &self,
        source: &str,
        destination: &str,
        limit: usize,
    ) -> Result<usize> {
        let (source, destination) = self.resolve_pair(source, destination).await?;
        let staging = tempfile::Builder::new().prefix("tgrelay-").tempdir()?;

        let mut messages = self.session.recent_messages(&source, limit).await?;
        messages.reverse(); // chronological, oldest first
        info!(count = messages.len(), "replaying recent messages");

        let mut replayed = 0;
        for message in &messages {
            if self.state.load() != EngineState::Running {
                info!("batch replay interrupted");
                break;
            }
            if let Err(e) = forward_message(
                self.session.as_ref(),
                &source,
                &destination,
                staging.path(),
                message,
            )
            .await
            {
                warn!(message_id = message.id, error = %e, "message abandoned");
            }
            replayed += 1;
            sleep(BATCH_PACING).await;
        }
        Ok(replayed)
    }

    async fn resolve_pair(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<(ChannelRef, ChannelRef)> {
        if source.is_empty() || destination.is_empty() {
            return Err(RelayError::Config(
                "source and destination channels must be set".to_string(),
            ));
        }
        if !self.session.is_authorized().await {
            return Err(RelayError::Auth("not logged in".to_string()));
        }
        let source = self.session.resolve_entity(source).await?;
        let destination = self.session.resolve_entity(destination).await?;
        Ok((source, destination))
    }

    async fn initialize(&self, source: &str, destination: &str) -> Result<RelayRun> {
        let (source, destination) = self.resolve_pair(source, destination).await?;
        info!(source = %source.title, destination = %destination.title, "relay initialized");
        let staging = tempfile::Builder::new().prefix("tgrelay-").tempdir()?;
        let subscription = self.session.subscribe(&source).await?;
        Ok(RelayRun {
            session: self.session.clone(),
            source,
            destination,
            staging,
            subscription,
        })
    }
}

/// Everything one live run owns: the resolved endpoints, the staging
/// directory (removed when the run ends, on every path), and the event
/// subscription (closed when the run ends).
struct RelayRun {
    session: Arc<dyn MessagingSession>,
    source: ChannelRef,
    destination: ChannelRef,
    staging: TempDir,
    subscription: Subscription,
}

impl RelayRun {
    async fn drive(mut self, state: Arc<StateCell>) {
        info!("relay running");
        while state.load() == EngineState::Running {
            match timeout(POLL_INTERVAL, self.subscription.recv()).await {
                Ok(Some(message)) => {
                    // One message at a time, to completion: per-channel
                    // ordering on the destination depends on it.
                    if let Err(e) = forward_message(
                        self.session.as_ref(),
                        &self.source,
                        &self.destination,
                        self.staging.path(),
                        &message,
                    )
                    .await
                    {
                        warn!(message_id = message.id, error = %e, "message abandoned");
                    }
                    sleep(LIVE_PACING).await;
                }
                Ok(None) => {
                    warn!("event stream closed");
                    break;
                }
                Err(_) => {} // poll tick; re-check the stop flag
            }
        }
        self.subscription.close();
        state.store(EngineState::Idle);
        info!("relay stopped");
    }
}

// ---------------------------------------------------------------------------
// Per-message forwarding
// ---------------------------------------------------------------------------

/// Temporary local copy of a message's media. The file is removed when the
/// guard drops, so a staged file never outlives its forwarding task whether
/// the send succeeded, failed, or the download aborted partway.
struct StagedMedia {
    path: PathBuf,
}

impl StagedMedia {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedMedia {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove staged file");
            }
        }
    }
}

/// Local file name for a message's media, or `None` when there is nothing to
/// download (no media, or a link preview, which stays text-only).
fn staged_file_name(message: &InboundMessage, timestamp: i64) -> Option<String> {
    match &message.media {
        None | Some(MediaKind::WebPagePreview) => None,
        Some(MediaKind::Photo) => Some(format!("photo_{}_{}.jpg", message.id, timestamp)),
        Some(MediaKind::Document { mime, file_name }) => {
            let extension = mime.as_deref().and_then(|mime| {
                if mime.starts_with("video/") {
                    Some(".mp4")
                } else if mime.starts_with("audio/") {
                    Some(".mp3")
                } else if mime.starts_with("image/") {
                    Some(".jpg")
                } else {
                    None
                }
            });
            Some(match (extension, file_name) {
                (Some(ext), _) => format!("document_{}_{}{}", message.id, timestamp, ext),
                (None, Some(name)) => format!("{}_{}_{}", message.id, timestamp, name),
                (None, None) => format!("document_{}_{}", message.id, timestamp),
            })
        }
    }
}

/// Forward one message: stage its media, send text + media as a single
/// message, clean up. Empty messages (no text, nothing staged) are skipped
/// without a send. Delivery failures are retried a bounded number of times;
/// any error is the caller's to log, never to stop the relay over.
async fn forward_message(
    session: &dyn MessagingSession,
    source: &ChannelRef,
    destination: &ChannelRef,
    staging_dir: &Path,
    message: &InboundMessage,
) -> Result<()> {
    let staged = match staged_file_name(message, Utc::now().timestamp()) {
        Some(name) => {
            let staged = StagedMedia::new(staging_dir.join(name));
            session
                .download_media(source, message.id, staged.path())
                .await?;
            debug!(message_id = message.id, path = %staged.path().display(), "media staged");
            Some(staged)
        }
        None => None,
    };

    if message.text.is_empty() && staged.is_none() {
        debug!(message_id = message.id, "nothing to forward");
        return Ok(());
    }

    let media_path = staged.as_ref().map(|s| s.path());
    let mut attempt = 1;
    loop {
        match session
            .send_message(destination, &message.text, media_path)
            .await
        {
            Ok(()) => break,
            Err(e @ RelayError::Delivery(_)) if attempt < SEND_ATTEMPTS => {
                warn!(message_id = message.id, attempt, error = %e, "send failed, retrying");
                attempt += 1;
                sleep(SEND_RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
    info!(message_id = message.id, "message forwarded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        ChannelInfo, ChannelKind, EntityQuery, LoginChallenge, LoginOutcome, Subscription,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct SentMessage {
        text: String,
        media: Option<PathBuf>,
        media_existed: bool,
        at: Instant,
    }

    struct MockSession {
        authorized: bool,
        channels: Vec<ChannelInfo>,
        recent: Vec<InboundMessage>,
        subscription: StdMutex<Option<mpsc::Receiver<InboundMessage>>>,
        fail_send_texts: HashSet<String>,
        fail_download_ids: HashSet<i32>,
        sent: StdMutex<Vec<SentMessage>>,
        send_attempts: StdMutex<Vec<String>>,
        downloads: StdMutex<Vec<PathBuf>>,
    }

    impl MockSession {
        fn new() -> Self {
            Self {
                authorized: true,
                channels: vec![
                    ChannelInfo {
                        id: 1,
                        title: "Source".to_string(),
                        username: Some("source".to_string()),
                        kind: ChannelKind::Channel,
                    },
                    ChannelInfo {
                        id: 2,
                        title: "Dest".to_string(),
                        username: Some("dest".to_string()),
                        kind: ChannelKind::Channel,
                    },
                ],
                recent: Vec::new(),
                subscription: StdMutex::new(None),
                fail_send_texts: HashSet::new(),
                fail_download_ids: HashSet::new(),
                sent: StdMutex::new(Vec::new()),
                send_attempts: StdMutex::new(Vec::new()),
                downloads: StdMutex::new(Vec::new()),
            }
        }

        /// Attach a feed the test can push inbound messages through.
        fn with_feed(mut self) -> (Self, mpsc::Sender<InboundMessage>) {
            let (tx, rx) = mpsc::channel(16);
            self.subscription = StdMutex::new(Some(rx));
            (self, tx)
        }

        fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent().into_iter().map(|s| s.text).collect()
        }

        fn send_attempts(&self) -> Vec<String> {
            self.send_attempts.lock().unwrap().clone()
        }

        fn downloads(&self) -> Vec<PathBuf> {
            self.downloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingSession for MockSession {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn start_login(&self, _phone: &str) -> Result<LoginOutcome> {
            Ok(LoginOutcome::AlreadyAuthorized)
        }

        async fn verify_code(&self, _code: &str, _challenge: &LoginChallenge) -> Result<()> {
            Ok(())
        }

        async fn is_authorized(&self) -> bool {
            self.authorized
        }

        async fn list_channels(&self) -> Vec<ChannelInfo> {
            self.channels.clone()
        }

        async fn resolve_entity(&self, identifier: &str) -> Result<ChannelRef> {
            let found = match EntityQuery::parse(identifier) {
                EntityQuery::Id(id) => self.channels.iter().find(|c| c.id == id),
                EntityQuery::Handle(handle) => self
                    .channels
                    .iter()
                    .find(|c| c.username.as_deref() == Some(handle.as_str())),
            };
            found
                .map(|c| ChannelRef {
                    id: c.id,
                    title: c.title.clone(),
                })
                .ok_or_else(|| RelayError::EntityNotFound(identifier.to_string()))
        }

        async fn send_message(
            &self,
            _entity: &ChannelRef,
            text: &str,
            media: Option<&Path>,
        ) -> Result<()> {
            self.send_attempts.lock().unwrap().push(text.to_string());
            if self.fail_send_texts.contains(text) {
                return Err(RelayError::Delivery("flood wait".to_string()));
            }
            self.sent.lock().unwrap().push(SentMessage {
                text: text.to_string(),
                media: media.map(|p| p.to_path_buf()),
                media_existed: media.map(|p| p.exists()).unwrap_or(false),
                at: Instant::now(),
            });
            Ok(())
        }

        async fn download_media(
            &self,
            _entity: &ChannelRef,
            message_id: i32,
            dest: &Path,
        ) -> Result<()> {
            if self.fail_download_ids.contains(&message_id) {
                return Err(RelayError::Download {
                    message_id,
                    reason: "gone".to_string(),
                });
            }
            std::fs::write(dest, b"media-bytes").unwrap();
            self.downloads.lock().unwrap().push(dest.to_path_buf());
            Ok(())
        }

        async fn recent_messages(
            &self,
            _entity: &ChannelRef,
            limit: usize,
        ) -> Result<Vec<InboundMessage>> {
            Ok(self.recent.iter().take(limit).cloned().collect())
        }

        async fn subscribe(&self, _entity: &ChannelRef) -> Result<Subscription> {
            let rx = self
                .subscription
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| RelayError::Connection("no feed".to_string()))?;
            Ok(Subscription::new(rx))
        }

        async fn disconnect(&self) {}
    }

    fn text_message(id: i32, text: &str) -> InboundMessage {
        InboundMessage {
            id,
            text: text.to_string(),
            media: None,
        }
    }

    fn photo_message(id: i32, text: &str) -> InboundMessage {
        InboundMessage {
            id,
            text: text.to_string(),
            media: Some(MediaKind::Photo),
        }
    }

    fn document_message(id: i32, mime: Option<&str>, file_name: Option<&str>) -> InboundMessage {
        InboundMessage {
            id,
            text: String::new(),
            media: Some(MediaKind::Document {
                mime: mime.map(str::to_string),
                file_name: file_name.map(str::to_string),
            }),
        }
    }

    fn refs() -> (ChannelRef, ChannelRef) {
        (
            ChannelRef {
                id: 1,
                title: "Source".to_string(),
            },
            ChannelRef {
                id: 2,
                title: "Dest".to_string(),
            },
        )
    }

    // ---- staged file naming ----

    #[test]
    fn test_photo_name_has_id_timestamp_and_jpg_extension() {
        let name = staged_file_name(&photo_message(42, ""), 1700000000).unwrap();
        assert_eq!(name, "photo_42_1700000000.jpg");
    }

    #[test]
    fn test_document_extension_follows_mime_class() {
        let video = staged_file_name(&document_message(7, Some("video/mp4"), None), 99).unwrap();
        assert_eq!(video, "document_7_99.mp4");

        let audio = staged_file_name(&document_message(7, Some("audio/ogg"), None), 99).unwrap();
        assert_eq!(audio, "document_7_99.mp3");

        let image = staged_file_name(&document_message(7, Some("image/png"), None), 99).unwrap();
        assert_eq!(image, "document_7_99.jpg");
    }

    #[test]
    fn test_document_with_unknown_mime_uses_original_name() {
        let name =
            staged_file_name(&document_message(8, Some("application/pdf"), Some("report.pdf")), 99)
                .unwrap();
        assert_eq!(name, "8_99_report.pdf");
    }

    #[test]
    fn test_document_without_mime_or_name_gets_generic_name() {
        let name = staged_file_name(&document_message(9, None, None), 99).unwrap();
        assert_eq!(name, "document_9_99");
    }

    #[test]
    fn test_web_page_preview_stages_nothing() {
        let message = InboundMessage {
            id: 10,
            text: "look at this".to_string(),
            media: Some(MediaKind::WebPagePreview),
        };
        assert_eq!(staged_file_name(&message, 99), None);
        assert_eq!(staged_file_name(&text_message(11, "plain"), 99), None);
    }

    // ---- per-message forwarding ----

    #[tokio::test(start_paused = true)]
    async fn test_empty_message_is_skipped_without_a_send() {
        let session = MockSession::new();
        let staging = tempfile::tempdir().unwrap();
        let (source, destination) = refs();

        forward_message(&session, &source, &destination, staging.path(), &text_message(1, ""))
            .await
            .unwrap();

        assert!(session.send_attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_only_message_forwards_text_without_attachment() {
        let session = MockSession::new();
        let staging = tempfile::tempdir().unwrap();
        let (source, destination) = refs();

        forward_message(
            &session,
            &source,
            &destination,
            staging.path(),
            &text_message(1, "hello"),
        )
        .await
        .unwrap();

        let sent = session.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "hello");
        assert!(sent[0].media.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staged_photo_is_created_used_then_deleted() {
        let session = MockSession::new();
        let staging = tempfile::tempdir().unwrap();
        let (source, destination) = refs();

        forward_message(
            &session,
            &source,
            &destination,
            staging.path(),
            &photo_message(42, "caption"),
        )
        .await
        .unwrap();

        let downloads = session.downloads();
        assert_eq!(downloads.len(), 1);
        let name = downloads[0].file_name().unwrap().to_str().unwrap();
        assert!(
            name.starts_with("photo_42_") && name.ends_with(".jpg"),
            "unexpected staged name: {name}"
        );

        let sent = session.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].media_existed, "media file must exist at send time");
        assert!(
            !downloads[0].exists(),
            "staged file must be gone after the task"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_staged_media_deleted_when_send_fails() {
        let mut session = MockSession::new();
        session.fail_send_texts.insert("doomed".to_string());
        let staging = tempfile::tempdir().unwrap();
        let (source, destination) = refs();

        let result = forward_message(
            &session,
            &source,
            &destination,
            staging.path(),
            &photo_message(5, "doomed"),
        )
        .await;

        assert!(matches!(result, Err(RelayError::Delivery(_))));
        // Bounded retry: every attempt failed before giving up.
        assert_eq!(session.send_attempts().len(), SEND_ATTEMPTS as usize);
        assert!(!session.downloads()[0].exists(), "staged file leaked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_leaves_no_file_and_no_send() {
        let mut session = MockSession::new();
        session.fail_download_ids.insert(7);
        let staging = tempfile::tempdir().unwrap();
        let (source, destination) = refs();

        let result = forward_message(
            &session,
            &source,
            &destination,
            staging.path(),
            &document_message(7, Some("video/mp4"), None),
        )
        .await;

        assert!(matches!(result, Err(RelayError::Download { .. })));
        assert!(session.send_attempts().is_empty());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    // ---- engine lifecycle ----

    #[tokio::test(start_paused = true)]
    async fn test_live_relay_preserves_order_across_a_failing_message() {
        let (mut session, feed) = MockSession::new().with_feed();
        session.fail_send_texts.insert("boom".to_string());
        let session = Arc::new(session);
        let engine = RelayEngine::new(session.clone());

        engine.start("@source", "@dest").await.unwrap();
        for (i, text) in ["first", "second", "boom", "third", "fourth"]
            .iter()
            .enumerate()
        {
            feed.send(text_message(i as i32 + 1, text)).await.unwrap();
        }

        // Paused clock: this fast-forwards through pacing and retry backoff.
        sleep(Duration::from_secs(60)).await;
        engine.request_stop().unwrap();
        engine.wait().await;

        assert_eq!(
            session.sent_texts(),
            vec!["first", "second", "third", "fourth"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_already_running() {
        let (session, _feed) = MockSession::new().with_feed();
        let engine = RelayEngine::new(Arc::new(session));

        engine.start("1", "2").await.unwrap();
        assert!(matches!(
            engine.start("1", "2").await,
            Err(RelayError::AlreadyRunning)
        ));

        engine.request_stop().unwrap();
        engine.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_validates_channels_and_authorization() {
        let mut session = MockSession::new();
        session.authorized = false;
        let engine = RelayEngine::new(Arc::new(session));

        assert!(matches!(
            engine.start("", "2").await,
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            engine.start("1", "2").await,
            Err(RelayError::Auth(_))
        ));

        let engine = RelayEngine::new(Arc::new(MockSession::new()));
        assert!(matches!(
            engine.start("999", "2").await,
            Err(RelayError::EntityNotFound(_))
        ));
        // A failed start leaves the engine idle and startable.
        assert!(!engine.status().await.is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_idle_fails() {
        let engine = RelayEngine::new(Arc::new(MockSession::new()));
        assert!(matches!(engine.request_stop(), Err(RelayError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_engine_to_idle() {
        let (session, _feed) = MockSession::new().with_feed();
        let engine = RelayEngine::new(Arc::new(session));

        engine.start("1", "2").await.unwrap();
        assert!(engine.status().await.is_running);

        engine.request_stop().unwrap();
        engine.wait().await;
        assert!(!engine.status().await.is_running);

        // And a second stop is again a failure.
        assert!(matches!(engine.request_stop(), Err(RelayError::NotRunning)));
    }

    // ---- batch replay ----

    #[tokio::test(start_paused = true)]
    async fn test_copy_recent_replays_oldest_first_with_bulk_pacing() {
        let mut session = MockSession::new();
        session.recent = vec![
            text_message(5, "five"),
            text_message(4, "four"),
            text_message(3, "three"),
            text_message(2, "two"),
            text_message(1, "one"),
        ];
        let session = Arc::new(session);
        let engine = RelayEngine::new(session.clone());

        let replayed = engine.copy_recent("1", "2", 3).await.unwrap();

        assert_eq!(replayed, 3);
        assert_eq!(session.sent_texts(), vec!["three", "four", "five"]);

        let sent = session.sent();
        assert!(sent[1].at - sent[0].at >= BATCH_PACING);
        assert!(sent[2].at - sent[1].at >= BATCH_PACING);
        assert!(!engine.status().await.is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_recent_requires_an_idle_engine() {
        let (session, _feed) = MockSession::new().with_feed();
        let engine = RelayEngine::new(Arc::new(session));

        engine.start("1", "2").await.unwrap();
        assert!(matches!(
            engine.copy_recent("1", "2", 3).await,
            Err(RelayError::AlreadyRunning)
        ));

        engine.request_stop().unwrap();
        engine.wait().await;
    }
}
