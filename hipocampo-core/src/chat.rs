//! Chat session controller.
//!
//! Owns the transcript, the persisted agent session id and the
//! loading/error state. Sends are optimistic: the user's message is appended
//! before the call goes out, and every call ends by appending exactly one
//! agent message, either the reply or a local error message.
//!
//! Only one send runs at a time. A send attempted while another is in flight
//! returns `SendOutcome::Skipped(SkipReason::Busy)` without touching the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::{AgentApi, ApiError, RunReply, StartRun};
use crate::models::{Blob, Message, MessageDraft, MessageKind, MessageLog, ObjectUrls, RemoteId};
use crate::store::{KeyValueStore, PersistentCell, SESSION_KEY};

/// Appended to the transcript when a send fails.
pub const SEND_ERROR_REPLY: &str =
    "Desculpe, ocorreu um erro ao processar sua mensagem. Tente novamente.";

/// Banner text while the last send is in a failed state.
pub const SEND_ERROR_NOTICE: &str = "Erro ao enviar mensagem. Tente novamente.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Blank,
    Busy,
    /// The chat was cleared while the send was in flight; the reply was dropped.
    Cleared,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// The agent answered. `session_started` is true when this send opened
    /// the session.
    Replied { session_started: bool },
    /// The call failed and an error message was appended.
    Failed(ApiError),
    /// Nothing was appended for this send. With `SkipReason::Cleared` the
    /// call went out but its result was discarded.
    Skipped(SkipReason),
}

impl SendOutcome {
    pub fn is_replied(&self) -> bool {
        matches!(self, SendOutcome::Replied { .. })
    }
}

struct ChatState {
    log: MessageLog,
    session: PersistentCell<Option<String>>,
    error: Option<String>,
    /// Bumped by `clear()`; replies to sends from an older generation are dropped.
    generation: u64,
}

/// Clears the loading flag on every exit path of a send.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChatSession<A: AgentApi + ?Sized> {
    api: Arc<A>,
    user_id: RemoteId,
    state: Mutex<ChatState>,
    loading: AtomicBool,
    object_urls: Arc<ObjectUrls>,
}

impl<A: AgentApi + ?Sized> ChatSession<A> {
    /// Resume the session id persisted in `store`, if any.
    pub fn new(api: Arc<A>, store: Arc<dyn KeyValueStore>, user_id: RemoteId) -> Self {
        let session = PersistentCell::open(store, SESSION_KEY, None);
        if let Some(id) = session.get() {
            tracing::info!(session_id = %id, "Resuming agent session");
        }
        Self {
            api,
            user_id,
            state: Mutex::new(ChatState {
                log: MessageLog::new(),
                session,
                error: None,
                generation: 0,
            }),
            loading: AtomicBool::new(false),
            object_urls: Arc::new(ObjectUrls::new()),
        }
    }

    /// Share a URL registry with other components (e.g. the audio recorder).
    pub fn with_object_urls(mut self, object_urls: Arc<ObjectUrls>) -> Self {
        self.object_urls = object_urls;
        self
    }

    pub fn user_id(&self) -> &RemoteId {
        &self.user_id
    }

    pub fn object_urls(&self) -> &Arc<ObjectUrls> {
        &self.object_urls
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().log.entries().to_vec()
    }

    pub fn message_count(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session.get().clone()
    }

    pub fn has_active_session(&self) -> bool {
        self.lock().session.get().is_some()
    }

    pub async fn send_text(&self, content: &str) -> SendOutcome {
        if content.trim().is_empty() {
            return SendOutcome::Skipped(SkipReason::Blank);
        }
        let Some(_loading) = self.begin_send() else {
            return SendOutcome::Skipped(SkipReason::Busy);
        };

        let (session_id, generation) = self.append_outgoing(MessageDraft::user_text(content));
        let result = match session_id.as_deref() {
            Some(session_id) => {
                self.api
                    .continue_run(session_id, content, &self.user_id, None)
                    .await
            }
            None => {
                let run = StartRun::text(content, self.api.session_origin());
                self.api.start_run(&run, &self.user_id).await
            }
        };
        self.reconcile(result, session_id.is_none(), generation)
    }

    /// Send a recording with an optional caption. The transcript entry gets
    /// a local `blob:` URL so it can be played back.
    pub async fn send_audio(&self, blob: Blob, caption: &str) -> SendOutcome {
        if blob.is_empty() {
            return SendOutcome::Skipped(SkipReason::Blank);
        }
        let Some(_loading) = self.begin_send() else {
            return SendOutcome::Skipped(SkipReason::Busy);
        };

        let url = self.object_urls.create(blob.clone());
        let (session_id, generation) =
            self.append_outgoing(MessageDraft::user_audio(caption, url));
        let result = self
            .api
            .send_audio(session_id.as_deref(), caption, &blob, &self.user_id)
            .await;
        self.reconcile(result, session_id.is_none(), generation)
    }

    /// Drop the transcript and forget the agent session. Local only.
    ///
    /// A send still in flight is discarded when it completes: its reply is
    /// neither appended nor allowed to restore a session id.
    pub fn clear(&self) {
        let mut state = self.lock();
        for message in state.log.clear() {
            if let Some(url) = message.audio_url.filter(|_| message.kind == MessageKind::Audio) {
                self.object_urls.revoke(&url);
            }
        }
        state.session.clear();
        state.error = None;
        state.generation += 1;
        tracing::info!("Chat cleared");
    }

    fn begin_send(&self) -> Option<LoadingGuard<'_>> {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadingGuard(&self.loading))
    }

    /// Append the user's message and return the session to send it on,
    /// with the generation the send belongs to.
    fn append_outgoing(&self, draft: MessageDraft) -> (Option<String>, u64) {
        let mut state = self.lock();
        state.log.append(draft);
        state.error = None;
        (state.session.get().clone(), state.generation)
    }

    fn reconcile(
        &self,
        result: Result<RunReply, ApiError>,
        starting: bool,
        generation: u64,
    ) -> SendOutcome {
        let mut state = self.lock();
        if state.generation != generation {
            tracing::debug!(ok = result.is_ok(), "Dropping reply to a send made before clear");
            return SendOutcome::Skipped(SkipReason::Cleared);
        }
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => return Self::fail(&mut state, e),
        };

        let mut session_started = false;
        if starting {
            if let Some(id) = reply.session_id.filter(|id| !id.is_empty()) {
                tracing::info!(session_id = %id, "Agent session started");
                state.session.set(Some(id));
                session_started = true;
            }
        }

        match reply.message.filter(|m| !m.trim().is_empty()) {
            Some(text) => {
                state
                    .log
                    .append(MessageDraft::agent_reply(text, reply.message_id));
                SendOutcome::Replied { session_started }
            }
            None => Self::fail(&mut state, ApiError::EmptyReply),
        }
    }

    fn fail(state: &mut ChatState, error: ApiError) -> SendOutcome {
        tracing::warn!(error = %error, "Failed to send message");
        state.error = Some(SEND_ERROR_NOTICE.to_string());
        state.log.append(MessageDraft::agent_error(SEND_ERROR_REPLY));
        SendOutcome::Failed(error)
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        // Never held across an await; a poisoned lock still holds a usable log.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use crate::store::MemoryStore;
    use crate::test_support::{server_error, Call, FakeApi};

    fn session(api: Arc<FakeApi>) -> (ChatSession<FakeApi>, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (ChatSession::new(api, store.clone(), RemoteId::Int(1)), store)
    }

    fn summary(chat: &ChatSession<FakeApi>) -> Vec<(Sender, MessageKind, String)> {
        chat.messages()
            .into_iter()
            .map(|m| (m.sender, m.kind, m.content))
            .collect()
    }

    #[tokio::test]
    async fn test_blank_content_is_ignored() {
        let api = Arc::new(FakeApi::new());
        let (chat, _) = session(api.clone());

        for content in ["", "   ", "\n\t "] {
            let outcome = chat.send_text(content).await;
            assert!(matches!(outcome, SendOutcome::Skipped(SkipReason::Blank)));
        }
        assert_eq!(chat.message_count(), 0);
        assert!(api.calls().is_empty());
        assert!(!chat.is_loading());
    }

    #[tokio::test]
    async fn test_first_send_starts_session() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("Oi!", Some("s1"));
        let (chat, store) = session(api.clone());

        let outcome = chat.send_text("Olá").await;

        assert!(matches!(
            outcome,
            SendOutcome::Replied {
                session_started: true
            }
        ));
        assert_eq!(
            summary(&chat),
            vec![
                (Sender::User, MessageKind::Text, "Olá".to_string()),
                (Sender::Agent, MessageKind::Text, "Oi!".to_string()),
            ]
        );
        assert_eq!(chat.session_id().as_deref(), Some("s1"));
        assert_eq!(store.get(SESSION_KEY).unwrap().as_deref(), Some("\"s1\""));
        assert_eq!(
            api.calls(),
            vec![Call::Start {
                content: "Olá".into(),
                origin: "web".into(),
                media: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_later_sends_continue_session() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("Oi!", Some("s1"));
        api.push_reply("Tudo bem", Some("ignored"));
        api.push_reply("Claro", None);
        let (chat, _) = session(api.clone());

        chat.send_text("Olá").await;
        let second = chat.send_text("Como vai?").await;
        chat.send_text("Me ajuda?").await;

        assert!(matches!(
            second,
            SendOutcome::Replied {
                session_started: false
            }
        ));
        assert_eq!(chat.session_id().as_deref(), Some("s1"));
        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Start { .. }));
        for call in &calls[1..] {
            match call {
                Call::Continue { session_id, .. } => assert_eq!(session_id, "s1"),
                other => panic!("expected continue, got {other:?}"),
            }
        }
        assert_eq!(chat.message_count(), 6);
    }

    #[tokio::test]
    async fn test_persisted_session_is_resumed() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("de volta", None);
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(SESSION_KEY, "\"s7\"").unwrap();

        let chat = ChatSession::new(api.clone(), store, RemoteId::Int(1));
        assert!(chat.has_active_session());
        chat.send_text("oi").await;

        assert!(matches!(&api.calls()[0], Call::Continue { session_id, .. } if session_id == "s7"));
    }

    #[tokio::test]
    async fn test_failed_send_appends_error_message() {
        let api = Arc::new(FakeApi::new());
        api.push_run(Err(server_error()));
        let (chat, _) = session(api.clone());

        let outcome = chat.send_text("Olá").await;

        assert!(matches!(outcome, SendOutcome::Failed(ApiError::Status { status: 500, .. })));
        assert_eq!(
            summary(&chat),
            vec![
                (Sender::User, MessageKind::Text, "Olá".to_string()),
                (Sender::Agent, MessageKind::Error, SEND_ERROR_REPLY.to_string()),
            ]
        );
        assert_eq!(chat.error().as_deref(), Some(SEND_ERROR_NOTICE));
        assert!(!chat.is_loading());
        assert!(!chat.has_active_session());
    }

    #[tokio::test]
    async fn test_error_banner_clears_on_next_send() {
        let api = Arc::new(FakeApi::new());
        api.push_run(Err(server_error()));
        api.push_reply("ok", Some("s1"));
        let (chat, _) = session(api.clone());

        chat.send_text("a").await;
        assert!(chat.error().is_some());
        chat.send_text("b").await;
        assert!(chat.error().is_none());
    }

    #[tokio::test]
    async fn test_reply_without_message_resolves_as_error() {
        let api = Arc::new(FakeApi::new());
        api.push_run(Ok(RunReply {
            message: None,
            message_id: None,
            session_id: Some("s1".into()),
        }));
        let (chat, _) = session(api.clone());

        let outcome = chat.send_text("Olá").await;

        assert!(matches!(outcome, SendOutcome::Failed(ApiError::EmptyReply)));
        let messages = chat.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind, MessageKind::Error);
        // the session still started
        assert_eq!(chat.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_agent_message_id_is_kept() {
        let api = Arc::new(FakeApi::new());
        api.push_run(Ok(RunReply {
            message: Some("Oi!".into()),
            message_id: Some(RemoteId::Int(77)),
            session_id: Some("s1".into()),
        }));
        let (chat, _) = session(api);

        chat.send_text("Olá").await;
        assert_eq!(chat.messages()[1].message_id, Some(RemoteId::Int(77)));
    }

    #[tokio::test]
    async fn test_second_send_while_loading_is_skipped() {
        let api = Arc::new(FakeApi::new().gated());
        api.push_reply("primeira", Some("s1"));
        let (chat, _) = session(api.clone());
        let chat = Arc::new(chat);

        let first = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_text("um").await })
        };
        api.entered.notified().await;

        assert!(chat.is_loading());
        let second = chat.send_text("dois").await;
        assert!(matches!(second, SendOutcome::Skipped(SkipReason::Busy)));
        assert_eq!(chat.message_count(), 1);

        api.release.notify_one();
        let first = first.await.unwrap();
        assert!(first.is_replied());
        assert!(!chat.is_loading());
        assert_eq!(api.calls().len(), 1);
        assert_eq!(chat.message_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_resets_log_and_session() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("Oi!", Some("s1"));
        api.push_run(Err(server_error()));
        api.push_reply("novo", Some("s2"));
        let (chat, store) = session(api.clone());

        chat.send_text("Olá").await;
        chat.send_text("erro").await;
        chat.clear();

        assert_eq!(chat.message_count(), 0);
        assert!(chat.session_id().is_none());
        assert!(chat.error().is_none());
        assert!(store.get(SESSION_KEY).unwrap().is_none());
        assert!(api.calls().len() == 2, "clear must not call the API");

        chat.send_text("recomeço").await;
        assert!(matches!(api.calls()[2], Call::Start { .. }));
        assert_eq!(chat.session_id().as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_clear_during_send_discards_reply() {
        let api = Arc::new(FakeApi::new().gated());
        api.push_reply("Oi!", Some("s1"));
        api.push_reply("novo", Some("s2"));
        let (chat, store) = session(api.clone());
        let chat = Arc::new(chat);

        let pending = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_text("Olá").await })
        };
        api.entered.notified().await;
        chat.clear();
        api.release.notify_one();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, SendOutcome::Skipped(SkipReason::Cleared)));
        assert_eq!(chat.message_count(), 0);
        assert!(chat.session_id().is_none());
        assert!(chat.error().is_none());
        assert!(store.get(SESSION_KEY).unwrap().is_none());
        assert!(!chat.is_loading());

        // the next send starts a fresh session
        let next = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_text("recomeço").await })
        };
        api.entered.notified().await;
        api.release.notify_one();
        assert!(next.await.unwrap().is_replied());
        assert!(matches!(api.calls()[1], Call::Start { .. }));
        assert_eq!(chat.session_id().as_deref(), Some("s2"));
        assert_eq!(chat.message_count(), 2);
    }

    #[tokio::test]
    async fn test_clear_on_empty_session_is_harmless() {
        let (chat, _) = session(Arc::new(FakeApi::new()));
        chat.clear();
        assert_eq!(chat.message_count(), 0);
        assert!(!chat.has_active_session());
    }

    #[tokio::test]
    async fn test_send_audio_appends_playable_message() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("ouvi", Some("s1"));
        let (chat, _) = session(api.clone());
        let blob = Blob::new("audio/wav", vec![1, 2, 3, 4]);

        let outcome = chat.send_audio(blob.clone(), "escuta").await;

        assert!(outcome.is_replied());
        let messages = chat.messages();
        assert_eq!(messages[0].kind, MessageKind::Audio);
        assert_eq!(messages[0].content, "escuta");
        let url = messages[0].audio_url.clone().unwrap();
        assert_eq!(chat.object_urls().resolve(&url), Some(blob));
        assert_eq!(
            api.calls(),
            vec![Call::Start {
                content: "escuta".into(),
                origin: "web".into(),
                media: 1
            }]
        );

        chat.clear();
        assert!(chat.object_urls().resolve(&url).is_none());
    }

    #[tokio::test]
    async fn test_send_audio_on_active_session_continues() {
        let api = Arc::new(FakeApi::new());
        api.push_reply("Oi!", Some("s1"));
        api.push_reply("ouvi", None);
        let (chat, _) = session(api.clone());

        chat.send_text("Olá").await;
        chat.send_audio(Blob::new("audio/wav", vec![9]), "").await;

        assert_eq!(
            api.calls()[1],
            Call::Continue {
                session_id: "s1".into(),
                content: "".into(),
                media: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failed_audio_send_appends_error() {
        let api = Arc::new(FakeApi::new());
        api.push_run(Err(server_error()));
        let (chat, _) = session(api);

        let outcome = chat.send_audio(Blob::new("audio/wav", vec![1]), "").await;
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        let kinds: Vec<_> = chat.messages().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Audio, MessageKind::Error]);
        assert!(!chat.is_loading());
    }

    #[tokio::test]
    async fn test_empty_recording_is_not_sent() {
        let api = Arc::new(FakeApi::new());
        let (chat, _) = session(api.clone());
        let outcome = chat.send_audio(Blob::new("audio/wav", Vec::new()), "x").await;
        assert!(matches!(outcome, SendOutcome::Skipped(SkipReason::Blank)));
        assert!(api.calls().is_empty());
    }
}
