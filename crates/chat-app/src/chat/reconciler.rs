use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use lumen_llm::{
    ConversationBackend, ConversationSession, InitializationError, ProviderConfig, StreamError,
    StreamResult,
};
use tokio::sync::watch;

use crate::chat::message::{
    ExchangeState, ExchangeTransition, ExchangeTransitionRejection, MessageId, MessageRecord,
};
use crate::chat::transcript::{TranscriptSnapshot, TranscriptStore};

pub const DEFAULT_WELCOME_MESSAGE: &str = "Hello! How can I help you today?";
const FALLBACK_FAILURE_DESCRIPTION: &str = "the backend gave no details";

/// Text shown in place of a reply whose stream failed.
pub fn failure_reply_text(description: &str) -> String {
    let description = description.trim();
    let description = if description.is_empty() {
        FALLBACK_FAILURE_DESCRIPTION
    } else {
        description
    };
    format!("Sorry, something went wrong while generating a reply: {description}")
}

/// Text of the assistant record shown when no session could be opened.
pub fn unconfigured_reply_text(error: &InitializationError) -> String {
    format!(
        "The chat backend could not be started ({error}). Check the API key and model in settings, then restart."
    )
}

/// Drives one request/response exchange at a time and folds its streamed
/// fragments into the transcript.
pub struct StreamReconciler {
    store: Arc<TranscriptStore>,
    state: watch::Sender<ExchangeState>,
    session: Option<Arc<dyn ConversationSession>>,
    seed_text: String,
    banner: ArcSwapOption<String>,
}

impl StreamReconciler {
    pub fn new(session: Arc<dyn ConversationSession>, welcome_message: impl Into<String>) -> Self {
        Self::build(Some(session), welcome_message.into(), None)
    }

    /// Creates a reconciler with no session: the transcript explains the
    /// configuration problem, a banner stays up, and every send is ignored.
    pub fn unconfigured(error: &InitializationError) -> Self {
        Self::build(
            None,
            unconfigured_reply_text(error),
            Some(format!("Configuration error: {error}")),
        )
    }

    /// Opens a session on `backend`, falling back to the unconfigured state.
    pub async fn connect(
        backend: &dyn ConversationBackend,
        config: ProviderConfig,
        welcome_message: impl Into<String>,
    ) -> Self {
        let provider_id = config.provider_id.clone();
        match backend.open_session(config).await {
            Ok(session) => Self::new(session, welcome_message),
            Err(error) => {
                tracing::error!(
                    provider_id = %provider_id,
                    error = %error,
                    "failed to open conversation session"
                );
                Self::unconfigured(&error)
            }
        }
    }

    fn build(
        session: Option<Arc<dyn ConversationSession>>,
        seed_text: String,
        banner: Option<String>,
    ) -> Self {
        let store = TranscriptStore::with_seed(MessageRecord::assistant(seed_text.clone()));
        let (state, _) = watch::channel(ExchangeState::Idle);

        Self {
            store: Arc::new(store),
            state,
            session,
            seed_text,
            banner: ArcSwapOption::from(banner.map(Arc::new)),
        }
    }

    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.store.snapshot()
    }

    pub fn state(&self) -> ExchangeState {
        self.state.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_busy()
    }

    pub fn active_record_id(&self) -> Option<MessageId> {
        self.state.borrow().active_record_id()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Transcript change notifications; re-read `snapshot()` on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ExchangeState> {
        self.state.subscribe()
    }

    pub fn banner(&self) -> Option<Arc<String>> {
        self.banner.load_full()
    }

    pub fn dismiss_banner(&self) {
        self.banner.store(None);
    }

    /// Submits `prompt` and streams the reply into the transcript.
    ///
    /// Blank prompts, prompts sent while an exchange is in flight, and prompts
    /// sent without a session are ignored without touching the transcript.
    /// Backend failures end up as the reply text; nothing is returned.
    pub async fn send(&self, prompt: &str) {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            tracing::debug!("ignoring blank prompt");
            return;
        }

        let Some(session) = self.session.clone() else {
            tracing::debug!("ignoring prompt, no conversation session is open");
            return;
        };

        let user = MessageRecord::user(prompt);
        let placeholder = MessageRecord::assistant_placeholder();
        let record_id = placeholder.id;

        if let Err(rejection) = self.advance(ExchangeTransition::Start(record_id)) {
            tracing::debug!(?rejection, "ignoring prompt while another exchange is in flight");
            return;
        }

        // Released on every exit, including when this future is dropped mid-stream.
        let _release = ExchangeRelease {
            state: &self.state,
            record_id,
        };

        self.store.append(user);
        self.store.append(placeholder);

        match self.stream_into(session.as_ref(), trimmed, record_id).await {
            Ok(fragment_count) => {
                self.advance_or_warn(ExchangeTransition::Complete(record_id));
                tracing::info!(record_id = %record_id, fragment_count, "exchange completed");
            }
            Err(error) => self.fail_exchange(record_id, &error),
        }
    }

    /// Starts over with a single fresh welcome record.
    ///
    /// An exchange still in flight keeps running, but its record is gone, so
    /// its remaining text updates are dropped.
    pub fn new_session(&self) {
        if let Some(session) = &self.session {
            session.clear_history();
        }
        self.store
            .reset(MessageRecord::assistant(self.seed_text.clone()));
        tracing::info!(busy = self.is_busy(), "started a new chat session");
    }

    async fn stream_into(
        &self,
        session: &dyn ConversationSession,
        prompt: &str,
        record_id: MessageId,
    ) -> StreamResult<usize> {
        let mut fragments = session.stream_reply(prompt).await?;
        self.advance_or_warn(ExchangeTransition::Receive(record_id));

        let mut buffer = String::new();
        let mut fragment_count = 0_usize;

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            fragment_count += 1;
            if fragment.is_empty() {
                continue;
            }

            buffer.push_str(&fragment.text);
            self.advance_or_warn(ExchangeTransition::Receive(record_id));
            self.store.replace_text(record_id, buffer.as_str());
        }

        Ok(fragment_count)
    }

    fn fail_exchange(&self, record_id: MessageId, error: &StreamError) {
        let message = failure_reply_text(&error.to_string());
        tracing::warn!(
            record_id = %record_id,
            stage = error.stage(),
            error = %error,
            "exchange failed, replacing the reply with an error message"
        );

        self.store.replace_text(record_id, message.as_str());
        self.advance_or_warn(ExchangeTransition::Fail { record_id, message });
    }

    fn advance(&self, transition: ExchangeTransition) -> Result<(), ExchangeTransitionRejection> {
        let mut outcome = Ok(());
        self.state
            .send_if_modified(|state| match state.apply(transition) {
                Ok(next) => {
                    let changed = *state != next;
                    *state = next;
                    changed
                }
                Err(rejection) => {
                    outcome = Err(rejection);
                    false
                }
            });
        outcome
    }

    fn advance_or_warn(&self, transition: ExchangeTransition) {
        if let Err(rejection) = self.advance(transition) {
            tracing::warn!(?rejection, "exchange transition rejected");
        }
    }
}

/// Returns the exchange state to idle when dropped.
struct ExchangeRelease<'a> {
    state: &'a watch::Sender<ExchangeState>,
    record_id: MessageId,
}

impl Drop for ExchangeRelease<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            if let Ok(next) = state.apply(ExchangeTransition::Release) {
                *state = next;
            }
        });
        tracing::debug!(record_id = %self.record_id, "exchange released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::chat::message::Role;
    use crate::testing::ScriptedSession;

    fn reconciler_with(session: &Arc<ScriptedSession>) -> Arc<StreamReconciler> {
        let session: Arc<dyn ConversationSession> = session.clone();
        Arc::new(StreamReconciler::new(session, DEFAULT_WELCOME_MESSAGE))
    }

    fn roles_and_texts(reconciler: &StreamReconciler) -> Vec<(Role, String)> {
        reconciler
            .snapshot()
            .iter()
            .map(|record| (record.role, record.text.clone()))
            .collect()
    }

    async fn wait_until_busy(reconciler: &StreamReconciler) {
        let mut state = reconciler.subscribe_state();
        state.wait_for(ExchangeState::is_busy).await.unwrap();
    }

    #[tokio::test]
    async fn streamed_fragments_become_the_reply() {
        let session = ScriptedSession::new();
        session.push_fragments(&["Hi", " there", "!"]);
        let reconciler = reconciler_with(&session);

        reconciler.send("Hello").await;

        assert_eq!(
            roles_and_texts(&reconciler),
            vec![
                (Role::Assistant, DEFAULT_WELCOME_MESSAGE.to_string()),
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi there!".to_string()),
            ]
        );
        assert!(!reconciler.is_busy());
        assert_eq!(reconciler.active_record_id(), None);
        assert_eq!(session.prompts(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let session = ScriptedSession::new();
        let reconciler = reconciler_with(&session);
        let before = reconciler.snapshot().to_vec();

        reconciler.send("  ").await;
        reconciler.send("\n\t").await;

        assert_eq!(reconciler.snapshot().to_vec(), before);
        assert!(!reconciler.is_busy());
        assert!(session.prompts().is_empty());
    }

    #[tokio::test]
    async fn prompt_is_trimmed_for_the_backend_only() {
        let session = ScriptedSession::new();
        session.push_fragments(&["ok"]);
        let reconciler = reconciler_with(&session);

        reconciler.send("  padded  ").await;

        assert_eq!(session.prompts(), vec!["padded".to_string()]);
        assert_eq!(reconciler.snapshot().get(1).unwrap().text, "  padded  ");
    }

    #[tokio::test]
    async fn sends_while_busy_are_ignored() {
        let session = ScriptedSession::new();
        let fragments = session.push_channel();
        let reconciler = reconciler_with(&session);

        let first = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.send("first").await }
        });
        wait_until_busy(&reconciler).await;
        let len_while_busy = reconciler.snapshot().len();
        assert_eq!(len_while_busy, 3);

        for prompt in ["X", "Y", "first"] {
            reconciler.send(prompt).await;
            assert_eq!(reconciler.snapshot().len(), len_while_busy);
            assert!(reconciler.is_busy());
        }

        fragments.send(Ok(lumen_llm::Fragment::new("done"))).unwrap();
        drop(fragments);
        first.await.unwrap();

        assert!(!reconciler.is_busy());
        assert_eq!(reconciler.snapshot().len(), 3);
        assert_eq!(reconciler.snapshot().last().unwrap().text, "done");
        assert_eq!(session.prompts(), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn reply_text_is_always_the_prefix_received_so_far() {
        let session = ScriptedSession::new();
        let reconciler = reconciler_with(&session);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(reconciler.store());
        let sink = Arc::clone(&observed);
        session.push_observed(&["a", "", "b", "", "c"], move || {
            let snapshot = store.snapshot();
            let last = snapshot.last().unwrap();
            sink.lock()
                .unwrap()
                .push((snapshot.len(), last.role, last.text.clone()));
        });

        reconciler.send("go").await;

        // One observation before each fragment is pulled, plus one at the end.
        let observed = observed.lock().unwrap().clone();
        let texts = observed
            .iter()
            .map(|(_, _, text)| text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["", "a", "a", "ab", "ab", "abc"]);
        assert!(
            observed
                .iter()
                .all(|(len, role, _)| *len == 3 && *role == Role::Assistant)
        );
    }

    #[tokio::test]
    async fn accepted_send_appends_exactly_two_records_before_streaming() {
        let session = ScriptedSession::new();
        let fragments = session.push_channel();
        let reconciler = reconciler_with(&session);
        let initial_len = reconciler.snapshot().len();

        let exchange = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.send("count me").await }
        });
        wait_until_busy(&reconciler).await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), initial_len + 2);
        let user = snapshot.get(initial_len).unwrap();
        let placeholder = snapshot.get(initial_len + 1).unwrap();
        assert_eq!((user.role, user.text.as_str()), (Role::User, "count me"));
        assert_eq!(
            (placeholder.role, placeholder.text.as_str()),
            (Role::Assistant, "")
        );
        assert_ne!(user.id, placeholder.id);
        assert_eq!(reconciler.active_record_id(), Some(placeholder.id));

        drop(fragments);
        exchange.await.unwrap();
        assert_eq!(reconciler.snapshot().len(), initial_len + 2);
    }

    #[tokio::test]
    async fn completion_without_fragments_leaves_an_empty_reply() {
        let session = ScriptedSession::new();
        session.push_fragments(&[]);
        let reconciler = reconciler_with(&session);

        reconciler.send("quiet").await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.last().unwrap().role, Role::Assistant);
        assert_eq!(snapshot.last().unwrap().text, "");
        assert_eq!(reconciler.state(), ExchangeState::Idle);
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_partial_text() {
        let session = ScriptedSession::new();
        session.push_failure_after(&["f1", "f2"], "timeout");
        let reconciler = reconciler_with(&session);

        reconciler.send("X").await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(1).unwrap().text, "X");
        let reply = snapshot.get(2).unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text, failure_reply_text("timeout"));
        assert!(!reply.text.contains("f1f2"));
        assert!(!reconciler.is_busy());
        assert_eq!(reconciler.active_record_id(), None);
    }

    #[tokio::test]
    async fn failure_before_any_fragment_is_reported_inline() {
        let session = ScriptedSession::new();
        session.push_failure_after(&[], "timeout");
        let reconciler = reconciler_with(&session);

        reconciler.send("X").await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.get(1).unwrap().text, "X");
        assert!(snapshot.get(2).unwrap().text.contains("timeout"));
        assert!(!reconciler.is_busy());
    }

    #[tokio::test]
    async fn failure_to_open_the_stream_is_reported_inline() {
        let session = ScriptedSession::new();
        session.push_open_failure("backend unreachable");
        let reconciler = reconciler_with(&session);

        reconciler.send("X").await;

        let reply = reconciler.snapshot().last().unwrap().clone();
        assert_eq!(reply.text, failure_reply_text("backend unreachable"));
        assert!(!reconciler.is_busy());
    }

    #[tokio::test]
    async fn blank_failure_description_uses_fallback_text() {
        let session = ScriptedSession::new();
        session.push_failure_after(&["partial"], "   ");
        let reconciler = reconciler_with(&session);

        reconciler.send("X").await;

        assert_eq!(
            reconciler.snapshot().last().unwrap().text,
            failure_reply_text("")
        );
        assert!(failure_reply_text("").contains(FALLBACK_FAILURE_DESCRIPTION));
    }

    #[tokio::test]
    async fn failed_exchange_does_not_block_the_next_send() {
        let session = ScriptedSession::new();
        session.push_failure_after(&["half"], "reset by peer");
        session.push_fragments(&["recovered"]);
        let reconciler = reconciler_with(&session);

        reconciler.send("first").await;
        reconciler.send("second").await;

        let texts = roles_and_texts(&reconciler);
        assert_eq!(texts.len(), 5);
        assert_eq!(texts[1], (Role::User, "first".to_string()));
        assert_eq!(texts[2].1, failure_reply_text("reset by peer"));
        assert_eq!(texts[3], (Role::User, "second".to_string()));
        assert_eq!(texts[4], (Role::Assistant, "recovered".to_string()));
    }

    #[tokio::test]
    async fn new_session_mid_stream_drops_late_updates() {
        let session = ScriptedSession::new();
        let fragments = session.push_channel();
        let reconciler = reconciler_with(&session);

        let exchange = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.send("old question").await }
        });
        wait_until_busy(&reconciler).await;
        let stale_id = reconciler.active_record_id().unwrap();

        reconciler.new_session();
        assert_eq!(session.clear_count(), 1);

        fragments.send(Ok(lumen_llm::Fragment::new("late"))).unwrap();
        fragments
            .send(Err(StreamError::backend("test", "late failure")))
            .unwrap();
        drop(fragments);
        exchange.await.unwrap();

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(0).unwrap().text, DEFAULT_WELCOME_MESSAGE);
        assert!(snapshot.find(stale_id).is_none());
        assert!(!reconciler.is_busy());
    }

    #[tokio::test]
    async fn dropping_a_send_mid_stream_still_releases() {
        let session = ScriptedSession::new();
        let _fragments = session.push_channel();
        let reconciler = reconciler_with(&session);

        let mut exchange = Box::pin(reconciler.send("abandoned"));
        assert!(futures::poll!(exchange.as_mut()).is_pending());
        assert!(reconciler.is_busy());

        drop(exchange);
        assert!(!reconciler.is_busy());
        assert_eq!(reconciler.active_record_id(), None);

        session.push_fragments(&["fresh"]);
        reconciler.send("retry").await;
        assert_eq!(reconciler.snapshot().last().unwrap().text, "fresh");
    }

    #[tokio::test]
    async fn unconfigured_reconciler_explains_and_ignores_sends() {
        let error = lumen_llm::create_backend("nope").err().unwrap();
        let reconciler = StreamReconciler::unconfigured(&error);

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(0).unwrap().role, Role::Assistant);
        assert_eq!(snapshot.get(0).unwrap().text, unconfigured_reply_text(&error));
        assert!(reconciler.banner().is_some());
        assert!(!reconciler.has_session());

        reconciler.send("Hello").await;
        assert_eq!(reconciler.snapshot().len(), 1);
        assert!(!reconciler.is_busy());

        reconciler.dismiss_banner();
        assert!(reconciler.banner().is_none());

        reconciler.new_session();
        assert_eq!(
            reconciler.snapshot().get(0).unwrap().text,
            unconfigured_reply_text(&error)
        );
    }

    #[tokio::test]
    async fn connect_shows_exactly_one_startup_record() {
        let backend = crate::testing::ScriptedBackend::default();
        let config = ProviderConfig::new("scripted", "key", "", "model");
        let reconciler = StreamReconciler::connect(&backend, config, "Welcome!").await;
        let texts = roles_and_texts(&reconciler);
        assert_eq!(texts, vec![(Role::Assistant, "Welcome!".to_string())]);
        assert!(reconciler.banner().is_none());

        let config = ProviderConfig::new("scripted", "", "", "model");
        let reconciler = StreamReconciler::connect(&backend, config, "Welcome!").await;
        let texts = roles_and_texts(&reconciler);
        assert_eq!(texts.len(), 1);
        assert_ne!(texts[0].1, "Welcome!");
        assert!(reconciler.banner().is_some());
    }
}
