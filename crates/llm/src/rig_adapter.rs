use std::sync::{Arc, Mutex, PoisonError};

use futures::{Stream, StreamExt};
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use super::provider::{
    BoxFuture, CompletionsFailedSnafu, ConversationBackend, ConversationSession, EmptyPromptSnafu,
    Fragment, FragmentStream, HttpClientSnafu, InitializationResult, MissingApiKeySnafu,
    MissingModelSnafu, ProviderConfig, ProviderMessage, Role, StreamError, StreamResult,
    WorkerGoneSnafu,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Backend that opens chat sessions against an OpenAI-compatible endpoint via rig.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigBackend;

impl RigBackend {
    pub fn new() -> Self {
        Self
    }

    fn build_client(config: &ProviderConfig) -> InitializationResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }
}

impl ConversationBackend for RigBackend {
    fn id(&self) -> &str {
        RIG_OPENAI_PROVIDER_ID
    }

    fn open_session<'a>(
        &'a self,
        config: ProviderConfig,
    ) -> BoxFuture<'a, InitializationResult<Arc<dyn ConversationSession>>> {
        Box::pin(async move {
            ensure!(
                !config.api_key.is_empty(),
                MissingApiKeySnafu {
                    stage: "open-session",
                    provider_id: config.provider_id.clone(),
                }
            );
            ensure!(
                !config.model_id.is_empty(),
                MissingModelSnafu {
                    stage: "open-session",
                    provider_id: config.provider_id.clone(),
                }
            );

            let client = Self::build_client(&config)?;
            tracing::info!(
                provider_id = %config.provider_id,
                model_id = %config.model_id,
                "opened provider session"
            );

            let session: Arc<dyn ConversationSession> = Arc::new(RigSession::new(config, client));
            Ok(session)
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionHistory {
    // Bumped on every clear so replies opened before it cannot write back.
    epoch: u64,
    messages: Vec<ProviderMessage>,
}

/// Pending write of one finished exchange into the session history.
#[derive(Debug)]
pub(crate) struct HistoryCommit {
    history: Arc<Mutex<SessionHistory>>,
    epoch: u64,
    prompt: String,
}

impl HistoryCommit {
    pub(crate) fn begin(
        history: &Arc<Mutex<SessionHistory>>,
        prompt: &str,
    ) -> (Self, Vec<ProviderMessage>) {
        let guard = history.lock().unwrap_or_else(PoisonError::into_inner);
        let commit = Self {
            history: Arc::clone(history),
            epoch: guard.epoch,
            prompt: prompt.to_string(),
        };
        (commit, guard.messages.clone())
    }

    pub(crate) fn apply(self, reply: String) {
        let mut guard = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.epoch != self.epoch {
            tracing::debug!(
                opened_epoch = self.epoch,
                current_epoch = guard.epoch,
                "discarding reply from a cleared session history"
            );
            return;
        }

        guard.messages.push(ProviderMessage::new(Role::User, self.prompt));
        guard.messages.push(ProviderMessage::new(Role::Assistant, reply));
    }
}

pub(crate) fn clear_history(history: &Mutex<SessionHistory>) {
    let mut guard = history.lock().unwrap_or_else(PoisonError::into_inner);
    guard.epoch = guard.epoch.wrapping_add(1);
    guard.messages.clear();
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Fragment(Fragment),
    Done,
    Failed(StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    Completed,
    Failed,
    ConsumerGone,
}

/// Adapts the worker channel into a pull-based fragment stream.
///
/// A channel that closes without `Done` or `Failed` surfaces as a `WorkerGone` error.
pub(crate) fn worker_event_stream(events: mpsc::UnboundedReceiver<WorkerEvent>) -> FragmentStream {
    futures::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        match events.recv().await {
            Some(WorkerEvent::Fragment(fragment)) => Some((Ok(fragment), Some(events))),
            Some(WorkerEvent::Failed(error)) => Some((Err(error), None)),
            Some(WorkerEvent::Done) => None,
            None => Some((
                WorkerGoneSnafu {
                    stage: "worker-event-stream",
                }
                .fail(),
                None,
            )),
        }
    })
    .boxed()
}

pub struct RigSession {
    config: ProviderConfig,
    client: openai::Client,
    history: Arc<Mutex<SessionHistory>>,
}

impl RigSession {
    fn new(config: ProviderConfig, client: openai::Client) -> Self {
        Self {
            config,
            client,
            history: Arc::new(Mutex::new(SessionHistory::default())),
        }
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    async fn open_stream(
        &self,
        history: &[ProviderMessage],
        prompt: &str,
    ) -> StreamResult<RigStreamingResponse> {
        let model = self.client.completion_model(self.config.model_id.clone());
        let messages = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        tracing::debug!(
            model_id = %self.config.model_id,
            history_len = messages.len(),
            "opening provider stream"
        );

        let mut builder = model
            .completion_request(RigMessage::user(prompt.to_string()))
            .messages(messages);

        if let Some(preamble) = &self.config.preamble {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = self.config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = self.config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<Fragment>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(Fragment::new(text.text)),
            // Only visible answer text reaches the transcript.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        mut stream: RigStreamingResponse,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
        commit: HistoryCommit,
    ) {
        if Self::pump_stream(&mut stream, &event_tx, commit).await == WorkerExit::ConsumerGone {
            stream.cancel();
        }
    }

    /// Forwards provider items as worker events until the stream settles or the
    /// consumer goes away. Only a completed reply is committed to history.
    async fn pump_stream<S, R>(
        stream: &mut S,
        event_tx: &mpsc::UnboundedSender<WorkerEvent>,
        commit: HistoryCommit,
    ) -> WorkerExit
    where
        S: Stream<Item = Result<StreamedAssistantContent<R>, CompletionError>> + Unpin,
        R: Clone + Unpin,
    {
        let mut reply = String::new();

        loop {
            tokio::select! {
                _ = event_tx.closed() => {
                    tracing::debug!("fragment stream dropped, cancelling provider stream");
                    return WorkerExit::ConsumerGone;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(fragment) = Self::map_stream_item(item) else {
                                continue;
                            };
                            reply.push_str(&fragment.text);
                            if event_tx.send(WorkerEvent::Fragment(fragment)).is_err() {
                                return WorkerExit::ConsumerGone;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = StreamError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            let _ = event_tx.send(WorkerEvent::Failed(error));
                            return WorkerExit::Failed;
                        }
                        None => break,
                    }
                }
            }
        }

        commit.apply(reply);
        let _ = event_tx.send(WorkerEvent::Done);
        WorkerExit::Completed
    }
}

impl ConversationSession for RigSession {
    fn stream_reply<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, StreamResult<FragmentStream>> {
        Box::pin(async move {
            let prompt = prompt.trim();
            ensure!(
                !prompt.is_empty(),
                EmptyPromptSnafu {
                    stage: "stream-reply"
                }
            );

            let (commit, history) = HistoryCommit::begin(&self.history, prompt);
            let stream = match self.open_stream(&history, prompt).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        provider_id = %self.config.provider_id,
                        model_id = %self.config.model_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    return Err(error);
                }
            };

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::run_stream_worker(stream, event_tx, commit));
            Ok(worker_event_stream(event_rx))
        })
    }

    fn clear_history(&self) {
        clear_history(&self.history);
        tracing::debug!(provider_id = %self.config.provider_id, "cleared session history");
    }
}
