//! Scripted conversation backends for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use lumen_llm::{
    BoxFuture, ConversationBackend, ConversationSession, Fragment, FragmentStream,
    InitializationError, InitializationResult, ProviderConfig, StreamError, StreamResult,
};
use tokio::sync::mpsc;

type Observer = Arc<dyn Fn() + Send + Sync>;

enum Reply {
    Items(Vec<StreamResult<Fragment>>),
    OpenFailure(String),
    Channel(mpsc::UnboundedReceiver<StreamResult<Fragment>>),
    Observed {
        fragments: Vec<String>,
        observer: Observer,
    },
}

/// Session that answers each prompt with the next queued reply.
#[derive(Default)]
pub(crate) struct ScriptedSession {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    clears: AtomicUsize,
}

impl ScriptedSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_fragments(&self, texts: &[&str]) {
        let items = texts.iter().map(|text| Ok(Fragment::new(*text))).collect();
        self.push(Reply::Items(items));
    }

    pub(crate) fn push_failure_after(&self, texts: &[&str], description: &str) {
        let mut items = texts
            .iter()
            .map(|text| Ok(Fragment::new(*text)))
            .collect::<Vec<_>>();
        items.push(Err(StreamError::backend("scripted-stream", description)));
        self.push(Reply::Items(items));
    }

    pub(crate) fn push_open_failure(&self, description: &str) {
        self.push(Reply::OpenFailure(description.to_string()));
    }

    /// Queues a reply fed by hand; dropping the sender ends the stream.
    pub(crate) fn push_channel(&self) -> mpsc::UnboundedSender<StreamResult<Fragment>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Reply::Channel(rx));
        tx
    }

    /// Queues a reply that calls `observer` each time the next fragment is
    /// pulled, and once more when the consumer sees the end of the stream.
    pub(crate) fn push_observed(
        &self,
        texts: &[&str],
        observer: impl Fn() + Send + Sync + 'static,
    ) {
        self.push(Reply::Observed {
            fragments: texts.iter().map(|text| (*text).to_string()).collect(),
            observer: Arc::new(observer),
        });
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn into_stream(reply: Reply) -> StreamResult<FragmentStream> {
        match reply {
            Reply::Items(items) => Ok(futures::stream::iter(items).boxed()),
            Reply::OpenFailure(description) => {
                Err(StreamError::backend("scripted-open", description))
            }
            Reply::Channel(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                let item = rx.recv().await?;
                Some((item, rx))
            })
            .boxed()),
            Reply::Observed {
                fragments,
                observer,
            } => {
                let queue = fragments.into_iter().collect::<VecDeque<_>>();
                Ok(
                    futures::stream::unfold((queue, observer), |(mut queue, observer)| async move {
                        observer();
                        let text = queue.pop_front()?;
                        Some((Ok(Fragment::new(text)), (queue, observer)))
                    })
                    .boxed(),
                )
            }
        }
    }
}

impl ConversationSession for ScriptedSession {
    fn stream_reply<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, StreamResult<FragmentStream>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(reply) => Self::into_stream(reply),
                None => Err(StreamError::backend("scripted-session", "no scripted reply")),
            }
        })
    }

    fn clear_history(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend that opens a fresh `ScriptedSession` unless the API key is blank.
#[derive(Default)]
pub(crate) struct ScriptedBackend;

impl ConversationBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn open_session<'a>(
        &'a self,
        config: ProviderConfig,
    ) -> BoxFuture<'a, InitializationResult<Arc<dyn ConversationSession>>> {
        Box::pin(async move {
            if config.api_key.is_empty() {
                return Err(InitializationError::MissingApiKey {
                    stage: "scripted-open-session",
                    provider_id: config.provider_id,
                });
            }
            let session: Arc<dyn ConversationSession> = ScriptedSession::new();
            Ok(session)
        })
    }
}
