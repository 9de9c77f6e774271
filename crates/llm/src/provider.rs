use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use snafu::Snafu;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model_id: model_id.into().trim().to_string(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        self.preamble = if preamble.trim().is_empty() {
            None
        } else {
            Some(preamble)
        };
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Speaker of one remembered turn in a provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One unit of streamed reply text. Providers may emit empty fragments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    pub text: String,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type InitializationResult<T> = Result<T, InitializationError>;
pub type StreamResult<T> = Result<T, StreamError>;

/// Lazy, finite, non-restartable sequence of reply fragments.
///
/// The sequence either ends normally after zero or more fragments, or yields
/// exactly one `Err` as its last item.
pub type FragmentStream = BoxStream<'static, StreamResult<Fragment>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitializationError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("no model configured for provider '{provider_id}'"))]
    MissingModel {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("cannot stream a reply to an empty prompt"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider stream ended before a terminal event"))]
    WorkerGone { stage: &'static str },
    #[snafu(display("{description}"))]
    Backend {
        stage: &'static str,
        description: String,
    },
}

impl StreamError {
    /// Builds a failure from a free-form description, for backends that do not
    /// go through rig.
    pub fn backend(stage: &'static str, description: impl Into<String>) -> Self {
        BackendSnafu {
            stage,
            description: description.into(),
        }
        .build()
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::EmptyPrompt { stage }
            | Self::CompletionsFailed { stage, .. }
            | Self::WorkerGone { stage }
            | Self::Backend { stage, .. } => *stage,
        }
    }
}

/// An open conversation with a generative-text backend.
pub trait ConversationSession: Send + Sync {
    /// Opens a streamed reply to `prompt`, continuing the session's history.
    fn stream_reply<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, StreamResult<FragmentStream>>;

    /// Forgets every remembered turn. Replies still in flight must not write
    /// their turns back afterwards.
    fn clear_history(&self);
}

pub trait ConversationBackend: Send + Sync {
    fn id(&self) -> &str;
    fn open_session<'a>(
        &'a self,
        config: ProviderConfig,
    ) -> BoxFuture<'a, InitializationResult<Arc<dyn ConversationSession>>>;
}
