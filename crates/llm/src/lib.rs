use std::sync::Arc;

use snafu::OptionExt;

mod provider;
mod rig_adapter;

pub use provider::{
    BoxFuture, ConversationBackend, ConversationSession, DEFAULT_OPENAI_MODEL, Fragment,
    FragmentStream, InitializationError, InitializationResult, ProviderConfig, ProviderMessage,
    Role, StreamError, StreamResult,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigBackend, RigSession};

pub fn create_backend(provider_id: &str) -> InitializationResult<Arc<dyn ConversationBackend>> {
    let provider_id = provider_id.trim();
    let backend: Option<Arc<dyn ConversationBackend>> = match provider_id {
        "" | "openai" | "rig-openai" => Some(Arc::new(RigBackend::new())),
        _ => None,
    };

    backend.context(provider::UnsupportedProviderSnafu {
        stage: "create-backend",
        provider_id,
    })
}
