/// Domain entities and the deterministic exchange state machine.
pub mod message;
/// Drives streamed replies into the transcript.
pub mod reconciler;
pub mod transcript;

pub use message::{
    ExchangeState, ExchangeTransition, ExchangeTransitionRejection, ExchangeTransitionResult,
    MessageId, MessageRecord, Role,
};
pub use reconciler::{
    DEFAULT_WELCOME_MESSAGE, StreamReconciler, failure_reply_text, unconfigured_reply_text,
};
pub use transcript::{TranscriptSnapshot, TranscriptStore};
