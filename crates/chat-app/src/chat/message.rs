use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Stable identifier for one transcript record.
///
/// Backed by UUIDv7, so ids minted later compare greater within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub created_at_unix_millis: u64,
}

impl MessageRecord {
    /// Creates a record with a freshly minted id and creation time.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            text: text.into(),
            created_at_unix_millis: current_unix_timestamp_millis(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Creates the empty assistant record that a reply streams into.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new())
    }

    /// Returns a copy carrying `text`; identity and creation time are kept.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            id: self.id,
            role: self.role,
            text: text.into(),
            created_at_unix_millis: self.created_at_unix_millis,
        }
    }
}

/// Lifecycle of the single request/response exchange a chat session may run.
///
/// Every state except `Idle` holds the id of the assistant record being filled,
/// so "busy" and "has an active record" can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending(MessageId),
    Streaming(MessageId),
    Completed(MessageId),
    Failed {
        record_id: MessageId,
        message: String,
    },
}

/// State transition input for the exchange lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransition {
    Start(MessageId),
    Receive(MessageId),
    Complete(MessageId),
    Fail {
        record_id: MessageId,
        message: String,
    },
    Release,
}

/// Rejection reason for illegal exchange transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransitionRejection {
    AlreadyBusy {
        active: MessageId,
        attempted: MessageId,
    },
    NoActiveExchange,
    RecordMismatch {
        active: MessageId,
        attempted: MessageId,
    },
    AlreadySettled(MessageId),
}

pub type ExchangeTransitionResult = Result<ExchangeState, ExchangeTransitionRejection>;

impl ExchangeState {
    /// Returns the record receiving streamed text, or `None` when idle.
    pub fn active_record_id(&self) -> Option<MessageId> {
        match self {
            Self::Idle => None,
            Self::Sending(record_id) | Self::Streaming(record_id) | Self::Completed(record_id) => {
                Some(*record_id)
            }
            Self::Failed { record_id, .. } => Some(*record_id),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_record_id().is_some()
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` may start an exchange. `Release` always returns to `Idle` so
    /// cleanup can never be refused.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Start(record_id) => self.apply_start(record_id),
            ExchangeTransition::Receive(record_id) => self.apply_receive(record_id),
            ExchangeTransition::Complete(record_id) => self.apply_complete(record_id),
            ExchangeTransition::Fail { record_id, message } => self.apply_fail(record_id, message),
            ExchangeTransition::Release => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, record_id: MessageId) -> ExchangeTransitionResult {
        match self.active_record_id() {
            None => Ok(Self::Sending(record_id)),
            Some(active) => Err(ExchangeTransitionRejection::AlreadyBusy {
                active,
                attempted: record_id,
            }),
        }
    }

    fn apply_receive(&self, record_id: MessageId) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == record_id => {
                Ok(Self::Streaming(record_id))
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::RecordMismatch {
                    active: *active,
                    attempted: record_id,
                })
            }
            Self::Completed(active) | Self::Failed { record_id: active, .. } => {
                Err(ExchangeTransitionRejection::AlreadySettled(*active))
            }
            Self::Idle => Err(ExchangeTransitionRejection::NoActiveExchange),
        }
    }

    fn apply_complete(&self, record_id: MessageId) -> ExchangeTransitionResult {
        match self {
            Self::Streaming(active) if *active == record_id => Ok(Self::Completed(record_id)),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::RecordMismatch {
                    active: *active,
                    attempted: record_id,
                })
            }
            Self::Completed(active) | Self::Failed { record_id: active, .. } => {
                Err(ExchangeTransitionRejection::AlreadySettled(*active))
            }
            Self::Idle => Err(ExchangeTransitionRejection::NoActiveExchange),
        }
    }

    fn apply_fail(&self, record_id: MessageId, message: String) -> ExchangeTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == record_id => {
                Ok(Self::Failed { record_id, message })
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(ExchangeTransitionRejection::RecordMismatch {
                    active: *active,
                    attempted: record_id,
                })
            }
            Self::Completed(active) | Self::Failed { record_id: active, .. } => {
                Err(ExchangeTransitionRejection::AlreadySettled(*active))
            }
            Self::Idle => Err(ExchangeTransitionRejection::NoActiveExchange),
        }
    }
}

fn current_unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
