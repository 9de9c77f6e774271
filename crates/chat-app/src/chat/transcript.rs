use std::ops::Deref;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::chat::message::{MessageId, MessageRecord};

type Records = Vec<Arc<MessageRecord>>;

/// Immutable, ordered view of the transcript at one point in time.
#[derive(Debug, Clone)]
pub struct TranscriptSnapshot {
    records: Arc<Records>,
}

impl TranscriptSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageRecord> {
        self.records.iter().map(Deref::deref)
    }

    pub fn get(&self, index: usize) -> Option<&MessageRecord> {
        self.records.get(index).map(Deref::deref)
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last().map(Deref::deref)
    }

    pub fn find(&self, id: MessageId) -> Option<&MessageRecord> {
        self.iter().find(|record| record.id == id)
    }

    pub fn to_vec(&self) -> Vec<MessageRecord> {
        self.iter().cloned().collect()
    }
}

/// Append-only message log shared between the reconciler and render observers.
///
/// Every mutation swaps in a new immutable sequence, so readers always see a
/// whole record either before or after a change.
pub struct TranscriptStore {
    records: ArcSwap<Records>,
    revision: watch::Sender<u64>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            records: ArcSwap::from_pointee(Vec::new()),
            revision,
        }
    }

    pub fn with_seed(seed: MessageRecord) -> Self {
        let store = Self::new();
        store.reset(seed);
        store
    }

    pub fn append(&self, record: MessageRecord) {
        let record = Arc::new(record);
        self.records.rcu(|records| {
            let mut next = Records::with_capacity(records.len() + 1);
            next.extend(records.iter().cloned());
            next.push(Arc::clone(&record));
            next
        });
        self.publish();
    }

    /// Replaces the text of record `id`. Returns whether the record was found.
    ///
    /// A missing id is not an error: it means the record was dropped by a reset
    /// while its exchange was still streaming.
    pub fn replace_text(&self, id: MessageId, text: impl Into<String>) -> bool {
        let text = text.into();
        let mut found = false;

        self.records.rcu(|records| {
            let Some(index) = records.iter().position(|record| record.id == id) else {
                found = false;
                return Arc::clone(records);
            };

            found = true;
            let mut next = Records::clone(records);
            next[index] = Arc::new(next[index].with_text(text.as_str()));
            Arc::new(next)
        });

        if found {
            self.publish();
        } else {
            tracing::debug!(
                record_id = %id,
                "dropping text update for a record no longer in the transcript"
            );
        }
        found
    }

    /// Replaces the whole transcript with exactly one record.
    pub fn reset(&self, seed: MessageRecord) {
        self.records.store(Arc::new(vec![Arc::new(seed)]));
        self.publish();
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            records: self.records.load_full(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.load().is_empty()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Returns a receiver that is marked changed after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn publish(&self) {
        self.revision
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}
