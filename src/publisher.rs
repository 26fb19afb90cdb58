//! Per-conversation side channel. Any collaborator can push events into a
//! currently-streaming conversation by id, without holding a reference to
//! the stream itself. The orchestrator owns the registry entries: it
//! registers at stream start and removes exactly once at teardown.

use crate::types::{ChatEvent, SearchResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub struct EventPublisher {
    capacity: usize,
    senders: Mutex<HashMap<i64, mpsc::Sender<ChatEvent>>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Open a side channel for the conversation and hand back its receiving
    /// end. A second registration for the same id silently replaces the
    /// first; the replaced receiver observes end-of-stream.
    pub fn register(&self, conversation_id: i64) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let previous = match self.senders.lock() {
            Ok(mut senders) => senders.insert(conversation_id, tx),
            Err(poisoned) => poisoned.into_inner().insert(conversation_id, tx),
        };
        if previous.is_some() {
            tracing::warn!(
                "side channel for conversation {} replaced by a newer stream",
                conversation_id
            );
        }
        rx
    }

    /// Close the conversation's side channel. Safe to call for ids that were
    /// already removed or replaced.
    pub fn remove(&self, conversation_id: i64) {
        let removed = match self.senders.lock() {
            Ok(mut senders) => senders.remove(&conversation_id),
            Err(poisoned) => poisoned.into_inner().remove(&conversation_id),
        };
        if removed.is_some() {
            tracing::debug!("side channel removed for conversation {}", conversation_id);
        }
    }

    /// Push an event into the conversation's in-flight stream. Events for
    /// conversations without an open stream are dropped.
    pub async fn publish(&self, conversation_id: i64, event: ChatEvent) -> bool {
        let sender = {
            match self.senders.lock() {
                Ok(senders) => senders.get(&conversation_id).cloned(),
                Err(poisoned) => poisoned.into_inner().get(&conversation_id).cloned(),
            }
        };
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => {
                tracing::trace!(
                    "dropping side event for conversation {} with no open stream",
                    conversation_id
                );
                false
            }
        }
    }

    pub async fn publish_search_status(&self, conversation_id: i64, status: &str) {
        self.publish(conversation_id, ChatEvent::search(status)).await;
    }

    pub async fn publish_search_results(&self, conversation_id: i64, results: Vec<SearchResult>) {
        if results.is_empty() {
            return;
        }
        self.publish(conversation_id, ChatEvent::search_results(results))
            .await;
    }
}
