use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_core::ids::{ConversationId, MessageId, RunId};
use parley_core::store::PersistenceFailure;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingStatus {
    Streaming,
    Completed,
    Errored,
}

/// Run-scoped bookkeeping, written only by the run that owns `run_id`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingState {
    pub run_id: RunId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub chunk_count: u32,
    pub cumulative_length: usize,
    pub last_update: DateTime<Utc>,
    pub status: StreamingStatus,
}

impl StreamingState {
    pub fn is_terminal(&self) -> bool {
        self.status != StreamingStatus::Streaming
    }
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Record progress. A checkpoint with a terminal status closes the run;
    /// stale checkpoints (fewer chunks than already recorded, or arriving
    /// after termination) are ignored.
    async fn checkpoint(&self, state: StreamingState) -> Result<(), PersistenceFailure>;

    async fn purge(&self, run_id: &RunId) -> bool;

    async fn get(&self, run_id: &RunId) -> Option<StreamingState>;

    async fn by_message(&self, message_id: &MessageId) -> Option<StreamingState>;

    async fn for_conversation(&self, conversation_id: &ConversationId) -> Vec<StreamingState>;
}

#[derive(Default)]
pub struct InMemoryEphemeralStore {
    runs: DashMap<RunId, StreamingState>,
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn checkpoint(&self, state: StreamingState) -> Result<(), PersistenceFailure> {
        match self.runs.entry(state.run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_terminal() || current.chunk_count > state.chunk_count {
                    return Ok(());
                }
                slot.insert(state);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        Ok(())
    }

    async fn purge(&self, run_id: &RunId) -> bool {
        self.runs.remove(run_id).is_some()
    }

    async fn get(&self, run_id: &RunId) -> Option<StreamingState> {
        self.runs.get(run_id).map(|s| s.clone())
    }

    async fn by_message(&self, message_id: &MessageId) -> Option<StreamingState> {
        self.runs
            .iter()
            .find(|s| s.message_id == *message_id)
            .map(|s| s.clone())
    }

    async fn for_conversation(&self, conversation_id: &ConversationId) -> Vec<StreamingState> {
        let mut states: Vec<StreamingState> = self
            .runs
            .iter()
            .filter(|s| s.conversation_id == *conversation_id)
            .map(|s| s.clone())
            .collect();
        states.sort_by_key(|s| s.last_update);
        states
    }
}

/// What the live layer believes a conversation holds.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadState {
    pub conversation_id: ConversationId,
    /// Durable count when the thread was first touched by this process.
    pub seeded_count: usize,
    #[serde(skip)]
    observed: HashSet<MessageId>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip)]
    touched: Instant,
}

impl ThreadState {
    pub fn message_count(&self) -> usize {
        self.seeded_count + self.observed.len()
    }

    pub fn observed_count(&self) -> usize {
        self.observed.len()
    }
}

/// Per-conversation thread states, keyed by conversation.
#[derive(Default)]
pub struct ThreadStates {
    threads: DashMap<ConversationId, ThreadState>,
}

impl ThreadStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self, conversation_id: &ConversationId) -> bool {
        self.threads.contains_key(conversation_id)
    }

    /// First seed wins; later calls are no-ops.
    pub fn seed(&self, conversation_id: &ConversationId, durable_count: usize) {
        self.threads
            .entry(conversation_id.clone())
            .or_insert_with(|| ThreadState {
                conversation_id: conversation_id.clone(),
                seeded_count: durable_count,
                observed: HashSet::new(),
                last_activity: Utc::now(),
                touched: Instant::now(),
            });
    }

    /// Count a message the live layer has committed to. Repeats are ignored.
    pub fn observe(&self, conversation_id: &ConversationId, message_id: &MessageId) {
        let mut thread = self
            .threads
            .entry(conversation_id.clone())
            .or_insert_with(|| ThreadState {
                conversation_id: conversation_id.clone(),
                seeded_count: 0,
                observed: HashSet::new(),
                last_activity: Utc::now(),
                touched: Instant::now(),
            });
        thread.observed.insert(message_id.clone());
        thread.last_activity = Utc::now();
        thread.touched = Instant::now();
    }

    pub fn remove(&self, conversation_id: &ConversationId) -> bool {
        self.threads.remove(conversation_id).is_some()
    }

    /// Drop a thread untouched for at least `idle`. The next touch reseeds
    /// it from the durable count.
    pub fn remove_idle(&self, conversation_id: &ConversationId, idle: Duration) -> bool {
        self.threads
            .remove_if(conversation_id, |_, t| t.touched.elapsed() >= idle)
            .is_some()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<ThreadState> {
        self.threads.get(conversation_id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(run: &str, chunks: u32) -> StreamingState {
        StreamingState {
            run_id: RunId::from_raw(run),
            message_id: MessageId::from_raw(format!("msg-{run}")),
            conversation_id: ConversationId::from_raw("c1"),
            chunk_count: chunks,
            cumulative_length: chunks as usize * 3,
            last_update: Utc::now(),
            status: StreamingStatus::Streaming,
        }
    }

    #[tokio::test]
    async fn checkpoints_are_monotonic() {
        let store = InMemoryEphemeralStore::new();
        store.checkpoint(state("r1", 8)).await.unwrap();
        store.checkpoint(state("r1", 4)).await.unwrap();
        assert_eq!(store.get(&RunId::from_raw("r1")).await.unwrap().chunk_count, 8);

        store.checkpoint(state("r1", 16)).await.unwrap();
        assert_eq!(store.get(&RunId::from_raw("r1")).await.unwrap().chunk_count, 16);
    }

    #[tokio::test]
    async fn finished_runs_ignore_late_checkpoints() {
        let store = InMemoryEphemeralStore::new();
        let mut done = state("r1", 3);
        done.status = StreamingStatus::Completed;
        store.checkpoint(state("r1", 2)).await.unwrap();
        store.checkpoint(done).await.unwrap();
        store.checkpoint(state("r1", 9)).await.unwrap();

        let s = store.get(&RunId::from_raw("r1")).await.unwrap();
        assert_eq!(s.status, StreamingStatus::Completed);
        assert_eq!(s.chunk_count, 3);
    }

    #[tokio::test]
    async fn lookup_by_message_and_conversation() {
        let store = InMemoryEphemeralStore::new();
        store.checkpoint(state("r1", 1)).await.unwrap();
        store.checkpoint(state("r2", 1)).await.unwrap();

        assert!(store.by_message(&MessageId::from_raw("msg-r2")).await.is_some());
        assert_eq!(store.for_conversation(&ConversationId::from_raw("c1")).await.len(), 2);
        assert!(store.purge(&RunId::from_raw("r1")).await);
        assert!(!store.purge(&RunId::from_raw("r1")).await);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn thread_counts_seed_plus_observed() {
        let threads = ThreadStates::new();
        let conv = ConversationId::from_raw("c1");
        threads.seed(&conv, 4);
        threads.seed(&conv, 100);
        threads.observe(&conv, &MessageId::from_raw("m1"));
        threads.observe(&conv, &MessageId::from_raw("m1"));
        threads.observe(&conv, &MessageId::from_raw("a1"));

        let t = threads.get(&conv).unwrap();
        assert_eq!(t.seeded_count, 4);
        assert_eq!(t.message_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_threads_are_removed() {
        let threads = ThreadStates::new();
        let conv = ConversationId::from_raw("c1");
        threads.seed(&conv, 2);
        threads.observe(&conv, &MessageId::from_raw("m1"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!threads.remove_idle(&conv, Duration::from_secs(5)));
        threads.observe(&conv, &MessageId::from_raw("a1"));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!threads.remove_idle(&conv, Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(threads.remove_idle(&conv, Duration::from_secs(5)));
        assert!(threads.is_empty());
        assert!(!threads.remove_idle(&conv, Duration::from_secs(5)));
    }
}
