//! Turn ledger: remembers client-supplied message ids so a resent
//! `send-message` is answered from the ledger instead of starting a second run.
//! Ids are scoped to the sending user; one user's id never matches another's.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_core::ids::{MessageId, RunId, UserId};
use parley_core::messages::TurnMessage;

#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub content: String,
    /// Set once the user message is durable and the run is spawned.
    pub accepted: Option<TurnMessage>,
    pub run_id: Option<RunId>,
    pub finished: bool,
    recorded_at: Instant,
}

#[derive(Debug)]
pub enum Reservation {
    /// First sighting; the caller now owns this turn id.
    Fresh,
    /// Same id and content as an earlier send.
    Duplicate(LedgerEntry),
    /// Same id, different content.
    Conflict,
}

type TurnKey = (UserId, MessageId);

#[derive(Default)]
pub struct TurnLedger {
    turns: DashMap<TurnKey, LedgerEntry>,
}

fn key(user: &UserId, id: &MessageId) -> TurnKey {
    (user.clone(), id.clone())
}

impl TurnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, user: &UserId, id: &MessageId, content: &str) -> Reservation {
        match self.turns.entry(key(user, id)) {
            Entry::Occupied(slot) if slot.get().content == content => Reservation::Duplicate(slot.get().clone()),
            Entry::Occupied(_) => Reservation::Conflict,
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    content: content.to_string(),
                    accepted: None,
                    run_id: None,
                    finished: false,
                    recorded_at: Instant::now(),
                });
                Reservation::Fresh
            }
        }
    }

    /// Forget a reservation whose turn was rejected, so the client may retry.
    pub fn release(&self, user: &UserId, id: &MessageId) {
        self.turns.remove_if(&key(user, id), |_, entry| entry.accepted.is_none());
    }

    pub fn accept(&self, user: &UserId, id: &MessageId, message: TurnMessage, run_id: RunId) {
        if let Some(mut entry) = self.turns.get_mut(&key(user, id)) {
            entry.accepted = Some(message);
            entry.run_id = Some(run_id);
        }
    }

    pub fn finish(&self, user: &UserId, id: &MessageId) {
        if let Some(mut entry) = self.turns.get_mut(&key(user, id)) {
            entry.finished = true;
        }
    }

    pub fn get(&self, user: &UserId, id: &MessageId) -> Option<LedgerEntry> {
        self.turns.get(&key(user, id)).map(|e| e.clone())
    }

    /// Drop finished turns older than `max_age`. Older duplicates are still
    /// caught by the durable store lookup.
    pub fn prune(&self, max_age: Duration) -> usize {
        let before = self.turns.len();
        self.turns
            .retain(|_, entry| !(entry.finished && entry.recorded_at.elapsed() >= max_age));
        before - self.turns.len()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
