use crate::types::{Answer, AnswerId};
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Inserted { index: usize, answer: Answer },
    Updated { index: usize, answer: Answer },
    Removed { index: usize, answer_id: AnswerId },
    /// The answer started or stopped waiting on its source search.
    Searching { answer_id: AnswerId, searching: bool },
    Cleared,
}

/// Single source of truth for in-flight and completed answers.
///
/// Answers are stored newest first. Every mutation rebuilds what it
/// invalidates before returning and publishes a [`StoreChange`] synchronously,
/// so a reader right after the call already sees the new state.
pub struct AnswerStore {
    answers: Vec<Answer>,
    positions: HashMap<AnswerId, usize>,
    first_token_seen: HashSet<AnswerId>,
    searching_sources: HashSet<AnswerId>,
    tx: broadcast::Sender<StoreChange>,
}

impl Default for AnswerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            answers: Vec::new(),
            positions: HashMap::new(),
            first_token_seen: HashSet::new(),
            searching_sources: HashSet::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is fine; the store itself is still authoritative.
        let _ = self.tx.send(change);
    }

    fn rebuild_positions(&mut self) {
        self.positions.clear();
        for (i, answer) in self.answers.iter().enumerate() {
            self.positions.insert(answer.id.clone(), i);
        }
    }

    /// Inserts at `at` (clamped to the list length). An id already present is updated in place.
    pub fn insert(&mut self, answer: Answer, at: usize) -> usize {
        if let Some(existing) = self.index_of(&answer.id) {
            tracing::warn!(
                "[⚙️ ] Answer {} already stored at {}; updating instead of inserting",
                answer.id.short(),
                existing
            );
            self.update(existing, answer);
            return existing;
        }
        let index = at.min(self.answers.len());
        self.answers.insert(index, answer.clone());
        self.rebuild_positions();
        self.publish(StoreChange::Inserted { index, answer });
        index
    }

    /// Newest answers go to the front.
    pub fn push_front(&mut self, answer: Answer) -> usize {
        self.insert(answer, 0)
    }

    /// Replaces the answer at `index`. The identifier at a slot is immutable.
    pub fn update(&mut self, index: usize, answer: Answer) -> bool {
        let slot = match self.answers.get_mut(index) {
            Some(slot) => slot,
            None => {
                tracing::warn!("[⚙️ ] Update at out-of-range index {}", index);
                return false;
            }
        };
        if slot.id != answer.id {
            tracing::error!(
                "[⚙️ ] Refusing to overwrite answer {} with {}",
                slot.id.short(),
                answer.id.short()
            );
            return false;
        }
        *slot = answer.clone();
        self.publish(StoreChange::Updated { index, answer });
        true
    }

    /// Applies `f` to the stored answer and publishes the result.
    pub fn modify<F>(&mut self, answer_id: &AnswerId, f: F) -> bool
    where
        F: FnOnce(&mut Answer),
    {
        let index = match self.index_of(answer_id) {
            Some(i) => i,
            None => return false,
        };
        let mut answer = self.answers[index].clone();
        f(&mut answer);
        answer.id = answer_id.clone();
        self.update(index, answer)
    }

    pub fn append_content(&mut self, answer_id: &AnswerId, fragment: &str) -> bool {
        if fragment.is_empty() {
            return self.index_of(answer_id).is_some();
        }
        self.modify(answer_id, |answer| answer.content.push_str(fragment))
    }

    pub fn remove(&mut self, index: usize) -> Option<Answer> {
        if index >= self.answers.len() {
            return None;
        }
        let removed = self.answers.remove(index);
        self.rebuild_positions();
        self.first_token_seen.remove(&removed.id);
        self.searching_sources.remove(&removed.id);
        self.publish(StoreChange::Removed {
            index,
            answer_id: removed.id.clone(),
        });
        Some(removed)
    }

    pub fn remove_all(&mut self) {
        self.answers.clear();
        self.positions.clear();
        self.first_token_seen.clear();
        self.searching_sources.clear();
        self.publish(StoreChange::Cleared);
    }

    pub fn index_of(&self, answer_id: &AnswerId) -> Option<usize> {
        let index = *self.positions.get(answer_id)?;
        debug_assert_eq!(self.answers.get(index).map(|a| &a.id), Some(answer_id));
        Some(index)
    }

    pub fn get(&self, answer_id: &AnswerId) -> Option<&Answer> {
        self.index_of(answer_id).and_then(|i| self.answers.get(i))
    }

    /// Storage order: newest first.
    pub fn answers(&self) -> &[Answer] {
        &self.answers
    }

    /// Display order: oldest first.
    pub fn chronological(&self) -> impl Iterator<Item = &Answer> {
        self.answers.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Records the first streamed token. Returns true only the first time.
    pub fn mark_first_token(&mut self, answer_id: &AnswerId) -> bool {
        self.first_token_seen.insert(answer_id.clone())
    }

    pub fn has_first_token(&self, answer_id: &AnswerId) -> bool {
        self.first_token_seen.contains(answer_id)
    }

    /// Publishes only when the flag actually flips.
    pub fn set_searching(&mut self, answer_id: &AnswerId, searching: bool) {
        let changed = if searching {
            self.searching_sources.insert(answer_id.clone())
        } else {
            self.searching_sources.remove(answer_id)
        };
        if changed {
            self.publish(StoreChange::Searching {
                answer_id: answer_id.clone(),
                searching,
            });
        }
    }

    pub fn is_searching(&self, answer_id: &AnswerId) -> bool {
        self.searching_sources.contains(answer_id)
    }

    /// Drops per-answer auxiliary flags once the answer stops streaming.
    pub fn release_flags(&mut self, answer_id: &AnswerId) {
        self.first_token_seen.remove(answer_id);
        self.set_searching(answer_id, false);
    }
}
