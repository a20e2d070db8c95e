use crate::cancellation::CancellationRegistry;
use crate::ingress::EventKind;
use crate::types::AnswerId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Process,
    Duplicate,
    Stale,
}

/// Guarantees each (kind, sequence) pair is applied at most once per answer.
///
/// Decisions take `&mut self`, so the owner serializes them; partitions are
/// keyed by answer id and never interfere with each other.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    seen: HashMap<AnswerId, HashSet<(EventKind, u64)>>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new query for `answer_id`; sequence numbers restart from scratch.
    pub fn reset(&mut self, answer_id: &AnswerId) {
        self.seen.insert(answer_id.clone(), HashSet::new());
    }

    pub fn admit(
        &mut self,
        sequence: u64,
        kind: EventKind,
        answer_id: &AnswerId,
        tokens: &CancellationRegistry,
    ) -> Admission {
        if !tokens.is_live(answer_id) {
            return Admission::Stale;
        }
        let seen = self.seen.entry(answer_id.clone()).or_default();
        if seen.insert((kind, sequence)) {
            Admission::Process
        } else {
            Admission::Duplicate
        }
    }

    pub fn should_process(
        &mut self,
        sequence: u64,
        kind: EventKind,
        answer_id: &AnswerId,
        tokens: &CancellationRegistry,
    ) -> bool {
        self.admit(sequence, kind, answer_id, tokens) == Admission::Process
    }

    pub fn release(&mut self, answer_id: &AnswerId) {
        self.seen.remove(answer_id);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn tracked_answers(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sequence_is_rejected() {
        let mut tokens = CancellationRegistry::new();
        let mut tracker = SequenceTracker::new();
        let id = AnswerId::from("a");
        tokens.issue(&id);
        tracker.reset(&id);

        assert!(tracker.should_process(1, EventKind::Token, &id, &tokens));
        assert!(!tracker.should_process(1, EventKind::Token, &id, &tokens));
        // Same sequence under a different kind is a different event.
        assert!(tracker.should_process(1, EventKind::RoundStarted, &id, &tokens));
    }

    #[test]
    fn test_events_without_live_token_are_stale() {
        let mut tokens = CancellationRegistry::new();
        let mut tracker = SequenceTracker::new();
        let id = AnswerId::from("a");
        assert_eq!(tracker.admit(1, EventKind::Token, &id, &tokens), Admission::Stale);

        tokens.issue(&id);
        tracker.reset(&id);
        assert_eq!(tracker.admit(1, EventKind::Token, &id, &tokens), Admission::Process);
        tokens.revoke(&id);
        assert_eq!(tracker.admit(2, EventKind::Token, &id, &tokens), Admission::Stale);
    }

    #[test]
    fn test_reset_allows_sequences_to_restart() {
        let mut tokens = CancellationRegistry::new();
        let mut tracker = SequenceTracker::new();
        let id = AnswerId::from("a");
        tokens.issue(&id);
        tracker.reset(&id);
        assert!(tracker.should_process(1, EventKind::Token, &id, &tokens));

        tracker.reset(&id);
        assert!(tracker.should_process(1, EventKind::Token, &id, &tokens));

        tracker.release(&id);
        assert_eq!(tracker.tracked_answers(), 0);
    }
}
