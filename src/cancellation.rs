use crate::types::AnswerId;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One live cancellation token per answer id.
///
/// A token is issued when a query starts and removed (and cancelled) when the
/// query is cancelled, completes, or fails. Events for an answer without a live
/// token are stale and must be dropped.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: HashMap<AnswerId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh token, cancelling any token the answer id held before.
    pub fn issue(&mut self, answer_id: &AnswerId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.tokens.insert(answer_id.clone(), token.clone()) {
            tracing::debug!("[⚙️ ] Superseding live token for {}", answer_id.short());
            previous.cancel();
        }
        token
    }

    pub fn is_live(&self, answer_id: &AnswerId) -> bool {
        self.tokens
            .get(answer_id)
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Cancels and forgets the answer's token. Returns whether one was live.
    pub fn revoke(&mut self, answer_id: &AnswerId) -> bool {
        match self.tokens.remove(answer_id) {
            Some(token) => {
                let was_live = !token.is_cancelled();
                token.cancel();
                was_live
            }
            None => false,
        }
    }

    pub fn live_ids(&self) -> Vec<AnswerId> {
        self.tokens
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn revoke_all(&mut self) {
        for (_, token) in self.tokens.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_revoke() {
        let mut registry = CancellationRegistry::new();
        let id = AnswerId::from("a");
        let token = registry.issue(&id);
        assert!(registry.is_live(&id));

        assert!(registry.revoke(&id));
        assert!(token.is_cancelled());
        assert!(!registry.is_live(&id));
        assert!(!registry.revoke(&id));
    }

    #[test]
    fn test_reissue_cancels_previous_token() {
        let mut registry = CancellationRegistry::new();
        let id = AnswerId::from("a");
        let first = registry.issue(&id);
        let second = registry.issue(&id);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(registry.is_live(&id));
    }
}
