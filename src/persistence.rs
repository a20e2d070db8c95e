//! Persistence boundary.
//!
//! The engine only ever talks to storage through [`ResearchStore`]. The SQLite
//! implementation lives in [`crate::db`]; [`MemoryStore`] backs tests and
//! ephemeral runs.

use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[async_trait]
pub trait ResearchStore: Send + Sync {
    /// Inserts or replaces an answer by id.
    async fn save(&self, answer: &Answer) -> Result<()>;

    /// All stored answers, newest first.
    async fn load_all(&self) -> Result<Vec<Answer>>;

    async fn delete_all(&self) -> Result<()>;

    /// Inserts or replaces a session including its messages.
    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn append_message(&self, session_id: &SessionId, message: &SessionMessage) -> Result<()>;

    async fn end_session(
        &self,
        session_id: &SessionId,
        metadata: Option<SessionMetadata>,
    ) -> Result<()>;

    async fn load_session(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// Sessions for a user, most recently active first.
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>>;

    async fn set_active_session(&self, session_id: Option<&SessionId>) -> Result<()>;

    async fn active_session_id(&self) -> Result<Option<SessionId>>;

    /// Records (or clears) the moment the app was gracefully suspended.
    async fn record_suspension(&self, at: Option<DateTime<Utc>>) -> Result<()>;

    async fn suspension(&self) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Default)]
struct MemoryState {
    answers: Vec<Answer>,
    sessions: HashMap<SessionId, Session>,
    active_session: Option<SessionId>,
    suspended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail, for exercising persistence-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(DelveError::internal("memory store is read-only").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ResearchStore for MemoryStore {
    async fn save(&self, answer: &Answer) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        match state.answers.iter_mut().find(|a| a.id == answer.id) {
            Some(existing) => *existing = answer.clone(),
            None => state.answers.push(answer.clone()),
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Answer>> {
        let state = self.state.lock().await;
        let mut answers = state.answers.clone();
        answers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(answers)
    }

    async fn delete_all(&self) -> Result<()> {
        self.check_writable()?;
        self.state.lock().await.answers.clear();
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.check_writable()?;
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn append_message(&self, session_id: &SessionId, message: &SessionMessage) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let session = state.sessions.get_mut(session_id).ok_or_else(|| {
            DelveError::internal(format!("unknown session {}", session_id))
        })?;
        session.messages.push(message.clone());
        session.last_activity = message.created_at;
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &SessionId,
        metadata: Option<SessionMetadata>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.status = SessionStatus::Complete;
            session.last_activity = Utc::now();
            if metadata.is_some() {
                session.metadata = metadata;
            }
        }
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        Ok(self.state.lock().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| &s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    async fn set_active_session(&self, session_id: Option<&SessionId>) -> Result<()> {
        self.check_writable()?;
        self.state.lock().await.active_session = session_id.cloned();
        Ok(())
    }

    async fn active_session_id(&self) -> Result<Option<SessionId>> {
        Ok(self.state.lock().await.active_session.clone())
    }

    async fn record_suspension(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.check_writable()?;
        self.state.lock().await.suspended_at = at;
        Ok(())
    }

    async fn suspension(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.suspended_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_upserts_and_orders_newest_first() {
        let store = MemoryStore::new();
        let mut older = Answer::placeholder(AnswerId::from("old"), "q1", None);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = Answer::placeholder(AnswerId::from("new"), "q2", None);

        store.save(&older).await.expect("save");
        store.save(&newer).await.expect("save");
        older.content = "updated".to_string();
        store.save(&older).await.expect("upsert");

        let loaded = store.load_all().await.expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, AnswerId::from("new"));
        assert_eq!(loaded[1].content, "updated");
    }

    #[tokio::test]
    async fn test_failing_writes_surface_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let answer = Answer::placeholder(AnswerId::from("a"), "q", None);
        assert!(store.save(&answer).await.is_err());
        assert!(store.load_all().await.expect("reads still work").is_empty());
    }
}
