use crate::constants::{SESSION_RECOVERY_WINDOW, SESSION_TITLE_MAX_CHARS};
use crate::persistence::ResearchStore;
use crate::str_utils;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Process-wide lifecycle notifications the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    EnteringBackground,
    EnteringForeground,
    SaveActiveSession,
}

pub type LifecycleBus = broadcast::Sender<LifecycleSignal>;

pub fn lifecycle_bus() -> LifecycleBus {
    let (tx, _) = broadcast::channel(16);
    tx
}

#[derive(Default)]
struct SessionState {
    active: Option<Session>,
    recovery_decision: Option<bool>,
}

/// Owns the conversation log and decides what survives a restart.
///
/// A previous conversation is restored on cold start only if the app was
/// gracefully suspended less than `recovery_window` ago; a crash leaves no
/// suspension marker and starts empty.
pub struct SessionCoordinator {
    store: Arc<dyn ResearchStore>,
    user_id: UserId,
    recovery_window: Duration,
    state: Mutex<SessionState>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn ResearchStore>, user_id: UserId) -> Self {
        Self {
            store,
            user_id,
            recovery_window: SESSION_RECOVERY_WINDOW,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResearchStore> {
        &self.store
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.state.lock().await.active.clone()
    }

    async fn ensure_session(&self, state: &mut SessionState) -> Result<()> {
        if state.active.is_none() {
            let session = Session::new(self.user_id.clone());
            self.store.save_session(&session).await?;
            self.store.set_active_session(Some(&session.id)).await?;
            tracing::info!("[💾] Started session {}", session.id);
            state.active = Some(session);
        }
        Ok(())
    }

    async fn append(&self, message: SessionMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_session(&mut state).await?;
        let session = match state.active.as_mut() {
            Some(s) => s,
            None => return Err(DelveError::internal("no active session").into()),
        };
        session.messages.push(message.clone());
        session.last_activity = message.created_at;
        let session_id = session.id.clone();
        self.store.append_message(&session_id, &message).await
    }

    pub async fn append_user_message(&self, text: &str) -> Result<()> {
        self.append(SessionMessage {
            role: MessageRole::User,
            content: text.to_string(),
            answer_id: None,
            created_at: Utc::now(),
        })
        .await
    }

    pub async fn append_assistant_message(&self, answer: &Answer) -> Result<()> {
        self.append(SessionMessage {
            role: MessageRole::Assistant,
            content: answer.content.clone(),
            answer_id: Some(answer.id.clone()),
            created_at: Utc::now(),
        })
        .await
    }

    /// Persists a finished (or partial) answer and logs it in the conversation.
    pub async fn record_answer(&self, answer: &Answer) -> Result<()> {
        self.store.save(answer).await?;
        self.append_assistant_message(answer).await
    }

    /// Ends the current conversation and opens a fresh one with no answers.
    pub async fn start_new_session(&self) -> Result<SessionId> {
        self.end_session(true).await?;
        self.store.delete_all().await?;

        let mut state = self.state.lock().await;
        self.ensure_session(&mut state).await?;
        state.recovery_decision = Some(false);
        match state.active.as_ref() {
            Some(s) => Ok(s.id.clone()),
            None => Err(DelveError::internal("session was not created").into()),
        }
    }

    pub async fn end_session(&self, generate_metadata: bool) -> Result<()> {
        let session = match self.state.lock().await.active.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let metadata = generate_metadata.then(|| summarize(&session));
        self.store.end_session(&session.id, metadata).await?;
        self.store.set_active_session(None).await?;
        tracing::info!(
            "[💾] Ended session {} ({} messages)",
            session.id,
            session.messages.len()
        );
        Ok(())
    }

    pub async fn save_active_session(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.active.as_mut() {
            session.last_activity = Utc::now();
            self.store.save_session(session).await?;
            self.store.set_active_session(Some(&session.id)).await?;
        }
        Ok(())
    }

    /// Decides once per process whether the previous conversation comes back.
    pub async fn recover_active_session(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(decision) = state.recovery_decision {
            return Ok(decision);
        }

        let suspended_at = self.store.suspension().await?;
        self.store.record_suspension(None).await?;

        let within_window = match suspended_at {
            Some(at) => {
                let elapsed = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
                elapsed < self.recovery_window
            }
            None => false,
        };

        let previous = match self.store.active_session_id().await? {
            Some(id) => self.store.load_session(&id).await?,
            None => None,
        };

        let recovered = match previous {
            Some(session) if within_window && session.status == SessionStatus::Active => {
                tracing::info!(
                    "[💾] Recovered session {} ({} messages)",
                    session.id,
                    session.messages.len()
                );
                state.active = Some(session);
                true
            }
            Some(session) => {
                tracing::info!(
                    "[💾] Not restoring session {} (graceful: {}, within window: {})",
                    session.id,
                    suspended_at.is_some(),
                    within_window
                );
                if session.status == SessionStatus::Active {
                    self.store
                        .end_session(&session.id, Some(summarize(&session)))
                        .await?;
                }
                self.store.set_active_session(None).await?;
                self.store.delete_all().await?;
                false
            }
            None => {
                if !within_window {
                    self.store.delete_all().await?;
                }
                within_window
            }
        };

        state.recovery_decision = Some(recovered);
        Ok(recovered)
    }

    /// Answers of the current conversation, newest first.
    ///
    /// `force_load` skips the recovery check; use it when only the view was
    /// recreated, not the process.
    pub async fn load_history(&self, force_load: bool) -> Result<Vec<Answer>> {
        if !force_load && !self.recover_active_session().await? {
            return Ok(Vec::new());
        }
        self.store.load_all().await
    }

    /// Past conversations for the configured user.
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        self.store.list_sessions(&self.user_id).await
    }

    pub async fn handle_signal(&self, signal: LifecycleSignal) -> Result<()> {
        match signal {
            LifecycleSignal::EnteringBackground => {
                self.save_active_session().await?;
                self.store.record_suspension(Some(Utc::now())).await?;
                tracing::debug!("[💾] Recorded graceful suspension");
            }
            LifecycleSignal::EnteringForeground => {
                self.store.record_suspension(None).await?;
            }
            LifecycleSignal::SaveActiveSession => {
                self.save_active_session().await?;
            }
        }
        Ok(())
    }

    /// Subscribes to the lifecycle bus until it closes.
    pub fn spawn_lifecycle_listener(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<LifecycleSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        if let Err(e) = self.handle_signal(signal).await {
                            tracing::error!("[💾] Lifecycle {:?} failed: {}", signal, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("[💾] Lifecycle listener skipped {} signals", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn summarize(session: &Session) -> SessionMetadata {
    let title = session
        .messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| str_utils::truncate_with_ellipsis(&m.content, SESSION_TITLE_MAX_CHARS))
        .unwrap_or_else(|| "Untitled conversation".to_string());
    SessionMetadata {
        title,
        message_count: session.messages.len(),
    }
}
