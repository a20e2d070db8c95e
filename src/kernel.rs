use crate::router::{Finalized, QueryOutcome, RouteOutcome, StreamRouter};
use crate::ingress::SequencedEvent;
use crate::session::{LifecycleSignal, SessionCoordinator};
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Timer expiries posted back to the kernel. Timers never touch state themselves.
#[derive(Debug)]
pub enum Wakeup {
    FlushTokens { answer_id: AnswerId, generation: u64 },
    NarrationDue { answer_id: AnswerId, generation: u64 },
    ReflectionDeadline { answer_id: AnswerId, round: u32 },
    ClearReconnected { generation: u64 },
}

/// What a stream driver reports about the connection it owns.
#[derive(Debug)]
pub enum StreamSignal {
    Event {
        answer_id: AnswerId,
        event: SequencedEvent,
    },
    Reconnecting {
        answer_id: AnswerId,
        attempt: u32,
    },
    Reconnected {
        answer_id: AnswerId,
    },
    Failed {
        answer_id: AnswerId,
        error: ObservedError,
    },
}

pub enum KernelCommand {
    Begin {
        answer: Answer,
        resp: oneshot::Sender<CancellationToken>,
    },
    Cancel {
        answer_id: AnswerId,
        resp: oneshot::Sender<bool>,
    },
    CancelAll,
    NewConversation {
        resp: oneshot::Sender<Result<SessionId>>,
    },
    Restore {
        answers: Vec<Answer>,
        resp: oneshot::Sender<usize>,
    },
    Snapshot {
        resp: oneshot::Sender<Vec<Answer>>,
    },
    /// Stops the loop; in-flight answers are finalized and queued for persistence first.
    Shutdown,
}

/// Ordered writes handed to the persistence worker.
pub enum PersistJob {
    UserMessage(String),
    Answer(Answer),
    /// Saves the answer without logging it in the conversation.
    Checkpoint(Answer),
    NewSession {
        resp: oneshot::Sender<Result<SessionId>>,
    },
}

/// The single coordinating context. Every answer-store mutation happens inside
/// [`Kernel::run`]; network reads, timers and lifecycle notifications only
/// send messages here.
pub struct Kernel {
    router: StreamRouter,
    rx_cmd: mpsc::Receiver<KernelCommand>,
    rx_stream: mpsc::UnboundedReceiver<StreamSignal>,
    rx_wakeup: mpsc::UnboundedReceiver<Wakeup>,
    tx_wakeup: mpsc::UnboundedSender<Wakeup>,
    rx_lifecycle: broadcast::Receiver<LifecycleSignal>,
    tx_persist: mpsc::UnboundedSender<PersistJob>,
    reconnected_display: Duration,
    reconnect_generation: u64,
}

impl Kernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: StreamRouter,
        rx_cmd: mpsc::Receiver<KernelCommand>,
        rx_stream: mpsc::UnboundedReceiver<StreamSignal>,
        rx_wakeup: mpsc::UnboundedReceiver<Wakeup>,
        tx_wakeup: mpsc::UnboundedSender<Wakeup>,
        rx_lifecycle: broadcast::Receiver<LifecycleSignal>,
        tx_persist: mpsc::UnboundedSender<PersistJob>,
        reconnected_display: Duration,
    ) -> Self {
        Self {
            router,
            rx_cmd,
            rx_stream,
            rx_wakeup,
            tx_wakeup,
            rx_lifecycle,
            tx_persist,
            reconnected_display,
            reconnect_generation: 0,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("[⚙️ ] Kernel event loop started");
        let mut lifecycle_open = true;
        loop {
            tokio::select! {
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(KernelCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(signal) = self.rx_stream.recv() => self.handle_stream(signal),
                Some(wakeup) = self.rx_wakeup.recv() => self.handle_wakeup(wakeup),
                signal = self.rx_lifecycle.recv(), if lifecycle_open => match signal {
                    Ok(signal) => self.handle_lifecycle(signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[⚙️ ] Kernel missed {} lifecycle signals", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => lifecycle_open = false,
                },
            }
        }
        let abandoned = self.router.cancel_all();
        for finalized in abandoned {
            self.persist(finalized);
        }
        // Dropping `self` closes the persistence queue; the worker drains what is left.
        tracing::info!("[⚙️ ] Kernel event loop stopped");
    }

    fn handle_command(&mut self, cmd: KernelCommand) {
        match cmd {
            KernelCommand::Begin { answer, resp } => {
                self.enqueue(PersistJob::UserMessage(answer.query.clone()));
                let token = self.router.begin(answer);
                let _ = resp.send(token);
            }
            KernelCommand::Cancel { answer_id, resp } => {
                let cancelled = match self.router.cancel(&answer_id) {
                    Some(finalized) => {
                        self.persist(finalized);
                        true
                    }
                    None => false,
                };
                let _ = resp.send(cancelled);
            }
            KernelCommand::CancelAll => {
                for finalized in self.router.cancel_all() {
                    self.persist(finalized);
                }
            }
            KernelCommand::NewConversation { resp } => {
                let dropped = self.router.live_ids().len();
                self.router.clear();
                tracing::info!(
                    "[⚙️ ] New conversation ({} in-flight queries dropped)",
                    dropped
                );
                self.enqueue(PersistJob::NewSession { resp });
            }
            KernelCommand::Restore { answers, resp } => {
                let restored = self.router.restore(answers);
                let _ = resp.send(restored);
            }
            KernelCommand::Snapshot { resp } => {
                let _ = resp.send(self.router.store().answers().to_vec());
            }
            KernelCommand::Shutdown => {}
        }
    }

    fn handle_stream(&mut self, signal: StreamSignal) {
        match signal {
            StreamSignal::Event { answer_id, event } => {
                if let RouteOutcome::Finished(finalized) = self.router.route(&answer_id, event) {
                    self.persist(finalized);
                }
            }
            StreamSignal::Reconnecting { answer_id, attempt } => {
                if self.router.is_live(&answer_id) {
                    self.reconnect_generation += 1;
                    self.router.set_reconnect(
                        Some(&answer_id),
                        ReconnectStatus::Reconnecting { attempt },
                    );
                }
            }
            StreamSignal::Reconnected { answer_id } => {
                // The retried attempt has usually finished the answer by now.
                let reconnecting = matches!(
                    self.router.status().reconnect,
                    ReconnectStatus::Reconnecting { .. }
                );
                if reconnecting || self.router.is_live(&answer_id) {
                    self.reconnect_generation += 1;
                    self.router
                        .set_reconnect(Some(&answer_id), ReconnectStatus::Reconnected);
                    self.schedule_reconnect_clear();
                }
            }
            StreamSignal::Failed { answer_id, error } => {
                if self.router.status().reconnect != ReconnectStatus::Idle {
                    self.router.set_reconnect(None, ReconnectStatus::Idle);
                }
                if let RouteOutcome::Finished(finalized) = self.router.fail(&answer_id, &error.inner) {
                    self.persist(finalized);
                }
            }
        }
    }

    fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::FlushTokens {
                answer_id,
                generation,
            } => self.router.on_tokens_due(&answer_id, generation),
            Wakeup::NarrationDue {
                answer_id,
                generation,
            } => self.router.on_narration_due(&answer_id, generation),
            Wakeup::ReflectionDeadline { answer_id, round } => {
                self.router.on_reflection_deadline(&answer_id, round)
            }
            Wakeup::ClearReconnected { generation } => {
                if generation == self.reconnect_generation {
                    self.router.set_reconnect(None, ReconnectStatus::Idle);
                }
            }
        }
    }

    fn handle_lifecycle(&mut self, signal: LifecycleSignal) {
        if signal != LifecycleSignal::EnteringBackground {
            return;
        }
        // In-flight answers are checkpointed so a suspended query survives a kill.
        for answer_id in self.router.live_ids() {
            if let Some(answer) = self.router.store().get(&answer_id) {
                if !answer.content.is_empty() || !answer.sources.is_empty() {
                    self.enqueue(PersistJob::Checkpoint(answer.clone()));
                }
            }
        }
    }

    fn schedule_reconnect_clear(&self) {
        let generation = self.reconnect_generation;
        let delay = self.reconnected_display;
        let wakeups = self.tx_wakeup.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(Wakeup::ClearReconnected { generation });
        });
    }

    fn persist(&self, finalized: Finalized) {
        if !finalized.persist {
            tracing::debug!(
                "[💾] Not persisting empty {:?} answer {}",
                finalized.outcome,
                finalized.answer.id.short()
            );
            return;
        }
        if finalized.outcome != QueryOutcome::Completed {
            tracing::info!(
                "[💾] Keeping partial answer {} ({} chars)",
                finalized.answer.id.short(),
                finalized.answer.content.len()
            );
        }
        self.enqueue(PersistJob::Answer(finalized.answer));
    }

    fn enqueue(&self, job: PersistJob) {
        if self.tx_persist.send(job).is_err() {
            tracing::error!("[💾] Persistence worker is gone; write dropped");
        }
    }
}

/// Applies persistence jobs in submission order. Failures are logged and never
/// reach answer state.
pub fn spawn_persistence_worker(
    session: Arc<SessionCoordinator>,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::UserMessage(text) => {
                    if let Err(e) = session.append_user_message(&text).await {
                        tracing::error!("[💾] Failed to log user message: {}", e);
                    }
                }
                PersistJob::Answer(answer) => {
                    if let Err(e) = session.record_answer(&answer).await {
                        tracing::error!(
                            "[💾] Failed to persist answer {}: {}",
                            answer.id.short(),
                            e
                        );
                    }
                }
                PersistJob::Checkpoint(answer) => {
                    if let Err(e) = session.store().save(&answer).await {
                        tracing::error!(
                            "[💾] Failed to checkpoint answer {}: {}",
                            answer.id.short(),
                            e
                        );
                    }
                }
                PersistJob::NewSession { resp } => {
                    let result = session.start_new_session().await;
                    if let Err(e) = &result {
                        tracing::error!("[💾] Failed to start a new session: {}", e);
                    }
                    let _ = resp.send(result);
                }
            }
        }
        tracing::debug!("[💾] Persistence worker stopped");
    })
}
