use crate::constants::*;
use crate::kernel::{spawn_persistence_worker, Kernel, KernelCommand, StreamSignal};
use crate::narration::StageMap;
use crate::persistence::ResearchStore;
use crate::pipeline::DeliveryPolicy;
use crate::retry::ConnectionRetrier;
use crate::router::{RouterConfig, StreamRouter};
use crate::session::{lifecycle_bus, LifecycleBus, SessionCoordinator};
use crate::store::StoreChange;
use crate::transport::{QueryRequest, ResearchTransport};
use crate::types::*;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_id: UserId,
    pub delivery_policy: DeliveryPolicy,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest silence tolerated between two events of one attempt.
    pub attempt_timeout: Duration,
    pub reconnected_display: Duration,
    pub reflection_timeout: Duration,
    pub stage_dwell: Duration,
    pub recovery_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: UserId(DEFAULT_USER_ID.to_string()),
            delivery_policy: DeliveryPolicy::Immediate,
            max_attempts: MAX_STREAM_ATTEMPTS,
            base_backoff: BASE_BACKOFF,
            max_backoff: MAX_BACKOFF,
            attempt_timeout: ATTEMPT_TIMEOUT,
            reconnected_display: RECONNECTED_DISPLAY,
            reflection_timeout: REFLECTION_TIMEOUT,
            stage_dwell: STAGE_MIN_DWELL,
            recovery_window: SESSION_RECOVERY_WINDOW,
        }
    }
}

impl EngineConfig {
    fn retrier(&self) -> ConnectionRetrier {
        ConnectionRetrier::new(self.max_attempts, self.base_backoff).with_max_delay(self.max_backoff)
    }

    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            delivery_policy: self.delivery_policy,
            stage_dwell: self.stage_dwell,
            reflection_timeout: self.reflection_timeout,
        }
    }
}

/// Everything observers can follow, re-emitted from the store, narration and status.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Answer(StoreChange),
    Stages(StageMap),
    Status(EngineStatus),
}

pub struct DelveEngine;

impl DelveEngine {
    /// Spawns the kernel, persistence worker, lifecycle listener and event
    /// forwarder. Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        transport: Arc<dyn ResearchTransport>,
        store: Arc<dyn ResearchStore>,
    ) -> EngineHandle {
        let session = Arc::new(
            SessionCoordinator::new(store, config.user_id.clone())
                .with_recovery_window(config.recovery_window),
        );
        let lifecycle = lifecycle_bus();

        let (tx_wakeup, rx_wakeup) = mpsc::unbounded_channel();
        let router = StreamRouter::new(config.router_config(), tx_wakeup.clone());
        let store_changes = router.subscribe_store();
        let stages = router.subscribe_stages();
        let status = router.subscribe_status();

        let (tx_cmd, rx_cmd) = mpsc::channel(100);
        let (tx_stream, rx_stream) = mpsc::unbounded_channel();
        let (tx_persist, rx_persist) = mpsc::unbounded_channel();
        let (tx_events, _) = broadcast::channel(1024);

        let kernel = Kernel::new(
            router,
            rx_cmd,
            rx_stream,
            rx_wakeup,
            tx_wakeup,
            lifecycle.subscribe(),
            tx_persist,
            config.reconnected_display,
        );
        let kernel = tokio::spawn(kernel.run());
        let persistence = spawn_persistence_worker(session.clone(), rx_persist);
        session.clone().spawn_lifecycle_listener(lifecycle.subscribe());
        spawn_event_forwarder(
            store_changes,
            stages.clone(),
            status.clone(),
            tx_events.clone(),
        );

        tracing::info!(
            "[⚙️ ] Engine started (user: {}, delivery: {:?}, attempts: {})",
            config.user_id,
            config.delivery_policy,
            config.max_attempts
        );

        EngineHandle {
            tx_cmd,
            tx_stream,
            transport,
            retrier: config.retrier(),
            idle_timeout: config.attempt_timeout,
            user_id: config.user_id,
            session,
            lifecycle,
            events: tx_events,
            status,
            stages,
            tasks: Arc::new(Mutex::new(Some(EngineTasks {
                kernel,
                persistence,
            }))),
        }
    }
}

struct EngineTasks {
    kernel: JoinHandle<()>,
    persistence: JoinHandle<()>,
}

/// Cheap to clone. Call [`EngineHandle::shutdown`] before the runtime goes away,
/// or queued writes may be lost.
#[derive(Clone)]
pub struct EngineHandle {
    tx_cmd: mpsc::Sender<KernelCommand>,
    tx_stream: mpsc::UnboundedSender<StreamSignal>,
    transport: Arc<dyn ResearchTransport>,
    retrier: ConnectionRetrier,
    idle_timeout: Duration,
    user_id: UserId,
    session: Arc<SessionCoordinator>,
    lifecycle: LifecycleBus,
    events: broadcast::Sender<EngineEvent>,
    status: watch::Receiver<EngineStatus>,
    stages: watch::Receiver<StageMap>,
    tasks: Arc<Mutex<Option<EngineTasks>>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> KernelCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        if self.tx_cmd.send(build(tx)).await.is_err() {
            return Err(DelveError::internal("engine kernel has stopped").into());
        }
        match rx.await {
            Ok(value) => Ok(value),
            Err(_) => Err(DelveError::internal("engine kernel dropped the request").into()),
        }
    }

    /// Submits a query. The placeholder answer is in the store when this returns.
    pub async fn submit(&self, query: &str, image: Option<String>) -> Result<AnswerId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DelveError::internal("query is empty").into());
        }
        let answer = Answer::placeholder(AnswerId::new(), query, image.clone());
        let answer_id = answer.id.clone();
        let token = self
            .request(|resp| KernelCommand::Begin { answer, resp })
            .await?;

        let request = QueryRequest {
            answer_id: answer_id.clone(),
            query: query.to_string(),
            user_id: self.user_id.clone(),
            image,
        };
        let span = tracing::info_span!("query", answer_id = %answer_id.short());
        tokio::spawn(
            drive_stream(
                self.transport.clone(),
                self.retrier.clone(),
                self.idle_timeout,
                request,
                token,
                self.tx_stream.clone(),
            )
            .instrument(span),
        );
        Ok(answer_id)
    }

    /// Returns false if the answer was not streaming.
    pub async fn cancel(&self, answer_id: &AnswerId) -> Result<bool> {
        let answer_id = answer_id.clone();
        self.request(|resp| KernelCommand::Cancel { answer_id, resp })
            .await
    }

    pub async fn cancel_all(&self) -> Result<()> {
        if self.tx_cmd.send(KernelCommand::CancelAll).await.is_err() {
            return Err(DelveError::internal("engine kernel has stopped").into());
        }
        Ok(())
    }

    pub async fn new_conversation(&self) -> Result<SessionId> {
        self.request(|resp| KernelCommand::NewConversation { resp })
            .await?
    }

    /// Loads persisted answers into the store; see [`SessionCoordinator::load_history`].
    pub async fn restore(&self, force_load: bool) -> Result<usize> {
        let answers = self.session.load_history(force_load).await?;
        if answers.is_empty() {
            return Ok(0);
        }
        self.request(|resp| KernelCommand::Restore { answers, resp })
            .await
    }

    /// Current answers, newest first.
    pub async fn answers(&self) -> Result<Vec<Answer>> {
        self.request(|resp| KernelCommand::Snapshot { resp }).await
    }

    pub async fn answer(&self, answer_id: &AnswerId) -> Result<Option<Answer>> {
        Ok(self
            .answers()
            .await?
            .into_iter()
            .find(|a| &a.id == answer_id))
    }

    /// Waits until no query is streaming and returns the status at that point.
    pub async fn wait_until_idle(&self) -> Result<EngineStatus> {
        let mut status = self.status.clone();
        let idle = match status.wait_for(|s| !s.loading).await {
            Ok(s) => s.clone(),
            Err(_) => return Err(DelveError::internal("engine status channel closed").into()),
        };
        Ok(idle)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn stages(&self) -> watch::Receiver<StageMap> {
        self.stages.clone()
    }

    pub fn session(&self) -> &Arc<SessionCoordinator> {
        &self.session
    }

    /// Bus the host publishes lifecycle signals on.
    pub fn lifecycle(&self) -> &LifecycleBus {
        &self.lifecycle
    }

    /// Stops the kernel and waits until every queued write has reached the store.
    /// Streaming answers are cancelled and keep their partial content. Later calls
    /// return immediately, and every other request fails once this returns.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks = match self.tasks.lock().await.take() {
            Some(tasks) => tasks,
            None => return Ok(()),
        };
        if self.tx_cmd.send(KernelCommand::Shutdown).await.is_err() {
            tracing::debug!("[⚙️ ] Kernel already stopped before shutdown");
        }
        if let Err(e) = tasks.kernel.await {
            return Err(DelveError::internal(format!("kernel task failed: {}", e)).into());
        }
        if let Err(e) = tasks.persistence.await {
            return Err(DelveError::internal(format!("persistence worker failed: {}", e)).into());
        }
        tracing::info!("[⚙️ ] Engine stopped; pending writes flushed");
        Ok(())
    }
}

/// Owns the remote connection for one query until it ends, fails for good, or is cancelled.
async fn drive_stream(
    transport: Arc<dyn ResearchTransport>,
    retrier: ConnectionRetrier,
    idle_timeout: Duration,
    request: QueryRequest,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<StreamSignal>,
) {
    let answer_id = request.answer_id.clone();
    let run = retrier.execute_with_retry(
        |attempt| stream_attempt(transport.clone(), &request, attempt, idle_timeout, &tx),
        |attempt| {
            let _ = tx.send(StreamSignal::Reconnecting {
                answer_id: answer_id.clone(),
                attempt,
            });
        },
        || {
            let _ = tx.send(StreamSignal::Reconnected {
                answer_id: answer_id.clone(),
            });
        },
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("[📡 -> ⚙️ ] Stream for {} released", answer_id.short());
        }
        result = run => {
            if let Err(error) = result {
                let _ = tx.send(StreamSignal::Failed {
                    answer_id: answer_id.clone(),
                    error,
                });
            }
        }
    }
}

async fn stream_attempt(
    transport: Arc<dyn ResearchTransport>,
    request: &QueryRequest,
    attempt: u32,
    idle_timeout: Duration,
    tx: &mpsc::UnboundedSender<StreamSignal>,
) -> Result<()> {
    let mut events = transport.open(request, attempt).await?;
    loop {
        let next = match tokio::time::timeout(idle_timeout, events.next()).await {
            Ok(next) => next,
            Err(_) => return Err(DelveError::Timeout(idle_timeout).into()),
        };
        match next {
            Some(Ok(event)) => {
                let terminal = event.event.is_terminal();
                let signal = StreamSignal::Event {
                    answer_id: request.answer_id.clone(),
                    event,
                };
                if tx.send(signal).is_err() {
                    return Err(DelveError::Cancelled.into());
                }
                if terminal {
                    return Ok(());
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(DelveError::Protocol(
                    "stream ended before complete or error".to_string(),
                )
                .into())
            }
        }
    }
}

fn spawn_event_forwarder(
    mut store_changes: broadcast::Receiver<StoreChange>,
    mut stages: watch::Receiver<StageMap>,
    mut status: watch::Receiver<EngineStatus>,
    tx: broadcast::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        let mut stages_open = true;
        let mut status_open = true;
        loop {
            tokio::select! {
                change = store_changes.recv() => match change {
                    Ok(change) => {
                        let _ = tx.send(EngineEvent::Answer(change));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[⚙️ ] Event forwarder skipped {} store changes", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = stages.changed(), if stages_open => match changed {
                    Ok(()) => {
                        let map = stages.borrow_and_update().clone();
                        let _ = tx.send(EngineEvent::Stages(map));
                    }
                    Err(_) => stages_open = false,
                },
                changed = status.changed(), if status_open => match changed {
                    Ok(()) => {
                        let current = status.borrow_and_update().clone();
                        let _ = tx.send(EngineEvent::Status(current));
                    }
                    Err(_) => status_open = false,
                },
            }
        }
    });
}
