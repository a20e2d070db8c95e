//! Stream Event Router.
//!
//! Applies admitted stream events to the answer store, narration and global
//! status. Everything here runs on the kernel's context; timers only post
//! [`Wakeup`]s back to it.

use crate::cancellation::CancellationRegistry;
use crate::dedup::{Admission, SequenceTracker};
use crate::ingress::{
    convert_sources, RawComplete, RawReflection, RawRoundComplete, RawRoundStarted,
    SequencedEvent, StreamEvent,
};
use crate::kernel::Wakeup;
use crate::logging::{kind_label, StreamMetric};
use crate::narration::{NarrationCoordinator, StageMap};
use crate::pipeline::{DeliveryPolicy, TokenPipeline};
use crate::store::{AnswerStore, StoreChange};
use crate::types::*;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub delivery_policy: DeliveryPolicy,
    pub stage_dwell: Duration,
    pub reflection_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            delivery_policy: DeliveryPolicy::default(),
            stage_dwell: crate::constants::STAGE_MIN_DWELL,
            reflection_timeout: crate::constants::REFLECTION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl QueryOutcome {
    fn label(&self) -> &'static str {
        match self {
            QueryOutcome::Completed => "complete",
            QueryOutcome::Failed(_) => "error",
            QueryOutcome::Cancelled => "cancelled",
        }
    }
}

/// An answer that stopped streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub answer: Answer,
    pub outcome: QueryOutcome,
    /// False for answers with nothing worth keeping (an empty placeholder).
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Applied,
    Dropped(Admission),
    /// The event named an answer the store does not hold.
    Unknown,
    Finished(Finalized),
}

pub struct StreamRouter {
    store: AnswerStore,
    tracker: SequenceTracker,
    tokens: CancellationRegistry,
    pipeline: TokenPipeline,
    narration: NarrationCoordinator,
    status: watch::Sender<EngineStatus>,
    wakeups: mpsc::UnboundedSender<Wakeup>,
    reflection_timeout: Duration,
    reflection_timers: HashMap<(AnswerId, u32), JoinHandle<()>>,
    early_reflections: HashMap<AnswerId, Vec<Reflection>>,
    metrics: HashMap<AnswerId, StreamMetric>,
}

impl StreamRouter {
    pub fn new(config: RouterConfig, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        let (status, _) = watch::channel(EngineStatus::default());
        Self {
            store: AnswerStore::new(),
            tracker: SequenceTracker::new(),
            tokens: CancellationRegistry::new(),
            pipeline: TokenPipeline::new(config.delivery_policy, wakeups.clone()),
            narration: NarrationCoordinator::new(config.stage_dwell, wakeups.clone()),
            status,
            wakeups,
            reflection_timeout: config.reflection_timeout,
            reflection_timers: HashMap::new(),
            early_reflections: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn store(&self) -> &AnswerStore {
        &self.store
    }

    pub fn narration(&self) -> &NarrationCoordinator {
        &self.narration
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn subscribe_stages(&self) -> watch::Receiver<StageMap> {
        self.narration.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn is_live(&self, answer_id: &AnswerId) -> bool {
        self.tokens.is_live(answer_id)
    }

    pub fn live_ids(&self) -> Vec<AnswerId> {
        self.tokens.live_ids()
    }

    /// Registers a freshly submitted query and returns its cancellation token.
    pub fn begin(&mut self, answer: Answer) -> CancellationToken {
        let answer_id = answer.id.clone();
        self.tracker.reset(&answer_id);
        let token = self.tokens.issue(&answer_id);
        self.pipeline.cancel(&answer_id);
        self.store.push_front(answer);
        self.store.set_searching(&answer_id, true);
        self.narration.begin(&answer_id);
        self.metrics.insert(answer_id.clone(), StreamMetric::new());
        self.status.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });
        tracing::info!("[⚙️ ] Query started for {}", answer_id.short());
        token
    }

    pub fn route(&mut self, answer_id: &AnswerId, event: SequencedEvent) -> RouteOutcome {
        if let Some(named) = &event.answer_id {
            if named != answer_id {
                tracing::warn!(
                    "[📡 -> ⚙️ ] Event seq {} names {} but arrived on the stream for {}",
                    event.sequence,
                    named.short(),
                    answer_id.short()
                );
                return RouteOutcome::Dropped(Admission::Stale);
            }
        }

        let admission = self
            .tracker
            .admit(event.sequence, event.kind(), answer_id, &self.tokens);
        if let Some(metric) = self.metrics.get_mut(answer_id) {
            metric.record_admission(admission);
        }
        if admission != Admission::Process {
            tracing::trace!(
                "[📡 -> ⚙️ ] {:?} {} seq {} for {}",
                admission,
                kind_label(event.kind()),
                event.sequence,
                answer_id.short()
            );
            return RouteOutcome::Dropped(admission);
        }
        if self.store.get(answer_id).is_none() {
            tracing::warn!(
                "[📡 -> ⚙️ ] {} for unknown answer {}",
                kind_label(event.kind()),
                answer_id.short()
            );
            return RouteOutcome::Unknown;
        }
        if let Some(metric) = self.metrics.get_mut(answer_id) {
            metric.record_event(&event.event);
        }

        match event.event {
            StreamEvent::Token { content } => self.on_token(answer_id, &content),
            StreamEvent::TierSelected { tier } => self.on_tier(answer_id, &tier),
            StreamEvent::SearchComplete { sources } | StreamEvent::SourcesReady { sources } => {
                self.on_sources(answer_id, convert_sources(sources))
            }
            StreamEvent::RoundStarted(round) => self.on_round_started(answer_id, round),
            StreamEvent::RoundComplete(round) => return self.on_round_complete(answer_id, round),
            StreamEvent::ReflectionStarted { round } => {
                self.on_reflection_started(answer_id, round)
            }
            StreamEvent::ReflectionComplete(reflection) => {
                self.on_reflection_complete(answer_id, reflection)
            }
            StreamEvent::PlanningStarted => self.narration.request(answer_id, Stage::Planning),
            StreamEvent::PlanningComplete { plan } => {
                if let Some(plan) = plan {
                    self.narration.set_plan(answer_id, plan);
                }
            }
            StreamEvent::ApiStarted => self.narration.request(answer_id, Stage::Gathering),
            StreamEvent::SourceSelectionStarted => {
                self.narration.request(answer_id, Stage::SourceSelection)
            }
            StreamEvent::SynthesisPreparation => {
                self.narration.request(answer_id, Stage::SynthesisPreparation)
            }
            StreamEvent::SynthesisStarted => self.narration.request(answer_id, Stage::Writing),
            StreamEvent::Complete(complete) => return self.on_complete(answer_id, complete),
            StreamEvent::Error(error) => {
                let message = match error.code {
                    Some(code) => format!("{} (code {})", error.message, code),
                    None => error.message,
                };
                return self.fail(answer_id, &DelveError::Stream(message));
            }
        }
        RouteOutcome::Applied
    }

    fn on_token(&mut self, answer_id: &AnswerId, content: &str) {
        if self.store.mark_first_token(answer_id) {
            tracing::debug!("[⚙️ ] First token for {}", answer_id.short());
            self.narration.first_token(answer_id);
            self.store.set_searching(answer_id, false);
        }
        let store = &mut self.store;
        self.pipeline.append(content, answer_id, |id, fragment| {
            store.append_content(id, fragment);
        });
    }

    fn on_tier(&mut self, answer_id: &AnswerId, code: &serde_json::Value) {
        let tier = match Tier::from_code(code) {
            Some(t) => t,
            None => {
                tracing::warn!("[⚙️ ] Unrecognized tier code {}", code);
                return;
            }
        };
        self.store.modify(answer_id, |answer| answer.tier = Some(tier));
        self.status.send_if_modified(|s| {
            let changed = s.current_tier != Some(tier);
            s.current_tier = Some(tier);
            changed
        });
        tracing::info!("[⚙️ ] Tier for {}: {}", answer_id.short(), tier);
    }

    fn on_sources(&mut self, answer_id: &AnswerId, sources: Vec<Source>) {
        let mut added = 0;
        self.store.modify(answer_id, |answer| {
            added = answer.merge_sources(&sources);
        });
        self.store.set_searching(answer_id, false);
        tracing::debug!(
            "[⚙️ ] {} new sources for {} ({} reported)",
            added,
            answer_id.short(),
            sources.len()
        );
    }

    fn on_round_started(&mut self, answer_id: &AnswerId, started: RawRoundStarted) {
        let number = started.round;
        let pending = self.early_reflections.get_mut(answer_id).and_then(|list| {
            let pos = list.iter().position(|r| r.round == number)?;
            Some(list.remove(pos))
        });
        self.store.modify(answer_id, |answer| {
            match answer.round_mut(number) {
                Some(existing) => {
                    if !started.query.is_empty() {
                        existing.query = started.query.clone();
                    }
                }
                None => {
                    answer
                        .rounds
                        .push(Round::started(number, started.query.clone()));
                    answer.rounds.sort_by_key(|r| r.number);
                }
            }
            if let (Some(reflection), Some(round)) = (pending, answer.round_mut(number)) {
                round.reflection = Some(reflection);
                round.reflection_status = ReflectionStatus::Received;
            }
        });
        self.store.set_searching(answer_id, true);
        self.narration.request(answer_id, Stage::Round(number));
    }

    fn on_round_complete(&mut self, answer_id: &AnswerId, raw: RawRoundComplete) -> RouteOutcome {
        let number = raw.round;
        let status = match raw.status.as_deref() {
            Some(tag) => RoundStatus::parse(tag).unwrap_or_else(|| {
                tracing::warn!("[⚙️ ] Unknown round status '{}', assuming complete", tag);
                RoundStatus::Complete
            }),
            None => RoundStatus::Complete,
        };
        let sources = convert_sources(raw.sources);

        if number == 1 && status == RoundStatus::Failed && sources.is_empty() {
            tracing::error!(
                "[⚙️ ] Round 1 failed with no sources for {}; aborting query",
                answer_id.short()
            );
            return self.fail(
                answer_id,
                &DelveError::FatalRound("the first search round found no sources".to_string()),
            );
        }

        let completed_at = Utc::now();
        self.store.modify(answer_id, |answer| {
            if answer.round(number).is_none() {
                answer.rounds.push(Round::started(number, raw.query.clone()));
                answer.rounds.sort_by_key(|r| r.number);
            }
            if let Some(round) = answer.round_mut(number) {
                if !raw.query.is_empty() {
                    round.query = raw.query.clone();
                }
                round.source_mix = raw.source_mix.clone();
                round.sources = sources.clone();
                round.status = status;
                round.timing.completed_at = Some(completed_at);
                round.timing.duration_ms = raw.duration_ms.or_else(|| {
                    round
                        .timing
                        .started_at
                        .and_then(|s| (completed_at - s).to_std().ok())
                        .map(|d| d.as_millis() as u64)
                });
            }
            answer.merge_sources(&sources);
        });
        self.store.set_searching(answer_id, false);
        tracing::debug!(
            "[⚙️ ] Round {} {:?} for {} with {} sources",
            number,
            status,
            answer_id.short(),
            sources.len()
        );
        RouteOutcome::Applied
    }

    fn on_reflection_started(&mut self, answer_id: &AnswerId, number: u32) {
        self.store.modify(answer_id, |answer| {
            if let Some(round) = answer.round_mut(number) {
                if round.reflection.is_none() {
                    round.reflection_status = ReflectionStatus::Pending;
                }
            }
        });
        self.narration.request(answer_id, Stage::Reflecting(number));

        let key = (answer_id.clone(), number);
        if let Some(previous) = self.reflection_timers.remove(&key) {
            previous.abort();
        }
        let wakeups = self.wakeups.clone();
        let id = answer_id.clone();
        let timeout = self.reflection_timeout;
        self.reflection_timers.insert(
            key,
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = wakeups.send(Wakeup::ReflectionDeadline {
                    answer_id: id,
                    round: number,
                });
            }),
        );
    }

    fn on_reflection_complete(&mut self, answer_id: &AnswerId, raw: RawReflection) {
        let number = raw.round;
        if let Some(timer) = self.reflection_timers.remove(&(answer_id.clone(), number)) {
            timer.abort();
        }
        let reflection = Reflection {
            round: number,
            evidence_quality: raw
                .evidence_quality
                .as_deref()
                .map(EvidenceQuality::parse)
                .unwrap_or(EvidenceQuality::Insufficient),
            should_continue: raw.should_continue,
            reasoning: raw.reasoning,
        };

        let has_round = self
            .store
            .get(answer_id)
            .is_some_and(|a| a.round(number).is_some());
        if !has_round {
            tracing::debug!(
                "[⚙️ ] Reflection for round {} arrived before the round; holding it",
                number
            );
            self.early_reflections
                .entry(answer_id.clone())
                .or_default()
                .push(reflection);
            return;
        }

        self.store.modify(answer_id, |answer| {
            if let Some(round) = answer.round_mut(number) {
                round.reflection = Some(reflection);
                round.reflection_status = ReflectionStatus::Received;
            }
        });
    }

    /// The reflection for `round` did not arrive in time; stop waiting for it.
    pub fn on_reflection_deadline(&mut self, answer_id: &AnswerId, round: u32) {
        self.reflection_timers.remove(&(answer_id.clone(), round));
        if !self.tokens.is_live(answer_id) {
            return;
        }
        let mut timed_out = false;
        self.store.modify(answer_id, |answer| {
            if let Some(r) = answer.round_mut(round) {
                if r.reflection_status == ReflectionStatus::Pending {
                    r.reflection_status = ReflectionStatus::TimedOut;
                    timed_out = true;
                }
            }
        });
        if timed_out {
            tracing::warn!(
                "[⚙️ ] Reflection for round {} of {} timed out; continuing without it",
                round,
                answer_id.short()
            );
            self.narration.release(answer_id, Stage::Reflecting(round));
        }
    }

    pub fn on_tokens_due(&mut self, answer_id: &AnswerId, generation: u64) {
        let store = &mut self.store;
        self.pipeline.flush_due(answer_id, generation, |id, fragment| {
            store.append_content(id, fragment);
        });
    }

    pub fn on_narration_due(&mut self, answer_id: &AnswerId, generation: u64) {
        self.narration.on_dwell_elapsed(answer_id, generation);
    }

    fn on_complete(&mut self, answer_id: &AnswerId, complete: RawComplete) -> RouteOutcome {
        self.flush_tokens(answer_id);
        let fresh = dedup_by_url(convert_sources(complete.sources));
        let tier = complete.tier.as_ref().and_then(Tier::from_code);

        self.store.modify(answer_id, |answer| {
            if let Some(content) = complete.content.filter(|c| !c.trim().is_empty()) {
                answer.content = content;
            }
            answer.content = answer.content.trim().to_string();

            if tier.is_some() {
                answer.tier = tier;
            }

            if !fresh.is_empty() {
                answer.sources = fresh;
            } else if !answer.sources.is_empty() {
                tracing::debug!(
                    "[⚙️ ] Completion reported no sources; keeping {} accumulated",
                    answer.sources.len()
                );
            }

            if complete.thinking.is_some() {
                answer.thinking = complete.thinking;
            }
        });
        if let Some(t) = tier {
            self.status.send_modify(|s| s.current_tier = Some(t));
        }

        self.finish(answer_id, QueryOutcome::Completed)
    }

    /// Ends the query with an error, keeping any streamed content as a partial answer.
    pub fn fail(&mut self, answer_id: &AnswerId, error: &DelveError) -> RouteOutcome {
        if !self.tokens.is_live(answer_id) {
            return RouteOutcome::Dropped(Admission::Stale);
        }
        self.flush_tokens(answer_id);
        let message = error.to_string();
        tracing::error!("[⚙️ ] Query {} failed: {}", answer_id.short(), message);

        self.store.modify(answer_id, |answer| {
            answer.content = answer.content.trim_end().to_string();
            answer.sources.clear();
        });
        self.status.send_modify(|s| s.error = Some(message.clone()));
        self.finish(answer_id, QueryOutcome::Failed(message))
    }

    /// Cancels an in-flight query. Buffered tokens are discarded; streamed content stays.
    pub fn cancel(&mut self, answer_id: &AnswerId) -> Option<Finalized> {
        if !self.tokens.is_live(answer_id) {
            return None;
        }
        self.pipeline.cancel(answer_id);
        tracing::info!("[⚙️ ] Query {} cancelled", answer_id.short());
        match self.finish(answer_id, QueryOutcome::Cancelled) {
            RouteOutcome::Finished(finalized) => Some(finalized),
            _ => None,
        }
    }

    pub fn cancel_all(&mut self) -> Vec<Finalized> {
        self.tokens
            .live_ids()
            .into_iter()
            .filter_map(|id| self.cancel(&id))
            .collect()
    }

    /// Drops every answer and all per-answer state (new conversation).
    pub fn clear(&mut self) {
        for id in self.tokens.live_ids() {
            self.pipeline.cancel(&id);
            self.release(&id);
        }
        self.tokens.revoke_all();
        self.tracker.clear();
        self.narration.finish_all();
        for (_, timer) in self.reflection_timers.drain() {
            timer.abort();
        }
        self.early_reflections.clear();
        self.metrics.clear();
        self.store.remove_all();
        self.status.send_replace(EngineStatus::default());
    }

    /// Loads persisted answers behind whatever is already shown.
    pub fn restore(&mut self, answers: Vec<Answer>) -> usize {
        let mut restored = 0;
        for answer in answers {
            if self.store.index_of(&answer.id).is_some() {
                continue;
            }
            let end = self.store.len();
            self.store.insert(answer, end);
            restored += 1;
        }
        restored
    }

    pub fn set_reconnect(&mut self, answer_id: Option<&AnswerId>, reconnect: ReconnectStatus) {
        if let (Some(id), ReconnectStatus::Reconnecting { .. }) = (answer_id, reconnect) {
            if let Some(metric) = self.metrics.get_mut(id) {
                metric.reconnects += 1;
            }
        }
        self.status.send_if_modified(|s| {
            let changed = s.reconnect != reconnect;
            s.reconnect = reconnect;
            changed
        });
    }

    fn flush_tokens(&mut self, answer_id: &AnswerId) {
        let store = &mut self.store;
        self.pipeline.flush_remaining(answer_id, |id, fragment| {
            store.append_content(id, fragment);
        });
    }

    fn finish(&mut self, answer_id: &AnswerId, outcome: QueryOutcome) -> RouteOutcome {
        let answer = self.store.get(answer_id).cloned();
        if let Some(metric) = self.metrics.remove(answer_id) {
            metric.log_summary(answer_id, outcome.label());
        }
        self.release(answer_id);

        match answer {
            Some(answer) => {
                let persist = match outcome {
                    QueryOutcome::Completed => true,
                    _ => !answer.content.is_empty(),
                };
                RouteOutcome::Finished(Finalized {
                    answer,
                    outcome,
                    persist,
                })
            }
            None => RouteOutcome::Unknown,
        }
    }

    fn release(&mut self, answer_id: &AnswerId) {
        self.tokens.revoke(answer_id);
        self.tracker.release(answer_id);
        self.pipeline.cancel(answer_id);
        self.store.release_flags(answer_id);
        self.narration.finish(answer_id);
        self.early_reflections.remove(answer_id);
        self.reflection_timers.retain(|(id, _), timer| {
            if id == answer_id {
                timer.abort();
                false
            } else {
                true
            }
        });
        let loading = !self.tokens.live_ids().is_empty();
        self.status.send_if_modified(|s| {
            let changed = s.loading != loading;
            s.loading = loading;
            changed
        });
    }
}

impl Drop for StreamRouter {
    fn drop(&mut self) {
        for (_, timer) in self.reflection_timers.drain() {
            timer.abort();
        }
    }
}

fn dedup_by_url(sources: Vec<Source>) -> Vec<Source> {
    let mut unique: Vec<Source> = Vec::with_capacity(sources.len());
    for source in sources {
        if !unique.iter().any(|s| s.url == source.url) {
            unique.push(source);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::RawSource;

    fn router() -> (StreamRouter, mpsc::UnboundedReceiver<Wakeup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = RouterConfig {
            delivery_policy: DeliveryPolicy::Immediate,
            stage_dwell: Duration::ZERO,
            reflection_timeout: Duration::from_secs(60),
        };
        (StreamRouter::new(config, tx), rx)
    }

    fn raw_source(url: &str) -> RawSource {
        RawSource {
            url: Some(url.to_string()),
            title: Some("t".to_string()),
            credibility: Some("peer_reviewed".to_string()),
            ..RawSource::default()
        }
    }

    fn token(seq: u64, text: &str) -> SequencedEvent {
        SequencedEvent::new(
            seq,
            StreamEvent::Token {
                content: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_tokens_append_and_first_token_clears_narration() {
        let (mut router, _rx) = router();
        let id = AnswerId::from("a");
        router.begin(Answer::placeholder(id.clone(), "q", None));
        router.route(&id, SequencedEvent::new(1, StreamEvent::SynthesisStarted));
        assert_eq!(router.narration().current(&id), Some(Stage::Writing));

        router.route(&id, token(2, "Hello"));
        router.route(&id, token(3, " world"));
        assert_eq!(router.store().get(&id).map(|a| a.content.as_str()), Some("Hello world"));
        assert_eq!(router.narration().current(&id), None);
    }

    #[tokio::test]
    async fn test_tier_accepts_integer_code() {
        let (mut router, _rx) = router();
        let id = AnswerId::from("a");
        router.begin(Answer::placeholder(id.clone(), "q", None));
        router.route(
            &id,
            SequencedEvent::new(
                1,
                StreamEvent::TierSelected {
                    tier: serde_json::json!(3),
                },
            ),
        );
        assert_eq!(router.store().get(&id).and_then(|a| a.tier), Some(Tier::DeepResearch));
        assert_eq!(router.status().current_tier, Some(Tier::DeepResearch));
    }

    #[tokio::test]
    async fn test_error_keeps_partial_content_without_sources() {
        let (mut router, _rx) = router();
        let id = AnswerId::from("a");
        router.begin(Answer::placeholder(id.clone(), "q", None));
        router.route(
            &id,
            SequencedEvent::new(
                1,
                StreamEvent::SourcesReady {
                    sources: vec![raw_source("https://a.org/1")],
                },
            ),
        );
        router.route(&id, token(2, "partial "));

        let outcome = router.route(
            &id,
            SequencedEvent::new(
                3,
                StreamEvent::Error(crate::ingress::RawStreamError {
                    message: "upstream exploded".to_string(),
                    code: None,
                }),
            ),
        );
        match outcome {
            RouteOutcome::Finished(finalized) => {
                assert_eq!(finalized.answer.content, "partial");
                assert!(finalized.answer.sources.is_empty());
                assert!(finalized.persist);
                assert!(matches!(finalized.outcome, QueryOutcome::Failed(_)));
            }
            other => panic!("Expected Finished, got {:?}", other),
        }
        let status = router.status();
        assert!(!status.loading);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_reflection_before_round_is_attached_later() {
        let (mut router, _rx) = router();
        let id = AnswerId::from("a");
        router.begin(Answer::placeholder(id.clone(), "q", None));
        router.route(
            &id,
            SequencedEvent::new(
                1,
                StreamEvent::ReflectionComplete(RawReflection {
                    round: 1,
                    evidence_quality: Some("strong".to_string()),
                    should_continue: false,
                    reasoning: "enough".to_string(),
                }),
            ),
        );
        router.route(
            &id,
            SequencedEvent::new(
                2,
                StreamEvent::RoundStarted(RawRoundStarted {
                    round: 1,
                    query: "q".to_string(),
                }),
            ),
        );
        let answer = router.store().get(&id).cloned().expect("answer");
        let round = answer.round(1).expect("round");
        assert_eq!(round.reflection_status, ReflectionStatus::Received);
        assert_eq!(
            round.reflection.as_ref().map(|r| r.evidence_quality),
            Some(EvidenceQuality::Strong)
        );
    }

    #[tokio::test]
    async fn test_reflection_deadline_marks_timed_out() {
        let (mut router, _rx) = router();
        let id = AnswerId::from("a");
        router.begin(Answer::placeholder(id.clone(), "q", None));
        router.route(
            &id,
            SequencedEvent::new(
                1,
                StreamEvent::RoundStarted(RawRoundStarted {
                    round: 1,
                    query: "q".to_string(),
                }),
            ),
        );
        router.route(&id, SequencedEvent::new(2, StreamEvent::ReflectionStarted { round: 1 }));
        router.on_reflection_deadline(&id, 1);

        let status = router
            .store()
            .get(&id)
            .and_then(|a| a.round(1))
            .map(|r| r.reflection_status);
        assert_eq!(status, Some(ReflectionStatus::TimedOut));
    }
}
