//! Stage narration: maps backend progress onto a few user-facing captions.
//!
//! Per answer the visible stage moves forward only
//! (`planning → round(n) → reflecting(n) → source selection → synthesis
//! preparation → gathering → writing`), each stage stays up for a minimum
//! dwell before the next replaces it, and the first content token clears
//! narration for good. Observers get a `watch` notification on every change.

use crate::kernel::Wakeup;
use crate::types::{AnswerId, Plan, Stage};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What observers see for one answer: the visible stage and the research plan, if known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageView {
    pub stage: Stage,
    pub plan: Option<Plan>,
}

impl StageView {
    pub fn caption(&self) -> String {
        self.stage.caption(self.plan.as_ref())
    }
}

pub type StageMap = HashMap<AnswerId, StageView>;

struct StageTrack {
    current: Option<Stage>,
    shown_at: Instant,
    queued: Option<Stage>,
    highest_requested: Option<(u8, u32)>,
    plan: Option<Plan>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    released: bool,
    finished: bool,
}

impl StageTrack {
    fn new() -> Self {
        Self {
            current: None,
            shown_at: Instant::now(),
            queued: None,
            highest_requested: None,
            plan: None,
            timer: None,
            generation: 0,
            released: false,
            finished: false,
        }
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct NarrationCoordinator {
    tracks: HashMap<AnswerId, StageTrack>,
    min_dwell: Duration,
    wakeups: mpsc::UnboundedSender<Wakeup>,
    tx: watch::Sender<StageMap>,
}

impl NarrationCoordinator {
    pub fn new(min_dwell: Duration, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        let (tx, _) = watch::channel(StageMap::new());
        Self {
            tracks: HashMap::new(),
            min_dwell,
            wakeups,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StageMap> {
        self.tx.subscribe()
    }

    /// Starts narration for a new query, discarding whatever the answer id showed before.
    pub fn begin(&mut self, answer_id: &AnswerId) {
        if let Some(mut old) = self.tracks.insert(answer_id.clone(), StageTrack::new()) {
            old.abort_timer();
        }
        self.publish(answer_id);
    }

    /// Records the plan; a visible caption picks it up right away.
    pub fn set_plan(&mut self, answer_id: &AnswerId, plan: Plan) {
        if let Some(track) = self.tracks.get_mut(answer_id) {
            track.plan = Some(plan);
            self.publish(answer_id);
        }
    }

    pub fn plan(&self, answer_id: &AnswerId) -> Option<Plan> {
        self.tracks.get(answer_id).and_then(|t| t.plan)
    }

    pub fn current(&self, answer_id: &AnswerId) -> Option<Stage> {
        self.tracks.get(answer_id).and_then(|t| t.current)
    }

    pub fn caption(&self, answer_id: &AnswerId) -> Option<String> {
        let track = self.tracks.get(answer_id)?;
        track.current.map(|stage| stage.caption(track.plan.as_ref()))
    }

    pub fn is_finished(&self, answer_id: &AnswerId) -> bool {
        self.tracks.get(answer_id).map_or(true, |t| t.finished)
    }

    /// Asks for `stage` to be shown. Stages that do not advance past what was
    /// already requested are ignored.
    pub fn request(&mut self, answer_id: &AnswerId, stage: Stage) {
        let min_dwell = self.min_dwell;
        let track = match self.tracks.get_mut(answer_id) {
            Some(t) if !t.finished => t,
            _ => return,
        };

        let rank = stage.rank();
        if track.highest_requested.is_some_and(|highest| rank <= highest) {
            tracing::trace!(
                "[⚙️ ] Ignoring superseded stage {:?} for {}",
                stage,
                answer_id.short()
            );
            return;
        }
        track.highest_requested = Some(rank);

        let elapsed = track.shown_at.elapsed();
        // Writing is never delayed: it must be on screen before content starts.
        let show_now = track.current.is_none()
            || track.released
            || elapsed >= min_dwell
            || stage == Stage::Writing;

        if show_now {
            track.abort_timer();
            track.queued = None;
            Self::show(track, stage);
            self.publish(answer_id);
            return;
        }

        track.queued = Some(stage);
        if track.timer.is_none() {
            track.generation += 1;
            let generation = track.generation;
            let delay = min_dwell.saturating_sub(elapsed);
            let wakeups = self.wakeups.clone();
            let id = answer_id.clone();
            track.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = wakeups.send(Wakeup::NarrationDue {
                    answer_id: id,
                    generation,
                });
            }));
        }
    }

    /// A dwell timer fired; show the queued stage if the timer is still current.
    pub fn on_dwell_elapsed(&mut self, answer_id: &AnswerId, generation: u64) {
        let track = match self.tracks.get_mut(answer_id) {
            Some(t) if !t.finished && t.generation == generation => t,
            _ => return,
        };
        track.timer = None;
        if let Some(stage) = track.queued.take() {
            Self::show(track, stage);
            self.publish(answer_id);
        }
    }

    /// Stops holding `stage` on screen (used when an awaited reflection never arrives).
    pub fn release(&mut self, answer_id: &AnswerId, stage: Stage) {
        let track = match self.tracks.get_mut(answer_id) {
            Some(t) if !t.finished && t.current == Some(stage) => t,
            _ => return,
        };
        track.released = true;
        if let Some(next) = track.queued.take() {
            track.abort_timer();
            Self::show(track, next);
            self.publish(answer_id);
        }
    }

    /// Content started streaming: clear narration regardless of the active stage.
    pub fn first_token(&mut self, answer_id: &AnswerId) {
        let track = match self.tracks.get_mut(answer_id) {
            Some(t) => t,
            None => return,
        };
        track.abort_timer();
        track.queued = None;
        track.current = None;
        track.finished = true;
        self.publish(answer_id);
    }

    /// Forgets the answer entirely (completion, failure, cancellation).
    pub fn finish(&mut self, answer_id: &AnswerId) {
        if let Some(mut track) = self.tracks.remove(answer_id) {
            track.abort_timer();
            self.publish(answer_id);
        }
    }

    pub fn finish_all(&mut self) {
        for (_, mut track) in self.tracks.drain() {
            track.abort_timer();
        }
        self.tx.send_replace(StageMap::new());
    }

    pub fn tracked_answers(&self) -> usize {
        self.tracks.len()
    }

    fn show(track: &mut StageTrack, stage: Stage) {
        track.current = Some(stage);
        track.shown_at = Instant::now();
        track.released = false;
    }

    fn publish(&self, answer_id: &AnswerId) {
        let view = self.tracks.get(answer_id).and_then(|track| {
            track.current.map(|stage| StageView {
                stage,
                plan: track.plan,
            })
        });
        self.tx.send_if_modified(|map| match view {
            Some(v) => map.insert(answer_id.clone(), v) != Some(v),
            None => map.remove(answer_id).is_some(),
        });
    }
}

impl Drop for NarrationCoordinator {
    fn drop(&mut self) {
        for (_, track) in self.tracks.iter_mut() {
            track.abort_timer();
        }
    }
}
