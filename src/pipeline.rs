use crate::kernel::Wakeup;
use crate::types::AnswerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Every fragment is forwarded as soon as it arrives.
    Immediate,
    /// Fragments are coalesced per answer and flushed after `window` of quiet.
    Debounced { window: Duration },
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::Immediate
    }
}

struct PendingTokens {
    buffer: String,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Forwards token fragments to the answer store, preserving append order.
///
/// Debounce timers never deliver on their own; they post a
/// [`Wakeup::FlushTokens`] back to the coordinating context, which then calls
/// [`TokenPipeline::flush_due`]. A cancelled answer's buffer is gone by then, so
/// a late timer delivers nothing.
pub struct TokenPipeline {
    policy: DeliveryPolicy,
    pending: HashMap<AnswerId, PendingTokens>,
    wakeups: mpsc::UnboundedSender<Wakeup>,
    next_generation: u64,
}

impl TokenPipeline {
    pub fn new(policy: DeliveryPolicy, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
            wakeups,
            next_generation: 0,
        }
    }

    pub fn append<F>(&mut self, token: &str, answer_id: &AnswerId, mut deliver: F)
    where
        F: FnMut(&AnswerId, &str),
    {
        if token.is_empty() {
            return;
        }
        let window = match self.policy {
            DeliveryPolicy::Immediate => {
                deliver(answer_id, token);
                return;
            }
            DeliveryPolicy::Debounced { window } => window,
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let entry = self
            .pending
            .entry(answer_id.clone())
            .or_insert_with(|| PendingTokens {
                buffer: String::new(),
                generation,
                timer: None,
            });
        entry.buffer.push_str(token);
        entry.generation = generation;
        if let Some(previous) = entry.timer.take() {
            previous.abort();
        }

        let wakeups = self.wakeups.clone();
        let id = answer_id.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = wakeups.send(Wakeup::FlushTokens {
                answer_id: id,
                generation,
            });
        }));
    }

    /// Called when a debounce timer fires; flushes only if no newer fragment restarted the window.
    pub fn flush_due<F>(&mut self, answer_id: &AnswerId, generation: u64, deliver: F)
    where
        F: FnMut(&AnswerId, &str),
    {
        let is_current = self
            .pending
            .get(answer_id)
            .is_some_and(|p| p.generation == generation);
        if is_current {
            self.flush_remaining(answer_id, deliver);
        }
    }

    /// Force-delivers whatever is buffered for the answer.
    pub fn flush_remaining<F>(&mut self, answer_id: &AnswerId, mut deliver: F)
    where
        F: FnMut(&AnswerId, &str),
    {
        if let Some(pending) = self.pending.remove(answer_id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            if !pending.buffer.is_empty() {
                deliver(answer_id, &pending.buffer);
            }
        }
    }

    /// Discards buffered fragments; nothing further is delivered for this answer.
    pub fn cancel(&mut self, answer_id: &AnswerId) {
        if let Some(pending) = self.pending.remove(answer_id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            if !pending.buffer.is_empty() {
                tracing::debug!(
                    "[⚙️ ] Discarded {} buffered chars for {}",
                    pending.buffer.len(),
                    answer_id.short()
                );
            }
        }
    }

    pub fn has_pending(&self, answer_id: &AnswerId) -> bool {
        self.pending.contains_key(answer_id)
    }
}

impl Drop for TokenPipeline {
    fn drop(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}
