use crate::dedup::Admission;
use crate::ingress::{EventKind, StreamEvent};
use crate::types::AnswerId;
use colored::*;
use std::panic;
use std::time::Instant;
use tracing::{error, info};

/// Sets up a global panic hook that logs panics using tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-answer stream counters, summarized once when the answer stops streaming.
#[derive(Debug)]
pub struct StreamMetric {
    pub started: Instant,
    pub events: usize,
    pub tokens: usize,
    pub text_chars: usize,
    pub duplicates: usize,
    pub rounds: usize,
    pub sources: usize,
    pub reconnects: u32,
}

impl Default for StreamMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetric {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: 0,
            tokens: 0,
            text_chars: 0,
            duplicates: 0,
            rounds: 0,
            sources: 0,
            reconnects: 0,
        }
    }

    pub fn record_admission(&mut self, admission: Admission) {
        if admission == Admission::Duplicate {
            self.duplicates += 1;
        }
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        self.events += 1;
        match event {
            StreamEvent::Token { content } => {
                self.tokens += 1;
                self.text_chars += content.len();
            }
            StreamEvent::RoundComplete(round) => {
                self.rounds += 1;
                self.sources += round.sources.len();
            }
            StreamEvent::SearchComplete { sources } | StreamEvent::SourcesReady { sources } => {
                self.sources += sources.len();
            }
            _ => {}
        }
    }

    pub fn log_summary(&self, answer_id: &AnswerId, outcome: &str) {
        let elapsed = self.started.elapsed();
        let line = format!(
            "[STREAM END] Answer: {} | Outcome: {} | Events: {} | Tokens: {} ({} chars) | Rounds: {} | Sources: {} | Dupes: {} | Reconnects: {} | {:.1}s",
            answer_id.short(),
            outcome,
            self.events,
            self.tokens,
            self.text_chars,
            self.rounds,
            self.sources,
            self.duplicates,
            self.reconnects,
            elapsed.as_secs_f64()
        );
        if outcome == "complete" {
            info!(target: "flight_recorder", "{}", line);
        } else {
            info!(target: "flight_recorder", "{}", line.as_str().yellow());
        }
    }
}

/// Short label for log lines.
pub fn kind_label(kind: EventKind) -> String {
    format!("{:?}", kind).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::RawRoundComplete;

    #[test]
    fn test_metric_counts_tokens_and_rounds() {
        let mut metric = StreamMetric::new();
        metric.record_event(&StreamEvent::Token {
            content: "abc".to_string(),
        });
        metric.record_event(&StreamEvent::RoundComplete(RawRoundComplete {
            round: 1,
            ..RawRoundComplete::default()
        }));
        metric.record_admission(Admission::Duplicate);
        metric.record_admission(Admission::Process);

        assert_eq!(metric.events, 2);
        assert_eq!(metric.tokens, 1);
        assert_eq!(metric.text_chars, 3);
        assert_eq!(metric.rounds, 1);
        assert_eq!(metric.duplicates, 1);
    }
}
