use delve::dedup::Admission;
use delve::ingress::*;
use delve::kernel::Wakeup;
use delve::pipeline::DeliveryPolicy;
use delve::router::{QueryOutcome, RouteOutcome, RouterConfig, StreamRouter};
use delve::store::StoreChange;
use delve::types::*;
use std::time::Duration;
use tokio::sync::mpsc;

fn router_with(policy: DeliveryPolicy, dwell: Duration) -> (StreamRouter, mpsc::UnboundedReceiver<Wakeup>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = RouterConfig {
        delivery_policy: policy,
        stage_dwell: dwell,
        reflection_timeout: Duration::from_secs(60),
    };
    (StreamRouter::new(config, tx), rx)
}

fn router() -> (StreamRouter, mpsc::UnboundedReceiver<Wakeup>) {
    router_with(DeliveryPolicy::Immediate, Duration::ZERO)
}

fn start(router: &mut StreamRouter, id: &str) -> AnswerId {
    let id = AnswerId::from(id);
    router.begin(Answer::placeholder(id.clone(), "does magnesium help sleep?", None));
    id
}

fn src(url: &str) -> RawSource {
    RawSource {
        url: Some(url.to_string()),
        title: Some(format!("title for {}", url)),
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

fn round_complete(seq: u64, round: u32, urls: &[&str], status: &str) -> SequencedEvent {
    SequencedEvent::new(
        seq,
        StreamEvent::RoundComplete(RawRoundComplete {
            round,
            query: format!("round {} query", round),
            sources: urls.iter().map(|u| src(u)).collect(),
            status: Some(status.to_string()),
            ..RawRoundComplete::default()
        }),
    )
}

fn complete(seq: u64, content: &str, urls: &[&str]) -> SequencedEvent {
    SequencedEvent::new(
        seq,
        StreamEvent::Complete(RawComplete {
            content: Some(content.to_string()),
            tier: Some(serde_json::json!("hybrid")),
            sources: urls.iter().map(|u| src(u)).collect(),
            thinking: None,
        }),
    )
}

fn urls(router: &StreamRouter, id: &AnswerId) -> Vec<String> {
    router
        .store()
        .get(id)
        .map(|a| a.sources.iter().map(|s| s.url.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_round_sources_merge_without_duplicates_in_first_seen_order() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");

    router.route(&id, round_complete(1, 1, &["https://a.org/1", "https://b.org/2"], "complete"));
    assert_eq!(urls(&router, &id), vec!["https://a.org/1", "https://b.org/2"]);

    router.route(
        &id,
        round_complete(2, 2, &["https://b.org/2", "https://c.org/3", "https://a.org/1"], "complete"),
    );
    router.route(&id, round_complete(3, 3, &["https://c.org/3", "https://d.org/4"], "complete"));

    assert_eq!(
        urls(&router, &id),
        vec!["https://a.org/1", "https://b.org/2", "https://c.org/3", "https://d.org/4"]
    );
    let answer = router.store().get(&id).cloned().expect("answer");
    let numbers: Vec<u32> = answer.rounds.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_content_never_shrinks_while_streaming() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    let mut last_len = 0;
    for (i, fragment) in ["Mag", "nesium ", "may ", "", "help."].iter().enumerate() {
        router.route(&id, token(i as u64 + 1, fragment));
        let len = router.store().get(&id).map(|a| a.content.len()).unwrap_or(0);
        assert!(len >= last_len, "content shrank from {} to {}", last_len, len);
        last_len = len;
    }
    assert_eq!(
        router.store().get(&id).map(|a| a.content.clone()),
        Some("Magnesium may help.".to_string())
    );
}

#[tokio::test]
async fn test_duplicate_event_is_idempotent() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");

    router.route(&id, token(7, "once"));
    let before = router.store().get(&id).cloned();
    let outcome = router.route(&id, token(7, "once"));

    assert_eq!(outcome, RouteOutcome::Dropped(Admission::Duplicate));
    assert_eq!(router.store().get(&id).cloned(), before);
}

#[tokio::test]
async fn test_same_sequence_different_kind_is_processed() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, token(1, "text"));
    let outcome = router.route(
        &id,
        SequencedEvent::new(
            1,
            StreamEvent::TierSelected {
                tier: serde_json::json!(1),
            },
        ),
    );
    assert_eq!(outcome, RouteOutcome::Applied);
}

#[tokio::test]
async fn test_events_after_cancel_are_dropped() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, token(1, "partial"));

    let finalized = router.cancel(&id).expect("query was live");
    assert_eq!(finalized.outcome, QueryOutcome::Cancelled);
    assert!(finalized.persist);

    let before = router.store().get(&id).cloned();
    let outcome = router.route(&id, token(2, " more"));
    assert_eq!(outcome, RouteOutcome::Dropped(Admission::Stale));
    assert_eq!(router.store().get(&id).cloned(), before);
    assert_eq!(before.map(|a| a.content), Some("partial".to_string()));
    assert!(!router.status().loading);
}

#[tokio::test]
async fn test_cancel_discards_buffered_tokens() {
    let (mut router, mut rx) = router_with(
        DeliveryPolicy::Debounced {
            window: Duration::from_millis(20),
        },
        Duration::ZERO,
    );
    let id = start(&mut router, "a");
    router.route(&id, token(1, "buffered"));
    router.cancel(&id);

    if let Ok(Some(Wakeup::FlushTokens {
        answer_id,
        generation,
    })) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        router.on_tokens_due(&answer_id, generation);
    }
    assert_eq!(router.store().get(&id).map(|a| a.content.clone()), Some(String::new()));
}

#[tokio::test]
async fn test_round_one_failure_without_sources_is_fatal() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(
        &id,
        SequencedEvent::new(
            1,
            StreamEvent::RoundStarted(RawRoundStarted {
                round: 1,
                query: "magnesium sleep".to_string(),
            }),
        ),
    );

    let outcome = router.route(&id, round_complete(2, 1, &[], "failed"));
    match outcome {
        RouteOutcome::Finished(finalized) => {
            assert!(matches!(finalized.outcome, QueryOutcome::Failed(_)));
            assert!(!finalized.persist, "empty placeholder is not persisted");
        }
        other => panic!("Expected Finished, got {:?}", other),
    }
    assert!(router.status().error.is_some());
    assert!(!router.status().loading);

    let before = router.store().get(&id).cloned();
    let outcome = router.route(&id, round_complete(3, 2, &["https://late.org"], "complete"));
    assert_eq!(outcome, RouteOutcome::Dropped(Admission::Stale));
    assert_eq!(router.store().get(&id).cloned(), before);
}

#[tokio::test]
async fn test_failed_later_round_is_not_fatal() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, round_complete(1, 1, &["https://a.org"], "complete"));
    let outcome = router.route(&id, round_complete(2, 2, &[], "failed"));
    assert_eq!(outcome, RouteOutcome::Applied);
    assert!(router.is_live(&id));
}

#[tokio::test]
async fn test_complete_with_empty_sources_keeps_accumulated() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, round_complete(1, 1, &["https://a.org/1", "https://b.org/2"], "complete"));
    router.route(&id, round_complete(2, 2, &["https://c.org/3"], "complete"));
    router.route(&id, token(3, "draft"));

    let outcome = router.route(&id, complete(4, "  Final answer.  ", &[]));
    let finalized = match outcome {
        RouteOutcome::Finished(f) => f,
        other => panic!("Expected Finished, got {:?}", other),
    };
    assert_eq!(finalized.outcome, QueryOutcome::Completed);
    assert_eq!(finalized.answer.content, "Final answer.");
    assert_eq!(finalized.answer.sources.len(), 3);
    assert_eq!(finalized.answer.tier, Some(Tier::HybridResearch));
    assert!(!router.status().loading);
}

#[tokio::test]
async fn test_complete_prefers_fresh_sources() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, round_complete(1, 1, &["https://a.org/1"], "complete"));
    let outcome = router.route(
        &id,
        complete(2, "done", &["https://z.org/9", "https://z.org/9", "https://y.org/8"]),
    );
    match outcome {
        RouteOutcome::Finished(f) => {
            let got: Vec<String> = f.answer.sources.iter().map(|s| s.url.clone()).collect();
            assert_eq!(got, vec!["https://z.org/9", "https://y.org/8"]);
        }
        other => panic!("Expected Finished, got {:?}", other),
    }
}

#[tokio::test]
async fn test_writing_visible_until_immediate_first_token() {
    let (mut router, _rx) = router_with(DeliveryPolicy::Immediate, Duration::from_secs(5));
    let id = start(&mut router, "a");
    let stages = router.subscribe_stages();

    router.route(&id, SequencedEvent::new(1, StreamEvent::PlanningStarted));
    router.route(&id, SequencedEvent::new(2, StreamEvent::SynthesisStarted));
    assert_eq!(stages.borrow().get(&id).map(|v| v.stage), Some(Stage::Writing));

    router.route(&id, token(3, "A"));
    assert_eq!(stages.borrow().get(&id), None);
    assert_eq!(router.narration().current(&id), None);
}

#[tokio::test]
async fn test_unresolvable_sources_are_dropped_individually() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    let sources = vec![
        src("https://good.org/1"),
        RawSource {
            url: Some("https://no-class.org".to_string()),
            ..RawSource::default()
        },
        RawSource {
            credibility: Some("clinical_trial".to_string()),
            ..RawSource::default()
        },
        RawSource {
            domain: Some("www.nih.gov".to_string()),
            credibility: Some("medical_source".to_string()),
            ..RawSource::default()
        },
    ];
    router.route(&id, SequencedEvent::new(1, StreamEvent::SourcesReady { sources }));

    assert_eq!(urls(&router, &id), vec!["https://good.org/1", "https://nih.gov"]);
    assert!(!router.store().is_searching(&id));
}

#[tokio::test]
async fn test_searching_flag_reaches_observers() {
    let (mut router, _rx) = router();
    let mut changes = router.subscribe_store();
    let id = start(&mut router, "a");
    router.route(
        &id,
        SequencedEvent::new(
            1,
            StreamEvent::SourcesReady {
                sources: vec![src("https://a.org/1")],
            },
        ),
    );
    router.route(&id, complete(2, "Done.", &[]));

    let mut flags = Vec::new();
    while let Ok(change) = changes.try_recv() {
        if let StoreChange::Searching { answer_id, searching } = change {
            assert_eq!(answer_id, id);
            flags.push(searching);
        }
    }
    assert_eq!(flags, vec![true, false]);
}

#[tokio::test]
async fn test_answers_are_independent() {
    let (mut router, _rx) = router();
    let a = start(&mut router, "a");
    let b = start(&mut router, "b");
    router.route(&a, token(1, "alpha"));
    router.route(&b, token(1, "beta"));
    router.cancel(&a);
    router.route(&b, token(2, "!"));

    assert_eq!(router.store().get(&b).map(|x| x.content.clone()), Some("beta!".to_string()));
    assert!(router.status().loading, "b is still streaming");
    assert_eq!(router.store().answers()[0].id, b, "newest first");
}

#[tokio::test]
async fn test_clear_resets_everything() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    router.route(&id, token(1, "text"));
    router.clear();
    assert!(router.store().is_empty());
    assert!(!router.is_live(&id));
    assert_eq!(router.status(), EngineStatus::default());
}

#[tokio::test]
async fn test_debounced_tokens_arrive_after_quiet_window() {
    let (mut router, mut rx) = router_with(
        DeliveryPolicy::Debounced {
            window: Duration::from_millis(10),
        },
        Duration::ZERO,
    );
    let id = start(&mut router, "a");
    router.route(&id, token(1, "Mag"));
    router.route(&id, token(2, "nesium"));
    assert_eq!(router.store().get(&id).map(|a| a.content.clone()), Some(String::new()));

    let wakeup = match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(w)) => w,
        other => panic!("Expected a flush wakeup, got {:?}", other),
    };
    match wakeup {
        Wakeup::FlushTokens {
            answer_id,
            generation,
        } => router.on_tokens_due(&answer_id, generation),
        other => panic!("Expected FlushTokens, got {:?}", other),
    }
    assert_eq!(
        router.store().get(&id).map(|a| a.content.clone()),
        Some("Magnesium".to_string())
    );
}

#[tokio::test]
async fn test_error_flushes_buffered_tokens_as_partial_content() {
    let (mut router, _rx) = router_with(
        DeliveryPolicy::Debounced {
            window: Duration::from_secs(30),
        },
        Duration::ZERO,
    );
    let id = start(&mut router, "a");
    router.route(&id, token(1, "partial answer "));
    let outcome = router.route(
        &id,
        SequencedEvent::new(
            2,
            StreamEvent::Error(RawStreamError {
                message: "upstream exploded".to_string(),
                code: Some("502".to_string()),
            }),
        ),
    );
    match outcome {
        RouteOutcome::Finished(f) => {
            assert_eq!(f.answer.content, "partial answer");
            assert!(f.persist);
        }
        other => panic!("Expected Finished, got {:?}", other),
    }
    let error = router.status().error.unwrap_or_default();
    assert!(error.contains("upstream exploded"), "got {}", error);
}

#[tokio::test]
async fn test_event_for_another_answer_is_dropped() {
    let (mut router, _rx) = router();
    let id = start(&mut router, "a");
    let mut event = token(1, "misrouted");
    event.answer_id = Some(AnswerId::from("someone-else"));
    assert_eq!(router.route(&id, event), RouteOutcome::Dropped(Admission::Stale));
    assert_eq!(router.store().get(&id).map(|a| a.content.clone()), Some(String::new()));
}
