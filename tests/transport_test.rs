use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use delve::engine::{DelveEngine, EngineConfig};
use delve::ingress::{SequencedEvent, StreamEvent};
use delve::persistence::MemoryStore;
use delve::transport::{HttpTransport, QueryRequest, ResearchTransport};
use delve::types::*;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

async fn spawn_server(app: Router) -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("Failed to bind test listener: {:?}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("Failed to read listener address: {:?}", e),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}/research/stream", addr)
}

/// Echoes the posted query back as the first token, the way a real stream would start.
async fn research_stream(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    let query = body["query"].as_str().unwrap_or_default().to_string();
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret-key");
    let token = serde_json::json!({
        "sequence": 1,
        "type": "token",
        "data": { "content": format!("{} ", query) }
    });
    let tier = serde_json::json!({ "sequence": 2, "type": "tier_selected", "data": 2 });
    let complete = serde_json::json!({
        "sequence": 3,
        "type": "complete",
        "data": {
            "content": format!("Answer to {} (auth: {})", query, authorized),
            "sources": [{
                "url": "https://pubmed.ncbi.nlm.nih.gov/1",
                "title": "A trial",
                "credibility": "clinical_trial"
            }]
        }
    });
    let body = format!(
        "event: token\ndata: {}\n\n: keep-alive\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
        token, tier, complete
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn overloaded() -> impl IntoResponse {
    (StatusCode::SERVICE_UNAVAILABLE, "model overloaded")
}

fn request(query: &str) -> QueryRequest {
    QueryRequest {
        answer_id: AnswerId::from("answer-1"),
        query: query.to_string(),
        user_id: UserId("tester".to_string()),
        image: None,
    }
}

fn transport(endpoint: String) -> HttpTransport {
    let client = match HttpTransport::build_client(Duration::from_secs(2)) {
        Ok(c) => c,
        Err(e) => panic!("Failed to build client: {:?}", e),
    };
    HttpTransport::new(client, endpoint).with_api_key(Some("secret-key".to_string()))
}

#[tokio::test]
async fn test_http_transport_decodes_event_stream() {
    let endpoint = spawn_server(Router::new().route("/research/stream", post(research_stream))).await;
    let stream = match transport(endpoint).open(&request("is tea good?"), 1).await {
        Ok(s) => s,
        Err(e) => panic!("Failed to open stream: {:?}", e),
    };

    let events: Vec<SequencedEvent> = stream
        .map(|r| match r {
            Ok(event) => event,
            Err(e) => panic!("stream error: {:?}", e),
        })
        .collect()
        .await;

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(
        events[0].event,
        StreamEvent::Token {
            content: "is tea good? ".to_string()
        }
    );
    match &events[2].event {
        StreamEvent::Complete(complete) => {
            assert_eq!(
                complete.content.as_deref(),
                Some("Answer to is tea good? (auth: true)")
            );
            assert_eq!(complete.sources.len(), 1);
        }
        other => panic!("Expected Complete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_http_transport_maps_error_status() {
    let endpoint = spawn_server(Router::new().route("/research/stream", post(overloaded))).await;
    match transport(endpoint).open(&request("q"), 1).await {
        Ok(_) => panic!("Expected an upstream error"),
        Err(e) => {
            match &e.inner {
                DelveError::Upstream(status, body) => {
                    assert_eq!(*status, 503);
                    assert!(body.contains("overloaded"));
                }
                other => panic!("Expected Upstream, got {:?}", other),
            }
            assert!(e.inner.is_transport());
        }
    }
}

#[tokio::test]
async fn test_engine_streams_over_http() {
    let endpoint = spawn_server(Router::new().route("/research/stream", post(research_stream))).await;
    let config = EngineConfig {
        stage_dwell: Duration::ZERO,
        ..EngineConfig::default()
    };
    let engine = DelveEngine::start(
        config,
        Arc::new(transport(endpoint)),
        Arc::new(MemoryStore::new()),
    );

    let id = engine.submit("does zinc help colds?", None).await.expect("submit");
    let idle = engine.wait_until_idle().await.expect("idle");
    assert_eq!(idle.error, None);

    let answer = match engine.answer(&id).await {
        Ok(Some(a)) => a,
        other => panic!("answer missing: {:?}", other.is_ok()),
    };
    assert_eq!(answer.content, "Answer to does zinc help colds? (auth: true)");
    assert_eq!(answer.tier, Some(Tier::HybridResearch));
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].domain, "pubmed.ncbi.nlm.nih.gov");
}
