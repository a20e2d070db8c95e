use crate::constants::{MAX_EVENT_BYTES, SENTINEL_SOURCE_URL, SSE_DATA_PREFIX, SSE_DONE_MARKER};
use crate::str_utils;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every event kind the research service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Token,
    TierSelected,
    SearchComplete,
    SourcesReady,
    RoundStarted,
    RoundComplete,
    ReflectionStarted,
    ReflectionComplete,
    PlanningStarted,
    PlanningComplete,
    ApiStarted,
    SourceSelectionStarted,
    SynthesisPreparation,
    SynthesisStarted,
    Complete,
    Error,
}

impl EventKind {
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace('-', "_");
        let kind = match normalized.as_str() {
            "token" => EventKind::Token,
            "tier_selected" => EventKind::TierSelected,
            "search_complete" => EventKind::SearchComplete,
            "sources_ready" => EventKind::SourcesReady,
            "round_started" => EventKind::RoundStarted,
            "round_complete" => EventKind::RoundComplete,
            "reflection_started" => EventKind::ReflectionStarted,
            "reflection_complete" => EventKind::ReflectionComplete,
            "planning_started" => EventKind::PlanningStarted,
            "planning_complete" => EventKind::PlanningComplete,
            "api_started" => EventKind::ApiStarted,
            "source_selection_started" => EventKind::SourceSelectionStarted,
            "synthesis_preparation" => EventKind::SynthesisPreparation,
            "synthesis_started" => EventKind::SynthesisStarted,
            "complete" => EventKind::Complete,
            "error" => EventKind::Error,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawSource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default, alias = "publishedDate", alias = "published_at")]
    pub published_date: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, alias = "source_type", alias = "sourceType")]
    pub credibility: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawRoundStarted {
    pub round: u32,
    #[serde(default)]
    pub query: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawRoundComplete {
    pub round: u32,
    #[serde(default)]
    pub query: String,
    #[serde(default, alias = "sourceMix")]
    pub source_mix: BTreeMap<String, u32>,
    #[serde(default, deserialize_with = "lenient_sources")]
    pub sources: Vec<RawSource>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "durationMs")]
    pub duration_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawReflection {
    pub round: u32,
    #[serde(default, alias = "evidenceQuality")]
    pub evidence_quality: Option<String>,
    #[serde(default, alias = "shouldContinue")]
    pub should_continue: bool,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawComplete {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tier: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient_sources")]
    pub sources: Vec<RawSource>,
    #[serde(default, alias = "summary")]
    pub thinking: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RawStreamError {
    #[serde(default)]
    pub message: String,
    /// Numeric status codes and symbolic codes such as `RATE_LIMITED` are both accepted.
    #[serde(default, deserialize_with = "lenient_code")]
    pub code: Option<String>,
}

/// Decodes a source list entry by entry, so one malformed source cannot sink
/// the event that carries it.
fn lenient_sources<'de, D>(deserializer: D) -> std::result::Result<Vec<RawSource>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Null => return Ok(Vec::new()),
        other => {
            tracing::warn!(
                "[📡 -> ⚙️ ] Ignoring non-list sources field: {}",
                str_utils::prefix_chars(&other.to_string(), 120)
            );
            return Ok(Vec::new());
        }
    };
    let total = entries.len();
    let sources: Vec<RawSource> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<RawSource>(entry) {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("[📡 -> ⚙️ ] Dropping malformed source #{}: {}", i, e);
                None
            }
        })
        .collect();
    if sources.len() < total {
        tracing::debug!("[📡 -> ⚙️ ] Decoded {}/{} sources", sources.len(), total);
    }
    Ok(sources)
}

fn lenient_code<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let code = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    };
    Ok(code)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token { content: String },
    TierSelected { tier: serde_json::Value },
    SearchComplete { sources: Vec<RawSource> },
    SourcesReady { sources: Vec<RawSource> },
    RoundStarted(RawRoundStarted),
    RoundComplete(RawRoundComplete),
    ReflectionStarted { round: u32 },
    ReflectionComplete(RawReflection),
    PlanningStarted,
    PlanningComplete { plan: Option<Plan> },
    ApiStarted,
    SourceSelectionStarted,
    SynthesisPreparation,
    SynthesisStarted,
    Complete(RawComplete),
    Error(RawStreamError),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Token { .. } => EventKind::Token,
            StreamEvent::TierSelected { .. } => EventKind::TierSelected,
            StreamEvent::SearchComplete { .. } => EventKind::SearchComplete,
            StreamEvent::SourcesReady { .. } => EventKind::SourcesReady,
            StreamEvent::RoundStarted(_) => EventKind::RoundStarted,
            StreamEvent::RoundComplete(_) => EventKind::RoundComplete,
            StreamEvent::ReflectionStarted { .. } => EventKind::ReflectionStarted,
            StreamEvent::ReflectionComplete(_) => EventKind::ReflectionComplete,
            StreamEvent::PlanningStarted => EventKind::PlanningStarted,
            StreamEvent::PlanningComplete { .. } => EventKind::PlanningComplete,
            StreamEvent::ApiStarted => EventKind::ApiStarted,
            StreamEvent::SourceSelectionStarted => EventKind::SourceSelectionStarted,
            StreamEvent::SynthesisPreparation => EventKind::SynthesisPreparation,
            StreamEvent::SynthesisStarted => EventKind::SynthesisStarted,
            StreamEvent::Complete(_) => EventKind::Complete,
            StreamEvent::Error(_) => EventKind::Error,
        }
    }

    /// `complete` and `error` end a query's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete(_) | StreamEvent::Error(_))
    }
}

/// A stream event tagged with its server-assigned dedup sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub answer_id: Option<AnswerId>,
    pub event: StreamEvent,
}

impl SequencedEvent {
    pub fn new(sequence: u64, event: StreamEvent) -> Self {
        Self {
            sequence,
            answer_id: None,
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[derive(Debug)]
pub enum LineEvent {
    Event(SequencedEvent),
    Done,
    Unknown(String),
}

#[derive(Deserialize, Debug)]
struct RawEnvelope {
    sequence: u64,
    #[serde(rename = "type", alias = "event")]
    kind: String,
    #[serde(default, alias = "answerId")]
    answer_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(alias = "token", alias = "text")]
    content: String,
}

#[derive(Deserialize)]
struct TierPayload {
    #[serde(alias = "tier_code")]
    tier: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct SourcesPayload {
    #[serde(default, deserialize_with = "lenient_sources")]
    sources: Vec<RawSource>,
}

#[derive(Deserialize)]
struct RoundNumberPayload {
    round: u32,
}

#[derive(Deserialize, Default)]
struct PlanPayload {
    #[serde(default, alias = "estimatedRounds", alias = "rounds")]
    estimated_rounds: Option<u32>,
}

/// Parses a single SSE line, with or without its `data: ` prefix.
pub fn parse_event_line(line: &str) -> LineEvent {
    let data = line.strip_prefix(SSE_DATA_PREFIX).unwrap_or(line).trim();
    if data == SSE_DONE_MARKER {
        return LineEvent::Done;
    }
    if data.is_empty() || data.starts_with(':') || data.len() > MAX_EVENT_BYTES {
        return LineEvent::Unknown(str_utils::prefix_chars(data, 200).to_string());
    }

    let envelope: RawEnvelope = match serde_json::from_str(data) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!("[📡 -> ⚙️ ] Malformed event envelope: {}", e);
            return LineEvent::Unknown(str_utils::prefix_chars(data, 200).to_string());
        }
    };

    let kind = match EventKind::parse(&envelope.kind) {
        Some(k) => k,
        None => {
            tracing::debug!("[📡 -> ⚙️ ] Unknown event type: {}", envelope.kind);
            return LineEvent::Unknown(envelope.kind);
        }
    };

    match decode_payload(kind, envelope.data) {
        Ok(event) => LineEvent::Event(SequencedEvent {
            sequence: envelope.sequence,
            answer_id: envelope.answer_id.map(AnswerId),
            event,
        }),
        Err(e) => {
            tracing::warn!(
                "[📡 -> ⚙️ ] Undecodable {:?} payload (seq {}): {}",
                kind,
                envelope.sequence,
                e
            );
            LineEvent::Unknown(envelope.kind)
        }
    }
}

fn decode_payload(
    kind: EventKind,
    data: serde_json::Value,
) -> std::result::Result<StreamEvent, serde_json::Error> {
    let data = match data {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };

    let event = match kind {
        EventKind::Token => match data {
            serde_json::Value::String(content) => StreamEvent::Token { content },
            other => {
                let payload: TokenPayload = serde_json::from_value(other)?;
                StreamEvent::Token {
                    content: payload.content,
                }
            }
        },
        EventKind::TierSelected => match data {
            serde_json::Value::Object(_) => {
                let payload: TierPayload = serde_json::from_value(data)?;
                StreamEvent::TierSelected { tier: payload.tier }
            }
            raw => StreamEvent::TierSelected { tier: raw },
        },
        EventKind::SearchComplete => {
            let payload: SourcesPayload = serde_json::from_value(data)?;
            StreamEvent::SearchComplete {
                sources: payload.sources,
            }
        }
        EventKind::SourcesReady => {
            let payload: SourcesPayload = serde_json::from_value(data)?;
            StreamEvent::SourcesReady {
                sources: payload.sources,
            }
        }
        EventKind::RoundStarted => StreamEvent::RoundStarted(serde_json::from_value(data)?),
        EventKind::RoundComplete => StreamEvent::RoundComplete(serde_json::from_value(data)?),
        EventKind::ReflectionStarted => {
            let payload: RoundNumberPayload = serde_json::from_value(data)?;
            StreamEvent::ReflectionStarted {
                round: payload.round,
            }
        }
        EventKind::ReflectionComplete => {
            StreamEvent::ReflectionComplete(serde_json::from_value(data)?)
        }
        EventKind::PlanningStarted => StreamEvent::PlanningStarted,
        EventKind::PlanningComplete => {
            let payload: PlanPayload = serde_json::from_value(data).unwrap_or_default();
            StreamEvent::PlanningComplete {
                plan: payload
                    .estimated_rounds
                    .map(|estimated_rounds| Plan { estimated_rounds }),
            }
        }
        EventKind::ApiStarted => StreamEvent::ApiStarted,
        EventKind::SourceSelectionStarted => StreamEvent::SourceSelectionStarted,
        EventKind::SynthesisPreparation => StreamEvent::SynthesisPreparation,
        EventKind::SynthesisStarted => StreamEvent::SynthesisStarted,
        EventKind::Complete => StreamEvent::Complete(serde_json::from_value(data)?),
        EventKind::Error => match data {
            serde_json::Value::String(message) => StreamEvent::Error(RawStreamError {
                message,
                code: None,
            }),
            other => StreamEvent::Error(serde_json::from_value(other)?),
        },
    };
    Ok(event)
}

impl RawSource {
    /// Converts a wire source, or `None` when it has no credibility class or no usable location.
    pub fn into_source(self, fallback_index: usize) -> Option<Source> {
        let credibility = match self.credibility.as_deref().and_then(Credibility::parse) {
            Some(c) => c,
            None => {
                tracing::debug!(
                    "[⚙️ ] Dropping source without credibility class: {:?}",
                    self.url.as_ref().or(self.link.as_ref())
                );
                return None;
            }
        };

        let declared_domain = self
            .domain
            .as_ref()
            .map(|d| d.trim().trim_start_matches("www.").to_string())
            .filter(|d| !d.is_empty());

        let candidate = self
            .url
            .as_ref()
            .or(self.link.as_ref())
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());

        let url = match (candidate, declared_domain.as_ref()) {
            (Some(u), _) if str_utils::is_web_url(&u) => u,
            (_, Some(domain)) => format!("https://{}", domain),
            (Some(u), None) => {
                tracing::warn!(
                    "[⚙️ ] Source URL '{}' is unusable and has no domain; substituting placeholder",
                    str_utils::prefix_chars(&u, 120)
                );
                SENTINEL_SOURCE_URL.to_string()
            }
            (None, None) => {
                tracing::debug!("[⚙️ ] Dropping source without URL or domain");
                return None;
            }
        };

        let domain = declared_domain
            .or_else(|| str_utils::domain_of(&url))
            .unwrap_or_default();

        Some(Source {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("source_{}", fallback_index)),
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| domain.clone()),
            url,
            domain,
            snippet: self.snippet.unwrap_or_default(),
            published_date: self.published_date,
            author: self.author,
            credibility,
        })
    }
}

/// Converts a batch, dropping malformed entries individually.
pub fn convert_sources(raw: Vec<RawSource>) -> Vec<Source> {
    let total = raw.len();
    let converted: Vec<Source> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, s)| s.into_source(i))
        .collect();
    if converted.len() < total {
        tracing::debug!(
            "[⚙️ ] Converted {}/{} sources ({} dropped)",
            converted.len(),
            total,
            total - converted.len()
        );
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_event(line: &str) -> SequencedEvent {
        match parse_event_line(line) {
            LineEvent::Event(e) => e,
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_token_line() {
        let event = expect_event(r#"data: {"sequence":4,"type":"token","data":{"content":"Hel"}}"#);
        assert_eq!(event.sequence, 4);
        assert_eq!(
            event.event,
            StreamEvent::Token {
                content: "Hel".to_string()
            }
        );
    }

    #[test]
    fn test_parse_accepts_kebab_case_and_bare_payloads() {
        let event = expect_event(r#"{"sequence":1,"type":"tier-selected","data":3}"#);
        assert_eq!(event.kind(), EventKind::TierSelected);

        let event = expect_event(r#"{"sequence":2,"type":"synthesis-started"}"#);
        assert_eq!(event.event, StreamEvent::SynthesisStarted);
    }

    #[test]
    fn test_parse_round_complete() {
        let line = r#"data: {"sequence":9,"type":"round_complete","answer_id":"a1","data":{"round":1,"status":"failed","sources":[],"source_mix":{"pubmed":0}}}"#;
        let event = expect_event(line);
        assert_eq!(event.answer_id, Some(AnswerId::from("a1")));
        match event.event {
            StreamEvent::RoundComplete(rc) => {
                assert_eq!(rc.round, 1);
                assert_eq!(rc.status.as_deref(), Some("failed"));
                assert!(rc.sources.is_empty());
            }
            other => panic!("Expected RoundComplete, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_done_and_unknown() {
        assert!(matches!(parse_event_line("data: [DONE]"), LineEvent::Done));
        assert!(matches!(
            parse_event_line(r#"{"sequence":1,"type":"heartbeat"}"#),
            LineEvent::Unknown(_)
        ));
        assert!(matches!(parse_event_line("data: {oops"), LineEvent::Unknown(_)));
        assert!(matches!(parse_event_line(": keep-alive"), LineEvent::Unknown(_)));
    }

    #[test]
    fn test_source_conversion_rules() {
        let good = RawSource {
            url: Some("https://www.nejm.org/doi/1".into()),
            credibility: Some("peer_reviewed".into()),
            ..RawSource::default()
        };
        let source = good.into_source(0).expect("convertible");
        assert_eq!(source.domain, "nejm.org");
        assert_eq!(source.title, "nejm.org");
        assert_eq!(source.id, "source_0");

        let no_credibility = RawSource {
            url: Some("https://example.org".into()),
            ..RawSource::default()
        };
        assert!(no_credibility.into_source(1).is_none());

        let domain_only = RawSource {
            domain: Some("who.int".into()),
            credibility: Some("medical".into()),
            ..RawSource::default()
        };
        assert_eq!(domain_only.into_source(2).map(|s| s.url).as_deref(), Some("https://who.int"));

        let broken = RawSource {
            url: Some("pubmed:123".into()),
            credibility: Some("clinical-trial".into()),
            ..RawSource::default()
        };
        assert_eq!(broken.into_source(3).map(|s| s.url).as_deref(), Some(SENTINEL_SOURCE_URL));

        let nothing = RawSource {
            credibility: Some("expert".into()),
            ..RawSource::default()
        };
        assert!(nothing.into_source(4).is_none());
    }

    #[test]
    fn test_malformed_source_is_dropped_not_the_event() {
        let line = r#"data: {"sequence":12,"type":"complete","data":{"content":"Done.","sources":[{"url":"https://a.org/1","credibility":"peer_reviewed"},{"url":"https://b.org/2","author":["A","B"],"credibility":"expert"}]}}"#;
        match expect_event(line).event {
            StreamEvent::Complete(complete) => {
                assert_eq!(complete.content.as_deref(), Some("Done."));
                assert_eq!(complete.sources.len(), 1);
                assert_eq!(complete.sources[0].url.as_deref(), Some("https://a.org/1"));
            }
            other => panic!("Expected Complete, got {:?}", other),
        }

        let line = r#"{"sequence":5,"type":"round_complete","data":{"round":2,"sources":[{"url":"https://c.org/3","credibility":"medical"},{"url":"https://d.org/4","published_date":20240101,"credibility":"medical"}]}}"#;
        match expect_event(line).event {
            StreamEvent::RoundComplete(rc) => {
                assert_eq!(rc.round, 2);
                assert_eq!(rc.sources.len(), 1);
            }
            other => panic!("Expected RoundComplete, got {:?}", other),
        }

        let line = r#"{"sequence":6,"type":"sources_ready","data":{"sources":[42,{"domain":"who.int","credibility":"medical"}]}}"#;
        match expect_event(line).event {
            StreamEvent::SourcesReady { sources } => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].domain.as_deref(), Some("who.int"));
            }
            other => panic!("Expected SourcesReady, got {:?}", other),
        }
    }

    #[test]
    fn test_error_code_accepts_strings_and_numbers() {
        let event = expect_event(
            r#"{"sequence":3,"type":"error","data":{"message":"slow down","code":"RATE_LIMITED"}}"#,
        );
        assert_eq!(
            event.event,
            StreamEvent::Error(RawStreamError {
                message: "slow down".to_string(),
                code: Some("RATE_LIMITED".to_string()),
            })
        );

        let event = expect_event(r#"{"sequence":4,"type":"error","data":{"message":"bad gateway","code":502}}"#);
        match event.event {
            StreamEvent::Error(error) => assert_eq!(error.code.as_deref(), Some("502")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }
}
