use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnswerId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl AnswerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for AnswerId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session_{}", Uuid::new_v4().simple()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for AnswerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AnswerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AnswerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- DOMAIN MODEL ---

/// Processing mode the research service picked for a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Fast,
    HybridResearch,
    DeepResearch,
}

impl Tier {
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "fast" | "1" => Some(Tier::Fast),
            "hybrid" | "hybrid-research" | "2" => Some(Tier::HybridResearch),
            "deep" | "deep-research" | "3" => Some(Tier::DeepResearch),
            _ => None,
        }
    }

    /// Resolves a raw tier code, either a string tag or an integer in `1..=3`.
    pub fn from_code(code: &serde_json::Value) -> Option<Self> {
        match code {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(1) => Some(Tier::Fast),
                Some(2) => Some(Tier::HybridResearch),
                Some(3) => Some(Tier::DeepResearch),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Tier::Fast => "fast",
            Tier::HybridResearch => "hybrid-research",
            Tier::DeepResearch => "deep-research",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Credibility {
    PeerReviewed,
    MedicalSource,
    ClinicalTrial,
    ExpertKnowledge,
}

impl Credibility {
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "peer-reviewed" | "peer-reviewed-study" | "journal" => Some(Credibility::PeerReviewed),
            "medical-source" | "medical" => Some(Credibility::MedicalSource),
            "clinical-trial" | "trial" => Some(Credibility::ClinicalTrial),
            "expert-knowledge" | "expert" => Some(Credibility::ExpertKnowledge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub title: String,
    pub snippet: String,
    pub published_date: Option<String>,
    pub author: Option<String>,
    pub credibility: Credibility,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    InProgress,
    Complete,
    Failed,
}

impl RoundStatus {
    /// Maps the wire status (`pending` / `complete` / `failed`).
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "pending" | "in_progress" | "in-progress" | "running" => Some(RoundStatus::InProgress),
            "complete" | "completed" | "done" => Some(RoundStatus::Complete),
            "failed" | "error" => Some(RoundStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceQuality {
    Strong,
    Moderate,
    Limited,
    Insufficient,
}

impl EvidenceQuality {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "strong" | "high" => EvidenceQuality::Strong,
            "moderate" | "medium" => EvidenceQuality::Moderate,
            "limited" | "low" | "weak" => EvidenceQuality::Limited,
            _ => EvidenceQuality::Insufficient,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reflection {
    pub round: u32,
    pub evidence_quality: EvidenceQuality,
    pub should_continue: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionStatus {
    #[default]
    NotStarted,
    Pending,
    Received,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoundTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub number: u32,
    pub query: String,
    pub source_mix: BTreeMap<String, u32>,
    pub sources: Vec<Source>,
    pub timing: RoundTiming,
    pub reflection: Option<Reflection>,
    #[serde(default)]
    pub reflection_status: ReflectionStatus,
    pub status: RoundStatus,
}

impl Round {
    pub fn started(number: u32, query: String) -> Self {
        Self {
            number,
            query,
            source_mix: BTreeMap::new(),
            sources: Vec::new(),
            timing: RoundTiming {
                started_at: Some(Utc::now()),
                ..RoundTiming::default()
            },
            reflection: None,
            reflection_status: ReflectionStatus::NotStarted,
            status: RoundStatus::InProgress,
        }
    }
}

/// Advisory estimate of how many rounds the service intends to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub estimated_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub query: String,
    pub content: String,
    pub sources: Vec<Source>,
    pub rounds: Vec<Round>,
    pub tier: Option<Tier>,
    pub thinking: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Answer {
    /// Empty answer shown the instant a query is submitted.
    pub fn placeholder(id: AnswerId, query: impl Into<String>, image: Option<String>) -> Self {
        Self {
            id,
            query: query.into(),
            content: String::new(),
            sources: Vec::new(),
            rounds: Vec::new(),
            tier: None,
            thinking: None,
            image,
            created_at: Utc::now(),
        }
    }

    /// Merges sources by URL, keeping first-seen order. Returns how many were added.
    pub fn merge_sources(&mut self, incoming: &[Source]) -> usize {
        let mut added = 0;
        for source in incoming {
            if self.sources.iter().any(|s| s.url == source.url) {
                continue;
            }
            self.sources.push(source.clone());
            added += 1;
        }
        added
    }

    pub fn round(&self, number: u32) -> Option<&Round> {
        self.rounds.iter().find(|r| r.number == number)
    }

    pub fn round_mut(&mut self, number: u32) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.number == number)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub answer_id: Option<AnswerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub title: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub messages: Vec<SessionMessage>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub metadata: Option<SessionMetadata>,
}

impl Session {
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: SessionId::new(),
            user_id,
            messages: Vec::new(),
            status: SessionStatus::Active,
            last_activity: Utc::now(),
            metadata: None,
        }
    }
}

/// User-facing narration label describing what the backend is doing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "stage", content = "round")]
pub enum Stage {
    Planning,
    Round(u32),
    Reflecting(u32),
    SourceSelection,
    SynthesisPreparation,
    Gathering,
    Writing,
}

impl Stage {
    /// Position in the narration order; a stage never replaces one of equal or higher rank.
    pub fn rank(&self) -> (u8, u32) {
        match self {
            Stage::Planning => (1, 0),
            Stage::Round(n) => (2, n.saturating_mul(2)),
            Stage::Reflecting(n) => (2, n.saturating_mul(2).saturating_add(1)),
            Stage::SourceSelection => (3, 0),
            Stage::SynthesisPreparation => (4, 0),
            Stage::Gathering => (5, 0),
            Stage::Writing => (6, 0),
        }
    }

    pub fn caption(&self, plan: Option<&Plan>) -> String {
        match self {
            Stage::Planning => "Planning the research".to_string(),
            Stage::Round(n) => match plan {
                Some(p) if p.estimated_rounds >= *n => {
                    format!("Searching sources (round {} of {})", n, p.estimated_rounds)
                }
                _ => format!("Searching sources (round {})", n),
            },
            Stage::Reflecting(n) => format!("Reviewing evidence from round {}", n),
            Stage::SourceSelection => "Selecting the strongest sources".to_string(),
            Stage::SynthesisPreparation => "Preparing the synthesis".to_string(),
            Stage::Gathering => "Gathering information".to_string(),
            Stage::Writing => "Writing the answer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ReconnectStatus {
    #[default]
    Idle,
    Reconnecting {
        attempt: u32,
    },
    Reconnected,
}

/// Global state observed by the UI alongside the answer list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineStatus {
    pub loading: bool,
    pub error: Option<String>,
    pub current_tier: Option<Tier>,
    pub reconnect: ReconnectStatus,
}

// --- ERRORS ---

#[derive(Error, Debug)]
pub enum DelveError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(u16, String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Research failed: {0}")]
    FatalRound(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl DelveError {
    pub fn internal(message: impl Into<String>) -> Self {
        DelveError::Internal(message.into(), SpanTrace::capture())
    }

    /// Failures the connection retrier is allowed to retry.
    pub fn is_transport(&self) -> bool {
        match self {
            DelveError::Transport(_)
            | DelveError::Io(_)
            | DelveError::Timeout(_)
            | DelveError::Protocol(_) => true,
            DelveError::Upstream(status, _) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: DelveError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<DelveError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
