use crate::constants::{MAX_EVENT_BYTES, MAX_STREAM_LINES};
use crate::ingress::{parse_event_line, LineEvent, SequencedEvent};
use crate::str_utils;
use crate::types::*;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

pub type EventStream = BoxStream<'static, Result<SequencedEvent>>;

/// Body posted to the research service to open a query stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryRequest {
    pub answer_id: AnswerId,
    pub query: String,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Opens the remote event stream for one attempt of a query.
#[async_trait]
pub trait ResearchTransport: Send + Sync {
    async fn open(&self, request: &QueryRequest, attempt: u32) -> Result<EventStream>;
}

/// SSE over HTTP: `POST {endpoint}` with the query as JSON, one `data:` line per event.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl ResearchTransport for HttpTransport {
    async fn open(&self, request: &QueryRequest, attempt: u32) -> Result<EventStream> {
        tracing::debug!(
            "[⚙️  -> 📡] Opening stream for {} (attempt {})",
            request.answer_id.short(),
            attempt
        );
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("<unreadable body: {}>", e),
            };
            tracing::error!("[📡 -> ⚙️ ] Upstream Error {}: {}", status, body);
            return Err(DelveError::Upstream(
                status.as_u16(),
                str_utils::truncate_with_ellipsis(&body, 500),
            )
            .into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_EVENT_BYTES),
        )
        .take(MAX_STREAM_LINES);

        let events = futures_util::stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            loop {
                match lines.next().await {
                    None => return None,
                    Some(Ok(line)) => {
                        if is_sse_field(&line) {
                            continue;
                        }
                        match parse_event_line(&line) {
                            LineEvent::Event(event) => return Some((Ok(event), Some(lines))),
                            LineEvent::Done => return None,
                            LineEvent::Unknown(_) => continue,
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("[📡 -> ⚙️ ] Line Parse Error: {}", e);
                        let err = match e {
                            LinesCodecError::Io(io) => DelveError::Io(io),
                            LinesCodecError::MaxLineLengthExceeded => {
                                DelveError::Protocol("event line exceeds size limit".to_string())
                            }
                        };
                        return Some((Err(err.into()), None));
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

/// SSE framing lines other than `data:` carry nothing the engine needs.
fn is_sse_field(line: &str) -> bool {
    line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:")
}
