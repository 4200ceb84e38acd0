use async_trait::async_trait;
use dl_error::{DevloopError, Result};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};

use crate::sse::Utf8ChunkDecoder;

/// Raw text chunks of the runtime's SSE stream, in delivery order.
pub type EventStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
            synthetic: None,
        }
    }

    /// Context injected ahead of the user's text, hidden from transcripts.
    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            synthetic: Some(true),
            ..Self::text(text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRef {
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// `provider/model`; a bare name leaves the provider to the runtime.
    pub fn parse(model: &str) -> Self {
        match model.split_once('/') {
            Some((provider, id)) => Self {
                provider_id: Some(provider.to_string()),
                model_id: id.to_string(),
            },
            None => Self {
                provider_id: None,
                model_id: model.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRequest {
    pub parts: Vec<PromptPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

/// HTTP surface of the backing runtime, addressed by its base URL.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Creates a backing session and returns its id.
    async fn create_session(&self, base_url: &str, title: &str) -> Result<String>;

    async fn send_prompt(
        &self,
        base_url: &str,
        session_id: &str,
        request: &PromptRequest,
    ) -> Result<()>;

    /// Opens the shared event stream. The connection is closed when the
    /// stream is dropped.
    async fn subscribe_events(&self, base_url: &str) -> Result<EventStream>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpRuntimeClient {
    http: reqwest::Client,
}

impl HttpRuntimeClient {
    pub fn new() -> Self {
        Self::default()
    }
}

fn request_error(err: reqwest::Error) -> DevloopError {
    DevloopError::RuntimeRequest(err.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DevloopError::RuntimeRequest(format!(
        "{status}: {}",
        body.trim()
    )))
}

/// Turns raw body chunks into text chunks, carrying partial UTF-8 sequences
/// across chunk boundaries.
fn text_chunks<S, B, E>(chunks: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    chunks
        .scan(Utf8ChunkDecoder::new(), |decoder, chunk| {
            let item = chunk
                .map(|bytes| decoder.push(bytes.as_ref()))
                .map_err(|err| DevloopError::RuntimeRequest(err.to_string()));
            futures::future::ready(Some(item))
        })
        .boxed()
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn create_session(&self, base_url: &str, title: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{base_url}/session"))
            .json(&json!({ "title": title }))
            .send()
            .await
            .map_err(request_error)?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DevloopError::RuntimeRequest("session response has no id".into()))
    }

    async fn send_prompt(
        &self,
        base_url: &str,
        session_id: &str,
        request: &PromptRequest,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{base_url}/session/{session_id}/message"))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn subscribe_events(&self, base_url: &str) -> Result<EventStream> {
        let response = self
            .http
            .get(format!("{base_url}/event"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response).await?;
        Ok(text_chunks(response.bytes_stream()))
    }
}
