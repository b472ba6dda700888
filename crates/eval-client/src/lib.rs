use eval_core::{ChatMessage, RESERVED_PAYLOAD_KEYS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build http client: {0}")]
    Build(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClientError>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u64,
    pub extra: Map<String, Value>,
}

pub trait InferenceClient: Send + Sync {
    fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

pub struct OpenAiCompatClient {
    settings: ClientSettings,
    url: String,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u64,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<Value>,
}

impl OpenAiCompatClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        let timeout_s = settings.timeout.as_secs().max(1);
        let connect_timeout = Duration::from_secs(timeout_s.clamp(1, 10));
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;
        let url = chat_completions_url(&settings.base_url);
        Ok(Self {
            settings,
            url,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_once(&self, body: &ChatRequest<'_>) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if status >= 400 {
            return Err(ClientError::Status {
                status,
                body: text.chars().take(1000).collect(),
            });
        }
        extract_content(&text)
    }
}

impl InferenceClient for OpenAiCompatClient {
    fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, ClientError> {
        let body = build_request(&self.settings.model, messages, params);
        let attempts = self.settings.max_retries + 1;
        debug!(
            url = %self.url,
            timeout_s = self.settings.timeout.as_secs(),
            retries = self.settings.max_retries,
            "POST chat completion"
        );
        let mut attempt: u32 = 0;
        loop {
            match self.request_once(&body) {
                Ok(content) => return Ok(content),
                Err(err) if attempt + 1 >= attempts => {
                    return Err(ClientError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let sleep_for = self
                        .settings
                        .retry_backoff
                        .mul_f64(2f64.powi(attempt as i32));
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        error = %err,
                        retry_in_s = sleep_for.as_secs_f64(),
                        "request failed; retrying"
                    );
                    thread::sleep(sleep_for);
                    attempt += 1;
                }
            }
        }
    }
}

fn build_request<'a>(
    model: &'a str,
    messages: &'a [ChatMessage],
    params: &GenerationParams,
) -> ChatRequest<'a> {
    let extra = params
        .extra
        .iter()
        .filter(|(k, _)| !RESERVED_PAYLOAD_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    ChatRequest {
        model,
        messages,
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        extra,
    }
}

fn extract_content(body: &str) -> Result<String, ClientError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ClientError::MalformedResponse(format!("{}: {}", e, truncate(body))))?;
    let first = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::MalformedResponse(format!("no choices: {}", truncate(body))))?;
    match first.message.and_then(|m| m.content) {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Null) | None => Err(ClientError::MalformedResponse(format!(
            "no message.content: {}",
            truncate(body)
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(1000).collect()
}

fn is_version_segment(segment: &str) -> bool {
    segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].chars().all(|c| c.is_ascii_digit())
}

/// `/v1/chat/completions` is appended unless the base path already ends in a
/// version segment such as `/v4`.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return "/v1/chat/completions".to_string();
    }
    let (head, query) = match base.split_once('?') {
        Some((head, query)) => (head.trim_end_matches('/'), Some(query)),
        None => (base, None),
    };
    let path_start = match head.find("://") {
        Some(i) => head[i + 3..].find('/').map_or(head.len(), |p| i + 3 + p),
        None => 0,
    };
    let versioned = head[path_start..]
        .rsplit('/')
        .next()
        .map_or(false, is_version_segment);
    let suffix = if versioned {
        "/chat/completions"
    } else {
        "/v1/chat/completions"
    };
    match query {
        Some(q) => format!("{}{}?{}", head, suffix, q),
        None => format!("{}{}", head, suffix),
    }
}
