use std::borrow::Cow;
use std::time::{Duration, Instant};

use reqwest::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::{Config, DecodeMode};
use crate::constants::{
    CHAT_COMPLETIONS_PATH, GENERATE_PATH, MODELS_PATH, PROBE_TIMEOUT_SECS, ROLE_USER, TAGS_PATH,
};
use crate::errors::{classify_upstream_error, extract_error_message_from_body, UpstreamError};
use crate::models::{
    ChatCompletionsRequest, ChatMessage, GenerateOptions, GenerateRequest, ModelsResponse,
    TagsResponse,
};

#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: Client,
    config: Config,
}

impl UpstreamClient {
    pub fn new(config: Config) -> Result<Self, String> {
        let client = Client::builder()
            .build()
            .map_err(|error| format!("failed to initialize upstream HTTP client: {error}"))?;
        Ok(Self { client, config })
    }

    /// Opens a streaming generate call against the NDJSON backend. The body
    /// is returned unread; the relay owns the wall-clock timeout.
    pub async fn generate_stream(&self, prompt: &str) -> Result<reqwest::Response, UpstreamError> {
        let body = GenerateRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            stream: true,
            options: GenerateOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
            },
        };
        self.send_stream_request(GENERATE_PATH, &body).await
    }

    /// Opens a streaming chat-completions call against the OpenAI-compatible
    /// backend.
    pub async fn chat_stream(&self, prompt: &str) -> Result<reqwest::Response, UpstreamError> {
        let body = ChatCompletionsRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: ROLE_USER,
                content: prompt.to_string(),
            }],
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        self.send_stream_request(CHAT_COMPLETIONS_PATH, &body).await
    }

    /// Asks the backend which models it serves, as a connectivity probe.
    pub async fn probe(&self) -> Result<Vec<String>, UpstreamError> {
        match self.config.decode_mode {
            DecodeMode::Ndjson => self.probe_tags().await,
            DecodeMode::Sse => self.probe_models().await,
        }
    }

    async fn probe_tags(&self) -> Result<Vec<String>, UpstreamError> {
        let response = self.send_probe_request(TAGS_PATH).await?;
        let tags = response.json::<TagsResponse>().await.map_err(|error| {
            UpstreamError::new(classify_upstream_error(&format!(
                "failed to parse upstream tags response: {error}"
            )))
        })?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }

    async fn probe_models(&self) -> Result<Vec<String>, UpstreamError> {
        let response = self.send_probe_request(MODELS_PATH).await?;
        let models = response.json::<ModelsResponse>().await.map_err(|error| {
            UpstreamError::new(classify_upstream_error(&format!(
                "failed to parse upstream models response: {error}"
            )))
        })?;
        Ok(models.data.into_iter().map(|entry| entry.id).collect())
    }

    async fn send_stream_request<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.endpoint(path);
        debug!(
            phase = "upstream_request_start",
            path,
            url = %url,
            model = %self.config.model,
            "Sending upstream generation request"
        );

        let request_started = Instant::now();
        let response = self
            .client
            .post(&url)
            .headers(self.build_headers())
            .json(body)
            .send()
            .await
            .map_err(|error| build_send_error(error, path, request_started.elapsed()))?;

        debug!(
            phase = "upstream_response_headers",
            path,
            status = %response.status(),
            elapsed_ms = request_started.elapsed().as_millis() as u64,
            "Received upstream response headers"
        );

        if response.status().is_success() {
            return Ok(response);
        }

        Err(handle_http_error_response(response, path).await)
    }

    async fn send_probe_request(&self, path: &str) -> Result<reqwest::Response, UpstreamError> {
        let url = self.endpoint(path);
        let request_started = Instant::now();
        let response = self
            .client
            .get(&url)
            .headers(self.build_headers())
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|error| build_send_error(error, path, request_started.elapsed()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        Err(handle_http_error_response(response, path).await)
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.config.upstream_base_url.trim_end_matches('/'),
            path
        )
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("ollama-chat-gateway/0.1.0"),
        );

        if let Some(api_key) = self.config.upstream_api_key.as_deref() {
            if let Ok(auth_value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, auth_value);
            }
        }

        headers
    }
}

const BODY_PREVIEW_LIMIT: usize = 1024;

async fn handle_http_error_response(response: reqwest::Response, path: &str) -> UpstreamError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let raw_message = extract_error_message_from_body(&text);

    warn!(
        phase = "upstream_http_error",
        path,
        status = %status,
        body_preview = %preview_text(&text, BODY_PREVIEW_LIMIT),
        "Upstream returned non-success status"
    );

    UpstreamError::new(classify_upstream_error(&raw_message))
}

fn build_send_error(error: reqwest::Error, path: &str, elapsed: Duration) -> UpstreamError {
    if error.is_timeout() {
        error!(
            phase = "upstream_connect_timeout",
            path,
            elapsed_ms = elapsed.as_millis() as u64,
            "Upstream timed out before response headers"
        );
    } else if error.is_connect() {
        error!(
            phase = "upstream_connect_error",
            path,
            elapsed_ms = elapsed.as_millis() as u64,
            "Upstream connection failed before response headers: {error}"
        );
    } else {
        error!(
            phase = "upstream_request_error",
            path,
            elapsed_ms = elapsed.as_millis() as u64,
            "Upstream request failed before response headers: {error}"
        );
    }

    UpstreamError::new(classify_upstream_error(&format!(
        "upstream request failed: {error}"
    )))
}

fn preview_text(text: &str, limit: usize) -> Cow<'_, str> {
    let mut iterator = text.chars();
    let preview: String = iterator.by_ref().take(limit).collect();
    if iterator.next().is_none() {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{preview}...(truncated)"))
    }
}
