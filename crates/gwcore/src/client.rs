use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::metrics::Metrics;

/// Which shape of OpenAI-ish request body we found textual content in.
/// Multi-modal parts are ignored except `{"type":"text"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    InputString,
    InputList,
    Messages,
    Unknown,
}

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Pull the textual content and `max_tokens` out of an OpenAI-shaped
/// request body.
pub fn parse_request_content(body: &Value) -> (ContentKind, String, u32, u32) {
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    if let Some(s) = body.get("input").and_then(|v| v.as_str()) {
        return (ContentKind::InputString, s.to_string(), max_tokens, 1);
    }

    if let Some(list) = body.get("input").and_then(|v| v.as_array()) {
        let mut prompt = String::new();
        let mut count = 0u32;
        for item in list {
            if let Some(s) = item.as_str() {
                prompt.push_str(s);
                count += 1;
            }
        }
        return (ContentKind::InputList, prompt, max_tokens, count);
    }

    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        let mut prompt = String::new();
        let mut count = 0u32;
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => {
                    prompt.push_str(s);
                    count += 1;
                }
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                prompt.push_str(text);
                                count += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        return (ContentKind::Messages, prompt, max_tokens, count);
    }

    (ContentKind::Unknown, String::new(), max_tokens, 1)
}

/// The forward-pass response: status, content-type, and the engine's body
/// as a byte stream the caller (C6) consumes directly.
pub struct ForwardResponse {
    pub status: u16,
    pub content_type: String,
    pub inner: reqwest::Response,
}

/// Capability set shared by every engine wire client: health, tokenize,
/// forward, cancel. Implemented once for llama.cpp-flavored HTTP engines
/// as [`EngineHttp`].
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn estimate_tokens(&self, request: &Value) -> u32;
    async fn forward_request(&self, path: &str, body: &Value) -> Result<ForwardResponse, GatewayError>;
    fn terminate_request(&self);
    async fn check_health(&self) -> bool;
}

/// HTTP client bound to one running llama.cpp-family engine. One instance
/// per [`crate::manager::RunningEngine`].
pub struct EngineHttp {
    base_url: String,
    http: reqwest::Client,
    health_check_timeout: Duration,
    in_flight: Mutex<Option<CancellationToken>>,
    metrics: Arc<Metrics>,
}

const TOKENIZE_CALL_TIMEOUT: Duration = Duration::from_secs(60);

impl EngineHttp {
    pub fn new(base_url: impl Into<String>, health_check_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // No blanket read timeout: engines may think arbitrarily long.
            .build()
            .expect("reqwest client builder should not fail with these settings");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            health_check_timeout,
            in_flight: Mutex::new(None),
            metrics,
        }
    }

    async fn apply_template(&self, messages: &Value) -> Option<String> {
        let resp = self
            .http
            .post(format!("{}/apply-template", self.base_url))
            .timeout(TOKENIZE_CALL_TIMEOUT)
            .json(&json!({ "messages": messages }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let v: Value = resp.json().await.ok()?;
        v.get("prompt").and_then(|p| p.as_str()).map(|s| s.to_string())
    }

    async fn tokenize(&self, content: &str) -> Option<usize> {
        let resp = self
            .http
            .post(format!("{}/tokenize", self.base_url))
            .timeout(TOKENIZE_CALL_TIMEOUT)
            .json(&json!({ "content": content }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let v: Value = resp.json().await.ok()?;
        v.get("tokens").and_then(|t| t.as_array()).map(|a| a.len())
    }
}

#[async_trait]
impl EngineClient for EngineHttp {
    async fn estimate_tokens(&self, request: &Value) -> u32 {
        let (kind, mut prompt, max_tokens, _) = parse_request_content(request);

        if kind == ContentKind::Messages {
            if let Some(messages) = request.get("messages") {
                if let Some(templated) = self.apply_template(messages).await {
                    prompt = templated;
                }
            }
        }

        match self.tokenize(&prompt).await {
            Some(count) => count as u32 + max_tokens,
            // Safe conservative lower bound: never underflow the sizing decision.
            None => max_tokens,
        }
    }

    async fn forward_request(&self, path: &str, body: &Value) -> Result<ForwardResponse, GatewayError> {
        let token = CancellationToken::new();
        *self.in_flight.lock().unwrap() = Some(token.clone());

        let url = format!("{}{}", self.base_url, path);
        let send_fut = self
            .http
            .post(&url)
            .json(body)
            .send();

        let result = tokio::select! {
            res = send_fut => res,
            _ = token.cancelled() => {
                return Err(GatewayError::UpstreamError("request cancelled by client disconnect".into()));
            }
        };

        *self.in_flight.lock().unwrap() = None;

        let resp = result.map_err(|e| {
            self.metrics.record_upstream_error(&e);
            GatewayError::from(e)
        })?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok(ForwardResponse {
            status,
            content_type,
            inner: resp,
        })
    }

    fn terminate_request(&self) {
        if let Some(token) = self.in_flight.lock().unwrap().take() {
            token.cancel();
        }
    }

    async fn check_health(&self) -> bool {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_check_timeout)
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_string() {
        let body = json!({"input": "hello world", "max_tokens": 10});
        let (kind, prompt, max_tokens, count) = parse_request_content(&body);
        assert_eq!(kind, ContentKind::InputString);
        assert_eq!(prompt, "hello world");
        assert_eq!(max_tokens, 10);
        assert_eq!(count, 1);
    }

    #[test]
    fn parses_messages_with_text_parts_only() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": [
                    {"type": "text", "text": "there"},
                    {"type": "image_url", "image_url": {"url": "data:..."}}
                ]}
            ]
        });
        let (kind, prompt, max_tokens, count) = parse_request_content(&body);
        assert_eq!(kind, ContentKind::Messages);
        assert_eq!(prompt, "hithere");
        assert_eq!(max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(count, 2);
    }

    #[test]
    fn defaults_max_tokens_when_absent() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let (_, _, max_tokens, _) = parse_request_content(&body);
        assert_eq!(max_tokens, 4096);
    }

    #[test]
    fn prefers_max_completion_tokens_fallback() {
        let body = json!({"input": "hi", "max_completion_tokens": 77});
        let (_, _, max_tokens, _) = parse_request_content(&body);
        assert_eq!(max_tokens, 77);
    }
}
