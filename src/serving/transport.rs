//! Wire transport for remote API backends.
//!
//! A [`Transport`] sends one input and classifies the outcome:
//! - success → `Ok(TransportReply)`
//! - timeouts, network errors, 408/429/5xx, unparseable bodies → `ServingTransient`
//! - auth, bad request, not found, other 4xx → `ServingFatal`
//!
//! Retrying is the caller's business.

use super::{ApiFlavor, GenerationParams, RateLimiter, ServingOutput};
use crate::models::{ApiServingConfig, Result, SieveError, expand_headers};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportReply {
    pub output: ServingOutput,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TransportReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: ServingOutput::Text(text.into()),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Sends a single item to a remote model.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, input: &str, params: &GenerationParams) -> Result<TransportReply>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// reqwest-backed transport for OpenAI-compatible endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: String,
    model: String,
    flavor: ApiFlavor,
    headers: HeaderMap,
    default_temperature: Option<f64>,
    default_max_tokens: Option<u32>,
    rate_limiter: Arc<RateLimiter>,
}

impl HttpTransport {
    pub fn from_config(serving: &str, config: &ApiServingConfig) -> Result<Self> {
        let api_key = config.resolve_api_key(serving)?;
        let headers = build_headers(api_key.as_deref(), &expand_headers(&config.headers))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SieveError::Internal(format!("Building HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            flavor: config.flavor,
            headers,
            default_temperature: config.temperature,
            default_max_tokens: config.max_tokens,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    fn body(&self, input: &str, params: &GenerationParams) -> Result<Value> {
        let body = match self.flavor {
            ApiFlavor::Chat => {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = params.system_prompt.as_deref() {
                    messages.push(ChatMessage {
                        role: "system",
                        content: system,
                    });
                }
                messages.push(ChatMessage {
                    role: "user",
                    content: input,
                });
                serde_json::to_value(ChatRequest {
                    model: &self.model,
                    messages,
                    max_tokens: params.max_tokens.or(self.default_max_tokens),
                    temperature: params.temperature.or(self.default_temperature),
                    stop: params.stop.as_deref(),
                })
            }
            ApiFlavor::Embedding => serde_json::to_value(EmbeddingRequest {
                model: &self.model,
                input,
            }),
        };
        body.map_err(|e| SieveError::Internal(format!("Serializing request: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, input: &str, params: &GenerationParams) -> Result<TransportReply> {
        self.rate_limiter.wait_if_needed(&self.model).await;

        let response = self
            .client
            .post(&self.api_url)
            .headers(self.headers.clone())
            .json(&self.body(input, params)?)
            .send()
            .await
            .map_err(classify_network_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.rate_limiter.record_response(&self.model, status, &headers);

        let body = response
            .text()
            .await
            .map_err(|e| SieveError::transient(format!("Reading response body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &headers, &body));
        }

        debug!(model = %self.model, status, bytes = body.len(), "Response received");
        parse_reply(self.flavor, &body)
    }
}

fn build_headers(api_key: Option<&str>, extra: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(key) = api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| SieveError::InvalidInput("API key is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }

    for (key, value) in extra {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|_| SieveError::InvalidInput(format!("Invalid header name '{key}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| SieveError::InvalidInput(format!("Invalid value for header '{key}'")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn classify_network_error(e: reqwest::Error) -> SieveError {
    if e.is_builder() {
        SieveError::ServingFatal(format!("Invalid request: {e}"))
    } else if e.is_timeout() {
        SieveError::transient(format!("Request timed out: {e}"))
    } else {
        SieveError::transient(format!("Network error: {e}"))
    }
}

/// Map a non-success status to a transient or fatal error.
pub(crate) fn classify_status(status: u16, headers: &HeaderMap, body: &str) -> SieveError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());

    match status {
        408 | 429 | 500..=599 => SieveError::ServingTransient {
            message: format!("HTTP {status}: {message}"),
            retry_after: parse_retry_after(headers),
        },
        401 | 403 => SieveError::ServingFatal(format!("Authentication failed (HTTP {status}): {message}")),
        404 => SieveError::ServingFatal(format!("Endpoint or model not found: {message}")),
        _ => SieveError::ServingFatal(format!("HTTP {status}: {message}")),
    }
}

/// `Retry-After` is either delay seconds or an HTTP date. Dates already past,
/// and delays too large to represent, are treated as absent.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    (at.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

/// Decode a success body. Bodies that do not match the schema are transient.
pub(crate) fn parse_reply(flavor: ApiFlavor, body: &str) -> Result<TransportReply> {
    match flavor {
        ApiFlavor::Chat => {
            let parsed: ChatResponse = serde_json::from_str(body)
                .map_err(|e| SieveError::transient(format!("Unparseable chat response: {e}")))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| SieveError::transient("Chat response has no content"))?;
            let usage = parsed.usage.unwrap_or_default();
            Ok(TransportReply {
                output: ServingOutput::Text(content),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
        }
        ApiFlavor::Embedding => {
            let parsed: EmbeddingResponse = serde_json::from_str(body)
                .map_err(|e| SieveError::transient(format!("Unparseable embedding response: {e}")))?;
            let embedding = parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| SieveError::transient("Embedding response has no data"))?;
            let usage = parsed.usage.unwrap_or_default();
            Ok(TransportReply {
                output: ServingOutput::Embedding(embedding),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: 0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(flavor: ApiFlavor) -> HttpTransport {
        let mut config = ApiServingConfig::new("http://localhost:9/v1/chat/completions", "m");
        config.flavor = flavor;
        config.max_tokens = Some(64);
        HttpTransport::from_config("test", &config).unwrap()
    }

    #[test]
    fn test_status_classification() {
        let empty = HeaderMap::new();
        assert!(classify_status(429, &empty, "").is_retryable());
        assert!(classify_status(503, &empty, "").is_retryable());
        assert!(classify_status(408, &empty, "").is_retryable());
        assert!(matches!(classify_status(401, &empty, ""), SieveError::ServingFatal(_)));
        assert!(matches!(classify_status(400, &empty, ""), SieveError::ServingFatal(_)));
        assert!(matches!(classify_status(404, &empty, ""), SieveError::ServingFatal(_)));
    }

    #[test]
    fn test_retry_after_and_error_message_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let err = classify_status(429, &headers, r#"{"error": {"message": "slow down"}}"#);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn test_unrepresentable_retry_after_is_dropped() {
        for raw in ["1e30", "-1", "NaN", "inf"] {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            let err = classify_status(429, &headers, "");
            assert!(err.is_retryable());
            assert_eq!(err.retry_after(), None, "Retry-After: {raw}");
        }
    }

    #[test]
    fn test_retry_after_http_date() {
        let at = (Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&at).unwrap());
        let delay = classify_status(503, &headers, "").retry_after().unwrap();
        assert!(delay > Duration::from_secs(25) && delay <= Duration::from_secs(31));

        let mut past = HeaderMap::new();
        past.insert(RETRY_AFTER, HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"));
        assert_eq!(classify_status(503, &past, "").retry_after(), None);
    }

    #[test]
    fn test_parse_chat_reply_with_usage() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "Score: 0.7"}}],
                       "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}}"#;
        let reply = parse_reply(ApiFlavor::Chat, body).unwrap();
        assert_eq!(reply.output, ServingOutput::Text("Score: 0.7".to_string()));
        assert_eq!((reply.prompt_tokens, reply.completion_tokens), (12, 3));
    }

    #[test]
    fn test_unparseable_bodies_are_transient() {
        assert!(parse_reply(ApiFlavor::Chat, "<html>").unwrap_err().is_retryable());
        assert!(parse_reply(ApiFlavor::Chat, r#"{"choices": []}"#).unwrap_err().is_retryable());
        assert!(parse_reply(ApiFlavor::Embedding, r#"{"data": []}"#).unwrap_err().is_retryable());
    }

    #[test]
    fn test_parse_embedding_reply() {
        let body = r#"{"data": [{"embedding": [0.1, 0.2], "index": 0}]}"#;
        let reply = parse_reply(ApiFlavor::Embedding, body).unwrap();
        assert_eq!(reply.output, ServingOutput::Embedding(vec![0.1, 0.2]));
    }

    #[test]
    fn test_chat_body_includes_system_prompt_and_defaults() {
        let params = GenerationParams {
            system_prompt: Some("be terse".to_string()),
            temperature: Some(0.0),
            ..Default::default()
        };
        let body = transport(ApiFlavor::Chat).body("hello", &params).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["temperature"], 0.0);
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn test_embedding_body() {
        let body = transport(ApiFlavor::Embedding)
            .body("hello", &GenerationParams::default())
            .unwrap();
        assert_eq!(body, serde_json::json!({"model": "m", "input": "hello"}));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut extra = HashMap::new();
        extra.insert("bad header".to_string(), "x".to_string());
        assert!(build_headers(None, &extra).is_err());
    }
}
