/// Client for a locally hosted Ollama instance (`POST /api/generate`, non-streaming).
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct OllamaClientConfig {
    pub base_url: String,
    pub model: String,
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
    pub options: GenerateOptions,
}

impl OllamaClientConfig {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());

        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen2:0.5b".to_string());

        let default_timeout = std::env::var("OLLAMA_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(600));

        let max_retries = std::env::var("OLLAMA_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        let initial_backoff = std::env::var("OLLAMA_RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(200));

        let max_backoff = std::env::var("OLLAMA_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(5_000));

        let defaults = GenerateOptions::default();
        let options = GenerateOptions {
            temperature: std::env::var("OLLAMA_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse::<f32>().ok())
                .unwrap_or(defaults.temperature),
            num_predict: std::env::var("OLLAMA_NUM_PREDICT")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.num_predict),
            num_ctx: std::env::var("OLLAMA_NUM_CTX")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.num_ctx),
        };

        Self {
            base_url: normalize_base_url(&base_url),
            model,
            default_timeout,
            max_retries,
            initial_backoff,
            max_backoff,
            max_error_body_bytes: 8 * 1024,
            options,
        }
    }
}

/// Accepts either the server root or the full `/api/generate` URL.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/api/generate")
        .unwrap_or(trimmed)
        .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_predict: u32,
    pub num_ctx: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            num_predict: 512,
            num_ctx: 4096,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OllamaClientError {
    #[error("failed to connect to Ollama: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Ollama error {status}: {message}")]
    Upstream { status: StatusCode, message: String },
}

#[derive(Clone)]
pub struct OllamaClient {
    config: OllamaClientConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: OllamaClientConfig) -> Result<Self, OllamaClientError> {
        let http = reqwest::Client::builder()
            .user_agent("nag-verifier")
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OllamaClientConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a prompt to `/api/generate` and return the generated text.
    pub async fn generate(&self, prompt: &str) -> Result<String, OllamaClientError> {
        let url = format!("{}/api/generate", self.config.base_url);
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: self.config.options,
        };
        self.request_with_retry(|| async {
            let resp = self
                .http
                .post(&url)
                .timeout(self.config.default_timeout)
                .json(&request)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(Self::to_upstream_error(resp, self.config.max_error_body_bytes).await);
            }
            let body = resp.text().await?;
            let value: serde_json::Value = serde_json::from_str(&body)?;
            Ok(extract_generated_text(&value))
        })
        .await
    }

    async fn to_upstream_error(
        resp: reqwest::Response,
        max_error_body_bytes: usize,
    ) -> OllamaClientError {
        let status = resp.status();
        let body = read_limited_text(resp, max_error_body_bytes).await;
        let message = serde_json::from_str::<OllamaErrorEnvelope>(&body)
            .ok()
            .and_then(|e| e.error)
            .unwrap_or(body);
        OllamaClientError::Upstream { status, message }
    }

    async fn request_with_retry<T, Fut, F>(&self, mut f: F) -> Result<T, OllamaClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, OllamaClientError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt > self.config.max_retries || !should_retry(&e) {
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        self.config.initial_backoff,
                        self.config.max_backoff,
                        attempt - 1,
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "ollama request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// `response` when non-empty, else `content`, else the raw JSON document.
fn extract_generated_text(value: &serde_json::Value) -> String {
    ["response", "content"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

fn should_retry(err: &OllamaClientError) -> bool {
    match err {
        OllamaClientError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        OllamaClientError::Upstream { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        OllamaClientError::InvalidJson(_) => false,
    }
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    let jitter_ms = pseudo_jitter_ms(jitter_cap);
    Duration::from_millis(capped_ms.saturating_add(jitter_ms))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let nanos = now.subsec_nanos() as u64;
    nanos % (max_inclusive + 1)
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorEnvelope {
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode as HttpStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    fn test_config(base_url: String) -> OllamaClientConfig {
        OllamaClientConfig {
            base_url,
            model: "qwen2:0.5b".to_string(),
            default_timeout: Duration::from_secs(5),
            max_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_error_body_bytes: 1024,
            options: GenerateOptions::default(),
        }
    }

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock server");
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("http://localhost:11434/api/generate"),
            "http://localhost:11434"
        );
        assert_eq!(normalize_base_url("http://ollama:11434/"), "http://ollama:11434");
    }

    #[test]
    fn test_extract_generated_text() {
        assert_eq!(extract_generated_text(&json!({"response": "hi"})), "hi");
        assert_eq!(
            extract_generated_text(&json!({"response": "", "content": "fallback"})),
            "fallback"
        );
        assert_eq!(extract_generated_text(&json!({"done": true})), r#"{"done":true}"#);
    }

    #[test]
    fn test_backoff_is_capped() {
        let d = backoff_delay(Duration::from_millis(200), Duration::from_millis(1_000), 10);
        assert!(d >= Duration::from_millis(1_000));
        assert!(d <= Duration::from_millis(1_250));
    }

    #[tokio::test]
    async fn generate_sends_options_and_returns_response() {
        let router = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "qwen2:0.5b");
                assert_eq!(body["stream"], false);
                assert_eq!(body["options"]["num_predict"], 512);
                assert_eq!(body["options"]["num_ctx"], 4096);
                Json(json!({"response": format!("echo: {}", body["prompt"].as_str().unwrap_or(""))}))
            }),
        );
        let base = spawn_mock(router).await;
        let client = OllamaClient::new(test_config(base)).expect("client");

        let text = client.generate("ping").await.expect("generate");
        assert_eq!(text, "echo: ping");
    }

    #[tokio::test]
    async fn upstream_error_message_is_surfaced() {
        let router = Router::new().route(
            "/api/generate",
            post(|| async {
                (
                    HttpStatus::NOT_FOUND,
                    Json(json!({"error": "model 'qwen2:0.5b' not found"})),
                )
            }),
        );
        let base = spawn_mock(router).await;
        let client = OllamaClient::new(test_config(base)).expect("client");

        let err = client.generate("ping").await.expect_err("should fail");
        match err {
            OllamaClientError::Upstream { status, message } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(message, "model 'qwen2:0.5b' not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_retried_when_configured() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let router = Router::new().route(
            "/api/generate",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (HttpStatus::SERVICE_UNAVAILABLE, Json(json!({"error": "loading"})))
                    } else {
                        (HttpStatus::OK, Json(json!({"response": "ready"})))
                    }
                }
            }),
        );
        let base = spawn_mock(router).await;
        let mut config = test_config(base);
        config.max_retries = 1;
        let client = OllamaClient::new(config).expect("client");

        assert_eq!(client.generate("ping").await.expect("generate"), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_retries_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let router = Router::new().route(
            "/api/generate",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (HttpStatus::INTERNAL_SERVER_ERROR, "boom")
                }
            }),
        );
        let base = spawn_mock(router).await;
        let client = OllamaClient::new(test_config(base)).expect("client");

        let err = client.generate("ping").await.expect_err("should fail");
        assert!(err.to_string().contains("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
