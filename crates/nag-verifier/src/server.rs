/// HTTP interface.
///
/// - `GET /health`: liveness, document count and model name
/// - `POST /ask`: answer a clinical question `{question, age?, section?, k?}`
/// - `OPTIONS /ask`: CORS preflight
///
/// Every response carries permissive CORS headers.
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::model::{AskRequest, AskResponse, Candidate, ErrorResponse, HealthResponse};
use crate::policy::{self, SectionCode};
use crate::postprocess;
use crate::prompt::{self, AGE_MISSING_NOTE};
use crate::rate_limit::RateLimiter;
use crate::retrieval::Retriever;
use rag_common::ollama::OllamaClient;

const ALLOW_ORIGIN: &str = "*";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";
const ALLOW_METHODS: &str = "GET, POST, OPTIONS";

#[derive(Clone)]
pub struct AppState {
    retriever: Arc<Retriever>,
    ollama: Arc<OllamaClient>,
    limiter: Option<RateLimiter>,
    docs: usize,
    max_k: usize,
}

impl AppState {
    pub fn new(
        retriever: Arc<Retriever>,
        ollama: Arc<OllamaClient>,
        limiter: Option<RateLimiter>,
        docs: usize,
        max_k: usize,
    ) -> Self {
        Self {
            retriever,
            ollama,
            limiter,
            docs,
            max_k,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ask", post(ask).options(preflight))
        .layer(middleware::map_response(add_cors_headers))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        docs: state.docs,
        model: state.ollama.model().to_string(),
    })
}

async fn ask(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();
    let request = AskRequest::from_body(&body);

    if request.question.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'question'".to_string(), None);
    }

    if let Some(limiter) = &state.limiter {
        if let Err(limited) = limiter.check().await {
            warn!(retry_after_ms = limited.retry_after.as_millis(), "question rate limited");
            let retry_after = limited.retry_after.as_secs_f64().ceil().max(1.0) as u64;
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                limited.to_string(),
                Some(elapsed_secs(started)),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            return response;
        }
    }

    let k = parse_k(
        request.k.as_ref(),
        state.retriever.settings().default_k,
        state.max_k,
    );
    let section = policy::resolve(request.age.as_ref(), request.section.as_deref());
    info!(%section, k, "answering question");

    match answer(&state, &request.question, k, section).await {
        Ok((retrieved, answer)) => {
            let elapsed_s = elapsed_secs(started);
            info!(%section, retrieved = retrieved.len(), elapsed_s, "question answered");
            Json(AskResponse {
                question: request.question,
                section,
                answer,
                retrieved,
                elapsed_s,
            })
            .into_response()
        }
        Err(e) => {
            let elapsed_s = elapsed_secs(started);
            error!(error = %e, elapsed_s, "ask failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Backend failed: {e}"),
                Some(elapsed_s),
            )
        }
    }
}

/// Retrieve grounding passages, query the model and clean up its answer.
async fn answer(
    state: &AppState,
    question: &str,
    k: usize,
    section: SectionCode,
) -> Result<(Vec<Candidate>, String), AppError> {
    let retrieved = state.retriever.retrieve(question, k, section).await?;

    let prompt_question = if section == SectionCode::All {
        format!("{question}{AGE_MISSING_NOTE}")
    } else {
        question.to_string()
    };
    let prompt = prompt::make_prompt(&prompt_question, &retrieved);
    let raw = state.ollama.generate(&prompt).await?;

    Ok((retrieved, postprocess::ensure_verification_line(&raw)))
}

async fn preflight(headers: HeaderMap) -> Response {
    let allow_headers = headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(ALLOW_HEADERS));

    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(ALLOW_ORIGIN)),
            (header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS)),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers),
        ],
    )
        .into_response()
}

/// Fill in CORS headers that the handler did not set itself.
async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    for (name, value) in [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS),
        (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS),
    ] {
        headers
            .entry(name)
            .or_insert_with(|| HeaderValue::from_static(value));
    }
    response
}

/// Requested result count: positive integers (or integer strings) capped at `max_k`,
/// anything else means `default_k`.
///
/// Fractional numbers are not truncated: `2.5` asks for `default_k`, not 2. Booleans
/// are not counts either.
fn parse_k(raw: Option<&Value>, default_k: usize, max_k: usize) -> usize {
    let requested = raw.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    });
    match requested {
        Some(k) if k > 0 => usize::try_from(k).unwrap_or(max_k).min(max_k),
        _ => default_k,
    }
}

fn elapsed_secs(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

fn error_response(status: StatusCode, error: String, elapsed_s: Option<f64>) -> Response {
    (status, Json(ErrorResponse { error, elapsed_s })).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::policy::SectionPolicy;
    use crate::retrieval::tests::{candidate, StubSearch};
    use crate::retrieval::RetrievalSettings;
    use rag_common::ollama::{GenerateOptions, OllamaClientConfig};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    /// Ollama stand-in that answers with a fixed verdict followed by the context headers
    /// and notes found in the prompt it got.
    async fn echo_ollama() -> String {
        spawn(Router::new().route(
            "/api/generate",
            post(|Json(body): Json<Value>| async move {
                let prompt = body["prompt"].as_str().unwrap_or_default();
                let echoed: Vec<&str> = prompt
                    .lines()
                    .filter(|l| l.starts_with('[') || l.starts_with("NOTE:"))
                    .collect();
                Json(json!({
                    "response": format!("**Verification**: Diagnosis is accurate\n{}", echoed.join("\n"))
                }))
            }),
        ))
        .await
    }

    async fn failing_ollama() -> String {
        spawn(Router::new().route(
            "/api/generate",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "model crashed"})),
                )
            }),
        ))
        .await
    }

    fn corpus() -> Vec<Candidate> {
        let sources = ["NAG_A", "NAG_B", "MedQA"];
        (1..=12)
            .map(|i| candidate(i, 0.05 * i as f32, Some(sources[(i - 1) % 3])))
            .collect()
    }

    async fn app(ollama_url: String, limiter: Option<RateLimiter>) -> (String, Arc<StubSearch>) {
        let search = Arc::new(StubSearch::new(corpus()));
        let retriever = Arc::new(Retriever::new(
            search.clone(),
            Arc::new(SectionPolicy::nag()),
            RetrievalSettings::default(),
        ));
        let ollama = Arc::new(
            OllamaClient::new(OllamaClientConfig {
                base_url: ollama_url,
                model: "qwen2:0.5b".to_string(),
                default_timeout: Duration::from_secs(5),
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                max_error_body_bytes: 1024,
                options: GenerateOptions::default(),
            })
            .expect("ollama client"),
        );
        let state = AppState::new(retriever, ollama, limiter, 12, 50);
        (spawn(router(state)).await, search)
    }

    async fn post_ask(base: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        let resp = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .json(&body)
            .send()
            .await
            .expect("send");
        let status = resp.status();
        let headers = resp.headers().clone();
        let json = resp.json::<Value>().await.expect("json body");
        (status, headers, json)
    }

    #[test]
    fn test_parse_k() {
        assert_eq!(parse_k(None, 5, 50), 5);
        assert_eq!(parse_k(Some(&json!(3)), 5, 50), 3);
        assert_eq!(parse_k(Some(&json!(" 7 ")), 5, 50), 7);
        assert_eq!(parse_k(Some(&json!(0)), 5, 50), 5);
        assert_eq!(parse_k(Some(&json!(-2)), 5, 50), 5);
        assert_eq!(parse_k(Some(&json!("abc")), 5, 50), 5);
        assert_eq!(parse_k(Some(&json!(2.5)), 5, 50), 5);
        assert_eq!(parse_k(Some(&json!(true)), 5, 50), 5);
        assert_eq!(parse_k(Some(&json!(500)), 5, 50), 50);
    }

    #[tokio::test]
    async fn health_reports_docs_and_model() {
        let (base, _) = app(echo_ollama().await, None).await;
        let resp = reqwest::get(format!("{base}/health")).await.expect("get");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        let body = resp.json::<Value>().await.expect("json");
        assert_eq!(body, json!({"status": "ok", "docs": 12, "model": "qwen2:0.5b"}));
    }

    #[tokio::test]
    async fn missing_question_is_rejected() {
        let (base, search) = app(echo_ollama().await, None).await;
        let (status, _, body) = post_ask(&base, json!({"question": "   ", "age": 30})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Missing 'question'"}));
        assert!(search.requests.lock().map(|r| r.is_empty()).unwrap_or(false));
    }

    #[tokio::test]
    async fn adult_question_uses_section_a() {
        let (base, search) = app(echo_ollama().await, None).await;
        let (status, headers, body) = post_ask(
            &base,
            json!({"question": "Is amoxicillin right for CAP?", "age": "45", "section": "B", "k": 3}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .and_then(|v| v.to_str().ok()),
            Some(ALLOW_METHODS)
        );
        assert_eq!(body["question"], "Is amoxicillin right for CAP?");
        assert_eq!(body["section"], "A");
        assert!(body["elapsed_s"].as_f64().is_some());

        let retrieved = body["retrieved"].as_array().cloned().unwrap_or_default();
        assert_eq!(retrieved.len(), 3);
        for (i, item) in retrieved.iter().enumerate() {
            assert_eq!(item["rank"], json!(i + 1));
            assert_eq!(item["meta"]["source"], "NAG_A");
        }

        let answer = body["answer"].as_str().unwrap_or_default();
        assert!(answer.starts_with("Verification: Diagnosis is accurate\n"));
        assert!(answer.contains("[1] NAG_A (doc-1)"));
        assert!(!answer.contains("Patient age not provided"));

        let requests = search.requests.lock().map(|r| r.clone()).unwrap_or_default();
        assert_eq!(requests, vec![9]);
    }

    #[tokio::test]
    async fn unknown_section_asks_for_age() {
        let (base, search) = app(echo_ollama().await, None).await;
        let (status, _, body) = post_ask(
            &base,
            json!({"question": "Ceftriaxone for meningitis?", "age": "unknown", "k": "zero"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["section"], "ALL");
        assert_eq!(body["retrieved"].as_array().map(Vec::len), Some(5));
        let answer = body["answer"].as_str().unwrap_or_default();
        assert!(answer.contains("NOTE: Patient age not provided."));

        let requests = search.requests.lock().map(|r| r.clone()).unwrap_or_default();
        assert_eq!(requests, vec![15]);
    }

    #[tokio::test]
    async fn model_failure_maps_to_server_error() {
        let (base, _) = app(failing_ollama().await, None).await;
        let (status, _, body) =
            post_ask(&base, json!({"question": "Vancomycin trough?", "section": "a"})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let error = body["error"].as_str().unwrap_or_default();
        assert!(error.starts_with("Backend failed: "));
        assert!(error.contains("model crashed"));
        assert!(body["elapsed_s"].as_f64().is_some());
    }

    #[tokio::test]
    async fn malformed_body_counts_as_missing_question() {
        let (base, _) = app(echo_ollama().await, None).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .body("{not json")
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn preflight_echoes_requested_headers() {
        let (base, _) = app(echo_ollama().await, None).await;
        let resp = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{base}/ask"))
            .header("Access-Control-Request-Headers", "X-Custom, Content-Type")
            .send()
            .await
            .expect("send");

        assert_eq!(resp.status(), StatusCode::OK);
        let header_value = |name| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        assert_eq!(
            header_value(header::ACCESS_CONTROL_ALLOW_HEADERS).as_deref(),
            Some("X-Custom, Content-Type")
        );
        assert_eq!(header_value(header::ACCESS_CONTROL_ALLOW_ORIGIN).as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn rate_limit_returns_too_many_requests() {
        let (base, _) = app(echo_ollama().await, RateLimiter::new(1, 1)).await;
        let body = json!({"question": "Dose of gentamicin?", "age": 8});

        let (first, _, _) = post_ask(&base, body.clone()).await;
        assert_eq!(first, StatusCode::OK);

        let (second, headers, error) = post_ask(&base, body).await;
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        assert!(error["error"].as_str().unwrap_or_default().contains("rate limit"));
        assert_eq!(
            headers.get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("1")
        );

        let health = reqwest::get(format!("{base}/health")).await.expect("get");
        assert_eq!(health.status(), StatusCode::OK);
    }
}
