//! # API Server Module
//!
//! ## Purpose
//! REST surface for the citation core: grounded query answering, chat with a
//! streaming variant, corpus search, PDF viewing, replay packets, telemetry,
//! and health.
//!
//! ## Input/Output Specification
//! - **Input**: JSON requests (camelCase), `X-API-Key` header on protected
//!   endpoints
//! - **Output**: JSON responses; newline-delimited JSON events on the chat
//!   stream; `application/pdf` bytes from the viewer endpoint
//!
//! ## Protection
//! Query endpoints require the configured API key and pass through the
//! process-wide leaky-bucket rate limiter (default 5 req/s, burst 10).

use crate::errors::CoreError;
use crate::retrieval::PageHit;
use crate::AppState;
use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Result as ActixResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query/chat request payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub include_debug: bool,
}

/// One `/search` result row
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultItem {
    pub opinion_id: String,
    pub case_name: String,
    pub appeal_no: String,
    pub release_date: Option<chrono::NaiveDate>,
    pub page_number: u32,
    pub snippet: String,
    pub rank: f32,
}

/// `/search` response payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResultItem>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub mode: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSearchParams {
    pub q: Option<String>,
    pub author: Option<String>,
    pub forum: Option<String>,
    #[serde(default)]
    pub exclude_r36: bool,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PdfParams {
    pub page: Option<u32>,
}

/// The API server wrapper
pub struct ApiServer {
    app_state: AppState,
}

impl ApiServer {
    pub fn new(app_state: AppState) -> Self {
        Self { app_state }
    }

    /// Bind and build the server, returning the runnable server handle.
    pub fn build(self) -> crate::errors::Result<actix_web::dev::Server> {
        let bind_addr = format!(
            "{}:{}",
            self.app_state.config.server.host, self.app_state.config.server.port
        );
        tracing::info!("Starting API server on {}", bind_addr);

        let state = self.app_state.clone();
        let enable_cors = state.config.server.enable_cors;
        let server = HttpServer::new(move || {
            let cors = if enable_cors {
                Cors::permissive()
            } else {
                Cors::default()
            };
            App::new()
                .wrap(cors)
                .app_data(web::Data::new(state.clone()))
                .configure(configure_routes)
        })
        .bind(&bind_addr)
        .map_err(|e| CoreError::Internal {
            message: format!("Failed to bind server to {}: {}", bind_addr, e),
        })?
        .run();

        Ok(server)
    }

    /// Run the API server until shutdown.
    pub async fn run(self) -> crate::errors::Result<()> {
        self.build()?.await.map_err(|e| CoreError::Internal {
            message: format!("Server error: {}", e),
        })?;

        Ok(())
    }
}

/// Route table, shared with the test harness.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/query", web::post().to(query_handler))
        .route("/chat", web::post().to(query_handler))
        .route("/chat/stream", web::post().to(chat_stream_handler))
        .route("/search", web::get().to(search_handler))
        .route("/search/advanced", web::get().to(advanced_search_handler))
        .route("/pdf/{opinion_id}", web::get().to(pdf_handler))
        .route("/replay-packet/{run_id}", web::get().to(replay_packet_handler))
        .route("/telemetry/dashboard", web::get().to(telemetry_handler))
        .route("/audit/circuit-breaker", web::get().to(breaker_handler))
        .route("/health", web::get().to(health_handler));
}

fn check_api_key(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(expected) = &state.config.server.external_api_key else {
        return Ok(());
    };
    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "Invalid or missing API key"
        })))
    }
}

fn check_rate_limit(state: &AppState) -> Result<(), HttpResponse> {
    if state.rate_limiter.try_acquire() {
        Ok(())
    } else {
        Err(HttpResponse::TooManyRequests().json(serde_json::json!({
            "error": "Rate limit exceeded"
        })))
    }
}

fn error_response(err: &CoreError) -> HttpResponse {
    let body = serde_json::json!({
        "error": err.to_string(),
        "category": err.category(),
    });
    match err {
        CoreError::InvalidRequest { .. } | CoreError::ValidationFailed { .. } => {
            HttpResponse::BadRequest().json(body)
        }
        CoreError::AuthenticationFailed { .. } => HttpResponse::Unauthorized().json(body),
        CoreError::RateLimitExceeded => HttpResponse::TooManyRequests().json(body),
        CoreError::RunNotFound { .. } | CoreError::OpinionNotFound { .. } => {
            HttpResponse::NotFound().json(body)
        }
        CoreError::RetrievalFailure { .. } => HttpResponse::BadGateway().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// `POST /query` and `POST /chat`
async fn query_handler(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<QueryRequest>,
) -> ActixResult<HttpResponse> {
    if let Err(resp) = check_api_key(&state, &req) {
        return Ok(resp);
    }
    if let Err(resp) = check_rate_limit(&state) {
        return Ok(resp);
    }

    match state
        .pipeline
        .answer_query(&payload.question, payload.conversation_id.clone(), payload.include_debug)
        .await
    {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("query failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// `POST /chat/stream`: newline-delimited events of shape
/// `{type: "conversation_id" | "token" | "sources", ...}`.
async fn chat_stream_handler(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<QueryRequest>,
) -> ActixResult<HttpResponse> {
    if let Err(resp) = check_api_key(&state, &req) {
        return Ok(resp);
    }
    if let Err(resp) = check_rate_limit(&state) {
        return Ok(resp);
    }

    let response = match state
        .pipeline
        .answer_query(&payload.question, payload.conversation_id.clone(), false)
        .await
    {
        Ok(response) => response,
        Err(e) => return Ok(error_response(&e)),
    };

    let mut events = Vec::new();
    events.push(serde_json::json!({
        "type": "conversation_id",
        "conversationId": response.conversation_id,
    }));
    for token in response.answer.split_inclusive(' ') {
        events.push(serde_json::json!({"type": "token", "text": token}));
    }
    events.push(serde_json::json!({
        "type": "sources",
        "sources": response.sources,
        "citationSummary": response.citation_summary,
    }));

    let body = events
        .into_iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .body(body + "\n"))
}

fn to_search_item(hit: &PageHit) -> SearchResultItem {
    SearchResultItem {
        opinion_id: hit.opinion_id.to_string(),
        case_name: hit.case_name.clone(),
        appeal_no: hit.appeal_no.clone(),
        release_date: hit.release_date,
        page_number: hit.page_number,
        snippet: crate::text::truncate_chars(&hit.text, 300),
        rank: hit.rank,
    }
}

/// `GET /search?q=…&mode=all|parties&limit=…`
async fn search_handler(
    state: web::Data<AppState>,
    params: web::Query<SearchParams>,
) -> ActixResult<HttpResponse> {
    let query = params.q.clone().unwrap_or_default();
    let party_only = params.mode.as_deref() == Some("parties");
    let limit = params.limit.unwrap_or(state.config.retrieval.default_limit).min(100);

    let engine = state.pipeline.engine();
    match engine.search_pages(&query, None, limit, party_only, state.config.retrieval.max_text_chars)
    {
        Ok(hits) => {
            let results: Vec<SearchResultItem> = hits.iter().map(to_search_item).collect();
            let count = results.len();
            Ok(HttpResponse::Ok().json(SearchResponse {
                query,
                results,
                count,
            }))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

/// `GET /search/advanced` with hybrid ranking and cursor pagination.
async fn advanced_search_handler(
    state: web::Data<AppState>,
    params: web::Query<AdvancedSearchParams>,
) -> ActixResult<HttpResponse> {
    let query = params.q.clone().unwrap_or_default();
    let limit = params.limit.unwrap_or(state.config.retrieval.default_limit).min(100);
    let engine = state.pipeline.engine();
    match engine.advanced_search(
        &query,
        params.author.as_deref(),
        params.forum.as_deref(),
        params.exclude_r36,
        params.cursor.as_deref(),
        limit,
    ) {
        Ok(page) => Ok(HttpResponse::Ok().json(page)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// `GET /pdf/{opinion_id}[?page=N]`
async fn pdf_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<PdfParams>,
) -> ActixResult<HttpResponse> {
    let opinion_id = path.into_inner();
    let Ok(parsed) = Uuid::parse_str(&opinion_id) else {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Invalid opinion id"
        })));
    };

    let fallback_url = state
        .corpus
        .opinion(parsed)
        .ok()
        .flatten()
        .map(|o| o.pdf_url)
        .unwrap_or_default();

    let pdf_path = state.config.server.pdf_dir.join(format!("{}.pdf", opinion_id));
    match tokio::fs::read(&pdf_path).await {
        Ok(bytes) => {
            let mut response = HttpResponse::Ok();
            response.content_type("application/pdf");
            if let Some(page) = params.page {
                response.insert_header(("X-Viewer-Page", page.to_string()));
            }
            Ok(response.body(bytes))
        }
        Err(_) => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": "PDF not yet downloaded",
            "status": "retry_later",
            "fallback_url": fallback_url,
        }))),
    }
}

/// `GET /replay-packet/{run_id}` (API-key protected)
async fn replay_packet_handler(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    if let Err(resp) = check_api_key(&state, &req) {
        return Ok(resp);
    }
    match state.recorder.replay_packet(&path.into_inner()) {
        Ok(packet) => Ok(HttpResponse::Ok().json(packet)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// `GET /telemetry/dashboard`
async fn telemetry_handler(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.telemetry.summary()))
}

/// `GET /audit/circuit-breaker`
async fn breaker_handler(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.recorder.breaker_state()))
}

/// `GET /health`
async fn health_handler(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    let storage = match state.corpus.health_check() {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    let corpus_state = state.corpus.corpus_state().ok();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": if storage == "healthy" { "healthy" } else { "unhealthy" },
        "components": {
            "storage": storage,
            "audit": state.recorder.breaker_state().state.as_str(),
        },
        "corpus": corpus_state,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecorder, SledRunStore};
    use crate::augment::RecallAugmenter;
    use crate::config::Config;
    use crate::corpus::test_support::{opinion, seed, temp_store};
    use crate::generator::LlmClient;
    use crate::pipeline::QueryPipeline;
    use crate::retrieval::RetrievalEngine;
    use crate::telemetry::TelemetryStore;
    use crate::utils::LeakyBucket;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn app_state(api_key: Option<&str>) -> (AppState, tempfile::TempDir) {
        let (store, dir) = temp_store();
        let alice = opinion(
            uuid::Uuid::new_v4(),
            "Alice Corp. v. CLS Bank International",
            "SCOTUS",
            (2014, 6, 19),
        );
        seed(&store, &alice, &["We hold that the claims at issue are drawn to the abstract idea of intermediated settlement."]);

        let mut config = Config::default();
        config.server.external_api_key = api_key.map(|k| k.to_string());
        let config = Arc::new(config);
        let corpus = Arc::new(store);
        let engine = Arc::new(RetrievalEngine::new(corpus.clone(), config.retrieval.clone()));
        let augmenter =
            RecallAugmenter::new(config.augment.clone(), corpus.clone(), engine.clone(), None);
        let llm = Arc::new(LlmClient::new(config.generation.clone()));
        let db = sled::Config::new().temporary(true).open().unwrap();
        let recorder = Arc::new(AuditRecorder::new(
            Arc::new(SledRunStore::open(&db).unwrap()),
            config.audit.clone(),
        ));
        let telemetry = Arc::new(TelemetryStore::new());
        let pipeline = Arc::new(QueryPipeline::new(
            config.clone(),
            corpus.clone(),
            engine,
            augmenter,
            llm,
            recorder.clone(),
            telemetry.clone(),
            None,
        ));
        let state = AppState {
            rate_limiter: Arc::new(LeakyBucket::new(
                config.server.rate_limit_per_second,
                config.server.rate_limit_burst,
            )),
            config,
            pipeline,
            corpus,
            recorder,
            telemetry,
        };
        (state, dir)
    }

    #[actix_web::test]
    async fn test_query_requires_api_key_when_configured() {
        let (state, _dir) = app_state(Some("secret"));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/query")
            .set_json(serde_json::json!({"question": "abstract idea"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);

        let req = test::TestRequest::post()
            .uri("/query")
            .insert_header(("X-API-Key", "secret"))
            .set_json(serde_json::json!({"question": "abstract idea"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_query_returns_camel_case_payload() {
        let (state, _dir) = app_state(None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/query")
            .set_json(serde_json::json!({"question": "abstract idea settlement", "includeDebug": true}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body.get("answer").is_some());
        assert!(body.get("conversationId").is_some());
        assert!(body.get("citationSummary").is_some());
        assert!(body["citationSummary"].get("verifiedRate").is_some());
        assert!(body.get("debug").is_some());
    }

    #[actix_web::test]
    async fn test_search_modes() {
        let (state, _dir) = app_state(None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/search?q=abstract%20idea&mode=all&limit=5")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], serde_json::json!(1));

        // Party mode ignores body text
        let req = test::TestRequest::get()
            .uri("/search?q=abstract%20idea&mode=parties")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], serde_json::json!(0));

        let req = test::TestRequest::get().uri("/search?q=Alice&mode=parties").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], serde_json::json!(1));
    }

    #[actix_web::test]
    async fn test_pdf_miss_returns_retry_later() {
        let (state, _dir) = app_state(None);
        let missing = uuid::Uuid::new_v4();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri(&format!("/pdf/{}?page=3", missing))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], serde_json::json!("PDF not yet downloaded"));
        assert_eq!(body["status"], serde_json::json!("retry_later"));
    }

    #[actix_web::test]
    async fn test_replay_packet_round_trip() {
        let (state, _dir) = app_state(None);
        let run_id = state
            .recorder
            .create_run(None, "what did alice hold", Some("101".to_string()), "abc".to_string());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri(&format!("/replay-packet/{}", run_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["runId"], serde_json::json!(run_id));
        assert_eq!(body["userQuery"], serde_json::json!("what did alice hold"));

        let req = test::TestRequest::get().uri("/replay-packet/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_chat_stream_event_shape() {
        let (state, _dir) = app_state(None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/chat/stream")
            .set_json(serde_json::json!({"question": "abstract idea settlement"}))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.len() >= 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], serde_json::json!("conversation_id"));
        let last: serde_json::Value = serde_json::from_str(lines[lines.len() - 1]).unwrap();
        assert_eq!(last["type"], serde_json::json!("sources"));
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let (state, _dir) = app_state(None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], serde_json::json!("healthy"));
        assert_eq!(body["components"]["audit"], serde_json::json!("closed"));
    }
}
