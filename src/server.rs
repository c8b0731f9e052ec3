//! HTTP surface: submit a query, stream its events, fetch its result.
//!
//! `POST /research/query` returns the session's logId immediately and the
//! session runs asynchronously. `GET /research/stream/{logId}` is a
//! server-sent event stream that closes at the session's terminal state.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::db::DbHandle;
use crate::decomposer::QueryDecomposer;
use crate::errors::OrchestratorError;
use crate::evaluation::{ConfidenceScorer, EvaluationCoordinator};
use crate::events::EventCoordinator;
use crate::executor::PhaseRunner;
use crate::executor::registry::PhaseExecutorRegistry;
use crate::knowledge::KnowledgeStore;
use crate::llm::{ChatModel, HttpChatModel};
use crate::orchestrator::SessionController;
use crate::planner::Planner;
use crate::tools::{
    ToolRegistry, knowledge::KnowledgeSearchExecutor, synthesize::SynthesizeExecutor,
};

pub struct AppState {
    pub controller: Arc<SessionController>,
    pub events: Arc<EventCoordinator>,
    pub knowledge: Arc<KnowledgeStore>,
}

/// Wire the full component graph from a config.
///
/// External tool providers (web search, fetch) register through
/// `extra_tools`; steps naming unregistered tools fail individually
/// without taking the whole session down with a panic.
pub fn build_state(
    config: &Config,
    extra_tools: impl FnOnce(&mut ToolRegistry),
) -> Result<Arc<AppState>> {
    let db = DbHandle::open(&config.db_path).context("Failed to open database")?;
    let model: Arc<dyn ChatModel> = Arc::new(HttpChatModel::new(
        &config.llm.base_url,
        &config.llm.primary_model,
        &config.llm.embedding_model,
    ));
    Ok(assemble(db, model, config, extra_tools))
}

/// Assembly shared by production and tests (tests pass an in-memory DB and
/// a scripted model).
pub fn assemble(
    db: DbHandle,
    model: Arc<dyn ChatModel>,
    config: &Config,
    extra_tools: impl FnOnce(&mut ToolRegistry),
) -> Arc<AppState> {
    let events = Arc::new(EventCoordinator::new(db.clone()));
    let knowledge = Arc::new(KnowledgeStore::new(db, model.clone()));

    let decomposer = Arc::new(QueryDecomposer::new(model.clone(), events.clone()));
    let planner = Arc::new(Planner::new(
        model.clone(),
        decomposer,
        events.clone(),
        config.planner.clone(),
    ));

    let mut tools = ToolRegistry::new();
    tools.register("synthesize", Arc::new(SynthesizeExecutor::new(model.clone())));
    tools.register(
        "knowledge_search",
        Arc::new(KnowledgeSearchExecutor::new(knowledge.clone())),
    );
    extra_tools(&mut tools);

    let runner = Arc::new(PhaseRunner::new(Arc::new(tools), events.clone()));
    let evaluation = Arc::new(EvaluationCoordinator::new(
        model.clone(),
        events.clone(),
        config.evaluation.clone(),
    ));
    let registry = Arc::new(PhaseExecutorRegistry::standard(
        runner,
        evaluation.clone(),
        ConfidenceScorer::new(model.clone()),
        events.clone(),
    ));

    let controller = Arc::new(SessionController::new(
        events.clone(),
        planner,
        registry,
        evaluation,
        knowledge.clone(),
        model,
    ));

    Arc::new(AppState {
        controller,
        events,
        knowledge,
    })
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    #[serde(default)]
    query: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/research/query", post(submit_query))
        .route("/research/stream/{log_id}", get(stream_session))
        .route("/research/results/{log_id}", get(get_result))
        .route("/health", get(|| async { StatusCode::OK }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn submit_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    match state.controller.start_session(&request.query) {
        Ok(log_id) => Json(json!({"logId": log_id})).into_response(),
        Err(OrchestratorError::EmptyQuery) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "query must not be empty"})),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn stream_session(
    Path(log_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(status) = state.controller.session_status(log_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // A session already at a terminal state has nothing left to stream; the
    // client gets an immediately closed stream rather than a hang.
    let stream: futures::stream::BoxStream<'static, crate::model::Event> =
        if status.is_terminal() {
            futures::stream::empty().boxed()
        } else {
            state.events.subscribe(log_id).boxed()
        };

    let sse_stream = stream.map(|event| {
        let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(SseEvent::default().event(event.event_type).data(data))
    });

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(sse_stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn get_result(
    Path(log_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.knowledge.find_by_log_id(log_id) {
        Ok(Some(result)) => Json(result).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

/// Start the HTTP server and block until shutdown.
pub async fn start_server(config: Config) -> Result<()> {
    let state = build_state(&config, |_| {})?;
    let app = build_router(state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "scout listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResponse, LlmError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct InertModel;

    #[async_trait]
    impl ChatModel for InertModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            Err(LlmError::EmptyResponse)
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Err(LlmError::EmptyResponse)
        }
    }

    fn test_router() -> Router {
        let state = assemble(
            DbHandle::in_memory().unwrap(),
            Arc::new(InertModel),
            &Config::default(),
            |_| {},
        );
        build_router(state)
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_query_is_rejected_with_400() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/research/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "  "}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn valid_query_returns_log_id() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/research/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "what is rust?"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let log_id = body["logId"].as_str().unwrap();
        assert!(Uuid::parse_str(log_id).is_ok());
    }

    #[tokio::test]
    async fn missing_result_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri(format!("/research/results/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_stream_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri(format!("/research/stream/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
