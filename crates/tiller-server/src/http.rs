use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use tiller_core::{run_sweeper, SubscriberCallback};
use tiller_types::{
    ConfirmRequest, CreateConversationRequest, Event, SendMessageRequest, TillerError,
};

use crate::AppState;

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    start_id: Option<u64>,
    end_id: Option<u64>,
    /// `true` keeps the connection open and streams live events over SSE.
    follow: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: String,
}

#[derive(Debug, Deserialize, Default)]
struct FilesQuery {
    path: Option<String>,
}

fn status_for(err: &TillerError) -> StatusCode {
    match err {
        TillerError::NotFound(_) => StatusCode::NOT_FOUND,
        TillerError::ConversationLimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
        TillerError::Configuration(_) => StatusCode::BAD_REQUEST,
        TillerError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: TillerError) -> (StatusCode, Json<serde_json::Value>) {
    (
        status_for(&err),
        Json(json!({
            "error": err.kind().as_str(),
            "message": err.to_string(),
        })),
    )
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let sweeper = tokio::spawn(run_sweeper(Arc::clone(&state.manager)));
    let manager = Arc::clone(&state.manager);
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tiller engine listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    sweeper.abort();
    manager.close_all().await;
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/conversation", post(create_conversation).get(list_conversations))
        .route(
            "/conversation/{id}",
            get(get_conversation).delete(close_conversation),
        )
        .route("/conversation/{id}/message", post(send_message))
        .route("/conversation/{id}/confirm", post(confirm))
        .route("/conversation/{id}/pause", post(pause))
        .route("/conversation/{id}/resume", post(resume))
        .route("/conversation/{id}/stop", post(stop))
        .route("/conversation/{id}/events", get(events))
        .route("/conversation/{id}/files", get(list_files))
        .route("/conversation/{id}/file", get(get_file))
        .route("/conversation/{id}/vscode-url", get(vscode_url))
        .route("/conversation/{id}/trajectory", get(trajectory))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> impl IntoResponse {
    match state.manager.create(req).await {
        Ok(id) => (StatusCode::CREATED, Json(json!({"conversationId": id}))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let page = query.page.unwrap_or(0);
    let page_size = query.page_size.unwrap_or(20);
    Json(state.manager.list(page, page_size).await)
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn close_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.close(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    match state.manager.send_message(&id, &req.text).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> impl IntoResponse {
    match state.manager.confirm(&id, req.action_id, req.accept).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.pause(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.resume(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.stop(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

/// Without `follow`, a plain JSON range read. With `follow=true`, an SSE
/// stream fed by a named stream subscriber, starting at `start_id`.
async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> axum::response::Response {
    if !query.follow.unwrap_or(false) {
        return match state
            .manager
            .events(&id, query.start_id.unwrap_or(0), query.end_id)
            .await
        {
            Ok(events) => Json(events).into_response(),
            Err(err) => error_response(err).into_response(),
        };
    }

    match event_stream_sse(&state, &id, query.start_id).await {
        Ok(sse) => sse.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn event_stream_sse(
    state: &AppState,
    id: &str,
    start_id: Option<u64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>>, TillerError> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let subscriber = format!("sse-{}", Uuid::new_v4());
    let manager = Arc::clone(&state.manager);
    let conversation = id.to_string();
    let subscriber_for_cleanup = subscriber.clone();
    let callback: SubscriberCallback = Arc::new(move |event: Event| {
        let tx = tx.clone();
        let manager = Arc::clone(&manager);
        let conversation = conversation.clone();
        let subscriber = subscriber_for_cleanup.clone();
        Box::pin(async move {
            if tx.send(event).is_err() {
                // client went away; drop the subscription out-of-band
                tokio::spawn(async move {
                    let _ = manager.detach_subscriber(&conversation, &subscriber).await;
                });
            }
            Ok(())
        })
    });
    state
        .manager
        .attach_subscriber(id, &subscriber, callback, Some(start_id.unwrap_or(0)))
        .await?;

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        Ok(SseEvent::default()
            .event("conversation.event")
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default().data("serialization error")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> impl IntoResponse {
    match state.manager.list_files(&id, query.path.as_deref()).await {
        Ok(files) => Json(files).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> impl IntoResponse {
    match state.manager.get_file(&id, &query.path).await {
        Ok(bytes) => bytes.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn vscode_url(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.vscode_url(&id).await {
        Ok(url) => Json(json!({"url": url})).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn trajectory(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.get_trajectory(&id).await {
        Ok(trajectory) => Json(trajectory).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tiller_core::{ConversationManager, TillerConfig};
    use tower::ServiceExt;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = TillerConfig::default();
        config.core.file_store = "memory".to_string();
        config.sandbox.workspace_root = Some(dir.path().display().to_string());
        let manager = ConversationManager::new(config).expect("manager");
        (AppState::new(manager), dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (state, _dir) = test_state().await;
        let response = app_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_fetch_and_read_events() {
        let (state, _dir) = test_state().await;
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/conversation")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"initialMessage": "hello"}"#))
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let id = body["conversationId"].as_str().expect("id").to_string();

        state.manager.wait_terminal(&id).await.expect("terminal");

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/conversation/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = body_json(response).await;
        assert_eq!(snapshot["agentState"], "finished");

        let response = app
            .oneshot(
                Request::get(format!("/conversation/{id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        let events = body_json(response).await;
        let kinds = events
            .as_array()
            .expect("array")
            .iter()
            .map(|e| e["kind"].as_str().unwrap_or(""))
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["user_message", "message", "null", "finish"]);
    }

    #[tokio::test]
    async fn unknown_conversation_is_a_404() {
        let (state, _dir) = test_state().await;
        let response = app_router(state)
            .oneshot(
                Request::get("/conversation/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn listing_pages_conversations() {
        let (state, _dir) = test_state().await;
        let app = app_router(state.clone());
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/conversation")
                        .header("content-type", "application/json")
                        .body(Body::from("{}"))
                        .unwrap(),
                )
                .await
                .expect("request");
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let response = app
            .oneshot(
                Request::get("/conversation?page=0&page_size=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["items"].as_array().expect("items").len(), 2);
    }

    #[tokio::test]
    async fn over_cap_create_returns_429() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = TillerConfig::default();
        config.core.file_store = "memory".to_string();
        config.core.max_concurrent_conversations = 1;
        config.sandbox.workspace_root = Some(dir.path().display().to_string());
        let manager = ConversationManager::new(config).expect("manager");
        let app = app_router(AppState::new(manager));

        let first = app
            .clone()
            .oneshot(
                Request::post("/conversation")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(
                Request::post("/conversation")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
