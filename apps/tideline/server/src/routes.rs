use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tideline_core::{
    is_valid_window_key, Arguments, ConnectionId, Target, TopicValue, TriggerError, TriggerReport,
    UnserializableTopicError, UserIdentity, WindowContext,
};
use tracing::{info, warn};

use crate::multiplexer::ConnectionSnapshot;
use crate::state::AppState;
use crate::ws::ws_handler;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/windows/:window_key/topics", put(set_topics_handler))
        .route("/trigger", post(trigger_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid api token")]
    Unauthorized,
    #[error("invalid window key: {0}")]
    InvalidWindowKey(String),
    #[error(transparent)]
    Topic(#[from] UnserializableTopicError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidWindowKey(_) | ApiError::Topic(_) | ApiError::Trigger(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Checks the bearer token of API calls when one is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected) {
        Ok(())
    } else {
        counter!("tideline_api_unauthorized_total", 1);
        Err(ApiError::Unauthorized)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    connections: Vec<ConnectionSnapshot>,
    signals: Vec<String>,
    queues: Vec<String>,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let registry = state.dispatcher.registry();
    Json(StatsResponse {
        active_connections: state.multiplexer.active_connections(),
        connections: state.multiplexer.snapshot(),
        signals: registry
            .signal_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        queues: registry.expected_queues().into_iter().collect(),
    })
}

#[derive(Debug, Deserialize)]
pub struct TopicsRequest {
    #[serde(default)]
    pub topics: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicsResponse {
    pub connection_id: ConnectionId,
    pub topics: Vec<String>,
}

/// Replaces the topic subscriptions of a window, typically while the host
/// application renders the page that will open it.
async fn set_topics_handler(
    State(state): State<Arc<AppState>>,
    Path(window_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TopicsRequest>,
) -> Result<Json<TopicsResponse>, ApiError> {
    authorize(&state, &headers)?;
    if !is_valid_window_key(&window_key) {
        return Err(ApiError::InvalidWindowKey(window_key));
    }
    let connection_id = ConnectionId::new(window_key);
    let context = WindowContext::for_connection(connection_id.clone());

    let serializer = state.dispatcher.serializer();
    let keys = body
        .topics
        .into_iter()
        .map(|topic| serializer.serialize(&context, &TopicValue::from_json(topic)))
        .collect::<Result<Vec<_>, _>>()?;

    // The user key is only ever written by the socket itself; keep it.
    let topics = state.dispatcher.topics();
    let user_id = topics
        .topics_for(&connection_id)
        .await
        .unwrap_or_default()
        .into_iter()
        .find_map(|key| key.strip_prefix("-user.").map(str::to_string));
    topics
        .set_topics(&connection_id, user_id.as_deref(), &keys, state.topic_ttl)
        .await;
    let stored = topics.topics_for(&connection_id).await.unwrap_or_default();
    info!(connection_id = %connection_id, topics = keys.len(), "window topics replaced");
    Ok(Json(TopicsResponse {
        connection_id,
        topics: stored,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub signal: String,
    #[serde(default)]
    pub to: Vec<Value>,
    #[serde(default)]
    pub opts: Arguments,
    /// Window the trigger is made on behalf of, for `WINDOW` targets.
    #[serde(default)]
    pub window_key: Option<String>,
    #[serde(default)]
    pub user: Option<UserIdentity>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub signal_id: String,
    pub enqueued: usize,
    pub ran_inline: usize,
    pub denied: usize,
    pub pushed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl From<TriggerReport> for TriggerResponse {
    fn from(report: TriggerReport) -> Self {
        Self {
            signal_id: report.signal_id,
            enqueued: report.enqueued,
            ran_inline: report.ran_inline,
            denied: report.denied,
            pushed: report.pushed,
            skipped: report.skipped,
            errors: report.errors.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Server-originated trigger on behalf of the host application.
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    authorize(&state, &headers)?;

    let mut context = match body.window_key {
        Some(window_key) if is_valid_window_key(&window_key) => WindowContext::for_connection(window_key),
        Some(window_key) => return Err(ApiError::InvalidWindowKey(window_key)),
        None => WindowContext::server(),
    };
    if let Some(user) = body.user {
        context = context.with_user(user);
    }
    if let Some(locale) = body.locale {
        context = context.with_locale(locale);
    }

    let targets: Vec<Target> = body.to.into_iter().map(Target::from_json).collect();
    let report = state
        .dispatcher
        .trigger(&context, &body.signal, &targets, body.opts)
        .await?;
    if !report.errors.is_empty() {
        warn!(
            signal = %body.signal,
            signal_id = %report.signal_id,
            errors = report.errors.len(),
            "trigger completed with target errors"
        );
    }
    Ok(Json(report.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tideline_core::SignalRegistry;
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::state::{build_state, Background};

    async fn app(config: ServerConfig) -> (Router, Arc<AppState>, Background) {
        let (state, background) = build_state(&config, SignalRegistry::new(), None)
            .await
            .unwrap();
        (router(state.clone()), state, background)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_topics(window: &str, body: Value) -> Request<Body> {
        Request::put(format!("/windows/{window}/topics"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_missing_metrics() {
        let (router, _state, _bg) = app(ServerConfig::default()).await;
        let health = router
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json_body(health).await["status"], "ok");

        let metrics = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn topics_are_serialized_and_stored() {
        let (router, state, _bg) = app(ServerConfig::default()).await;
        let response = router
            .oneshot(put_topics(
                "w1",
                json!({"topics": ["blog:42", {"kind": "post", "id": 7}], "user_id": "3"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["connection_id"], "w1");

        let stored = state
            .dispatcher
            .topics()
            .topics_for(&ConnectionId::from("w1"))
            .await
            .unwrap();
        assert!(stored.contains(&"blog:42".to_string()));
        assert!(stored.contains(&"-post.7".to_string()));
        assert!(!stored.contains(&"-user.3".to_string()));
    }

    #[tokio::test]
    async fn replacing_topics_keeps_the_socket_user_key() {
        let (router, state, _bg) = app(ServerConfig::default()).await;
        let cache = state.dispatcher.topics();
        let window = ConnectionId::from("w2");
        cache
            .set_topics(&window, Some("5"), &["old".to_string()], state.topic_ttl)
            .await;

        let response = router
            .oneshot(put_topics("w2", json!({"topics": ["new"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = cache.topics_for(&window).await.unwrap();
        assert!(stored.contains(&"-user.5".to_string()));
        assert!(stored.contains(&"new".to_string()));
        assert!(!stored.contains(&"old".to_string()));
    }

    #[tokio::test]
    async fn invalid_topics_and_keys_are_rejected() {
        let (router, _state, _bg) = app(ServerConfig::default()).await;
        let response = router
            .clone()
            .oneshot(put_topics("w1", json!({"topics": ["-window.other"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(put_topics("bad%20key", json!({"topics": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_token_is_enforced() {
        let config = ServerConfig {
            api_token: Some("s3cret".into()),
            ..ServerConfig::default()
        };
        let (router, _state, _bg) = app(config).await;
        let denied = router
            .clone()
            .oneshot(put_topics("w1", json!({"topics": []})))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut request = put_topics("w1", json!({"topics": []}));
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let allowed = router.oneshot(request).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_reports_per_target() {
        let (router, _state, _bg) = app(ServerConfig::default()).await;
        let request = Request::post("/trigger")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"signal": "notice", "to": ["BROADCAST", "WINDOW"], "opts": {"n": 1}})
                    .to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["pushed"], 0);
        assert_eq!(body["skipped"], 1);
        assert!(body["signal_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn trigger_without_targets_is_a_bad_request() {
        let (router, _state, _bg) = app(ServerConfig::default()).await;
        let request = Request::post("/trigger")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"signal": "notice"}).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }
}
