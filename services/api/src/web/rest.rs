//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::middleware::Caller;
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_reliability_core::{
    CompletionOutcome, CompletionResult, ErrorKind, PortError, ProcessReport, QueueItem,
    SessionError, StartOutcome,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        start_session_handler,
        complete_session_handler,
        list_queue_handler,
        process_queue_handler,
        provider_callback_handler,
    ),
    components(
        schemas(
            StartSessionRequest,
            StartSessionResponse,
            CompleteSessionRequest,
            CompleteSessionResponse,
            QueueSnapshot,
            QueueItemView,
            ProcessReportView,
            ProviderEvent
        )
    ),
    tags(
        (name = "Session Reliability API", description = "Practice sessions, daily quota and the offline operation queue.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct StartSessionRequest {
    pub course_id: String,
    /// Seconds the session stays open, between 1 and 3600.
    pub ttl_seconds: u32,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct StartSessionResponse {
    /// `started` or `deferred`.
    pub status: String,
    pub session_id: Option<Uuid>,
    pub conversation_id: Option<String>,
    pub conversation_url: Option<String>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct CompleteSessionRequest {
    pub conversation_id: Option<String>,
    pub accuracy_score: Option<f64>,
    pub duration_seconds: Option<u64>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CompleteSessionResponse {
    /// `completed` or `deferred`.
    pub status: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct QueueItemView {
    pub id: Uuid,
    pub operation: String,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl From<QueueItem> for QueueItemView {
    fn from(item: QueueItem) -> Self {
        Self {
            id: item.id,
            operation: item.operation.name().to_string(),
            queued_at: item.timestamp,
            retry_count: item.retry_count,
            last_error: item.last_error,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub items: Vec<QueueItemView>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProcessReportView {
    pub succeeded: usize,
    pub retained: usize,
    pub dropped: usize,
}

impl From<ProcessReport> for ProcessReportView {
    fn from(report: ProcessReport) -> Self {
        Self {
            succeeded: report.succeeded,
            retained: report.retained,
            dropped: report.dropped,
        }
    }
}

/// A conversation event posted by the provider to the callback URL.
#[derive(Deserialize, ToSchema)]
pub struct ProviderEvent {
    pub event_type: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub properties: Option<serde_json::Value>,
}

//=========================================================================================
// Error Mapping
//=========================================================================================

/// Maps a core error onto an HTTP status and a message safe to show the caller.
pub fn error_response(err: &SessionError) -> (StatusCode, String) {
    let root = err.root();
    let status = match root {
        SessionError::Limit(_) => StatusCode::TOO_MANY_REQUESTS,
        SessionError::Config(_) | SessionError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        SessionError::Expired { .. } => StatusCode::GONE,
        SessionError::Store(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
        SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => match root.kind() {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Api => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "request failed");
        return (status, "Internal server error".to_string());
    }
    warn!(error = %err, status = status.as_u16(), "request rejected");
    (status, root.to_string())
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Start a practice session.
///
/// Consumes one conversation from the caller's daily quota and opens a provider
/// conversation. When the provider cannot be reached the work is queued and the
/// response is `202 Accepted` with status `deferred`.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session started", body = StartSessionResponse),
        (status = 202, description = "Session queued for when the provider is reachable", body = StartSessionResponse),
        (status = 400, description = "Invalid input, missing caller or provider misconfiguration"),
        (status = 429, description = "Daily conversation limit reached"),
        (status = 502, description = "Conversation provider failed")
    ),
    params(
        ("x-user-id" = String, Header, description = "The authenticated user's id."),
        ("x-user-tier" = String, Header, description = "`free` or `premium`; anything else is anonymous.")
    )
)]
pub async fn start_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let outcome = app_state
        .practice
        .start_practice_session(caller.0.as_ref(), &body.course_id, body.ttl_seconds)
        .await
        .map_err(|e| error_response(&e))?;

    let response = match outcome {
        StartOutcome::Started {
            session_id,
            conversation,
        } => (
            StatusCode::CREATED,
            StartSessionResponse {
                status: "started".to_string(),
                session_id: Some(session_id),
                conversation_id: Some(conversation.id),
                conversation_url: Some(conversation.url),
            },
        ),
        StartOutcome::Deferred { session_id } => (
            StatusCode::ACCEPTED,
            StartSessionResponse {
                status: "deferred".to_string(),
                session_id,
                conversation_id: None,
                conversation_url: None,
            },
        ),
    };
    Ok((response.0, Json(response.1)))
}

/// Complete a practice session.
///
/// Ends the provider conversation, if one is given, and records the result.
#[utoipa::path(
    post,
    path = "/sessions/{id}/complete",
    request_body = CompleteSessionRequest,
    responses(
        (status = 200, description = "Session completed", body = CompleteSessionResponse),
        (status = 202, description = "Completion queued", body = CompleteSessionResponse),
        (status = 400, description = "Missing caller, or the session cannot be completed from its current status"),
        (status = 403, description = "The session belongs to another user"),
        (status = 404, description = "Unknown session"),
        (status = 410, description = "The session expired")
    ),
    params(
        ("id" = Uuid, Path, description = "The session id."),
        ("x-user-id" = String, Header, description = "The authenticated user's id.")
    )
)]
pub async fn complete_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<Uuid>,
    Json(body): Json<CompleteSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user = caller.0.ok_or_else(|| {
        error_response(&SessionError::Config(
            "You must be signed in to complete a session".to_string(),
        ))
    })?;
    let session = app_state
        .practice
        .sessions()
        .get(session_id)
        .await
        .map_err(|e| error_response(&e))?;
    if session.user_id != user.id {
        warn!(%session_id, caller = %user.id, "completion attempted for another user's session");
        return Err((
            StatusCode::FORBIDDEN,
            "This session belongs to another user".to_string(),
        ));
    }

    let result = CompletionResult {
        accuracy_score: body.accuracy_score,
        duration_seconds: body.duration_seconds,
        conversation_id: body.conversation_id.clone(),
    };
    let outcome = app_state
        .practice
        .end_practice_session(session_id, body.conversation_id.as_deref(), result)
        .await
        .map_err(|e| error_response(&e))?;

    let (status, label) = match outcome {
        CompletionOutcome::Completed => (StatusCode::OK, "completed"),
        CompletionOutcome::Deferred => (StatusCode::ACCEPTED, "deferred"),
    };
    Ok((
        status,
        Json(CompleteSessionResponse {
            status: label.to_string(),
        }),
    ))
}

/// List the operations waiting in the offline queue, oldest first.
#[utoipa::path(
    get,
    path = "/queue",
    responses(
        (status = 200, description = "Pending operations", body = QueueSnapshot)
    )
)]
pub async fn list_queue_handler(State(app_state): State<Arc<AppState>>) -> Json<QueueSnapshot> {
    let items: Vec<QueueItemView> = app_state
        .queue()
        .items()
        .await
        .into_iter()
        .map(QueueItemView::from)
        .collect();
    Json(QueueSnapshot {
        pending: items.len(),
        items,
    })
}

/// Replay the offline queue now instead of waiting for the next scheduled pass.
#[utoipa::path(
    post,
    path = "/queue/process",
    responses(
        (status = 200, description = "What the pass did", body = ProcessReportView),
        (status = 500, description = "The queue could not be persisted")
    )
)]
pub async fn process_queue_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<ProcessReportView>, (StatusCode, String)> {
    let report = app_state
        .queue()
        .process_queue(app_state.practice.as_ref())
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(report.into()))
}

/// Receive a conversation event from the provider.
#[utoipa::path(
    post,
    path = "/api/callback/{user_id}/{session_id}/{timestamp}/{suffix}",
    request_body = ProviderEvent,
    responses(
        (status = 204, description = "Event received")
    ),
    params(
        ("user_id" = String, Path, description = "The session owner."),
        ("session_id" = Uuid, Path, description = "The practice session."),
        ("timestamp" = i64, Path, description = "When the callback URL was issued, in epoch milliseconds."),
        ("suffix" = String, Path, description = "Random suffix that keeps the URL unique.")
    )
)]
pub async fn provider_callback_handler(
    Path((user_id, session_id, timestamp, _suffix)): Path<(String, Uuid, i64, String)>,
    Json(event): Json<ProviderEvent>,
) -> StatusCode {
    let event_type = event.event_type.as_deref().unwrap_or("unknown");
    info!(
        %session_id,
        user_id = %user_id,
        issued_at = timestamp,
        event_type,
        has_properties = event.properties.is_some(),
        "provider callback received"
    );
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::web::build_router;
    use crate::web::state::Backends;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use session_reliability_core::domain::{Course, RawProviderConfig};
    use session_reliability_core::memory::{
        MemoryCatalog, MemoryConfigSource, MemoryStorage, MemoryStore, RecordingNotifier,
        ScriptedProvider,
    };
    use session_reliability_core::{ConnectivityMonitor, SystemClock};
    use tower::ServiceExt;

    const CREATED: &str =
        r#"{"conversation_id":"c-1","conversation_url":"https://meet.example/c-1","status":"active"}"#;

    async fn app() -> axum::Router {
        let config = Config::from_lookup(|key| {
            (key == "CALLBACK_ORIGIN").then(|| "https://learn.example.com".to_string())
        })
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let catalog = MemoryCatalog::default();
        catalog.insert(Course {
            id: "german-2".into(),
            title: "German Small Talk".into(),
            conversational_context: None,
        });
        let backends = Backends {
            sessions: store.clone(),
            usage: store,
            provider_config: Arc::new(MemoryConfigSource::new(Some(RawProviderConfig {
                replica_id: Some("r-1".into()),
                persona_id: Some("p-1".into()),
                api_key: Some("secret".into()),
            }))),
            catalog: Arc::new(catalog),
            provider: Arc::new(ScriptedProvider::new(vec![
                ScriptedProvider::reply(200, CREATED),
                ScriptedProvider::reply(200, "{}"),
            ])),
            storage: Arc::new(MemoryStorage::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(SystemClock),
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
        };
        let state = AppState::assemble(Arc::new(config), backends).await.unwrap();
        build_router(Arc::new(state))
    }

    fn post(uri: &str, user: Option<(&str, &str)>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some((id, tier)) = user {
            builder = builder.header("x-user-id", id).header("x-user-tier", tier);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn start_and_complete_a_session() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(post(
                "/sessions",
                Some(("learner-1", "free")),
                serde_json::json!({"course_id": "german-2", "ttl_seconds": 900}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let started: StartSessionResponse = json_body(response).await;
        assert_eq!(started.status, "started");
        assert_eq!(started.conversation_id.as_deref(), Some("c-1"));

        let session_id = started.session_id.unwrap();
        let response = app
            .oneshot(post(
                &format!("/sessions/{session_id}/complete"),
                Some(("learner-1", "free")),
                serde_json::json!({"conversation_id": "c-1", "accuracy_score": 88.0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let done: CompleteSessionResponse = json_body(response).await;
        assert_eq!(done.status, "completed");
    }

    #[tokio::test]
    async fn quota_and_identity_errors_map_to_client_statuses() {
        let app = app().await;
        let body = serde_json::json!({"course_id": "german-2", "ttl_seconds": 900});

        let anonymous = app.clone().oneshot(post("/sessions", None, body.clone())).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::BAD_REQUEST);

        let first = app
            .clone()
            .oneshot(post("/sessions", Some(("learner-2", "free")), body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = app
            .oneshot(post("/sessions", Some(("learner-2", "free")), body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn completing_an_unknown_session_is_not_found() {
        let response = app()
            .await
            .oneshot(post(
                &format!("/sessions/{}/complete", Uuid::new_v4()),
                Some(("learner-1", "free")),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn only_the_owner_can_complete_a_session() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(post(
                "/sessions",
                Some(("learner-1", "free")),
                serde_json::json!({"course_id": "german-2", "ttl_seconds": 900}),
            ))
            .await
            .unwrap();
        let started: StartSessionResponse = json_body(response).await;
        let uri = format!("/sessions/{}/complete", started.session_id.unwrap());
        let body = serde_json::json!({"accuracy_score": 100.0});

        let stranger = app
            .clone()
            .oneshot(post(&uri, Some(("learner-9", "premium")), body.clone()))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        let signed_out = app.clone().oneshot(post(&uri, None, body.clone())).await.unwrap();
        assert_eq!(signed_out.status(), StatusCode::BAD_REQUEST);

        let owner = app
            .oneshot(post(&uri, Some(("learner-1", "free")), body))
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn queue_endpoints_report_an_idle_queue() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let snapshot: QueueSnapshot = json_body(response).await;
        assert_eq!(snapshot.pending, 0);

        let response = app
            .oneshot(Request::post("/queue/process").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: ProcessReportView = json_body(response).await;
        assert_eq!(report.succeeded + report.retained + report.dropped, 0);
    }

    #[tokio::test]
    async fn provider_callbacks_are_acknowledged() {
        let uri = format!("/api/callback/learner-1/{}/1767225600000/a1b2c3d4e5f6", Uuid::new_v4());
        let response = app()
            .await
            .oneshot(post(&uri, None, serde_json::json!({"event_type": "system.shutdown"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn exhausted_provider_retries_are_bad_gateway() {
        let err = SessionError::RetryExhausted {
            attempts: 3,
            last: Box::new(SessionError::Api {
                status: 503,
                message: "overloaded".into(),
            }),
        };
        assert_eq!(error_response(&err).0, StatusCode::BAD_GATEWAY);
        let expired = SessionError::Expired {
            session_id: Uuid::new_v4(),
        };
        assert_eq!(error_response(&expired).0, StatusCode::GONE);
    }
}
