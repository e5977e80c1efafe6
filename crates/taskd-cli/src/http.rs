//! JSON API over the task service.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::json;
use taskd_core::app::{CancelOutcome, DaemonStatus, ListQuery, Submission, TaskService};
use taskd_core::domain::{Task, TaskPage, TaskStatus};
use taskd_core::TaskdError;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{self, AuthToken};

const BODY_LIMIT: usize = 100 * 1024;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Conflict(String),
    Internal(String),
}

impl From<TaskdError> for ApiError {
    fn from(err: TaskdError) -> Self {
        match err {
            TaskdError::Validation(msg) => ApiError::BadRequest(msg),
            TaskdError::NotFound(_) => ApiError::NotFound,
            TaskdError::Conflict(msg) => ApiError::Conflict(msg),
            TaskdError::Store(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Task not found".to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(service: Arc<TaskService>, token: AuthToken) -> Router {
    let api = Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/status", get(daemon_status));

    Router::new()
        .nest("/api", api)
        .fallback(|| async { (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))) })
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(middleware::from_fn_with_state(token, auth::require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn create_task(
    State(service): State<Arc<TaskService>>,
    body: Result<Json<Submission>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let Json(submission) = body?;
    let task = service.submit(submission).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// Raw listing parameters. Unparseable numbers fall back to defaults.
#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

impl ListParams {
    fn into_query(self) -> ApiResult<ListQuery> {
        let status = match self.status.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<TaskStatus>()
                    .map_err(|_| ApiError::BadRequest(format!("invalid status: {raw}")))?,
            ),
        };
        let number = |raw: Option<String>| raw.and_then(|s| s.trim().parse::<usize>().ok());
        Ok(ListQuery {
            status,
            limit: number(self.limit),
            offset: number(self.offset),
        })
    }
}

async fn list_tasks(
    State(service): State<Arc<TaskService>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<TaskPage>> {
    Ok(Json(service.list(params.into_query()?).await?))
}

async fn get_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(service.get(&id).await?))
}

async fn delete_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelOutcome>> {
    Ok(Json(service.cancel(&id).await?))
}

async fn daemon_status(State(service): State<Arc<TaskService>>) -> ApiResult<Json<DaemonStatus>> {
    Ok(Json(service.status().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use rstest::rstest;
    use serde_json::Value;
    use taskd_core::config::{RunnerConfig, SupervisorConfig};
    use taskd_core::domain::{TaskId, TaskUpdate};
    use taskd_core::impls::InMemoryTaskStore;
    use taskd_core::ports::{NoopNotifier, SystemClock, TaskStore, UlidGenerator};
    use taskd_core::queue::QueueRunner;
    use taskd_core::supervisor::ProcessSupervisor;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        app: Router,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(InMemoryTaskStore::new());
            let runner = Arc::new(QueueRunner::new(
                store.clone(),
                Arc::new(ProcessSupervisor::new(SupervisorConfig::default())),
                Arc::new(NoopNotifier),
                Arc::new(SystemClock),
                RunnerConfig::default(),
            ));
            let service = Arc::new(TaskService::new(
                store.clone(),
                runner,
                Arc::new(UlidGenerator::new(SystemClock)),
                Arc::new(SystemClock),
            ));
            Self {
                store,
                app: router(service, AuthToken::new(TOKEN)),
            }
        }

        async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder()
                .method(method)
                .uri(uri)
                .header(AUTHORIZATION, format!("Bearer {TOKEN}"));
            let body = match body {
                Some(json) => {
                    req = req.header(CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
            let status = resp.status();
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let json = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }

        async fn submit(&self, prompt: &str) -> String {
            let (status, body) = self
                .call("POST", "/api/tasks", Some(json!({ "prompt": prompt })))
                .await;
            assert_eq!(status, StatusCode::CREATED);
            body["id"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn submit_then_fetch() {
        let h = Harness::new();
        let (status, body) = h
            .call(
                "POST",
                "/api/tasks",
                Some(json!({ "prompt": " refactor auth ", "project_dir": "/projects/api" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["prompt"], "refactor auth");

        let id = body["id"].as_str().unwrap();
        let (status, got) = h.call("GET", &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["project_dir"], "/projects/api");
    }

    #[rstest]
    #[case::missing_prompt(json!({}), "prompt is required")]
    #[case::relative_dir(json!({ "prompt": "x", "project_dir": "rel" }), "project_dir must be an absolute path")]
    #[tokio::test]
    async fn invalid_submission_is_400(#[case] body: Value, #[case] message: &str) {
        let h = Harness::new();
        let (status, resp) = h.call("POST", "/api/tasks", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["error"], message);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let h = Harness::new();
        let (status, _) = h
            .call(
                "POST",
                "/api/tasks",
                Some(json!({ "prompt": "x".repeat(BODY_LIMIT + 1) })),
            )
            .await;
        assert!(status.is_client_error(), "{status}");
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let h = Harness::new();
        for p in ["a", "b", "c"] {
            h.submit(p).await;
        }
        let (status, page) = h.call("GET", "/api/tasks?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 3);
        assert_eq!(page["tasks"].as_array().unwrap().len(), 2);

        let (_, done) = h.call("GET", "/api/tasks?status=completed", None).await;
        assert_eq!(done["total"], 0);

        let (_, lenient) = h.call("GET", "/api/tasks?limit=abc&offset=-1", None).await;
        assert_eq!(lenient["tasks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_400() {
        let h = Harness::new();
        let (status, body) = h.call("GET", "/api/tasks?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid status: bogus");
    }

    #[tokio::test]
    async fn missing_task_is_404() {
        let h = Harness::new();
        let (status, body) = h.call("GET", "/api/tasks/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Task not found");

        let (status, _) = h.call("DELETE", "/api/tasks/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = h.call("POST", "/api/tasks/unknown/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_then_delete() {
        let h = Harness::new();
        let id = h.submit("later").await;

        let (status, body) = h.call("POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "id": id, "status": "cancelled" }));

        let (status, body) = h.call("POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Cannot cancel task with status: cancelled");

        let (status, _) = h.call("DELETE", &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = h.call("GET", &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn running_task_cannot_be_deleted() {
        let h = Harness::new();
        let id = h.submit("busy").await;
        let task_id: TaskId = id.parse().unwrap();
        h.store
            .transition(&task_id, TaskUpdate::claim(chrono::Utc::now()))
            .await
            .unwrap();

        let (status, body) = h.call("DELETE", &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Cannot delete a running task");

        let (status, body) = h.call("POST", &format!("/api/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelling");
    }

    #[tokio::test]
    async fn status_snapshot() {
        let h = Harness::new();
        h.submit("queued").await;
        let (status, body) = h.call("GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue_depth"], 1);
        assert_eq!(body["tasks_completed"], 0);
        assert_eq!(body["current_task"], Value::Null);
    }

    #[tokio::test]
    async fn routes_require_the_token() {
        let h = Harness::new();
        let req = Request::get("/api/status").body(Body::empty()).unwrap();
        let resp = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
