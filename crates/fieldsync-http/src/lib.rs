use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fieldsync_core::config::HttpSettings;
use fieldsync_core::model::{BulkMode, Record};
use fieldsync_reconcile::{ConflictError, ConflictQueueHandle, ConflictState};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    conflicts: ConflictQueueHandle,
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    #[serde(default)]
    ticket: Option<Uuid>,
    record: Record,
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    mode: BulkMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectResponse {
    status: String,
    remaining: usize,
}

#[derive(Debug, Serialize)]
struct BulkResponse {
    status: String,
    drained: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: String,
    version: String,
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.downcast_ref::<ConflictError>() {
            Some(ConflictError::QueueClosed) => StatusCode::SERVICE_UNAVAILABLE,
            Some(_) => StatusCode::CONFLICT,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Routes for the conflict-resolution dialog.
pub fn router(conflicts: ConflictQueueHandle) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/conflicts", get(conflicts_handler))
        .route("/v1/conflicts/select", post(select_handler))
        .route("/v1/conflicts/bulk", post(bulk_handler))
        .with_state(AppState { conflicts })
}

/// HTTP surface through which a remote UI answers pending conflicts.
pub struct ConflictServer {
    conflicts: ConflictQueueHandle,
    settings: HttpSettings,
}

impl ConflictServer {
    pub fn new(conflicts: ConflictQueueHandle, settings: HttpSettings) -> Self {
        Self {
            conflicts,
            settings,
        }
    }

    fn cors(&self) -> CorsLayer {
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if self.settings.cors_origins.is_empty() {
            return layer.allow_origin(Any);
        }
        let origins: Vec<HeaderValue> = self
            .settings
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }

    pub async fn start(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let app = router(self.conflicts.clone()).layer(self.cors());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.port));
        tracing::info!("Conflict API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}

async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn conflicts_handler(State(state): State<AppState>) -> Json<ConflictState> {
    Json(state.conflicts.state())
}

async fn select_handler(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<SelectResponse>, AppError> {
    let record_id = req.record.id.clone();
    match req.ticket {
        Some(ticket) => {
            state
                .conflicts
                .handle_select_ticket(ticket, req.record)
                .await?
        }
        None => state.conflicts.handle_select(req.record).await?,
    }
    tracing::info!(record_id = %record_id, "Conflict answered over HTTP");

    Ok(Json(SelectResponse {
        status: "ok".to_string(),
        remaining: state.conflicts.state().queue.len(),
    }))
}

async fn bulk_handler(
    State(state): State<AppState>,
    Json(req): Json<BulkRequest>,
) -> Result<Json<BulkResponse>, AppError> {
    let drained = state.conflicts.handle_bulk_select(req.mode).await?;
    Ok(Json(BulkResponse {
        status: "ok".to_string(),
        drained,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fieldsync_core::model::Owner;
    use fieldsync_reconcile::ConflictQueue;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(json!({})))
    }

    fn spawn_conflict(
        handle: &ConflictQueueHandle,
    ) -> tokio::task::JoinHandle<Result<Record, ConflictError>> {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .resolve_conflict(
                    vec![
                        Record::new("a", Owner::user("bob")),
                        Record::new("a", Owner::user("me")),
                    ],
                    "a",
                )
                .await
        })
    }

    #[tokio::test]
    async fn test_status() {
        let handle = ConflictQueue::spawn("me", 4);
        let (status, body) = send(router(handle), "GET", "/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_conflicts_view_and_select() {
        let handle = ConflictQueue::spawn("me", 4);
        let task = spawn_conflict(&handle);
        let pending = handle.next_pending().await.unwrap();

        let (status, body) = send(router(handle.clone()), "GET", "/v1/conflicts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["visible"], true);
        assert_eq!(body["queue"][0]["id"], "a");
        assert_eq!(body["queue"][0]["candidates"].as_array().unwrap().len(), 2);

        let (status, body) = send(
            router(handle.clone()),
            "POST",
            "/v1/conflicts/select",
            Some(json!({
                "ticket": pending.ticket,
                "record": { "id": "a", "ownerId": "me" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 0);
        assert!(task.await.unwrap().unwrap().owner_id.is_user("me"));
    }

    #[tokio::test]
    async fn test_select_without_pending_is_conflict() {
        let handle = ConflictQueue::spawn("me", 4);
        let (status, body) = send(
            router(handle),
            "POST",
            "/v1/conflicts/select",
            Some(json!({ "record": { "id": "a", "ownerId": null } })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("no conflict"));
    }

    #[tokio::test]
    async fn test_select_rejects_record_not_offered() {
        let handle = ConflictQueue::spawn("me", 4);
        let task = spawn_conflict(&handle);
        let pending = handle.next_pending().await.unwrap();

        let (status, _) = send(
            router(handle.clone()),
            "POST",
            "/v1/conflicts/select",
            Some(json!({
                "ticket": pending.ticket,
                "record": { "id": "a", "ownerId": "template" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(handle.state().current(), Some(&pending));

        handle.handle_bulk_select(BulkMode::Latest).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bulk() {
        let handle = ConflictQueue::spawn("me", 4);
        let task = spawn_conflict(&handle);
        handle.next_pending().await.unwrap();

        let (status, body) = send(
            router(handle.clone()),
            "POST",
            "/v1/conflicts/bulk",
            Some(json!({ "mode": "self" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["drained"], 1);
        assert!(task.await.unwrap().unwrap().owner_id.is_user("me"));
        assert_eq!(handle.state().bulk_mode, Some(BulkMode::SelfOwned));
    }
}
