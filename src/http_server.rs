//! HTTP front door
//!
//! Creates, reads and deletes AppDeployments on behalf of the CLI. Status
//! reads go through the watch cache.

use crate::api::{DeployRequest, MessageResponse, StatusResponse};
use crate::operator::{ClusterApi, ClusterError, ObjectKey};
use crate::watch_cache::WatchCache;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<dyn ClusterApi>,
    pub cache: Arc<WatchCache>,
    pub namespace: String,
}

impl ApiState {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cache: Arc<WatchCache>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            cache,
            namespace: namespace.into(),
        }
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), name)
    }
}

/// Handler failure mapped onto a status code and an error body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        let status = match &err {
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::AlreadyExists(_) | ClusterError::Conflict(_) => StatusCode::CONFLICT,
            ClusterError::Invalid(_) => StatusCode::BAD_REQUEST,
            ClusterError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        }
        (self.status, Json(MessageResponse::error(self.message))).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/deploy", post(deploy))
        .route("/status/{name}", get(status))
        .route("/{name}", delete(destroy))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `addr` until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP API server on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Run [`serve`] as a task. A failed server cancels `cancel`, so whatever
/// else shares the token stops with it.
pub fn spawn_server(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let result = serve(addr, state, cancel.clone()).await;
        if let Err(e) = &result {
            error!(%addr, error = %e, "HTTP API server failed, shutting down");
            cancel.cancel();
        }
        result
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn deploy(
    State(state): State<ApiState>,
    Json(request): Json<DeployRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let app = request
        .to_app_deployment(&state.namespace)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    match state.cluster.create_app(&app).await {
        Ok(_) => {
            info!(namespace = %state.namespace, name = %request.name, "AppDeployment created");
            Ok((
                StatusCode::CREATED,
                Json(MessageResponse::success(format!(
                    "deployment {} created",
                    request.name
                ))),
            ))
        }
        Err(ClusterError::AlreadyExists(_)) => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("deployment {} already exists", request.name),
        )),
        Err(e) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create deployment: {e}"),
        )),
    }
}

async fn status(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let app = state
        .cache
        .get_or_fetch(&state.key(&name))
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("deployment {name} not found")))?;
    Ok(Json(StatusResponse::from(&app)))
}

async fn destroy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    match state.cluster.delete_app(&state.key(&name)).await {
        Ok(()) => {
            state.cache.remove(&name);
            info!(namespace = %state.namespace, name = %name, "AppDeployment deleted");
            Ok(Json(MessageResponse::success(format!(
                "deployment {name} deleted"
            ))))
        }
        Err(ClusterError::NotFound(_)) => {
            warn!(namespace = %state.namespace, name = %name, "delete of unknown deployment");
            Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("deployment {name} not found"),
            ))
        }
        Err(e) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to delete deployment: {e}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::InMemoryCluster;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> ApiState {
        let cluster: Arc<dyn ClusterApi> = Arc::new(InMemoryCluster::new());
        let cache = Arc::new(WatchCache::new(
            cluster.clone(),
            "default",
            Duration::from_millis(10),
        ));
        ApiState::new(cluster, cache, "default")
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = router(state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_bind_failure_cancels_token() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            spawn_server(addr, state(), cancel.clone()),
        )
        .await
        .expect("server task finished")
        .unwrap();

        assert!(result.is_err());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_server_stops_cleanly_on_cancel() {
        let cancel = CancellationToken::new();
        let task = spawn_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            state(),
            cancel.clone(),
        );

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server task finished")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_cluster_error_mapping() {
        assert_eq!(
            ApiError::from(ClusterError::NotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ClusterError::AlreadyExists("x".into())).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ClusterError::Transient("x".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
