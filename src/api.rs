//! HTTP control API over the registry and session manager.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::TransferError;
use crate::net_async::server::Coordinator;
use crate::protocol::DEFAULT_FILE_NAME;
use crate::registry::ConnectionInfo;
use crate::session::TransferRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<ConnectionInfo>,
    pub count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBody {
    pub client_id: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStarted {
    pub message: String,
    pub request_id: Uuid,
    pub client_id: String,
    pub file_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadList {
    pub downloads: Vec<TransferRequest>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<Vec<String>>,
}

fn error_response(status: StatusCode, error: impl Into<String>, available: Option<Vec<String>>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            available,
        }),
    )
        .into_response()
}

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clients", get(list_clients))
        .route("/download", post(start_download))
        .route("/download/{request_id}", get(download_status))
        .route("/downloads", get(list_downloads))
        .with_state(coordinator)
}

pub async fn serve(bind: &str, coordinator: Coordinator) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    info!(bind, "HTTP API listening");
    axum::serve(listener, router(coordinator))
        .await
        .context("HTTP API server")
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn list_clients(State(c): State<Coordinator>) -> Json<ClientList> {
    let clients = c.registry.list();
    Json(ClientList {
        count: clients.len(),
        clients,
    })
}

async fn start_download(State(c): State<Coordinator>, Json(body): Json<DownloadBody>) -> Response {
    let Some(client_id) = body.client_id.filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "clientId required", None);
    };
    let file_name = body
        .file_name
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

    match c.sessions.request(&client_id, &file_name) {
        Ok(request_id) => Json(DownloadStarted {
            message: "Download started".to_string(),
            request_id,
            client_id,
            file_name,
        })
        .into_response(),
        Err(e @ TransferError::AgentNotConnected(_)) => {
            error_response(StatusCode::NOT_FOUND, e.to_string(), Some(c.registry.ids()))
        }
        Err(e) => {
            error!(client = %client_id, error = %e, "download request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None)
        }
    }
}

async fn download_status(State(c): State<Coordinator>, Path(request_id): Path<String>) -> Response {
    let found = Uuid::parse_str(&request_id)
        .ok()
        .and_then(|id| c.sessions.get_status(&id));
    match found {
        Some(req) => Json(req).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Download not found", None),
    }
}

async fn list_downloads(State(c): State<Coordinator>) -> Json<DownloadList> {
    let downloads = c.sessions.list();
    Json(DownloadList {
        count: downloads.len(),
        downloads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::registry::{ConnectionHandle, ConnectionRegistry};
    use crate::session::{TransferSessionManager, TransferStatus};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn coordinator(dir: &std::path::Path) -> (Coordinator, mpsc::UnboundedReceiver<Envelope>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add("c1", ConnectionHandle::new(tx), None);
        let sessions = Arc::new(TransferSessionManager::new(registry.clone(), dir).unwrap());
        (Coordinator::new(registry, sessions), rx)
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = coordinator(dir.path());
        let app = router(c);

        let (status, body) = call(app.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app, Request::get("/clients").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["clients"][0]["id"], "c1");
        assert!(body["clients"][0]["lastHeartbeat"].is_string());
    }

    #[tokio::test]
    async fn test_download_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let (c, mut rx) = coordinator(dir.path());
        let app = router(c.clone());

        let (status, body) = call(
            app.clone(),
            post_json("/download", serde_json::json!({"clientId": "c1", "fileName": "a.txt"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let started: DownloadStarted = serde_json::from_value(body).unwrap();
        assert_eq!(started.file_name, "a.txt");
        assert!(matches!(
            rx.try_recv().unwrap(),
            Envelope::DownloadRequest { request_id, .. } if request_id == started.request_id
        ));

        let uri = format!("/download/{}", started.request_id);
        let (status, body) = call(app.clone(), Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let req: TransferRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.status, TransferStatus::Downloading);
        assert_eq!(req.agent_id, "c1");

        let (status, body) = call(app, Request::get("/downloads").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["downloads"][0]["status"], "downloading");
    }

    #[tokio::test]
    async fn test_default_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _rx) = coordinator(dir.path());
        let (status, body) = call(router(c), post_json("/download", serde_json::json!({"clientId": "c1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fileName"], DEFAULT_FILE_NAME);
    }

    #[tokio::test]
    async fn test_download_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (c, mut rx) = coordinator(dir.path());
        let app = router(c);

        let (status, body) = call(app.clone(), post_json("/download", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "clientId required");

        let (status, body) = call(
            app.clone(),
            post_json("/download", serde_json::json!({"clientId": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["available"], serde_json::json!(["c1"]));
        assert!(rx.try_recv().is_err());

        for uri in ["/download/not-a-uuid".to_string(), format!("/download/{}", Uuid::new_v4())] {
            let (status, body) = call(app.clone(), Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "Download not found");
        }
    }
}
