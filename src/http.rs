//! HTTP transport for the node registry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config;
use crate::error::Error;
use crate::service::NodeService;
use crate::types::{Node, NodeDraft};

struct AppState {
    service: NodeService,
    base: String,
}

pub fn router(service: NodeService, config: &config::Http) -> Router {
    let state = Arc::new(AppState {
        service,
        base: format!("http://{}:{}", config.address, config.port),
    });

    Router::new()
        .route("/nodes", get(index).post(create))
        .route("/nodes/{id}", get(show))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn index(State(state): State<Arc<AppState>>) -> Response {
    match state.service.index().await {
        Ok(nodes) => (StatusCode::OK, Json(NodeListView::from(nodes))).into_response(),
        Err(err) => error_response("failed to fetch the nodes", err),
    }
}

async fn show(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.service.show(id).await {
        Ok(node) => (StatusCode::OK, Json(NodeView::from(node))).into_response(),
        Err(err) => error_response("failed to fetch the node", err),
    }
}

async fn create(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let view: NodeCreateView = match serde_json::from_slice(&body) {
        Ok(view) => view,
        Err(err) => {
            return write_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to decode the request body",
                Some(err.to_string()),
                None,
            );
        }
    };

    match state.service.create(view.into()).await {
        Ok(node) => {
            let location = format!("{}/nodes/{}", state.base, node.id);
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(NodeView::from(node)),
            )
                .into_response()
        }
        Err(err) => error_response("failed to create the node", err),
    }
}

async fn not_found() -> Response {
    write_error(StatusCode::NOT_FOUND, "endpoint not found", None, None)
}

async fn method_not_allowed() -> Response {
    write_error(StatusCode::BAD_REQUEST, "method not allowed", None, None)
}

fn error_response(title: &str, err: Error) -> Response {
    let status = match err {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    let source = err.field_errors().cloned();
    write_error(status, title, Some(err.to_string()), source)
}

fn write_error(
    status: StatusCode,
    title: &str,
    detail: Option<String>,
    source: Option<HashMap<String, String>>,
) -> Response {
    let body = ErrorBody {
        error: ErrorView {
            title: title.to_string(),
            detail,
            source,
        },
    };
    (status, Json(body)).into_response()
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorView,
}

#[derive(Serialize)]
struct ErrorView {
    title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeCreateView {
    #[serde(default)]
    address: String,

    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl From<NodeCreateView> for NodeDraft {
    fn from(view: NodeCreateView) -> Self {
        Self {
            address: view.address,
            metadata: view.metadata,
        }
    }
}

#[derive(Serialize)]
struct NodeListView {
    nodes: Vec<NodeView>,
}

impl From<Vec<Node>> for NodeListView {
    fn from(nodes: Vec<Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(NodeView::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct NodeView {
    id: i64,
    address: String,
    metadata: HashMap<String, String>,
    ttl: String,
    active: bool,
    #[serde(rename = "createdAt")]
    created_at: String,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            address: node.address,
            metadata: node.metadata,
            ttl: humantime::format_duration(node.ttl).to_string(),
            active: node.active,
            created_at: node.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}
