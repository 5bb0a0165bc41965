// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP surface of the object-store proxy, in the layout of restic's REST
//! backend protocol

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::object_store_proxy::ObjectStoreProxy;
use crate::domain::object_store::{ObjectKind, ObjectStoreError};
use crate::infrastructure::telemetry;

pub const REST_V2_MEDIA_TYPE: &str = "application/vnd.x.restic.rest.v2";

pub struct ProxyState {
    pub proxy: Arc<ObjectStoreProxy>,
}

pub fn app(proxy: Arc<ObjectStoreProxy>) -> Router {
    let state = Arc::new(ProxyState { proxy });

    Router::new()
        .route("/", post(create_repository))
        .route(
            "/config",
            get(get_config).head(head_config).post(post_config),
        )
        .route("/{kind}/", get(list_objects))
        .route("/{kind}", get(list_objects))
        .route(
            "/{kind}/{name}",
            get(get_object)
                .head(head_object)
                .post(post_object)
                .delete(delete_object),
        )
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<ObjectStoreProxy>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app(proxy))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

// ============================================================================
// Errors
// ============================================================================

fn status_of(err: &ObjectStoreError) -> StatusCode {
    match err {
        ObjectStoreError::UnknownKind(_) | ObjectStoreError::InvalidName(_) => {
            StatusCode::BAD_REQUEST
        }
        ObjectStoreError::NotFound(_) => StatusCode::NOT_FOUND,
        ObjectStoreError::LengthRequired => StatusCode::LENGTH_REQUIRED,
        ObjectStoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: ObjectStoreError) -> Response {
    let status = status_of(&err);
    if status.is_server_error() {
        warn!(error = %err, "Object store request failed");
    } else {
        debug!(error = %err, "Object store request rejected");
    }
    (status, err.to_string()).into_response()
}

/// Record the request and pass the response through
fn finish(method: &'static str, kind: Option<ObjectKind>, response: Response) -> Response {
    let kind = kind.map(|k| k.as_str()).unwrap_or("unknown");
    telemetry::record_proxy_request(method, kind, response.status().as_u16());
    response
}

fn parse_kind(kind: &str) -> Result<ObjectKind, Response> {
    match kind.parse::<ObjectKind>() {
        Ok(ObjectKind::Config) | Err(_) => {
            Err(error_response(ObjectStoreError::UnknownKind(kind.to_string())))
        }
        Ok(kind) => Ok(kind),
    }
}

// ============================================================================
// Repository & config
// ============================================================================

#[derive(Deserialize)]
struct CreateParams {
    create: Option<bool>,
}

/// The repository root always exists upstream
async fn create_repository(Query(params): Query<CreateParams>) -> Response {
    let status = if params.create.unwrap_or(false) {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    finish("POST", None, status.into_response())
}

async fn get_config(State(state): State<Arc<ProxyState>>) -> Response {
    finish("GET", Some(ObjectKind::Config), read(&state, ObjectKind::Config, "config").await)
}

async fn head_config(State(state): State<Arc<ProxyState>>) -> Response {
    finish("HEAD", Some(ObjectKind::Config), head(&state, ObjectKind::Config, "config").await)
}

async fn post_config(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let response = upload(&state, ObjectKind::Config, "config", &headers, body).await;
    finish("POST", Some(ObjectKind::Config), response)
}

// ============================================================================
// Objects
// ============================================================================

async fn list_objects(
    State(state): State<Arc<ProxyState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return finish("GET", None, response),
    };
    let v2 = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(REST_V2_MEDIA_TYPE));

    let response = match state.proxy.list(kind).await {
        Ok(objects) if v2 => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(REST_V2_MEDIA_TYPE))],
            Json(objects),
        )
            .into_response(),
        Ok(objects) => {
            Json(objects.into_iter().map(|o| o.name).collect::<Vec<_>>()).into_response()
        }
        Err(e) => error_response(e),
    };
    finish("GET", Some(kind), response)
}

async fn get_object(
    State(state): State<Arc<ProxyState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    match parse_kind(&kind) {
        Ok(kind) => finish("GET", Some(kind), read(&state, kind, &name).await),
        Err(response) => finish("GET", None, response),
    }
}

async fn head_object(
    State(state): State<Arc<ProxyState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    match parse_kind(&kind) {
        Ok(kind) => finish("HEAD", Some(kind), head(&state, kind, &name).await),
        Err(response) => finish("HEAD", None, response),
    }
}

async fn post_object(
    State(state): State<Arc<ProxyState>>,
    Path((kind, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match parse_kind(&kind) {
        Ok(kind) => finish("POST", Some(kind), upload(&state, kind, &name, &headers, body).await),
        Err(response) => finish("POST", None, response),
    }
}

async fn delete_object(
    State(state): State<Arc<ProxyState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return finish("DELETE", None, response),
    };
    let response = match state.proxy.delete(kind, &name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    };
    finish("DELETE", Some(kind), response)
}

async fn read(state: &ProxyState, kind: ObjectKind, name: &str) -> Response {
    match state.proxy.read_url(kind, name).await {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => error_response(e),
    }
}

async fn head(state: &ProxyState, kind: ObjectKind, name: &str) -> Response {
    match state.proxy.head(kind, name).await {
        Ok(size) => (StatusCode::OK, [(header::CONTENT_LENGTH, size.to_string())]).into_response(),
        Err(e) => error_response(e),
    }
}

async fn upload(
    state: &ProxyState,
    kind: ObjectKind,
    name: &str,
    headers: &HeaderMap,
    body: Body,
) -> Response {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let stream = body.into_data_stream().map_err(std::io::Error::other).boxed();

    match state.proxy.upload(kind, name, content_length, stream).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}
