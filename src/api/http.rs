//! HTTP API Server
//!
//! Single fallback handler: every request is resolved to a blob address,
//! authorized, announced to the observer and then either executed or
//! answered with a signed URL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tower_http::trace::TraceLayer;

use crate::address::{self, BlobAddress, RequestTarget};
use crate::auth::AuthGuard;
use crate::error::{Error, Result};
use crate::events::{LogSink, Operation, RequestEvent, RequestObserver};
use crate::store::{
    decode_metadata_header, encode_metadata_header, BlobMetadata, BlobStore, ListOptions,
    METADATA_HEADER,
};

/// `Accept` value asking for a signed URL instead of direct execution
pub const SIGNED_URL_ACCEPT: &str = "application/json;type=signed-url";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Shared application state
pub struct AppState {
    /// Blob storage
    pub store: BlobStore,
    /// Credential checker
    pub guard: AuthGuard,
    /// Per-request observer
    pub observer: Option<Arc<dyn RequestObserver>>,
    /// Debug log sink
    pub logger: LogSink,
    /// Log every request through `logger`
    pub debug: bool,
    /// PUT body limit
    pub max_body_bytes: usize,
    /// Bound port, used for signed URLs when the request has no Host
    pub port: AtomicU16,
}

impl AppState {
    fn log_debug(&self, message: &str) {
        if self.debug {
            (self.logger)(message);
        }
    }

    fn notify(&self, kind: Operation, url: &str) {
        if let Some(observer) = &self.observer {
            observer.on_request(&RequestEvent {
                kind,
                url: url.to_string(),
            });
        }
    }
}

/// Signed URL response body
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedUrlResponse {
    pub url: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(state: &AppState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    state.log_debug(&format!("{} {}", parts.method, url));

    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .map_err(|e| Error::InvalidRequest(format!("invalid query string: {}", e)))?;

    let resolved = address::resolve(parts.uri.path(), query.get("context").map(String::as_str))
        .and_then(|target| {
            let operation = operation_for(&parts.method, &target.address, &query)?;
            Ok((operation, target))
        });

    // Nothing about the request is revealed before it is authorized
    let authorization = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.guard.authorize(
        authorization,
        query.get("signature").map(String::as_str),
        resolved.as_ref().ok().map(|(op, target)| (*op, &target.address)),
    )?;

    let (operation, target) = resolved?;
    state.notify(operation, &url);

    if wants_signed_url(&parts.headers, &target, operation) {
        return Ok(signed_url_response(state, &parts, operation, &target.address));
    }

    match operation {
        Operation::Get => get_blob(state, &target.address).await,
        Operation::GetMetadata if parts.method == Method::HEAD => {
            head_blob(state, &target.address).await
        }
        Operation::GetMetadata => get_blob_metadata(state, &target.address).await,
        Operation::Set => set_blob(state, &parts, body, &target.address).await,
        Operation::Delete => delete_blob(state, &target.address).await,
        Operation::List => list_blobs(state, &target.address, &query).await,
    }
}

/// Map method and address to the blob operation
fn operation_for(
    method: &Method,
    address: &BlobAddress,
    query: &HashMap<String, String>,
) -> Result<Operation> {
    let operation = match *method {
        Method::GET if !address.has_key() => Operation::List,
        Method::GET if flag(query, "metadata") => Operation::GetMetadata,
        Method::GET => Operation::Get,
        Method::HEAD => Operation::GetMetadata,
        Method::PUT => Operation::Set,
        Method::DELETE => Operation::Delete,
        _ => return Err(Error::MethodNotAllowed(method.to_string())),
    };

    if operation.requires_key() && !address.has_key() {
        return Err(Error::InvalidRequest(format!("{} requires a blob key", operation)));
    }
    Ok(operation)
}

fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    matches!(query.get(name).map(String::as_str), Some("" | "1" | "true"))
}

fn wants_signed_url(headers: &HeaderMap, target: &RequestTarget, operation: Operation) -> bool {
    target.scheme.is_api()
        && operation != Operation::List
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.replace(' ', "").eq_ignore_ascii_case(SIGNED_URL_ACCEPT))
            .unwrap_or(false)
}

fn signed_url_response(
    state: &AppState,
    parts: &Parts,
    operation: Operation,
    address: &BlobAddress,
) -> Response {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", state.port.load(Ordering::Relaxed)));

    let mut url = format!(
        "http://{}{}?signature={}",
        host,
        address.signed_path(),
        state.guard.capability(operation, address)
    );
    if operation == Operation::GetMetadata {
        url.push_str("&metadata=true");
    }

    (StatusCode::OK, Json(SignedUrlResponse { url })).into_response()
}

// ============ Operations ============

fn blob_headers(
    builder: axum::http::response::Builder,
    metadata: &BlobMetadata,
) -> axum::http::response::Builder {
    let mut builder = builder
        .header(
            header::CONTENT_TYPE,
            metadata.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE),
        )
        .header(METADATA_HEADER, encode_metadata_header(&metadata.metadata));
    if let Some(etag) = &metadata.etag {
        builder = builder.header(header::ETAG, etag);
    }
    builder
}

fn build(builder: axum::http::response::Builder, body: Body) -> Result<Response> {
    builder
        .body(body)
        .map_err(|e| Error::InvalidMetadata(format!("cannot render response headers: {}", e)))
}

/// GET key → raw bytes
async fn get_blob(state: &AppState, address: &BlobAddress) -> Result<Response> {
    let blob = state.store.get(address).await?;
    let builder = blob_headers(Response::builder().status(StatusCode::OK), &blob.metadata)
        .header(header::CONTENT_LENGTH, blob.data.len());
    build(builder, Body::from(blob.data))
}

/// HEAD key → metadata as headers
async fn head_blob(state: &AppState, address: &BlobAddress) -> Result<Response> {
    let metadata = state.store.get_metadata(address).await?;
    build(
        blob_headers(Response::builder().status(StatusCode::OK), &metadata),
        Body::empty(),
    )
}

/// GET key?metadata=true → metadata as JSON
async fn get_blob_metadata(state: &AppState, address: &BlobAddress) -> Result<Response> {
    let metadata = state.store.get_metadata(address).await?;
    Ok((StatusCode::OK, Json(metadata)).into_response())
}

/// PUT key → store body, 204 with the new ETag
async fn set_blob(
    state: &AppState,
    parts: &Parts,
    body: Body,
    address: &BlobAddress,
) -> Result<Response> {
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let metadata = match parts.headers.get(METADATA_HEADER) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::InvalidMetadata("header is not valid ASCII".into()))?;
            decode_metadata_header(value)?
        }
        None => Map::new(),
    };

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > state.max_body_bytes as u64) {
        return Err(Error::PayloadTooLarge(state.max_body_bytes));
    }

    let data: Bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| {
            let inner = e.into_inner();
            if exceeds_limit(&*inner) {
                Error::PayloadTooLarge(state.max_body_bytes)
            } else {
                Error::InvalidRequest(format!("failed to read body: {}", inner))
            }
        })?;

    let stored = state.store.set(address, data, content_type, metadata).await?;

    let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
    if let Some(etag) = &stored.etag {
        builder = builder.header(header::ETAG, etag);
    }
    build(builder, Body::empty())
}

/// Whether a body read failed on the size limit rather than the transport
fn exceeds_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// DELETE key → 204, present or not
async fn delete_blob(state: &AppState, address: &BlobAddress) -> Result<Response> {
    state.store.delete(address).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET store → listing
async fn list_blobs(
    state: &AppState,
    address: &BlobAddress,
    query: &HashMap<String, String>,
) -> Result<Response> {
    let options = ListOptions {
        prefix: query.get("prefix").filter(|p| !p.is_empty()).cloned(),
        directories: flag(query, "directories"),
    };
    let listing = state
        .store
        .list(&address.site_id, &address.store_name, &options)
        .await?;
    Ok((StatusCode::OK, Json(listing)).into_response())
}
