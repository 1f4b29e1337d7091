// Proxy module - dispatches client requests to the inference backend
//
// This module implements the request path using Axum. A request is gated on
// the scale controller (the backend may be scaled to zero), optionally
// translated from the Anthropic Messages shape to the backend's OpenAI shape,
// forwarded, and streamed back through the per-response rewriter.

pub mod error;
pub mod rewriter;
pub mod server;
pub mod sse;

use crate::scale::ScaleController;
use crate::translation::request::translate_request;
use crate::translation::response::translate_response;
use crate::translation::ClientFlavor;
use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, Response, StatusCode},
};
use bytes::Bytes;
use error::ProxyError;
use futures::StreamExt;
use rewriter::StreamRewriter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding requests
    pub client: reqwest::Client,
    /// Scale controller gating every request on backend health
    pub controller: Arc<ScaleController>,
    /// Base URL of the backend service (no trailing slash)
    pub backend_url: String,
    /// Name the backend serves its model under, if it differs from model_id
    pub served_model: Option<String>,
    /// Abort a streaming response when upstream goes quiet this long
    pub upstream_read_idle: Option<std::time::Duration>,
}

/// The per-request attributes needed to route and trace a request.
#[derive(Debug, Clone)]
pub struct RequestFingerprint {
    pub request_id: String,
    pub flavor: ClientFlavor,
    /// Model id as the client sent it.
    pub model: String,
    pub streaming: bool,
}

/// Correlation id for one request: timestamp plus 4 random hex chars.
fn generate_request_id() -> String {
    use rand::Rng;
    let timestamp = chrono::Utc::now().format("%H%M%S");
    format!("req_{}_{:04x}", timestamp, rand::thread_rng().gen::<u16>())
}

/// Main proxy handler - gates, translates and forwards one request
pub(crate) async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let path = uri.path().to_string();

    if method != Method::POST {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::from("method not allowed"))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()));
    }

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

    let flavor = ClientFlavor::from_path(&path);

    // Rewrite the body for the backend and pull out the fingerprint.
    let (upstream_body, fingerprint) = match flavor {
        ClientFlavor::Anthropic => {
            let translated = translate_request(&body_bytes, state.served_model.as_deref())
                .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
            let fingerprint = RequestFingerprint {
                request_id: generate_request_id(),
                flavor,
                model: translated.model.clone(),
                streaming: translated.streaming,
            };
            (translated.body, fingerprint)
        }
        ClientFlavor::OpenAi => {
            let value: serde_json::Value = serde_json::from_slice(&body_bytes)
                .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
            let fingerprint = RequestFingerprint {
                request_id: generate_request_id(),
                flavor,
                model: value
                    .get("model")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                streaming: value
                    .get("stream")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            };
            (body_bytes.to_vec(), fingerprint)
        }
    };

    tracing::info!(
        request_id = %fingerprint.request_id,
        flavor = %fingerprint.flavor,
        model = %fingerprint.model,
        streaming = fingerprint.streaming,
        "proxying request"
    );

    // Cold-start gate: blocks until the backend is healthy. No activity
    // update on failure.
    state.controller.clone().ensure_warm().await?;

    // Anthropic requests always land on the chat completions endpoint; OpenAI
    // requests keep their path.
    let forward_path = match flavor {
        ClientFlavor::Anthropic => "/v1/chat/completions",
        ClientFlavor::OpenAi => path.as_str(),
    };
    let forward_url = format!("{}{}", state.backend_url.trim_end_matches('/'), forward_path);

    let mut forward_req = state
        .client
        .post(&forward_url)
        .header("content-type", "application/json")
        .body(upstream_body);

    // Bearer token passthrough; an Anthropic-style x-api-key becomes a bearer
    // token when no Authorization header is present.
    if let Some(auth) = headers.get("authorization") {
        forward_req = forward_req.header("authorization", auth.as_bytes().to_vec());
    } else if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        forward_req = forward_req.bearer_auth(key);
    }

    let upstream = forward_req
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

    let status = upstream.status();
    if !status.is_success() {
        let body = upstream.bytes().await.unwrap_or_default();
        tracing::warn!(
            request_id = %fingerprint.request_id,
            status = status.as_u16(),
            "backend returned an error, passing through"
        );
        return Response::builder()
            .status(status.as_u16())
            .header("content-type", "application/json")
            .body(Body::from(body))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()));
    }

    if sse::is_sse_response(upstream.headers()) {
        handle_streaming_response(state, fingerprint, upstream).await
    } else {
        handle_buffered_response(state, fingerprint, upstream).await
    }
}

/// Forward a non-streaming (JSON) response, translating if needed.
async fn handle_buffered_response(
    state: ProxyState,
    fingerprint: RequestFingerprint,
    upstream: reqwest::Response,
) -> Result<Response<Body>, ProxyError> {
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ProxyError::UpstreamMidStream(e.to_string()))?;

    state.controller.update_activity();

    let body = match fingerprint.flavor {
        ClientFlavor::OpenAi => bytes.to_vec(),
        ClientFlavor::Anthropic => match translate_response(&bytes, &fingerprint.model) {
            Ok(translated) => translated,
            Err(err) => {
                tracing::warn!(
                    request_id = %fingerprint.request_id,
                    error = %err,
                    "response translation failed, forwarding original bytes"
                );
                bytes.to_vec()
            }
        },
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

/// Forward a streaming (SSE) response through the rewriter.
///
/// A pump task reads upstream and writes rewritten frames to an mpsc channel
/// backing the response body. Client disconnect closes the channel, which
/// stops the pump and with it the upstream read.
async fn handle_streaming_response(
    state: ProxyState,
    fingerprint: RequestFingerprint,
    upstream: reqwest::Response,
) -> Result<Response<Body>, ProxyError> {
    let mut rewriter = StreamRewriter::new(fingerprint.flavor, &fingerprint.model);
    let read_idle = state.upstream_read_idle;
    let mut upstream_stream = upstream.bytes_stream();

    // Read the first chunk before committing to a response so an immediate
    // upstream failure still surfaces as 502.
    let first_chunk = match read_upstream(&mut upstream_stream, read_idle).await {
        UpstreamRead::Chunk(bytes) => Some(bytes),
        UpstreamRead::Failed(err) => return Err(ProxyError::UpstreamMidStream(err)),
        UpstreamRead::Ended => None,
    };

    state.controller.update_activity();

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let request_id = fingerprint.request_id.clone();

    tokio::spawn(async move {
        if let Some(bytes) = first_chunk {
            let out = rewriter.push(&bytes);
            if !out.is_empty() && tx.send(Ok(Bytes::from(out))).await.is_err() {
                tracing::debug!(request_id = %request_id, "client disconnected");
                return;
            }
        }

        loop {
            match read_upstream(&mut upstream_stream, read_idle).await {
                UpstreamRead::Chunk(bytes) => {
                    let out = rewriter.push(&bytes);
                    if !out.is_empty() && tx.send(Ok(Bytes::from(out))).await.is_err() {
                        // Client gone: stop consuming upstream, emit nothing
                        // further.
                        tracing::debug!(request_id = %request_id, "client disconnected");
                        return;
                    }
                }
                UpstreamRead::Failed(err) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %err,
                        "upstream connection lost mid-stream"
                    );
                    let tail = rewriter.finish();
                    if !tail.is_empty() {
                        let _ = tx.send(Ok(Bytes::from(tail))).await;
                    }
                    return;
                }
                UpstreamRead::Ended => {
                    let tail = rewriter.finish();
                    if !tail.is_empty() {
                        let _ = tx.send(Ok(Bytes::from(tail))).await;
                    }
                    if rewriter.bytes_filtered() > 0 {
                        tracing::debug!(
                            request_id = %request_id,
                            bytes_filtered = rewriter.bytes_filtered(),
                            "stream complete"
                        );
                    }
                    return;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
}

enum UpstreamRead {
    Chunk(Bytes),
    Failed(String),
    Ended,
}

/// One upstream read, bounded by the configured read-idle window.
async fn read_upstream<S>(stream: &mut S, read_idle: Option<std::time::Duration>) -> UpstreamRead
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let item = match read_idle {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(item) => item,
            Err(_) => {
                return UpstreamRead::Failed(format!(
                    "no upstream bytes for {}s",
                    limit.as_secs()
                ))
            }
        },
        None => stream.next().await,
    };
    match item {
        Some(Ok(bytes)) => UpstreamRead::Chunk(bytes),
        Some(Err(err)) => UpstreamRead::Failed(err.to_string()),
        None => UpstreamRead::Ended,
    }
}
