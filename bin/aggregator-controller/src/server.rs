//! Health, readiness, metrics and endpoint listing over HTTP

use aggregator_core::{APIServiceRegistrationController, ControllerMetrics, EndpointRegistry};
use anyhow::Result;
use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state handed to every connection
pub struct ServerState {
    pub controller: Arc<APIServiceRegistrationController>,
    pub registry: Arc<EndpointRegistry>,
    pub metrics: ControllerMetrics,
}

/// Accept connections on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, state: Arc<ServerState>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Health and metrics server listening on {}", addr);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };

        let state = state.clone();
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }

    info!("Health and metrics server stopped");
    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    Ok(respond(&method, &path, &state).await)
}

async fn respond(method: &Method, path: &str, state: &ServerState) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
    }

    match path {
        "/healthz" => text(StatusCode::OK, "OK\n"),
        "/readyz" => {
            if state.controller.has_synced() {
                text(StatusCode::OK, "OK\n")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "Caches not synced\n")
            }
        }
        "/metrics" => match state.metrics.gather() {
            Ok(metrics_text) => with_content_type(
                text(StatusCode::OK, metrics_text),
                "text/plain; version=0.0.4",
            ),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        },
        "/endpoints" => {
            let endpoints = state.registry.list_endpoints().await;
            match serde_json::to_vec(&endpoints) {
                Ok(body) => with_content_type(text(StatusCode::OK, body), "application/json"),
                Err(e) => {
                    warn!("Failed to encode endpoints: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode endpoints\n")
                }
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn with_content_type(mut response: Response<Full<Bytes>>, content_type: &'static str) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
