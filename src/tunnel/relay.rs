//! Tunnel relay — accepts agent tunnels and proxies public HTTP traffic.
//!
//! The relay:
//! 1. Accepts agent TCP connections on the control port, assigns each a
//!    subdomain and writes `<label>\n` before the socket becomes a tunnel
//! 2. Serves public HTTP, routing on the Host header to the matching tunnel
//! 3. Answers the exact base domain itself (status page, health, listing)
//!
//! The Host header is client-supplied and trusted as-is for routing and for
//! the authority forwarded to the agent.

use std::future::Future;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        uri::PathAndQuery,
        Request, StatusCode, Uri, Version,
    },
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, warn, Instrument};

use super::registry::Registry;
use super::router;
use super::transport::TunnelBody;
use crate::routes;
use crate::state::RelayState;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// ─── Control Port ────────────────────────────────────────────────────────────

/// Accept agent connections forever, registering each in its own task.
pub async fn serve_control(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept tunnel client: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(
            async move {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {e}");
                }
                if let Err(e) = registry.register(stream, peer).await {
                    warn!("Tunnel registration failed: {e}");
                }
            }
            .instrument(info_span!("tunnel_register", peer = %peer)),
        );
    }
}

// ─── Public HTTP ─────────────────────────────────────────────────────────────

/// Build the public HTTP app: base-domain routes plus the tunnel proxy.
pub fn relay_router(state: RelayState) -> Router {
    let base_domain = routes::base_domain_router(state.clone());

    Router::new()
        .fallback(
            move |State(state): State<RelayState>, request: Request<Body>| {
                let base_domain = base_domain.clone();
                async move { handle_public(state, base_domain, request).await }
            },
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve public HTTP on `listener` until `shutdown` resolves.
pub async fn serve_http(
    listener: TcpListener,
    state: RelayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, relay_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_public(state: RelayState, base_domain: Router, request: Request<Body>) -> Response {
    let Some(raw_host) = request_host(&request) else {
        return (StatusCode::BAD_REQUEST, "Bad Request: missing Host header").into_response();
    };
    let host = router::normalize_host(&raw_host);

    if router::is_base_domain(&host, state.registry.domain()) {
        return base_domain
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {});
    }

    let Some((hostname, conn)) = router::route(&state.registry, &host).await else {
        debug!(host = %host, "No tunnel for host");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let outbound = match tunnel_request(request, &raw_host) {
        Ok(req) => req,
        Err(e) => {
            debug!(host = %host, "Rejecting request: {e}");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    match conn.send(outbound).await {
        Ok(response) => tunnel_response(response),
        Err(e) => {
            state.registry.evict_conn(&hostname, &conn).await;
            warn!(hostname = %hostname, "Failed connection to tunnel: {e}");
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

/// Host from the `Host` header, or from an absolute-form request target.
fn request_host(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(ToString::to_string)
        .or_else(|| request.uri().authority().map(ToString::to_string))
}

/// Rewrite a public request for the tunnel.
///
/// Scheme is forced to `http` and the authority to the original Host header
/// value; the agent maps it onward to its local target. Path, query and body
/// pass through untouched.
pub fn tunnel_request(request: Request<Body>, raw_host: &str) -> Result<Request<Body>, axum::http::Error> {
    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", PathAndQuery::as_str)
        .to_string();

    parts.uri = Uri::builder()
        .scheme("http")
        .authority(raw_host)
        .path_and_query(path_and_query)
        .build()?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    parts
        .headers
        .insert(header::HOST, HeaderValue::from_str(raw_host)?);

    Ok(Request::from_parts(parts, body))
}

fn tunnel_response(response: Response<TunnelBody>) -> Response {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
