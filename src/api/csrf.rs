//! Browser same-origin protection for state-changing endpoints.
//!
//! Applied to every RPC route and to both WebSocket upgrade paths (the
//! upgrade GET is treated as unsafe, as if it were a POST). The check trusts
//! `Sec-Fetch-Site` when the browser sends it, and otherwise falls back to
//! comparing the `Origin` host against the `Host` header. Requests without
//! an `Origin` header (non-browser clients) are allowed.

use super::rpc::RpcError;
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Decide whether a request passes the same-origin check.
pub fn same_origin(headers: &HeaderMap) -> bool {
    match header_str(headers, "sec-fetch-site") {
        Some("same-origin") | Some("none") => return true,
        Some(_) => return false,
        None => {}
    }

    let Some(origin) = header_str(headers, header::ORIGIN.as_str()) else {
        return true;
    };
    let Some(host) = header_str(headers, header::HOST.as_str()) else {
        return false;
    };
    origin_host(origin) == Some(host)
}

/// Middleware enforcing [`same_origin`] on a route tree.
pub async fn require_same_origin(request: Request, next: Next) -> Response {
    if same_origin(request.headers()) {
        next.run(request).await
    } else {
        denied().into_response()
    }
}

/// The rejection used for cross-origin requests.
pub fn denied() -> RpcError {
    RpcError::new(StatusCode::FORBIDDEN, "cross-origin request denied")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Extract the `host[:port]` part of an Origin header value. Opaque origins
/// ("null") and non-HTTP schemes yield `None`.
fn origin_host(origin: &str) -> Option<&str> {
    origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .filter(|host| !host.is_empty() && !host.contains('/'))
}
