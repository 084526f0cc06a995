//! Barebones RPC plumbing over HTTP and JSON.
//!
//! Clients invoke RPC methods with a POST to a well-known path, optionally
//! carrying a single JSON-encoded parameters value. Responses carry an HTTP
//! status code and an optional JSON body; errors always encode as
//! `{"Error": "<message>"}`. No method other than POST is accepted, request
//! bodies are size-limited, and non-empty bodies must declare
//! `Content-Type: application/json`.

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum size of an RPC request body, in bytes.
pub const MAX_REQUEST_BODY_SIZE: usize = 1024;

/// Wire shape of every RPC error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "Error")]
    pub error: String,
}

/// An RPC failure carrying the HTTP status it maps to.
#[derive(Debug)]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.code, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Typed RPC parameters, decoded from the request body.
///
/// Implements the per-route parameter contract: an empty body yields the
/// type's default, an oversized body is 413, a non-empty body without the
/// JSON content type is 415, and undecodable JSON is 400.
pub struct RpcParams<T>(pub T);

impl<S, T> FromRequest<S> for RpcParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = RpcError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_SIZE + 1)
            .await
            .map_err(|_| body_too_large())?;
        decode_params(&parts.headers, &bytes).map(RpcParams)
    }
}

fn body_too_large() -> RpcError {
    RpcError::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        "RPC body exceeded maximum size",
    )
}

fn decode_params<T: DeserializeOwned + Default>(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, RpcError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    if body.len() > MAX_REQUEST_BODY_SIZE {
        return Err(body_too_large());
    }
    match headers.get(header::CONTENT_TYPE) {
        Some(value) if value.as_bytes() == b"application/json" => {}
        _ => {
            return Err(RpcError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "must have Content-Type: application/json",
            ))
        }
    }
    serde_json::from_slice(body)
        .map_err(|_| RpcError::bad_request("unable to decode RPC body"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest};
    use axum::routing::post;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Debug, Default, Deserialize)]
    struct EchoParams {
        #[serde(rename = "Message", default)]
        #[allow(dead_code)]
        message: String,
    }

    async fn echo(RpcParams(_params): RpcParams<EchoParams>) -> StatusCode {
        StatusCode::NO_CONTENT
    }

    fn test_router() -> Router {
        Router::new().route("/rpc/echo", post(echo))
    }

    struct Case {
        description: &'static str,
        method: Method,
        body: String,
        content_type: Option<&'static str>,
        want_code: StatusCode,
    }

    /// A valid JSON body padded to exactly `len` bytes.
    fn json_body_of_len(len: usize) -> String {
        let envelope = r#"{"Message":""}"#.len();
        format!(r#"{{"Message":"{}"}}"#, "x".repeat(len - envelope))
    }

    #[tokio::test]
    async fn test_rpc_request_handling() {
        let cases = [
            Case {
                description: "empty body",
                method: Method::POST,
                body: String::new(),
                content_type: None,
                want_code: StatusCode::NO_CONTENT,
            },
            Case {
                description: "valid JSON body",
                method: Method::POST,
                body: r#"{"Message":"hello"}"#.to_string(),
                content_type: Some("application/json"),
                want_code: StatusCode::NO_CONTENT,
            },
            Case {
                description: "body with maximum length",
                method: Method::POST,
                body: json_body_of_len(MAX_REQUEST_BODY_SIZE),
                content_type: Some("application/json"),
                want_code: StatusCode::NO_CONTENT,
            },
            Case {
                description: "body too long by 1 byte",
                method: Method::POST,
                body: json_body_of_len(MAX_REQUEST_BODY_SIZE + 1),
                content_type: Some("application/json"),
                want_code: StatusCode::PAYLOAD_TOO_LARGE,
            },
            Case {
                description: "missing Content-Type header",
                method: Method::POST,
                body: r#"{"Message":"hello"}"#.to_string(),
                content_type: None,
                want_code: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            },
            Case {
                description: "wrong Content-Type header",
                method: Method::POST,
                body: r#"{"Message":"hello"}"#.to_string(),
                content_type: Some("text/plain"),
                want_code: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            },
            Case {
                description: "invalid JSON body",
                method: Method::POST,
                body: "{{{]]]".to_string(),
                content_type: Some("application/json"),
                want_code: StatusCode::BAD_REQUEST,
            },
            Case {
                description: "invalid HTTP method",
                method: Method::GET,
                body: String::new(),
                content_type: None,
                want_code: StatusCode::METHOD_NOT_ALLOWED,
            },
        ];

        for case in cases {
            let mut request = HttpRequest::builder()
                .method(case.method.clone())
                .uri("/rpc/echo");
            if let Some(content_type) = case.content_type {
                request = request.header(header::CONTENT_TYPE, content_type);
            }
            let request = request.body(Body::from(case.body)).unwrap();

            let response = test_router().oneshot(request).await.unwrap();
            assert_eq!(
                response.status(),
                case.want_code,
                "wrong status for case: {}",
                case.description
            );

            if case.want_code == StatusCode::METHOD_NOT_ALLOWED {
                assert_eq!(
                    response.headers().get(header::ALLOW).map(|v| v.as_bytes()),
                    Some(&b"POST"[..]),
                    "405 must advertise Allow: POST"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let request = HttpRequest::builder()
            .method(Method::POST)
            .uri("/rpc/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("not json"))
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "unable to decode RPC body");
    }
}
