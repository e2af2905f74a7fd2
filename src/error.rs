//! Error handling and JSON responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for router errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    /// No app with the requested name
    AppNotFound,
    /// App exists but is not running
    AppNotReady,
    /// App has no port mapping
    PortNotFound,
    /// start/kill refused by the lifecycle
    LifecycleRejected,
    /// Backend refused the connection (not listening yet)
    BackendNotListening,
    /// Failed to talk to the backend
    ConnectionFailed,
    /// No route matched
    RouteNotFound,
    /// Internal router error
    InternalError,
}

impl RelayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayErrorCode::AppNotFound => StatusCode::NOT_FOUND,
            RelayErrorCode::AppNotReady => StatusCode::BAD_REQUEST,
            RelayErrorCode::PortNotFound => StatusCode::INTERNAL_SERVER_ERROR,
            RelayErrorCode::LifecycleRejected => StatusCode::INTERNAL_SERVER_ERROR,
            RelayErrorCode::BackendNotListening => StatusCode::SERVICE_UNAVAILABLE,
            RelayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            RelayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            RelayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RelayErrorCode::AppNotFound => "APP_NOT_FOUND",
            RelayErrorCode::AppNotReady => "APP_NOT_READY",
            RelayErrorCode::PortNotFound => "PORT_NOT_FOUND",
            RelayErrorCode::LifecycleRejected => "LIFECYCLE_REJECTED",
            RelayErrorCode::BackendNotListening => "BACKEND_NOT_LISTENING",
            RelayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            RelayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            RelayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Seconds a client should wait before retrying, if the condition is transient
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            RelayErrorCode::BackendNotListening => Some(1),
            _ => None,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: RelayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

fn full_body(bytes: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: RelayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value());
    if let Some(secs) = code.retry_after() {
        builder = builder.header("Retry-After", secs.to_string());
    }

    builder
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// 200 response with a `{"message": ...}` body
pub fn json_message_response(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(&MessageBody { message })
        .unwrap_or_else(|_| r#"{"message":""}"#.to_string());
    json_response(StatusCode::OK, body)
}

/// Response with a pre-serialized JSON body
pub fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// 200 `text/plain` response
pub fn text_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// 301 redirect to `location`
pub fn redirect_response(location: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from_static(b"Moved Permanently")))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            RelayErrorCode::AppNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayErrorCode::AppNotReady.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayErrorCode::PortNotFound.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayErrorCode::BackendNotListening.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(RelayErrorCode::AppNotFound, "App not found: foo");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"APP_NOT_FOUND\""));
        assert!(json.contains("\"message\":\"App not found: foo\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(RelayErrorCode::AppNotReady, "App is not running");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "APP_NOT_READY"
        );
        assert!(response.headers().get("Retry-After").is_none());
    }

    #[test]
    fn test_not_listening_is_retryable() {
        let response = json_error_response(RelayErrorCode::BackendNotListening, "not yet");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_message_response_body() {
        let response = json_message_response("App 'a' started");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["message"], "App 'a' started");
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect_response("/management/");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("Location").unwrap(), "/management/");
    }
}
