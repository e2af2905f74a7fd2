//! Route matching and request rewriting for proxied requests

use hyper::header::{HeaderMap, HeaderValue, HOST, UPGRADE};
use hyper::Method;

/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Sub-paths that return an app's captured output instead of proxying
pub const LOG_SUFFIXES: [&str; 4] = ["/_logz", "/_logz/", "/_logs", "/_logs/"];

/// Prefix of per-app proxy routes
pub const RELAY_PREFIX: &str = "/relay/";
/// Prefix of the management UI routes
pub const MANAGEMENT_PREFIX: &str = "/management";

/// A matched gateway route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /`
    Root,
    /// `GET /apps`
    Apps,
    /// `/:app/start`
    Start(String),
    /// `/:app/kill`
    Kill(String),
    /// `/management` and below; carries the sub-path
    Management(String),
    /// `/relay/:app` and below; carries the app name and sub-path
    Relay { app: String, sub_path: String },
    NotFound,
}

impl Route {
    /// Match a request method and path against the gateway's routes
    pub fn parse(method: &Method, path: &str) -> Route {
        if path == "/" {
            return if method == Method::GET {
                Route::Root
            } else {
                Route::NotFound
            };
        }

        if let Some(rest) = path.strip_prefix(MANAGEMENT_PREFIX) {
            if rest.is_empty() {
                return Route::Management("/".to_string());
            }
            if rest.starts_with('/') {
                return Route::Management(rest.to_string());
            }
        }

        if let Some(rest) = path.strip_prefix(RELAY_PREFIX) {
            let (app, sub_path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            if app.is_empty() {
                return Route::NotFound;
            }
            return Route::Relay {
                app: app.to_string(),
                sub_path: sub_path.to_string(),
            };
        }

        if path == "/apps" {
            return if method == Method::GET {
                Route::Apps
            } else {
                Route::NotFound
            };
        }

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            [app, "start"] if !app.is_empty() => Route::Start(app.to_string()),
            [app, "kill"] if !app.is_empty() => Route::Kill(app.to_string()),
            _ => Route::NotFound,
        }
    }
}

/// Whether a GET to `sub_path` should be answered with the app's logs
pub fn is_log_path(sub_path: &str) -> bool {
    LOG_SUFFIXES.contains(&sub_path)
}

/// Whether the request asks for a WebSocket upgrade
pub fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Value for `X-Forwarded-Proto`
pub fn forwarded_proto(is_tls: bool) -> &'static str {
    if is_tls {
        "https"
    } else {
        "http"
    }
}

/// Scheme used to reach the backend
pub fn forward_scheme(is_tls: bool, is_ws: bool) -> &'static str {
    match (is_tls, is_ws) {
        (false, false) => "http",
        (true, false) => "https",
        (false, true) => "ws",
        (true, true) => "wss",
    }
}

/// Backend path for a relayed request, with the query string preserved
pub fn rewrite_path(app: &str, sub_path: &str, pass_full_path: bool, query: Option<&str>) -> String {
    let mut path = if pass_full_path {
        format!("{}{}{}", RELAY_PREFIX, app, sub_path)
    } else {
        sub_path.to_string()
    };
    if let Some(q) = query {
        path.push('?');
        path.push_str(q);
    }
    path
}

/// Rewrite proxy headers in place.
///
/// Every inbound header is kept except `X-Forwarded-Host` (the caller's value
/// or `default_forwarded_host`), `X-Forwarded-Proto` and `Host`.
pub fn rewrite_headers(
    headers: &mut HeaderMap,
    is_tls: bool,
    default_forwarded_host: &str,
    backend_port: u16,
) {
    let has_forwarded_host = headers
        .get(X_FORWARDED_HOST)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    if !has_forwarded_host {
        if let Ok(value) = HeaderValue::from_str(default_forwarded_host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(forwarded_proto(is_tls)),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("localhost:{}", backend_port)) {
        headers.insert(HOST, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_routes() {
        assert_eq!(Route::parse(&Method::GET, "/"), Route::Root);
        assert_eq!(Route::parse(&Method::POST, "/"), Route::NotFound);
        assert_eq!(Route::parse(&Method::GET, "/apps"), Route::Apps);
        assert_eq!(Route::parse(&Method::DELETE, "/apps"), Route::NotFound);
        assert_eq!(
            Route::parse(&Method::POST, "/foo/start"),
            Route::Start("foo".to_string())
        );
        assert_eq!(
            Route::parse(&Method::GET, "/foo/kill"),
            Route::Kill("foo".to_string())
        );
        assert_eq!(Route::parse(&Method::GET, "/foo/bar"), Route::NotFound);
        assert_eq!(Route::parse(&Method::GET, "/foo"), Route::NotFound);
    }

    #[test]
    fn test_parse_management() {
        assert_eq!(
            Route::parse(&Method::GET, "/management"),
            Route::Management("/".to_string())
        );
        assert_eq!(
            Route::parse(&Method::GET, "/management/"),
            Route::Management("/".to_string())
        );
        assert_eq!(
            Route::parse(&Method::POST, "/management/static/app.js"),
            Route::Management("/static/app.js".to_string())
        );
        assert_eq!(Route::parse(&Method::GET, "/managementx"), Route::NotFound);
    }

    #[test]
    fn test_parse_relay() {
        assert_eq!(
            Route::parse(&Method::GET, "/relay/foo/bar/baz"),
            Route::Relay {
                app: "foo".to_string(),
                sub_path: "/bar/baz".to_string()
            }
        );
        assert_eq!(
            Route::parse(&Method::GET, "/relay/foo"),
            Route::Relay {
                app: "foo".to_string(),
                sub_path: "/".to_string()
            }
        );
        assert_eq!(
            Route::parse(&Method::GET, "/relay/foo/"),
            Route::Relay {
                app: "foo".to_string(),
                sub_path: "/".to_string()
            }
        );
        // Relay wins over the lifecycle routes
        assert_eq!(
            Route::parse(&Method::GET, "/relay/start"),
            Route::Relay {
                app: "start".to_string(),
                sub_path: "/".to_string()
            }
        );
        assert_eq!(Route::parse(&Method::GET, "/relay/"), Route::NotFound);
    }

    #[test]
    fn test_log_paths() {
        for suffix in ["/_logz", "/_logz/", "/_logs", "/_logs/"] {
            assert!(is_log_path(suffix), "{}", suffix);
        }
        assert!(!is_log_path("/_logzz"));
        assert!(!is_log_path("/"));
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("foo", "/bar", false, None), "/bar");
        assert_eq!(rewrite_path("foo", "/bar", true, None), "/relay/foo/bar");
        assert_eq!(
            rewrite_path("foo", "/bar", false, Some("a=1&b=2")),
            "/bar?a=1&b=2"
        );
        assert_eq!(
            rewrite_path("foo", "/", true, Some("x")),
            "/relay/foo/?x"
        );
    }

    #[test]
    fn test_scheme_selection() {
        assert_eq!(forward_scheme(false, false), "http");
        assert_eq!(forward_scheme(false, true), "ws");
        assert_eq!(forward_scheme(true, false), "https");
        assert_eq!(forward_scheme(true, true), "wss");
        assert_eq!(forwarded_proto(false), "http");
        assert_eq!(forwarded_proto(true), "https");
    }

    #[test]
    fn test_is_websocket() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket(&headers));
        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket(&headers));
        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket(&headers));
    }

    #[test]
    fn test_rewrite_headers_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("gateway.example.com"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        rewrite_headers(&mut headers, false, "localhost:8000", 8001);

        assert_eq!(headers.get(HOST).unwrap(), "localhost:8001");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "localhost:8000");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_rewrite_headers_keeps_forwarded_host() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_static("apps.example.com"));
        headers.insert(
            "x-forwarded-preferred-username",
            HeaderValue::from_static("alice"),
        );

        rewrite_headers(&mut headers, true, "localhost:8000", 8002);

        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "apps.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(
            headers.get("x-forwarded-preferred-username").unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_websocket_request_still_forwards_http_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert_eq!(forward_scheme(false, is_websocket(&headers)), "ws");

        rewrite_headers(&mut headers, false, "localhost:8000", 8001);
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }
}
