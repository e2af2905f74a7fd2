use crate::error::{
    json_error_response, json_message_response, json_response, redirect_response, text_response,
    RelayErrorCode,
};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::Registry;
use crate::rewrite::{forward_scheme, is_log_path, is_websocket, rewrite_headers, rewrite_path, Route};
use crate::scheduler::RunScheduler;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Where `GET /` sends the caller
const MANAGEMENT_LOCATION: &str = "/management/";

/// Largest upgrade response head accepted from a backend
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

type RelayResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Shared state handed to every connection
pub struct RelayState {
    registry: Arc<Registry>,
    scheduler: Arc<RunScheduler>,
    pool: ConnectionPool,
    default_forwarded_host: String,
}

impl RelayState {
    pub fn new(registry: Arc<Registry>, scheduler: Arc<RunScheduler>, pool_config: PoolConfig) -> Self {
        let default_forwarded_host = registry.config().server.default_forwarded_host.clone();
        Self {
            registry,
            scheduler,
            pool: ConnectionPool::new(pool_config),
            default_forwarded_host,
        }
    }
}

/// The gateway's HTTP server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        scheduler: Arc<RunScheduler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, registry, scheduler, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        scheduler: Arc<RunScheduler>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(RelayState::new(registry, scheduler, pool_config)),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Relay server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<RelayState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<RelayState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<RelayResponse, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let route = Route::parse(req.method(), req.uri().path());
    debug!(
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
        request_id,
        "Incoming request"
    );

    let response = match route {
        Route::Root => redirect_response(MANAGEMENT_LOCATION),
        Route::Apps => apps_snapshot(&state),
        Route::Start(app) => start_app(&state, &app),
        Route::Kill(app) => kill_app(&state, &app),
        Route::Management(sub_path) => {
            handle_management(req, &state, &sub_path, is_tls, &request_id).await
        }
        Route::Relay { app, sub_path } => {
            handle_relay(req, &state, &app, &sub_path, is_tls, &request_id).await
        }
        Route::NotFound => json_error_response(RelayErrorCode::RouteNotFound, "Route not found"),
    };

    Ok(response)
}

fn apps_snapshot(state: &RelayState) -> RelayResponse {
    match serde_json::to_string(&state.registry.snapshot()) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize app snapshot");
            json_error_response(RelayErrorCode::InternalError, "Failed to serialize apps")
        }
    }
}

fn start_app(state: &RelayState, name: &str) -> RelayResponse {
    let Some(record) = state.registry.get_app(name) else {
        return json_error_response(RelayErrorCode::AppNotFound, format!("App '{}' not found", name));
    };

    match state.scheduler.run_app(&record) {
        Ok(()) => json_message_response("App Started"),
        Err(e) => {
            warn!(app = name, error = %e, "Failed to start app");
            json_error_response(RelayErrorCode::LifecycleRejected, e.to_string())
        }
    }
}

fn kill_app(state: &RelayState, name: &str) -> RelayResponse {
    let Some(record) = state.registry.get_app(name) else {
        return json_error_response(RelayErrorCode::AppNotFound, format!("App '{}' not found", name));
    };

    match state.scheduler.stop_app(&record) {
        Ok(()) => json_message_response("App killed"),
        Err(e) => {
            warn!(app = name, error = %e, "Failed to stop app");
            json_error_response(RelayErrorCode::LifecycleRejected, e.to_string())
        }
    }
}

async fn handle_management(
    req: Request<Incoming>,
    state: &RelayState,
    sub_path: &str,
    is_tls: bool,
    request_id: &str,
) -> RelayResponse {
    let management = state.registry.management();

    if req.method() == Method::GET && is_log_path(sub_path) {
        return text_response(management.logs());
    }

    let path = rewrite_path(management.id(), sub_path, false, req.uri().query());
    forward(req, state, management.id(), management.port(), &path, is_tls, request_id).await
}

async fn handle_relay(
    req: Request<Incoming>,
    state: &RelayState,
    name: &str,
    sub_path: &str,
    is_tls: bool,
    request_id: &str,
) -> RelayResponse {
    let Some(record) = state.registry.get_app(name) else {
        return json_error_response(RelayErrorCode::AppNotFound, "App not found or not running");
    };

    if req.method() == Method::GET && is_log_path(sub_path) {
        return text_response(record.logs());
    }

    if !record.is_running() {
        return json_error_response(
            RelayErrorCode::AppNotReady,
            "App is not ready yet. Please try again later. Make sure you started the app",
        );
    }

    let Some(port) = state.registry.get_app_port(name) else {
        return json_error_response(RelayErrorCode::PortNotFound, "App port not found");
    };

    let pass_full_path = state
        .registry
        .get_app_config(name)
        .map(|c| c.pass_full_proxy_path)
        .unwrap_or(true);
    let path = rewrite_path(name, sub_path, pass_full_path, req.uri().query());

    forward(req, state, name, port, &path, is_tls, request_id).await
}

/// Rewrite headers and send the request to the backend on `port`
async fn forward(
    mut req: Request<Incoming>,
    state: &RelayState,
    app: &str,
    port: u16,
    path: &str,
    is_tls: bool,
    request_id: &str,
) -> RelayResponse {
    let scheme = forward_scheme(is_tls, is_websocket(req.headers()));
    rewrite_headers(req.headers_mut(), is_tls, &state.default_forwarded_host, port);

    debug!(app, port, path, scheme, request_id, "Forwarding request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, app, port, path, request_id).await;
    }

    match state.pool.send_request(req, port, path).await {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            warn!(app, port, request_id, error = %e, "Backend not listening");
            json_error_response(
                RelayErrorCode::BackendNotListening,
                "App is not accepting connections yet, please retry",
            )
        }
        Err(e) => {
            error!(app, port, request_id, error = %e, "Failed to forward request via pool");
            json_error_response(RelayErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
    }
}

/// Check if a request is an HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, early: Vec<u8>, app: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(app, request_id, error = %e, "Failed to flush early backend bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                app,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(app, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP/1.1 upgrade request sent to the backend.
///
/// Headers are expected to be rewritten already, including `Host`.
fn build_upgrade_request<B>(req: &Request<B>, path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the `\r\n\r\n` ending a response head
fn head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the backend's response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read from the backend until a full response head has arrived.
///
/// Returns the head and any bytes received after it.
async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Ok(None);
        }
    }
}

/// Tunnel an upgrade request (WebSocket and friends) to the backend
async fn handle_upgrade(
    req: Request<Incoming>,
    app: &str,
    port: u16,
    path: &str,
    request_id: &str,
) -> RelayResponse {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(app, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, path);

    let backend_addr = format!("127.0.0.1:{}", port);
    let mut backend_stream = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            warn!(app, port, error = %e, "Backend not listening for upgrade");
            return json_error_response(
                RelayErrorCode::BackendNotListening,
                "App is not accepting connections yet, please retry",
            );
        }
        Err(e) => {
            error!(app, port, error = %e, "Failed to connect to backend for upgrade");
            return json_error_response(
                RelayErrorCode::ConnectionFailed,
                format!("Failed to connect to backend: {}", e),
            );
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(app, error = %e, "Failed to send upgrade request to backend");
        return json_error_response(
            RelayErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        );
    }

    let (head, early) = match read_upgrade_head(&mut backend_stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            error!(app, "Backend closed connection before completing upgrade response");
            return json_error_response(
                RelayErrorCode::ConnectionFailed,
                "Backend closed connection",
            );
        }
        Err(e) => {
            error!(app, error = %e, "Failed to read upgrade response from backend");
            return json_error_response(
                RelayErrorCode::ConnectionFailed,
                format!("Failed to read backend response: {}", e),
            );
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(app, "Failed to parse backend upgrade response");
        return json_error_response(
            RelayErrorCode::ConnectionFailed,
            "Invalid upgrade response from backend",
        );
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    info!(app, request_id, upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let app = app.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(app, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, early, &app, &request_id).await;
            }
            Err(e) => {
                error!(app, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .uri("/ws")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));

        let req = Request::builder()
            .uri("/ws")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request() {
        let req = Request::builder()
            .method("GET")
            .uri("/relay/foo/ws?x=1")
            .header("Host", "localhost:8001")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();

        let raw = String::from_utf8(build_upgrade_request(&req, "/ws?x=1")).unwrap();
        assert!(raw.starts_with("GET /ws?x=1 HTTP/1.1\r\n"));
        assert!(raw.contains("host: localhost:8001\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
        assert_eq!(raw.matches("host:").count(), 1);
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_head_end_splits_early_bytes() {
        let data = b"HTTP/1.1 101 OK\r\nA: b\r\n\r\nframe";
        let end = head_end(data).unwrap();
        assert_eq!(&data[end..], b"frame");
        assert!(head_end(b"HTTP/1.1 101 OK\r\n").is_none());
    }
}
