use crate::config::{AppStore, ServerConfig};
use crate::config_api::{handle_config_request, CONFIG_API_PATH};
use crate::control::{ProcessController, ShellController};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::manager::{ProcessManager, SwitchError};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::readiness::{HttpProbe, ReadinessProbe};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE,
    ETAG, HOST, IF_NONE_MATCH, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::http::response::Parts;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const CACHE_CONTROL_VALUE: &str = "max-age=0, must-revalidate";

/// Largest backend response head accepted on the upgrade path
const MAX_RESPONSE_HEAD_BYTES: usize = 16 * 1024;

/// Per-request behaviour of the gateway
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Query parameter that names the app
    pub selector_param: String,
    /// Upper bound on waiting for a backend response
    pub request_timeout: Duration,
    /// Responses up to this size are buffered and tagged with an ETag
    pub max_buffered_body_bytes: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewayOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            selector_param: config.selector_param.clone(),
            request_timeout: config.request_timeout(),
            max_buffered_body_bytes: config.max_buffered_body_bytes,
        }
    }
}

/// Everything a request handler needs, shared across connections
struct GatewayContext<C: ProcessController, P> {
    manager: Arc<ProcessManager<C, P>>,
    apps: AppStore,
    pool: Arc<ConnectionPool>,
    options: GatewayOptions,
}

/// Failures while forwarding a plain HTTP request
#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("backend request failed: {0}")]
    Unreachable(#[from] PoolError),
    #[error("failed to read backend response body: {0}")]
    BodyRead(String),
    #[error("backend response exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    fn error_code(&self) -> GatewayErrorCode {
        match self {
            ForwardError::Unreachable(_) | ForwardError::BodyRead(_) => {
                GatewayErrorCode::BackendUnreachable
            }
            ForwardError::TooLarge { .. } => GatewayErrorCode::ResponseTooLarge,
            ForwardError::Timeout(_) => GatewayErrorCode::RequestTimeout,
        }
    }
}

/// The gateway listener: resolves the app, activates it, and proxies to it
pub struct ProxyServer<C: ProcessController = ShellController, P = HttpProbe> {
    bind_addr: SocketAddr,
    manager: Arc<ProcessManager<C, P>>,
    apps: AppStore,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    options: GatewayOptions,
}

impl<C, P> ProxyServer<C, P>
where
    C: ProcessController,
    P: ReadinessProbe,
{
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<ProcessManager<C, P>>,
        apps: AppStore,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, manager, apps, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        manager: Arc<ProcessManager<C, P>>,
        apps: AppStore,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            manager,
            apps,
            shutdown_rx,
            pool,
            options: GatewayOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            selector = %self.options.selector_param,
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let pool_stats = self.pool.stats();
        let context = Arc::new(GatewayContext {
            manager: self.manager,
            apps: self.apps,
            pool: self.pool,
            options: self.options,
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
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
                        info!(
                            forwarded_requests = pool_stats.get_total_requests(),
                            failed_requests = pool_stats.get_failed_requests(),
                            "Gateway shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S, C, P>(
    stream: S,
    addr: SocketAddr,
    context: Arc<GatewayContext<C, P>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: ProcessController,
    P: ReadinessProbe,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // WebSocket upgrades only work on HTTP/1.1 connections
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

async fn handle_request<C, P>(
    mut req: Request<Incoming>,
    context: Arc<GatewayContext<C, P>>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
where
    C: ProcessController,
    P: ReadinessProbe,
{
    if req.uri().path() == CONFIG_API_PATH {
        return Ok(handle_config_request(req, &context.apps).await);
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let app_name = match selected_app(req.uri(), &context.options.selector_param)
        .or_else(|| context.manager.active_app())
    {
        Some(name) => name,
        None => {
            return Ok(json_error_response(
                GatewayErrorCode::UnknownApp,
                "No app selected",
            ));
        }
    };

    let Some(app) = context.apps.find(&app_name) else {
        debug!(app = %app_name, request_id, "Unknown app requested");
        return Ok(json_error_response(
            GatewayErrorCode::UnknownApp,
            format!("Unknown app '{}'", app_name),
        ));
    };

    let (base, host) = match app.base_uri().and_then(|base| Ok((base, app.host()?))) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(app = %app.name, url = %app.url, error = %e, "Invalid app URL");
            return Ok(json_error_response(
                GatewayErrorCode::AppConfigError,
                "App configuration error",
            ));
        }
    };

    debug!(app = %app.name, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if let Err(e) = context.manager.activate(&app.name, &app.entrypoint, &host).await {
        let message = match &e {
            SwitchError::Stale { .. } => {
                warn!(app = %app.name, request_id, "Switch rejected as stale");
                "App changed while the switch was queued, please retry"
            }
            SwitchError::SpawnFailed { .. } | SwitchError::NotReady { .. } => {
                // Details stay in the log
                error!(app = %app.name, request_id, error = %e, "Failed to start app");
                "Failed to start app"
            }
            SwitchError::Stopped => "Gateway is shutting down",
        };
        return Ok(json_error_response(e.error_code(), message));
    }

    let target = match backend_uri(&base, req.uri()) {
        Ok(uri) => uri,
        Err(e) => {
            error!(app = %app.name, error = %e, "Failed to build backend URI");
            return Ok(json_error_response(
                GatewayErrorCode::AppConfigError,
                "App configuration error",
            ));
        }
    };

    let upgrade = is_websocket_upgrade(req.headers());
    set_forwarding_headers(req.headers_mut(), &request_id, client_addr);

    if upgrade {
        return handle_upgrade(req, target, host, request_id, context.options.request_timeout).await;
    }

    let if_none_match = req.headers().get(IF_NONE_MATCH).cloned();
    let is_head = req.method() == Method::HEAD;

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    parts.uri = target;
    parts.version = Version::HTTP_11;
    if let Ok(value) = HeaderValue::from_str(&host) {
        parts.headers.insert(HOST, value);
    }
    let req = Request::from_parts(parts, body);

    let timeout = context.options.request_timeout;
    let limit = context.options.max_buffered_body_bytes;
    let result = tokio::time::timeout(timeout, async {
        let response = context
            .pool
            .send_request(req)
            .await
            .map_err(ForwardError::Unreachable)?;
        finish_response(response, is_head, if_none_match.as_ref(), limit).await
    })
    .await
    .unwrap_or(Err(ForwardError::Timeout(timeout)));

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            match &e {
                ForwardError::Timeout(_) => warn!(app = %app.name, host, request_id, "Request timed out"),
                _ => error!(app = %app.name, host, request_id, error = %e, "Failed to forward request"),
            }
            Ok(json_error_response(e.error_code(), e.to_string()))
        }
    }
}

/// App named by the selector query parameter, if any
fn selected_app(uri: &Uri, param: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if decode_component(key)? == param {
                decode_component(value)
            } else {
                None
            }
        })
        .filter(|name| !name.is_empty())
}

fn decode_component(s: &str) -> Option<String> {
    urlencoding::decode(&s.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Check if a request asks for a WebSocket upgrade
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let wants_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_token && wants_websocket
}

/// Join the app's base URL with the incoming path and query
fn backend_uri(base: &Uri, req_uri: &Uri) -> Result<Uri, hyper::http::Error> {
    let path = join_paths(base.path(), req_uri.path());
    let base_query = base.query().filter(|q| !q.is_empty());
    let req_query = req_uri.query().filter(|q| !q.is_empty());
    let path_and_query = match (base_query, req_query) {
        (Some(b), Some(r)) => format!("{}?{}&{}", path, b, r),
        (Some(q), None) | (None, Some(q)) => format!("{}?{}", path, q),
        (None, None) => path,
    };

    let mut builder = Uri::builder().scheme(base.scheme_str().unwrap_or("http"));
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.as_str());
    }
    builder.path_and_query(path_and_query).build()
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Overwrite proxy headers; this gateway is the first trusted hop
fn set_forwarding_headers(headers: &mut HeaderMap, request_id: &str, client_addr: SocketAddr) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Remove connection-scoped headers, including those named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(name);
    }
}

async fn finish_response(
    response: Response<Incoming>,
    is_head: bool,
    if_none_match: Option<&HeaderValue>,
    limit: usize,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let declared = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if is_head || declared.is_some_and(|len| len > limit as u64) {
        debug!(status = %parts.status, declared, "Streaming backend response unmodified");
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(ForwardError::TooLarge { limit });
        }
        Err(e) => return Err(ForwardError::BodyRead(e.to_string())),
    };

    Ok(validated_response(parts, body, if_none_match))
}

/// Quoted SHA-256 of the body
fn compute_etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body)))
}

/// Tag a buffered response and answer a matching `If-None-Match` with 304
fn validated_response(
    mut parts: Parts,
    body: Bytes,
    if_none_match: Option<&HeaderValue>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let etag = compute_etag(&body);
    if let Ok(value) = HeaderValue::from_str(&etag) {
        parts.headers.insert(ETAG, value);
    }
    parts
        .headers
        .insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));

    if if_none_match.is_some_and(|v| v.as_bytes() == etag.as_bytes()) {
        parts.status = StatusCode::NOT_MODIFIED;
        parts.headers.remove(CONTENT_TYPE);
        parts.headers.remove(CONTENT_LENGTH);
        return Response::from_parts(parts, Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    }

    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response::from_parts(parts, Full::new(body).map_err(|never| match never {}).boxed())
}

/// Build the raw HTTP/1.1 upgrade request replayed to the backend
fn serialize_upgrade_request(req: &Request<Incoming>, target: &Uri, host: &str) -> Vec<u8> {
    let path = target.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }

    raw.extend_from_slice(format!("Host: {}\r\n\r\n", host).as_bytes());
    raw
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Read until the end of the response head. Returns the buffer and the head length;
/// anything past the head already belongs to the upgraded stream.
async fn read_response_head<R>(stream: &mut R) -> std::io::Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse the status line and headers of a raw HTTP/1.x response head
fn parse_response_head(data: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let head = std::str::from_utf8(data).ok()?;
    let mut lines = head.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
        let value = HeaderValue::from_str(value.trim()).ok()?;
        headers.append(name, value);
    }

    Some((status, headers))
}

/// Handle a WebSocket upgrade by bridging the client and backend sockets
async fn handle_upgrade(
    req: Request<Incoming>,
    target: Uri,
    host: String,
    request_id: String,
    timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.version() != Version::HTTP_11 {
        warn!(host, request_id, version = ?req.version(), "Upgrade requested on a non-HTTP/1.1 connection");
        return Ok(json_error_response(
            GatewayErrorCode::UpgradeUnsupported,
            "WebSocket upgrade requires HTTP/1.1",
        ));
    }

    debug!(host, request_id, uri = %target, "Handling WebSocket upgrade");

    let mut backend = match tokio::time::timeout(timeout, TcpStream::connect(&host)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(host, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                GatewayErrorCode::BackendUnreachable,
                "Failed to connect to backend",
            ));
        }
        Err(_) => {
            error!(host, "Timed out connecting to backend for upgrade");
            return Ok(json_error_response(
                GatewayErrorCode::BackendUnreachable,
                "Failed to connect to backend",
            ));
        }
    };

    let raw_request = serialize_upgrade_request(&req, &target, &host);
    let exchange = async {
        backend.write_all(&raw_request).await?;
        read_response_head(&mut backend).await
    };
    let (buf, head_len) = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(read)) => read,
        Ok(Err(e)) => {
            error!(host, error = %e, "Upgrade handshake with backend failed");
            return Ok(json_error_response(
                GatewayErrorCode::BackendUnreachable,
                "Backend failed the upgrade handshake",
            ));
        }
        Err(_) => {
            warn!(host, request_id, "Timed out waiting for backend upgrade response");
            return Ok(json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ));
        }
    };

    let Some((status, mut headers)) = parse_response_head(&buf[..head_len]) else {
        error!(host, "Failed to parse backend upgrade response");
        return Ok(json_error_response(
            GatewayErrorCode::BackendUnreachable,
            "Invalid upgrade response from backend",
        ));
    };
    let residue = Bytes::copy_from_slice(&buf[head_len..]);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host, status = %status, "Backend rejected upgrade request");
        let relayed = rejected_upgrade_response(status, headers, residue, &mut backend);
        return Ok(match tokio::time::timeout(timeout, relayed).await {
            Ok(response) => response,
            Err(_) => json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ),
        });
    }

    info!(host, request_id, "WebSocket upgrade accepted by backend");

    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;

    tokio::spawn(async move {
        // Bytes hyper already read from the client are replayed by `Upgraded`
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(host, request_id, "Client upgrade complete, starting tunnel");
                match tunnel(TokioIo::new(upgraded), backend, residue).await {
                    Ok((client_to_backend, backend_to_client)) => debug!(
                        host,
                        request_id,
                        client_to_backend,
                        backend_to_client,
                        "WebSocket tunnel closed"
                    ),
                    Err(e) => debug!(host, request_id, error = %e, "WebSocket tunnel closed with error"),
                }
            }
            Err(e) => {
                error!(host, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Relay a non-101 backend answer. Only a `Content-Length` body is carried over.
async fn rejected_upgrade_response(
    status: StatusCode,
    mut headers: HeaderMap,
    residue: Bytes,
    backend: &mut TcpStream,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|len| *len <= MAX_RESPONSE_HEAD_BYTES);

    let mut body = residue.to_vec();
    match declared {
        Some(len) => {
            while body.len() < len {
                let mut chunk = [0u8; 1024];
                match backend.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                }
            }
            body.truncate(len);
        }
        None => body.clear(),
    }

    strip_hop_by_hop(&mut headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Copy bytes both ways until either side finishes, then close both.
///
/// `backend_residue` holds bytes the backend sent right after its response head.
async fn tunnel<A, B>(client: A, backend: B, backend_residue: Bytes) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    if !backend_residue.is_empty() {
        client_wr.write_all(&backend_residue).await?;
    }

    let result = tokio::select! {
        sent = tokio::io::copy(&mut client_rd, &mut backend_wr) => sent.map(|n| (n, 0)),
        received = tokio::io::copy(&mut backend_rd, &mut client_wr) => {
            received.map(|n| (0, n + backend_residue.len() as u64))
        }
    };

    let _ = backend_wr.shutdown().await;
    let _ = client_wr.shutdown().await;
    result
}
