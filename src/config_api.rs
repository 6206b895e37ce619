//! `/api/config`: read or replace the app list over HTTP

use crate::config::{AppStore, AppsDocument};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{info, warn};

pub const CONFIG_API_PATH: &str = "/api/config";

/// Largest accepted config document
const MAX_CONFIG_BODY_BYTES: usize = 1024 * 1024;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, PUT, DELETE, OPTIONS"),
    ("access-control-allow-headers", "Content-Type, Authorization"),
];

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn with_cors(mut response: Response<BoxBody<Bytes, hyper::Error>>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

/// Serve a request addressed to [`CONFIG_API_PATH`]
pub async fn handle_config_request(
    req: Request<Incoming>,
    apps: &AppStore,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let response = match *req.method() {
        Method::OPTIONS => Response::builder()
            .status(StatusCode::OK)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response with StatusCode enum"),

        Method::GET => match serde_json::to_string(&apps.snapshot()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                warn!(error = %e, "Failed to serialize app list");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },

        Method::PUT => replace_apps(req, apps).await,

        _ => {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, PUT, OPTIONS"));
            response
        }
    };

    with_cors(response)
}

async fn replace_apps(req: Request<Incoming>, apps: &AppStore) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match Limited::new(req.into_body(), MAX_CONFIG_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read config body");
            return text_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let doc: AppsDocument = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "Rejected malformed config document");
            return text_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    if let Err(e) = doc.validate() {
        warn!(error = %e, "Rejected invalid config document");
        return text_response(StatusCode::BAD_REQUEST, e);
    }

    info!(
        apps = ?doc.apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        "App list replaced"
    );
    apps.replace(doc);
    text_response(StatusCode::OK, "ok")
}
