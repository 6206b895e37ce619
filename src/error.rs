//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No app selected, or the selected app is not configured
    UnknownApp,
    /// The switch lost a race against a newer one
    StaleSwitch,
    /// The backend could not be spawned or never became ready
    StartupFailed,
    /// The configured app entry is unusable
    AppConfigError,
    /// Failed to connect to or talk to the backend
    BackendUnreachable,
    /// The backend response exceeded the buffering limit
    ResponseTooLarge,
    /// Request timed out waiting for the backend
    RequestTimeout,
    /// The client connection cannot be handed over for tunneling
    UpgradeUnsupported,
    /// The gateway is shutting down
    ShuttingDown,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            GatewayErrorCode::StaleSwitch => StatusCode::CONFLICT,
            GatewayErrorCode::StartupFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::AppConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ResponseTooLarge => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::UpgradeUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownApp => "UNKNOWN_APP",
            GatewayErrorCode::StaleSwitch => "STALE_SWITCH",
            GatewayErrorCode::StartupFailed => "STARTUP_FAILED",
            GatewayErrorCode::AppConfigError => "APP_CONFIG_ERROR",
            GatewayErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            GatewayErrorCode::ResponseTooLarge => "RESPONSE_TOO_LARGE",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::UpgradeUnsupported => "UPGRADE_UNSUPPORTED",
            GatewayErrorCode::ShuttingDown => "SHUTTING_DOWN",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
