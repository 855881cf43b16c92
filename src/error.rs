//! Error types and JSON error responses for the panel

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use rusqlite::ErrorCode;
use serde::Serialize;
use std::fmt;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Key used to look up an inbound that turned out to be missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Id(i64),
    Port(u16),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Id(id) => write!(f, "id {}", id),
            Lookup::Port(port) => write!(f, "port {}", port),
        }
    }
}

/// Errors produced by the inbound core and the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listening port already taken by another inbound
    #[error("port already in use: {0}")]
    PortConflict(u16),

    /// No inbound matches the given id or port
    #[error("inbound not found: {0}")]
    NotFound(Lookup),

    /// Malformed request payload
    #[error("invalid request: {0}")]
    Validation(String),

    /// Persistence layer failure
    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    /// The supervised proxy process could not be restarted
    #[error("supervised process failure: {0}")]
    Process(String),
}

impl Error {
    pub fn process(message: impl Into<String>) -> Self {
        Error::Process(message.into())
    }

    /// Convert a write failure into a conflict when it was caused by the
    /// unique index on `inbounds.port`.
    pub(crate) fn from_write(err: rusqlite::Error, port: u16) -> Self {
        if is_port_constraint_violation(&err) {
            Error::PortConflict(port)
        } else {
            Error::Store(err)
        }
    }

    /// The API error code for this error
    pub fn code(&self) -> ApiErrorCode {
        match self {
            Error::PortConflict(_) => ApiErrorCode::PortConflict,
            Error::NotFound(_) => ApiErrorCode::NotFound,
            Error::Validation(_) => ApiErrorCode::InvalidRequest,
            Error::Store(_) => ApiErrorCode::StoreFailure,
            Error::Process(_) => ApiErrorCode::ProcessFailure,
        }
    }
}

fn is_port_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == ErrorCode::ConstraintViolation
                && msg.as_deref().is_some_and(|m| m.contains("inbounds.port"))
        }
        _ => false,
    }
}

/// Error codes returned by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Port already used by another inbound
    PortConflict,
    /// Inbound id or port not found
    NotFound,
    /// Payload could not be parsed or is missing fields
    InvalidRequest,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Database error
    StoreFailure,
    /// Restarting the proxy process failed
    ProcessFailure,
    /// Unknown route
    UnknownRoute,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::PortConflict => StatusCode::CONFLICT,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::ProcessFailure => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Panel-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::PortConflict => "PORT_CONFLICT",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::InvalidRequest => "INVALID_REQUEST",
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::StoreFailure => "STORE_FAILURE",
            ApiErrorCode::ProcessFailure => "PROCESS_FAILURE",
            ApiErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
        }
    }
}

/// JSON body shared by every admin API response
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ApiErrorCode>,
    pub obj: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(obj: T) -> Self {
        Self {
            success: true,
            msg: String::new(),
            code: None,
            obj: Some(obj),
        }
    }
}

impl Envelope<()> {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            code: None,
            obj: None,
        }
    }

    pub fn error(code: ApiErrorCode, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            code: Some(code),
            obj: None,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"msg":"{}","obj":null}}"#,
                self.msg.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, body: &Envelope<T>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON error response with X-Panel-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = Envelope::error(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Panel-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&Error> for Response<Full<Bytes>> {
    fn from(err: &Error) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
