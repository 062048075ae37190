use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ErrorType;

/// Body of an error envelope. `extra` fields sit next to `error` and
/// `provider` in the serialized object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub provider: String,
}

impl ErrorBody {
    pub fn new(error: Value, provider: impl Into<String>) -> Self {
        Self {
            error,
            extra: Map::new(),
            provider: provider.into(),
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        // `error` and `provider` are fixed fields of the envelope.
        self.extra = extra
            .into_iter()
            .filter(|(key, _)| key != "error" && key != "provider")
            .collect();
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "errorType")]
    error_type: ErrorType,
    body: ErrorBody,
}

/// JSON error response whose status follows the error kind.
pub fn create_error_response(error_type: ErrorType, body: ErrorBody) -> Response {
    let status = StatusCode::from_u16(error_type.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorEnvelope { error_type, body })).into_response()
}
