use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error kinds surfaced to chat clients.
///
/// The serialized name is part of the HTTP error envelope, so variants are
/// spelled the way clients match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    InternalServerError,
    Unauthorized,
    InvalidAccessCode,
    #[serde(rename = "InvalidProviderAPIKey")]
    InvalidProviderApiKey,
    InvalidVertexCredentials,
    PermissionDenied,
    LocationNotSupportError,
    QuotaLimitReached,
    AgentRuntimeError,
    ProviderBizError,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InternalServerError => "InternalServerError",
            Self::Unauthorized => "Unauthorized",
            Self::InvalidAccessCode => "InvalidAccessCode",
            Self::InvalidProviderApiKey => "InvalidProviderAPIKey",
            Self::InvalidVertexCredentials => "InvalidVertexCredentials",
            Self::PermissionDenied => "PermissionDenied",
            Self::LocationNotSupportError => "LocationNotSupportError",
            Self::QuotaLimitReached => "QuotaLimitReached",
            Self::AgentRuntimeError => "AgentRuntimeError",
            Self::ProviderBizError => "ProviderBizError",
        }
    }

    /// HTTP status code carried by error responses of this kind.
    ///
    /// 470/471 are non-standard codes reserved for runtime and provider
    /// business failures so clients can tell them apart from gateway errors.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Unauthorized
            | Self::InvalidAccessCode
            | Self::InvalidProviderApiKey
            | Self::InvalidVertexCredentials => 401,
            Self::PermissionDenied | Self::LocationNotSupportError => 403,
            Self::QuotaLimitReached => 429,
            Self::AgentRuntimeError => 470,
            Self::ProviderBizError => 471,
            Self::InternalServerError => 500,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat failure that already knows its [`ErrorType`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionError {
    pub error_type: ErrorType,
    pub error: Option<Value>,
    pub extra: Map<String, Value>,
}

impl ChatCompletionError {
    pub fn new(error_type: ErrorType) -> Self {
        Self {
            error_type,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_error(serde_json::json!({ "message": message.into() }))
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for ChatCompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self
            .error
            .as_ref()
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str);
        match message {
            Some(message) => write!(f, "{}: {message}", self.error_type),
            None => write!(f, "{}", self.error_type),
        }
    }
}

#[derive(Debug, Error)]
pub enum DittoError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Chat(Box<ChatCompletionError>),
}

impl DittoError {
    pub fn chat(error: ChatCompletionError) -> Self {
        Self::Chat(Box::new(error))
    }

    pub fn invalid_vertex_credentials(message: impl Into<String>) -> Self {
        Self::chat(ChatCompletionError::new(ErrorType::InvalidVertexCredentials).with_message(message))
    }

    /// The explicit error kind, if this error carries one.
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::Chat(err) => Some(err.error_type),
            _ => None,
        }
    }
}

impl From<ChatCompletionError> for DittoError {
    fn from(error: ChatCompletionError) -> Self {
        Self::chat(error)
    }
}

pub type Result<T> = std::result::Result<T, DittoError>;
