use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::Instrument as _;

use super::auth::{AuthGate, JwtPayload, require_auth};
use super::error_response::{ErrorBody, create_error_response};
use crate::config::{GatewaySettings, LlmConfig, TraceSettings};
use crate::credentials::{CredentialsError, parse_credentials, resolve_credentials_content};
use crate::error::ErrorType;
use crate::profile::Env;
use crate::providers::VERTEXAI;
use crate::runtime::{ChatBody, ChatOptions, ChatResponse, RuntimeFactory};
use crate::trace::{TRACE_HEADER, TracePayload, create_trace_options};
use crate::types::ChatStreamPayload;
use crate::DittoError;

pub const VERTEXAI_CHAT_PATH: &str = "/webapi/chat/vertexai";

#[derive(Clone)]
pub struct GatewayState {
    env: Arc<Env>,
    trace: TraceSettings,
    factory: Arc<dyn RuntimeFactory>,
    auth: AuthGate,
    cwd: PathBuf,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("env", &self.env)
            .field("trace", &self.trace)
            .field("auth", &self.auth)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// Fails when no auth secret can be resolved.
    pub fn new(
        env: Env,
        settings: &GatewaySettings,
        factory: Arc<dyn RuntimeFactory>,
    ) -> crate::Result<Self> {
        let auth = AuthGate::from_settings(&settings.auth, &env)?;
        let cwd = std::env::current_dir()?;
        Ok(Self {
            env: Arc::new(env),
            trace: settings.trace.clone(),
            factory,
            auth,
            cwd,
        })
    }

    /// Directory relative credential paths resolve against.
    pub fn with_working_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayState) -> Router {
    let chat = Router::new()
        .route(VERTEXAI_CHAT_PATH, post(handle_vertexai_chat))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(chat)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Failures of the chat route, all reported through the error envelope.
#[derive(Debug, Error)]
pub enum ChatRouteError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("failed to parse chat request body: {0}")]
    Body(#[source] serde_json::Error),
    #[error(transparent)]
    Runtime(#[from] DittoError),
}

impl ChatRouteError {
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::Runtime(err) => err.error_type(),
            Self::Credentials(_) | Self::Body(_) => None,
        }
    }

    pub fn detail(&self) -> Value {
        match self {
            Self::Runtime(DittoError::Chat(err)) => err
                .error
                .clone()
                .unwrap_or_else(|| json!({ "message": err.error_type.as_str() })),
            _ => json!({ "message": self.to_string() }),
        }
    }

    pub fn extra(&self) -> Map<String, Value> {
        match self {
            Self::Runtime(DittoError::Chat(err)) => err.extra.clone(),
            _ => Map::new(),
        }
    }
}

pub async fn handle_vertexai_chat(
    State(state): State<GatewayState>,
    Extension(jwt): Extension<JwtPayload>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!("vertexai_chat", provider = VERTEXAI, user_id = %jwt.user_id);
    match run_chat(&state, jwt, &headers, &body).instrument(span).await {
        Ok(response) => into_http_response(response),
        Err(err) => {
            let error_type = err.error_type().unwrap_or(ErrorType::InternalServerError);
            tracing::error!(
                provider = VERTEXAI,
                error_type = %error_type,
                error = %err,
                "chat request failed"
            );
            create_error_response(
                error_type,
                ErrorBody::new(err.detail(), VERTEXAI).with_extra(err.extra()),
            )
        }
    }
}

async fn run_chat(
    state: &GatewayState,
    jwt: JwtPayload,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ChatResponse, ChatRouteError> {
    let config = LlmConfig::from_env(&state.env);
    let credentials = resolve_credentials_content(&config, &state.cwd)
        .await?
        .map(|content| parse_credentials(&content))
        .transpose()?;

    let runtime = state.factory.init(config.vertex_init(credentials))?;

    let payload: ChatStreamPayload = serde_json::from_slice(body).map_err(ChatRouteError::Body)?;

    let trace = state
        .trace
        .enabled
        .then(|| headers.get(TRACE_HEADER))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(TracePayload::from_header_value)
        .filter(|trace| trace.enabled)
        .map(|trace| create_trace_options(&payload, VERTEXAI, &trace));

    tracing::info!(
        model = %payload.model,
        stream = payload.is_stream(),
        traced = trace.is_some(),
        "dispatching chat request"
    );

    let options = ChatOptions {
        user: jwt.user_id,
        trace,
    };
    Ok(runtime.chat(payload, options).await?)
}

fn into_http_response(response: ChatResponse) -> Response {
    let mut out = match response.body {
        ChatBody::Stream(stream) => {
            let mut out = Response::new(Body::from_stream(stream));
            out.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            out.headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            out
        }
        ChatBody::Json(value) => Json(value).into_response(),
    };
    for (name, value) in response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header"),
        }
    }
    out
}
