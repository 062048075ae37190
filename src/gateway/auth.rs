//! Bearer-token gate in front of the chat route.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error_response::{ErrorBody, create_error_response};
use crate::config::AuthSettings;
use crate::error::{ChatCompletionError, ErrorType};
use crate::profile::Env;
use crate::providers::VERTEXAI;
use crate::Result;

/// Fallback header for clients that cannot set `Authorization`.
pub const CHAT_AUTH_HEADER: &str = "x-ditto-chat-auth";

/// Verified identity of the caller, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    sub: Option<String>,
    #[serde(rename = "accessCode")]
    access_code: Option<String>,
}

#[derive(Clone)]
pub struct AuthGate {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
    access_codes: Arc<[String]>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("access_codes", &self.access_codes.len())
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(secret: &str, access_codes: Vec<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_aud = false;
        Self {
            key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(validation),
            access_codes: access_codes
                .into_iter()
                .map(|code| code.trim().to_string())
                .filter(|code| !code.is_empty())
                .collect(),
        }
    }

    pub fn from_settings(settings: &AuthSettings, env: &Env) -> Result<Self> {
        let secret = settings.resolve_secret(env)?;
        Ok(Self::new(&secret, settings.access_codes.clone()))
    }

    pub fn verify(&self, headers: &HeaderMap) -> std::result::Result<JwtPayload, ChatCompletionError> {
        let token = extract_bearer(headers)
            .or_else(|| extract_header(headers, CHAT_AUTH_HEADER))
            .ok_or_else(|| unauthorized("missing auth token"))?;

        let claims = jsonwebtoken::decode::<Claims>(&token, &self.key, &self.validation)
            .map_err(|err| unauthorized(format!("invalid auth token: {err}")))?
            .claims;

        let user_id = claims
            .user_id
            .or(claims.sub)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| unauthorized("auth token has no user id"))?;

        if !self.access_codes.is_empty() {
            let provided = claims.access_code.as_deref().map(str::trim);
            if !provided.is_some_and(|code| self.access_codes.iter().any(|known| known == code)) {
                return Err(ChatCompletionError::new(ErrorType::InvalidAccessCode)
                    .with_message("access code is missing or not recognised"));
            }
        }

        Ok(JwtPayload {
            user_id,
            access_code: claims.access_code,
        })
    }
}

fn unauthorized(message: impl Into<String>) -> ChatCompletionError {
    ChatCompletionError::new(ErrorType::Unauthorized).with_message(message)
}

/// Middleware: rejects unauthenticated requests before the handler runs.
pub async fn require_auth(State(gate): State<AuthGate>, mut request: Request, next: Next) -> Response {
    match gate.verify(request.headers()) {
        Ok(payload) => {
            tracing::debug!(user_id = %payload.user_id, "request authenticated");
            request.extensions_mut().insert(payload);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(
                provider = VERTEXAI,
                error_type = %err.error_type,
                path = %request.uri().path(),
                "rejecting unauthenticated request"
            );
            let detail = err.error.unwrap_or_else(|| json!({ "message": err.error_type.as_str() }));
            create_error_response(err.error_type, ErrorBody::new(detail, VERTEXAI))
        }
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}
