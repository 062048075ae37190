//! Provider configuration read from the environment, and the gateway's own
//! TOML settings.

use std::path::Path;

use serde::Deserialize;

use crate::profile::Env;
use crate::providers::VertexInit;
use crate::{DittoError, Result};

pub const VERTEXAI_PROJECT: &str = "VERTEXAI_PROJECT";
pub const VERTEXAI_LOCATION: &str = "VERTEXAI_LOCATION";
pub const VERTEXAI_CREDENTIALS: &str = "VERTEXAI_CREDENTIALS";
pub const VERTEXAI_CREDENTIALS_PATH: &str = "VERTEXAI_CREDENTIALS_PATH";
pub const VERTEXAI_BASE_URL: &str = "VERTEXAI_BASE_URL";
pub const GCE_METADATA_HOST: &str = "GCE_METADATA_HOST";

pub const DEFAULT_AUTH_SECRET_ENV: &str = "DITTO_AUTH_SECRET";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Vertex AI settings for one request. Unset variables stay `None`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LlmConfig {
    pub vertexai_project: Option<String>,
    pub vertexai_location: Option<String>,
    pub vertexai_credentials: Option<String>,
    pub vertexai_credentials_path: Option<String>,
    pub vertexai_base_url: Option<String>,
    /// Metadata server used when no credentials are configured.
    pub gce_metadata_host: Option<String>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("vertexai_project", &self.vertexai_project)
            .field("vertexai_location", &self.vertexai_location)
            .field(
                "vertexai_credentials",
                &self.vertexai_credentials.as_ref().map(|_| "<redacted>"),
            )
            .field("vertexai_credentials_path", &self.vertexai_credentials_path)
            .field("vertexai_base_url", &self.vertexai_base_url)
            .field("gce_metadata_host", &self.gce_metadata_host)
            .finish()
    }
}

impl LlmConfig {
    pub fn from_env(env: &Env) -> Self {
        let read = |key: &str| env.get(key).map(|value| value.trim().to_string());
        Self {
            vertexai_project: read(VERTEXAI_PROJECT),
            vertexai_location: read(VERTEXAI_LOCATION),
            // Inline JSON is passed through untouched.
            vertexai_credentials: env.get(VERTEXAI_CREDENTIALS),
            vertexai_credentials_path: read(VERTEXAI_CREDENTIALS_PATH),
            vertexai_base_url: read(VERTEXAI_BASE_URL),
            gce_metadata_host: read(GCE_METADATA_HOST),
        }
    }

    /// Client settings for this config and already-parsed credentials.
    pub fn vertex_init(&self, credentials: Option<serde_json::Value>) -> VertexInit {
        VertexInit {
            project: self.vertexai_project.clone(),
            location: self.vertexai_location.clone(),
            credentials,
            base_url: self.vertexai_base_url.clone(),
            metadata_host: self.gce_metadata_host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    pub listen: String,
    pub json_logs: bool,
    pub auth: AuthSettings,
    pub trace: TraceSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            json_logs: false,
            auth: AuthSettings::default(),
            trace: TraceSettings::default(),
        }
    }
}

impl GatewaySettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| DittoError::Config(err.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            DittoError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    /// Inline HS256 secret. Prefer `secret_env` outside of local setups.
    pub secret: Option<String>,
    pub secret_env: String,
    /// Accepted access codes; empty disables the access-code check.
    pub access_codes: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: None,
            secret_env: DEFAULT_AUTH_SECRET_ENV.to_string(),
            access_codes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_env", &self.secret_env)
            .field("access_codes", &self.access_codes.len())
            .finish()
    }
}

impl AuthSettings {
    pub fn resolve_secret(&self, env: &Env) -> Result<String> {
        if let Some(secret) = self.secret.as_ref().filter(|s| !s.trim().is_empty()) {
            return Ok(secret.clone());
        }
        env.get(&self.secret_env).ok_or_else(|| {
            DittoError::Config(format!(
                "auth secret is not configured (set auth.secret or {})",
                self.secret_env
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceSettings {
    /// When false, trace payloads sent by clients are ignored.
    pub enabled: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}
