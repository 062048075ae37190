//! Google Cloud credentials for Vertex AI.
//!
//! Service-account keys are turned into self-signed RS256 JWTs scoped to the
//! Vertex endpoint, so no token exchange round trip is needed. Authorized-user
//! credentials go through the OAuth refresh-token grant, and when no
//! credentials are supplied the GCE metadata server is asked instead.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::oauth::{AccessToken, RefreshTokenGrant, TokenResponse};
use crate::{DittoError, Result};

pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const SELF_SIGNED_JWT_LIFETIME_SECS: u64 = 3600;

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub quota_project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for AuthorizedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedUser")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("quota_project_id", &self.quota_project_id)
            .finish()
    }
}

/// Parsed contents of a Google credentials JSON document.
#[derive(Debug, Clone)]
pub enum GoogleCredentials {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

impl GoogleCredentials {
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some("service_account") => Self::service_account(value),
            Some("authorized_user") => serde_json::from_value(value.clone())
                .map(Self::AuthorizedUser)
                .map_err(|err| {
                    DittoError::invalid_vertex_credentials(format!(
                        "invalid authorized_user credentials: {err}"
                    ))
                }),
            Some(other) => Err(DittoError::invalid_vertex_credentials(format!(
                "unsupported credentials type {other:?}"
            ))),
            None if value.get("private_key").is_some() => Self::service_account(value),
            None => Err(DittoError::invalid_vertex_credentials(
                "credentials JSON has no \"type\" field",
            )),
        }
    }

    fn service_account(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map(Self::ServiceAccount)
            .map_err(|err| {
                DittoError::invalid_vertex_credentials(format!(
                    "invalid service_account credentials: {err}"
                ))
            })
    }

    pub fn project_id(&self) -> Option<&str> {
        let project = match self {
            Self::ServiceAccount(key) => key.project_id.as_deref(),
            Self::AuthorizedUser(user) => user.quota_project_id.as_deref(),
        };
        project.filter(|project| !project.trim().is_empty())
    }
}

#[derive(Serialize)]
struct SelfSignedClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Clone)]
pub struct ServiceAccountSigner {
    client_email: String,
    key_id: Option<String>,
    key: EncodingKey,
}

impl std::fmt::Debug for ServiceAccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountSigner")
            .field("client_email", &self.client_email)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountSigner {
    pub fn new(key: &ServiceAccountKey) -> Result<Self> {
        if key.client_email.trim().is_empty() {
            return Err(DittoError::invalid_vertex_credentials(
                "service_account credentials are missing client_email",
            ));
        }
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|err| {
            DittoError::invalid_vertex_credentials(format!(
                "service_account private_key is not a valid RSA PEM: {err}"
            ))
        })?;
        Ok(Self {
            client_email: key.client_email.clone(),
            key_id: key.private_key_id.clone().filter(|id| !id.trim().is_empty()),
            key: encoding_key,
        })
    }

    /// Signs a JWT for `audience` valid from `now` (unix seconds) for one hour.
    pub fn sign(&self, audience: &str, now: u64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        let claims = SelfSignedClaims {
            iss: &self.client_email,
            sub: &self.client_email,
            aud: audience,
            iat: now,
            exp: now + SELF_SIGNED_JWT_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.key).map_err(|err| {
            DittoError::invalid_vertex_credentials(format!("failed to sign service account JWT: {err}"))
        })
    }
}

/// Where a Vertex request gets its bearer token from.
#[derive(Debug, Clone)]
pub enum GoogleTokenSource {
    ServiceAccount(ServiceAccountSigner),
    AuthorizedUser(RefreshTokenGrant),
    MetadataServer { host: String },
}

impl GoogleTokenSource {
    pub fn new(credentials: Option<&GoogleCredentials>, metadata_host: Option<&str>) -> Result<Self> {
        match credentials {
            Some(GoogleCredentials::ServiceAccount(key)) => {
                ServiceAccountSigner::new(key).map(Self::ServiceAccount)
            }
            Some(GoogleCredentials::AuthorizedUser(user)) => {
                let mut grant = RefreshTokenGrant::new(
                    user.client_id.clone(),
                    user.client_secret.clone(),
                    user.refresh_token.clone(),
                )?;
                if let Some(token_uri) = user.token_uri.as_deref() {
                    grant = grant.with_token_url(token_uri);
                }
                Ok(Self::AuthorizedUser(grant))
            }
            None => Ok(Self::MetadataServer {
                host: metadata_host
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .unwrap_or(DEFAULT_METADATA_HOST)
                    .to_string(),
            }),
        }
    }

    pub async fn access_token(&self, http: &reqwest::Client, audience: &str) -> Result<AccessToken> {
        match self {
            Self::ServiceAccount(signer) => {
                let jwt = signer.sign(audience, jsonwebtoken::get_current_timestamp())?;
                Ok(AccessToken::bearer(jwt))
            }
            Self::AuthorizedUser(grant) => grant.fetch_token(http).await,
            Self::MetadataServer { host } => {
                let url = format!("http://{host}{METADATA_TOKEN_PATH}");
                let parsed = crate::utils::http::send_checked_json::<TokenResponse>(
                    http.get(url).header("Metadata-Flavor", "Google"),
                )
                .await?;
                parsed.into_access_token()
            }
        }
    }
}
