use serde::Deserialize;

use crate::{DittoError, Result};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// A bearer credential ready to be sent upstream.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl AccessToken {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type: "Bearer".to_string(),
            expires_in: None,
        }
    }

    pub fn authorization_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

/// OAuth2 `refresh_token` grant for Google "authorized_user" credentials,
/// as written by `gcloud auth application-default login`.
#[derive(Clone)]
pub struct RefreshTokenGrant {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for RefreshTokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenGrant")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

impl RefreshTokenGrant {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self> {
        let grant = Self {
            token_url: GOOGLE_TOKEN_URL.to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
        };
        for (label, value) in [
            ("client_id", &grant.client_id),
            ("client_secret", &grant.client_secret),
            ("refresh_token", &grant.refresh_token),
        ] {
            if value.trim().is_empty() {
                return Err(DittoError::invalid_vertex_credentials(format!(
                    "authorized_user credentials are missing {label}"
                )));
            }
        }
        Ok(grant)
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        let token_url = token_url.into();
        if !token_url.trim().is_empty() {
            self.token_url = token_url;
        }
        self
    }

    pub async fn fetch_token(&self, http: &reqwest::Client) -> Result<AccessToken> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let parsed = crate::utils::http::send_checked_json::<TokenResponse>(
            http.post(self.token_url.as_str()).form(&form),
        )
        .await?;
        parsed.into_access_token()
    }
}

/// Token endpoint payload shared by the OAuth and metadata-server flows.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub(crate) fn into_access_token(self) -> Result<AccessToken> {
        let token = self
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                DittoError::InvalidResponse("token response missing access_token".to_string())
            })?;
        let token_type = self
            .token_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_string());
        Ok(AccessToken {
            token,
            token_type,
            expires_in: self.expires_in,
        })
    }
}
