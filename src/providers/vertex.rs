use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::Url;
use serde_json::{Value, json};

use super::genai;
use crate::auth::{GoogleCredentials, GoogleTokenSource};
use crate::model::{LanguageModel, StreamResult};
use crate::types::{GenerateRequest, GenerateResponse, StreamChunk, Warning};
use crate::{ChatCompletionError, DittoError, ErrorType, Result};

pub const PROVIDER: &str = "vertexai";
pub const DEFAULT_LOCATION: &str = "us-central1";

/// Everything needed to bind a [`Vertex`] client to one project.
#[derive(Clone, Default)]
pub struct VertexInit {
    pub project: Option<String>,
    pub location: Option<String>,
    pub credentials: Option<Value>,
    pub base_url: Option<String>,
    /// Overrides the GCE metadata host used when no credentials are given.
    pub metadata_host: Option<String>,
}

impl std::fmt::Debug for VertexInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexInit")
            .field("project", &self.project)
            .field("location", &self.location)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("metadata_host", &self.metadata_host)
            .finish()
    }
}

#[derive(Clone)]
pub struct Vertex {
    http: reqwest::Client,
    base_url: String,
    audience: String,
    project: String,
    location: String,
    token_source: GoogleTokenSource,
    default_model: String,
}

impl std::fmt::Debug for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vertex")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .field("location", &self.location)
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// HTTP client used for token and generation calls.
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .map_err(DittoError::Http)
}

/// Model ids come from the request body and end up in the URL path, so only a
/// single plain segment is accepted.
fn validate_model_id(model: &str) -> Result<&str> {
    let model = model.strip_prefix("models/").unwrap_or(model);
    let valid = !model.is_empty()
        && !model.contains("..")
        && !model.chars().any(|c| {
            matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control()
        });
    if valid {
        Ok(model)
    } else {
        Err(DittoError::chat(
            ChatCompletionError::new(ErrorType::ProviderBizError)
                .with_message(format!("invalid Vertex AI model id: {model:?}")),
        ))
    }
}

impl Vertex {
    /// Builds a client from project/location/credentials.
    ///
    /// The project falls back to the credentials' own project and the location
    /// to `us-central1`; a client with no resolvable project is rejected here
    /// rather than on the first request.
    pub fn init_from_vertexai(init: VertexInit) -> Result<Self> {
        Self::init_with_http_client(init, default_http_client()?)
    }

    /// Like [`Vertex::init_from_vertexai`], reusing an existing connection pool.
    pub fn init_with_http_client(init: VertexInit, http: reqwest::Client) -> Result<Self> {
        let credentials = init
            .credentials
            .as_ref()
            .map(GoogleCredentials::from_value)
            .transpose()?;

        let project = non_blank(init.project.as_deref())
            .or_else(|| credentials.as_ref().and_then(GoogleCredentials::project_id))
            .ok_or_else(|| {
                DittoError::invalid_vertex_credentials(
                    "Vertex AI project is not configured; set VERTEXAI_PROJECT or use credentials that carry a project_id",
                )
            })?
            .to_string();
        let location = non_blank(init.location.as_deref())
            .unwrap_or(DEFAULT_LOCATION)
            .to_string();

        let host = if location == "global" {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{location}-aiplatform.googleapis.com")
        };
        let base_url = match non_blank(init.base_url.as_deref()) {
            Some(base_url) => base_url.trim_end_matches('/').to_string(),
            None => format!(
                "https://{host}/v1/projects/{project}/locations/{location}/publishers/google/models"
            ),
        };

        let token_source =
            GoogleTokenSource::new(credentials.as_ref(), init.metadata_host.as_deref())?;

        Ok(Self {
            http,
            base_url,
            audience: format!("https://{host}/"),
            project,
            location,
            token_source,
            default_model: String::new(),
        })
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve_model<'a>(&'a self, request: &'a GenerateRequest) -> Result<&'a str> {
        let model = non_blank(request.model.as_deref())
            .or_else(|| non_blank(Some(self.default_model.as_str())))
            .ok_or_else(|| DittoError::InvalidResponse("vertex model is not set".to_string()))?;
        validate_model_id(model)
    }

    fn method_url(&self, model: &str, method: &str, alt: Option<&str>) -> Result<Url> {
        let invalid = |err: String| {
            DittoError::InvalidResponse(format!("invalid vertex url {:?}: {err}", self.base_url))
        };
        let mut url = Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(&format!("{model}:{method}"));
        if let Some(alt) = alt {
            url.query_pairs_mut().append_pair("alt", alt);
        }
        Ok(url)
    }

    /// Token failures mean the configured credentials are unusable.
    async fn authorize(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .token_source
            .access_token(&self.http, &self.audience)
            .await
            .map_err(|err| match err {
                DittoError::Api { status, body } => DittoError::invalid_vertex_credentials(
                    format!("failed to obtain Google access token ({status}): {body}"),
                ),
                other => other,
            })?;
        Ok(req.header(
            reqwest::header::AUTHORIZATION,
            token.authorization_header_value(),
        ))
    }

    fn prepare(&self, request: &GenerateRequest) -> Result<(String, Value, Vec<Warning>)> {
        let model = self.resolve_model(request)?.to_string();
        let mut warnings = Vec::new();
        let body = genai::build_request_body(&model, request, &mut warnings)?;
        Ok((model, body, warnings))
    }
}

#[async_trait]
impl LanguageModel for Vertex {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model_id(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let (model, body, warnings) = self.prepare(&request)?;
        let url = self.method_url(&model, "generateContent", None)?;
        tracing::debug!(provider = PROVIDER, %model, "vertex generateContent");

        let req = self.authorize(self.http.post(url).json(&body)).await?;
        let parsed = crate::utils::http::send_checked_json::<Value>(req)
            .await
            .map_err(classify_api_error)?;
        let parsed = genai::parse_generate_response(&parsed);

        Ok(GenerateResponse {
            content: parsed.content,
            finish_reason: parsed.finish_reason,
            usage: parsed.usage,
            warnings,
        })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<StreamResult> {
        if !cfg!(feature = "streaming") {
            return Err(DittoError::InvalidResponse(
                "built without the streaming feature".to_string(),
            ));
        }

        let (model, body, warnings) = self.prepare(&request)?;
        let url = self.method_url(&model, "streamGenerateContent", Some("sse"))?;
        tracing::debug!(provider = PROVIDER, %model, "vertex streamGenerateContent");

        let req = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);
        let req = self.authorize(req).await?;
        let response = crate::utils::http::send_checked(req)
            .await
            .map_err(classify_api_error)?;

        let (data, pending) = crate::utils::streaming::open_sse_with_warnings(response, warnings);
        let chunks = stream::unfold(
            (data, pending, genai::StreamState::default(), false),
            |(mut data, mut pending, mut state, mut done)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (data, pending, state, done)));
                    }
                    if done {
                        return None;
                    }
                    match data.next().await {
                        Some(Ok(raw)) => match serde_json::from_str::<Value>(&raw) {
                            Ok(event) => read_stream_event(&event, &mut state, &mut pending),
                            Err(err) => {
                                done = true;
                                pending.push_back(Err(err.into()));
                            }
                        },
                        Some(Err(err)) => {
                            done = true;
                            pending.push_back(Err(err));
                        }
                        None => {
                            done = true;
                            state.finish(&mut pending);
                        }
                    }
                }
            },
        );
        Ok(Box::pin(chunks))
    }
}

/// Streams can carry an in-band `error` object instead of candidates.
fn read_stream_event(
    event: &Value,
    state: &mut genai::StreamState,
    pending: &mut VecDeque<Result<StreamChunk>>,
) {
    match event.get("error") {
        Some(error) => pending.push_back(Err(DittoError::chat(
            ChatCompletionError::new(ErrorType::ProviderBizError).with_error(error.clone()),
        ))),
        None => state.push_event(event, pending),
    }
}

/// Maps a Vertex HTTP failure onto the client-facing error kinds. Errors that
/// are not upstream HTTP failures pass through untouched.
pub fn classify_api_error(err: DittoError) -> DittoError {
    let DittoError::Api { status, body } = err else {
        return err;
    };

    let parsed = serde_json::from_str::<Value>(&body).ok();
    // Vertex wraps streaming errors in a one-element array.
    let google_error = parsed
        .as_ref()
        .map(|value| match value {
            Value::Array(items) => items.first().unwrap_or(value),
            other => other,
        })
        .and_then(|value| value.get("error"))
        .filter(|error| error.is_object());

    let message = google_error
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(body.as_str());

    let mut detail = serde_json::Map::new();
    detail.insert("message".to_string(), Value::String(message.to_string()));
    for key in ["status", "code"] {
        if let Some(value) = google_error.and_then(|error| error.get(key)) {
            detail.insert(key.to_string(), value.clone());
        }
    }

    let lowered = message.to_ascii_lowercase();
    let error_type = if lowered.contains("location is not supported")
        || lowered.contains("not supported in your location")
    {
        ErrorType::LocationNotSupportError
    } else if status.as_u16() == 401 || message.contains("API key not valid") {
        ErrorType::InvalidProviderApiKey
    } else if status.as_u16() == 403 {
        ErrorType::PermissionDenied
    } else if status.as_u16() == 429 {
        ErrorType::QuotaLimitReached
    } else {
        ErrorType::ProviderBizError
    };

    DittoError::chat(
        ChatCompletionError::new(error_type)
            .with_error(Value::Object(detail))
            .with_extra("status", json!(status.as_u16())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, body: &str) -> DittoError {
        DittoError::Api {
            status: reqwest::StatusCode::from_u16(status).expect("status"),
            body: body.to_string(),
        }
    }

    fn kind(err: &DittoError) -> Option<ErrorType> {
        err.error_type()
    }

    #[test]
    fn classifies_google_errors() {
        let unauthenticated = classify_api_error(api(
            401,
            r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","status":"UNAUTHENTICATED"}}"#,
        ));
        assert_eq!(kind(&unauthenticated), Some(ErrorType::InvalidProviderApiKey));

        let bad_key = classify_api_error(api(
            400,
            r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#,
        ));
        assert_eq!(kind(&bad_key), Some(ErrorType::InvalidProviderApiKey));

        let denied = classify_api_error(api(
            403,
            r#"[{"error":{"code":403,"message":"Permission denied on resource project demo.","status":"PERMISSION_DENIED"}}]"#,
        ));
        assert_eq!(kind(&denied), Some(ErrorType::PermissionDenied));

        let location = classify_api_error(api(
            400,
            r#"{"error":{"code":400,"message":"User location is not supported for the API use.","status":"FAILED_PRECONDITION"}}"#,
        ));
        assert_eq!(kind(&location), Some(ErrorType::LocationNotSupportError));

        let quota = classify_api_error(api(429, r#"{"error":{"code":429,"message":"Quota exceeded"}}"#));
        assert_eq!(kind(&quota), Some(ErrorType::QuotaLimitReached));
    }

    #[test]
    fn unknown_failures_are_provider_business_errors_with_status() {
        let err = classify_api_error(api(500, "upstream exploded"));
        let DittoError::Chat(chat) = &err else {
            panic!("expected chat error, got {err:?}");
        };
        assert_eq!(chat.error_type, ErrorType::ProviderBizError);
        assert_eq!(chat.error, Some(json!({ "message": "upstream exploded" })));
        assert_eq!(chat.extra.get("status"), Some(&json!(500)));
    }

    #[test]
    fn non_api_errors_pass_through() {
        let err = classify_api_error(DittoError::InvalidResponse("boom".to_string()));
        assert!(matches!(err, DittoError::InvalidResponse(_)));
    }

    #[test]
    fn init_derives_endpoint_from_project_and_location() -> Result<()> {
        let client = Vertex::init_from_vertexai(VertexInit {
            project: Some("demo".to_string()),
            location: Some("europe-west4".to_string()),
            ..VertexInit::default()
        })?;
        assert_eq!(
            client.base_url(),
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/demo/locations/europe-west4/publishers/google/models"
        );

        let global = Vertex::init_from_vertexai(VertexInit {
            project: Some("demo".to_string()),
            location: Some("global".to_string()),
            ..VertexInit::default()
        })?;
        assert!(global.base_url().starts_with("https://aiplatform.googleapis.com/v1/"));
        Ok(())
    }

    #[test]
    fn init_falls_back_to_credentials_project_and_default_location() -> Result<()> {
        let client = Vertex::init_from_vertexai(VertexInit {
            credentials: Some(json!({
                "type": "authorized_user",
                "client_id": "c",
                "client_secret": "s",
                "refresh_token": "r",
                "quota_project_id": "from-credentials"
            })),
            ..VertexInit::default()
        })?;
        assert_eq!(client.project(), "from-credentials");
        assert_eq!(client.location(), DEFAULT_LOCATION);
        Ok(())
    }

    fn demo_client() -> Result<Vertex> {
        Vertex::init_from_vertexai(VertexInit {
            project: Some("mine".to_string()),
            ..VertexInit::default()
        })
    }

    fn request_for(model: &str) -> GenerateRequest {
        GenerateRequest {
            model: Some(model.to_string()),
            ..GenerateRequest::default()
        }
    }

    #[test]
    fn model_ids_that_leave_the_models_path_are_rejected() -> Result<()> {
        let client = demo_client()?;
        for model in [
            "../../../../../../v1/projects/victim/locations/us-central1/endpoints/e:predict?x=",
            "models/../../victim",
            "gemini-1.5-pro/../x",
            "gemini?alt=json",
            "gemini#frag",
            "gemini%2F..",
            "models/models/gemini",
            "gemini pro",
        ] {
            let err = client.resolve_model(&request_for(model)).unwrap_err();
            assert_eq!(err.error_type(), Some(ErrorType::ProviderBizError), "{model}");
        }
        Ok(())
    }

    #[test]
    fn method_url_stays_under_the_project_models_path() -> Result<()> {
        let client = demo_client()?;
        let request = request_for("models/gemini-1.5-flash");
        let model = client.resolve_model(&request)?;
        assert_eq!(model, "gemini-1.5-flash");

        let url = client.method_url(model, "streamGenerateContent", Some("sse"))?;
        assert_eq!(
            url.as_str(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/mine/locations/us-central1/publishers/google/models/gemini-1.5-flash:streamGenerateContent?alt=sse"
        );

        // Even unchecked input is encoded into a single segment.
        let url = client.method_url("../x?y", "generateContent", None)?;
        assert!(url.path().starts_with("/v1/projects/mine/"), "{url}");
        assert_eq!(url.query(), None);
        Ok(())
    }

    #[test]
    fn init_without_project_is_a_credentials_error() {
        let err = Vertex::init_from_vertexai(VertexInit::default()).unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::InvalidVertexCredentials));
    }
}
