use ditto_vertex_route::{
    ErrorType, FinishReason, GenerateRequest, LanguageModel, Message, Vertex, VertexInit,
};
use httpmock::{Method::POST, MockServer};
use serde_json::json;

fn authorized_user(token_uri: String) -> serde_json::Value {
    json!({
        "type": "authorized_user",
        "client_id": "client-a",
        "client_secret": "secret-a",
        "refresh_token": "refresh-a",
        "token_uri": token_uri,
    })
}

fn client(server: &MockServer) -> ditto_vertex_route::Result<Vertex> {
    Ok(Vertex::init_from_vertexai(VertexInit {
        project: Some("demo".to_string()),
        location: Some("us-east5".to_string()),
        credentials: Some(authorized_user(server.url("/token"))),
        base_url: Some(server.url("/v1/models")),
        metadata_host: None,
    })?
    .with_model("gemini-1.5-pro"))
}

async fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .body_includes("grant_type=refresh_token")
                .body_includes("client_id=client-a")
                .body_includes("refresh_token=refresh-a");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-abc","token_type":"Bearer","expires_in":3599}"#);
        })
        .await
}

#[tokio::test]
async fn vertex_generate_maps_request_and_response() -> ditto_vertex_route::Result<()> {
    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let token_mock = mock_token(&server).await;
    let generate_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/models/gemini-1.5-pro:generateContent")
                .header("authorization", "Bearer token-abc")
                .body_includes("\"systemInstruction\"")
                .body_includes("\"maxOutputTokens\":64")
                .body_includes("\"labels\":{\"user\":\"user-1\"}");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    json!({
                        "candidates": [{
                            "content": { "role": "model", "parts": [{ "text": "Bonjour" }] },
                            "finishReason": "STOP"
                        }],
                        "usageMetadata": {
                            "promptTokenCount": 4,
                            "candidatesTokenCount": 2,
                            "totalTokenCount": 6
                        }
                    })
                    .to_string(),
                );
        })
        .await;

    let mut request = GenerateRequest::from(vec![
        Message::system("answer in French"),
        Message::user("hello"),
    ]);
    request.max_tokens = Some(64);
    request.user = Some("User-1".to_string());

    let response = client(&server)?.generate(request).await?;
    token_mock.assert_async().await;
    generate_mock.assert_async().await;

    assert_eq!(response.text(), "Bonjour");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.total_tokens, Some(6));
    Ok(())
}

#[tokio::test]
async fn vertex_generate_classifies_quota_errors() -> ditto_vertex_route::Result<()> {
    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let _token_mock = mock_token(&server).await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/models/gemini-1.5-pro:generateContent");
            then.status(429)
                .header("content-type", "application/json")
                .body(
                    r#"{"error":{"code":429,"message":"Resource exhausted.","status":"RESOURCE_EXHAUSTED"}}"#,
                );
        })
        .await;

    let err = client(&server)?
        .generate(GenerateRequest::from(vec![Message::user("hi")]))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), Some(ErrorType::QuotaLimitReached));
    let ditto_vertex_route::DittoError::Chat(chat) = err else {
        panic!("expected a chat error");
    };
    assert_eq!(
        chat.error,
        Some(json!({ "message": "Resource exhausted.", "status": "RESOURCE_EXHAUSTED", "code": 429 }))
    );
    assert_eq!(chat.extra.get("status"), Some(&json!(429)));
    Ok(())
}

#[tokio::test]
async fn rejected_refresh_token_is_a_credentials_error() -> ditto_vertex_route::Result<()> {
    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(400)
                .header("content-type", "application/json")
                .body(r#"{"error":"invalid_grant"}"#);
        })
        .await;
    let generate_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/models/gemini-1.5-pro:generateContent");
            then.status(200).body("{}");
        })
        .await;

    let err = client(&server)?
        .generate(GenerateRequest::from(vec![Message::user("hi")]))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), Some(ErrorType::InvalidVertexCredentials));
    assert!(err.to_string().contains("invalid_grant"));
    generate_mock.assert_calls_async(0).await;
    Ok(())
}

#[test]
fn missing_project_is_rejected_up_front() {
    let err = Vertex::init_from_vertexai(VertexInit::default()).unwrap_err();
    assert_eq!(err.error_type(), Some(ErrorType::InvalidVertexCredentials));
}

#[tokio::test]
async fn runtime_factory_sends_every_request_through_its_shared_client()
-> ditto_vertex_route::Result<()> {
    use ditto_vertex_route::runtime::{
        ChatBody, ChatOptions, ChatRuntime, RuntimeFactory, VertexRuntimeFactory,
    };
    use ditto_vertex_route::{ChatStreamPayload, DittoError};

    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/token").header("x-pool", "shared");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-abc","token_type":"Bearer","expires_in":3599}"#);
        })
        .await;
    let generate_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/models/gemini-1.5-pro:generateContent")
                .header("x-pool", "shared");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    json!({
                        "candidates": [{
                            "content": { "role": "model", "parts": [{ "text": "ok" }] },
                            "finishReason": "STOP"
                        }]
                    })
                    .to_string(),
                );
        })
        .await;

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("x-pool", reqwest::header::HeaderValue::from_static("shared"));
    let http = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(DittoError::Http)?;
    let factory = VertexRuntimeFactory::with_http_client(http);

    for _ in 0..2 {
        let runtime = factory.init(VertexInit {
            project: Some("demo".to_string()),
            credentials: Some(authorized_user(server.url("/token"))),
            base_url: Some(server.url("/v1/models")),
            ..VertexInit::default()
        })?;
        let payload: ChatStreamPayload = serde_json::from_value(json!({
            "model": "gemini-1.5-pro",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": false
        }))?;
        let response = runtime
            .chat(
                payload,
                ChatOptions {
                    user: "user-1".to_string(),
                    trace: None,
                },
            )
            .await?;
        assert!(matches!(response.body, ChatBody::Json(_)));
    }

    token_mock.assert_calls_async(2).await;
    generate_mock.assert_calls_async(2).await;
    Ok(())
}
