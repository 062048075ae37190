#![cfg(feature = "streaming")]

use ditto_vertex_route::{
    FinishReason, GenerateRequest, LanguageModel, Message, StreamChunk, Vertex, VertexInit,
};
use futures_util::StreamExt;
use httpmock::{Method::POST, MockServer};
use serde_json::json;

const SSE: &str = concat!(
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hello\"}]}}]}\n\n",
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\" world\"}]}}]}\n\n",
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"add\",\"args\":{\"a\":1}}}]}}]}\n\n",
    "data: {\"candidates\":[{\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2,\"totalTokenCount\":3}}\n\n",
);

fn init(server: &MockServer) -> VertexInit {
    VertexInit {
        project: Some("demo".to_string()),
        location: None,
        credentials: Some(json!({
            "type": "authorized_user",
            "client_id": "client-a",
            "client_secret": "secret-a",
            "refresh_token": "refresh-a",
            "token_uri": server.url("/token"),
        })),
        base_url: Some(server.url("/v1/models")),
        metadata_host: None,
    }
}

async fn mock_upstream<'a>(server: &'a MockServer, body: &'static str) -> (httpmock::Mock<'a>, httpmock::Mock<'a>) {
    let token = server
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-abc","token_type":"Bearer"}"#);
        })
        .await;
    let stream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/models/gemini-1.5-flash:streamGenerateContent")
                .query_param("alt", "sse")
                .header("authorization", "Bearer token-abc")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;
    (token, stream)
}

#[tokio::test]
async fn vertex_stream_parses_sse_chunks() -> ditto_vertex_route::Result<()> {
    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let (token_mock, stream_mock) = mock_upstream(&server, SSE).await;

    let client = Vertex::init_from_vertexai(init(&server))?.with_model("gemini-1.5-flash");
    let mut stream = client
        .stream(GenerateRequest::from(vec![Message::user("hi")]))
        .await?;
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        chunks.push(item?);
    }

    token_mock.assert_async().await;
    stream_mock.assert_async().await;

    assert_eq!(
        chunks,
        vec![
            StreamChunk::TextDelta {
                text: "Hello".to_string()
            },
            StreamChunk::TextDelta {
                text: " world".to_string()
            },
            StreamChunk::ToolCallStart {
                id: "call_0".to_string(),
                name: "add".to_string()
            },
            StreamChunk::ToolCallDelta {
                id: "call_0".to_string(),
                arguments_delta: "{\"a\":1}".to_string()
            },
            StreamChunk::Usage(ditto_vertex_route::Usage {
                input_tokens: Some(1),
                output_tokens: Some(2),
                total_tokens: Some(3),
            }),
            StreamChunk::FinishReason {
                finish_reason: FinishReason::ToolCalls
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn in_band_stream_error_surfaces_as_provider_error() -> ditto_vertex_route::Result<()> {
    if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let _mocks = mock_upstream(
        &server,
        concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"par\"}]}}]}\n\n",
            "data: {\"error\":{\"code\":500,\"message\":\"backend hiccup\",\"status\":\"INTERNAL\"}}\n\n",
        ),
    )
    .await;

    let client = Vertex::init_from_vertexai(init(&server))?.with_model("gemini-1.5-flash");
    let items = client
        .stream(GenerateRequest::from(vec![Message::user("hi")]))
        .await?
        .collect::<Vec<_>>()
        .await;

    assert!(matches!(&items[0], Ok(StreamChunk::TextDelta { text }) if text == "par"));
    let err = items
        .iter()
        .find_map(|item| item.as_ref().err())
        .expect("stream error");
    assert_eq!(
        err.error_type(),
        Some(ditto_vertex_route::ErrorType::ProviderBizError)
    );
    Ok(())
}

#[cfg(feature = "gateway")]
mod through_route {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use ditto_vertex_route::config::{
        GatewaySettings, VERTEXAI_BASE_URL, VERTEXAI_CREDENTIALS, VERTEXAI_PROJECT,
    };
    use ditto_vertex_route::gateway::{GatewayState, VERTEXAI_CHAT_PATH, router};
    use ditto_vertex_route::runtime::VertexRuntimeFactory;
    use ditto_vertex_route::stream::ChatStreamEvent;
    use ditto_vertex_route::Env;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use tower::util::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn chat_route_streams_vertex_chunks_as_sse() -> Result<(), Box<dyn std::error::Error>> {
        if ditto_vertex_route::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }

        let server = MockServer::start_async().await;
        let (_token, stream_mock) = mock_upstream(&server, SSE).await;

        let credentials = init(&server).credentials.unwrap_or_default();
        let env = Env::default()
            .with_var(VERTEXAI_PROJECT, "demo")
            .with_var(VERTEXAI_CREDENTIALS, credentials.to_string())
            .with_var(VERTEXAI_BASE_URL, server.url("/v1/models"));
        let mut settings = GatewaySettings::default();
        settings.auth.secret = Some("e2e-secret".to_string());
        let state = GatewayState::new(env, &settings, Arc::new(VertexRuntimeFactory::new()?))?;

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &json!({ "userId": "user-9" }),
            &EncodingKey::from_secret(b"e2e-secret"),
        )?;
        let request = Request::builder()
            .method("POST")
            .uri(VERTEXAI_CHAT_PATH)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                json!({
                    "model": "gemini-1.5-flash",
                    "messages": [{ "role": "user", "content": "hi" }]
                })
                .to_string(),
            ))?;

        let response = router(state).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = String::from_utf8_lossy(&bytes).into_owned();
        stream_mock.assert_async().await;

        let events = body
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .map(serde_json::from_str::<ChatStreamEvent>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(events.last(), Some(&ChatStreamEvent::Done));
        let text = events
            .iter()
            .filter_map(|event| match event {
                ChatStreamEvent::Chunk {
                    chunk: StreamChunk::TextDelta { text },
                } => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(text, "Hello world");
        Ok(())
    }
}
