//! The chat runtime called by the route handler, and the factory that binds
//! one to a Vertex project per request.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use crate::model::{LanguageModel, StreamResult};
use crate::providers::{Vertex, VertexInit, default_http_client};
use crate::stream::{StreamSummary, chat_sse};
use crate::trace::{LogTraceSink, OBSERVATION_ID_HEADER, TRACE_ID_HEADER, TraceOptions, TraceSink};
use crate::types::ChatStreamPayload;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Verified id of the calling user.
    pub user: String,
    pub trace: Option<TraceOptions>,
}

pub enum ChatBody {
    /// Lazily produced SSE bytes; consumed once by the HTTP response.
    Stream(BoxStream<'static, io::Result<Bytes>>),
    Json(Value),
}

impl std::fmt::Debug for ChatBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("ChatBody::Stream(..)"),
            Self::Json(value) => f.debug_tuple("ChatBody::Json").field(value).finish(),
        }
    }
}

#[derive(Debug)]
pub struct ChatResponse {
    pub headers: BTreeMap<String, String>,
    pub body: ChatBody,
}

impl ChatResponse {
    pub fn stream(body: BoxStream<'static, io::Result<Bytes>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: ChatBody::Stream(body),
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: ChatBody::Json(value),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
pub trait ChatRuntime: Send + Sync {
    async fn chat(&self, payload: ChatStreamPayload, options: ChatOptions) -> Result<ChatResponse>;
}

/// Binds a [`ChatRuntime`] to the Vertex settings of one request.
pub trait RuntimeFactory: Send + Sync {
    fn init(&self, init: VertexInit) -> Result<Arc<dyn ChatRuntime>>;
}

/// Runs chat payloads against any [`LanguageModel`].
pub struct AgentRuntime<M> {
    model: M,
    sink: Arc<dyn TraceSink>,
}

impl<M: LanguageModel> AgentRuntime<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            sink: Arc::new(LogTraceSink),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

#[async_trait]
impl<M: LanguageModel + 'static> ChatRuntime for AgentRuntime<M> {
    async fn chat(&self, payload: ChatStreamPayload, options: ChatOptions) -> Result<ChatResponse> {
        let mut request = payload.to_generate_request()?;
        if !options.user.trim().is_empty() {
            request.user = Some(options.user.clone());
        }

        let trace = options.trace;
        if let Some(trace) = trace.as_ref() {
            self.sink.on_start(trace, &payload.model);
        }

        let response = if payload.is_stream() {
            self.stream_response(request, trace.clone()).await
        } else {
            self.json_response(&payload.model, request, trace.as_ref()).await
        };

        let response = match (response, trace.as_ref()) {
            (Err(err), Some(trace)) => {
                self.sink.on_error(trace, &err.to_string());
                return Err(err);
            }
            (response, _) => response?,
        };

        Ok(match trace {
            Some(trace) => response
                .with_header(TRACE_ID_HEADER, trace.trace_id)
                .with_header(OBSERVATION_ID_HEADER, trace.observation_id),
            None => response,
        })
    }
}

impl<M: LanguageModel> AgentRuntime<M> {
    async fn stream_response(
        &self,
        request: crate::types::GenerateRequest,
        trace: Option<TraceOptions>,
    ) -> Result<ChatResponse> {
        let chunks = self.model.stream(request).await?;
        let chunks = match trace {
            Some(trace) => report_stream(chunks, self.sink.clone(), trace),
            None => chunks,
        };
        Ok(ChatResponse::stream(chat_sse(chunks)))
    }

    async fn json_response(
        &self,
        model: &str,
        request: crate::types::GenerateRequest,
        trace: Option<&TraceOptions>,
    ) -> Result<ChatResponse> {
        let response = self.model.generate(request).await?;
        if let Some(trace) = trace {
            let summary = StreamSummary {
                text: response.text(),
                usage: Some(response.usage.clone()),
                finish_reason: Some(response.finish_reason),
                tool_calls: response
                    .content
                    .iter()
                    .filter(|part| matches!(part, crate::types::ContentPart::ToolCall { .. }))
                    .count(),
            };
            self.sink.on_complete(trace, &summary);
        }

        let mut body = serde_json::to_value(&response)?;
        if let Value::Object(map) = &mut body {
            map.insert("provider".to_string(), Value::from(self.model.provider()));
            map.insert("model".to_string(), Value::from(model));
            map.insert("text".to_string(), Value::from(response.text()));
        }
        Ok(ChatResponse::json(body))
    }
}

/// Passes chunks through untouched while reporting the finished stream to
/// the trace sink. A stream dropped by the client before it ends is not
/// reported.
fn report_stream(inner: StreamResult, sink: Arc<dyn TraceSink>, trace: TraceOptions) -> StreamResult {
    stream::unfold(
        (inner, StreamSummary::default(), sink, trace, false),
        |(mut inner, mut summary, sink, trace, finished)| async move {
            if finished {
                return None;
            }
            match inner.next().await {
                Some(Ok(chunk)) => {
                    summary.observe(&chunk);
                    Some((Ok(chunk), (inner, summary, sink, trace, false)))
                }
                Some(Err(err)) => {
                    sink.on_error(&trace, &err.to_string());
                    Some((Err(err), (inner, summary, sink, trace, true)))
                }
                None => {
                    sink.on_complete(&trace, &summary);
                    None
                }
            }
        },
    )
    .boxed()
}

/// Creates [`AgentRuntime`]s over the Vertex client. Every runtime shares the
/// factory's connection pool.
#[derive(Clone)]
pub struct VertexRuntimeFactory {
    http: reqwest::Client,
    sink: Arc<dyn TraceSink>,
}

impl VertexRuntimeFactory {
    pub fn new() -> Result<Self> {
        Ok(Self::with_http_client(default_http_client()?))
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self {
            http,
            sink: Arc::new(LogTraceSink),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl RuntimeFactory for VertexRuntimeFactory {
    fn init(&self, init: VertexInit) -> Result<Arc<dyn ChatRuntime>> {
        let client = Vertex::init_with_http_client(init, self.http.clone())?;
        tracing::debug!(
            project = client.project(),
            location = client.location(),
            "vertex runtime initialised"
        );
        Ok(Arc::new(
            AgentRuntime::new(client).with_trace_sink(self.sink.clone()),
        ))
    }
}
