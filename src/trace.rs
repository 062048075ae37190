//! Per-request trace metadata supplied by the caller, and the sink that
//! records traced calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stream::StreamSummary;
use crate::types::ChatStreamPayload;

/// Request header carrying a base64 JSON [`TracePayload`].
pub const TRACE_HEADER: &str = "x-ditto-trace";
pub const TRACE_ID_HEADER: &str = "x-ditto-trace-id";
pub const OBSERVATION_ID_HEADER: &str = "x-ditto-observation-id";

const DEFAULT_TRACE_NAME: &str = "Chat Completion";

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracePayload {
    pub enabled: bool,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
    pub trace_id: Option<String>,
    pub trace_name: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
}

impl TracePayload {
    /// Decodes a header value. Malformed values are logged and treated as
    /// absent so a bad trace header never fails the request.
    pub fn from_header_value(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let decoded = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')));
        let parsed = decoded
            .map_err(|err| err.to_string())
            .and_then(|bytes| serde_json::from_slice::<Self>(&bytes).map_err(|err| err.to_string()));
        match parsed {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!(header = TRACE_HEADER, error = %err, "ignoring malformed trace header");
                None
            }
        }
    }

    pub fn to_header_value(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Trace attached to one chat call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceOptions {
    pub trace_id: String,
    pub observation_id: String,
    pub provider: String,
    pub name: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Builds provider-tagged trace options from the request and its trace
/// payload. The caller-supplied trace id is reused; otherwise a fresh one is
/// generated.
pub fn create_trace_options(
    payload: &ChatStreamPayload,
    provider: &str,
    trace: &TracePayload,
) -> TraceOptions {
    let mut tags = Vec::<String>::new();
    for tag in trace
        .tags
        .iter()
        .map(String::as_str)
        .chain([provider, payload.model.as_str()])
    {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }

    let mut metadata = Map::new();
    metadata.insert("provider".to_string(), Value::from(provider));
    metadata.insert("model".to_string(), Value::from(payload.model.as_str()));
    metadata.insert("stream".to_string(), Value::from(payload.is_stream()));
    if let Some(topic_id) = trace.topic_id.as_deref() {
        metadata.insert("topicId".to_string(), Value::from(topic_id));
    }

    TraceOptions {
        trace_id: trace
            .trace_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(random_id),
        observation_id: random_id(),
        provider: provider.to_string(),
        name: trace
            .trace_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TRACE_NAME.to_string()),
        session_id: trace.session_id.clone(),
        user_id: trace.user_id.clone(),
        tags,
        metadata,
    }
}

/// 128-bit random hex id, falling back to a time+sequence id when the OS
/// RNG is unavailable.
fn random_id() -> String {
    let mut bytes = [0u8; 16];
    match getrandom::fill(&mut bytes) {
        Ok(()) => hex_encode(&bytes),
        Err(err) => {
            tracing::debug!(error = %err, "os rng unavailable; using sequential trace id");
            let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
            let ts_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or(0);
            format!("ditto-{ts_ms}-{seq}")
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[usize::from(byte >> 4)] as char);
        out.push(HEX[usize::from(byte & 0x0f)] as char);
    }
    out
}

/// Receives traced chat calls.
pub trait TraceSink: Send + Sync {
    fn on_start(&self, trace: &TraceOptions, model: &str);
    fn on_complete(&self, trace: &TraceOptions, summary: &StreamSummary);
    fn on_error(&self, trace: &TraceOptions, error: &str);
}

/// Writes traced calls as structured `tracing` events under the
/// `ditto::trace` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn on_start(&self, trace: &TraceOptions, model: &str) {
        tracing::info!(
            target: "ditto::trace",
            trace_id = %trace.trace_id,
            observation_id = %trace.observation_id,
            provider = %trace.provider,
            name = %trace.name,
            session_id = ?trace.session_id,
            user_id = ?trace.user_id,
            tags = ?trace.tags,
            model,
            "generation started"
        );
    }

    fn on_complete(&self, trace: &TraceOptions, summary: &StreamSummary) {
        let usage = summary.usage.clone().unwrap_or_default();
        tracing::info!(
            target: "ditto::trace",
            trace_id = %trace.trace_id,
            observation_id = %trace.observation_id,
            provider = %trace.provider,
            output_chars = summary.text.chars().count(),
            tool_calls = summary.tool_calls,
            finish_reason = ?summary.finish_reason,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            total_tokens = ?usage.total_tokens,
            "generation completed"
        );
    }

    fn on_error(&self, trace: &TraceOptions, error: &str) {
        tracing::warn!(
            target: "ditto::trace",
            trace_id = %trace.trace_id,
            observation_id = %trace.observation_id,
            provider = %trace.provider,
            error,
            "generation failed"
        );
    }
}
