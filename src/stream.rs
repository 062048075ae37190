//! Client-facing SSE framing of a model stream.
//!
//! Every frame is `data: <json>\n\n` where the JSON is a [`ChatStreamEvent`].
//! A `done` event always closes the stream; an upstream failure is reported
//! as one `error` event followed by `done`.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::StreamResult;
use crate::types::{FinishReason, StreamChunk, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Chunk { chunk: StreamChunk },
    Error { message: String },
    Done,
}

pub fn encode_sse_frame(event: &ChatStreamEvent) -> io::Result<Bytes> {
    let json = serde_json::to_vec(event).map_err(io::Error::other)?;
    let mut frame = BytesMut::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(&json);
    frame.extend_from_slice(b"\n\n");
    Ok(frame.freeze())
}

/// Frames a model stream as SSE bytes suitable for an HTTP response body.
pub fn chat_sse(inner: StreamResult) -> BoxStream<'static, io::Result<Bytes>> {
    stream::unfold(
        (inner, VecDeque::<io::Result<Bytes>>::new(), false),
        |(mut inner, mut frames, mut finished)| async move {
            loop {
                if let Some(frame) = frames.pop_front() {
                    return Some((frame, (inner, frames, finished)));
                }
                if finished {
                    return None;
                }
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        let frame = encode_sse_frame(&ChatStreamEvent::Chunk { chunk });
                        finished = frame.is_err();
                        frames.push_back(frame);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "model stream failed mid-response");
                        frames.push_back(encode_sse_frame(&ChatStreamEvent::Error {
                            message: err.to_string(),
                        }));
                        frames.push_back(encode_sse_frame(&ChatStreamEvent::Done));
                        finished = true;
                    }
                    None => {
                        frames.push_back(encode_sse_frame(&ChatStreamEvent::Done));
                        finished = true;
                    }
                }
            }
        },
    )
    .boxed()
}

/// Running totals of a model stream, reported once the stream ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: usize,
}

impl StreamSummary {
    pub fn observe(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { text } => self.text.push_str(text),
            StreamChunk::ToolCallStart { .. } => self.tool_calls += 1,
            StreamChunk::Usage(usage) => self.usage = Some(usage.clone()),
            StreamChunk::FinishReason { finish_reason } => {
                self.finish_reason = Some(*finish_reason)
            }
            StreamChunk::Warnings { .. } | StreamChunk::ToolCallDelta { .. } => {}
        }
    }
}
