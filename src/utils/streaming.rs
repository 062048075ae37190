use std::collections::VecDeque;

use futures_util::stream::BoxStream;

use crate::Result;
use crate::types::{StreamChunk, Warning};

/// Opens the SSE data stream of an upstream response and seeds the pending
/// chunk queue with request-time warnings, which are always emitted first.
pub(crate) fn open_sse_with_warnings(
    response: reqwest::Response,
    warnings: Vec<Warning>,
) -> (
    BoxStream<'static, Result<String>>,
    VecDeque<Result<StreamChunk>>,
) {
    let mut pending = VecDeque::new();
    if !warnings.is_empty() {
        pending.push_back(Ok(StreamChunk::Warnings { warnings }));
    }
    (crate::utils::sse::data_stream_from_response(response), pending)
}
