use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{DittoError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Reads at most `limit` bytes of an error body so a misbehaving upstream
/// cannot make us buffer an unbounded payload.
pub(crate) async fn read_error_body(response: reqwest::Response, limit: usize) -> String {
    let limit = limit.max(1);
    let mut collected = Vec::<u8>::with_capacity(limit.min(4096));
    let mut cut = false;

    let mut chunks = response.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = limit - collected.len();
        if chunk.len() > room {
            collected.extend_from_slice(&chunk[..room]);
            cut = true;
            break;
        }
        collected.extend_from_slice(&chunk);
        if collected.len() == limit {
            cut = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&collected).into_owned();
    if cut {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Sends the request and turns any non-2xx status into [`DittoError::Api`].
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_error_body(response, MAX_ERROR_BODY_BYTES).await;
    Err(DittoError::Api { status, body })
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    Ok(response.json::<T>().await?)
}
