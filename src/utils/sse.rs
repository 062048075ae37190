//! Bounded reader for upstream `text/event-stream` bodies.
//!
//! Only `data:` fields are surfaced; multi-line data is joined with `\n` and
//! a literal `[DONE]` payload ends the stream.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{DittoError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

struct SseReader<R> {
    reader: R,
    line: Vec<u8>,
    event: String,
    limits: SseLimits,
}

impl<R: AsyncBufRead + Unpin> SseReader<R> {
    fn new(reader: R, limits: SseLimits) -> Self {
        Self {
            reader,
            line: Vec::new(),
            event: String::new(),
            limits,
        }
    }

    /// Fills `self.line` with the next line including its terminator.
    /// Returns `false` at end of input with nothing buffered.
    async fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        loop {
            let available = self.reader.fill_buf().await.map_err(|err| {
                DittoError::InvalidResponse(format!("failed to read SSE line: {err}"))
            })?;
            if available.is_empty() {
                return Ok(!self.line.is_empty());
            }

            let newline = available.iter().position(|byte| *byte == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);
            if self.line.len() + take > self.limits.max_line_bytes {
                return Err(DittoError::InvalidResponse(format!(
                    "SSE line exceeds max_line_bytes={}",
                    self.limits.max_line_bytes
                )));
            }
            self.line.extend_from_slice(&available[..take]);
            self.reader.consume(take);

            if newline.is_some() {
                return Ok(true);
            }
        }
    }

    fn push_data(&mut self, data: &str) -> Result<()> {
        let separator = usize::from(!self.event.is_empty());
        if self.event.len() + separator + data.len() > self.limits.max_event_bytes {
            return Err(DittoError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                self.limits.max_event_bytes
            )));
        }
        if separator == 1 {
            self.event.push('\n');
        }
        self.event.push_str(data);
        Ok(())
    }

    async fn next_data(&mut self) -> Result<Option<String>> {
        if self.limits.max_line_bytes == 0 || self.limits.max_event_bytes == 0 {
            return Err(DittoError::InvalidResponse(
                "SSE limits must be greater than zero".to_string(),
            ));
        }
        self.event.clear();

        loop {
            if !self.read_line().await? {
                let tail = std::mem::take(&mut self.event);
                return Ok((!tail.is_empty()).then_some(tail));
            }

            let line = std::str::from_utf8(&self.line)
                .map_err(|err| DittoError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?
                .trim_end_matches(['\r', '\n'])
                .to_string();

            if line.is_empty() {
                match self.event.as_str() {
                    "" => continue,
                    "[DONE]" => return Ok(None),
                    _ => return Ok(Some(std::mem::take(&mut self.event))),
                }
            }

            if let Some(data) = line.strip_prefix("data:") {
                self.push_data(data.trim_start())?;
            }
        }
    }
}

pub fn data_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        SseReader::new(reader, limits),
        |mut sse| async move {
            let next = sse.next_data().await?;
            Ok::<_, DittoError>(next.map(|data| (data, sse)))
        },
    ))
}

pub fn data_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    data_stream_from_reader_with_limits(reader, SseLimits::default())
}

pub fn data_stream_from_response(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    data_stream_from_reader(tokio::io::BufReader::new(StreamReader::new(bytes)))
}
