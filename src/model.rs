use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::types::{GenerateRequest, GenerateResponse, StreamChunk};

pub type StreamResult = BoxStream<'static, Result<StreamChunk>>;

/// A chat model reachable over some provider API.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider identifier used for logging and error tagging.
    fn provider(&self) -> &str;
    fn model_id(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Opens a streaming generation. Errors before the first byte are returned
    /// directly; later failures arrive as `Err` items on the stream.
    async fn stream(&self, request: GenerateRequest) -> Result<StreamResult>;
}
