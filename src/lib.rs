pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod model;
mod profile;
pub mod providers;
pub mod runtime;
pub mod stream;
pub mod trace;
pub mod types;
pub mod utils;

#[cfg(feature = "gateway")]
pub mod gateway;

pub use config::{GatewaySettings, LlmConfig};
pub use error::{ChatCompletionError, DittoError, ErrorType, Result};
pub use model::{LanguageModel, StreamResult};
pub use profile::{Env, parse_dotenv};
pub use providers::{VERTEXAI, Vertex, VertexInit};
pub use runtime::{AgentRuntime, ChatOptions, ChatResponse, ChatRuntime, RuntimeFactory};
pub use types::{
    ChatStreamPayload, ContentPart, FinishReason, GenerateRequest, GenerateResponse, Message,
    Role, StreamChunk, Tool, ToolChoice, Usage, Warning,
};
