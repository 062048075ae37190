mod genai;
pub mod vertex;

pub use vertex::{PROVIDER as VERTEXAI, Vertex, VertexInit, classify_api_error, default_http_client};
