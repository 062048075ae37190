//! HTTP surface of the Vertex AI chat route (feature-gated).

pub mod auth;
pub mod error_response;
pub mod http;
mod logging;
#[cfg(feature = "gateway-otel")]
pub mod otel;

pub use auth::{AuthGate, CHAT_AUTH_HEADER, JwtPayload, require_auth};
pub use error_response::{ErrorBody, create_error_response};
pub use http::{ChatRouteError, GatewayState, VERTEXAI_CHAT_PATH, handle_vertexai_chat, router};
pub use logging::init_logging;
