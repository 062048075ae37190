pub(crate) mod http;
pub(crate) mod params;
pub mod sse;
pub(crate) mod streaming;

#[doc(hidden)]
pub mod test_support;
