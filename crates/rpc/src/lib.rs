//! HTTP binding of the file host.
//!
//! Handlers decode requests, run the synchronous core on the blocking pool and map
//! core errors onto status codes. Error bodies are always `{"error": "..."}`.

mod error;
mod server;

pub use error::ApiError;
pub use server::{build_router, start_server, AppState, Services, TlsFiles};
