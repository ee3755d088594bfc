//! HTTP surface of the media proxy
//!
//! Routes, auth, error mapping and streaming responses. All transformation
//! logic lives in `streamgate-proxy`; all policy in `streamgate-core`.

pub mod http;

pub use http::{create_router, AppState};
