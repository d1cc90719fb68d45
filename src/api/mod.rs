//! HTTP API Module
//!
//! Routes blob requests to the store behind the auth guard.

mod http;

pub use http::{create_router, AppState, SignedUrlResponse, SIGNED_URL_ACCEPT};
