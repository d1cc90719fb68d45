//! LocalBlobs - Local Blob Storage Emulation Server
//!
//! An HTTP server that emulates a hosted blob store on the local
//! filesystem, for development and tests that would otherwise talk to the
//! real service.
//!
//! # Architecture
//!
//! Every request flows through the same pipeline: the path is resolved to
//! a blob address, the auth guard accepts or rejects it, the observer is
//! notified, and the operation either runs against the filesystem store or
//! is answered with a signed URL that authorizes it later.
//!
//! # Features
//!
//! - Current (`/api/v1/blobs/...`) and legacy (`/api/v1/sites/...`) URL schemes
//! - Bearer secret kept only as a keyed hash
//! - Signed URLs scoped to one operation on one blob
//! - Atomic temp-file-plus-rename writes with sidecar metadata
//! - Store listing with prefix and directory grouping

pub mod address;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod store;

pub use config::LocalBlobsConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::address::BlobAddress;
    pub use crate::config::{LocalBlobsConfig, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::events::{Operation, RequestEvent, RequestObserver};
    pub use crate::server::{AddressFamily, BlobsServer, ServerInfo};
    pub use crate::store::BlobStore;
}
