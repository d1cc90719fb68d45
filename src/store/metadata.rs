//! Sidecar metadata
//!
//! Each blob has a small JSON record next to it describing its content
//! type, ETag and user-supplied tags. Clients exchange the tags through
//! the `x-blob-metadata` header, either as a raw JSON object or as
//! `b64;<base64 JSON>`.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Header carrying user metadata
pub const METADATA_HEADER: &str = "x-blob-metadata";

const BASE64_PREFIX: &str = "b64;";

/// Sidecar record stored next to every blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BlobMetadata {
    pub fn new(content_type: Option<String>, metadata: Map<String, Value>) -> Self {
        Self {
            content_type,
            etag: None,
            metadata,
        }
    }
}

/// Quoted hex SHA-256 of the blob content
pub fn compute_etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(data)))
}

/// Parse the user metadata header
pub fn decode_metadata_header(value: &str) -> Result<Map<String, Value>> {
    let json = match value.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::InvalidMetadata(format!("invalid base64: {}", e)))?;
            String::from_utf8(bytes)
                .map_err(|_| Error::InvalidMetadata("metadata is not valid UTF-8".into()))?
        }
        None => value.to_string(),
    };

    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::InvalidMetadata("metadata must be a JSON object".into())),
        Err(e) => Err(Error::InvalidMetadata(format!("invalid JSON: {}", e))),
    }
}

/// Render user metadata for the response header
pub fn encode_metadata_header(metadata: &Map<String, Value>) -> String {
    let json = Value::Object(metadata.clone()).to_string();
    format!("{}{}", BASE64_PREFIX, STANDARD.encode(json))
}
