//! Local Paths
//!
//! Projects a blob address onto the storage root. Content lives under
//! `<root>/entries/<site>/<store>/<key...>`, the JSON sidecar under
//! `<root>/metadata/<site>/<store>/<key...>`.
//!
//! Every segment is percent-encoded so the mapping is injective and can be
//! reversed when listing. Bytes outside `[A-Za-z0-9-_.~]` are escaped and
//! a leading `.` is always escaped, so no encoded segment is ever `.` or
//! `..`, and no encoded name collides with the hidden temp files written
//! next to blobs.

use std::path::{Component, Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::BlobAddress;
use crate::error::{Error, Result};

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Longest encoded file name accepted for one segment. NAME_MAX is 255 on
/// common filesystems and the temp file adds `.` + `.tmp.` + a UUID.
pub const MAX_ENCODED_SEGMENT: usize = 200;

const ENTRIES_DIR: &str = "entries";
const METADATA_DIR: &str = "metadata";

/// Encode one logical path segment into a file name
pub fn encode_segment(segment: &str) -> String {
    let encoded = utf8_percent_encode(segment, SEGMENT).to_string();
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded,
    }
}

/// Reverse of [`encode_segment`]
pub fn decode_segment(name: &str) -> Option<String> {
    percent_decode_str(name)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

/// Encode a `/`-separated key, segment by segment
pub fn encode_key(key: &str) -> String {
    key.split('/').map(encode_segment).collect::<Vec<_>>().join("/")
}

/// Relative filesystem path of a key inside a store directory
pub fn key_path(key: &str) -> PathBuf {
    key.split('/').map(encode_segment).collect()
}

/// Rebuild the logical key from a path relative to a store directory.
///
/// Returns `None` for anything an encoded key cannot produce, such as
/// hidden files or non UTF-8 names.
pub fn key_from_relative(relative: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return None;
        };
        let name = name.to_str()?;
        if name.is_empty() || name.starts_with('.') {
            return None;
        }
        segments.push(decode_segment(name)?);
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn check_length(encoded: &str, what: &str) -> Result<()> {
    if encoded.len() > MAX_ENCODED_SEGMENT {
        return Err(Error::InvalidRequest(format!(
            "{} segment is too long ({} bytes encoded, limit {})",
            what,
            encoded.len(),
            MAX_ENCODED_SEGMENT
        )));
    }
    Ok(())
}

/// Reject site or store names whose directory name the filesystem cannot hold
pub fn check_store_names(site_id: &str, store_name: &str) -> Result<()> {
    check_length(&encode_segment(site_id), "site id")?;
    check_length(&encode_segment(store_name), "store name")
}

/// Content and sidecar locations for one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    /// Raw blob bytes
    pub data_path: PathBuf,
    /// JSON sidecar
    pub metadata_path: PathBuf,
    /// Content directory of the blob's store
    pub store_root: PathBuf,
}

impl LocalPaths {
    /// Resolve the paths of a keyed address
    pub fn for_address(root: &Path, address: &BlobAddress) -> Result<Self> {
        if address.key.is_empty() {
            return Err(Error::InvalidRequest("missing blob key".into()));
        }
        check_store_names(&address.site_id, &address.store_name)?;
        for segment in address.key.split('/') {
            check_length(&encode_segment(segment), "blob key")?;
        }

        let store_root = entries_dir(root, &address.site_id, &address.store_name);
        let relative = key_path(&address.key);
        Ok(Self {
            data_path: store_root.join(&relative),
            metadata_path: metadata_dir(root, &address.site_id, &address.store_name).join(&relative),
            store_root,
        })
    }
}

/// Content directory of a store
pub fn entries_dir(root: &Path, site_id: &str, store_name: &str) -> PathBuf {
    root.join(ENTRIES_DIR)
        .join(encode_segment(site_id))
        .join(encode_segment(store_name))
}

/// Sidecar directory of a store
pub fn metadata_dir(root: &Path, site_id: &str, store_name: &str) -> PathBuf {
    root.join(METADATA_DIR)
        .join(encode_segment(site_id))
        .join(encode_segment(store_name))
}
