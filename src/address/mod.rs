//! Path Resolver
//!
//! Turns a request path into a [`BlobAddress`]. Three shapes are
//! recognized, in this order:
//!
//! - current: `/[api/]v1/blobs/<site_id>/<store_name>[/<key...>]`
//! - legacy:  `/[api/]v1/sites/<site_id>[/blobs][/<key...>]`, store from
//!   the `context` query parameter or `production`
//! - signed:  `[/region:<r>]/<site_id>/<store_name>[/<key...>]`, the form
//!   handed out as signed URLs

mod paths;

pub use paths::{
    check_store_names, decode_segment, encode_key, encode_segment, entries_dir,
    key_from_relative, key_path, metadata_dir, LocalPaths, MAX_ENCODED_SEGMENT,
};

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};

/// Store used by the legacy scheme when no `context` is given
pub const LEGACY_DEFAULT_STORE: &str = "production";

const REGION_PREFIX: &str = "region:";

/// Logical identity of a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobAddress {
    /// Routing hint only, never part of the storage identity
    pub region: Option<String>,
    pub site_id: String,
    pub store_name: String,
    /// Empty for store-level (list) requests
    pub key: String,
}

impl BlobAddress {
    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Path of this address in the signed URL form
    pub fn signed_path(&self) -> String {
        let mut path = String::new();
        if let Some(region) = &self.region {
            path.push_str(&format!("/{}{}", REGION_PREFIX, encode_segment(region)));
        }
        path.push_str(&format!(
            "/{}/{}",
            encode_segment(&self.site_id),
            encode_segment(&self.store_name)
        ));
        if self.has_key() {
            path.push('/');
            path.push_str(&encode_key(&self.key));
        }
        path
    }
}

/// URL scheme a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Current,
    Legacy,
    Signed,
}

impl Scheme {
    /// Whether the request came in on one of the public API prefixes
    pub fn is_api(&self) -> bool {
        matches!(self, Scheme::Current | Scheme::Legacy)
    }
}

/// A resolved request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub scheme: Scheme,
    pub address: BlobAddress,
}

/// Resolve a raw (still percent-encoded) request path.
///
/// `context` is the legacy scheme's store override.
pub fn resolve(path: &str, context: Option<&str>) -> Result<RequestTarget> {
    let trimmed = path
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidRequest("request path must be absolute".into()))?;

    let (first, after_first) = next_segment(trimmed);
    let versioned = if first == "api" { after_first } else { trimmed };

    let (version, after_version) = next_segment(versioned);
    if version == "v1" {
        let (kind, rest) = next_segment(after_version);
        return match kind {
            "blobs" => resolve_current(rest),
            "sites" => resolve_legacy(rest, context),
            _ => Err(Error::InvalidRequest(format!("unknown API route: {}", path))),
        };
    }

    resolve_signed(trimmed)
}

fn resolve_current(rest: &str) -> Result<RequestTarget> {
    let (site_raw, after_site) = next_segment(rest);
    let (store_raw, key_raw) = next_segment(after_site);
    let (region, site_id) = split_region(&decode_component(site_raw, "site id")?);

    Ok(RequestTarget {
        scheme: Scheme::Current,
        address: BlobAddress {
            region,
            site_id: non_empty(site_id, "site id")?,
            store_name: decode_component(store_raw, "store name")?,
            key: decode_key(key_raw)?,
        },
    })
}

fn resolve_legacy(rest: &str, context: Option<&str>) -> Result<RequestTarget> {
    let (site_raw, after_site) = next_segment(rest);
    let (marker, after_marker) = next_segment(after_site);
    let key_raw = if marker == "blobs" { after_marker } else { after_site };
    let (region, site_id) = split_region(&decode_component(site_raw, "site id")?);

    let store_name = match context {
        Some(context) if !context.is_empty() => context.to_string(),
        _ => LEGACY_DEFAULT_STORE.to_string(),
    };

    Ok(RequestTarget {
        scheme: Scheme::Legacy,
        address: BlobAddress {
            region,
            site_id: non_empty(site_id, "site id")?,
            store_name,
            key: decode_key(key_raw)?,
        },
    })
}

fn resolve_signed(path: &str) -> Result<RequestTarget> {
    let (first, after_first) = next_segment(path);
    let (region, rest) = match first.strip_prefix(REGION_PREFIX) {
        Some(region) if !region.is_empty() => {
            (Some(decode_component(region, "region")?), after_first)
        }
        _ => (None, path),
    };

    let (site_raw, after_site) = next_segment(rest);
    let (store_raw, key_raw) = next_segment(after_site);

    Ok(RequestTarget {
        scheme: Scheme::Signed,
        address: BlobAddress {
            region,
            site_id: decode_component(site_raw, "site id")?,
            store_name: decode_component(store_raw, "store name")?,
            key: decode_key(key_raw)?,
        },
    })
}

/// Split off the first `/`-separated segment
fn next_segment(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or((path, ""))
}

/// `region:<region>:<site>` carries a region; `region:<site>` does not
fn split_region(site: &str) -> (Option<String>, String) {
    match site.strip_prefix(REGION_PREFIX) {
        Some(rest) => match rest.split_once(':') {
            Some((region, site)) if !region.is_empty() => {
                (Some(region.to_string()), site.to_string())
            }
            _ => (None, rest.to_string()),
        },
        None => (None, site.to_string()),
    }
}

fn decode_component(raw: &str, what: &str) -> Result<String> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::InvalidRequest(format!("{} is not valid UTF-8", what)))?;
    non_empty(decoded.into_owned(), what)
}

fn non_empty(value: String, what: &str) -> Result<String> {
    if value.is_empty() {
        Err(Error::InvalidRequest(format!("missing {}", what)))
    } else {
        Ok(value)
    }
}

fn decode_key(raw: &str) -> Result<String> {
    let key = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::InvalidRequest("blob key is not valid UTF-8".into()))?
        .into_owned();

    if !key.is_empty() && key.split('/').any(str::is_empty) {
        return Err(Error::InvalidRequest(format!(
            "blob key contains an empty path segment: {:?}",
            key
        )));
    }

    Ok(key)
}
