//! Auth Guard
//!
//! The configured secret is never kept. At construction a fresh random key
//! is drawn and only `HMAC-SHA256(key, secret)` survives; in anonymous mode
//! random filler stands in for the secret. Bearer credentials are checked by
//! recomputing the HMAC and comparing in constant time.
//!
//! Signed capabilities are `HMAC-SHA256(secret_hash, canonical(op, address))`,
//! so each one authorizes exactly one operation on one address.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::address::BlobAddress;
use crate::config::Secret;
use crate::error::{Error, Result};
use crate::events::Operation;

type HmacSha256 = Hmac<Sha256>;

const BEARER_PREFIX: &str = "bearer ";

/// Request credential checker
pub struct AuthGuard {
    key: [u8; 32],
    secret_hash: Vec<u8>,
    anonymous: bool,
}

impl AuthGuard {
    /// Derive the guard from an optional secret, consuming it
    pub fn new(token: Option<Secret>) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);

        let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
        let anonymous = match token {
            Some(secret) => {
                mac.update(secret.expose().as_bytes());
                false
            }
            None => {
                let mut filler = [0u8; 32];
                rng.fill_bytes(&mut filler);
                mac.update(&filler);
                true
            }
        };

        Self {
            key,
            secret_hash: mac.finalize().into_bytes().to_vec(),
            anonymous,
        }
    }

    /// No secret configured: every request is accepted
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Constant-time check of a presented bearer credential
    pub fn verify_bearer(&self, presented: &str) -> bool {
        if self.anonymous {
            return false;
        }
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(presented.as_bytes());
        mac.verify_slice(&self.secret_hash).is_ok()
    }

    /// Capability authorizing `operation` on `address`
    pub fn capability(&self, operation: Operation, address: &BlobAddress) -> String {
        hex::encode(self.capability_mac(operation, address).finalize().into_bytes())
    }

    /// Constant-time check of a capability from a signed URL
    pub fn verify_capability(
        &self,
        signature: &str,
        operation: Operation,
        address: &BlobAddress,
    ) -> bool {
        match hex::decode(signature) {
            Ok(bytes) => self
                .capability_mac(operation, address)
                .verify_slice(&bytes)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Decide whether a request may be dispatched.
    ///
    /// `target` is the resolved operation and address, when resolution
    /// succeeded; a capability can only be checked against one.
    pub fn authorize(
        &self,
        authorization: Option<&str>,
        signature: Option<&str>,
        target: Option<(Operation, &BlobAddress)>,
    ) -> Result<()> {
        if self.anonymous {
            return Ok(());
        }

        if let Some(token) = authorization.and_then(parse_bearer) {
            if self.verify_bearer(token) {
                return Ok(());
            }
        }

        if let (Some(signature), Some((operation, address))) = (signature, target) {
            if self.verify_capability(signature, operation, address) {
                return Ok(());
            }
        }

        Err(Error::Forbidden)
    }

    fn capability_mac(&self, operation: Operation, address: &BlobAddress) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret_hash).expect("HMAC can take key of any size");
        // Length-prefixed fields keep the encoding unambiguous
        for field in [
            operation.as_str(),
            address.site_id.as_str(),
            address.store_name.as_str(),
            address.key.as_str(),
        ] {
            mac.update(format!("{}:", field.len()).as_bytes());
            mac.update(field.as_bytes());
        }
        mac
    }
}

/// Extract the credential from an `Authorization: Bearer ...` header
pub fn parse_bearer(header: &str) -> Option<&str> {
    let prefix = header.get(..BEARER_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        Some(header[BEARER_PREFIX.len()..].trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(key: &str) -> BlobAddress {
        BlobAddress {
            region: None,
            site_id: "site1".to_string(),
            store_name: "store1".to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_anonymous_accepts_everything() {
        let guard = AuthGuard::new(None);
        assert!(guard.is_anonymous());
        assert!(guard.authorize(None, None, None).is_ok());
        assert!(!guard.verify_bearer(""));
    }

    #[test]
    fn test_bearer() {
        let guard = AuthGuard::new(Some(Secret::new("hunter2")));
        assert!(guard.authorize(Some("Bearer hunter2"), None, None).is_ok());
        assert!(guard.authorize(Some("bearer hunter2"), None, None).is_ok());
        assert!(matches!(
            guard.authorize(Some("Bearer hunter3"), None, None),
            Err(Error::Forbidden)
        ));
        assert!(matches!(guard.authorize(Some("hunter2"), None, None), Err(Error::Forbidden)));
        assert!(matches!(guard.authorize(None, None, None), Err(Error::Forbidden)));
    }

    #[test]
    fn test_capability_scope() {
        let guard = AuthGuard::new(Some(Secret::new("hunter2")));
        let foo = address("foo");
        let cap = guard.capability(Operation::Get, &foo);

        assert!(guard.verify_capability(&cap, Operation::Get, &foo));
        assert!(!guard.verify_capability(&cap, Operation::Delete, &foo));
        assert!(!guard.verify_capability(&cap, Operation::Get, &address("bar")));
        assert!(!guard.verify_capability("not-hex", Operation::Get, &foo));

        assert!(guard.authorize(None, Some(&cap), Some((Operation::Get, &foo))).is_ok());
        assert!(guard.authorize(None, Some(&cap), None).is_err());
    }

    #[test]
    fn test_capability_ignores_region() {
        let guard = AuthGuard::new(Some(Secret::new("hunter2")));
        let plain = address("foo");
        let regional = BlobAddress {
            region: Some("us-east-1".to_string()),
            ..plain.clone()
        };
        let cap = guard.capability(Operation::Set, &plain);
        assert!(guard.verify_capability(&cap, Operation::Set, &regional));
    }

    #[test]
    fn test_capability_encoding_unambiguous() {
        let guard = AuthGuard::new(None);
        let a = BlobAddress {
            region: None,
            site_id: "ab".to_string(),
            store_name: "c".to_string(),
            key: "k".to_string(),
        };
        let b = BlobAddress {
            site_id: "a".to_string(),
            store_name: "bc".to_string(),
            ..a.clone()
        };
        assert_ne!(guard.capability(Operation::Get, &a), guard.capability(Operation::Get, &b));
    }

    #[test]
    fn test_instances_do_not_share_capabilities() {
        let first = AuthGuard::new(Some(Secret::new("hunter2")));
        let second = AuthGuard::new(Some(Secret::new("hunter2")));
        let foo = address("foo");
        let cap = first.capability(Operation::Get, &foo);
        assert!(!second.verify_capability(&cap, Operation::Get, &foo));
    }

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("BEARER  abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bear"), None);
    }
}
