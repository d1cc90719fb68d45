//! Per-key read/write serialization
//!
//! A fixed set of async RwLock stripes indexed by the blob's content path.
//! Writers hold a stripe exclusively while they replace content and
//! sidecar, readers hold it shared while they read both, so a reader never
//! pairs new content with an old sidecar. Unrelated keys may share a stripe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_STRIPES: usize = 64;

pub struct KeyLocks {
    stripes: Vec<RwLock<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| RwLock::new(())).collect(),
        }
    }

    fn stripe_for(&self, path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Exclusive hold on the stripe owning `path`
    pub async fn write(&self, path: &Path) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.stripe_for(path)].write().await
    }

    /// Shared hold on the stripe owning `path`
    pub async fn read(&self, path: &Path) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.stripe_for(path)].read().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}
