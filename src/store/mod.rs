//! Blob Store
//!
//! Filesystem-backed execution of the five blob operations. Writes go to a
//! uniquely named hidden temp file in the target directory and are renamed
//! into place, content first and sidecar second, so a reader never sees a
//! torn blob or a sidecar without its content.

mod locks;
mod metadata;

pub use locks::KeyLocks;
pub use metadata::{
    compute_etag, decode_metadata_header, encode_metadata_header, BlobMetadata, METADATA_HEADER,
};

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::{
    check_store_names, encode_segment, entries_dir, key_from_relative, key_path, metadata_dir,
    BlobAddress, LocalPaths, MAX_ENCODED_SEGMENT,
};
use crate::error::{Error, Result};

/// A blob read back from disk
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Bytes,
    pub metadata: BlobMetadata,
}

/// List filters
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    /// Fold keys with a `/` after the prefix into directory entries
    pub directories: bool,
}

/// One entry of a listing
#[derive(Debug, Clone, Serialize)]
pub struct ListedBlob {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Store listing
#[derive(Debug, Clone, Default, Serialize)]
pub struct Listing {
    pub blobs: Vec<ListedBlob>,
    pub directories: Vec<String>,
}

/// Filesystem blob store rooted at one directory
pub struct BlobStore {
    root: PathBuf,
    locks: KeyLocks,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root if it does not exist
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Read a blob's content and sidecar
    pub async fn get(&self, address: &BlobAddress) -> Result<Blob> {
        let paths = LocalPaths::for_address(&self.root, address)?;
        let _guard = self.locks.read(&paths.data_path).await;
        let data = match fs::read(&paths.data_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if is_absent(&e) => return Err(Error::NotFound(address.key.clone())),
            Err(e) => return Err(e.into()),
        };

        let mut metadata = read_sidecar(&paths.metadata_path).await?.unwrap_or_default();
        if metadata.etag.is_none() {
            metadata.etag = Some(compute_etag(&data));
        }

        Ok(Blob { data, metadata })
    }

    /// Read a blob's sidecar; the blob itself must exist
    pub async fn get_metadata(&self, address: &BlobAddress) -> Result<BlobMetadata> {
        let paths = LocalPaths::for_address(&self.root, address)?;
        let _guard = self.locks.read(&paths.data_path).await;
        match fs::metadata(&paths.data_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(Error::NotFound(address.key.clone())),
            Err(e) if is_absent(&e) => return Err(Error::NotFound(address.key.clone())),
            Err(e) => return Err(e.into()),
        }

        match read_sidecar(&paths.metadata_path).await? {
            Some(metadata) => Ok(metadata),
            None => {
                // Blob written outside the server: derive what we can
                let data = fs::read(&paths.data_path).await?;
                Ok(BlobMetadata {
                    etag: Some(compute_etag(&data)),
                    ..BlobMetadata::default()
                })
            }
        }
    }

    /// Write a blob and its sidecar, replacing any previous version
    pub async fn set(
        &self,
        address: &BlobAddress,
        data: Bytes,
        content_type: Option<String>,
        metadata: Map<String, Value>,
    ) -> Result<BlobMetadata> {
        let paths = LocalPaths::for_address(&self.root, address)?;
        let mut sidecar = BlobMetadata::new(content_type, metadata);
        sidecar.etag = Some(compute_etag(&data));
        let sidecar_bytes = serde_json::to_vec(&sidecar)?;

        let _guard = self.locks.write(&paths.data_path).await;
        write_atomic(&paths.data_path, &data).await?;
        if let Err(e) = write_atomic(&paths.metadata_path, &sidecar_bytes).await {
            // Content without its sidecar must not outlive a failed set
            if let Err(cleanup) = fs::remove_file(&paths.data_path).await {
                warn!("Failed to roll back {:?}: {}", paths.data_path, cleanup);
            }
            let _ = fs::remove_file(&paths.metadata_path).await;
            return Err(e);
        }

        debug!(
            "Stored {}/{}/{} ({} bytes)",
            address.site_id,
            address.store_name,
            address.key,
            data.len()
        );
        Ok(sidecar)
    }

    /// Remove a blob. Removing an absent blob succeeds.
    pub async fn delete(&self, address: &BlobAddress) -> Result<()> {
        let paths = LocalPaths::for_address(&self.root, address)?;
        let _guard = self.locks.write(&paths.data_path).await;

        if let Err(e) = fs::remove_file(&paths.metadata_path).await {
            if !is_absent(&e) {
                warn!("Failed to remove sidecar {:?}: {}", paths.metadata_path, e);
            }
        }

        match fs::remove_file(&paths.data_path).await {
            Ok(()) => {
                debug!("Deleted {}/{}/{}", address.site_id, address.store_name, address.key);
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            // A directory here is a key prefix, not a blob
            Err(_) if is_dir(&paths.data_path).await => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the blobs of a store
    pub async fn list(
        &self,
        site_id: &str,
        store_name: &str,
        options: &ListOptions,
    ) -> Result<Listing> {
        check_store_names(site_id, store_name)?;
        let store_root = entries_dir(&self.root, site_id, store_name);
        let sidecar_root = metadata_dir(&self.root, site_id, store_name);
        let prefix = options.prefix.as_deref().unwrap_or("");

        // Only descend into the part of the tree the prefix can match
        if let Some((dir, _)) = prefix.rsplit_once('/') {
            if dir
                .split('/')
                .any(|segment| encode_segment(segment).len() > MAX_ENCODED_SEGMENT)
            {
                return Ok(Listing::default());
            }
        }
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() && !dir.split('/').any(str::is_empty) => {
                store_root.join(key_path(dir))
            }
            _ => store_root.clone(),
        };

        let mut blobs = Vec::new();
        let mut directories = BTreeSet::new();
        let mut stack = vec![start];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if is_absent(&e) => continue,
                Err(e) => return Err(e.into()),
            };

            // Entries deleted mid-walk are skipped, not reported
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) if is_absent(&e) => break,
                    Err(e) => return Err(e.into()),
                };
                let path = entry.path();
                // file_type() does not follow symlinks; those are skipped
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(e) if is_absent(&e) => continue,
                    Err(e) => return Err(e.into()),
                };
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&store_root) else {
                    continue;
                };
                let Some(key) = key_from_relative(relative) else {
                    continue;
                };
                let Some(rest) = key.strip_prefix(prefix) else {
                    continue;
                };

                if options.directories {
                    if let Some(pos) = rest.find('/') {
                        directories.insert(key[..prefix.len() + pos].to_string());
                        continue;
                    }
                }

                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if is_absent(&e) => continue,
                    Err(e) => return Err(e.into()),
                };
                let etag = read_sidecar(&sidecar_root.join(relative))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|m| m.etag);

                blobs.push(ListedBlob {
                    key,
                    etag,
                    size: meta.len(),
                    last_modified: meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
        }

        blobs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Listing {
            blobs,
            directories: directories.into_iter().collect(),
        })
    }
}

/// Missing file, or a path component that cannot exist as addressed
fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory
    )
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn read_sidecar(path: &Path) -> Result<Option<BlobMetadata>> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!("Ignoring unreadable sidecar {:?}: {}", path, e);
                Ok(None)
            }
        },
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Temp file removed on drop unless committed
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.committed {
            // Drop cannot await; a single unlink is short enough to block on
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace `path` with `data` via temp file and rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(Error::InvalidRequest(format!("cannot write to {:?}", path)));
    };
    fs::create_dir_all(parent).await.map_err(|e| collision(e, path))?;

    let mut temp = TempFile {
        path: parent.join(format!(".{}.tmp.{}", file_name.to_string_lossy(), Uuid::new_v4())),
        committed: false,
    };
    {
        let mut file = fs::File::create(&temp.path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp.path, path).await.map_err(|e| collision(e, path))?;
    temp.committed = true;

    Ok(())
}

/// Map errors caused by a key colliding with another key's directory
fn collision(err: io::Error, path: &Path) -> Error {
    match err.kind() {
        io::ErrorKind::AlreadyExists
        | io::ErrorKind::NotADirectory
        | io::ErrorKind::IsADirectory
        | io::ErrorKind::DirectoryNotEmpty => Error::InvalidRequest(format!(
            "blob key collides with an existing key prefix at {:?}",
            path.file_name().unwrap_or_default()
        )),
        _ => Error::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn address(key: &str) -> BlobAddress {
        BlobAddress {
            region: None,
            site_id: "site1".to_string(),
            store_name: "store1".to_string(),
            key: key.to_string(),
        }
    }

    fn tags(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let foo = address("nested/foo.txt");

        let written = store
            .set(
                &foo,
                Bytes::from_static(b"hello"),
                Some("text/plain".to_string()),
                tags(json!({"owner": "ci"})),
            )
            .await
            .unwrap();

        let blob = store.get(&foo).await.unwrap();
        assert_eq!(&blob.data[..], b"hello");
        assert_eq!(blob.metadata, written);

        let metadata = store.get_metadata(&foo).await.unwrap();
        assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
        assert_eq!(metadata.metadata, tags(json!({"owner": "ci"})));
        assert_eq!(metadata.etag, Some(compute_etag(b"hello")));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_metadata() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let foo = address("foo");

        store.set(&foo, Bytes::from_static(b"one"), None, tags(json!({"v": 1}))).await.unwrap();
        store.set(&foo, Bytes::from_static(b"two"), None, Map::new()).await.unwrap();

        let blob = store.get(&foo).await.unwrap();
        assert_eq!(&blob.data[..], b"two");
        assert!(blob.metadata.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(matches!(store.get(&address("nope")).await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.get_metadata(&address("nope")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let foo = address("foo");

        store.delete(&foo).await.unwrap();
        store.set(&foo, Bytes::from_static(b"x"), None, Map::new()).await.unwrap();
        store.delete(&foo).await.unwrap();
        store.delete(&foo).await.unwrap();

        assert!(matches!(store.get(&foo).await, Err(Error::NotFound(_))));
        let sidecar = LocalPaths::for_address(dir.path(), &foo).unwrap().metadata_path;
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn test_delete_requires_key() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(matches!(store.delete(&address("")).await, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_prefix_directory_is_not_a_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.set(&address("a/b"), Bytes::from_static(b"x"), None, Map::new()).await.unwrap();

        assert!(matches!(store.get(&address("a")).await, Err(Error::NotFound(_))));
        store.delete(&address("a")).await.unwrap();
        assert!(store.get(&address("a/b")).await.is_ok());

        let clash = store.set(&address("a/b/c"), Bytes::from_static(b"y"), None, Map::new()).await;
        assert!(matches!(clash, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_traversal_keys_stay_in_store() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("root"));
        let sneaky = address("../../../escape");

        store.set(&sneaky, Bytes::from_static(b"x"), None, Map::new()).await.unwrap();
        assert!(!dir.path().join("escape").exists());
        assert_eq!(&store.get(&sneaky).await.unwrap().data[..], b"x");

        let listing = store.list("site1", "store1", &ListOptions::default()).await.unwrap();
        assert_eq!(listing.blobs[0].key, "../../../escape");
    }

    #[tokio::test]
    async fn test_list() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        for key in ["b", "a", "dir/one", "dir/two", "dir/sub/three", "other/x"] {
            store.set(&address(key), Bytes::from(key.to_string()), None, Map::new()).await.unwrap();
        }

        let all = store.list("site1", "store1", &ListOptions::default()).await.unwrap();
        let keys: Vec<_> = all.blobs.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "dir/one", "dir/sub/three", "dir/two", "other/x"]);
        assert!(all.directories.is_empty());
        assert_eq!(all.blobs[0].size, 1);
        assert!(all.blobs[0].etag.is_some());

        let prefixed = store
            .list(
                "site1",
                "store1",
                &ListOptions { prefix: Some("dir/".to_string()), directories: true },
            )
            .await
            .unwrap();
        let keys: Vec<_> = prefixed.blobs.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, ["dir/one", "dir/two"]);
        assert_eq!(prefixed.directories, ["dir/sub"]);

        let top = store
            .list("site1", "store1", &ListOptions { prefix: None, directories: true })
            .await
            .unwrap();
        assert_eq!(top.directories, ["dir", "other"]);
    }

    #[tokio::test]
    async fn test_list_missing_store_is_empty() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let listing = store.list("site1", "nothing", &ListOptions::default()).await.unwrap();
        assert!(listing.blobs.is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_temp_files() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.set(&address("k"), Bytes::from_static(b"x"), None, Map::new()).await.unwrap();
        let store_root = entries_dir(dir.path(), "site1", "store1");
        std::fs::write(store_root.join(".k.tmp.leftover"), b"partial").unwrap();

        let listing = store.list("site1", "store1", &ListOptions::default()).await.unwrap();
        assert_eq!(listing.blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writes_never_tear() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()));
        let key = address("hot");
        let payloads: Vec<Bytes> = (0..8u8).map(|i| Bytes::from(vec![i; 64 * 1024])).collect();

        let mut handles = Vec::new();
        for payload in payloads.clone() {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.set(&key, payload, None, Map::new()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let blob = store.get(&key).await.unwrap();
        assert!(payloads.contains(&blob.data));
        assert_eq!(blob.metadata.etag, Some(compute_etag(&blob.data)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_during_writes_see_matching_sidecar() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()));
        let key = address("hot");
        store
            .set(&key, Bytes::from_static(b"aaaa"), Some("text/a".into()), Map::new())
            .await
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move {
                for i in 0..300 {
                    let (data, content_type) = if i % 2 == 0 {
                        (&b"bbbb"[..], "text/b")
                    } else {
                        (&b"aaaa"[..], "text/a")
                    };
                    store
                        .set(&key, Bytes::from_static(data), Some(content_type.into()), Map::new())
                        .await
                        .unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let blob = store.get(&key).await.unwrap();
            assert_eq!(blob.metadata.etag, Some(compute_etag(&blob.data)));
            let expected = if blob.data.as_ref() == b"aaaa" { "text/a" } else { "text/b" };
            assert_eq!(blob.metadata.content_type.as_deref(), Some(expected));

            let meta = store.get_metadata(&key).await.unwrap();
            assert!(meta.etag.is_some());
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_list_tolerates_concurrent_deletes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()));

        for _ in 0..20 {
            for i in 0..50 {
                store
                    .set(&address(&format!("k{}", i)), Bytes::from_static(b"x"), None, Map::new())
                    .await
                    .unwrap();
            }

            let deleter = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..50 {
                        store.delete(&address(&format!("k{}", i))).await.unwrap();
                    }
                })
            };

            let listing = store.list("site1", "store1", &ListOptions::default()).await.unwrap();
            assert!(listing.blobs.len() <= 50);
            deleter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_uncommitted_temp_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".k.tmp.1");
        fs::write(&path, b"partial").await.unwrap();

        drop(TempFile {
            path: path.clone(),
            committed: false,
        });
        assert!(!path.exists());

        fs::write(&path, b"kept").await.unwrap();
        drop(TempFile {
            path: path.clone(),
            committed: true,
        });
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_overlong_key_is_client_error() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let err = store
            .set(&address(&"é".repeat(100)), Bytes::from_static(b"x"), None, Map::new())
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let options = ListOptions {
            prefix: Some(format!("{}/", "é".repeat(100))),
            directories: false,
        };
        let listing = store.list("site1", "store1", &options).await.unwrap();
        assert!(listing.blobs.is_empty());
    }
}
