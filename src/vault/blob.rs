//! Ciphertext blob storage.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{instrument, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp.";

/// Flat key -> bytes store for ciphertext.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Write a new blob. Existing keys are never overwritten.
    async fn write(&self, key: &str, data: &[u8]) -> io::Result<()>;

    async fn read(&self, key: &str) -> io::Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> io::Result<()>;

    /// All committed blob keys.
    async fn list(&self) -> io::Result<Vec<String>>;

    fn backend_name(&self) -> &'static str;
}

/// Blobs as files directly under a root directory.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub async fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Keys are single path components; anything that could escape the root
    /// or collide with temp files is rejected.
    fn key_path(&self, key: &str) -> io::Result<PathBuf> {
        let invalid = key.is_empty()
            || key.starts_with('.')
            || key.contains(['/', '\\', '\0']);
        if invalid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob key: {key:?}"),
            ));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn write(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let path = self.key_path(key)?;

        // Write to a temp file and fsync it, then hard-link it into place.
        // The link fails with AlreadyExists instead of replacing a blob.
        let temp_path = self.root.join(format!("{TEMP_PREFIX}{key}.{}", Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::hard_link(&temp_path, &path).await
        }
        .await;

        if let Err(e) = fs::remove_file(&temp_path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %temp_path.display(), error = %e, "failed to remove temp blob");
        }

        result.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("blob already exists: {key}"),
            ),
            _ => e,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, key: &str) -> io::Result<Vec<u8>> {
        fs::read(self.key_path(key)?).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> io::Result<()> {
        fs::remove_file(self.key_path(key)?).await
    }

    async fn list(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(TEMP_PREFIX) {
                keys.push(name);
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// A blob written ahead of its metadata record. Call `commit` once the record
/// exists or `discard` to remove the blob. Dropping it without either
/// schedules the delete on the current runtime.
pub struct PendingBlob {
    store: Arc<dyn BlobStore>,
    key: Option<String>,
}

impl PendingBlob {
    pub async fn write(store: Arc<dyn BlobStore>, key: String, data: &[u8]) -> io::Result<Self> {
        store.write(&key, data).await?;
        Ok(Self {
            store,
            key: Some(key),
        })
    }

    pub fn commit(mut self) {
        self.key = None;
    }

    pub async fn discard(mut self) -> io::Result<()> {
        match self.key.take() {
            Some(key) => self.store.delete(&key).await,
            None => Ok(()),
        }
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        warn!(key = %key, "pending blob dropped without commit, scheduling delete");
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.delete(&key).await {
                        warn!(key = %key, error = %e, "failed to delete uncommitted blob");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "no runtime to delete uncommitted blob; left for reconciliation");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store with failure injection.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        pub fail_writes: AtomicBool,
    }

    impl MemoryBlobStore {
        pub fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.blobs.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }

        pub fn put_raw(&self, key: &str, data: Vec<u8>) {
            self.blobs.lock().unwrap().insert(key.to_string(), data);
        }

        pub fn remove_raw(&self, key: &str) {
            self.blobs.lock().unwrap().remove(key);
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn write(&self, key: &str, data: &[u8]) -> io::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::other("injected write failure"));
            }
            let mut blobs = self.blobs.lock().unwrap();
            if blobs.contains_key(key) {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, key.to_string()));
            }
            blobs.insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn read(&self, key: &str) -> io::Result<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.to_string()))
        }

        async fn delete(&self, key: &str) -> io::Result<()> {
            self.blobs
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.to_string()))
        }

        async fn list(&self) -> io::Result<Vec<String>> {
            Ok(self.keys())
        }

        fn backend_name(&self) -> &'static str {
            "memory"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBlobStore;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filesystem_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        store.write("a.enc", b"ciphertext").await.unwrap();
        assert_eq!(store.read("a.enc").await.unwrap(), b"ciphertext");
        assert_eq!(store.list().await.unwrap(), vec!["a.enc".to_string()]);

        store.delete("a.enc").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        let err = store.read("a.enc").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_filesystem_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        store.write("a.enc", b"first").await.unwrap();
        let err = store.write("a.enc", b"second").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(store.read("a.enc").await.unwrap(), b"first");

        // The refused write leaves no temp file behind
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_filesystem_racing_writers_keep_first_blob() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemBlobStore::new(dir.path()).await.unwrap());

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.write("same.enc", &[i; 32]).await.map(|_| i) })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(i) => winners.push(i),
                Err(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(store.read("same.enc").await.unwrap(), vec![winners[0]; 32]);
        assert_eq!(store.list().await.unwrap(), vec!["same.enc".to_string()]);
    }

    #[tokio::test]
    async fn test_filesystem_rejects_unsafe_keys() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(dir.path().join("blobs")).await.unwrap();

        for key in ["", "..", "../escape", "a/b", "a\\b", ".hidden", ".tmp.x"] {
            let err = store.write(key, b"x").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "key {key:?}");
        }
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_filesystem_list_skips_temp_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        store.write("b.enc", b"b").await.unwrap();
        std::fs::write(dir.path().join(".tmp.b.enc.123"), b"partial").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["b.enc".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_blob_commit_keeps_blob() {
        let store = Arc::new(MemoryBlobStore::default());
        let pending = PendingBlob::write(store.clone(), "k.enc".into(), b"data")
            .await
            .unwrap();
        pending.commit();
        tokio::task::yield_now().await;
        assert_eq!(store.keys(), vec!["k.enc".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_blob_discard_removes_blob() {
        let store = Arc::new(MemoryBlobStore::default());
        let pending = PendingBlob::write(store.clone(), "k.enc".into(), b"data")
            .await
            .unwrap();
        pending.discard().await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_pending_blob_drop_schedules_delete() {
        let store = Arc::new(MemoryBlobStore::default());
        {
            let _pending = PendingBlob::write(store.clone(), "k.enc".into(), b"data")
                .await
                .unwrap();
        }

        for _ in 0..10 {
            if store.keys().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.keys().is_empty());
    }
}
