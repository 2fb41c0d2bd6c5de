//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncReadExt;
use updraft_core::{ContentHash, ContentHasher};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Chunk size for streaming reads and imports (64 KiB).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Object storage backend trait.
///
/// Keys are store-relative file names. Every write path hashes the bytes it
/// writes so callers never need to read a file back to learn its hash.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object as a stream of chunks.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Store an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<StoredObject>;

    /// Begin a streaming upload. Nothing is visible under `key` until
    /// `finish` succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Absolute path of an object, for backends that keep local files.
    async fn local_path(&self, key: &str) -> StorageResult<Option<PathBuf>>;

    /// Copy a local file into the store while hashing it.
    async fn import_file(&self, key: &str, source: &Path) -> StorageResult<StoredObject> {
        let mut file = tokio::fs::File::open(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(source.display().to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut upload = self.put_stream(key).await?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    upload.abort().await?;
                    return Err(StorageError::Io(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = upload.write(Bytes::copy_from_slice(&buf[..n])).await {
                upload.abort().await?;
                return Err(e);
            }
        }
        upload.finish().await
    }

    /// Recompute the hash of a stored object from its bytes.
    async fn hash_object(&self, key: &str) -> StorageResult<ContentHash> {
        let mut stream = self.get_stream(key).await?;
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = stream.next().await {
            hasher.update(&chunk?);
        }
        Ok(hasher.finalize())
    }
}

/// Outcome of a completed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Bytes written.
    pub size: u64,
    /// SHA-256 of exactly the bytes written.
    pub hash: ContentHash,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload, making it visible under its key.
    async fn finish(self: Box<Self>) -> StorageResult<StoredObject>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
