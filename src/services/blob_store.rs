//! src/services/blob_store.rs
//!
//! BlobStore - the durable payload store behind uploads. The trait is the
//! seam to an external object store; `DiskBlobStore` keeps payloads on local
//! disk beneath `base_path/{storage_key}`, where the storage key already
//! carries its three-level partition prefix.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("declared length {declared} but received {received} bytes")]
    LengthMismatch { declared: u64, received: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sidecar(#[from] serde_json::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Server-side encryption requested on write.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerSideEncryption {
    #[serde(rename = "AES256")]
    Aes256,
}

/// Options sent along with a write.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PutOptions {
    /// Exact payload length declared up front.
    pub content_length: u64,
    pub content_type: String,
    pub cache_control: String,
    pub encryption: ServerSideEncryption,
}

#[derive(Debug, Clone)]
pub struct PutReceipt {
    pub etag: String,
    pub size_bytes: u64,
}

/// Durable key/value payload store.
///
/// `delete` is idempotent: removing a missing key succeeds.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, body: ByteStream, options: PutOptions) -> BlobResult<PutReceipt>;

    async fn get(&self, key: &str) -> BlobResult<ByteStream>;

    async fn delete(&self, key: &str) -> BlobResult<()>;

    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Cheap reachability probe used by readiness checks.
    async fn check(&self) -> BlobResult<()>;
}

/// Local-disk blob store.
#[derive(Clone, Debug)]
pub struct DiskBlobStore {
    base_path: PathBuf,
}

const SIDECAR_SUFFIX: &str = ".meta.json";

impl DiskBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that could escape `base_path`.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        if key.is_empty()
            || key.starts_with('/')
            || key.contains("..")
            || key.ends_with(SIDECAR_SUFFIX)
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Read back the options recorded for a blob.
    pub async fn options(&self, key: &str) -> BlobResult<PutOptions> {
        let path = self.blob_path(key)?;
        let raw = fs::read(Self::sidecar_path(&path))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
                _ => BlobError::Io(err),
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Remove empty partition directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn discard(path: &Path) {
    let _ = fs::remove_file(path).await;
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    /// Stream a payload to a temp file, verify its length against the
    /// declared one, fsync, then atomically rename into place.
    async fn put(
        &self,
        key: &str,
        mut body: ByteStream,
        options: PutOptions,
    ) -> BlobResult<PutReceipt> {
        let file_path = self.blob_path(key)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut received: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    discard(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            received += chunk.len() as u64;
            if received > options.content_length {
                discard(&tmp_path).await;
                return Err(BlobError::LengthMismatch {
                    declared: options.content_length,
                    received,
                });
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                discard(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if received != options.content_length {
            discard(&tmp_path).await;
            return Err(BlobError::LengthMismatch {
                declared: options.content_length,
                received,
            });
        }
        if let Err(err) = file.flush().await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        drop(file);

        let sidecar = serde_json::to_vec(&options)?;
        if let Err(err) = fs::write(Self::sidecar_path(&file_path), sidecar).await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            discard(&tmp_path).await;
            discard(&Self::sidecar_path(&file_path)).await;
            return Err(BlobError::Io(err));
        }

        Ok(PutReceipt {
            etag: format!("{:x}", digest.compute()),
            size_bytes: received,
        })
    }

    async fn get(&self, key: &str) -> BlobResult<ByteStream> {
        let path = self.blob_path(key)?;
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
            _ => BlobError::Io(err),
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }
        match fs::remove_file(Self::sidecar_path(&path)).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        let path = self.blob_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Write, read back, and delete a probe file under `base_path`.
    async fn check(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        discard(&probe).await;
        if read_back? != b"readyz" {
            return Err(BlobError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}
