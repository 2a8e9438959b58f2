//! Storage backend capability.
//!
//! The gateway core never talks to S3 or the filesystem directly; it goes
//! through [`StorageBackend`]. The default implementation lives in
//! [`object`] and covers both `fs` and `s3` via `object_store`.

pub mod object;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::StorageConfig;
use crate::protocol::Setting;

pub use object::{ObjectStoreBackend, DEFAULT_TABLESPACE};

pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A remote object as returned by a listing. `path` is relative to the
/// storage prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
}

impl ObjectInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// A multipart upload that was started but never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub path: String,
    pub upload_id: String,
}

/// Result of a server-side copy attempt.
#[derive(Debug, thiserror::Error)]
pub enum ServerSideCopyError {
    /// The backend cannot copy between these two locations natively.
    #[error("server-side copy unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open `path` for reading starting at byte `offset`. Reopening at the
    /// same offset must yield the same bytes.
    async fn read(
        &self,
        path: &str,
        offset: u64,
        settings: &[Setting],
    ) -> anyhow::Result<BoxAsyncRead>;

    /// Open `path` for writing. The object becomes visible once the sink is
    /// shut down successfully; dropping it early abandons the upload.
    async fn write(&self, path: &str, settings: &[Setting]) -> anyhow::Result<BoxAsyncWrite>;

    /// Every object whose relative path starts with `prefix`.
    async fn list(&self, prefix: &str, settings: &[Setting]) -> anyhow::Result<Vec<ObjectInfo>>;

    async fn move_object(&self, from: &str, to: &str) -> anyhow::Result<()>;

    async fn delete(&self, path: &str) -> anyhow::Result<()>;

    /// Copy `from` in the store described by `source` to `to` in this store
    /// without streaming the bytes through the gateway.
    async fn copy_server_side(
        &self,
        source: &StorageConfig,
        from: &str,
        to: &str,
    ) -> Result<(), ServerSideCopyError>;

    async fn list_failed_multipart_uploads(&self) -> anyhow::Result<Vec<MultipartUpload>>;

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> anyhow::Result<()>;
}

/// Opens backends from configuration. Copy needs one for the source
/// installation named in the request, so this is a seam tests can replace.
pub trait BackendFactory: Send + Sync {
    fn open(&self, config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>>;
}

/// Factory producing [`ObjectStoreBackend`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectStoreFactory;

impl BackendFactory for ObjectStoreFactory {
    fn open(&self, config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(ObjectStoreBackend::from_config(config)?))
    }
}
