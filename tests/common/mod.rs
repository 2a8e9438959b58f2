//! Shared fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use object_store::memory::InMemory;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chunkgw::config::{CryptoConfig, GatewayConfig, StorageConfig};
use chunkgw::crypt::{Crypter, CrypterFactory};
use chunkgw::metadata::{BackupCheckpoint, CatalogIndexes, Lsn, MetadataSource, SegmentRef};
use chunkgw::server::serve_connection;
use chunkgw::protocol::Setting;
use chunkgw::storage::{
    BackendFactory, BoxAsyncRead, BoxAsyncWrite, MultipartUpload, ObjectInfo, ObjectStoreBackend,
    ServerSideCopyError, StorageBackend,
};
use chunkgw::Gateway;

pub fn memory_storage() -> Arc<dyn StorageBackend> {
    Arc::new(ObjectStoreBackend::new(
        Arc::new(InMemory::new()),
        "",
        StorageConfig::default(),
    ))
}

pub async fn put_object(storage: &Arc<dyn StorageBackend>, path: &str, data: &[u8]) {
    let mut sink = storage.write(path, &[]).await.unwrap();
    sink.write_all(data).await.unwrap();
    sink.shutdown().await.unwrap();
}

pub async fn read_object(storage: &Arc<dyn StorageBackend>, path: &str) -> Vec<u8> {
    let mut reader = storage.read(path, 0, &[]).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

pub async fn paths(storage: &Arc<dyn StorageBackend>, prefix: &str) -> Vec<String> {
    storage
        .list(prefix, &[])
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.path)
        .collect()
}

/// Config with fast retries for tests.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        retry_limit: 3,
        retry_delay_ms: 0,
        retry_rounds: 3,
        copy_concurrency: 4,
        ..Default::default()
    }
}

pub fn gateway(storage: Arc<dyn StorageBackend>, metadata: Arc<FakeMetadata>) -> Gateway {
    Gateway::new(test_config(), storage, metadata)
}

/// Serve one connection on an in-memory duplex and hand back the client end.
pub fn connect(gw: &Arc<Gateway>) -> (DuplexStream, JoinHandle<chunkgw::Result<()>>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let handle = tokio::spawn(serve_connection(Arc::clone(gw), server));
    (client, handle)
}

// =============================================================================
// Metadata
// =============================================================================

pub struct FakeMetadata {
    pub live: Mutex<HashSet<String>>,
    pub expire: Mutex<HashMap<String, Lsn>>,
    pub checkpoint: Mutex<BackupCheckpoint>,
    pub current: Mutex<Lsn>,
    /// Calls to `indexes`.
    pub snapshot_reads: AtomicUsize,
    /// Calls to `virtual_index` and `expire_index`.
    pub single_reads: AtomicUsize,
}

impl FakeMetadata {
    pub fn new(checkpoint: BackupCheckpoint) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(HashSet::new()),
            expire: Mutex::new(HashMap::new()),
            checkpoint: Mutex::new(checkpoint),
            current: Mutex::new(Lsn(0)),
            snapshot_reads: AtomicUsize::new(0),
            single_reads: AtomicUsize::new(0),
        })
    }

    pub fn with_live(self: Arc<Self>, paths: &[&str]) -> Arc<Self> {
        self.live
            .lock()
            .unwrap()
            .extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_expire(self: Arc<Self>, entries: &[(&str, u64)]) -> Arc<Self> {
        self.expire
            .lock()
            .unwrap()
            .extend(entries.iter().map(|(p, l)| (p.to_string(), Lsn(*l))));
        self
    }

    pub fn expire_snapshot(&self) -> HashMap<String, Lsn> {
        self.expire.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn virtual_index(&self, _segment: &SegmentRef) -> anyhow::Result<HashSet<String>> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.live.lock().unwrap().clone())
    }

    async fn expire_index(&self, _segment: &SegmentRef) -> anyhow::Result<HashMap<String, Lsn>> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.expire.lock().unwrap().clone())
    }

    async fn indexes(&self, _segment: &SegmentRef) -> anyhow::Result<CatalogIndexes> {
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        Ok(CatalogIndexes {
            live: self.live.lock().unwrap().clone(),
            expire: self.expire.lock().unwrap().clone(),
        })
    }

    async fn first_backup_lsn(&self, _segment: &SegmentRef) -> anyhow::Result<BackupCheckpoint> {
        Ok(*self.checkpoint.lock().unwrap())
    }

    async fn current_lsn(&self, _segment: &SegmentRef) -> anyhow::Result<Lsn> {
        Ok(*self.current.lock().unwrap())
    }

    async fn add_expire_hint(
        &self,
        _segment: &SegmentRef,
        path: &str,
        lsn: Lsn,
    ) -> anyhow::Result<()> {
        self.expire.lock().unwrap().insert(path.to_string(), lsn);
        Ok(())
    }

    async fn delete_expire_hint(&self, _segment: &SegmentRef, path: &str) -> anyhow::Result<()> {
        self.expire.lock().unwrap().remove(path);
        Ok(())
    }
}

// =============================================================================
// Crypto
// =============================================================================

/// XOR "cipher": enough to tell ciphertext from plaintext in assertions.
pub struct XorCrypter {
    pub key: u8,
    pub key_ref: CryptoConfig,
}

impl XorCrypter {
    pub fn new(key: u8) -> Arc<Self> {
        Arc::new(Self {
            key,
            key_ref: key_ref(key),
        })
    }
}

pub fn key_ref(key: u8) -> CryptoConfig {
    CryptoConfig {
        key_path: None,
        key_id: Some(format!("xor-{key}")),
    }
}

struct XorWriter {
    inner: BoxAsyncWrite,
    key: u8,
}

impl AsyncWrite for XorWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let key = self.key;
        let encoded: Vec<u8> = buf.iter().map(|b| b ^ key).collect();
        Pin::new(&mut self.inner).poll_write(cx, &encoded)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct XorReader {
    inner: BoxAsyncRead,
    key: u8,
}

impl AsyncRead for XorReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let key = self.key;
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            for b in &mut buf.filled_mut()[before..] {
                *b ^= key;
            }
        }
        poll
    }
}

impl Crypter for XorCrypter {
    fn encrypt(&self, sink: BoxAsyncWrite) -> anyhow::Result<BoxAsyncWrite> {
        Ok(Box::new(XorWriter {
            inner: sink,
            key: self.key,
        }))
    }

    fn decrypt(&self, source: BoxAsyncRead) -> anyhow::Result<BoxAsyncRead> {
        Ok(Box::new(XorReader {
            inner: source,
            key: self.key,
        }))
    }

    fn key_matches(&self, other: &CryptoConfig) -> bool {
        self.key_ref == *other
    }
}

/// Opens XOR crypters from `key_id = "xor-<n>"` references.
pub struct XorCrypters;

impl CrypterFactory for XorCrypters {
    fn open(&self, config: &CryptoConfig) -> anyhow::Result<Arc<dyn Crypter>> {
        let key = config
            .key_id
            .as_deref()
            .and_then(|id| id.strip_prefix("xor-"))
            .and_then(|k| k.parse::<u8>().ok())
            .ok_or_else(|| anyhow::anyhow!("unknown key {config:?}"))?;
        Ok(XorCrypter::new(key))
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Hands out one fixed backend regardless of the requested config.
pub struct FixedBackend(pub Arc<dyn StorageBackend>);

impl BackendFactory for FixedBackend {
    fn open(&self, _config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Wraps a backend and fails mutations of chosen paths a set number of
/// times. Reads and listings pass through.
pub struct FlakyBackend {
    inner: Arc<dyn StorageBackend>,
    failures: Mutex<HashMap<String, usize>>,
    /// Write attempts per path, failed ones included.
    pub writes: Mutex<HashMap<String, usize>>,
    cancel_on_write: Option<CancellationToken>,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            cancel_on_write: None,
        }
    }

    /// Fail the next `times` writes, moves or deletes of `path`.
    pub fn failing(self, path: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(path.to_string(), times);
        self
    }

    /// Cancel `token` as soon as any write starts.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_write = Some(token);
        self
    }

    pub fn writes_of(&self, path: &str) -> usize {
        self.writes.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn trip(&self, path: &str) -> anyhow::Result<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(path) {
            Some(left) if *left > 0 => {
                *left -= 1;
                anyhow::bail!("injected failure for {path}")
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn read(
        &self,
        path: &str,
        offset: u64,
        settings: &[Setting],
    ) -> anyhow::Result<BoxAsyncRead> {
        self.inner.read(path, offset, settings).await
    }

    async fn write(&self, path: &str, settings: &[Setting]) -> anyhow::Result<BoxAsyncWrite> {
        *self
            .writes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;
        if let Some(token) = &self.cancel_on_write {
            token.cancel();
        }
        self.trip(path)?;
        self.inner.write(path, settings).await
    }

    async fn list(&self, prefix: &str, settings: &[Setting]) -> anyhow::Result<Vec<ObjectInfo>> {
        self.inner.list(prefix, settings).await
    }

    async fn move_object(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.trip(from)?;
        self.inner.move_object(from, to).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.trip(path)?;
        self.inner.delete(path).await
    }

    async fn copy_server_side(
        &self,
        source: &StorageConfig,
        from: &str,
        to: &str,
    ) -> Result<(), ServerSideCopyError> {
        self.inner.copy_server_side(source, from, to).await
    }

    async fn list_failed_multipart_uploads(&self) -> anyhow::Result<Vec<MultipartUpload>> {
        self.inner.list_failed_multipart_uploads().await
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> anyhow::Result<()> {
        self.inner.abort_multipart_upload(upload).await
    }
}
