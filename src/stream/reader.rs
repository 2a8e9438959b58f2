//! Resumable reads over unreliable backend streams.
//!
//! [`RetryReader`] is an explicit state machine. When the backend stream
//! fails it is dropped and reopened at the last byte handed to the caller,
//! within a bounded number of reacquire attempts per `read` call.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::limiter::RateGovernor;
use super::pipe::{pipe, PipeReader};
use crate::error::{GatewayError, Result};
use crate::protocol::Setting;
use crate::session::Session;
use crate::storage::{BoxAsyncRead, StorageBackend};

/// Read buffer size used when pumping a reader into a sink.
pub const READ_CHUNK_SIZE: usize = 128 * 1024;

/// Something that can be (re)opened at a byte offset. Opening twice at the
/// same offset must yield the same bytes.
#[async_trait]
pub trait ReadSource: Send + Sync {
    fn path(&self) -> &str;

    async fn open_at(&self, offset: u64) -> anyhow::Result<BoxAsyncRead>;
}

/// An object in a storage backend.
pub struct StorageSource {
    storage: Arc<dyn StorageBackend>,
    path: String,
    settings: Vec<Setting>,
}

impl StorageSource {
    pub fn new(storage: Arc<dyn StorageBackend>, path: &str, settings: &[Setting]) -> Self {
        Self {
            storage,
            path: path.to_string(),
            settings: settings.to_vec(),
        }
    }
}

#[async_trait]
impl ReadSource for StorageSource {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open_at(&self, offset: u64) -> anyhow::Result<BoxAsyncRead> {
        self.storage.read(&self.path, offset, &self.settings).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reacquire attempts allowed within one `read` call.
    pub limit: usize,
    /// Pause after a failed open.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 100,
            delay: Duration::from_secs(1),
        }
    }
}

pub enum ReaderState {
    NeedsAcquire,
    Streaming(BoxAsyncRead),
    Done,
    Failed,
}

impl ReaderState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NeedsAcquire => "needs-acquire",
            Self::Streaming(_) => "streaming",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Debug for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct RetryReader<S> {
    source: S,
    state: ReaderState,
    offset: u64,
    policy: RetryPolicy,
    governor: Arc<RateGovernor>,
    session: Option<Arc<Session>>,
}

impl<S: ReadSource> RetryReader<S> {
    pub fn new(source: S, policy: RetryPolicy, governor: Arc<RateGovernor>) -> Self {
        Self {
            source,
            state: ReaderState::NeedsAcquire,
            offset: 0,
            policy,
            governor,
            session: None,
        }
    }

    /// Start from `offset` instead of the beginning of the object.
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    /// Bytes of the object confirmed delivered so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn exhausted(&self) -> GatewayError {
        GatewayError::ExhaustedRetries {
            path: self.source.path().to_string(),
            offset: self.offset,
            attempts: self.policy.limit,
        }
    }

    /// Read into `buf`, reacquiring the backend stream as needed. Returns 0
    /// at end of object.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.governor.slice_len(buf.len());
        let buf = &mut buf[..len];
        let mut attempts = 0usize;

        loop {
            match &mut self.state {
                ReaderState::Done => return Ok(0),
                ReaderState::Failed => return Err(self.exhausted()),
                ReaderState::NeedsAcquire => {
                    if attempts >= self.policy.limit {
                        self.state = ReaderState::Failed;
                        return Err(self.exhausted());
                    }
                    attempts += 1;

                    match self.source.open_at(self.offset).await {
                        Ok(stream) => self.state = ReaderState::Streaming(stream),
                        Err(err) => {
                            tracing::warn!(
                                path = %self.source.path(),
                                offset = self.offset,
                                attempt = attempts,
                                "failed to reacquire stream: {err:#}"
                            );
                            tokio::time::sleep(self.policy.delay).await;
                        }
                    }
                }
                ReaderState::Streaming(stream) => match stream.read(buf).await {
                    Ok(0) => {
                        self.state = ReaderState::Done;
                        return Ok(0);
                    }
                    Ok(n) => {
                        self.offset += n as u64;
                        if let Some(session) = &self.session {
                            session.publish_offset(self.offset);
                            session.add_bytes(n as u64);
                        }
                        self.governor.acquire(n).await;
                        return Ok(n);
                    }
                    Err(err) => {
                        tracing::warn!(
                            path = %self.source.path(),
                            offset = self.offset,
                            "stream failed, reopening: {err}"
                        );
                        // Dropping the stream closes it.
                        self.state = ReaderState::NeedsAcquire;
                    }
                },
            }
        }
    }

    /// Release the backend stream, if any.
    pub fn close(&mut self) {
        if matches!(self.state, ReaderState::Streaming(_)) {
            self.state = ReaderState::NeedsAcquire;
        }
    }

    /// Copy the rest of the object into `sink`. Does not shut the sink down.
    pub async fn copy_to<W: AsyncWrite + Unpin + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            sink.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
}

impl<S: ReadSource + 'static> RetryReader<S> {
    /// Run the reader in its own task feeding a pipe, for stages that need
    /// an `AsyncRead` (decryption). Reader failures are delivered through
    /// the pipe as I/O errors.
    pub fn into_pipe(mut self) -> (PipeReader, JoinHandle<Result<u64>>) {
        let (mut writer, reader) = pipe();
        let handle = tokio::spawn(async move {
            match self.copy_to(&mut writer).await {
                Ok(total) => {
                    writer.shutdown().await?;
                    Ok(total)
                }
                Err(err) => {
                    writer
                        .fail(io::Error::other(err.to_string()))
                        .await;
                    Err(err)
                }
            }
        });
        (reader, handle)
    }
}
