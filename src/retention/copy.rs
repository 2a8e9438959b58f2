//! Copy reconciliation between installations.
//!
//! Objects referenced by the virtual index are copied from a source
//! installation into this gateway's storage. The destination is re-listed
//! at the start of every round, and anything already present there is
//! skipped, so re-running a copy after a partial failure only moves what is
//! still missing.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{self, StorageConfig};
use crate::crypt::{self, Crypter};
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::metadata::SegmentRef;
use crate::protocol::{CopyFlags, CopyRequest};
use crate::session::Session;
use crate::storage::{BoxAsyncWrite, ObjectInfo, ServerSideCopyError, StorageBackend};
use crate::stream::{RateGovernor, RetryPolicy, RetryReader, StorageSource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Objects that needed copying when the operation started.
    pub candidates: Vec<String>,
    /// Source objects skipped as unreferenced or already present.
    pub skipped: usize,
    pub copied: Vec<String>,
    /// How many of `copied` went through a backend-native copy.
    pub server_side: usize,
    /// Bytes streamed through the gateway.
    pub bytes: u64,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSide {
    Never,
    Try,
    Require,
}

enum Transfer {
    ServerSide,
    Streamed(u64),
}

/// Everything one object transfer needs, shareable across tasks.
struct CopyJob {
    source: Arc<dyn StorageBackend>,
    source_config: StorageConfig,
    dest: Arc<dyn StorageBackend>,
    decrypter: Option<Arc<dyn Crypter>>,
    encrypter: Option<Arc<dyn Crypter>>,
    server_side: ServerSide,
    policy: RetryPolicy,
    governor: Arc<RateGovernor>,
    session: Option<Arc<Session>>,
}

impl CopyJob {
    async fn run(&self, path: &str) -> anyhow::Result<Transfer> {
        if self.server_side != ServerSide::Never {
            match self
                .dest
                .copy_server_side(&self.source_config, path, path)
                .await
            {
                Ok(()) => return Ok(Transfer::ServerSide),
                Err(err) if self.server_side == ServerSide::Require => return Err(err.into()),
                Err(ServerSideCopyError::Unsupported(reason)) => {
                    tracing::debug!(path, "server-side copy unavailable: {reason}");
                }
                Err(ServerSideCopyError::Failed(err)) => {
                    tracing::warn!(path, "server-side copy failed, streaming instead: {err:#}");
                }
            }
        }

        let mut reader = RetryReader::new(
            StorageSource::new(Arc::clone(&self.source), path, &[]),
            self.policy,
            Arc::clone(&self.governor),
        );
        if let Some(session) = &self.session {
            reader = reader.with_session(Arc::clone(session));
        }

        let sink = self.dest.write(path, &[]).await?;
        let mut sink: BoxAsyncWrite = match &self.encrypter {
            Some(crypter) => crypter.encrypt(sink)?,
            None => sink,
        };

        let bytes = match &self.decrypter {
            Some(crypter) => {
                let (pipe, pump) = reader.into_pipe();
                let mut plain = crypter.decrypt(Box::new(pipe))?;
                let n = tokio::io::copy(&mut plain, &mut sink).await?;
                pump.await??;
                n
            }
            None => reader.copy_to(&mut sink).await?,
        };
        sink.shutdown().await?;
        Ok(Transfer::Streamed(bytes))
    }
}

/// Copy everything under `req.name` that the virtual index references and
/// the destination lacks. Without `confirm` only the candidate set is
/// computed.
pub async fn copy_objects(
    gw: &Gateway,
    req: &CopyRequest,
    session: Option<Arc<Session>>,
) -> Result<CopyReport> {
    if req.flags.contains(CopyFlags::USE_KEK) {
        return Err(GatewayError::config(
            "KEK decryption is not supported for copy",
        ));
    }

    let source_config = config::load(Path::new(&req.source_config))?;
    let source = gw.backends.open(&source_config.storage)?;
    tracing::info!(
        source = %req.source_config,
        prefix = %req.name,
        "loaded source installation config"
    );

    let keys_equal = crypt::keys_equivalent(gw.crypter.as_ref(), source_config.crypto.as_ref());
    let (encrypt, decrypt) = (req.encrypt(), req.decrypt());
    let native_ok = (!encrypt && !decrypt) || (encrypt && decrypt && keys_equal);

    let server_side = if req.flags.contains(CopyFlags::SERVER_SIDE) {
        if !keys_equal || encrypt != decrypt {
            return Err(GatewayError::config(
                "server-side copy requires equivalent source and destination keys",
            ));
        }
        ServerSide::Require
    } else if native_ok && !gw.config.storage.disable_server_side_copy {
        ServerSide::Try
    } else {
        ServerSide::Never
    };

    // Crypters are resolved up front so a missing key fails the whole
    // operation instead of every object.
    let streaming = server_side != ServerSide::Require;
    let encrypter = if encrypt && streaming {
        Some(Arc::clone(gw.crypter()?))
    } else {
        None
    };
    let decrypter = if decrypt && streaming {
        let factory = gw
            .crypters
            .as_ref()
            .ok_or(GatewayError::CrypterNotConfigured)?;
        let key = source_config.crypto.as_ref().ok_or_else(|| {
            GatewayError::config("source installation has no crypto section")
        })?;
        Some(factory.open(key)?)
    } else {
        None
    };

    let objects = source.list(&req.name, &[]).await?;
    let live = gw
        .metadata
        .virtual_index(&SegmentRef::new(0, req.port))
        .await?;

    let referenced: Vec<ObjectInfo> = objects
        .into_iter()
        .filter(|obj| {
            let keep = live.contains(&obj.path);
            if !keep {
                tracing::debug!(path = %obj.path, "not in virtual index, skipping");
            }
            keep
        })
        .collect();

    let present = destination_paths(gw, &req.name).await?;
    let candidates: Vec<String> = referenced
        .iter()
        .map(|obj| obj.path.clone())
        .filter(|path| !present.contains(path))
        .collect();

    let mut report = CopyReport {
        skipped: referenced.len() - candidates.len(),
        candidates: candidates.clone(),
        confirmed: req.confirm,
        ..Default::default()
    };
    for path in &report.candidates {
        tracing::info!(path = %path, "object will be copied");
    }
    tracing::info!(
        candidates = report.candidates.len(),
        skipped = report.skipped,
        mode = ?server_side,
        "copy plan"
    );
    if !req.confirm {
        return Ok(report);
    }

    let job = Arc::new(CopyJob {
        source,
        source_config: source_config.storage,
        dest: Arc::clone(&gw.storage),
        decrypter,
        encrypter,
        server_side,
        policy: gw.retry_policy(),
        governor: Arc::clone(&gw.governor),
        session,
    });
    let semaphore = Arc::new(Semaphore::new(gw.config.copy_concurrency));

    let mut pending = candidates;
    for round in 1..=gw.config.retry_rounds {
        if gw.shutdown.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if round > 1 {
            let present = destination_paths(gw, &req.name).await?;
            pending.retain(|path| !present.contains(path));
        }
        if pending.is_empty() {
            break;
        }

        let mut tasks = JoinSet::new();
        let mut cancelled = false;
        for path in &pending {
            // Shutdown stops new copies; running ones are drained below.
            let permit = tokio::select! {
                biased;
                _ = gw.shutdown.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| GatewayError::Cancelled)?
                }
            };
            let job = Arc::clone(&job);
            let path = path.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = job.run(&path).await;
                (path, result)
            });
        }

        let mut done = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, Ok(transfer))) => {
                    match transfer {
                        Transfer::ServerSide => report.server_side += 1,
                        Transfer::Streamed(n) => report.bytes += n,
                    }
                    tracing::debug!(path = %path, "copied");
                    done.insert(path);
                }
                Ok((path, Err(err))) => {
                    tracing::warn!(path = %path, round, "failed to copy: {err:#}");
                }
                Err(err) => tracing::error!(round, "copy task aborted: {err}"),
            }
        }

        pending.retain(|path| !done.contains(path));
        report.copied.extend(done);
        if cancelled {
            tracing::warn!(
                copied = report.copied.len(),
                left = pending.len(),
                "copy interrupted by shutdown"
            );
            return Err(GatewayError::Cancelled);
        }
        if !pending.is_empty() {
            tracing::info!("copy: {} object(s) left after round {round}", pending.len());
        }
    }

    report.copied.sort();
    if pending.is_empty() {
        Ok(report)
    } else {
        tracing::error!("copy: {} object(s) failed: {:?}", pending.len(), pending);
        Err(GatewayError::PartialFailure { failed: pending })
    }
}

async fn destination_paths(gw: &Gateway, prefix: &str) -> Result<HashSet<String>> {
    Ok(gw
        .storage
        .list(prefix, &[])
        .await?
        .into_iter()
        .map(|obj| obj.path)
        .collect())
}
