//! Backup checkpoint from backup sentinels.
//!
//! Each completed base backup leaves a JSON sentinel under
//! `segments_005/seg<N>/basebackups_005/` carrying the backup's start LSN.
//! The oldest one is the checkpoint retention must respect.

use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use super::{BackupCheckpoint, Lsn};
use crate::storage::StorageBackend;

const SENTINEL_SUFFIX: &str = ".json";

#[derive(Debug, Deserialize)]
struct BackupSentinel {
    #[serde(rename = "LSN")]
    lsn: u64,
}

pub fn backup_prefix(segnum: u64) -> String {
    format!("segments_005/seg{segnum}/basebackups_005/")
}

#[derive(Clone)]
pub struct BackupCatalog {
    storage: Arc<dyn StorageBackend>,
}

impl BackupCatalog {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Minimum start LSN over all backups of `segnum`, or `Unbounded` when
    /// the segment has no backups at all.
    pub async fn first_backup_lsn(&self, segnum: u64) -> anyhow::Result<BackupCheckpoint> {
        let prefix = backup_prefix(segnum);
        let objects = self.storage.list(&prefix, &[]).await?;

        let mut first: Option<Lsn> = None;
        for obj in objects.iter().filter(|o| is_sentinel(&prefix, &o.path)) {
            let mut reader = self.storage.read(&obj.path, 0, &[]).await?;
            let mut raw = Vec::with_capacity(obj.size as usize);
            reader
                .read_to_end(&mut raw)
                .await
                .with_context(|| format!("Failed to read backup sentinel {}", obj.path))?;

            let sentinel: BackupSentinel = serde_json::from_slice(&raw)
                .with_context(|| format!("Invalid backup sentinel {}", obj.path))?;
            let lsn = Lsn(sentinel.lsn);
            tracing::debug!("Backup sentinel {} at LSN {}", obj.path, lsn);

            first = Some(first.map_or(lsn, |cur| cur.min(lsn)));
        }

        Ok(first.map_or(BackupCheckpoint::Unbounded, BackupCheckpoint::Bounded))
    }
}

/// Sentinels sit directly under the backup prefix; chunk data lives deeper.
fn is_sentinel(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| !rest.contains('/') && rest.ends_with(SENTINEL_SUFFIX))
}
