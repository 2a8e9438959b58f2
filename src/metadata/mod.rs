//! Liveness metadata consumed by retention and copy.
//!
//! The virtual index says which objects the catalog still references, the
//! expire index says from which LSN an unreferenced object may go, and the
//! backup checkpoint bounds how far back point-in-time recovery must reach.

pub mod backups;
pub mod postgres;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub use backups::BackupCatalog;
pub use postgres::PostgresMetadata;

/// A write-ahead log position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = anyhow::Error;

    /// Parses the `X/Y` form used by Postgres.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid LSN '{s}': missing '/'"))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|e| anyhow::anyhow!("invalid LSN '{s}': {e}"))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|e| anyhow::anyhow!("invalid LSN '{s}': {e}"))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

/// Oldest LSN any retained backup may still need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCheckpoint {
    Bounded(Lsn),
    /// No backup constrains retention.
    Unbounded,
}

impl BackupCheckpoint {
    /// An object whose expire LSN is below the checkpoint is no longer
    /// needed by any backup.
    pub fn covers(&self, expire: Lsn) -> bool {
        match self {
            Self::Bounded(checkpoint) => expire < *checkpoint,
            Self::Unbounded => true,
        }
    }
}

impl fmt::Display for BackupCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(lsn) => write!(f, "{lsn}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Identifies the database segment whose metadata is requested.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentRef {
    pub segnum: u64,
    /// Port of the segment's Postgres instance.
    pub port: u64,
    pub database: Option<String>,
}

impl SegmentRef {
    pub fn new(segnum: u64, port: u64) -> Self {
        Self {
            segnum,
            port,
            database: None,
        }
    }
}

/// Virtual and expire index of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogIndexes {
    pub live: HashSet<String>,
    pub expire: HashMap<String, Lsn>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Paths still referenced by the catalog.
    async fn virtual_index(&self, segment: &SegmentRef) -> anyhow::Result<HashSet<String>>;

    async fn expire_index(&self, segment: &SegmentRef) -> anyhow::Result<HashMap<String, Lsn>>;

    /// Both indexes, from one snapshot where the source supports it.
    async fn indexes(&self, segment: &SegmentRef) -> anyhow::Result<CatalogIndexes> {
        Ok(CatalogIndexes {
            live: self.virtual_index(segment).await?,
            expire: self.expire_index(segment).await?,
        })
    }

    async fn first_backup_lsn(&self, segment: &SegmentRef) -> anyhow::Result<BackupCheckpoint>;

    async fn current_lsn(&self, segment: &SegmentRef) -> anyhow::Result<Lsn>;

    async fn add_expire_hint(&self, segment: &SegmentRef, path: &str, lsn: Lsn)
        -> anyhow::Result<()>;

    async fn delete_expire_hint(&self, segment: &SegmentRef, path: &str) -> anyhow::Result<()>;
}
