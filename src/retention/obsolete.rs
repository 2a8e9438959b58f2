//! Two-phase obsolete sweep.
//!
//! `collect_obsolete` stamps every unreferenced, unhinted object with the
//! current LSN. A later `delete_obsolete` trashes the stamped objects whose
//! LSN a backup checkpoint has since passed. The checkpoint is read at
//! deletion time, not at collection time, and nothing serializes the two
//! phases against concurrent writers.

use std::collections::HashSet;
use std::sync::Mutex;

use super::retry_rounds;
use super::trash::trash_path;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::metadata::{BackupCheckpoint, CatalogIndexes, SegmentRef};
use crate::protocol::ObsoleteRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObsoleteReport {
    /// Objects newly recorded in the expire index.
    pub marked: Vec<String>,
    /// Objects moved to trash with their hint dropped.
    pub trashed: Vec<String>,
    /// Stale hints of objects that turned out to be live.
    pub hints_dropped: Vec<String>,
}

fn segment_of(req: &ObsoleteRequest) -> SegmentRef {
    SegmentRef {
        segnum: req.segnum,
        port: req.port,
        database: (!req.database.is_empty()).then(|| req.database.clone()),
    }
}

pub async fn collect_obsolete(gw: &Gateway, req: &ObsoleteRequest) -> Result<ObsoleteReport> {
    let segment = segment_of(req);

    let objects = gw.storage.list(&req.prefix, &[]).await?;
    tracing::debug!(prefix = %req.prefix, count = objects.len(), "listed");
    let CatalogIndexes { live, expire } = gw.metadata.indexes(&segment).await?;
    let lsn = gw.metadata.current_lsn(&segment).await?;

    let marked: Vec<String> = objects
        .into_iter()
        .map(|obj| obj.path)
        .filter(|path| !live.contains(path) && !expire.contains_key(path))
        .collect();
    tracing::info!(count = marked.len(), %lsn, "recording unreferenced objects in expire index");

    let metadata = &gw.metadata;
    let segment = &segment;
    retry_rounds(
        "add expire hint",
        marked.clone(),
        gw.config.retry_rounds,
        gw.config.delete_concurrency,
        &gw.shutdown,
        |path| async move { metadata.add_expire_hint(segment, &path, lsn).await },
    )
    .await?;

    Ok(ObsoleteReport {
        marked,
        ..Default::default()
    })
}

pub async fn delete_obsolete(gw: &Gateway, req: &ObsoleteRequest) -> Result<ObsoleteReport> {
    let segment = segment_of(req);

    let CatalogIndexes { live, expire } = gw.metadata.indexes(&segment).await?;
    let checkpoint = gw.metadata.first_backup_lsn(&segment).await?;
    let BackupCheckpoint::Bounded(first_backup) = checkpoint else {
        return Err(GatewayError::config(
            "backups required for consistent deleting",
        ));
    };

    let mut report = ObsoleteReport::default();
    for (path, lsn) in &expire {
        if !checkpoint.covers(*lsn) {
            continue;
        }
        if live.contains(path) {
            tracing::warn!(path = %path, "path in both expire and virtual index");
            report.hints_dropped.push(path.clone());
        } else if path.starts_with(&req.prefix) {
            report.trashed.push(path.clone());
        } else {
            tracing::debug!(path = %path, prefix = %req.prefix, "outside of requested prefix");
        }
    }
    report.hints_dropped.sort();
    report.trashed.sort();
    tracing::info!(
        %first_backup,
        trash = report.trashed.len(),
        stale_hints = report.hints_dropped.len(),
        "deleting obsolete objects"
    );

    let storage = &gw.storage;
    let metadata = &gw.metadata;
    let segment = &segment;
    let live = &live;
    let segnum = req.segnum;
    // Objects already trashed in an earlier round whose hint removal failed.
    let moved = &Mutex::new(HashSet::new());

    let candidates = report
        .hints_dropped
        .iter()
        .chain(report.trashed.iter())
        .cloned()
        .collect();
    retry_rounds(
        "delete obsolete",
        candidates,
        gw.config.retry_rounds,
        gw.config.delete_concurrency,
        &gw.shutdown,
        |path| async move {
            let already_moved = moved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&path);
            if !live.contains(&path) && !already_moved {
                storage.move_object(&path, &trash_path(&path, segnum)).await?;
                moved
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(path.clone());
            }
            metadata.delete_expire_hint(segment, &path).await
        },
    )
    .await?;

    Ok(report)
}
