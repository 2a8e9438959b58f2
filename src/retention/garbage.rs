//! Garbage selection and deletion.

use std::collections::{HashMap, HashSet};

use super::retry_rounds;
use super::trash::trash_path;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::metadata::{BackupCheckpoint, Lsn, SegmentRef};
use crate::protocol::DeleteRequest;
use crate::storage::{MultipartUpload, ObjectInfo};

/// What a garbage pass found (and, when confirmed, removed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GarbageReport {
    pub garbage: Vec<String>,
    /// Orphaned multipart uploads.
    pub uploads: Vec<MultipartUpload>,
    pub confirmed: bool,
}

/// Objects that are neither live nor needed by any retained backup.
///
/// An object is kept when the virtual index references it. Otherwise it
/// is garbage if it has no expire hint, or if its expire LSN is covered by
/// the backup checkpoint. Output order follows `objects`.
pub fn select_garbage(
    objects: &[ObjectInfo],
    live: &HashSet<String>,
    expire: &HashMap<String, Lsn>,
    checkpoint: BackupCheckpoint,
) -> Vec<String> {
    objects
        .iter()
        .filter(|obj| !live.contains(&obj.path))
        .filter(|obj| match expire.get(&obj.path) {
            None => true,
            Some(lsn) => checkpoint.covers(*lsn),
        })
        .map(|obj| obj.path.clone())
        .collect()
}

/// Checkpoint bounding retention for `segment`, honoring `vacuum.check_backup`.
pub(crate) async fn backup_checkpoint(
    gw: &Gateway,
    segment: &SegmentRef,
) -> Result<BackupCheckpoint> {
    if !gw.config.vacuum.check_backup {
        tracing::info!(segnum = segment.segnum, "backup check disabled, checkpoint unbounded");
        return Ok(BackupCheckpoint::Unbounded);
    }
    let checkpoint = gw.metadata.first_backup_lsn(segment).await?;
    tracing::info!(segnum = segment.segnum, %checkpoint, "first backup LSN");
    Ok(checkpoint)
}

/// Garbage objects under `prefix` for `segment`.
pub async fn list_garbage(gw: &Gateway, prefix: &str, segment: &SegmentRef) -> Result<Vec<String>> {
    let checkpoint = backup_checkpoint(gw, segment).await?;

    let objects = gw.storage.list(prefix, &[]).await?;
    tracing::info!(prefix, count = objects.len(), "listed objects");

    let indexes = gw.metadata.indexes(segment).await?;
    tracing::debug!(
        virtual_count = indexes.live.len(),
        expire_count = indexes.expire.len(),
        "received virtual and expire indexes"
    );

    let garbage = select_garbage(&objects, &indexes.live, &indexes.expire, checkpoint);
    tracing::info!(prefix, count = garbage.len(), "garbage objects selected");
    Ok(garbage)
}

/// Collect garbage under `req.name`. Without confirmation nothing is
/// touched; with it, garbage is trashed (or dropped) and orphaned multipart
/// uploads are aborted.
pub async fn delete_garbage(gw: &Gateway, req: &DeleteRequest) -> Result<GarbageReport> {
    let segment = SegmentRef::new(req.segnum, req.port);
    let garbage = list_garbage(gw, &req.name, &segment).await?;

    let active = gw.registry.active_write_paths();
    let uploads: Vec<MultipartUpload> = gw
        .storage
        .list_failed_multipart_uploads()
        .await?
        .into_iter()
        .filter(|upload| !active.contains(&upload.path))
        .collect();
    tracing::info!(count = uploads.len(), "multipart uploads will be aborted");

    for path in &garbage {
        tracing::info!(path = %path, "object will be deleted");
    }
    for upload in &uploads {
        tracing::info!(path = %upload.path, upload_id = %upload.upload_id, "upload will be aborted");
    }

    let mut report = GarbageReport {
        garbage,
        uploads,
        confirmed: req.confirm,
    };
    if !req.confirm {
        tracing::info!("dry run, no confirmation flag provided");
        return Ok(report);
    }

    let storage = &gw.storage;
    let segnum = req.segnum;
    let crazy_drop = req.crazy_drop;
    retry_rounds(
        "obsolete object",
        report.garbage.clone(),
        gw.config.retry_rounds,
        gw.config.delete_concurrency,
        &gw.shutdown,
        |path| async move {
            if crazy_drop {
                storage.delete(&path).await
            } else {
                storage.move_object(&path, &trash_path(&path, segnum)).await
            }
        },
    )
    .await?;

    for upload in &report.uploads {
        gw.storage.abort_multipart_upload(upload).await?;
    }
    Ok(report)
}

/// Remove exactly `req.name`: dropped with `crazy_drop`, trashed otherwise.
pub async fn delete_file(gw: &Gateway, req: &DeleteRequest) -> Result<()> {
    if !req.confirm {
        tracing::info!(path = %req.name, "dry run, object would be deleted");
        return Ok(());
    }
    if req.crazy_drop {
        gw.storage.delete(&req.name).await?;
    } else {
        gw.storage
            .move_object(&req.name, &trash_path(&req.name, req.segnum))
            .await?;
    }
    tracing::info!(path = %req.name, crazy_drop = req.crazy_drop, "object deleted");
    Ok(())
}
