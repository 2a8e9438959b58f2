//! Garbage collection, trash and obsolete sweeps against in-memory storage.

mod common;

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chunkgw::client::command_on;
use chunkgw::metadata::{BackupCheckpoint, Lsn};
use chunkgw::protocol::{DeleteRequest, Message, ObsoleteRequest, UntrashifyRequest};
use chunkgw::retention::{
    collect_obsolete, delete_file, delete_garbage, delete_obsolete, list_garbage, untrashify,
};
use chunkgw::storage::StorageBackend;
use chunkgw::{metadata::SegmentRef, GatewayError};
use common::*;

const PREFIX: &str = "segments_005/seg1/basebackups_005/yezzey/";

fn obj(name: &str) -> String {
    format!("{PREFIX}{name}")
}

/// Objects A..E plus the scenario's indexes: A, B, C live; B:1400, C:1337,
/// D:1300 in the expire index; checkpoint 1337.
async fn scenario() -> (Arc<dyn StorageBackend>, Arc<FakeMetadata>) {
    let storage = memory_storage();
    for name in ["A", "B", "C", "D", "E"] {
        put_object(&storage, &obj(name), name.as_bytes()).await;
    }
    let metadata = FakeMetadata::new(BackupCheckpoint::Bounded(Lsn(1337)))
        .with_live(&[&obj("A"), &obj("B"), &obj("C")])
        .with_expire(&[(&obj("B"), 1400), (&obj("C"), 1337), (&obj("D"), 1300)]);
    (storage, metadata)
}

fn garbage_request(confirm: bool, crazy_drop: bool) -> DeleteRequest {
    DeleteRequest {
        name: PREFIX.to_string(),
        port: 6000,
        segnum: 1,
        confirm,
        garbage: true,
        crazy_drop,
    }
}

#[tokio::test]
async fn test_list_garbage_scenario() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(storage, metadata);

    let garbage = list_garbage(&gw, PREFIX, &SegmentRef::new(1, 6000)).await?;
    assert_eq!(garbage, vec![obj("D"), obj("E")]);

    Ok(())
}

#[tokio::test]
async fn test_garbage_without_backup_check() -> Result<()> {
    let (storage, metadata) = scenario().await;
    metadata
        .expire
        .lock()
        .unwrap()
        .insert(obj("D"), Lsn(u64::MAX));
    let mut gw = gateway(storage, metadata);

    // With backups considered, D's hint protects it.
    let segment = SegmentRef::new(1, 6000);
    assert_eq!(list_garbage(&gw, PREFIX, &segment).await?, vec![obj("E")]);

    gw.config.vacuum.check_backup = false;
    assert_eq!(
        list_garbage(&gw, PREFIX, &segment).await?,
        vec![obj("D"), obj("E")]
    );

    Ok(())
}

#[tokio::test]
async fn test_dry_run_changes_nothing() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(Arc::clone(&storage), metadata);
    let before = paths(&storage, "").await;

    let report = delete_garbage(&gw, &garbage_request(false, false)).await?;
    assert_eq!(report.garbage, vec![obj("D"), obj("E")]);
    assert!(!report.confirmed);

    let untrash = untrashify(
        &gw,
        &UntrashifyRequest {
            name: PREFIX.to_string(),
            segnum: 1,
            confirm: false,
        },
    )
    .await?;
    assert!(untrash.moves.is_empty());

    delete_file(
        &gw,
        &DeleteRequest {
            name: obj("A"),
            segnum: 1,
            crazy_drop: true,
            ..Default::default()
        },
    )
    .await?;

    assert_eq!(paths(&storage, "").await, before);
    Ok(())
}

#[tokio::test]
async fn test_confirmed_delete_trashes_then_untrashify_restores() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(Arc::clone(&storage), metadata);

    delete_garbage(&gw, &garbage_request(true, false)).await?;

    assert_eq!(
        paths(&storage, PREFIX).await,
        vec![obj("A"), obj("B"), obj("C")]
    );
    let trashed = paths(&storage, "trash/seg1/").await;
    assert_eq!(
        trashed,
        vec![
            format!("trash/seg1/{}", obj("D")),
            format!("trash/seg1/{}", obj("E")),
        ]
    );

    let report = untrashify(
        &gw,
        &UntrashifyRequest {
            name: PREFIX.to_string(),
            segnum: 1,
            confirm: true,
        },
    )
    .await?;
    assert_eq!(report.moves.len(), 2);
    assert_eq!(report.moves[0].1, obj("D"));

    assert!(paths(&storage, "trash/").await.is_empty());
    assert_eq!(paths(&storage, PREFIX).await.len(), 5);
    assert_eq!(read_object(&storage, &obj("E")).await, b"E");

    Ok(())
}

#[tokio::test]
async fn test_garbage_reads_indexes_once() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(storage, Arc::clone(&metadata));

    delete_garbage(&gw, &garbage_request(true, false)).await?;
    assert_eq!(metadata.snapshot_reads.load(Ordering::SeqCst), 1);
    assert_eq!(metadata.single_reads.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn test_stuck_garbage_is_partial_failure() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let flaky = Arc::new(FlakyBackend::new(Arc::clone(&storage)).failing(&obj("D"), usize::MAX));
    let gw = gateway(flaky, metadata);

    let err = delete_garbage(&gw, &garbage_request(true, false))
        .await
        .unwrap_err();
    assert!(matches!(&err, GatewayError::PartialFailure { failed } if failed == &[obj("D")]));
    assert_eq!(err.error_frame().1, format!("failed: {}", obj("D")));

    // E went to trash regardless; D stayed put.
    assert_eq!(
        paths(&storage, "trash/").await,
        vec![format!("trash/seg1/{}", obj("E"))]
    );
    assert_eq!(read_object(&storage, &obj("D")).await, b"D");

    Ok(())
}

#[tokio::test]
async fn test_transient_move_failures_recover() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(Arc::clone(&storage), Arc::clone(&metadata));
    delete_garbage(&gw, &garbage_request(true, false)).await?;

    let trashed_d = format!("trash/seg1/{}", obj("D"));
    let flaky = Arc::new(FlakyBackend::new(Arc::clone(&storage)).failing(&trashed_d, 2));
    let gw = gateway(flaky, metadata);

    let report = untrashify(
        &gw,
        &UntrashifyRequest {
            name: PREFIX.to_string(),
            segnum: 1,
            confirm: true,
        },
    )
    .await?;
    assert_eq!(report.moves.len(), 2);
    assert!(paths(&storage, "trash/").await.is_empty());
    assert_eq!(read_object(&storage, &obj("D")).await, b"D");

    Ok(())
}

#[tokio::test]
async fn test_crazy_drop_deletes_for_good() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(Arc::clone(&storage), metadata);

    delete_garbage(&gw, &garbage_request(true, true)).await?;

    assert_eq!(paths(&storage, PREFIX).await.len(), 3);
    assert!(paths(&storage, "trash/").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_single_file_delete() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = gateway(Arc::clone(&storage), metadata);

    delete_file(
        &gw,
        &DeleteRequest {
            name: obj("E"),
            segnum: 1,
            confirm: true,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(
        paths(&storage, "trash/").await,
        vec![format!("trash/seg1/{}", obj("E"))]
    );

    Ok(())
}

#[tokio::test]
async fn test_delete_over_the_wire() -> Result<()> {
    let (storage, metadata) = scenario().await;
    let gw = Arc::new(gateway(Arc::clone(&storage), metadata));

    let (mut conn, handle) = connect(&gw);
    command_on(&mut conn, Message::Delete(garbage_request(true, true))).await?;
    handle.await??;
    assert_eq!(paths(&storage, PREFIX).await.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_metadata_failure_is_fatal() -> Result<()> {
    use async_trait::async_trait;
    use chunkgw::metadata::MetadataSource;
    use std::collections::{HashMap, HashSet};

    struct Unreachable;

    #[async_trait]
    impl MetadataSource for Unreachable {
        async fn virtual_index(&self, _: &SegmentRef) -> anyhow::Result<HashSet<String>> {
            anyhow::bail!("connection refused")
        }
        async fn expire_index(&self, _: &SegmentRef) -> anyhow::Result<HashMap<String, Lsn>> {
            anyhow::bail!("connection refused")
        }
        async fn first_backup_lsn(&self, _: &SegmentRef) -> anyhow::Result<BackupCheckpoint> {
            Ok(BackupCheckpoint::Unbounded)
        }
        async fn current_lsn(&self, _: &SegmentRef) -> anyhow::Result<Lsn> {
            anyhow::bail!("connection refused")
        }
        async fn add_expire_hint(&self, _: &SegmentRef, _: &str, _: Lsn) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn delete_expire_hint(&self, _: &SegmentRef, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    let (storage, _) = scenario().await;
    let gw = chunkgw::Gateway::new(test_config(), Arc::clone(&storage), Arc::new(Unreachable));
    let before = paths(&storage, "").await;

    let err = delete_garbage(&gw, &garbage_request(true, true))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Collaborator(_)));
    assert_eq!(paths(&storage, "").await, before);

    Ok(())
}

fn obsolete_request() -> ObsoleteRequest {
    ObsoleteRequest {
        segnum: 1,
        port: 6000,
        database: "postgres".to_string(),
        prefix: PREFIX.to_string(),
    }
}

#[tokio::test]
async fn test_collect_obsolete_marks_unreferenced() -> Result<()> {
    let (storage, metadata) = scenario().await;
    *metadata.current.lock().unwrap() = Lsn(2000);
    let gw = gateway(storage, Arc::clone(&metadata));

    let report = collect_obsolete(&gw, &obsolete_request()).await?;
    assert_eq!(report.marked, vec![obj("E")]);

    let expire = metadata.expire_snapshot();
    assert_eq!(expire[&obj("E")], Lsn(2000));
    assert_eq!(expire[&obj("D")], Lsn(1300));

    Ok(())
}

#[tokio::test]
async fn test_delete_obsolete_requires_backups() -> Result<()> {
    let (storage, metadata) = scenario().await;
    *metadata.checkpoint.lock().unwrap() = BackupCheckpoint::Unbounded;
    let gw = gateway(Arc::clone(&storage), metadata);

    let err = delete_obsolete(&gw, &obsolete_request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(_)));
    assert!(paths(&storage, "trash/").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_delete_obsolete_trashes_expired() -> Result<()> {
    let (storage, metadata) = scenario().await;
    // A is live but carries a stale hint; Z is expired outside the prefix.
    let metadata = metadata.with_expire(&[(&obj("A"), 100), ("other/Z", 100)]);
    let gw = gateway(Arc::clone(&storage), Arc::clone(&metadata));

    let report = delete_obsolete(&gw, &obsolete_request()).await?;
    assert_eq!(metadata.snapshot_reads.load(Ordering::SeqCst), 1);
    assert_eq!(report.trashed, vec![obj("D")]);
    assert_eq!(report.hints_dropped, vec![obj("A")]);

    assert_eq!(
        paths(&storage, "trash/").await,
        vec![format!("trash/seg1/{}", obj("D"))]
    );
    assert_eq!(read_object(&storage, &obj("A")).await, b"A");

    let expire = metadata.expire_snapshot();
    assert!(!expire.contains_key(&obj("A")));
    assert!(!expire.contains_key(&obj("D")));
    assert!(expire.contains_key("other/Z"));
    assert!(expire.contains_key(&obj("B")));

    Ok(())
}
