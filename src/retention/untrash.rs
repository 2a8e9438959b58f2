//! Restoring trashed objects.

use super::retry_rounds;
use super::trash::{trash_path, untrash_path};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::protocol::UntrashifyRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UntrashReport {
    /// `(trash location, regular location)` pairs.
    pub moves: Vec<(String, String)>,
    pub confirmed: bool,
}

/// Move everything trashed under the regular-location prefix `req.name`
/// back where it came from. The mapping is reported either way.
pub async fn untrashify(gw: &Gateway, req: &UntrashifyRequest) -> Result<UntrashReport> {
    let prefix = trash_path(&req.name, req.segnum);
    tracing::info!(prefix = %prefix, "listing trash");
    let objects = gw.storage.list(&prefix, &[]).await?;

    let moves: Vec<(String, String)> = objects
        .into_iter()
        .filter_map(|obj| {
            let dest = untrash_path(&obj.path, req.segnum)?;
            Some((obj.path, dest))
        })
        .collect();
    for (from, to) in &moves {
        tracing::info!(path = %from, dest = %to, "object will be untrashified");
    }

    let report = UntrashReport {
        moves,
        confirmed: req.confirm,
    };
    if !req.confirm {
        return Ok(report);
    }

    let storage = &gw.storage;
    let segnum = req.segnum;
    retry_rounds(
        "untrashify",
        report.moves.iter().map(|(from, _)| from.clone()).collect(),
        gw.config.retry_rounds,
        gw.config.delete_concurrency,
        &gw.shutdown,
        |from| async move {
            let to = untrash_path(&from, segnum)
                .ok_or_else(|| anyhow::anyhow!("{from} is not in trash of seg{segnum}"))?;
            storage.move_object(&from, &to).await
        },
    )
    .await?;

    Ok(report)
}
