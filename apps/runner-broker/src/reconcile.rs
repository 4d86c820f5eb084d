use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::BrokerError;
use crate::projects::ProjectStore;

/// Drift between project directories on disk and project rows in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub synced: usize,
    pub orphaned_in_store: usize,
    pub untracked_on_disk: usize,
    pub orphaned_slugs: Vec<String>,
    pub untracked_slugs: Vec<String>,
}

/// Compare sub-directories of `workspace_root` with stored project slugs.
/// Reports only; nothing is created or deleted.
pub async fn reconcile(
    workspace_root: &Path,
    projects: &dyn ProjectStore,
) -> Result<ReconcileReport, BrokerError> {
    let on_disk = list_project_dirs(workspace_root).await?;
    let in_store: BTreeSet<String> = projects
        .list()
        .await?
        .into_iter()
        .map(|p| p.slug)
        .collect();

    let orphaned_slugs: Vec<String> = in_store.difference(&on_disk).cloned().collect();
    let untracked_slugs: Vec<String> = on_disk.difference(&in_store).cloned().collect();
    let report = ReconcileReport {
        synced: in_store.intersection(&on_disk).count(),
        orphaned_in_store: orphaned_slugs.len(),
        untracked_on_disk: untracked_slugs.len(),
        orphaned_slugs,
        untracked_slugs,
    };
    info!(
        synced = report.synced,
        orphaned = report.orphaned_in_store,
        untracked = report.untracked_on_disk,
        "workspace reconciled"
    );
    Ok(report)
}

async fn list_project_dirs(root: &Path) -> Result<BTreeSet<String>, BrokerError> {
    let mut dirs = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        dirs.insert(name);
    }
    Ok(dirs)
}
