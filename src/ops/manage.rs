//! Directory creation and recursive deletion.

use crate::error::ApiError;
use crate::gate::{PathGate, ValidateOptions};
use crate::index::store::EntryStat;
use crate::index::IndexStore;
use crate::ops::{build_file_info, rel_path_of, FileInfo};
use crate::owner::Ownership;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Recursive create with ownership; a failed ownership application rolls
/// the created subtree back.
pub async fn mkdir(
    gate: &PathGate,
    index: Option<&Arc<IndexStore>>,
    dev_override: Option<(u32, u32)>,
    path: &str,
    ownership: Option<Ownership>,
) -> Result<FileInfo, ApiError> {
    // Identify the rollback root on the as-given path before the gate
    // creates any parents.
    let created_root = first_missing_ancestor(&crate::gate::normalize_lexical(path)).await;
    let resolved = gate
        .validate(
            path,
            &ValidateOptions {
                create_parents: true,
                ..Default::default()
            },
        )
        .await?;
    fs::create_dir_all(&resolved.real_path).await?;

    if let Some(own) = &ownership {
        let target = created_root.clone().unwrap_or_else(|| resolved.real_path.clone());
        if let Err(e) = own.apply_recursive(&target, dev_override) {
            if let Some(created) = created_root {
                let _ = fs::remove_dir_all(&created).await;
            }
            return Err(ApiError::Internal(e.to_string()));
        }
    }

    let meta = fs::metadata(&resolved.real_path).await?;
    let name = resolved
        .real_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut info = build_file_info(&name, &resolved.path.to_string_lossy(), &meta);
    if let Some(index) = index {
        if let Some(rel) = rel_path_of(&resolved.real_path, &resolved.base.real) {
            match index
                .index_file(
                    &resolved.base.path.to_string_lossy(),
                    &rel,
                    &EntryStat::from_metadata(&meta),
                    chrono::Utc::now().timestamp_millis(),
                )
                .await
            {
                Ok(outcome) => info.file_id = Some(outcome.id),
                Err(e) => debug!(path = %rel, "index update failed: {e}"),
            }
        }
    }
    Ok(info)
}

/// Recursive remove; index removal is best-effort and never fails the
/// delete itself.
pub async fn delete(
    gate: &PathGate,
    index: Option<&Arc<IndexStore>>,
    path: &str,
) -> Result<(), ApiError> {
    let resolved = gate.validate(path, &ValidateOptions::default()).await?;
    let meta = fs::metadata(&resolved.real_path).await?;

    if meta.is_dir() {
        fs::remove_dir_all(&resolved.real_path).await?;
    } else {
        fs::remove_file(&resolved.real_path).await?;
    }

    if let Some(index) = index {
        if let Some(rel) = rel_path_of(&resolved.real_path, &resolved.base.real) {
            let base_key = resolved.base.path.to_string_lossy();
            let result = if meta.is_dir() {
                index.remove_from_index_recursive(&base_key, &rel).await
            } else {
                index.remove_from_index(&base_key, &rel).await
            };
            if let Err(e) = result {
                warn!(path = %rel, "index removal failed: {e}");
            }
        }
    }
    Ok(())
}

/// Topmost path component that does not exist yet, walking down from the
/// first existing ancestor.
async fn first_missing_ancestor(target: &Path) -> Option<PathBuf> {
    let mut missing = None;
    let mut cur = target.to_path_buf();
    loop {
        if fs::symlink_metadata(&cur).await.is_ok() {
            return missing;
        }
        missing = Some(cur.clone());
        match cur.parent() {
            Some(p) => cur = p.to_path_buf(),
            None => return missing,
        }
    }
}
