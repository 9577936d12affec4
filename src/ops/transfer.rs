//! Move and copy, including cross-base copy with mandatory ownership.

use crate::config::Config;
use crate::error::ApiError;
use crate::gate::{GateError, PathGate, Resolved, ValidateOptions};
use crate::index::store::EntryStat;
use crate::index::IndexStore;
use crate::ops::{build_file_info, ensure_unique_name, rel_path_of, FileInfo};
use crate::upload::ownership_from_fields;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Move,
    Copy,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub mode: TransferMode,
    #[serde(default)]
    pub ensure_unique_name: bool,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub file_mode: Option<String>,
    pub dir_mode: Option<String>,
}

pub async fn transfer(
    gate: &PathGate,
    cfg: &Config,
    index: Option<&Arc<IndexStore>>,
    req: TransferRequest,
) -> Result<FileInfo, ApiError> {
    let ownership = ownership_from_fields(
        req.owner_uid,
        req.owner_gid,
        req.file_mode.as_deref(),
        req.dir_mode.as_deref(),
    )?;

    match req.mode {
        TransferMode::Move => {
            let (from, to) = gate.validate_same_base(&req.from, &req.to).await?;
            fs::symlink_metadata(&from.real_path)
                .await
                .map_err(|_| ApiError::NotFound("not found".to_string()))?;

            let dest = destination(&to, req.ensure_unique_name).await?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&from.real_path, &dest).await?;

            if let Some(own) = &ownership {
                own.apply_recursive(&dest, cfg.dev_override)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
            }

            finish(index, &to, &dest).await
        }
        TransferMode::Copy => {
            let same_base = match gate.validate_same_base(&req.from, &req.to).await {
                Ok(pair) => Some(pair),
                Err(GateError::DifferentBase) => None,
                Err(e) => return Err(e.into()),
            };

            let (from, to) = match same_base {
                Some(pair) => pair,
                None => {
                    let Some(own) = ownership else {
                        return Err(ApiError::BadRequest(
                            "cross-base copy requires ownership (ownerUid, ownerGid, fileMode)"
                                .to_string(),
                        ));
                    };
                    let from = gate.validate(&req.from, &ValidateOptions::default()).await?;
                    let to = gate
                        .validate(
                            &req.to,
                            &ValidateOptions {
                                create_parents: true,
                                ownership: Some(own),
                                ..Default::default()
                            },
                        )
                        .await?;
                    (from, to)
                }
            };

            fs::symlink_metadata(&from.real_path)
                .await
                .map_err(|_| ApiError::NotFound("not found".to_string()))?;

            let dest = destination(&to, req.ensure_unique_name).await?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }

            let src = from.real_path.clone();
            let dst = dest.clone();
            tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))??;

            if let Some(own) = &ownership {
                if let Err(e) = own.apply_recursive(&dest, cfg.dev_override) {
                    remove_tree(&dest).await;
                    return Err(ApiError::Internal(e.to_string()));
                }
            }

            match finish(index, &to, &dest).await {
                Ok(info) => Ok(info),
                Err(e) => {
                    remove_tree(&dest).await;
                    Err(e)
                }
            }
        }
    }
}

/// Pick the final destination, rewriting on collision when requested.
async fn destination(to: &Resolved, ensure_unique: bool) -> Result<PathBuf, ApiError> {
    if ensure_unique {
        Ok(ensure_unique_name(&to.real_path).await?)
    } else {
        Ok(to.real_path.clone())
    }
}

/// Stat the landed tree, index it (a rename keeps its id via the
/// `(dev, ino)` lookup) and shape the response.
async fn finish(
    index: Option<&Arc<IndexStore>>,
    to: &Resolved,
    dest: &Path,
) -> Result<FileInfo, ApiError> {
    let meta = fs::metadata(dest).await?;
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let display = to.path.with_file_name(&name);
    let mut info = build_file_info(&name, &display.to_string_lossy(), &meta);

    if let Some(index) = index {
        if let Some(rel) = rel_path_of(dest, &to.base.real) {
            match index
                .index_file(
                    &to.base.path.to_string_lossy(),
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

async fn remove_tree(path: &Path) {
    let _ = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(_) => return,
    };
}

/// Depth-first tree copy; symlinks are recreated, not followed.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)
    } else {
        std::fs::copy(src, dst).map(|_| ())
    }
}
