//! Stat and directory listing.

use crate::error::ApiError;
use crate::gate::{PathGate, Resolved, ValidateOptions};
use crate::index::store::EntryStat;
use crate::index::IndexStore;
use crate::ops::{build_file_info, dir_size, is_hidden, DirInfo, FileInfo};
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Default)]
pub struct InfoOptions {
    pub show_hidden: bool,
    pub compute_sizes: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum InfoResponse {
    File(FileInfo),
    Dir(DirInfo),
}

pub async fn info(
    gate: &PathGate,
    index: Option<&IndexStore>,
    path: &str,
    opts: InfoOptions,
) -> Result<InfoResponse, ApiError> {
    let resolved = gate
        .validate(
            path,
            &ValidateOptions {
                allow_base_path: true,
                ..Default::default()
            },
        )
        .await?;
    let meta = fs::metadata(&resolved.real_path).await?;

    if meta.is_dir() {
        dir_info(index, &resolved, opts).await.map(InfoResponse::Dir)
    } else {
        let name = entry_name(&resolved.path);
        let mut info = build_file_info(&name, &resolved.path.to_string_lossy(), &meta);
        info.file_id = assign_file_id(index, &resolved, &meta).await;
        Ok(InfoResponse::File(info))
    }
}

async fn dir_info(
    index: Option<&IndexStore>,
    resolved: &Resolved,
    opts: InfoOptions,
) -> Result<DirInfo, ApiError> {
    let display = resolved.path.to_string_lossy().into_owned();
    let name = entry_name(&resolved.path);

    let mut names = Vec::new();
    let mut entries = fs::read_dir(&resolved.real_path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if !opts.show_hidden && is_hidden(&entry_name) {
            continue;
        }
        names.push(entry_name);
    }
    names.sort_unstable();

    // Stat entries in parallel; failures drop the entry silently.
    let stats = futures::future::join_all(names.iter().map(|n| {
        let p = resolved.real_path.join(n);
        async move { fs::metadata(&p).await.ok() }
    }))
    .await;

    let mut items = Vec::with_capacity(names.len());
    for (entry_name, meta) in names.into_iter().zip(stats) {
        let Some(meta) = meta else { continue };
        let child_display = join_display(&display, &entry_name);
        let mut item = build_file_info(&entry_name, &child_display, &meta);
        if opts.compute_sizes && meta.is_dir() {
            item.size = dir_size(&resolved.real_path.join(&entry_name))
                .await
                .unwrap_or(0);
        }
        if let Some(index) = index {
            let base_key = resolved.base.path.to_string_lossy();
            if let Some(rel) =
                crate::ops::rel_path_of(&resolved.real_path.join(&entry_name), &resolved.base.real)
            {
                match index.identify_path(&base_key, &rel).await {
                    Ok(id) => item.file_id = id,
                    Err(e) => debug!(path = %rel, "index lookup failed: {e}"),
                }
            }
        }
        items.push(item);
    }

    let dir_meta = fs::metadata(&resolved.real_path).await?;
    let mut info = build_file_info(&name, &display, &dir_meta);
    let total = if opts.compute_sizes {
        let sum = items.iter().map(|i| i.size).sum();
        info.size = sum;
        sum
    } else {
        0
    };
    info.file_id = assign_file_id(index, resolved, &dir_meta).await;

    Ok(DirInfo { info, items, total })
}

/// Files and directories get an id on demand; listing entries only look
/// existing ids up (the scanner is the bulk populater).
async fn assign_file_id(
    index: Option<&IndexStore>,
    resolved: &Resolved,
    meta: &std::fs::Metadata,
) -> Option<String> {
    let index = index?;
    let rel = crate::ops::rel_path_of(&resolved.real_path, &resolved.base.real)?;
    if rel.is_empty() {
        return None;
    }
    match index
        .index_file(
            &resolved.base.path.to_string_lossy(),
            &rel,
            &EntryStat::from_metadata(meta),
            chrono::Utc::now().timestamp_millis(),
        )
        .await
    {
        Ok(outcome) => Some(outcome.id),
        Err(e) => {
            debug!(path = %rel, "index update failed: {e}");
            None
        }
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

fn join_display(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, Config};
    use clap::Parser;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn gate_for(dir: &TempDir) -> PathGate {
        let cfg = Config::from_args(Args::parse_from([
            "filegate",
            "--token",
            "t",
            "--allowed-base-paths",
            &dir.path().to_string_lossy(),
        ]))
        .unwrap();
        PathGate::new(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn lists_directory_with_hidden_filtering() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"h").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let gate = gate_for(&dir).await;
        let path = dir.path().to_string_lossy();

        let res = info(&gate, None, &path, InfoOptions::default()).await.unwrap();
        let InfoResponse::Dir(dir_info) = res else {
            panic!("expected directory")
        };
        let names: Vec<_> = dir_info.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);

        let res = info(
            &gate,
            None,
            &path,
            InfoOptions {
                show_hidden: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let InfoResponse::Dir(dir_info) = res else {
            panic!("expected directory")
        };
        assert_eq!(dir_info.items.len(), 3);
    }

    #[tokio::test]
    async fn file_info_has_mime_and_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        let gate = gate_for(&dir).await;

        let target = format!("{}/a.json", dir.path().display());
        let res = info(&gate, None, &target, InfoOptions::default()).await.unwrap();
        let InfoResponse::File(fi) = res else {
            panic!("expected file")
        };
        assert_eq!(fi.size, 2);
        assert_eq!(fi.mime_type.as_deref(), Some("application/json"));
        assert!(!fi.is_hidden);
    }

    #[tokio::test]
    async fn compute_sizes_fills_directory_totals() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.bin"), vec![0u8; 300]).unwrap();
        std::fs::write(dir.path().join("top.bin"), vec![0u8; 200]).unwrap();

        let gate = gate_for(&dir).await;
        let path = dir.path().to_string_lossy();

        let res = info(
            &gate,
            None,
            &path,
            InfoOptions {
                compute_sizes: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let InfoResponse::Dir(dir_info) = res else {
            panic!("expected directory")
        };
        assert_eq!(dir_info.total, 500);
        let sub = dir_info.items.iter().find(|i| i.name == "sub").unwrap();
        assert_eq!(sub.size, 300);
    }

    #[tokio::test]
    async fn enriches_with_file_id_when_index_enabled() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let gate = gate_for(&dir).await;
        let index = Arc::new(IndexStore::connect("sqlite::memory:").await.unwrap());

        let target = format!("{}/a.txt", dir.path().display());
        let res = info(&gate, Some(&index), &target, InfoOptions::default())
            .await
            .unwrap();
        let InfoResponse::File(fi) = res else {
            panic!("expected file")
        };
        let id = fi.file_id.expect("file id assigned on demand");

        // Second stat resolves to the same identity.
        let res = info(&gate, Some(&index), &target, InfoOptions::default())
            .await
            .unwrap();
        let InfoResponse::File(fi) = res else {
            panic!("expected file")
        };
        assert_eq!(fi.file_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(&dir).await;
        let target = format!("{}/absent", dir.path().display());
        let err = info(&gate, None, &target, InfoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
