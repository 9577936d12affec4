//! File operations: shared payload types and path helpers, with the
//! operations themselves split per concern.

pub mod content;
pub mod info;
pub mod manage;
pub mod search;
pub mod thumbnail;
pub mod transfer;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::path::Path;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

/// Wire representation of a filesystem entry.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub size: u64,
    /// RFC 3339 modification time.
    pub mtime: String,
    pub is_hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// `FileInfo` extended with directory contents.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirInfo {
    #[serde(flatten)]
    pub info: FileInfo,
    pub items: Vec<FileInfo>,
    pub total: u64,
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub fn rfc3339_mtime(meta: &Metadata) -> String {
    let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
    DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build a `FileInfo` from a stat result. `display_path` is the
/// request-space path, not the resolved one.
pub fn build_file_info(name: &str, display_path: &str, meta: &Metadata) -> FileInfo {
    let kind = if meta.is_dir() {
        EntryType::Directory
    } else {
        EntryType::File
    };
    FileInfo {
        name: name.to_string(),
        path: display_path.to_string(),
        kind,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime: rfc3339_mtime(meta),
        is_hidden: is_hidden(name),
        mime_type: match kind {
            EntryType::File => Some(
                mime_guess::from_path(name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            ),
            EntryType::Directory => None,
        },
        file_id: None,
        checksum: None,
    }
}

/// Path of `real` relative to its base, as stored in the index.
pub fn rel_path_of(real: &Path, base_real: &Path) -> Option<String> {
    real.strip_prefix(base_real)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Recursive on-disk size: walk and sum `st_size`.
pub async fn dir_size(path: &Path) -> std::io::Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&path).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

/// Strip separators, control characters and reserved device names. Single
/// upload rejects any name that differs after this pass.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\'))
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned == "." || cleaned == ".." {
        return String::new();
    }
    let stem = cleaned.split('.').next().unwrap_or("").to_ascii_uppercase();
    const RESERVED: [&str; 4] = ["CON", "PRN", "AUX", "NUL"];
    if RESERVED.contains(&stem.as_str())
        || (stem.len() == 4
            && (stem.starts_with("COM") || stem.starts_with("LPT"))
            && stem.as_bytes()[3].is_ascii_digit())
    {
        return String::new();
    }
    cleaned
}

/// Destination-renaming policy: `-01..-99`, then a unix-ms suffix.
pub async fn ensure_unique_name(target: &Path) -> std::io::Result<std::path::PathBuf> {
    if tokio::fs::symlink_metadata(target).await.is_err() {
        return Ok(target.to_path_buf());
    }
    let dir = target.parent().unwrap_or(Path::new("/"));
    let (stem, ext) = split_name(target);
    for i in 1..=99u32 {
        let candidate = dir.join(format!("{stem}-{i:02}{ext}"));
        if tokio::fs::symlink_metadata(&candidate).await.is_err() {
            return Ok(candidate);
        }
    }
    let ms = Utc::now().timestamp_millis();
    Ok(dir.join(format!("{stem}-{ms}{ext}")))
}

/// ("a", ".txt") for `a.txt`; hidden files keep the leading dot in the stem.
fn split_name(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.rfind('.') {
        Some(idx) if idx > 0 => (name[..idx].to_string(), name[idx..].to_string()),
        _ => (name, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("weird name.txt"), "weird name.txt");
    }

    #[test]
    fn sanitize_rejects_traversal_and_devices() {
        assert_ne!(sanitize_filename("../evil"), "../evil");
        assert_ne!(sanitize_filename("a/b"), "a/b");
        assert_ne!(sanitize_filename("a\\b"), "a\\b");
        assert_eq!(sanitize_filename("NUL"), "");
        assert_eq!(sanitize_filename("com1.txt"), "");
        assert_eq!(sanitize_filename(".."), "");
        assert_ne!(sanitize_filename("tab\there"), "tab\there");
    }

    #[tokio::test]
    async fn unique_name_counts_up_with_padding() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.txt");
        assert_eq!(ensure_unique_name(&target).await.unwrap(), target);

        std::fs::write(&target, b"x").unwrap();
        let next = ensure_unique_name(&target).await.unwrap();
        assert_eq!(next.file_name().unwrap(), "a-01.txt");

        std::fs::write(&next, b"x").unwrap();
        let next = ensure_unique_name(&target).await.unwrap();
        assert_eq!(next.file_name().unwrap(), "a-02.txt");
    }

    #[tokio::test]
    async fn unique_name_without_extension() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("archive");
        std::fs::write(&target, b"x").unwrap();
        let next = ensure_unique_name(&target).await.unwrap();
        assert_eq!(next.file_name().unwrap(), "archive-01");
    }

    #[tokio::test]
    async fn dir_size_sums_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()).await.unwrap(), 150);
    }

    #[test]
    fn file_info_marks_hidden_and_mime() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), b"x").unwrap();
        let meta = std::fs::metadata(dir.path().join(".env")).unwrap();
        let info = build_file_info(".env", "/base/.env", &meta);
        assert!(info.is_hidden);
        assert_eq!(info.kind, EntryType::File);
        assert!(info.mime_type.is_some());
    }
}
