//! Streaming content transfer: file/directory download and single-file
//! upload.

use crate::config::Config;
use crate::error::ApiError;
use crate::gate::{PathGate, ValidateOptions};
use crate::index::store::EntryStat;
use crate::index::IndexStore;
use crate::ops::{build_file_info, dir_size, rel_path_of, sanitize_filename, FileInfo};
use crate::owner::Ownership;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io::Seek;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub async fn download(
    gate: &PathGate,
    cfg: &Config,
    path: &str,
    inline: bool,
) -> Result<Response, ApiError> {
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
        return download_dir(cfg, &resolved.real_path).await;
    }

    if meta.len() > cfg.max_download_bytes {
        return Err(ApiError::TooLarge("download too large".to_string()));
    }

    let name = resolved
        .real_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let file = fs::File::open(&resolved.real_path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.essence_str())
        .header(header::CONTENT_LENGTH, meta.len())
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        content_disposition(inline, &name),
    );
    Ok(response)
}

/// Package a directory subtree as an uncompressed TAR stream.
async fn download_dir(cfg: &Config, real: &Path) -> Result<Response, ApiError> {
    let total = dir_size(real).await?;
    if total > cfg.max_download_bytes {
        return Err(ApiError::TooLarge("download too large".to_string()));
    }

    let dirname = real
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());

    // Spool the archive to an unlinked temp file, then stream it out; the
    // subtree may be far larger than what we want in memory.
    let src = real.to_path_buf();
    let prefix = dirname.clone();
    let spooled = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let mut file = tempfile::tempfile()?;
        {
            let mut builder = tar::Builder::new(&mut file);
            builder.follow_symlinks(false);
            builder.append_dir_all(&prefix, &src)?;
            builder.finish()?;
        }
        file.rewind()?;
        Ok(file)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    let len = spooled.metadata().map(|m| m.len()).ok();
    let body = Body::from_stream(ReaderStream::new(fs::File::from_std(spooled)));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-tar");
    if let Some(len) = len {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    let mut response = builder
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        content_disposition(false, &format!("{dirname}.tar")),
    );
    Ok(response)
}

#[derive(Debug, Clone)]
pub struct SingleUpload {
    pub path: String,
    pub filename: String,
    pub ownership: Option<Ownership>,
}

/// Stream a request body to disk behind the gate, applying the byte cap
/// while reading. Partial files never survive a failure.
pub async fn upload_file<S>(
    gate: &PathGate,
    cfg: &Config,
    index: Option<&Arc<IndexStore>>,
    req: SingleUpload,
    mut body: S,
) -> Result<FileInfo, ApiError>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    let sanitized = sanitize_filename(&req.filename);
    if sanitized.is_empty() || sanitized != req.filename {
        return Err(ApiError::BadRequest("invalid filename".to_string()));
    }

    let target = format!("{}/{}", req.path.trim_end_matches('/'), req.filename);
    let resolved = gate
        .validate(
            &target,
            &ValidateOptions {
                create_parents: true,
                ownership: req.ownership,
                ..Default::default()
            },
        )
        .await?;

    let mut file = fs::File::create(&resolved.real_path).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&resolved.real_path).await;
                return Err(ApiError::Internal(format!("upload read failed: {e}")));
            }
        };
        written += chunk.len() as u64;
        if written > cfg.max_upload_bytes {
            drop(file);
            let _ = fs::remove_file(&resolved.real_path).await;
            return Err(ApiError::TooLarge("upload too large".to_string()));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    if let Some(own) = &req.ownership {
        if let Err(e) = own.apply_file(&resolved.real_path, cfg.dev_override) {
            let _ = fs::remove_file(&resolved.real_path).await;
            return Err(ApiError::Internal(e.to_string()));
        }
    }

    let meta = fs::metadata(&resolved.real_path).await?;
    let mut info = build_file_info(&req.filename, &resolved.path.to_string_lossy(), &meta);
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

/// `inline`/`attachment` with both an ASCII fallback and the RFC 5987
/// UTF-8 parameter.
fn content_disposition(inline: bool, name: &str) -> HeaderValue {
    let kind = if inline { "inline" } else { "attachment" };
    let ascii: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && c != '"' && c != '\\' && !c.is_ascii_control() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "{kind}; filename=\"{ascii}\"; filename*=UTF-8''{}",
        rfc5987_encode(name)
    );
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""))
}

/// Percent-encode everything outside RFC 5987's attr-char set.
fn rfc5987_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.as_bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => out.push(*byte as char),
            b'!' | b'#' | b'$' | b'&' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
