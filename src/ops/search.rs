//! Capped glob search over validated base roots.

use crate::config::Config;
use crate::error::ApiError;
use crate::gate::{PathGate, ValidateOptions};
use crate::ops::{build_file_info, is_hidden, FileInfo};
use globset::GlobBuilder;
use serde::Serialize;
use std::path::PathBuf;
use utoipa::ToSchema;
use walkdir::WalkDir;

pub const MAX_PATTERN_LEN: usize = 500;

#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Comma-separated list in the query; split by the handler.
    pub paths: Vec<String>,
    pub pattern: String,
    pub limit: usize,
    pub files: bool,
    pub directories: bool,
    pub show_hidden: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchBaseResult {
    pub base_path: String,
    pub files: Vec<FileInfo>,
    pub has_more: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchBaseResult>,
    pub total_files: u64,
}

pub async fn search(
    gate: &PathGate,
    cfg: &Config,
    params: SearchParams,
) -> Result<SearchResponse, ApiError> {
    if !params.files && !params.directories {
        return Err(ApiError::BadRequest(
            "at least one of files or directories must be enabled".to_string(),
        ));
    }
    if params.pattern.is_empty() {
        return Err(ApiError::BadRequest("pattern is required".to_string()));
    }
    if params.pattern.len() > MAX_PATTERN_LEN {
        return Err(ApiError::BadRequest("pattern too long".to_string()));
    }
    if params.pattern.matches("**").count() > cfg.search_max_recursive_wildcards {
        return Err(ApiError::BadRequest(
            "too many recursive wildcards".to_string(),
        ));
    }
    let matcher = GlobBuilder::new(&params.pattern)
        .literal_separator(true)
        .build()
        .map_err(|_| ApiError::BadRequest("invalid pattern".to_string()))?
        .compile_matcher();

    let limit = params.limit.min(cfg.search_max_results).max(1);

    // Validate every root up front so one bad path fails the request
    // before any traversal starts.
    let mut roots = Vec::new();
    for raw in &params.paths {
        let resolved = gate
            .validate(
                raw,
                &ValidateOptions {
                    allow_base_path: true,
                    ..Default::default()
                },
            )
            .await?;
        let meta = tokio::fs::metadata(&resolved.real_path).await?;
        if !meta.is_dir() {
            return Err(ApiError::BadRequest("not a directory".to_string()));
        }
        roots.push((
            resolved.path.to_string_lossy().into_owned(),
            resolved.real_path,
        ));
    }

    let show_hidden = params.show_hidden;
    let want_files = params.files;
    let want_dirs = params.directories;

    let walks = roots.into_iter().map(|(display, root)| {
        let matcher = matcher.clone();
        tokio::task::spawn_blocking(move || {
            walk_base(
                display,
                root,
                &matcher,
                limit,
                show_hidden,
                want_files,
                want_dirs,
            )
        })
    });

    let mut results = Vec::new();
    let mut total_files = 0u64;
    for joined in futures::future::join_all(walks).await {
        let result = joined.map_err(|e| ApiError::Internal(e.to_string()))?;
        total_files += result.files.len() as u64;
        results.push(result);
    }
    Ok(SearchResponse {
        results,
        total_files,
    })
}

fn walk_base(
    display: String,
    root: PathBuf,
    matcher: &globset::GlobMatcher,
    limit: usize,
    show_hidden: bool,
    want_files: bool,
    want_dirs: bool,
) -> SearchBaseResult {
    let mut files = Vec::new();
    let mut has_more = false;

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || show_hidden || !is_hidden(&e.file_name().to_string_lossy())
        });

    for entry in walker {
        let Ok(entry) = entry else { continue };
        if entry.depth() == 0 {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&root) else {
            continue;
        };
        if !matcher.is_match(rel) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.file_type().is_symlink() {
            continue;
        }
        if (meta.is_dir() && !want_dirs) || (!meta.is_dir() && !want_files) {
            continue;
        }
        if files.len() == limit {
            has_more = true;
            break;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_display = format!("{}/{}", display.trim_end_matches('/'), rel.display());
        files.push(build_file_info(&name, &child_display, &meta));
    }

    SearchBaseResult {
        base_path: display,
        files,
        has_more,
    }
}
