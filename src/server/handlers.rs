//! Endpoint handlers: query/header parsing and mapping component results
//! onto HTTP responses. Boolean query parameters are string-typed: "true"
//! is true and anything else is false, except `files` which defaults to
//! true and is only disabled by a literal "false".

use crate::error::ApiError;
use crate::ops::content::SingleUpload;
use crate::ops::info::{InfoOptions, InfoResponse};
use crate::ops::search::{SearchParams, SearchResponse};
use crate::ops::thumbnail::{Fit, Format, Position, ThumbnailParams};
use crate::ops::transfer::TransferRequest;
use crate::ops::{self, FileInfo};
use crate::server::AppState;
use crate::upload::{ChunkHeaders, UploadChunkResponse, UploadStartRequest, UploadStartResponse};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;

fn flag(value: Option<&str>) -> bool {
    value == Some("true")
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ApiError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("{name} is required"))),
    }
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoQuery {
    path: Option<String>,
    show_hidden: Option<String>,
    compute_sizes: Option<String>,
}

#[utoipa::path(
    get,
    path = "/files/info",
    responses((status = 200, description = "File or directory info", body = InfoResponse))
)]
pub async fn info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<InfoResponse>, ApiError> {
    let path = required(query.path.as_deref(), "path")?;
    let response = ops::info::info(
        &state.gate,
        state.index.as_deref(),
        path,
        InfoOptions {
            show_hidden: flag(query.show_hidden.as_deref()),
            compute_sizes: flag(query.compute_sizes.as_deref()),
        },
    )
    .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    path: Option<String>,
    inline: Option<String>,
}

#[utoipa::path(
    get,
    path = "/files/content",
    responses((status = 200, description = "File bytes, or a TAR stream for a directory"))
)]
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
) -> Result<Response, ApiError> {
    let path = required(query.path.as_deref(), "path")?;
    ops::content::download(&state.gate, &state.cfg, path, flag(query.inline.as_deref())).await
}

#[utoipa::path(
    put,
    path = "/files/content",
    responses((status = 201, description = "Uploaded file info", body = FileInfo))
)]
pub async fn upload_single(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let path = required(header_str(&headers, "x-file-path"), "X-File-Path")?.to_string();
    let filename = required(header_str(&headers, "x-file-name"), "X-File-Name")?.to_string();
    let ownership = crate::upload::ownership_from_fields(
        header_u32(&headers, "x-owner-uid")?,
        header_u32(&headers, "x-owner-gid")?,
        header_str(&headers, "x-file-mode"),
        header_str(&headers, "x-dir-mode"),
    )?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let info = ops::content::upload_file(
        &state.gate,
        &state.cfg,
        state.index.as_ref(),
        SingleUpload {
            path,
            filename,
            ownership,
        },
        stream,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MkdirRequest {
    path: String,
    owner_uid: Option<u32>,
    owner_gid: Option<u32>,
    file_mode: Option<String>,
    dir_mode: Option<String>,
}

#[utoipa::path(
    post,
    path = "/files/mkdir",
    request_body = MkdirRequest,
    responses((status = 201, description = "Created directory info", body = FileInfo))
)]
pub async fn mkdir(
    State(state): State<AppState>,
    Json(req): Json<MkdirRequest>,
) -> Result<Response, ApiError> {
    let ownership = crate::upload::ownership_from_fields(
        req.owner_uid,
        req.owner_gid,
        req.file_mode.as_deref(),
        req.dir_mode.as_deref(),
    )?;
    let info = ops::manage::mkdir(
        &state.gate,
        state.index.as_ref(),
        state.cfg.dev_override,
        &req.path,
        ownership,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    path: Option<String>,
}

#[utoipa::path(
    delete,
    path = "/files/delete",
    responses((status = 204, description = "Removed"))
)]
pub async fn delete_path(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    let path = required(query.path.as_deref(), "path")?;
    ops::manage::delete(&state.gate, state.index.as_ref(), path).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/files/transfer",
    request_body = TransferRequest,
    responses((status = 200, description = "Transferred entry info", body = FileInfo))
)]
pub async fn transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<FileInfo>, ApiError> {
    let info = ops::transfer::transfer(&state.gate, &state.cfg, state.index.as_ref(), req).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    paths: Option<String>,
    pattern: Option<String>,
    limit: Option<String>,
    files: Option<String>,
    directories: Option<String>,
    show_hidden: Option<String>,
}

#[utoipa::path(
    get,
    path = "/files/search",
    responses((status = 200, description = "Glob matches per base", body = SearchResponse))
)]
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    let paths = required(query.paths.as_deref(), "paths")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let pattern = required(query.pattern.as_deref(), "pattern")?.to_string();
    let limit = match query.limit.as_deref() {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest("invalid limit".to_string()))?,
        None => state.cfg.search_max_results,
    };

    let response = ops::search::search(
        &state.gate,
        &state.cfg,
        SearchParams {
            paths,
            pattern,
            limit,
            files: query.files.as_deref() != Some("false"),
            directories: flag(query.directories.as_deref()),
            show_hidden: flag(query.show_hidden.as_deref()),
        },
    )
    .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/files/upload/start",
    request_body = UploadStartRequest,
    responses((status = 200, description = "Session state", body = UploadStartResponse))
)]
pub async fn upload_start(
    State(state): State<AppState>,
    Json(req): Json<UploadStartRequest>,
) -> Result<Json<UploadStartResponse>, ApiError> {
    Ok(Json(state.uploads.start(req).await?))
}

#[utoipa::path(
    post,
    path = "/files/upload/chunk",
    responses((status = 200, description = "Progress or completion", body = UploadChunkResponse))
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadChunkResponse>, ApiError> {
    let upload_id = required(header_str(&headers, "x-upload-id"), "X-Upload-Id")?.to_string();
    let chunk_index = required(header_str(&headers, "x-chunk-index"), "X-Chunk-Index")?
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("invalid chunk index".to_string()))?;
    let checksum = header_str(&headers, "x-chunk-checksum").map(str::to_string);

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let response = state
        .uploads
        .upload_chunk(
            ChunkHeaders {
                upload_id,
                chunk_index,
                checksum,
            },
            stream,
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailQuery {
    path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fit: Option<String>,
    position: Option<String>,
    format: Option<String>,
    quality: Option<u8>,
}

#[utoipa::path(
    get,
    path = "/files/thumbnail/image",
    responses(
        (status = 200, description = "Rendered thumbnail"),
        (status = 304, description = "Client copy is fresh")
    )
)]
pub async fn thumbnail(
    State(state): State<AppState>,
    Query(query): Query<ThumbnailQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = required(query.path.as_deref(), "path")?;
    let defaults = ThumbnailParams::default();
    let params = ThumbnailParams {
        width: query.width.unwrap_or(defaults.width),
        height: query.height.unwrap_or(defaults.height),
        fit: parse_fit(query.fit.as_deref())?,
        position: parse_position(query.position.as_deref())?,
        format: parse_format(query.format.as_deref())?,
        quality: query.quality.unwrap_or(defaults.quality),
    };
    ops::thumbnail::thumbnail(&state.gate, path, params, &headers).await
}

fn parse_fit(raw: Option<&str>) -> Result<Fit, ApiError> {
    match raw {
        None => Ok(Fit::default()),
        Some("cover") => Ok(Fit::Cover),
        Some("contain") => Ok(Fit::Contain),
        Some("fill") => Ok(Fit::Fill),
        Some("inside") => Ok(Fit::Inside),
        Some("outside") => Ok(Fit::Outside),
        Some(_) => Err(ApiError::BadRequest("invalid fit".to_string())),
    }
}

fn parse_position(raw: Option<&str>) -> Result<Position, ApiError> {
    match raw {
        None => Ok(Position::default()),
        Some("center") => Ok(Position::Center),
        Some("top") => Ok(Position::Top),
        Some("bottom") => Ok(Position::Bottom),
        Some("left") => Ok(Position::Left),
        Some("right") => Ok(Position::Right),
        Some("entropy") => Ok(Position::Entropy),
        Some("attention") => Ok(Position::Attention),
        Some(_) => Err(ApiError::BadRequest("invalid position".to_string())),
    }
}

fn parse_format(raw: Option<&str>) -> Result<Format, ApiError> {
    match raw {
        None => Ok(Format::default()),
        Some("webp") => Ok(Format::Webp),
        Some("jpeg") => Ok(Format::Jpeg),
        Some("png") => Ok(Format::Png),
        Some("avif") => Ok(Format::Avif),
        Some(_) => Err(ApiError::BadRequest("invalid format".to_string())),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Result<Option<u32>, ApiError> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("invalid {name}"))),
    }
}
