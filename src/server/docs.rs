//! Public documentation routes: the OpenAPI document and a markdown
//! digest of the API.

use crate::ops::info::InfoResponse;
use crate::ops::search::{SearchBaseResult, SearchResponse};
use crate::ops::transfer::{TransferMode, TransferRequest};
use crate::ops::{DirInfo, EntryType, FileInfo};
use crate::server::handlers::{self, MkdirRequest};
use crate::upload::{UploadChunkResponse, UploadStartRequest, UploadStartResponse};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Filegate",
        description = "Sandboxed file-operation proxy: bearer-authenticated filesystem operations confined to configured base paths."
    ),
    paths(
        handlers::info,
        handlers::download,
        handlers::upload_single,
        handlers::mkdir,
        handlers::delete_path,
        handlers::transfer,
        handlers::search,
        handlers::upload_start,
        handlers::upload_chunk,
        handlers::thumbnail,
    ),
    components(schemas(
        FileInfo,
        DirInfo,
        EntryType,
        InfoResponse,
        SearchResponse,
        SearchBaseResult,
        MkdirRequest,
        TransferRequest,
        TransferMode,
        UploadStartRequest,
        UploadStartResponse,
        UploadChunkResponse,
    ))
)]
pub struct ApiDoc;

pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

pub async fn markdown_digest() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], DIGEST)
}

const DIGEST: &str = r#"# Filegate API

All `/files/*` endpoints require `Authorization: Bearer <FILE_PROXY_TOKEN>`.
Every path parameter must resolve inside a configured base path; symlink
escapes are rejected with 403. Errors are `{"error": "<message>"}`.

| Method | Path | Purpose |
|---|---|---|
| GET | /health | Liveness probe (public) |
| GET | /files/info | Stat a file or list a directory (`path`, `showHidden`, `computeSizes`) |
| GET | /files/content | Download a file, or a directory as TAR (`path`, `inline`) |
| PUT | /files/content | Upload a single file (`X-File-Path`, `X-File-Name`, optional `X-Owner-UID`/`X-Owner-GID`/`X-File-Mode`/`X-Dir-Mode`) |
| POST | /files/mkdir | Create a directory recursively |
| DELETE | /files/delete | Remove a file or directory tree (`path`) |
| POST | /files/transfer | Move or copy (`from`, `to`, `mode`, `ensureUniqueName`, ownership for cross-base copy) |
| GET | /files/search | Glob search (`paths`, `pattern`, `limit`, `files`, `directories`, `showHidden`) |
| POST | /files/upload/start | Begin or resume a chunked upload session |
| POST | /files/upload/chunk | Submit one chunk (`X-Upload-Id`, `X-Chunk-Index`, optional `X-Chunk-Checksum`; raw body) |
| GET | /files/thumbnail/image | Render an image thumbnail (`path`, `width`, `height`, `fit`, `position`, `format`, `quality`) |

Chunked uploads are content-addressed: `uploadId` is the first 16 hex
characters of `SHA-256(path + ":" + filename + ":" + checksum)`, so
retrying an identical `upload/start` resumes the existing session and
reports already-staged chunks in `uploadedChunks`. Assembly verifies the
whole-file SHA-256 before the destination becomes visible.

Boolean query parameters are strings: `"true"` enables, anything else
disables. The `files` search toggle defaults to true and is disabled only
by a literal `"false"`.
"#;
