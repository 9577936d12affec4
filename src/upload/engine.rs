//! Resumable chunked-upload engine.
//!
//! A session is content-addressed: the id is derived from
//! `(path, filename, checksum)`, so an identical retry lands in the same
//! staging directory and resumes. Chunks commit via temp-file-then-rename;
//! assembly runs under a per-session keyed mutex and verifies the
//! whole-file SHA-256 before the destination becomes visible to callers.

use crate::config::Config;
use crate::error::ApiError;
use crate::gate::{PathGate, ValidateOptions};
use crate::index::store::EntryStat;
use crate::index::IndexStore;
use crate::ops::{build_file_info, rel_path_of, FileInfo};
use crate::owner::Ownership;
use crate::upload::keyed_lock::KeyedMutex;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use utoipa::ToSchema;

/// On-disk session metadata, `<tempDir>/<uploadId>/meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub upload_id: String,
    pub path: String,
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership: Option<Ownership>,
    /// Unix milliseconds; refreshed whenever a session resumes.
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartRequest {
    pub path: String,
    pub filename: String,
    pub size: u64,
    /// `sha256:` + 64 hex characters over the whole file.
    pub checksum: String,
    pub chunk_size: u64,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub file_mode: Option<String>,
    pub dir_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartResponse {
    pub upload_id: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub uploaded_chunks: Vec<u64>,
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkHeaders {
    pub upload_id: String,
    pub chunk_index: u64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(untagged)]
pub enum UploadChunkResponse {
    #[serde(rename_all = "camelCase")]
    Progress {
        chunk_index: u64,
        uploaded_chunks: Vec<u64>,
        completed: bool,
    },
    #[serde(rename_all = "camelCase")]
    Completed { completed: bool, file: FileInfo },
}

pub struct UploadEngine {
    cfg: Arc<Config>,
    gate: Arc<PathGate>,
    index: Option<Arc<IndexStore>>,
    assembly_locks: KeyedMutex,
}

pub fn derive_upload_id(path: &str, filename: &str, checksum: &str) -> String {
    let digest = Sha256::digest(format!("{path}:{filename}:{checksum}").as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn is_sha256_literal(s: &str) -> bool {
    s.strip_prefix("sha256:")
        .map(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
        .unwrap_or(false)
}

fn is_upload_id(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// All-or-nothing ownership from optional request fields.
pub fn ownership_from_fields(
    uid: Option<u32>,
    gid: Option<u32>,
    file_mode: Option<&str>,
    dir_mode: Option<&str>,
) -> Result<Option<Ownership>, ApiError> {
    match (uid, gid, file_mode) {
        (None, None, None) => Ok(None),
        (Some(uid), Some(gid), Some(file_mode)) => {
            Ok(Some(Ownership::from_parts(uid, gid, file_mode, dir_mode)?))
        }
        _ => Err(ApiError::BadRequest(
            "ownership requires ownerUid, ownerGid and fileMode".to_string(),
        )),
    }
}

impl UploadEngine {
    pub fn new(cfg: Arc<Config>, gate: Arc<PathGate>, index: Option<Arc<IndexStore>>) -> Self {
        Self {
            cfg,
            gate,
            index,
            assembly_locks: KeyedMutex::new(),
        }
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.cfg.upload_temp_dir.join(upload_id)
    }

    pub async fn start(&self, req: UploadStartRequest) -> Result<UploadStartResponse, ApiError> {
        if req.size > self.cfg.max_upload_bytes {
            return Err(ApiError::TooLarge("upload too large".to_string()));
        }
        if req.chunk_size == 0 || req.chunk_size > self.cfg.max_chunk_bytes {
            return Err(ApiError::BadRequest("invalid chunk size".to_string()));
        }
        if !is_sha256_literal(&req.checksum) {
            return Err(ApiError::BadRequest("invalid checksum format".to_string()));
        }
        let ownership = ownership_from_fields(
            req.owner_uid,
            req.owner_gid,
            req.file_mode.as_deref(),
            req.dir_mode.as_deref(),
        )?;

        let target = format!("{}/{}", req.path.trim_end_matches('/'), req.filename);
        self.gate
            .validate(
                &target,
                &ValidateOptions {
                    create_parents: true,
                    ownership,
                    ..Default::default()
                },
            )
            .await?;

        let upload_id = derive_upload_id(&req.path, &req.filename, &req.checksum);
        let dir = self.session_dir(&upload_id);

        if let Some(mut meta) = load_meta(&dir).await? {
            // Resume: refresh the expiry clock and report what's staged.
            meta.created_at = chrono::Utc::now().timestamp_millis();
            write_meta(&dir, &meta).await?;
            let uploaded_chunks = list_chunks(&dir).await?;
            return Ok(UploadStartResponse {
                upload_id: meta.upload_id,
                total_chunks: meta.total_chunks,
                chunk_size: meta.chunk_size,
                uploaded_chunks,
                completed: false,
            });
        }

        let total_chunks = req.size.div_ceil(req.chunk_size);
        let meta = UploadMeta {
            upload_id: upload_id.clone(),
            path: req.path.clone(),
            filename: req.filename.clone(),
            size: req.size,
            checksum: req.checksum.clone(),
            chunk_size: req.chunk_size,
            total_chunks,
            ownership,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        fs::create_dir_all(&dir).await?;
        write_meta(&dir, &meta).await?;

        Ok(UploadStartResponse {
            upload_id,
            total_chunks,
            chunk_size: req.chunk_size,
            uploaded_chunks: Vec::new(),
            completed: false,
        })
    }

    pub async fn upload_chunk<S>(
        &self,
        headers: ChunkHeaders,
        mut body: S,
    ) -> Result<UploadChunkResponse, ApiError>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
    {
        if let Some(expected) = headers.checksum.as_deref() {
            if !is_sha256_literal(expected) {
                return Err(ApiError::BadRequest("invalid checksum format".to_string()));
            }
        }
        let dir = self.session_dir(&headers.upload_id);
        let meta = match is_upload_id(&headers.upload_id) {
            true => load_meta(&dir).await?,
            false => None,
        }
        .ok_or_else(|| ApiError::NotFound("upload not found".to_string()))?;

        if headers.chunk_index >= meta.total_chunks {
            return Err(ApiError::BadRequest("invalid chunk index".to_string()));
        }

        let tmp = dir.join(format!("{}.tmp", headers.chunk_index));
        let mut file = fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp).await;
                    return Err(ApiError::Internal(format!("chunk read failed: {e}")));
                }
            };
            written += chunk.len() as u64;
            if written > self.cfg.max_chunk_bytes {
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return Err(ApiError::TooLarge("chunk too large".to_string()));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        if let Some(expected) = headers.checksum.as_deref() {
            if expected != digest {
                let _ = fs::remove_file(&tmp).await;
                return Err(ApiError::BadRequest(format!(
                    "chunk checksum mismatch: expected {expected}, got {digest}"
                )));
            }
        }

        // The rename is the commit point: a chunk is either absent or whole.
        fs::rename(&tmp, dir.join(headers.chunk_index.to_string())).await?;

        let uploaded_chunks = list_chunks(&dir).await?;
        if uploaded_chunks.len() as u64 == meta.total_chunks {
            if let Some(file) = self.assemble(&meta).await? {
                return Ok(UploadChunkResponse::Completed {
                    completed: true,
                    file,
                });
            }
        }
        Ok(UploadChunkResponse::Progress {
            chunk_index: headers.chunk_index,
            uploaded_chunks: list_chunks(&dir).await.unwrap_or_default(),
            completed: false,
        })
    }

    /// Compose the final file. Returns `Ok(None)` when another caller has
    /// already assembled and cleaned the session up.
    async fn assemble(&self, meta: &UploadMeta) -> Result<Option<FileInfo>, ApiError> {
        let _guard = self.assembly_locks.acquire(&meta.upload_id).await;

        let dir = self.session_dir(&meta.upload_id);
        let chunks = list_chunks(&dir).await.unwrap_or_default();
        if chunks.is_empty() {
            return Ok(None);
        }
        let missing: Vec<String> = (0..meta.total_chunks)
            .filter(|i| !chunks.contains(i))
            .map(|i| i.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::Internal(format!(
                "missing chunks: {}",
                missing.join(", ")
            )));
        }

        let target = format!("{}/{}", meta.path.trim_end_matches('/'), meta.filename);
        let resolved = self.gate.validate(&target, &ValidateOptions::default()).await?;
        if let Some(parent) = resolved.real_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut dest = fs::File::create(&resolved.real_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        for i in 0..meta.total_chunks {
            let chunk_path = dir.join(i.to_string());
            let mut chunk = match fs::File::open(&chunk_path).await {
                Ok(f) => f,
                Err(_) => {
                    drop(dest);
                    let _ = fs::remove_file(&resolved.real_path).await;
                    return Err(ApiError::Internal(format!("missing chunks: {i}")));
                }
            };
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                dest.write_all(&buf[..n]).await?;
            }
        }
        dest.flush().await?;
        drop(dest);

        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        if digest != meta.checksum {
            let _ = fs::remove_file(&resolved.real_path).await;
            return Err(ApiError::Internal(format!(
                "checksum mismatch: expected {}, got {digest}",
                meta.checksum
            )));
        }

        if let Some(own) = &meta.ownership {
            if let Err(e) = own.apply_file(&resolved.real_path, self.cfg.dev_override) {
                let _ = fs::remove_file(&resolved.real_path).await;
                return Err(ApiError::Internal(e.to_string()));
            }
        }

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!(upload_id = %meta.upload_id, "staging cleanup failed: {e}");
        }

        let stat = fs::metadata(&resolved.real_path).await?;
        let mut info = build_file_info(
            &meta.filename,
            &resolved.path.to_string_lossy(),
            &stat,
        );
        info.checksum = Some(meta.checksum.clone());
        if let Some(index) = &self.index {
            if let Some(rel) = rel_path_of(&resolved.real_path, &resolved.base.real) {
                match index
                    .index_file(
                        &resolved.base.path.to_string_lossy(),
                        &rel,
                        &EntryStat::from_metadata(&stat),
                        chrono::Utc::now().timestamp_millis(),
                    )
                    .await
                {
                    Ok(outcome) => info.file_id = Some(outcome.id),
                    Err(e) => debug!(path = %rel, "index update failed: {e}"),
                }
            }
        }
        Ok(Some(info))
    }
}

async fn load_meta(dir: &Path) -> Result<Option<UploadMeta>, ApiError> {
    match fs::read(dir.join("meta.json")).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_meta(dir: &Path, meta: &UploadMeta) -> Result<(), ApiError> {
    let tmp = dir.join("meta.json.tmp");
    let body = serde_json::to_vec(meta).map_err(|e| ApiError::Internal(e.to_string()))?;
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, dir.join("meta.json")).await?;
    Ok(())
}

/// Committed chunk indices, sorted ascending.
async fn list_chunks(dir: &Path) -> Result<Vec<u64>, ApiError> {
    let mut chunks = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(chunks),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(index) = entry.file_name().to_string_lossy().parse::<u64>() {
            chunks.push(index);
        }
    }
    chunks.sort_unstable();
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use futures::stream;
    use tempfile::TempDir;

    fn body_of(data: &[u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
    }

    async fn engine(base: &TempDir, staging: &TempDir) -> UploadEngine {
        let mut cfg = Config::from_args(Args::parse_from([
            "filegate",
            "--token",
            "t",
            "--allowed-base-paths",
            &base.path().to_string_lossy(),
        ]))
        .unwrap();
        cfg.upload_temp_dir = staging.path().to_path_buf();
        let cfg = Arc::new(cfg);
        let gate = Arc::new(PathGate::new(&cfg).await.unwrap());
        UploadEngine::new(cfg, gate, None)
    }

    fn start_request(base: &TempDir, payload: &[u8], chunk_size: u64) -> UploadStartRequest {
        let checksum = format!("sha256:{}", hex::encode(Sha256::digest(payload)));
        UploadStartRequest {
            path: base.path().to_string_lossy().into_owned(),
            filename: "data.bin".to_string(),
            size: payload.len() as u64,
            checksum,
            chunk_size,
            owner_uid: None,
            owner_gid: None,
            file_mode: None,
            dir_mode: None,
        }
    }

    #[test]
    fn upload_id_is_deterministic() {
        let a = derive_upload_id("/b", "f.txt", "sha256:aa");
        let b = derive_upload_id("/b", "f.txt", "sha256:aa");
        let c = derive_upload_id("/b", "f.txt", "sha256:ab");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn chunks_out_of_order_assemble_and_clean_up() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let req = start_request(&base, &payload, 1024);
        let started = engine.start(req.clone()).await.unwrap();
        assert_eq!(started.total_chunks, 3);
        assert!(started.uploaded_chunks.is_empty());

        let mut last = None;
        for index in [2u64, 0, 1] {
            let offset = (index * 1024) as usize;
            let end = (offset + 1024).min(payload.len());
            last = Some(
                engine
                    .upload_chunk(
                        ChunkHeaders {
                            upload_id: started.upload_id.clone(),
                            chunk_index: index,
                            checksum: None,
                        },
                        body_of(&payload[offset..end]),
                    )
                    .await
                    .unwrap(),
            );
        }

        match last.unwrap() {
            UploadChunkResponse::Completed { completed, file } => {
                assert!(completed);
                assert_eq!(file.size, payload.len() as u64);
                assert_eq!(file.checksum.as_deref(), Some(req.checksum.as_str()));
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let written = std::fs::read(base.path().join("data.bin")).unwrap();
        assert_eq!(written, payload);
        assert!(
            !staging.path().join(&started.upload_id).exists(),
            "staging directory is removed after assembly"
        );
    }

    #[tokio::test]
    async fn restart_reports_staged_chunks() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let payload = vec![7u8; 3000];
        let req = start_request(&base, &payload, 1024);
        let started = engine.start(req.clone()).await.unwrap();

        for index in [0u64, 1] {
            let offset = (index * 1024) as usize;
            engine
                .upload_chunk(
                    ChunkHeaders {
                        upload_id: started.upload_id.clone(),
                        chunk_index: index,
                        checksum: None,
                    },
                    body_of(&payload[offset..offset + 1024]),
                )
                .await
                .unwrap();
        }

        let resumed = engine.start(req).await.unwrap();
        assert_eq!(resumed.upload_id, started.upload_id);
        assert_eq!(resumed.total_chunks, 3);
        assert_eq!(resumed.uploaded_chunks, vec![0, 1]);
        assert!(!resumed.completed);
    }

    #[tokio::test]
    async fn tampered_payload_fails_assembly_and_unlinks() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let payload = vec![1u8; 2048];
        let req = start_request(&base, &payload, 1024);
        let started = engine.start(req).await.unwrap();

        // First chunk tampered relative to the declared whole-file checksum.
        let mut tampered = payload.clone();
        tampered[0] ^= 0xff;
        engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: started.upload_id.clone(),
                    chunk_index: 0,
                    checksum: None,
                },
                body_of(&tampered[..1024]),
            )
            .await
            .unwrap();

        let err = engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: started.upload_id.clone(),
                    chunk_index: 1,
                    checksum: None,
                },
                body_of(&payload[1024..]),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("checksum mismatch: expected"));
        assert!(!base.path().join("data.bin").exists());
        // Chunks stay staged so the upstream can re-send.
        assert!(staging.path().join(&started.upload_id).join("0").exists());
    }

    #[tokio::test]
    async fn per_chunk_checksum_is_verified() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let payload = vec![5u8; 100];
        let req = start_request(&base, &payload, 1024);
        let started = engine.start(req).await.unwrap();

        let err = engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: started.upload_id.clone(),
                    chunk_index: 0,
                    checksum: Some(format!("sha256:{}", "0".repeat(64))),
                },
                body_of(&payload),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunk checksum mismatch"));
        assert!(!staging.path().join(&started.upload_id).join("0").exists());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let err = engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: "0123456789abcdef".to_string(),
                    chunk_index: 0,
                    checksum: None,
                },
                body_of(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        // A traversal-shaped id never touches the filesystem.
        let err = engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: "../../etc/passwd".to_string(),
                    chunk_index: 0,
                    checksum: None,
                },
                body_of(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn caps_are_enforced() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let mut req = start_request(&base, b"xx", 1024);
        req.size = u64::MAX;
        assert!(matches!(
            engine.start(req).await.unwrap_err(),
            ApiError::TooLarge(_)
        ));

        let mut req = start_request(&base, b"xx", 1024);
        req.chunk_size = u64::MAX;
        assert!(matches!(
            engine.start(req).await.unwrap_err(),
            ApiError::BadRequest(_)
        ));

        let mut req = start_request(&base, b"xx", 1024);
        req.checksum = "md5:abcd".to_string();
        assert!(matches!(
            engine.start(req).await.unwrap_err(),
            ApiError::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn chunk_index_out_of_range_is_rejected() {
        let base = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let engine = engine(&base, &staging).await;

        let payload = vec![9u8; 10];
        let started = engine.start(start_request(&base, &payload, 1024)).await.unwrap();
        let err = engine
            .upload_chunk(
                ChunkHeaders {
                    upload_id: started.upload_id,
                    chunk_index: 5,
                    checksum: None,
                },
                body_of(&payload),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
