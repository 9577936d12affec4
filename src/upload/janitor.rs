//! Expired-session janitor: sweeps the upload staging directory, removing
//! sessions whose meta is unreadable or whose age exceeds the configured
//! expiry. Removal is best-effort; a failed removal is retried on the next
//! cycle simply by still being there.

use crate::config::Config;
use crate::upload::engine::UploadMeta;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// One-shot run shortly after startup, then a fixed-interval loop.
pub async fn run(cfg: Arc<Config>) {
    tokio::time::sleep(Duration::from_secs(10)).await;
    sweep_expired(&cfg).await;
    loop {
        tokio::time::sleep(cfg.disk_cleanup_interval).await;
        sweep_expired(&cfg).await;
    }
}

/// Remove expired or broken sessions; returns how many were removed.
pub async fn sweep_expired(cfg: &Config) -> u64 {
    let mut removed = 0u64;
    let mut entries = match fs::read_dir(&cfg.upload_temp_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(dir = %cfg.upload_temp_dir.display(), "janitor cannot list staging dir: {e}");
            return 0;
        }
    };

    let now = chrono::Utc::now().timestamp_millis();
    let expiry_ms = cfg.upload_expiry.as_millis() as i64;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(_) => break,
        };
        let path = entry.path();
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let expired = match fs::read(path.join("meta.json")).await {
            Ok(bytes) => match serde_json::from_slice::<UploadMeta>(&bytes) {
                Ok(meta) => now - meta.created_at > expiry_ms,
                Err(_) => true,
            },
            Err(_) => true,
        };
        if !expired {
            continue;
        }

        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                removed += 1;
                debug!(session = %path.display(), "removed expired upload session");
            }
            Err(e) => warn!(session = %path.display(), "janitor removal failed: {e}"),
        }
    }

    if removed > 0 {
        info!(removed, "upload janitor cycle complete");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use tempfile::TempDir;

    fn cfg_with_staging(staging: &TempDir) -> Config {
        let mut cfg = Config::from_args(Args::parse_from([
            "filegate",
            "--token",
            "t",
            "--allowed-base-paths",
            "/tmp",
        ]))
        .unwrap();
        cfg.upload_temp_dir = staging.path().to_path_buf();
        cfg
    }

    fn seed_session(staging: &TempDir, id: &str, created_at: i64) {
        let dir = staging.path().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let meta = UploadMeta {
            upload_id: id.to_string(),
            path: "/tmp".to_string(),
            filename: "f".to_string(),
            size: 1,
            checksum: format!("sha256:{}", "a".repeat(64)),
            chunk_size: 1,
            total_chunks: 1,
            ownership: None,
            created_at,
        };
        std::fs::write(dir.join("meta.json"), serde_json::to_vec(&meta).unwrap()).unwrap();
        std::fs::write(dir.join("0"), b"chunk").unwrap();
    }

    #[tokio::test]
    async fn removes_expired_and_broken_sessions_only() {
        let staging = TempDir::new().unwrap();
        let cfg = cfg_with_staging(&staging);
        let now = chrono::Utc::now().timestamp_millis();

        seed_session(&staging, "11112222aaaabbbb", now); // fresh
        seed_session(&staging, "3333444455556666", now - 25 * 3600 * 1000); // expired
        std::fs::create_dir_all(staging.path().join("deadbeefdeadbeef")).unwrap(); // no meta
        std::fs::write(staging.path().join("stray.txt"), b"ignore me").unwrap();

        let removed = sweep_expired(&cfg).await;
        assert_eq!(removed, 2);
        assert!(staging.path().join("11112222aaaabbbb").exists());
        assert!(!staging.path().join("3333444455556666").exists());
        assert!(!staging.path().join("deadbeefdeadbeef").exists());
        assert!(staging.path().join("stray.txt").exists());
    }
}
