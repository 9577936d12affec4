//! Concurrent directory walk that keeps the index in step with disk.
//!
//! BFS over a shared FIFO: workers pop a directory, compare its mtime to
//! the scan-state cache, and either bulk-bump the subtree (skip) or
//! enumerate and index every entry. Each directory appears in the queue at
//! most once, so workers never collide on the same directory. After the
//! queue drains, rows the scan generation never touched are swept.

use crate::gate::BasePath;
use crate::index::store::{EntryStat, IndexAction, IndexStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scanned: u64,
    pub skipped: u64,
    pub added: u64,
    pub moved: u64,
    pub removed: u64,
    pub duration_ms: u64,
}

#[derive(Default)]
struct Tally {
    scanned: AtomicU64,
    skipped: AtomicU64,
    added: AtomicU64,
    moved: AtomicU64,
}

pub struct Scanner {
    index: Arc<IndexStore>,
    concurrency: usize,
}

impl Scanner {
    pub fn new(index: Arc<IndexStore>, concurrency: usize) -> Self {
        Self {
            index,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn scan_all(&self, bases: &[Arc<BasePath>]) -> ScanSummary {
        let mut total = ScanSummary::default();
        for base in bases {
            let summary = self.scan_base(base).await;
            total.scanned += summary.scanned;
            total.skipped += summary.skipped;
            total.added += summary.added;
            total.moved += summary.moved;
            total.removed += summary.removed;
            total.duration_ms += summary.duration_ms;
        }
        total
    }

    pub async fn scan_base(&self, base: &BasePath) -> ScanSummary {
        let started = Instant::now();
        let scan_start = chrono::Utc::now().timestamp_millis();

        // A root that cannot be stat'ed yields empty counts and, crucially,
        // no stale sweep.
        if fs::metadata(&base.real).await.is_err() {
            warn!(base = %base.path.display(), "scan root not accessible");
            return ScanSummary::default();
        }

        let base_key = base.path.to_string_lossy().into_owned();
        let queue: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        queue.lock().await.push_back(String::new());
        let pending = Arc::new(AtomicUsize::new(1));
        let tally = Arc::new(Tally::default());

        let mut workers = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let index = Arc::clone(&self.index);
            let queue = Arc::clone(&queue);
            let pending = Arc::clone(&pending);
            let tally = Arc::clone(&tally);
            let base_key = base_key.clone();
            let root = base.real.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    match next {
                        Some(rel) => {
                            if let Err(e) = scan_dir(
                                &index, &base_key, &root, &rel, scan_start, &queue, &pending,
                                &tally,
                            )
                            .await
                            {
                                debug!(dir = %rel, "scan skipped directory: {e}");
                            }
                            pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => {
                            if pending.load(Ordering::SeqCst) == 0 {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    }
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        let removed = match self.index.remove_stale_entries(&base_key, scan_start).await {
            Ok(n) => n,
            Err(e) => {
                warn!(base = %base_key, "stale sweep failed: {e}");
                0
            }
        };

        let summary = ScanSummary {
            scanned: tally.scanned.load(Ordering::SeqCst),
            skipped: tally.skipped.load(Ordering::SeqCst),
            added: tally.added.load(Ordering::SeqCst),
            moved: tally.moved.load(Ordering::SeqCst),
            removed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            base = %base_key,
            scanned = summary.scanned,
            skipped = summary.skipped,
            added = summary.added,
            moved = summary.moved,
            removed = summary.removed,
            duration_ms = summary.duration_ms,
            "scan complete"
        );
        summary
    }
}

#[allow(clippy::too_many_arguments)]
async fn scan_dir(
    index: &IndexStore,
    base_key: &str,
    root: &std::path::Path,
    rel: &str,
    scan_start: i64,
    queue: &Mutex<VecDeque<String>>,
    pending: &AtomicUsize,
    tally: &Tally,
) -> anyhow::Result<()> {
    let abs = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let dir_meta = fs::metadata(&abs).await?;
    let dir_mtime = crate::index::store::mtime_millis(&dir_meta);
    tally.scanned.fetch_add(1, Ordering::SeqCst);

    if index.get_scan_state(base_key, rel).await? == Some(dir_mtime) {
        tally.skipped.fetch_add(1, Ordering::SeqCst);
        index
            .touch_indexed_at_under_dir(base_key, rel, scan_start)
            .await?;
        index
            .upsert_scan_state(base_key, rel, dir_mtime, chrono::Utc::now().timestamp_millis())
            .await?;
        return Ok(());
    }

    let mut entries = fs::read_dir(&abs).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        // Entry stat failures are skipped silently; the stale sweep picks
        // up whatever vanished mid-scan.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        let stat = EntryStat::from_metadata(&meta);
        match index.index_file(base_key, &child_rel, &stat, scan_start).await {
            Ok(outcome) => match outcome.action {
                IndexAction::Added => {
                    tally.added.fetch_add(1, Ordering::SeqCst);
                }
                IndexAction::Moved => {
                    tally.moved.fetch_add(1, Ordering::SeqCst);
                }
                IndexAction::Existing => {}
            },
            Err(e) => debug!(path = %child_rel, "index update failed: {e}"),
        }
        if meta.is_dir() {
            pending.fetch_add(1, Ordering::SeqCst);
            queue.lock().await.push_back(child_rel);
        }
    }

    index
        .upsert_scan_state(base_key, rel, dir_mtime, chrono::Utc::now().timestamp_millis())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, Arc<BasePath>, Scanner) {
        let dir = TempDir::new().unwrap();
        let base = Arc::new(BasePath {
            path: dir.path().to_path_buf(),
            real: dir.path().canonicalize().unwrap(),
        });
        let store = Arc::new(IndexStore::connect("sqlite::memory:").await.unwrap());
        let scanner = Scanner::new(store, 4);
        (dir, base, scanner)
    }

    fn base_key(base: &BasePath) -> String {
        base.path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn populates_index_from_disk() {
        let (dir, base, scanner) = fixture().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"t").unwrap();

        let summary = scanner.scan_base(&base).await;
        assert_eq!(summary.added, 3);
        assert_eq!(summary.moved, 0);
        assert_eq!(summary.removed, 0);

        let key = base_key(&base);
        assert!(scanner.index.identify_path(&key, "sub/a.txt").await.unwrap().is_some());
        assert!(scanner.index.identify_path(&key, "top.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unchanged_rescan_skips_everything() {
        let (dir, base, scanner) = fixture().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"a").unwrap();

        let first = scanner.scan_base(&base).await;
        assert_eq!(first.added, 2);

        let second = scanner.scan_base(&base).await;
        assert_eq!(second.added, 0);
        assert_eq!(second.removed, 0);
        // The unchanged root is skipped outright, so the subtree is never
        // even visited.
        assert_eq!(second.skipped, 1);
        assert_eq!(second.scanned, 1);
    }

    #[tokio::test]
    async fn rename_is_detected_as_move_preserving_id() {
        let (dir, base, scanner) = fixture().await;
        std::fs::write(dir.path().join("old.txt"), b"data").unwrap();

        scanner.scan_base(&base).await;
        let key = base_key(&base);
        let id = scanner.index.identify_path(&key, "old.txt").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::rename(dir.path().join("old.txt"), dir.path().join("new.txt")).unwrap();

        let summary = scanner.scan_base(&base).await;
        assert!(summary.moved >= 1);
        assert_eq!(
            scanner.index.identify_path(&key, "new.txt").await.unwrap(),
            Some(id)
        );
        assert_eq!(scanner.index.identify_path(&key, "old.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleted_entries_are_swept() {
        let (dir, base, scanner) = fixture().await;
        std::fs::write(dir.path().join("doomed.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("keeper.txt"), b"x").unwrap();

        scanner.scan_base(&base).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::remove_file(dir.path().join("doomed.txt")).unwrap();

        let summary = scanner.scan_base(&base).await;
        assert_eq!(summary.removed, 1);
        let key = base_key(&base);
        assert!(scanner.index.identify_path(&key, "doomed.txt").await.unwrap().is_none());
        assert!(scanner.index.identify_path(&key, "keeper.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_root_yields_empty_counts() {
        let (dir, base, scanner) = fixture().await;
        drop(dir);
        let summary = scanner.scan_base(&base).await;
        assert_eq!(summary.scanned, 0);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.removed, 0);
    }
}
